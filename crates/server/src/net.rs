//! WebSocket runtime around [`Relay`].
//!
//! One relay task owns the [`Relay`] and every timer. Each connection runs
//! its own task that forwards inbound frames to the relay as [`RelayEvent`]s
//! and drains a per-connection outbox back onto the socket.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::time::Instant;

use fastsync_core::SessionId;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, MissedTickBehavior};
use tokio_tungstenite::{accept_async, tungstenite::Message};

use crate::{Delivery, Outgoing, Relay, RelayConfig};

/// Input to the relay task.
#[derive(Debug)]
pub enum RelayEvent {
    Connected {
        outbox: mpsc::UnboundedSender<Message>,
        reply: oneshot::Sender<SessionId>,
    },
    Text {
        session: SessionId,
        text: String,
    },
    Binary {
        session: SessionId,
        payload: Vec<u8>,
    },
    Pong {
        session: SessionId,
    },
    Disconnected {
        session: SessionId,
    },
}

/// Accept connections on `listener` forever.
pub async fn serve(listener: TcpListener, config: RelayConfig) -> io::Result<()> {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    tokio::spawn(run_relay(Relay::new(config), events_rx));

    tracing::info!(addr = ?listener.local_addr().ok(), "relay listening");
    loop {
        let (stream, addr) = listener.accept().await?;
        tokio::spawn(handle_connection(stream, addr, events_tx.clone()));
    }
}

/// Relay task: the only owner of [`Relay`].
pub async fn run_relay(mut relay: Relay, mut events: mpsc::UnboundedReceiver<RelayEvent>) {
    let mut outboxes: HashMap<SessionId, mpsc::UnboundedSender<Message>> = HashMap::new();

    let mut flush = time::interval(relay.config().flush_interval());
    flush.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let period = relay.config().heartbeat_interval();
    let mut heartbeat = time::interval_at(time::Instant::now() + period, period);

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                handle_event(&mut relay, &mut outboxes, event);
            }
            _ = flush.tick() => {
                dispatch(&outboxes, relay.flush());
            }
            _ = heartbeat.tick() => {
                let sweep = relay.sweep_liveness();
                for id in &sweep.expired {
                    // Dropping the outbox ends the connection task.
                    outboxes.remove(id);
                }
                dispatch(&outboxes, sweep.deliveries);
                for id in sweep.to_ping {
                    if let Some(outbox) = outboxes.get(&id) {
                        let _ = outbox.send(Message::Ping(Vec::new()));
                    }
                }
            }
        }
    }
    tracing::debug!("relay task stopped");
}

fn handle_event(
    relay: &mut Relay,
    outboxes: &mut HashMap<SessionId, mpsc::UnboundedSender<Message>>,
    event: RelayEvent,
) {
    let now = Instant::now();
    match event {
        RelayEvent::Connected { outbox, reply } => {
            let (id, greeting) = relay.accept_session(now);
            outboxes.insert(id, outbox);
            if reply.send(id).is_err() {
                // Connection task gave up before learning its id.
                outboxes.remove(&id);
                relay.disconnect_session(id);
                return;
            }
            dispatch(outboxes, greeting);
        }
        RelayEvent::Text { session, text } => match relay.handle_text(session, &text, now) {
            Ok(deliveries) => dispatch(outboxes, deliveries),
            Err(e) => tracing::warn!(session, error = %e, "dropped control message"),
        },
        RelayEvent::Binary { session, payload } => {
            if let Err(e) = relay.handle_binary(session, &payload, now) {
                tracing::warn!(session, error = %e, "dropped transform frame");
            }
        }
        RelayEvent::Pong { session } => relay.record_pong(session, now),
        RelayEvent::Disconnected { session } => {
            outboxes.remove(&session);
            let deliveries = relay.disconnect_session(session);
            dispatch(outboxes, deliveries);
        }
    }
}

fn dispatch(outboxes: &HashMap<SessionId, mpsc::UnboundedSender<Message>>, deliveries: Vec<Delivery>) {
    for delivery in deliveries {
        let Some(outbox) = outboxes.get(&delivery.to) else {
            continue;
        };
        let message = match delivery.frame {
            Outgoing::Text(text) => Message::Text(text),
            Outgoing::Binary(bytes) => Message::Binary(bytes.to_vec()),
        };
        // A closed outbox means the connection is already tearing down.
        let _ = outbox.send(message);
    }
}

/// Connection task: bridge one WebSocket to the relay task.
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    events: mpsc::UnboundedSender<RelayEvent>,
) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            tracing::warn!(%addr, error = %e, "websocket handshake failed");
            return;
        }
    };

    let (outbox_tx, mut outbox) = mpsc::unbounded_channel();
    let (reply_tx, reply_rx) = oneshot::channel();
    if events
        .send(RelayEvent::Connected {
            outbox: outbox_tx,
            reply: reply_tx,
        })
        .is_err()
    {
        return;
    }
    let Ok(session) = reply_rx.await else {
        return;
    };
    tracing::info!(%addr, session, "connection opened");

    let (mut sink, mut source) = ws.split();
    loop {
        tokio::select! {
            inbound = source.next() => {
                let event = match inbound {
                    Some(Ok(Message::Text(text))) => RelayEvent::Text { session, text },
                    Some(Ok(Message::Binary(payload))) => RelayEvent::Binary { session, payload },
                    Some(Ok(Message::Pong(_))) => RelayEvent::Pong { session },
                    Some(Ok(Message::Ping(data))) => {
                        if sink.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                        continue;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Frame(_))) => continue,
                    Some(Err(e)) => {
                        tracing::debug!(session, error = %e, "websocket error");
                        break;
                    }
                };
                if events.send(event).is_err() {
                    break;
                }
            }
            outbound = outbox.recv() => {
                let Some(message) = outbound else { break };
                if sink.send(message).await.is_err() {
                    break;
                }
            }
        }
    }

    let _ = sink.close().await;
    let _ = events.send(RelayEvent::Disconnected { session });
    tracing::info!(%addr, session, "connection closed");
}
