//! tokio/WebSocket driver for a [`ClientSession`].
//!
//! [`connect`] performs the relay handshake and then moves the session, its
//! scene and the socket into one actor task. Every [`SessionHandle`] call is a
//! command on that task's queue, so operations run strictly in submission
//! order and never before the session has an id.

use std::collections::HashMap;
use std::time::Instant;

use fastsync_core::{SessionId, SyncId};
use fastsync_wire::{IdData, StealOptions, SyncConfig};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{self, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::error::{ClientError, SessionError};
use crate::scene::Scene;
use crate::session::{ClientSession, Outbound, SessionEvent, StealStatus};
use crate::ClientConfig;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type SceneFn<S> = Box<dyn FnOnce(&mut S, &ClientSession<S>) + Send>;

/// Capacity of the event broadcast channel; slow subscribers lag.
const EVENT_CAPACITY: usize = 256;

enum Command<S: Scene> {
    Register {
        handle: S::Handle,
        config: SyncConfig,
        reply: oneshot::Sender<Result<SyncId, SessionError>>,
    },
    Announce {
        sync_id: SyncId,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Remove {
        sync_id: SyncId,
        reply: oneshot::Sender<Result<S::Handle, SessionError>>,
    },
    SyncHtml {
        sync_id: SyncId,
        html: String,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Steal {
        id_data: IdData,
        options: StealOptions,
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
    WithScene(SceneFn<S>),
    Close,
}

/// Connect to a relay, join `room`, and start the session task.
///
/// Resolves once the relay has assigned a session id. Connection and
/// handshake failures are returned here.
pub async fn connect<S>(
    url: &str,
    room: impl Into<String>,
    mut scene: S,
    config: ClientConfig,
) -> Result<SessionHandle<S>, ClientError>
where
    S: Scene + Send + 'static,
    S::Handle: Send + 'static,
{
    let (ws, _) = connect_async(url).await?;
    let (mut sink, mut source) = ws.split();
    let mut session = ClientSession::new(room, config);

    let session_id = loop {
        match source.next().await {
            Some(Ok(Message::Text(text))) => {
                session.handle_text(&mut scene, &text, Instant::now())?;
                if let Some(id) = session.session_id() {
                    break id;
                }
            }
            Some(Ok(Message::Close(_))) | None => return Err(ClientError::HandshakeFailed),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        }
    };
    for frame in session.drain_outgoing() {
        sink.send(to_message(frame)).await?;
    }
    tracing::info!(session = session_id, room = session.room(), "connected");

    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
    let actor = Actor {
        config,
        session,
        scene,
        sink,
        source,
        commands: commands_rx,
        events: events_tx.clone(),
        steal_waiters: HashMap::new(),
    };
    tokio::spawn(actor.run());

    Ok(SessionHandle {
        session_id,
        commands: commands_tx,
        events: events_tx,
    })
}

fn to_message(frame: Outbound) -> Message {
    match frame {
        Outbound::Text(text) => Message::Text(text),
        Outbound::Binary(bytes) => Message::Binary(bytes),
    }
}

// ============================================================================
// Handle
// ============================================================================

/// Cloneable handle to a running session.
pub struct SessionHandle<S: Scene> {
    session_id: SessionId,
    commands: mpsc::UnboundedSender<Command<S>>,
    events: broadcast::Sender<SessionEvent>,
}

impl<S: Scene> Clone for SessionHandle<S> {
    fn clone(&self) -> Self {
        Self {
            session_id: self.session_id,
            commands: self.commands.clone(),
            events: self.events.clone(),
        }
    }
}

impl<S: Scene> SessionHandle<S> {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Receive session events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Register a scene object and announce it to the room.
    pub async fn register(&self, handle: S::Handle, config: SyncConfig) -> Result<SyncId, ClientError> {
        let result = self
            .request(|reply| Command::Register {
                handle,
                config,
                reply,
            })
            .await?;
        Ok(result?)
    }

    /// Re-broadcast an owned object's template.
    pub async fn announce(&self, sync_id: SyncId) -> Result<(), ClientError> {
        Ok(self.request(|reply| Command::Announce { sync_id, reply }).await??)
    }

    /// Stop syncing an owned object; returns its scene handle.
    pub async fn remove(&self, sync_id: SyncId) -> Result<S::Handle, ClientError> {
        Ok(self.request(|reply| Command::Remove { sync_id, reply }).await??)
    }

    pub async fn sync_html(&self, sync_id: SyncId, html: impl Into<String>) -> Result<(), ClientError> {
        let html = html.into();
        Ok(self
            .request(|reply| Command::SyncHtml {
                sync_id,
                html,
                reply,
            })
            .await??)
    }

    /// Take ownership of a foreign object.
    ///
    /// Resolves when the current owner has handed the object over. Concurrent
    /// calls for the same object share one request. Fails once the mirror is
    /// gone or has moved to another owner; there is no timeout otherwise.
    pub async fn steal(&self, id_data: IdData, options: StealOptions) -> Result<(), ClientError> {
        self.request(|reply| Command::Steal {
            id_data,
            options,
            reply,
        })
        .await?
    }

    /// Run `f` against the scene and session on the session task.
    pub async fn with_scene<R, F>(&self, f: F) -> Result<R, ClientError>
    where
        R: Send + 'static,
        F: FnOnce(&mut S, &ClientSession<S>) -> R + Send + 'static,
    {
        self.request(|reply| {
            Command::WithScene(Box::new(move |scene: &mut S, session: &ClientSession<S>| {
                let _ = reply.send(f(scene, session));
            }))
        })
        .await
    }

    /// Ask the session task to close the connection.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command<S>) -> Result<T, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| ClientError::Closed)?;
        rx.await.map_err(|_| ClientError::Closed)
    }
}

// ============================================================================
// Actor
// ============================================================================

struct Actor<S: Scene> {
    config: ClientConfig,
    session: ClientSession<S>,
    scene: S,
    sink: SplitSink<Socket, Message>,
    source: SplitStream<Socket>,
    commands: mpsc::UnboundedReceiver<Command<S>>,
    events: broadcast::Sender<SessionEvent>,
    steal_waiters: HashMap<IdData, Vec<oneshot::Sender<Result<(), ClientError>>>>,
}

/// Why the session task stops.
enum Stop {
    Closed,
    Failed(String),
}

impl<S: Scene> Actor<S> {
    async fn run(mut self) {
        let mut tick = time::interval(self.config.tick_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let period = self.config.heartbeat_interval();
        let mut heartbeat = time::interval_at(time::Instant::now() + period, period);

        let stop = loop {
            let deadline = self.session.next_deadline();
            let step = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Close) | None => Err(Stop::Closed),
                    Some(command) => {
                        self.execute(command);
                        Ok(())
                    }
                },
                inbound = self.source.next() => match inbound {
                    Some(Ok(message)) => self.receive(message).await,
                    Some(Err(e)) => Err(Stop::Failed(e.to_string())),
                    None => Err(Stop::Closed),
                },
                _ = tick.tick() => {
                    self.session.tick(&self.scene);
                    Ok(())
                }
                _ = heartbeat.tick() => self
                    .session
                    .heartbeat()
                    .map_err(|e| Stop::Failed(e.to_string())),
                _ = sleep_until(deadline) => {
                    for miss in self.session.poll_deferred(&mut self.scene, Instant::now()) {
                        tracing::warn!(error = %miss, "deferred update failed");
                    }
                    Ok(())
                }
            };

            if let Err(stop) = step {
                break stop;
            }
            if let Err(e) = self.flush().await {
                break Stop::Failed(e.to_string());
            }
            self.publish_events();
        };

        let session = self.session.session_id();
        match stop {
            Stop::Closed => tracing::info!(?session, "session closed"),
            Stop::Failed(reason) => tracing::warn!(?session, %reason, "session terminated"),
        }
        let _ = self.sink.close().await;
    }

    fn execute(&mut self, command: Command<S>) {
        match command {
            Command::Register {
                handle,
                config,
                reply,
            } => {
                let result = match self.session.register(handle, config) {
                    Ok(sync_id) => self
                        .session
                        .announce(&self.scene, sync_id)
                        .map(|()| sync_id),
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Command::Announce { sync_id, reply } => {
                let _ = reply.send(self.session.announce(&self.scene, sync_id));
            }
            Command::Remove { sync_id, reply } => {
                let _ = reply.send(self.session.remove(sync_id));
            }
            Command::SyncHtml {
                sync_id,
                html,
                reply,
            } => {
                let _ = reply.send(self.session.sync_html(sync_id, html));
            }
            Command::Steal {
                id_data,
                options,
                reply,
            } => match self.session.steal(id_data, options) {
                Ok(StealStatus::AlreadyOwned) => {
                    let _ = reply.send(Ok(()));
                }
                Ok(StealStatus::Requested | StealStatus::Pending) => {
                    self.steal_waiters.entry(id_data).or_default().push(reply);
                }
                Err(e) => {
                    let _ = reply.send(Err(e.into()));
                }
            },
            Command::WithScene(f) => f(&mut self.scene, &self.session),
            Command::Close => {}
        }
    }

    async fn receive(&mut self, message: Message) -> Result<(), Stop> {
        match message {
            Message::Text(text) => {
                if let Err(e) = self.session.handle_text(&mut self.scene, &text, Instant::now()) {
                    tracing::warn!(error = %e, "dropped control message");
                }
            }
            Message::Binary(bytes) => {
                if let Err(e) = self.session.handle_binary(&mut self.scene, &bytes) {
                    tracing::warn!(error = %e, "dropped transform frame");
                }
            }
            Message::Ping(data) => {
                self.sink
                    .send(Message::Pong(data))
                    .await
                    .map_err(|e| Stop::Failed(e.to_string()))?;
            }
            Message::Close(_) => return Err(Stop::Closed),
            Message::Pong(_) | Message::Frame(_) => {}
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), tokio_tungstenite::tungstenite::Error> {
        for frame in self.session.drain_outgoing() {
            self.sink.send(to_message(frame)).await?;
        }
        Ok(())
    }

    fn publish_events(&mut self) {
        for event in self.session.drain_events() {
            match &event {
                SessionEvent::StealCompleted { id_data } => {
                    for waiter in self.steal_waiters.remove(id_data).unwrap_or_default() {
                        let _ = waiter.send(Ok(()));
                    }
                }
                SessionEvent::StealFailed { id_data } => {
                    for waiter in self.steal_waiters.remove(id_data).unwrap_or_default() {
                        let _ = waiter.send(Err(SessionError::UnknownForeignObject {
                            owner: id_data.original_creator,
                            sync_id: id_data.sync_id,
                        }
                        .into()));
                    }
                }
                _ => {}
            }
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}
