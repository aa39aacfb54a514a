//! fastsync relay binary
//!
//! # Usage
//!
//! ```bash
//! fastsync-relay --port 3000
//! PORT=8080 fastsync-relay --host 0.0.0.0 --flush-hz 20
//! ```

use std::io;

use clap::Parser;
use tokio::net::TcpListener;

use fastsync_server::{DEFAULT_PORT, FLUSH_RATE_HZ, HEARTBEAT_INTERVAL_MS, RelayConfig, net};

/// Room relay for fastsync
#[derive(Parser, Debug)]
#[command(name = "fastsync-relay")]
#[command(about = "Relays control messages and coalesced transform frames between room members")]
struct Args {
    /// Port to listen on
    #[arg(short, long, env = "PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Host to bind to: IPv4/IPv6 literal or hostname
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Room buffer flush rate in Hz
    #[arg(long, default_value_t = FLUSH_RATE_HZ, value_parser = clap::value_parser!(u32).range(1..))]
    flush_hz: u32,

    /// Protocol ping interval in milliseconds
    #[arg(long, default_value_t = HEARTBEAT_INTERVAL_MS, value_parser = clap::value_parser!(u64).range(1..))]
    heartbeat_ms: u64,

    /// Keep room state after the last member leaves
    #[arg(long)]
    keep_empty_rooms: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("fastsync_server=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let config = RelayConfig {
        flush_rate_hz: args.flush_hz,
        heartbeat_interval_ms: args.heartbeat_ms,
        collect_empty_rooms: !args.keep_empty_rooms,
        ..RelayConfig::default()
    };

    let listener = listen(&args).await?;
    let addr = listener.local_addr()?;
    tracing::info!(%addr, flush_hz = config.flush_rate_hz, "fastsync relay starting");
    net::serve(listener, config).await?;
    Ok(())
}

async fn listen(args: &Args) -> io::Result<TcpListener> {
    TcpListener::bind((args.host.as_str(), args.port)).await
}
