//! Lockstep coordinator server binary.

use std::net::SocketAddr;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use lockstep::network::server::{GameServer, ServerConfig};
use lockstep::{TICK_RATE, VERSION};

/// Lockstep multiplayer game coordinator.
#[derive(Debug, Parser)]
#[command(name = "lockstep-server", version = VERSION)]
struct Args {
    /// Bind host.
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Bind port.
    #[arg(long, default_value_t = 8765)]
    port: u16,

    /// Room capacity.
    #[arg(long, default_value_t = 4)]
    max_players: usize,

    /// Logical ticks per second.
    #[arg(long, default_value_t = TICK_RATE)]
    tick_rate: u32,

    /// Seconds a tick may starve before a forced commit.
    #[arg(long, default_value_t = 1.0)]
    frame_timeout: f64,

    /// Per-connection message rate limit.
    #[arg(long, default_value_t = 100)]
    max_requests_per_second: u32,

    /// Largest accepted input blob, in bytes.
    #[arg(long, default_value_t = 16)]
    max_input_size: usize,
}

#[tokio::main]
async fn main() -> ExitCode {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("failed to initialize logging");
        return ExitCode::FAILURE;
    }

    let args = Args::parse();

    // LOCKSTEP_BIND overrides host/port; optional.
    let bind = std::env::var("LOCKSTEP_BIND")
        .unwrap_or_else(|_| format!("{}:{}", args.host, args.port));
    let bind_addr: SocketAddr = match bind.parse() {
        Ok(addr) => addr,
        Err(error) => {
            error!(%error, %bind, "invalid bind address");
            return ExitCode::FAILURE;
        }
    };

    let config = ServerConfig {
        bind_addr,
        max_players: args.max_players,
        tick_rate: args.tick_rate,
        frame_timeout: Duration::from_secs_f64(args.frame_timeout),
        max_requests_per_second: args.max_requests_per_second,
        max_input_size: args.max_input_size,
        ..ServerConfig::default()
    };

    info!("lockstep server v{VERSION}");
    info!(
        tick_rate = config.tick_rate,
        max_players = config.max_players,
        "starting on {bind_addr}"
    );

    let server = GameServer::new(config);
    match server.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(%error, "server failed");
            ExitCode::FAILURE
        }
    }
}
