//! Reaper server binary.
//!
//! # Usage
//!
//! ```bash
//! # Proactor mode, level-triggered listener and connections
//! reaper-server --bind 0.0.0.0:9006
//!
//! # Reactor mode, edge-triggered everywhere, 16 workers
//! reaper-server --actor-model 1 --trig-mode 3 --threads 16
//! ```

use std::time::Duration;

use clap::Parser;
use reaper_core::{DispatchMode, PoolConfig};
use reaper_server::{MAX_CONNECTIONS, Server, ServerConfig, TIMESLOT, TriggerConfig};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Event-driven connection server with idle eviction
#[derive(Parser, Debug)]
#[command(name = "reaper-server")]
#[command(about = "Connection server with idle eviction and a bounded worker pool")]
#[command(version)]
struct Args {
    /// Address to bind to
    #[arg(short, long, default_value = "0.0.0.0:9006")]
    bind: String,

    /// Worker threads
    #[arg(short, long, default_value_t = 8)]
    threads: usize,

    /// Maximum queued work items
    #[arg(long, default_value_t = 10_000)]
    max_requests: usize,

    /// I/O model: 0 = proactor, 1 = reactor
    #[arg(short, long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=1))]
    actor_model: u8,

    /// Trigger modes, listener+connection: 0 LT+LT, 1 LT+ET, 2 ET+LT, 3 ET+ET
    #[arg(
        short = 'm',
        long,
        default_value_t = 0,
        value_parser = clap::value_parser!(u8).range(0..=3)
    )]
    trig_mode: u8,

    /// Sweep interval in seconds; idle connections are evicted after three
    #[arg(long, default_value_t = TIMESLOT)]
    timeslot: u64,

    /// Maximum concurrent connections
    #[arg(long, default_value_t = MAX_CONNECTIONS)]
    max_connections: usize,

    /// Backend connection pool size
    #[arg(long, default_value_t = 8)]
    backend_connections: usize,

    /// Close connections gracefully with SO_LINGER
    #[arg(long)]
    linger: bool,

    /// Log level (off, trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let mode = if args.actor_model == 1 { DispatchMode::Reactor } else { DispatchMode::Proactor };
    let trigger = TriggerConfig::from_combined(args.trig_mode)
        .ok_or_else(|| format!("invalid trigger mode {}", args.trig_mode))?;
    let timeslot = Duration::from_secs(args.timeslot);

    let config = ServerConfig {
        bind_address: args.bind,
        pool: PoolConfig { worker_count: args.threads, max_requests: args.max_requests, mode },
        sweep_interval: timeslot,
        idle_timeout: 3 * timeslot,
        trigger,
        max_connections: args.max_connections,
        backend_connections: args.backend_connections,
        linger: args.linger,
        handle_signals: true,
    };

    let server = Server::bind(config)?;
    tracing::info!("Listening on {}", server.local_addr()?);

    server.run()?;

    Ok(())
}
