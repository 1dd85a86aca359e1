use clap::Parser;
use log::info;
use server::{Server, ServerConfig};
use shared::{PhaseConfig, ThrottleConfig, DEFAULT_PORT};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to bind to
    #[arg(short = 'H', long, default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Players needed before the game starts
    #[arg(long, default_value = "2")]
    start_threshold: usize,

    /// A running game ends when fewer players than this remain
    #[arg(long, default_value = "2")]
    continuation_threshold: usize,

    /// Grace period between Starting and Running, in milliseconds
    #[arg(long, default_value = "3000")]
    start_grace_ms: u64,

    /// Evict players silent for longer than this, in milliseconds
    #[arg(long, default_value = "15000")]
    stale_timeout_ms: u64,

    /// How often to look for stale players, in milliseconds
    #[arg(long, default_value = "1000", value_parser = clap::value_parser!(u64).range(1..))]
    sweep_interval_ms: u64,

    /// Minimum gap between full-state pushes, in milliseconds
    #[arg(long, default_value = "5000")]
    broadcast_interval_ms: u64,

    #[arg(long, default_value = "32")]
    max_connections: usize,

    /// Per-connection outbound queue capacity
    #[arg(long, default_value = "256")]
    outbound_queue: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let config = ServerConfig {
        bind_addr: format!("{}:{}", args.host, args.port),
        phase: PhaseConfig {
            start_threshold: args.start_threshold,
            continuation_threshold: args.continuation_threshold,
            start_grace: Duration::from_millis(args.start_grace_ms),
        },
        throttle: ThrottleConfig::server(),
        stale_timeout: Duration::from_millis(args.stale_timeout_ms),
        sweep_interval: Duration::from_millis(args.sweep_interval_ms),
        broadcast_interval: Duration::from_millis(args.broadcast_interval_ms),
        max_connections: args.max_connections,
        outbound_queue: args.outbound_queue,
    };

    info!(
        "Starting server (start at {} players, continue while {} remain)",
        config.phase.start_threshold, config.phase.continuation_threshold
    );

    let server = Server::bind(config).await?;

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_parse() {
        let args = Args::try_parse_from(["server"]).unwrap();
        assert_eq!(args.port, DEFAULT_PORT);
        assert_eq!(args.sweep_interval_ms, 1000);
    }

    #[test]
    fn test_zero_sweep_interval_is_rejected() {
        assert!(Args::try_parse_from(["server", "--sweep-interval-ms", "0"]).is_err());
        assert!(Args::try_parse_from(["server", "--sweep-interval-ms", "1"]).is_ok());
    }
}
