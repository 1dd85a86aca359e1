use clap::Parser;
use client::{ClientSession, LocalIdentity};
use log::{info, warn};
use rand::Rng;
use shared::{Location, PhaseConfig, Position, Stats, ThrottleConfig, UpdateThrottle, DEFAULT_PORT};
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value_t = format!("127.0.0.1:{}", DEFAULT_PORT))]
    server: String,

    /// Unique player id
    #[arg(short = 'i', long)]
    id: String,

    /// Display name, defaults to the id
    #[arg(short = 'n', long)]
    name: Option<String>,

    /// Visual asset reference
    #[arg(short = 'c', long, default_value = "default")]
    character: String,

    /// Heartbeat interval in milliseconds, keep below the server's stale timeout
    #[arg(long, default_value = "5000", value_parser = clap::value_parser!(u64).range(1..))]
    heartbeat_ms: u64,

    /// Movement steps taken on each of our turns
    #[arg(long, default_value = "5")]
    turn_moves: u32,

    /// Players needed before the game starts (must match the server)
    #[arg(long, default_value = "2")]
    start_threshold: usize,

    /// Players needed to keep a game running (must match the server)
    #[arg(long, default_value = "2")]
    continuation_threshold: usize,
}

const STEP_INTERVAL: Duration = Duration::from_millis(150);

/// One random-walk step from `from`
fn wander(from: Position) -> Position {
    let mut rng = rand::thread_rng();
    Position::new(
        from.x + rng.gen_range(-12.0..12.0),
        from.y + rng.gen_range(-12.0..12.0),
    )
}

fn end_of_turn_changes(current: Stats) -> (Stats, Location) {
    let mut rng = rand::thread_rng();
    let locations = [
        Location::Home,
        Location::Office,
        Location::University,
        Location::Supermarket,
        Location::Restaurant,
        Location::Bank,
        Location::Hospital,
        Location::Park,
    ];
    let stats = Stats::new(
        current.money + rng.gen_range(-20..50),
        current.health + rng.gen_range(-5..5),
        current.energy - rng.gen_range(0..10),
    );
    (stats, locations[rng.gen_range(0..locations.len())])
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let identity = LocalIdentity {
        id: args.id.clone(),
        name: args.name.clone().unwrap_or_else(|| args.id.clone()),
        position: Position::default(),
        character_ref: args.character.clone(),
    };
    let phase = PhaseConfig {
        start_threshold: args.start_threshold,
        continuation_threshold: args.continuation_threshold,
        ..PhaseConfig::default()
    };

    let session = ClientSession::connect(
        &args.server,
        identity,
        UpdateThrottle::new(ThrottleConfig::default()),
        phase,
    )
    .await?;
    let state = session.state();

    let mut heartbeat = interval(Duration::from_millis(args.heartbeat_ms));
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut step = interval(STEP_INTERVAL);
    step.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut moves_this_turn = 0;
    let mut position = Position::default();

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                session.heartbeat().await?;
                let roster: Vec<String> = state
                    .players()
                    .iter()
                    .map(|p| format!("{}:{}@{}", p.display_id, p.name, p.location))
                    .collect();
                info!(
                    "{:?}, turn: {:?}, roster: [{}]",
                    state.phase(),
                    state.turn_holder(),
                    roster.join(", ")
                );
            }

            _ = step.tick() => {
                if !session.is_connected() {
                    warn!("Lost connection to the server");
                    break;
                }
                if !session.is_my_turn() {
                    moves_this_turn = 0;
                    continue;
                }

                if moves_this_turn < args.turn_moves {
                    position = wander(position);
                    session.send_position(position).await?;
                    moves_this_turn += 1;
                } else {
                    let current = state.local_record().map(|r| r.stats).unwrap_or_default();
                    let (stats, location) = end_of_turn_changes(current);
                    session.send_stats(stats).await?;
                    session.send_location(location).await?;
                    session.complete_turn().await?;
                    moves_this_turn = 0;
                }
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, leaving");
                if let Err(e) = session.leave().await {
                    warn!("Leave failed: {}", e);
                }
                return Ok(());
            }
        }
    }

    Ok(())
}
