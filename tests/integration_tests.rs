//! Integration tests for the session layer
//!
//! These tests run a real hub on a loopback port and drive it with real client
//! sessions or raw framed streams.

use client::{ClientSession, LocalIdentity};
use server::{Hub, Server, ServerConfig};
use shared::codec::{decode, read_frame, write_frame};
use shared::{
    Location, Message, MessageKind, Phase, PhaseConfig, Position, Stats, UpdateThrottle,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

fn phase_config() -> PhaseConfig {
    PhaseConfig {
        start_threshold: 2,
        continuation_threshold: 2,
        start_grace: Duration::from_millis(100),
    }
}

fn test_config() -> ServerConfig {
    ServerConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        phase: phase_config(),
        ..ServerConfig::default()
    }
}

async fn start_server(config: ServerConfig) -> (String, Arc<Hub>) {
    let server = Server::bind(config).await.unwrap();
    let addr = server.local_addr().unwrap().to_string();
    let hub = server.hub();
    tokio::spawn(server.run());
    (addr, hub)
}

async fn connect(addr: &str, id: &str) -> ClientSession {
    let identity = LocalIdentity {
        id: id.to_string(),
        name: id.to_uppercase(),
        position: Position::new(0.0, 0.0),
        character_ref: format!("{}-sprite", id),
    };
    ClientSession::connect(addr, identity, UpdateThrottle::default(), phase_config())
        .await
        .unwrap()
}

/// Polls `condition` until it holds or two seconds pass.
async fn wait_until<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..200 {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    condition()
}

async fn next_message(stream: &mut TcpStream) -> Option<Message> {
    let frame = timeout(Duration::from_secs(2), read_frame(stream))
        .await
        .ok()?
        .ok()??;
    decode(&frame).ok()
}

/// SESSION FLOW TESTS
mod session_tests {
    use super::*;

    /// Two clients see the same roster, with the display ids the server assigned
    #[tokio::test]
    async fn roster_sync_and_display_ids() {
        let (addr, hub) = start_server(test_config()).await;

        let alice = connect(&addr, "alice").await;
        assert!(wait_until(|| hub.registry().len() == 1).await);
        let bob = connect(&addr, "bob").await;

        let alice_state = alice.state();
        let bob_state = bob.state();
        assert!(wait_until(|| alice_state.players().len() == 2).await);
        assert!(wait_until(|| bob_state.players().len() == 2).await);

        for state in [&alice_state, &bob_state] {
            let a = state.mirror().player("alice").unwrap();
            let b = state.mirror().player("bob").unwrap();
            assert_eq!(a.display_id, "P1");
            assert_eq!(b.display_id, "P2");
            assert_eq!(b.character_ref, "bob-sprite");
        }
        assert_eq!(bob_state.mirror().turn_order(), vec!["alice", "bob"]);
    }

    /// The first joiner holds the first turn and completing it passes it on
    #[tokio::test]
    async fn turn_passes_between_clients() {
        let (addr, hub) = start_server(test_config()).await;

        let alice = connect(&addr, "alice").await;
        assert!(wait_until(|| alice.is_my_turn()).await);
        let bob = connect(&addr, "bob").await;

        let bob_state = bob.state();
        assert!(wait_until(|| bob_state.turn_holder().as_deref() == Some("alice")).await);
        assert!(!bob.is_my_turn());
        assert!(!bob.complete_turn().await.unwrap());

        assert!(alice.complete_turn().await.unwrap());
        assert!(wait_until(|| bob.is_my_turn()).await);
        assert!(wait_until(|| !alice.is_my_turn()).await);
        assert_eq!(hub.registry().turn_holder().as_deref(), Some("bob"));
    }

    /// Movement, stats and location changes reach the other client
    #[tokio::test]
    async fn state_changes_are_relayed() {
        let (addr, hub) = start_server(test_config()).await;

        let alice = connect(&addr, "alice").await;
        assert!(wait_until(|| hub.registry().len() == 1).await);
        let bob = connect(&addr, "bob").await;
        let bob_state = bob.state();
        let alice_state = alice.state();
        assert!(wait_until(|| alice_state.players().len() == 2).await);

        assert!(alice.send_position(Position::new(40.0, 30.0)).await.unwrap());
        assert!(alice.send_stats(Stats::new(250, 80, 60)).await.unwrap());
        assert!(bob.send_location(Location::Bank).await.unwrap());

        assert!(
            wait_until(|| bob_state
                .mirror()
                .player("alice")
                .map(|p| p.position == Position::new(40.0, 30.0) && p.stats == Stats::new(250, 80, 60))
                .unwrap_or(false))
            .await
        );
        assert!(
            wait_until(|| alice_state
                .mirror()
                .player("bob")
                .map(|p| p.location == Location::Bank)
                .unwrap_or(false))
            .await
        );

        let on_server = hub.registry().player("alice").unwrap();
        assert_eq!(on_server.position, Position::new(40.0, 30.0));
        // Local prediction is visible immediately
        assert_eq!(bob_state.local_record().unwrap().location, Location::Bank);
    }

    /// A departing turn holder hands the turn on and the game ends below the continuation threshold
    #[tokio::test]
    async fn holder_leave_propagates() {
        let (addr, hub) = start_server(test_config()).await;

        let alice = connect(&addr, "alice").await;
        assert!(wait_until(|| hub.registry().len() == 1).await);
        let bob = connect(&addr, "bob").await;
        assert!(wait_until(|| hub.registry().phase() == Phase::Running).await);

        assert!(wait_until(|| alice.is_my_turn()).await);
        assert!(alice.complete_turn().await.unwrap());
        assert!(wait_until(|| bob.is_my_turn()).await);

        bob.leave().await.unwrap();

        let alice_state = alice.state();
        assert!(wait_until(|| alice_state.players().len() == 1).await);
        assert!(wait_until(|| alice.is_my_turn()).await);
        assert!(wait_until(|| hub.registry().phase() == Phase::Ended).await);
        assert!(wait_until(|| hub.connection_count() == 1).await);
    }

    /// Dropping a session without Leave still removes the player
    #[tokio::test]
    async fn abrupt_disconnect_is_a_leave() {
        let (addr, hub) = start_server(test_config()).await;

        let alice = connect(&addr, "alice").await;
        assert!(wait_until(|| hub.registry().len() == 1).await);
        let mut raw = TcpStream::connect(&addr).await.unwrap();
        write_frame(
            &mut raw,
            &Message::join_request("zed", "Zed", Position::default(), "x"),
        )
        .await
        .unwrap();
        assert!(wait_until(|| hub.registry().len() == 2).await);

        drop(raw);

        let alice_state = alice.state();
        assert!(wait_until(|| !hub.registry().contains("zed")).await);
        assert!(wait_until(|| alice_state.mirror().player("zed").is_none()).await);
    }
}

/// WIRE ROBUSTNESS TESTS
mod wire_tests {
    use super::*;

    /// An undecodable frame is dropped and the stream stays usable
    #[tokio::test]
    async fn malformed_frame_is_dropped() {
        let (addr, hub) = start_server(test_config()).await;
        let mut raw = TcpStream::connect(&addr).await.unwrap();

        raw.write_all(&[0, 0, 0, 3, 0xff, 0xff, 0xff]).await.unwrap();
        write_frame(
            &mut raw,
            &Message::join_request("raw", "Raw", Position::default(), "x"),
        )
        .await
        .unwrap();

        let first = next_message(&mut raw).await.unwrap();
        assert_eq!(first.kind, MessageKind::Join);
        assert_eq!(first.record().unwrap().display_id, "P1");
        assert!(hub.registry().contains("raw"));
    }

    /// An oversized length prefix faults the connection
    #[tokio::test]
    async fn oversized_frame_closes_connection() {
        let (addr, hub) = start_server(test_config()).await;
        let mut raw = TcpStream::connect(&addr).await.unwrap();
        assert!(wait_until(|| hub.connection_count() == 1).await);

        raw.write_all(&(1_000_000u32).to_be_bytes()).await.unwrap();

        let closed = timeout(Duration::from_secs(2), read_frame(&mut raw))
            .await
            .unwrap();
        assert!(matches!(closed, Ok(None) | Err(_)));
        assert!(wait_until(|| hub.connection_count() == 0).await);
    }

    /// Connections past the limit are refused
    #[tokio::test]
    async fn connection_limit_is_enforced() {
        let config = ServerConfig {
            max_connections: 1,
            ..test_config()
        };
        let (addr, hub) = start_server(config).await;

        let _first = TcpStream::connect(&addr).await.unwrap();
        assert!(wait_until(|| hub.connection_count() == 1).await);
        let mut second = TcpStream::connect(&addr).await.unwrap();

        let refused = timeout(Duration::from_secs(2), read_frame(&mut second))
            .await
            .unwrap();
        assert!(matches!(refused, Ok(None) | Err(_)));
        assert_eq!(hub.connection_count(), 1);
    }
}

/// BACKGROUND TASK TESTS
mod sweeper_tests {
    use super::*;

    /// A silent player is evicted while a heartbeating one survives
    #[tokio::test]
    async fn stale_players_are_evicted() {
        let config = ServerConfig {
            stale_timeout: Duration::from_millis(300),
            sweep_interval: Duration::from_millis(50),
            ..test_config()
        };
        let (addr, hub) = start_server(config).await;

        let alice = connect(&addr, "alice").await;
        let mut silent = TcpStream::connect(&addr).await.unwrap();
        write_frame(
            &mut silent,
            &Message::join_request("silent", "Silent", Position::default(), "x"),
        )
        .await
        .unwrap();
        assert!(wait_until(|| hub.registry().len() == 2).await);

        for _ in 0..8 {
            alice.heartbeat().await.unwrap();
            sleep(Duration::from_millis(100)).await;
        }

        assert!(!hub.registry().contains("silent"));
        assert!(hub.registry().contains("alice"));
        let alice_state = alice.state();
        assert!(wait_until(|| alice_state.mirror().player("silent").is_none()).await);
    }

    /// Full records are pushed periodically
    #[tokio::test]
    async fn full_state_is_pushed() {
        let config = ServerConfig {
            sweep_interval: Duration::from_millis(50),
            broadcast_interval: Duration::from_millis(100),
            ..test_config()
        };
        let (addr, _hub) = start_server(config).await;
        let mut raw = TcpStream::connect(&addr).await.unwrap();
        write_frame(
            &mut raw,
            &Message::join_request("raw", "Raw", Position::new(3.0, 4.0), "x"),
        )
        .await
        .unwrap();

        let mut saw_update = false;
        for _ in 0..10 {
            let Some(message) = next_message(&mut raw).await else {
                break;
            };
            if message.kind == MessageKind::Update {
                let record = message.record().unwrap();
                assert_eq!(record.id, "raw");
                assert_eq!(record.position, Position::new(3.0, 4.0));
                saw_update = true;
                break;
            }
        }
        assert!(saw_update);
    }
}
