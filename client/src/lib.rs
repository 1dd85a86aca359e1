//! # Session Client Library
//!
//! Client side of the multiplayer session layer. A [`network::ClientSession`]
//! connects to the hub, sends the initial Join, and keeps a local mirror of
//! the server's registry up to date from the broadcasts it receives.
//!
//! ## Architecture Overview
//!
//! ### Local Mirror
//! [`game::ClientGameState`] wraps a [`shared::Registry`] owned by this client.
//! Remote players change only when the server says so. The local player's own
//! record is also updated immediately on every local change, so the rendering
//! layer sees its own movement without waiting for a round trip.
//!
//! ### Throttled Outbound
//! Movement, stats and location changes all pass through a
//! [`shared::UpdateThrottle`] before they are queued. Every outbound message,
//! throttled or not, is written by one writer task so frames never interleave.
//!
//! ### Turn Gating
//! The "is it my turn" flag follows inbound TurnChange messages only. A local
//! override of the mirror's turn pointer lasts until the next authoritative
//! announcement.
//!
//! ## Module Organization
//!
//! ### Game Module (`game`)
//! The local mirror and the turn flag.
//!
//! ### Network Module (`network`)
//! Connection, reader and writer tasks, throttled send operations.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::network::{ClientSession, LocalIdentity};
//! use shared::{PhaseConfig, Position, UpdateThrottle};
//!
//! # async fn run() -> Result<(), client::network::SessionError> {
//! let identity = LocalIdentity {
//!     id: "alice".to_string(),
//!     name: "Alice".to_string(),
//!     position: Position::new(0.0, 0.0),
//!     character_ref: "chef".to_string(),
//! };
//! let session = ClientSession::connect(
//!     "127.0.0.1:5555",
//!     identity,
//!     UpdateThrottle::default(),
//!     PhaseConfig::default(),
//! )
//! .await?;
//!
//! session.send_position(Position::new(12.0, 4.0)).await?;
//! if session.is_my_turn() {
//!     session.complete_turn().await?;
//! }
//! session.leave().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Disconnection
//!
//! Reconnection is not attempted. Once the stream faults the session reports
//! disconnected and the caller decides whether to carry on without it.

pub mod game;
pub mod network;

pub use game::ClientGameState;
pub use network::{ClientSession, LocalIdentity, SessionError};
