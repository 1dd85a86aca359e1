//! # Session Core
//!
//! Types and policies shared by the server hub and client sessions of the
//! life-simulation multiplayer layer.
//!
//! - [`protocol`]: the wire message and the player data it carries
//! - [`codec`]: length-prefixed framing of messages over a byte stream
//! - [`throttle`]: per-channel gate for outbound state changes
//! - [`registry`]: roster, turn order and game phase state machine
//!
//! The server owns one authoritative [`Registry`]; each client owns a mirror
//! instance it keeps in step by applying the server's broadcasts.

pub mod codec;
pub mod protocol;
pub mod registry;
pub mod throttle;

pub use codec::{read_frame, write_frame, ProtocolError};
pub use protocol::{
    get_timestamp, Location, Message, MessageKind, Payload, PlayerRecord, Position, Stats,
};
pub use registry::{Phase, PhaseConfig, Registry};
pub use throttle::{Channel, ChannelPolicy, ChannelValue, ThrottleConfig, UpdateThrottle};

/// Port the server listens on unless configured otherwise
pub const DEFAULT_PORT: u16 = 5555;
