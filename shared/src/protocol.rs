//! Wire messages exchanged between the server hub and client sessions.
//!
//! Every frame carries exactly one [`Message`]. The `kind` tag says which
//! payload fields are meaningful; the payload itself is a bag of optional
//! fields so the same shape works for every kind. Receivers validate the
//! fields they need through the typed accessors, which report a
//! [`ProtocolError::MissingField`] for incomplete payloads.

use crate::codec::ProtocolError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const STAT_MIN: i32 = 0;
pub const STAT_MAX: i32 = 100;

/// Current unix time in milliseconds
pub fn get_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Default)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

impl Position {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }

    pub fn distance(&self, other: &Position) -> f32 {
        let dx = other.x - self.x;
        let dy = other.y - self.y;
        (dx * dx + dy * dy).sqrt()
    }
}

/// Named places a player can be in.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Location {
    #[default]
    Home,
    Office,
    University,
    Supermarket,
    Restaurant,
    Bank,
    Hospital,
    Park,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Location::Home => "home",
            Location::Office => "office",
            Location::University => "university",
            Location::Supermarket => "supermarket",
            Location::Restaurant => "restaurant",
            Location::Bank => "bank",
            Location::Hospital => "hospital",
            Location::Park => "park",
        };
        f.write_str(name)
    }
}

/// Money, health and energy of a player.
///
/// Health and energy always stay inside `[STAT_MIN, STAT_MAX]`; use
/// [`Stats::new`] or [`Stats::clamped`] rather than building the struct by
/// hand when values come from outside.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub money: i32,
    pub health: i32,
    pub energy: i32,
}

impl Stats {
    pub fn new(money: i32, health: i32, energy: i32) -> Self {
        Self {
            money,
            health,
            energy,
        }
        .clamped()
    }

    pub fn clamped(self) -> Self {
        Self {
            money: self.money,
            health: self.health.clamp(STAT_MIN, STAT_MAX),
            energy: self.energy.clamp(STAT_MIN, STAT_MAX),
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self {
            money: 0,
            health: STAT_MAX,
            energy: STAT_MAX,
        }
    }
}

/// Canonical per-player state held by the registry.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PlayerRecord {
    pub id: String,
    pub display_id: String,
    pub name: String,
    pub position: Position,
    pub character_ref: String,
    pub stats: Stats,
    pub location: Location,
    /// Unix millis of the last state change or heartbeat
    pub last_update: u64,
}

impl PlayerRecord {
    pub fn new(
        id: impl Into<String>,
        display_id: impl Into<String>,
        name: impl Into<String>,
        position: Position,
        character_ref: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            display_id: display_id.into(),
            name: name.into(),
            position,
            character_ref: character_ref.into(),
            stats: Stats::default(),
            location: Location::default(),
            last_update: get_timestamp(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Join,
    Leave,
    Move,
    Update,
    StatsUpdate,
    LocationChange,
    TurnComplete,
    TurnChange,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct Payload {
    pub display_id: Option<String>,
    pub name: Option<String>,
    pub position: Option<Position>,
    pub character_ref: Option<String>,
    pub money: Option<i32>,
    pub health: Option<i32>,
    pub energy: Option<i32>,
    pub location: Option<Location>,
}

impl Payload {
    fn from_record(record: &PlayerRecord) -> Self {
        Self {
            display_id: Some(record.display_id.clone()),
            name: Some(record.name.clone()),
            position: Some(record.position),
            character_ref: Some(record.character_ref.clone()),
            money: Some(record.stats.money),
            health: Some(record.stats.health),
            energy: Some(record.stats.energy),
            location: Some(record.location),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Message {
    pub kind: MessageKind,
    pub player_id: String,
    pub payload: Payload,
    pub timestamp: u64,
}

impl Message {
    fn with_payload(kind: MessageKind, player_id: impl Into<String>, payload: Payload) -> Self {
        Self {
            kind,
            player_id: player_id.into(),
            payload,
            timestamp: get_timestamp(),
        }
    }

    /// Join request from a client. Only name, position and character are sent.
    pub fn join_request(
        player_id: impl Into<String>,
        name: impl Into<String>,
        position: Position,
        character_ref: impl Into<String>,
    ) -> Self {
        let payload = Payload {
            name: Some(name.into()),
            position: Some(position),
            character_ref: Some(character_ref.into()),
            ..Payload::default()
        };
        Self::with_payload(MessageKind::Join, player_id, payload)
    }

    /// Join announcement carrying the full record.
    pub fn join(record: &PlayerRecord) -> Self {
        Self::with_payload(
            MessageKind::Join,
            record.id.clone(),
            Payload::from_record(record),
        )
    }

    /// Full-record snapshot push.
    pub fn update(record: &PlayerRecord) -> Self {
        Self::with_payload(
            MessageKind::Update,
            record.id.clone(),
            Payload::from_record(record),
        )
    }

    /// Client heartbeat. Carries no state.
    pub fn heartbeat(player_id: impl Into<String>) -> Self {
        Self::with_payload(MessageKind::Update, player_id, Payload::default())
    }

    pub fn leave(player_id: impl Into<String>) -> Self {
        Self::with_payload(MessageKind::Leave, player_id, Payload::default())
    }

    pub fn moved(player_id: impl Into<String>, position: Position) -> Self {
        let payload = Payload {
            position: Some(position),
            ..Payload::default()
        };
        Self::with_payload(MessageKind::Move, player_id, payload)
    }

    pub fn stats(player_id: impl Into<String>, stats: Stats) -> Self {
        let payload = Payload {
            money: Some(stats.money),
            health: Some(stats.health),
            energy: Some(stats.energy),
            ..Payload::default()
        };
        Self::with_payload(MessageKind::StatsUpdate, player_id, payload)
    }

    pub fn location(player_id: impl Into<String>, location: Location) -> Self {
        let payload = Payload {
            location: Some(location),
            ..Payload::default()
        };
        Self::with_payload(MessageKind::LocationChange, player_id, payload)
    }

    pub fn turn_complete(player_id: impl Into<String>) -> Self {
        Self::with_payload(MessageKind::TurnComplete, player_id, Payload::default())
    }

    /// Authoritative turn announcement; `player_id` is the new turn holder.
    pub fn turn_change(holder: impl Into<String>) -> Self {
        Self::with_payload(MessageKind::TurnChange, holder, Payload::default())
    }

    /// The payload position. NaN or infinite coordinates are rejected.
    pub fn position(&self) -> Result<Position, ProtocolError> {
        let position = self
            .payload
            .position
            .ok_or(ProtocolError::MissingField("position"))?;
        if !position.is_finite() {
            return Err(ProtocolError::InvalidField("position"));
        }
        Ok(position)
    }

    pub fn stats_payload(&self) -> Result<Stats, ProtocolError> {
        let p = &self.payload;
        match (p.money, p.health, p.energy) {
            (Some(money), Some(health), Some(energy)) => Ok(Stats::new(money, health, energy)),
            (None, _, _) => Err(ProtocolError::MissingField("money")),
            (_, None, _) => Err(ProtocolError::MissingField("health")),
            (_, _, None) => Err(ProtocolError::MissingField("energy")),
        }
    }

    pub fn location_payload(&self) -> Result<Location, ProtocolError> {
        self.payload
            .location
            .ok_or(ProtocolError::MissingField("location"))
    }

    pub fn name(&self) -> Result<&str, ProtocolError> {
        self.payload
            .name
            .as_deref()
            .ok_or(ProtocolError::MissingField("name"))
    }

    /// Rebuilds a full record from a Join or Update snapshot.
    pub fn record(&self) -> Result<PlayerRecord, ProtocolError> {
        if !matches!(self.kind, MessageKind::Join | MessageKind::Update) {
            return Err(ProtocolError::UnexpectedKind(self.kind));
        }
        if self.player_id.is_empty() {
            return Err(ProtocolError::MissingField("player_id"));
        }
        let display_id = self
            .payload
            .display_id
            .clone()
            .ok_or(ProtocolError::MissingField("display_id"))?;
        let character_ref = self
            .payload
            .character_ref
            .clone()
            .ok_or(ProtocolError::MissingField("character_ref"))?;

        Ok(PlayerRecord {
            id: self.player_id.clone(),
            display_id,
            name: self.name()?.to_string(),
            position: self.position()?,
            character_ref,
            stats: self.stats_payload()?,
            location: self.location_payload()?,
            last_update: self.timestamp,
        })
    }
}
