//! Per-player, per-channel gate deciding whether a state change is worth
//! sending now.
//!
//! Movement is sampled far more often than it needs to be transmitted. The
//! throttle keeps, for every (player, channel) pair, the last value that was
//! emitted and when. A new value is emitted only when the channel's minimum
//! interval has elapsed AND the value moved past the channel's change
//! threshold. The first value seen for a pair is always emitted.
//!
//! Channels never share state, so a burst of position samples cannot starve
//! a stats change and vice versa.

use crate::protocol::{Location, Position, Stats};
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Position,
    Stats,
    Location,
}

/// A candidate value on one channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChannelValue {
    Position(Position),
    Stats(Stats),
    Location(Location),
}

impl ChannelValue {
    pub fn channel(&self) -> Channel {
        match self {
            ChannelValue::Position(_) => Channel::Position,
            ChannelValue::Stats(_) => Channel::Stats,
            ChannelValue::Location(_) => Channel::Location,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelPolicy {
    pub min_interval: Duration,
    /// Only used by the position channel
    pub min_distance: f32,
}

impl ChannelPolicy {
    pub fn new(min_interval: Duration, min_distance: f32) -> Self {
        Self {
            min_interval,
            min_distance,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThrottleConfig {
    pub position: ChannelPolicy,
    pub stats: ChannelPolicy,
    pub location: ChannelPolicy,
}

impl ThrottleConfig {
    /// Server-side variant with every interval halved, so scheduling jitter
    /// between a client's emission and its arrival does not drop updates the
    /// client already throttled.
    pub fn server() -> Self {
        let client = Self::default();
        Self {
            position: ChannelPolicy::new(client.position.min_interval / 2, client.position.min_distance),
            stats: ChannelPolicy::new(client.stats.min_interval / 2, 0.0),
            location: ChannelPolicy::new(client.location.min_interval / 2, 0.0),
        }
    }

    pub fn policy(&self, channel: Channel) -> &ChannelPolicy {
        match channel {
            Channel::Position => &self.position,
            Channel::Stats => &self.stats,
            Channel::Location => &self.location,
        }
    }
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            position: ChannelPolicy::new(Duration::from_millis(100), 1.0),
            stats: ChannelPolicy::new(Duration::from_millis(250), 0.0),
            location: ChannelPolicy::new(Duration::from_millis(250), 0.0),
        }
    }
}

/// Last emitted value on a channel and when it went out.
#[derive(Debug, Clone, Copy)]
struct SyncState {
    value: ChannelValue,
    emitted_at: Instant,
}

#[derive(Debug)]
pub struct UpdateThrottle {
    config: ThrottleConfig,
    state: HashMap<(String, Channel), SyncState>,
}

impl UpdateThrottle {
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            config,
            state: HashMap::new(),
        }
    }

    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    pub fn should_emit(&mut self, player_id: &str, value: ChannelValue) -> bool {
        self.should_emit_at(player_id, value, Instant::now())
    }

    /// Decides whether `value` should go out at `now`, recording it if so.
    pub fn should_emit_at(&mut self, player_id: &str, value: ChannelValue, now: Instant) -> bool {
        if let ChannelValue::Position(position) = value {
            if !position.is_finite() {
                return false;
            }
        }

        let channel = value.channel();
        let key = (player_id.to_string(), channel);

        let Some(last) = self.state.get(&key) else {
            self.state.insert(
                key,
                SyncState {
                    value,
                    emitted_at: now,
                },
            );
            return true;
        };

        let policy = self.config.policy(channel);
        let elapsed = now.saturating_duration_since(last.emitted_at);
        if elapsed < policy.min_interval || !Self::changed(policy, &last.value, &value) {
            return false;
        }

        self.state.insert(
            key,
            SyncState {
                value,
                emitted_at: now,
            },
        );
        true
    }

    fn changed(policy: &ChannelPolicy, last: &ChannelValue, next: &ChannelValue) -> bool {
        match (last, next) {
            (ChannelValue::Position(a), ChannelValue::Position(b)) => {
                a.distance(b) > policy.min_distance
            }
            (a, b) => a != b,
        }
    }

    /// Drops every channel's state for a player who left.
    pub fn forget(&mut self, player_id: &str) {
        self.state.retain(|(id, _), _| id != player_id);
    }

    pub fn tracked(&self, player_id: &str, channel: Channel) -> bool {
        self.state.contains_key(&(player_id.to_string(), channel))
    }
}

impl Default for UpdateThrottle {
    fn default() -> Self {
        Self::new(ThrottleConfig::default())
    }
}
