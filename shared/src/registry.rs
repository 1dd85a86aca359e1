//! Player registry and phase controller.
//!
//! The registry is the single authority over the roster, the turn pointer and
//! the game phase. All state sits behind one mutex; every public operation
//! takes the lock once, mutates, and releases it before returning. Cloning a
//! [`Registry`] yields another handle to the same state.
//!
//! Turn order is never stored: the roster is a `BTreeMap` keyed by player id,
//! so iterating it already yields the lexicographic order. The turn holder is
//! either `None` or a key present in that map.
//!
//! ## Phases
//!
//! ```text
//! WaitingForPlayers --(n >= start)--> Starting --(grace elapses)--> Running
//!        ^                               |                              |
//!        +-----------(n < start)---------+            (n < continuation)
//!                                                                       v
//!                                                                     Ended
//! ```
//!
//! Every transition bumps `phase_version`. The deferred Starting -> Running
//! action captures the version at schedule time and does nothing if the
//! version moved on before it fired.

use crate::protocol::{get_timestamp, Location, PlayerRecord, Position, Stats};
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    WaitingForPlayers,
    Starting,
    Running,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseConfig {
    /// Roster size that moves the session out of WaitingForPlayers
    pub start_threshold: usize,
    /// A running game ends once the roster drops below this
    pub continuation_threshold: usize,
    /// Delay between Starting and Running, to admit late joiners
    pub start_grace: Duration,
}

impl Default for PhaseConfig {
    fn default() -> Self {
        Self {
            start_threshold: 2,
            continuation_threshold: 2,
            start_grace: Duration::from_secs(3),
        }
    }
}

#[derive(Debug)]
struct RegistryState {
    config: PhaseConfig,
    players: BTreeMap<String, PlayerRecord>,
    turn_holder: Option<String>,
    phase: Phase,
    phase_version: u64,
    display_seq: u32,
    last_broadcast: Option<Instant>,
}

impl RegistryState {
    fn new(config: PhaseConfig) -> Self {
        Self {
            config,
            players: BTreeMap::new(),
            turn_holder: None,
            phase: Phase::WaitingForPlayers,
            phase_version: 0,
            display_seq: 0,
            last_broadcast: None,
        }
    }

    fn first_id(&self) -> Option<String> {
        self.players.keys().next().cloned()
    }

    /// Next id after `id` in sorted order, wrapping to the first.
    /// `id` itself does not need to be in the roster.
    fn next_after(&self, id: &str) -> Option<String> {
        self.players
            .range::<str, _>((Bound::Excluded(id), Bound::Unbounded))
            .next()
            .map(|(key, _)| key.clone())
            .or_else(|| self.first_id())
    }

    fn set_phase(&mut self, phase: Phase) {
        if self.phase == phase {
            return;
        }
        info!(
            "Phase {:?} -> {:?} ({} players)",
            self.phase,
            phase,
            self.players.len()
        );
        self.phase = phase;
        self.phase_version += 1;
    }

    /// Re-derives the phase from the roster size. Returns the version to
    /// schedule the deferred start for when the phase just became Starting.
    fn recompute_phase(&mut self) -> Option<u64> {
        let count = self.players.len();
        match self.phase {
            Phase::WaitingForPlayers if count >= self.config.start_threshold => {
                self.set_phase(Phase::Starting);
                if self.turn_holder.is_none() {
                    self.turn_holder = self.first_id();
                }
                return Some(self.phase_version);
            }
            Phase::Starting if count < self.config.start_threshold => {
                self.set_phase(Phase::WaitingForPlayers);
            }
            Phase::Running if count < self.config.continuation_threshold => {
                self.set_phase(Phase::Ended);
            }
            _ => {}
        }
        None
    }

    fn remove(&mut self, id: &str) -> Option<PlayerRecord> {
        let removed = self.players.remove(id)?;

        if self.turn_holder.as_deref() == Some(id) {
            self.turn_holder = self.next_after(id);
            debug!("Turn holder {} left, turn passes to {:?}", id, self.turn_holder);
        }

        info!("Removed player {} ({})", removed.display_id, id);
        self.recompute_phase();
        Some(removed)
    }
}

/// Shared handle to the roster, turn pointer and phase.
#[derive(Debug, Clone)]
pub struct Registry {
    state: Arc<Mutex<RegistryState>>,
}

impl Registry {
    pub fn new(config: PhaseConfig) -> Self {
        if config.continuation_threshold > config.start_threshold {
            warn!(
                "continuation threshold {} exceeds start threshold {}; games will end as soon as they run",
                config.continuation_threshold, config.start_threshold
            );
        }
        Self {
            state: Arc::new(Mutex::new(RegistryState::new(config))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers a player, or updates the character of one already known.
    pub fn add_player(
        &self,
        id: &str,
        name: &str,
        position: Position,
        character_ref: &str,
    ) -> PlayerRecord {
        let (record, scheduled) = {
            let mut state = self.lock();

            if let Some(existing) = state.players.get_mut(id) {
                existing.character_ref = character_ref.to_string();
                debug!("Player {} re-joined, character now {}", id, character_ref);
                return existing.clone();
            }

            state.display_seq += 1;
            let display_id = format!("P{}", state.display_seq);
            let record = PlayerRecord::new(id, display_id, name, position, character_ref);
            info!("Added player {} ({}) as {}", record.display_id, id, name);
            state.players.insert(id.to_string(), record.clone());

            (record, state.recompute_phase())
        };

        if let Some(version) = scheduled {
            self.schedule_start(version);
        }
        record
    }

    /// Upserts an authoritative snapshot, keeping its display id as-is.
    /// Used by client mirrors applying Join and Update broadcasts.
    pub fn insert_record(&self, record: PlayerRecord) {
        let scheduled = {
            let mut state = self.lock();
            state.players.insert(record.id.clone(), record);
            state.recompute_phase()
        };

        if let Some(version) = scheduled {
            self.schedule_start(version);
        }
    }

    pub fn remove_player(&self, id: &str) -> Option<PlayerRecord> {
        let removed = self.lock().remove(id);
        if removed.is_none() {
            debug!("Ignoring removal of unknown player {}", id);
        }
        removed
    }

    fn update_with<F>(&self, id: &str, what: &str, apply: F) -> bool
    where
        F: FnOnce(&mut PlayerRecord),
    {
        let mut state = self.lock();
        match state.players.get_mut(id) {
            Some(record) => {
                apply(record);
                record.last_update = get_timestamp();
                true
            }
            None => {
                debug!("Ignoring {} for unknown player {}", what, id);
                false
            }
        }
    }

    pub fn update_position(&self, id: &str, position: Position) -> bool {
        self.update_with(id, "position update", |record| record.position = position)
    }

    pub fn update_stats(&self, id: &str, stats: Stats) -> bool {
        self.update_with(id, "stats update", |record| record.stats = stats.clamped())
    }

    pub fn update_location(&self, id: &str, location: Location) -> bool {
        self.update_with(id, "location change", |record| record.location = location)
    }

    /// Refreshes liveness without touching any other field.
    pub fn touch(&self, id: &str) -> bool {
        self.update_with(id, "heartbeat", |_| {})
    }

    /// Skips the grace period. Never revives an ended session.
    pub fn start_game(&self) -> bool {
        let mut state = self.lock();
        if state.phase == Phase::Ended {
            debug!("start_game ignored, session has ended");
            return false;
        }
        if state.players.len() < state.config.start_threshold {
            debug!(
                "start_game ignored, {} of {} players",
                state.players.len(),
                state.config.start_threshold
            );
            return false;
        }

        state.set_phase(Phase::Running);
        if state.turn_holder.is_none() {
            state.turn_holder = state.first_id();
        }
        true
    }

    /// Target of the deferred Starting -> Running transition.
    pub fn complete_start(&self, version: u64) -> bool {
        let mut state = self.lock();
        if state.phase != Phase::Starting || state.phase_version != version {
            debug!(
                "Stale start timer (scheduled at v{}, now v{} {:?})",
                version, state.phase_version, state.phase
            );
            return false;
        }

        state.set_phase(Phase::Running);
        if state.turn_holder.is_none() {
            state.turn_holder = state.first_id();
        }
        true
    }

    fn schedule_start(&self, version: u64) {
        let grace = self.lock().config.start_grace;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let registry = self.clone();
                handle.spawn(async move {
                    tokio::time::sleep(grace).await;
                    registry.complete_start(version);
                });
            }
            Err(_) => {
                debug!("No runtime to schedule the start timer; waiting for start_game");
            }
        }
    }

    /// Advances the turn to the next id in sorted order, cyclically.
    pub fn next_turn(&self) -> Option<String> {
        let mut state = self.lock();
        let next = match state.turn_holder.clone() {
            Some(current) if state.players.contains_key(&current) => state.next_after(&current),
            _ => state.first_id(),
        };
        state.turn_holder = next.clone();
        next
    }

    pub fn force_set_turn(&self, id: &str) -> bool {
        let mut state = self.lock();
        if !state.players.contains_key(id) {
            debug!("Refusing to hand the turn to unknown player {}", id);
            return false;
        }
        state.turn_holder = Some(id.to_string());
        true
    }

    pub fn cleanup_stale_connections(&self, timeout: Duration) -> Vec<PlayerRecord> {
        self.cleanup_stale_connections_at(get_timestamp(), timeout)
    }

    /// Evicts every player whose last update is older than `timeout` at `now_ms`.
    pub fn cleanup_stale_connections_at(&self, now_ms: u64, timeout: Duration) -> Vec<PlayerRecord> {
        let timeout_ms = timeout.as_millis() as u64;
        let mut state = self.lock();

        let stale: Vec<String> = state
            .players
            .values()
            .filter(|record| now_ms.saturating_sub(record.last_update) > timeout_ms)
            .map(|record| record.id.clone())
            .collect();

        let mut evicted = Vec::with_capacity(stale.len());
        for id in stale {
            info!("Evicting stale player {}", id);
            if let Some(record) = state.remove(&id) {
                evicted.push(record);
            }
        }
        evicted
    }

    pub fn should_broadcast_now(&self, interval: Duration) -> bool {
        self.should_broadcast_at(Instant::now(), interval)
    }

    /// True at most once per `interval`.
    pub fn should_broadcast_at(&self, now: Instant, interval: Duration) -> bool {
        let mut state = self.lock();
        let due = match state.last_broadcast {
            Some(last) => now.saturating_duration_since(last) >= interval,
            None => true,
        };
        if due {
            state.last_broadcast = Some(now);
        }
        due
    }

    pub fn players(&self) -> Vec<PlayerRecord> {
        self.lock().players.values().cloned().collect()
    }

    pub fn player(&self, id: &str) -> Option<PlayerRecord> {
        self.lock().players.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().players.contains_key(id)
    }

    pub fn turn_order(&self) -> Vec<String> {
        self.lock().players.keys().cloned().collect()
    }

    pub fn turn_holder(&self) -> Option<String> {
        self.lock().turn_holder.clone()
    }

    pub fn phase(&self) -> Phase {
        self.lock().phase
    }

    pub fn phase_version(&self) -> u64 {
        self.lock().phase_version
    }

    pub fn config(&self) -> PhaseConfig {
        self.lock().config
    }

    pub fn len(&self) -> usize {
        self.lock().players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().players.is_empty()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(PhaseConfig::default())
    }
}
