use log::{debug, info, warn};
use shared::{
    Location, Message, MessageKind, Phase, PlayerRecord, Position, Registry, Stats,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

/// Local mirror of the server's registry, plus "is it my turn".
///
/// Remote players change only through inbound broadcasts. The local player's
/// own record also takes local predictions (movement, stats, location) so the
/// UI never waits for a round trip; inbound snapshots of the local player keep
/// those predicted fields and only adopt server-owned ones like the display id.
pub struct ClientGameState {
    local_id: String,
    mirror: Registry,
    my_turn: AtomicBool,
    authoritative_turn: Mutex<Option<String>>,
}

impl ClientGameState {
    pub fn new(local_id: impl Into<String>, mirror: Registry) -> Self {
        Self {
            local_id: local_id.into(),
            mirror,
            my_turn: AtomicBool::new(false),
            authoritative_turn: Mutex::new(None),
        }
    }

    fn lock_turn(&self) -> MutexGuard<'_, Option<String>> {
        self.authoritative_turn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn apply_message(&self, message: &Message) {
        match message.kind {
            MessageKind::Join | MessageKind::Update => match message.record() {
                Ok(record) => self.apply_record(message.kind, record),
                Err(e) => warn!("Dropping {:?} for {}: {}", message.kind, message.player_id, e),
            },
            MessageKind::Leave => {
                if let Some(record) = self.mirror.remove_player(&message.player_id) {
                    info!("{} ({}) left", record.name, record.display_id);
                }
            }
            MessageKind::Move => match message.position() {
                Ok(position) => {
                    self.mirror.update_position(&message.player_id, position);
                }
                Err(e) => warn!("Dropping Move for {}: {}", message.player_id, e),
            },
            MessageKind::StatsUpdate => match message.stats_payload() {
                Ok(stats) => {
                    self.mirror.update_stats(&message.player_id, stats);
                }
                Err(e) => warn!("Dropping StatsUpdate for {}: {}", message.player_id, e),
            },
            MessageKind::LocationChange => match message.location_payload() {
                Ok(location) => {
                    self.mirror.update_location(&message.player_id, location);
                }
                Err(e) => warn!("Dropping LocationChange for {}: {}", message.player_id, e),
            },
            MessageKind::TurnChange => self.apply_turn_change(&message.player_id),
            MessageKind::TurnComplete => {
                debug!("Ignoring TurnComplete relayed for {}", message.player_id);
            }
        }
    }

    fn apply_record(&self, kind: MessageKind, mut record: PlayerRecord) {
        if record.id == self.local_id {
            if let Some(local) = self.mirror.player(&self.local_id) {
                record.position = local.position;
                record.stats = local.stats;
                record.location = local.location;
            }
        }

        if kind == MessageKind::Join && !self.mirror.contains(&record.id) {
            info!("{} joined as {}", record.name, record.display_id);
        }
        self.mirror.insert_record(record);

        // A holder announced before its record arrived can be attached now
        let announced = self.lock_turn().clone();
        if let Some(holder) = announced {
            if self.mirror.turn_holder().as_deref() != Some(holder.as_str()) {
                self.mirror.force_set_turn(&holder);
            }
        }
    }

    /// Inbound TurnChange is the only source of truth for the turn.
    fn apply_turn_change(&self, holder: &str) {
        *self.lock_turn() = Some(holder.to_string());
        if !self.mirror.force_set_turn(holder) {
            debug!("Turn holder {} not in mirror yet", holder);
        }

        let mine = holder == self.local_id;
        let was_mine = self.my_turn.swap(mine, Ordering::SeqCst);
        if mine && !was_mine {
            info!("It's our turn");
        }
    }

    pub fn predict_position(&self, position: Position) {
        self.mirror.update_position(&self.local_id, position);
    }

    pub fn predict_stats(&self, stats: Stats) {
        self.mirror.update_stats(&self.local_id, stats);
    }

    pub fn predict_location(&self, location: Location) {
        self.mirror.update_location(&self.local_id, location);
    }

    pub fn is_my_turn(&self) -> bool {
        self.my_turn.load(Ordering::SeqCst)
    }

    pub fn turn_holder(&self) -> Option<String> {
        self.lock_turn().clone()
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn local_record(&self) -> Option<PlayerRecord> {
        self.mirror.player(&self.local_id)
    }

    pub fn players(&self) -> Vec<PlayerRecord> {
        self.mirror.players()
    }

    /// Local estimate of the session phase.
    ///
    /// Phase is not carried on the wire, so this is the mirror's own phase
    /// logic run over the roster it has seen. It can disagree with the
    /// server, for example after joining a session the server already
    /// ended. Use [`turn_holder`](Self::turn_holder) and
    /// [`is_my_turn`](Self::is_my_turn) for gating; those follow the server.
    pub fn phase(&self) -> Phase {
        self.mirror.phase()
    }

    pub fn mirror(&self) -> &Registry {
        &self.mirror
    }
}
