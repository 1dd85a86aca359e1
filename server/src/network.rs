//! Server network layer: connection hub, accept loop and per-connection tasks

use crate::client_manager::{ConnectionId, ConnectionManager};
use log::{debug, error, info, warn};
use shared::codec::{decode, read_frame, write_frame};
use shared::{
    ChannelValue, Message, MessageKind, PhaseConfig, Position, Registry, ThrottleConfig,
    UpdateThrottle, DEFAULT_PORT,
};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub phase: PhaseConfig,
    pub throttle: ThrottleConfig,
    /// Players silent for longer than this are evicted
    pub stale_timeout: Duration,
    pub sweep_interval: Duration,
    /// Minimum gap between full-state pushes
    pub broadcast_interval: Duration,
    pub max_connections: usize,
    /// Capacity of each connection's outbound queue
    pub outbound_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: format!("0.0.0.0:{}", DEFAULT_PORT),
            phase: PhaseConfig::default(),
            throttle: ThrottleConfig::server(),
            stale_timeout: Duration::from_millis(15_000),
            sweep_interval: Duration::from_millis(1_000),
            broadcast_interval: Duration::from_millis(5_000),
            max_connections: 32,
            outbound_queue: 256,
        }
    }
}

/// Routes inbound messages through the registry and fans out the results.
///
/// Handling is synchronous: outbound messages go into bounded per-connection
/// queues and never wait on a peer. The connection table lock is held for the
/// whole of one message so compound steps (check holder, advance turn,
/// announce) are not interleaved with another connection's message. Lock
/// order is always connections, then throttle or registry.
pub struct Hub {
    registry: Registry,
    throttle: Mutex<UpdateThrottle>,
    connections: Mutex<ConnectionManager>,
    outbound_queue: usize,
}

impl Hub {
    pub fn new(
        registry: Registry,
        throttle: UpdateThrottle,
        max_connections: usize,
        outbound_queue: usize,
    ) -> Self {
        Self {
            registry,
            throttle: Mutex::new(throttle),
            connections: Mutex::new(ConnectionManager::new(max_connections)),
            outbound_queue: outbound_queue.max(1),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn connection_count(&self) -> usize {
        self.lock_connections().len()
    }

    fn lock_connections(&self) -> MutexGuard<'_, ConnectionManager> {
        self.connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_throttle(&self) -> MutexGuard<'_, UpdateThrottle> {
        self.throttle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers a stream and hands back its outbound queue and shutdown signal.
    pub fn open_connection(
        &self,
        addr: SocketAddr,
    ) -> Option<(ConnectionId, mpsc::Receiver<Message>, oneshot::Receiver<()>)> {
        let (outbound_tx, outbound_rx) = mpsc::channel(self.outbound_queue);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let id = self
            .lock_connections()
            .add_connection(addr, outbound_tx, shutdown_tx)?;
        Some((id, outbound_rx, shutdown_rx))
    }

    pub fn handle_message(&self, conn_id: ConnectionId, message: Message) {
        let mut conns = self.lock_connections();

        if message.kind == MessageKind::Join {
            self.handle_join(&mut conns, conn_id, message);
            return;
        }

        let Some(player_id) = conns.player_of(conn_id) else {
            debug!(
                "Dropping {:?} from connection {} before it joined",
                message.kind, conn_id
            );
            return;
        };
        if player_id != message.player_id {
            warn!(
                "Connection {} is bound to {} but sent {:?} as {}",
                conn_id, player_id, message.kind, message.player_id
            );
            return;
        }

        match message.kind {
            MessageKind::Move | MessageKind::StatsUpdate | MessageKind::LocationChange => {
                self.handle_state_change(&mut conns, conn_id, &player_id, &message);
            }
            MessageKind::TurnComplete => self.handle_turn_complete(&mut conns, &player_id),
            MessageKind::Update => {
                self.registry.touch(&player_id);
            }
            MessageKind::Leave => {
                conns.remove_connection(conn_id);
                self.depart(&mut conns, &player_id);
            }
            MessageKind::TurnChange => {
                debug!("Ignoring TurnChange sent by client {}", player_id);
            }
            MessageKind::Join => {}
        }
    }

    fn handle_join(&self, conns: &mut ConnectionManager, conn_id: ConnectionId, message: Message) {
        let name = match message.name() {
            Ok(name) => name.to_string(),
            Err(e) => {
                warn!("Dropping Join from connection {}: {}", conn_id, e);
                return;
            }
        };
        let player_id = message.player_id.clone();
        if player_id.is_empty() {
            warn!("Dropping Join without a player id from connection {}", conn_id);
            return;
        }
        if let Some(bound) = conns.player_of(conn_id) {
            if bound != player_id {
                warn!(
                    "Connection {} already joined as {}, ignoring Join as {}",
                    conn_id, bound, player_id
                );
                return;
            }
        }

        let position = match message.payload.position {
            Some(_) => match message.position() {
                Ok(position) => position,
                Err(e) => {
                    warn!("Dropping Join from connection {}: {}", conn_id, e);
                    return;
                }
            },
            None => Position::default(),
        };
        let character_ref = message.payload.character_ref.unwrap_or_default();
        let record = self
            .registry
            .add_player(&player_id, &name, position, &character_ref);

        if let Some(previous) = conns.bind_player(conn_id, &player_id) {
            info!(
                "Player {} joined again on connection {}, closing connection {}",
                player_id, conn_id, previous
            );
            conns.remove_connection(previous);
        }

        // Roster catch-up, including the joiner's own record with its display id
        for existing in self.registry.players() {
            if !self.unicast(conns, conn_id, Message::join(&existing)) {
                return;
            }
        }

        if self.registry.len() > 1 {
            self.broadcast(conns, &Message::join(&record), Some(conn_id));
        }

        match self.registry.turn_holder() {
            Some(holder) => {
                self.unicast(conns, conn_id, Message::turn_change(holder));
            }
            None => {
                if let Some(first) = self.registry.next_turn() {
                    info!("First turn goes to {}", first);
                    self.broadcast(conns, &Message::turn_change(first), None);
                }
            }
        }
    }

    fn handle_state_change(
        &self,
        conns: &mut ConnectionManager,
        conn_id: ConnectionId,
        player_id: &str,
        message: &Message,
    ) {
        let value = match message.kind {
            MessageKind::Move => message.position().map(ChannelValue::Position),
            MessageKind::StatsUpdate => message.stats_payload().map(ChannelValue::Stats),
            MessageKind::LocationChange => message.location_payload().map(ChannelValue::Location),
            _ => return,
        };
        let value = match value {
            Ok(value) => value,
            Err(e) => {
                warn!("Dropping {:?} from {}: {}", message.kind, player_id, e);
                return;
            }
        };

        if !self.lock_throttle().should_emit(player_id, value) {
            debug!("Throttled {:?} from {}", message.kind, player_id);
            return;
        }

        let (applied, outgoing) = match value {
            ChannelValue::Position(position) => (
                self.registry.update_position(player_id, position),
                Message::moved(player_id, position),
            ),
            ChannelValue::Stats(stats) => (
                self.registry.update_stats(player_id, stats),
                Message::stats(player_id, stats),
            ),
            ChannelValue::Location(location) => (
                self.registry.update_location(player_id, location),
                Message::location(player_id, location),
            ),
        };

        if applied {
            self.broadcast(conns, &outgoing, Some(conn_id));
        }
    }

    fn handle_turn_complete(&self, conns: &mut ConnectionManager, player_id: &str) {
        if self.registry.turn_holder().as_deref() != Some(player_id) {
            debug!("Ignoring TurnComplete from {}, not the turn holder", player_id);
            return;
        }

        if let Some(next) = self.registry.next_turn() {
            debug!("Turn passes from {} to {}", player_id, next);
            self.broadcast(conns, &Message::turn_change(next), None);
        }
    }

    /// Removes a player and tells everyone, including any turn hand-off.
    fn depart(&self, conns: &mut ConnectionManager, player_id: &str) {
        let holder_before = self.registry.turn_holder();
        if self.registry.remove_player(player_id).is_none() {
            return;
        }
        self.lock_throttle().forget(player_id);

        self.broadcast(conns, &Message::leave(player_id), None);
        self.announce_turn_if_moved(conns, holder_before);
    }

    fn announce_turn_if_moved(&self, conns: &mut ConnectionManager, holder_before: Option<String>) {
        let holder_after = self.registry.turn_holder();
        if holder_after == holder_before {
            return;
        }
        if let Some(holder) = holder_after {
            self.broadcast(conns, &Message::turn_change(holder), None);
        }
    }

    fn broadcast(&self, conns: &mut ConnectionManager, message: &Message, exclude: Option<ConnectionId>) {
        let failed = conns.broadcast(message, exclude);
        self.reap(conns, failed);
    }

    fn unicast(&self, conns: &mut ConnectionManager, conn_id: ConnectionId, message: Message) -> bool {
        if conns.send_to(conn_id, message) {
            return true;
        }
        self.reap(conns, vec![conn_id]);
        false
    }

    /// Tears down connections that could not take a message; their players leave.
    fn reap(&self, conns: &mut ConnectionManager, failed: Vec<ConnectionId>) {
        for conn_id in failed {
            let Some(conn) = conns.remove_connection(conn_id) else {
                continue;
            };
            warn!("Dropped connection {} ({}): send failed", conn_id, conn.addr);
            if let Some(player_id) = conn.player_id {
                self.depart(conns, &player_id);
            }
        }
    }

    /// Called once a connection's reader stops, whatever the reason.
    pub fn handle_disconnect(&self, conn_id: ConnectionId) {
        let mut conns = self.lock_connections();
        let Some(conn) = conns.remove_connection(conn_id) else {
            return;
        };
        if let Some(player_id) = conn.player_id {
            info!("Player {} disconnected", player_id);
            self.depart(&mut conns, &player_id);
        }
    }

    /// Evicts players idle for longer than `timeout` and closes their streams.
    pub fn sweep_stale(&self, timeout: Duration) -> usize {
        let mut conns = self.lock_connections();
        let holder_before = self.registry.turn_holder();

        let evicted = self.registry.cleanup_stale_connections(timeout);
        for record in &evicted {
            self.lock_throttle().forget(&record.id);
            if let Some(conn_id) = conns.find_by_player(&record.id) {
                conns.remove_connection(conn_id);
            }
            self.broadcast(&mut conns, &Message::leave(&record.id), None);
        }

        if !evicted.is_empty() {
            self.announce_turn_if_moved(&mut conns, holder_before);
        }
        evicted.len()
    }

    /// Pushes every record to every connection, at most once per `interval`.
    pub fn push_full_state(&self, interval: Duration) -> bool {
        let mut conns = self.lock_connections();
        if conns.is_empty() || !self.registry.should_broadcast_now(interval) {
            return false;
        }

        for record in self.registry.players() {
            self.broadcast(&mut conns, &Message::update(&record), None);
        }
        true
    }
}

/// Accepts connections and runs the hub's background sweeper
pub struct Server {
    listener: TcpListener,
    hub: Arc<Hub>,
    config: ServerConfig,
}

impl Server {
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(&config.bind_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: config.bind_addr.clone(),
                source,
            })?;
        info!("Server listening on {}", listener.local_addr()?);

        let hub = Arc::new(Hub::new(
            Registry::new(config.phase),
            UpdateThrottle::new(config.throttle),
            config.max_connections,
            config.outbound_queue,
        ));

        Ok(Server {
            listener,
            hub,
            config,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn hub(&self) -> Arc<Hub> {
        Arc::clone(&self.hub)
    }

    /// Spawns the task that evicts stale players and pushes full state
    fn spawn_sweeper(&self) {
        let hub = Arc::clone(&self.hub);
        let config = self.config.clone();

        tokio::spawn(async move {
            let mut ticker = interval(config.sweep_interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;

                let evicted = hub.sweep_stale(config.stale_timeout);
                if evicted > 0 {
                    info!("Evicted {} stale player(s)", evicted);
                }
                hub.push_full_state(config.broadcast_interval);
            }
        });
    }

    fn spawn_connection(&self, stream: TcpStream, addr: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY for {}: {}", addr, e);
        }

        let Some((conn_id, outbound_rx, shutdown_rx)) = self.hub.open_connection(addr) else {
            warn!("Server full, refusing {}", addr);
            return;
        };

        let (reader, writer) = stream.into_split();
        tokio::spawn(run_writer(conn_id, writer, outbound_rx));
        tokio::spawn(run_reader(Arc::clone(&self.hub), conn_id, reader, shutdown_rx));
    }

    /// Runs the accept loop until the listener fails permanently.
    pub async fn run(self) -> Result<(), ServerError> {
        self.spawn_sweeper();
        info!("Server started successfully");

        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => self.spawn_connection(stream, addr),
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    }
}

/// Drains one connection's outbound queue onto its stream.
async fn run_writer(conn_id: ConnectionId, mut writer: OwnedWriteHalf, mut outbound: mpsc::Receiver<Message>) {
    while let Some(message) = outbound.recv().await {
        if let Err(e) = write_frame(&mut writer, &message).await {
            info!("Write to connection {} failed: {}", conn_id, e);
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn run_reader(
    hub: Arc<Hub>,
    conn_id: ConnectionId,
    mut reader: OwnedReadHalf,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            frame = read_frame(&mut reader) => match frame {
                Ok(Some(body)) => match decode(&body) {
                    Ok(message) => hub.handle_message(conn_id, message),
                    Err(e) => warn!("Dropping malformed frame from connection {}: {}", conn_id, e),
                },
                Ok(None) => {
                    debug!("Connection {} reached end of stream", conn_id);
                    break;
                }
                Err(e) => {
                    info!("Connection {} faulted: {}", conn_id, e);
                    break;
                }
            },
            _ = &mut shutdown => {
                debug!("Connection {} closed by the hub", conn_id);
                break;
            }
        }
    }

    hub.handle_disconnect(conn_id);
}
