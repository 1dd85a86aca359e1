use crate::game::ClientGameState;
use log::{debug, info, warn};
use shared::codec::{decode, read_frame, write_frame};
use shared::{
    ChannelValue, Location, Message, PhaseConfig, Position, ProtocolError, Registry, Stats,
    UpdateThrottle,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const OUTBOUND_QUEUE: usize = 64;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("session is disconnected")]
    Disconnected,
}

/// Who we are when joining.
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    pub id: String,
    pub name: String,
    pub position: Position,
    pub character_ref: String,
}

/// One connection to the server.
///
/// Every outbound message goes through a single queue drained by one writer
/// task, so sends from a periodic poll and from discrete user actions never
/// interleave on the stream. Changes pass the throttle before being queued.
/// There is no reconnection: after a fault `is_connected` turns false and
/// every send fails with [`SessionError::Disconnected`].
pub struct ClientSession {
    state: Arc<ClientGameState>,
    outbound: mpsc::Sender<Message>,
    throttle: Mutex<UpdateThrottle>,
    connected: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl ClientSession {
    /// Connects, sends the initial Join and starts the receive loop.
    pub async fn connect(
        server_addr: &str,
        identity: LocalIdentity,
        throttle: UpdateThrottle,
        phase: PhaseConfig,
    ) -> Result<Self, SessionError> {
        info!("Connecting to {} as {}", server_addr, identity.id);
        let stream = TcpStream::connect(server_addr).await?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();

        let connected = Arc::new(AtomicBool::new(true));
        let state = Arc::new(ClientGameState::new(
            identity.id.clone(),
            Registry::new(phase),
        ));

        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let writer = tokio::spawn(run_writer(writer, outbound_rx, Arc::clone(&connected)));

        outbound
            .send(Message::join_request(
                identity.id.clone(),
                identity.name,
                identity.position,
                identity.character_ref,
            ))
            .await
            .map_err(|_| SessionError::Disconnected)?;

        let reader = tokio::spawn(run_reader(
            reader,
            Arc::clone(&state),
            Arc::clone(&connected),
        ));

        Ok(ClientSession {
            state,
            outbound,
            throttle: Mutex::new(throttle),
            connected,
            reader,
            writer,
        })
    }

    fn lock_throttle(&self) -> MutexGuard<'_, UpdateThrottle> {
        self.throttle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ensure_connected(&self) -> Result<(), SessionError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(SessionError::Disconnected)
        }
    }

    async fn enqueue(&self, message: Message) -> Result<(), SessionError> {
        self.ensure_connected()?;
        self.outbound
            .send(message)
            .await
            .map_err(|_| SessionError::Disconnected)
    }

    async fn emit_if_due(&self, value: ChannelValue, message: Message) -> Result<bool, SessionError> {
        self.ensure_connected()?;
        let due = self
            .lock_throttle()
            .should_emit(self.state.local_id(), value);
        if !due {
            return Ok(false);
        }
        self.enqueue(message).await?;
        Ok(true)
    }

    /// Records a movement sample. Returns whether it was transmitted.
    pub async fn send_position(&self, position: Position) -> Result<bool, SessionError> {
        if !position.is_finite() {
            warn!("Ignoring non-finite position sample {:?}", position);
            return Ok(false);
        }
        self.state.predict_position(position);
        let message = Message::moved(self.state.local_id(), position);
        self.emit_if_due(ChannelValue::Position(position), message).await
    }

    pub async fn send_stats(&self, stats: Stats) -> Result<bool, SessionError> {
        let stats = stats.clamped();
        self.state.predict_stats(stats);
        let message = Message::stats(self.state.local_id(), stats);
        self.emit_if_due(ChannelValue::Stats(stats), message).await
    }

    pub async fn send_location(&self, location: Location) -> Result<bool, SessionError> {
        self.state.predict_location(location);
        let message = Message::location(self.state.local_id(), location);
        self.emit_if_due(ChannelValue::Location(location), message).await
    }

    /// Ends our turn. Returns false without sending if it isn't our turn.
    pub async fn complete_turn(&self) -> Result<bool, SessionError> {
        if !self.state.is_my_turn() {
            debug!("complete_turn called while not holding the turn");
            return Ok(false);
        }
        self.enqueue(Message::turn_complete(self.state.local_id()))
            .await?;
        Ok(true)
    }

    /// Keeps the server's stale-player sweep from evicting an idle player.
    pub async fn heartbeat(&self) -> Result<(), SessionError> {
        self.enqueue(Message::heartbeat(self.state.local_id())).await
    }

    /// Sends Leave, flushes the queue and closes the stream.
    pub async fn leave(self) -> Result<(), SessionError> {
        let ClientSession {
            state,
            outbound,
            connected,
            reader,
            writer,
            ..
        } = self;

        let sent = if connected.load(Ordering::SeqCst) {
            outbound.send(Message::leave(state.local_id())).await.is_ok()
        } else {
            false
        };
        drop(outbound);

        if let Err(e) = writer.await {
            debug!("Writer task ended abnormally: {}", e);
        }
        reader.abort();
        connected.store(false, Ordering::SeqCst);

        if sent {
            info!("Left the session");
            Ok(())
        } else {
            Err(SessionError::Disconnected)
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_my_turn(&self) -> bool {
        self.state.is_my_turn()
    }

    pub fn state(&self) -> Arc<ClientGameState> {
        Arc::clone(&self.state)
    }
}

async fn run_writer(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<Message>,
    connected: Arc<AtomicBool>,
) {
    while let Some(message) = outbound.recv().await {
        if let Err(e) = write_frame(&mut writer, &message).await {
            warn!("Failed to send {:?}: {}", message.kind, e);
            connected.store(false, Ordering::SeqCst);
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn run_reader(
    mut reader: OwnedReadHalf,
    state: Arc<ClientGameState>,
    connected: Arc<AtomicBool>,
) {
    loop {
        match read_frame(&mut reader).await {
            Ok(Some(body)) => match decode(&body) {
                Ok(message) => state.apply_message(&message),
                Err(e) => warn!("Dropping malformed frame from server: {}", e),
            },
            Ok(None) => {
                info!("Server closed the connection");
                break;
            }
            Err(e) => {
                warn!("Connection to server faulted: {}", e);
                break;
            }
        }
    }
    connected.store(false, Ordering::SeqCst);
}
