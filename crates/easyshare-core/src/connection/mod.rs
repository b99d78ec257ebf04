//! Connection manager: owns the active TCP peer.
//!
//! One peer at a time. Each accepted or dialed socket is driven by a
//! single dispatch task that reads frames, feeds the pairing state
//! machine and the transfer engine, and answers pings; every outbound
//! frame goes through one bounded write channel, so chunk emission
//! naturally honors socket backpressure. No other task ever touches the
//! connection's mutable state; HTTP subtasks report back through an
//! outcome channel.
//!
//! A second inbound connection displaces the current one only when the
//! current socket is dead or has produced no frame for 30 seconds;
//! otherwise it is refused. Dialing retries three times with a linear
//! backoff. An application-level ping fires every 5 seconds, and 120
//! seconds of silence tears the connection down unless a transfer is in
//! flight or the app is backgrounded.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use socket2::{SockRef, TcpKeepalive};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

use crate::device::{DeviceInfo, Platform};
use crate::error::{Error, Result};
use crate::events::{emit, Event, EventSender};
use crate::pairing::{PairingAction, PairingState, PairingStatus, PairingStep};
use crate::protocol::{encode_frame, Message, MessageBuffer, Payload};
use crate::storage::Storage;
use crate::transfer::{TransferEngine, TransferOutcome};
use crate::{
    CONNECT_ATTEMPTS, CONNECT_TIMEOUT_SECS, KEEPALIVE_INTERVAL_SECS, KEEPALIVE_TIMEOUT_MS,
    STALE_SOCKET_MS,
};

/// Coarse connection status surfaced to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// No peer socket
    Disconnected,
    /// Dial in progress
    Connecting,
    /// Socket established
    Connected,
    /// Pairing handshake in flight
    Pairing,
}

/// Connection state surfaced to the UI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionState {
    /// Coarse status
    pub status: ConnectionStatus,
    /// The peer, once known
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub device: Option<DeviceInfo>,
    /// Last error, if any
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
    /// Free-form status line
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub status_message: Option<String>,
    /// Fine-grained pairing step while pairing
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub pairing_step: Option<PairingStep>,
}

/// Commands routed into the dispatch task.
enum Command {
    SendText(String),
    SendFile {
        path: PathBuf,
        reply: oneshot::Sender<bool>,
    },
    StartPairing {
        passphrase: String,
    },
    ProvidePassphrase {
        passphrase: String,
    },
    Disconnect {
        user_initiated: bool,
    },
}

struct ConnHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
    last_inbound: Arc<AtomicU64>,
    generation: u64,
}

#[derive(Default)]
struct Shared {
    conn: Option<ConnHandle>,
    generation: u64,
    /// Reconnect target after a non-user-initiated disconnect
    last_device: Option<DeviceInfo>,
    server_port: Option<u16>,
}

/// Idle time before the OS starts sending TCP keep-alive probes.
const TCP_KEEPALIVE_IDLE_SECS: u64 = 10;

/// Turn on OS-level keep-alive probing for a peer socket. Probes repeat
/// at the application ping cadence; the ping/pong cycle on top of this
/// catches the half-open connections the OS probes miss.
fn enable_tcp_keepalive(stream: &TcpStream) -> Result<()> {
    let probes = TcpKeepalive::new()
        .with_time(Duration::from_secs(TCP_KEEPALIVE_IDLE_SECS))
        .with_interval(Duration::from_secs(KEEPALIVE_INTERVAL_SECS));
    SockRef::from(stream).set_tcp_keepalive(&probes)?;
    tracing::debug!(idle_secs = TCP_KEEPALIVE_IDLE_SECS, "socket keep-alive probing on");
    Ok(())
}

/// Whether the current socket may be displaced by a new inbound one.
fn can_displace(task_gone: bool, inbound_age_ms: u64) -> bool {
    task_gone || inbound_age_ms > STALE_SOCKET_MS
}

/// Whether the silence threshold tears the connection down.
fn should_timeout(silence_ms: u64, transfer_active: bool, foregrounded: bool) -> bool {
    !transfer_active && foregrounded && silence_ms > KEEPALIVE_TIMEOUT_MS
}

/// The per-process connection manager.
#[derive(Clone)]
pub struct ConnectionManager {
    local: DeviceInfo,
    storage: Arc<dyn Storage>,
    events: EventSender,
    shared: Arc<Mutex<Shared>>,
    foreground: Arc<AtomicBool>,
}

impl ConnectionManager {
    /// Create a manager for the local device.
    #[must_use]
    pub fn new(local: DeviceInfo, storage: Arc<dyn Storage>, events: EventSender) -> Self {
        Self {
            local,
            storage,
            events,
            shared: Arc::new(Mutex::new(Shared::default())),
            foreground: Arc::new(AtomicBool::new(true)),
        }
    }

    /// The local device identity.
    #[must_use]
    pub fn local_device(&self) -> &DeviceInfo {
        &self.local
    }

    /// The bound server port, once [`start_server`](Self::start_server)
    /// has run.
    #[must_use]
    pub fn server_port(&self) -> Option<u16> {
        self.shared.lock().expect("shared lock").server_port
    }

    /// Whether a peer connection task is alive.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared
            .lock()
            .expect("shared lock")
            .conn
            .as_ref()
            .is_some_and(|handle| !handle.cmd_tx.is_closed())
    }

    /// Bind the TCP listener on an ephemeral port and start accepting.
    /// Returns the port for discovery to advertise.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound.
    pub async fn start_server(&self) -> Result<u16> {
        let listener = tokio::net::TcpListener::bind("0.0.0.0:0").await?;
        let port = listener.local_addr()?.port();
        self.shared.lock().expect("shared lock").server_port = Some(port);

        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                let (stream, peer_addr) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!("accept failed: {e}");
                        continue;
                    }
                };

                let displace = {
                    let shared = manager.shared.lock().expect("shared lock");
                    match &shared.conn {
                        Some(handle) => can_displace(
                            handle.cmd_tx.is_closed(),
                            crate::epoch_ms()
                                .saturating_sub(handle.last_inbound.load(Ordering::Relaxed)),
                        ),
                        None => true,
                    }
                };

                if displace {
                    tracing::info!(%peer_addr, "accepted inbound connection");
                    manager.adopt(stream, None);
                } else {
                    tracing::info!(%peer_addr, "refused extra inbound connection");
                    drop(stream);
                }
            }
        });

        tracing::info!(port, "listening for peers");
        Ok(port)
    }

    /// Dial a discovered device: up to 3 attempts, 5 s each, with a
    /// linear backoff between them.
    ///
    /// # Errors
    ///
    /// Returns an error when every attempt fails; the composed error is
    /// also surfaced on the connection state.
    pub async fn connect_to_device(&self, device: &DeviceInfo) -> Result<()> {
        let host = device
            .host
            .clone()
            .ok_or_else(|| Error::Internal("device has no host".to_string()))?;
        let port = device
            .port
            .ok_or_else(|| Error::Internal("device has no port".to_string()))?;

        emit(
            &self.events,
            Event::ConnectionState(ConnectionState {
                status: ConnectionStatus::Connecting,
                device: Some(device.clone()),
                error: None,
                status_message: Some(format!("Connecting to {}", device.name)),
                pairing_step: None,
            }),
        );

        let mut last_error = String::new();
        for attempt in 1..=CONNECT_ATTEMPTS {
            match tokio::time::timeout(
                Duration::from_secs(CONNECT_TIMEOUT_SECS),
                TcpStream::connect((host.as_str(), port)),
            )
            .await
            {
                Ok(Ok(stream)) => {
                    tracing::info!(device = %device.name, attempt, "connected");
                    self.adopt(stream, Some(device.clone()));
                    return Ok(());
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = format!("timed out after {CONNECT_TIMEOUT_SECS}s"),
            }

            tracing::debug!(attempt, "connect attempt failed: {last_error}");
            if attempt < CONNECT_ATTEMPTS {
                tokio::time::sleep(Duration::from_secs(u64::from(attempt))).await;
            }
        }

        let error = Error::ConnectFailed {
            host,
            port,
            reason: last_error,
        };
        emit(
            &self.events,
            Event::ConnectionState(ConnectionState {
                status: ConnectionStatus::Disconnected,
                device: Some(device.clone()),
                error: Some(error.to_string()),
                status_message: None,
                pairing_step: None,
            }),
        );
        Err(error)
    }

    /// Send a text message to the connected peer.
    ///
    /// # Errors
    ///
    /// Returns an error when no peer is connected.
    pub fn send_text(&self, content: String) -> Result<()> {
        self.command(Command::SendText(content))
    }

    /// Offer a file to the connected peer. Resolves `true` once the
    /// transfer reaches its successful terminal state, `false` on
    /// rejection, failure, or disconnect.
    ///
    /// # Errors
    ///
    /// Returns an error when no peer is connected.
    pub async fn send_file(&self, path: PathBuf) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::SendFile { path, reply })?;
        Ok(rx.await.unwrap_or(false))
    }

    /// Begin pairing with the connected peer using a passphrase.
    ///
    /// # Errors
    ///
    /// Returns an error when no peer is connected.
    pub fn start_pairing(&self, passphrase: String) -> Result<()> {
        self.command(Command::StartPairing { passphrase })
    }

    /// Supply the passphrase after a [`Event::PairingRequest`] prompt.
    ///
    /// # Errors
    ///
    /// Returns an error when no peer is connected.
    pub fn provide_passphrase(&self, passphrase: String) -> Result<()> {
        self.command(Command::ProvidePassphrase { passphrase })
    }

    /// User-initiated disconnect. Idempotent; clears the auto-reconnect
    /// target.
    pub fn disconnect(&self) {
        let mut shared = self.shared.lock().expect("shared lock");
        shared.last_device = None;
        if let Some(handle) = &shared.conn {
            let _ = handle.cmd_tx.send(Command::Disconnect {
                user_initiated: true,
            });
        }
    }

    /// Foreground/background signal from a mobile host. Backgrounding
    /// suppresses the keepalive timeout; returning to the foreground
    /// refreshes the inbound clock and, if the socket died meanwhile,
    /// attempts a single reconnect to the last-connected device.
    pub fn set_foreground(&self, foreground: bool) {
        self.foreground.store(foreground, Ordering::Relaxed);
        if !foreground {
            return;
        }

        let reconnect_target = {
            let shared = self.shared.lock().expect("shared lock");
            if let Some(handle) = &shared.conn {
                handle
                    .last_inbound
                    .store(crate::epoch_ms(), Ordering::Relaxed);
            }
            let alive = shared
                .conn
                .as_ref()
                .is_some_and(|handle| !handle.cmd_tx.is_closed());
            if !alive && self.local.platform == Platform::Mobile {
                shared.last_device.clone()
            } else {
                None
            }
        };

        if let Some(device) = reconnect_target {
            let manager = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(500)).await;
                if !manager.is_connected() {
                    tracing::info!(device = %device.name, "attempting auto-reconnect");
                    let _ = manager.connect_to_device(&device).await;
                }
            });
        }
    }

    fn command(&self, command: Command) -> Result<()> {
        let shared = self.shared.lock().expect("shared lock");
        let handle = shared.conn.as_ref().ok_or(Error::NotConnected)?;
        handle
            .cmd_tx
            .send(command)
            .map_err(|_| Error::NotConnected)
    }

    /// Install a new peer socket, displacing any current one.
    fn adopt(&self, stream: TcpStream, remote: Option<DeviceInfo>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let last_inbound = Arc::new(AtomicU64::new(crate::epoch_ms()));

        let generation = {
            let mut shared = self.shared.lock().expect("shared lock");
            if let Some(old) = &shared.conn {
                let _ = old.cmd_tx.send(Command::Disconnect {
                    user_initiated: false,
                });
            }
            shared.generation += 1;
            shared.conn = Some(ConnHandle {
                cmd_tx,
                last_inbound: Arc::clone(&last_inbound),
                generation: shared.generation,
            });
            shared.generation
        };

        let task = ConnectionTask {
            local: self.local.clone(),
            storage: Arc::clone(&self.storage),
            events: self.events.clone(),
            shared: Arc::clone(&self.shared),
            foreground: Arc::clone(&self.foreground),
            last_inbound,
            generation,
        };
        tokio::spawn(task.run(stream, remote, cmd_rx));
    }
}

/// Everything the dispatch task needs; runs until the socket dies.
struct ConnectionTask {
    local: DeviceInfo,
    storage: Arc<dyn Storage>,
    events: EventSender,
    shared: Arc<Mutex<Shared>>,
    foreground: Arc<AtomicBool>,
    last_inbound: Arc<AtomicU64>,
    generation: u64,
}

impl ConnectionTask {
    async fn run(
        self,
        stream: TcpStream,
        remote: Option<DeviceInfo>,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    ) {
        if let Err(e) = enable_tcp_keepalive(&stream) {
            tracing::debug!("could not enable TCP keepalive: {e}");
        }

        let (mut read_half, mut write_half) = stream.into_split();

        // Serialized write channel; bounded so chunk emission awaits
        // drain.
        let (writer_tx, mut writer_rx) = mpsc::channel::<Message>(32);
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            while let Some(message) = writer_rx.recv().await {
                match encode_frame(&message) {
                    Ok(frame) => {
                        if let Err(e) = write_half.write_all(&frame).await {
                            tracing::debug!("peer write failed: {e}");
                            break;
                        }
                    }
                    Err(e) => tracing::warn!("frame encode failed: {e}"),
                }
            }
        });

        let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel::<TransferOutcome>();
        let mut engine = TransferEngine::new(
            self.local.clone(),
            Arc::clone(&self.storage),
            self.events.clone(),
            writer_tx.clone(),
            outcome_tx,
        );

        if let Some(remote) = remote {
            // A stored credential enables the data plane without
            // re-pairing.
            if let Some(paired) = self
                .storage
                .get_paired_devices()
                .into_iter()
                .find(|p| p.device.id == remote.id)
            {
                if let Ok(secret) = paired.secret() {
                    engine.set_secret(secret);
                }
                self.storage.update_paired_device_last_connected(&remote.id);
            }
            engine.set_remote(remote);
        }

        let mut conn = PeerConn {
            local: self.local.clone(),
            storage: Arc::clone(&self.storage),
            events: self.events.clone(),
            writer: writer_tx,
            engine,
            pairing: None,
        };
        conn.emit_state(ConnectionStatus::Connected, None, None);

        let mut buffer = MessageBuffer::new();
        let mut read_buf = vec![0u8; 16 * 1024];
        let mut keepalive =
            tokio::time::interval(Duration::from_secs(KEEPALIVE_INTERVAL_SECS));
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut close_error: Option<String> = None;
        let mut user_initiated = false;

        loop {
            tokio::select! {
                read = read_half.read(&mut read_buf) => {
                    match read {
                        Ok(0) => {
                            close_error = Some("peer closed the connection".to_string());
                            break;
                        }
                        Ok(n) => {
                            buffer.append(&read_buf[..n]);
                            match buffer.extract() {
                                Ok(messages) => {
                                    // Any inbound frame counts as liveness.
                                    self.last_inbound
                                        .store(crate::epoch_ms(), Ordering::Relaxed);
                                    for message in messages {
                                        conn.dispatch(message).await;
                                    }
                                }
                                Err(e) => {
                                    tracing::warn!("protocol violation: {e}");
                                    close_error = Some(e.to_string());
                                    break;
                                }
                            }
                        }
                        Err(e) => {
                            close_error = Some(format!("read error: {e}"));
                            break;
                        }
                    }
                }
                Some(command) = cmd_rx.recv() => {
                    if let Some(user) = conn.handle_command(command).await {
                        user_initiated = user;
                        break;
                    }
                }
                Some(outcome) = outcome_rx.recv() => {
                    conn.engine.handle_outcome(outcome).await;
                }
                _ = keepalive.tick() => {
                    if conn.keepalive_tick(&self.last_inbound, &self.foreground).await {
                        close_error = Some("keepalive timeout".to_string());
                        break;
                    }
                }
            }
        }

        // Teardown: pending transfers resolve false, temp files and HTTP
        // endpoints go away, pairing state dies with the socket.
        conn.engine.abort_all().await;
        conn.pairing = None;
        let last_remote = conn.engine.remote().cloned();

        {
            let mut shared = self.shared.lock().expect("shared lock");
            if shared
                .conn
                .as_ref()
                .is_some_and(|handle| handle.generation == self.generation)
            {
                shared.conn = None;
                if user_initiated {
                    shared.last_device = None;
                } else if last_remote.is_some() {
                    shared.last_device = last_remote.clone();
                }
            }
        }

        emit(
            &conn.events,
            Event::ConnectionState(ConnectionState {
                status: ConnectionStatus::Disconnected,
                device: last_remote,
                error: if user_initiated { None } else { close_error },
                status_message: None,
                pairing_step: None,
            }),
        );
        tracing::info!("connection closed");
    }
}

/// Mutable per-connection state, owned by the dispatch task.
struct PeerConn {
    local: DeviceInfo,
    storage: Arc<dyn Storage>,
    events: EventSender,
    writer: mpsc::Sender<Message>,
    engine: TransferEngine,
    pairing: Option<PairingState>,
}

impl PeerConn {
    async fn dispatch(&mut self, message: Message) {
        match &message.payload {
            Payload::Ping => {
                let _ = self.writer.send(Message::pong_for(&message.id)).await;
            }
            Payload::Pong => {}
            Payload::PairRequest { .. }
            | Payload::PairChallenge { .. }
            | Payload::PairResponse { .. }
            | Payload::PairConfirm { .. }
            | Payload::PairReject { .. } => {
                if self.pairing.is_none() {
                    if matches!(&message.payload, Payload::PairRequest { .. }) {
                        self.pairing = Some(PairingState::new(self.local.clone()));
                    } else {
                        tracing::debug!("pairing message outside a pairing exchange, ignoring");
                        return;
                    }
                }
                let actions = self
                    .pairing
                    .as_mut()
                    .expect("created above")
                    .handle(&message.payload);
                self.apply_pairing_actions(actions).await;
            }
            Payload::Error {
                code,
                message: description,
                ..
            } => {
                tracing::warn!(%code, "peer reported an error: {description}");
            }
            _ => self.engine.handle_message(&message).await,
        }
    }

    /// Returns `Some(user_initiated)` when the task must stop.
    async fn handle_command(&mut self, command: Command) -> Option<bool> {
        match command {
            Command::SendText(content) => {
                if let Err(e) = self.engine.send_text(content).await {
                    tracing::warn!("text send failed: {e}");
                }
                None
            }
            Command::SendFile { path, reply } => {
                self.engine.send_file(path, reply).await;
                None
            }
            Command::StartPairing { passphrase } => {
                let Some(remote) = self.engine.remote().cloned() else {
                    tracing::warn!("cannot initiate pairing before the peer is identified");
                    return None;
                };
                let (state, actions) =
                    PairingState::initiate(self.local.clone(), remote, passphrase);
                self.pairing = Some(state);
                self.apply_pairing_actions(actions).await;
                None
            }
            Command::ProvidePassphrase { passphrase } => {
                if let Some(pairing) = self.pairing.as_mut() {
                    let actions = pairing.provide_passphrase(passphrase);
                    self.apply_pairing_actions(actions).await;
                } else {
                    tracing::warn!("no pairing exchange is waiting for a passphrase");
                }
                None
            }
            Command::Disconnect { user_initiated } => Some(user_initiated),
        }
    }

    async fn apply_pairing_actions(&mut self, actions: Vec<PairingAction>) {
        for action in actions {
            match action {
                PairingAction::Send(payload) => {
                    let _ = self.writer.send(Message::new(payload)).await;
                }
                PairingAction::RequestPassphrase(device) => {
                    emit(&self.events, Event::PairingRequest(device));
                }
                PairingAction::Succeeded(paired) => {
                    if let Ok(secret) = paired.secret() {
                        self.engine.set_secret(secret);
                    }
                    self.engine.set_remote(paired.device.clone());
                    self.storage.add_paired_device(*paired);
                    if let Some(remote) = self.engine.remote() {
                        self.storage.update_paired_device_last_connected(&remote.id);
                    }
                    tracing::info!("pairing succeeded");
                }
                PairingAction::Failed(reason) => {
                    tracing::warn!("pairing failed: {reason}");
                }
            }
        }
        self.emit_pairing_state();
    }

    /// Surface the connection state derived from the pairing machine.
    fn emit_pairing_state(&mut self) {
        let Some(pairing) = self.pairing.as_ref() else {
            return;
        };
        match pairing.status() {
            PairingStatus::Success => {
                let step = pairing.step();
                self.pairing = None;
                self.emit_state(ConnectionStatus::Connected, None, Some(step));
            }
            PairingStatus::Failed => {
                let error = pairing.error().map(str::to_string);
                let step = pairing.step();
                self.pairing = None;
                self.emit_state(ConnectionStatus::Connected, error, Some(step));
            }
            PairingStatus::Waiting | PairingStatus::Verifying | PairingStatus::Idle => {
                let step = pairing.step();
                self.emit_state(ConnectionStatus::Pairing, None, Some(step));
            }
        }
    }

    fn emit_state(
        &self,
        status: ConnectionStatus,
        error: Option<String>,
        pairing_step: Option<PairingStep>,
    ) {
        emit(
            &self.events,
            Event::ConnectionState(ConnectionState {
                status,
                device: self.engine.remote().cloned(),
                error,
                status_message: None,
                pairing_step,
            }),
        );
    }

    /// One 5-second keepalive cycle. Returns `true` when the connection
    /// must be torn down.
    async fn keepalive_tick(
        &mut self,
        last_inbound: &AtomicU64,
        foreground: &AtomicBool,
    ) -> bool {
        // Opportunistic ping; a congested writer mid-transfer is itself
        // proof of liveness.
        let _ = self.writer.try_send(Message::new(Payload::Ping));

        if self.pairing.as_ref().is_some_and(PairingState::is_expired) {
            tracing::warn!("pairing timed out");
            self.pairing = None;
            self.emit_state(
                ConnectionStatus::Connected,
                Some("Pairing timed out".to_string()),
                Some(PairingStep::Failed),
            );
        }

        let silence = crate::epoch_ms().saturating_sub(last_inbound.load(Ordering::Relaxed));
        should_timeout(
            silence,
            self.engine.is_active(),
            foreground.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_boundaries() {
        // 119 s of silence survives, 121 s does not.
        assert!(!should_timeout(119_000, false, true));
        assert!(should_timeout(121_000, false, true));
        // Exactly at the threshold survives.
        assert!(!should_timeout(KEEPALIVE_TIMEOUT_MS, false, true));
    }

    #[test]
    fn test_timeout_suppressed_during_transfer() {
        assert!(!should_timeout(500_000, true, true));
    }

    #[test]
    fn test_timeout_suppressed_in_background() {
        assert!(!should_timeout(500_000, false, false));
    }

    #[test]
    fn test_displacement_rules() {
        assert!(can_displace(true, 0), "dead task always displaces");
        assert!(can_displace(false, STALE_SOCKET_MS + 1));
        assert!(!can_displace(false, STALE_SOCKET_MS));
        assert!(!can_displace(false, 1_000));
    }
}
