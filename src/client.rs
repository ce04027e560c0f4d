//! The mesh [`Client`] handle and its [`ClientDriver`]: the driver owns
//! the Signaling Transport, the Connection Manager and the Topology
//! Controller and drives the lifecycle state machine inside `run()`'s
//! `select!` loop; the handle is a cheap, cloneable front door that routes
//! every operation into that loop as a [`Command`] instead of mutating
//! state directly.
//!
//! Structured the way `flarch::broker::Broker` splits a cloneable handle
//! (`intern_tx` plus a shared snapshot) from the `Intern` state its own
//! processing loop owns exclusively: a `&mut self` borrow good for the
//! entire lifetime of `run()` can't also be held by a caller's `broadcast`
//! or `ping`, so those calls cross into the loop over a channel instead.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Duration;

use crate::codec::SignalPayload;
use crate::connection::{ConnectionEvent, ConnectionManager, ConnectionStats};
use crate::diagnostics::{self, ChaosConfig, PingTable};
use crate::error::MeshError;
use crate::events::{Event, EventSink};
use crate::identity::PeerId;
use crate::signal::{EphemeralPayload, HeartbeatConfig, SignalingTransport, TransportEvent};
use crate::tasks;
use crate::topology::{ConfiguredTopology, Topology, TopologyController};

/// How long the mesh waits in `syncing` for an authoritative message or a
/// direct peer message before promoting itself to `active` anyway, the
/// racy-authority fallback.
const SYNC_TIMEOUT: Duration = Duration::from_secs(5);

/// Result type for an async token provider: `Ok(token)` or `Err(reason)`.
pub type TokenResult = Result<String, String>;

/// A boxed future a [`TokenProvider`] returns.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// An async callback that produces a fresh bearer token on demand: the
/// caller-supplied async function form of credential.
pub type TokenProvider = Arc<dyn Fn() -> BoxFuture<TokenResult> + Send + Sync>;

/// How the client authenticates to the signaling server.
#[derive(Clone)]
pub enum Credential {
    Static(String),
    Provider(TokenProvider),
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::Static(_) => f.write_str("Credential::Static(..)"),
            Credential::Provider(_) => f.write_str("Credential::Provider(..)"),
        }
    }
}

/// The mesh lifecycle state, following the documented transition table
/// from idle through active and back down to disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Initializing,
    Connecting,
    Handshaking,
    Syncing,
    Active,
    Reconnecting,
    Disconnected,
    Error,
}

/// Which transport currently carries traffic to a given peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerTransport {
    Relay,
    Direct,
}

/// Construction-time configuration. Validated eagerly, matching `flmodules::nodeconfig::NodeConfig`'s
/// decode-time validation rather than deferring to first use.
#[derive(Clone)]
pub struct ClientConfig {
    pub workspace_id: String,
    pub credential: Credential,
    pub server_url: String,
    pub topology: ConfiguredTopology,
    pub debug: bool,
    pub ice_servers: Vec<String>,
    pub max_peers_for_mesh: usize,
    /// How often the transport re-requests the peer list from the
    /// server as a liveness measure independent of presence push
    /// notifications. `None` disables the refresh entirely.
    pub peer_list_refresh_interval: Option<Duration>,
    /// How often the client reports per-connection stats back to the
    /// server for monitoring. Off by default.
    pub report_stats_interval: Option<Duration>,
}

impl ClientConfig {
    pub fn new(workspace_id: impl Into<String>, credential: Credential) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            credential,
            server_url: "wss://localhost:8443/signal".to_string(),
            topology: ConfiguredTopology::Mesh,
            debug: false,
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            max_peers_for_mesh: 8,
            peer_list_refresh_interval: Some(Duration::from_secs(10)),
            report_stats_interval: None,
        }
    }

    pub fn peer_list_refresh_interval(mut self, interval: Option<Duration>) -> Self {
        self.peer_list_refresh_interval = interval;
        self
    }

    pub fn report_stats_interval(mut self, interval: Option<Duration>) -> Self {
        self.report_stats_interval = interval;
        self
    }

    pub fn server_url(mut self, url: impl Into<String>) -> Self {
        self.server_url = url.into();
        self
    }

    pub fn topology(mut self, topology: ConfiguredTopology) -> Self {
        self.topology = topology;
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn ice_servers(mut self, servers: Vec<String>) -> Self {
        self.ice_servers = servers;
        self
    }

    pub fn max_peers_for_mesh(mut self, max: usize) -> Self {
        self.max_peers_for_mesh = max;
        self
    }

    /// Construction-time validation: configuration errors are reported
    /// immediately, never deferred to first use.
    fn validate(&self) -> Result<(), MeshError> {
        if self.workspace_id.is_empty() {
            return Err(MeshError::MissingWorkspaceId);
        }
        if let Credential::Static(token) = &self.credential {
            if token.is_empty() {
                return Err(MeshError::MissingCredentials);
            }
        }
        Ok(())
    }
}

enum Internal {
    SyncTimeout,
    ReportStats,
}

/// Every public operation, routed as a message into [`ClientDriver::run`]'s
/// `select!` loop instead of reaching into driver state directly. Queries
/// that need a result carry a `oneshot::Sender` back to the caller, the
/// same request/reply shape `flarch::broker::Broker::settle` uses over its
/// own `intern_tx`.
enum Command {
    Connect(oneshot::Sender<Result<(), MeshError>>),
    Disconnect(oneshot::Sender<()>),
    Destroy(oneshot::Sender<()>),
    Broadcast(Bytes),
    SendToPeer(PeerId, Bytes, oneshot::Sender<bool>),
    SendToAuthority(Bytes, oneshot::Sender<Result<(), MeshError>>),
    SendEphemeral(serde_json::Value, Option<PeerId>, oneshot::Sender<Result<(), MeshError>>),
    Ping(PeerId, oneshot::Sender<i64>),
    UpdateToken(String),
    SimulateNetwork(Option<ChaosConfig>),
    ConnectionStats(PeerId, oneshot::Sender<Option<ConnectionStats>>),
    Subscribe(Box<dyn FnMut(&Event) + Send>),
}

/// The slice of driver state a handle can answer synchronously without a
/// round trip through [`Command`], kept current by the driver as it
/// processes events.
struct Shared {
    state: StdMutex<LifecycleState>,
    roster: StdMutex<HashSet<PeerId>>,
    peer_status: StdMutex<HashMap<PeerId, PeerTransport>>,
}

impl Default for Shared {
    fn default() -> Self {
        Self {
            state: StdMutex::new(LifecycleState::Idle),
            roster: StdMutex::new(HashSet::new()),
            peer_status: StdMutex::new(HashMap::new()),
        }
    }
}

/// The mesh connection fabric's entry point: a cheap, `Clone` handle.
/// Holds no subsystem state itself — every call is a [`Command`] sent to
/// the [`ClientDriver`] returned alongside it by [`Client::new`], so the
/// handle stays usable from any number of tasks concurrently with
/// `ClientDriver::run` driving the event loop.
#[derive(Clone)]
pub struct Client {
    local_id: PeerId,
    shared: Arc<Shared>,
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl Client {
    /// Builds a client and its driver without connecting. Construction
    /// never opens the socket; `connect()` does, and requires
    /// `ClientDriver::run` to already be polling (typically spawned right
    /// after construction) since `connect()` is itself routed as a
    /// [`Command`].
    pub fn new(config: ClientConfig) -> Result<(Self, ClientDriver), MeshError> {
        config.validate()?;

        let local_id = PeerId::random();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let mut transport = SignalingTransport::new(
            config.server_url.clone(),
            config.workspace_id.clone(),
            config.credential.clone(),
            HeartbeatConfig::default(),
            transport_tx,
        );
        transport.set_list_refresh_interval(config.peer_list_refresh_interval);
        let connections = ConnectionManager::new(local_id.clone(), config.ice_servers.clone());
        let topology = TopologyController::new(config.topology, config.max_peers_for_mesh);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::default());

        let handle = Self {
            local_id: local_id.clone(),
            shared: Arc::clone(&shared),
            cmd_tx,
        };
        let driver = ClientDriver {
            local_id,
            transport,
            transport_rx,
            connections,
            topology,
            events: EventSink::new(),
            state: LifecycleState::Idle,
            roster: HashSet::new(),
            peer_status: HashMap::new(),
            ping_table: PingTable::new(),
            chaos: None,
            internal_tx,
            internal_rx,
            cmd_rx,
            shared,
            sync_timeout_handle: None,
            report_stats_interval: config.report_stats_interval,
            report_stats_handle: None,
        };
        Ok((handle, driver))
    }

    pub fn get_id(&self) -> &PeerId {
        &self.local_id
    }

    pub fn get_peers(&self) -> Vec<PeerId> {
        self.shared.roster.lock().unwrap().iter().cloned().collect()
    }

    pub fn get_status(&self, peer: &PeerId) -> Option<PeerTransport> {
        self.shared.peer_status.lock().unwrap().get(peer).copied()
    }

    /// Per-peer connection health: signaling state, whether the direct
    /// channel is open, and byte counters in each direction. `None` for
    /// a peer with no pairwise connection record (relay-only or unknown),
    /// or if the driver is no longer running.
    pub async fn get_connection_stats(&self, peer: &PeerId) -> Option<ConnectionStats> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(Command::ConnectionStats(peer.clone(), tx)).ok()?;
        rx.await.ok().flatten()
    }

    /// Whether the client is ready to send: `true` only once the
    /// lifecycle has reached `active`. Does not report per-peer
    /// reachability — see [`Client::get_status`] for that.
    pub fn can_send(&self) -> bool {
        *self.shared.state.lock().unwrap() == LifecycleState::Active
    }

    pub fn lifecycle_state(&self) -> LifecycleState {
        *self.shared.state.lock().unwrap()
    }

    pub fn subscribe<F: FnMut(&Event) + Send + 'static>(&self, f: F) {
        let _ = self.cmd_tx.send(Command::Subscribe(Box::new(f)));
    }

    /// Opens the signaling channel. Lifecycle moves through
    /// `initializing`/`connecting` synchronously; the rest of the
    /// transition table plays out as transport events arrive in
    /// [`ClientDriver::run`].
    pub async fn connect(&self) -> Result<(), MeshError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(Command::Connect(tx)).map_err(|_| MeshError::DriverGone)?;
        rx.await.map_err(|_| MeshError::DriverGone)?
    }

    /// Closes the signaling channel and every pairwise connection but
    /// leaves the client reusable (`connect()` may be called again).
    pub async fn disconnect(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Disconnect(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Ordered, permanent teardown (cancel timers, close connections,
    /// close signaling, clear tables), matching `flnode`'s subsystem
    /// shutdown discipline. After this the client must not be used again;
    /// `ClientDriver::run` returns once this completes.
    pub async fn destroy(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Destroy(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn update_token(&self, token: String) {
        let _ = self.cmd_tx.send(Command::UpdateToken(token));
    }

    pub fn simulate_network(&self, chaos: Option<ChaosConfig>) {
        let _ = self.cmd_tx.send(Command::SimulateNetwork(chaos));
    }

    /// Reaches every known peer, direct channel where open, server relay
    /// otherwise. Dropped with a warning unless the lifecycle is
    /// `active`.
    pub fn broadcast(&self, bytes: Bytes) {
        let _ = self.cmd_tx.send(Command::Broadcast(bytes));
    }

    /// Direct channel if open, relay otherwise. Dropped with a warning
    /// unless the lifecycle is `active`.
    pub async fn send_to_peer(&self, peer: &PeerId, bytes: Bytes) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::SendToPeer(peer.clone(), bytes, tx)).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// An opaque payload addressed to the signaling server itself. Not
    /// subject to chaos injection, which applies only to peer-directed
    /// `broadcast`/`sendToPeer`.
    pub async fn send_to_authority(&self, bytes: Bytes) -> Result<(), MeshError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(Command::SendToAuthority(bytes, tx)).map_err(|_| MeshError::DriverGone)?;
        rx.await.map_err(|_| MeshError::DriverGone)?
    }

    pub async fn send_ephemeral(&self, payload: serde_json::Value, to: Option<&PeerId>) -> Result<(), MeshError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::SendEphemeral(payload, to.cloned(), tx))
            .map_err(|_| MeshError::DriverGone)?;
        rx.await.map_err(|_| MeshError::DriverGone)?
    }

    /// Round-trips a `__ping__`/`__pong__` pair over the ephemeral
    /// channel, resolving to the measured latency in milliseconds or `-1`
    /// on a 5 second timeout. Safe to call while [`ClientDriver::run`] is
    /// driving the event loop: the pong that resolves this call is
    /// processed on the driver's own task, not blocked behind this call.
    pub async fn ping(&self, peer: PeerId) -> i64 {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Ping(peer, tx)).is_err() {
            return -1;
        }
        rx.await.unwrap_or(-1)
    }
}

/// Owns every mutable subsystem and drains [`Command`]s from the
/// [`Client`] handle inside `run`'s `select!` loop. A `&mut self`
/// borrowed for the loop's entire lifetime would make a `Client`'s direct
/// methods uncallable while it runs, the same reason
/// `flarch::broker::Broker` never exposes its own `Intern` directly —
/// only through messages its handle sends.
pub struct ClientDriver {
    local_id: PeerId,
    transport: SignalingTransport,
    transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    connections: ConnectionManager,
    topology: TopologyController,
    events: EventSink,
    state: LifecycleState,
    roster: HashSet<PeerId>,
    peer_status: HashMap<PeerId, PeerTransport>,
    ping_table: PingTable,
    chaos: Option<ChaosConfig>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    shared: Arc<Shared>,
    sync_timeout_handle: Option<JoinHandle<()>>,
    report_stats_interval: Option<Duration>,
    report_stats_handle: Option<JoinHandle<()>>,
}

impl ClientDriver {
    /// Drives the client forward: commands from the handle, transport
    /// events, connection manager events and internal timers, one at a
    /// time, all on this task, the same single conceptual queue a JS
    /// runtime would give for free. Runs until the handle sends
    /// [`Command::Destroy`] or every handle is dropped.
    pub async fn run(mut self) {
        self.start_report_stats();
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if self.handle_command(cmd).await {
                                return;
                            }
                        }
                        None => return,
                    }
                }
                event = self.transport_rx.recv() => {
                    match event {
                        Some(event) => self.handle_transport_event(event).await,
                        None => return,
                    }
                }
                event = self.connections.poll() => {
                    match event {
                        Some(event) => self.handle_connection_event(event).await,
                        None => return,
                    }
                }
                internal = self.internal_rx.recv() => {
                    match internal {
                        Some(Internal::SyncTimeout) => self.handle_sync_timeout(),
                        Some(Internal::ReportStats) => self.report_stats().await,
                        None => return,
                    }
                }
            }
        }
    }

    /// Returns `true` once the driver should stop (only after `Destroy`).
    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Connect(reply) => {
                let result = self.connect().await;
                let _ = reply.send(result);
            }
            Command::Disconnect(reply) => {
                self.disconnect().await;
                let _ = reply.send(());
            }
            Command::Destroy(reply) => {
                self.destroy().await;
                let _ = reply.send(());
                return true;
            }
            Command::Broadcast(bytes) => self.broadcast(bytes).await,
            Command::SendToPeer(peer, bytes, reply) => {
                let ok = self.send_to_peer(&peer, bytes).await;
                let _ = reply.send(ok);
            }
            Command::SendToAuthority(bytes, reply) => {
                let _ = reply.send(self.send_to_authority(bytes));
            }
            Command::SendEphemeral(payload, to, reply) => {
                let _ = reply.send(self.send_ephemeral(payload, to.as_ref()));
            }
            Command::Ping(peer, reply) => self.ping(peer, reply),
            Command::UpdateToken(token) => self.transport.update_token(token),
            Command::SimulateNetwork(chaos) => self.chaos = chaos,
            Command::ConnectionStats(peer, reply) => {
                let _ = reply.send(self.connections.stats(&peer).await);
            }
            Command::Subscribe(listener) => self.events.subscribe_boxed(listener),
        }
        false
    }

    fn set_state(&mut self, state: LifecycleState) {
        if self.state != state {
            self.state = state;
            *self.shared.state.lock().unwrap() = state;
            self.events.emit(Event::LifecycleStateChange(state));
        }
    }

    fn sync_shared_roster(&self) {
        *self.shared.roster.lock().unwrap() = self.roster.clone();
    }

    fn sync_shared_peer_status(&self) {
        *self.shared.peer_status.lock().unwrap() = self.peer_status.clone();
    }

    async fn connect(&mut self) -> Result<(), MeshError> {
        self.set_state(LifecycleState::Initializing);
        self.set_state(LifecycleState::Connecting);
        if let Err(e) = self.transport.connect().await {
            self.set_state(LifecycleState::Error);
            self.events.emit(Event::Error(e.to_string()));
            return Err(e.into());
        }
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.cancel_sync_timeout();
        self.cancel_report_stats();
        self.transport.close();
        self.connections.close_all().await;
        self.roster.clear();
        self.peer_status.clear();
        self.sync_shared_roster();
        self.sync_shared_peer_status();
        self.set_state(LifecycleState::Disconnected);
    }

    async fn destroy(&mut self) {
        self.cancel_sync_timeout();
        self.cancel_report_stats();
        self.connections.close_all().await;
        self.transport.close();
        self.roster.clear();
        self.peer_status.clear();
        self.sync_shared_roster();
        self.sync_shared_peer_status();
    }

    async fn apply_chaos(&self) -> bool {
        let Some(chaos) = &self.chaos else { return true };
        if chaos.should_drop() {
            return false;
        }
        let delay = chaos.delay_ms();
        if delay > 0 {
            tasks::wait_ms(delay).await;
        }
        true
    }

    /// Reaches every known peer, direct channel where open, server relay
    /// otherwise. The relay leg is filtered to peers that are *not*
    /// direct, so a peer with an open channel never receives the same
    /// payload twice. Sends are blocked unless the lifecycle has reached
    /// `active`, since a peer learned via relay before hydration
    /// completes has no guarantee its own state has caught up yet.
    async fn broadcast(&mut self, bytes: Bytes) {
        if self.state != LifecycleState::Active {
            log::warn!("dropping broadcast: client is not active (state is {:?})", self.state);
            return;
        }
        if !self.apply_chaos().await {
            return;
        }
        self.connections.broadcast(bytes.clone()).await;
        for peer in self.roster.iter() {
            if !matches!(self.peer_status.get(peer), Some(PeerTransport::Direct)) {
                let _ = self
                    .transport
                    .send_signal(peer, &self.local_id, SignalPayload::Relay { data: bytes.clone() });
            }
        }
    }

    /// Direct channel if open, relay otherwise. Blocked unless the
    /// lifecycle has reached `active`.
    async fn send_to_peer(&mut self, peer: &PeerId, bytes: Bytes) -> bool {
        if self.state != LifecycleState::Active {
            log::warn!("dropping send to {peer}: client is not active (state is {:?})", self.state);
            return false;
        }
        if !self.apply_chaos().await {
            return false;
        }
        if matches!(self.peer_status.get(peer), Some(PeerTransport::Direct)) {
            self.connections.send_to_peer(peer, bytes).await
        } else if self.roster.contains(peer) {
            self.transport
                .send_signal(peer, &self.local_id, SignalPayload::Relay { data: bytes })
                .is_ok()
        } else {
            log::warn!("dropping send to unknown peer {peer}");
            false
        }
    }

    fn send_to_authority(&self, bytes: Bytes) -> Result<(), MeshError> {
        Ok(self.transport.send_payload(bytes)?)
    }

    fn send_ephemeral(&self, payload: serde_json::Value, to: Option<&PeerId>) -> Result<(), MeshError> {
        Ok(self.transport.send_ephemeral(EphemeralPayload::Json(payload), to)?)
    }

    /// Registers the pending ping and sends the `__ping__` request, then
    /// hands the wait-for-pong-or-timeout off to a detached task so the
    /// `select!` loop stays free to process the very pong that resolves
    /// it. `reply` is fulfilled by that detached task, not by this
    /// method.
    fn ping(&mut self, peer: PeerId, reply: oneshot::Sender<i64>) {
        let request_id = PeerId::random().to_string();
        let rx = self.ping_table.register(request_id.clone());
        let payload = serde_json::json!({
            "type": diagnostics::PING_TYPE,
            "request_id": request_id,
            "from": self.local_id.as_str(),
            "timestamp": diagnostics::now_ms(),
        });
        if self
            .transport
            .send_ephemeral(EphemeralPayload::Json(payload), Some(&peer))
            .is_err()
        {
            let _ = reply.send(-1);
            return;
        }
        tokio::spawn(async move {
            let latency = match tokio::time::timeout(Duration::from_secs(5), rx).await {
                Ok(Ok(latency)) => latency,
                _ => -1,
            };
            let _ = reply.send(latency);
        });
    }

    fn start_sync_timeout(&mut self) {
        self.cancel_sync_timeout();
        let tx = self.internal_tx.clone();
        self.sync_timeout_handle = Some(tokio::spawn(async move {
            tasks::wait(SYNC_TIMEOUT).await;
            let _ = tx.send(Internal::SyncTimeout);
        }));
    }

    fn cancel_sync_timeout(&mut self) {
        if let Some(handle) = self.sync_timeout_handle.take() {
            handle.abort();
        }
    }

    /// Off by default; when configured, periodically ticks
    /// [`Internal::ReportStats`] so [`ClientDriver::run`] can forward a
    /// snapshot of every connection's health to the server without the
    /// application needing to know this happens.
    fn start_report_stats(&mut self) {
        self.cancel_report_stats();
        let Some(interval) = self.report_stats_interval else { return };
        let tx = self.internal_tx.clone();
        self.report_stats_handle = Some(tokio::spawn(async move {
            use futures::StreamExt;
            let mut ticker = tasks::Interval::new(interval);
            loop {
                if ticker.next().await.is_none() {
                    return;
                }
                if tx.send(Internal::ReportStats).is_err() {
                    return;
                }
            }
        }));
    }

    fn cancel_report_stats(&mut self) {
        if let Some(handle) = self.report_stats_handle.take() {
            handle.abort();
        }
    }

    async fn report_stats(&self) {
        let mut snapshot = serde_json::Map::new();
        for peer in self.connections.peer_ids() {
            if let Some(stats) = self.connections.stats(&peer).await {
                snapshot.insert(
                    peer.to_string(),
                    serde_json::json!({
                        "signaling_state": stats.signaling_state.as_str(),
                        "channel_open": stats.channel_open,
                        "bytes_sent": stats.bytes_sent,
                        "bytes_received": stats.bytes_received,
                    }),
                );
            }
        }
        let body = serde_json::to_vec(&snapshot).unwrap_or_default();
        let _ = self.transport.send_payload(Bytes::from(body));
    }

    fn handle_sync_timeout(&mut self) {
        if self.state == LifecycleState::Syncing {
            log::debug!("sync timeout elapsed, promoting to active without an authoritative message");
            self.set_state(LifecycleState::Active);
        }
    }

    /// Promotes `handshaking`/`syncing` to `active` the first time either
    /// an authoritative server message or a direct peer message arrives,
    /// whichever comes first.
    fn maybe_promote_active(&mut self) {
        if self.state == LifecycleState::Handshaking || self.state == LifecycleState::Syncing {
            self.cancel_sync_timeout();
            self.set_state(LifecycleState::Active);
        }
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                self.set_state(LifecycleState::Handshaking);
                self.events.emit(Event::Connect);
            }
            TransportEvent::ConnectionLost { code, reason } => {
                self.transport.on_connection_lost(code, &reason);
            }
            TransportEvent::Disconnected { intentional } => {
                self.cancel_sync_timeout();
                if intentional {
                    self.set_state(LifecycleState::Disconnected);
                } else {
                    self.set_state(LifecycleState::Reconnecting);
                }
                self.events.emit(Event::Disconnect);
            }
            TransportEvent::GaveUp => {
                self.set_state(LifecycleState::Error);
                self.events.emit(Event::Error("reconnect attempts exhausted".to_string()));
            }
            TransportEvent::ReconnectDue => {
                if let Err(e) = self.transport.connect().await {
                    self.set_state(LifecycleState::Error);
                    self.events.emit(Event::Error(e.to_string()));
                }
            }
            TransportEvent::Error(message) => {
                self.events.emit(Event::Error(message));
            }
            TransportEvent::Signal(envelope) => self.handle_signal(envelope).await,
            TransportEvent::Presence { peers } => self.handle_presence(peers).await,
            TransportEvent::Init(value) => {
                log::debug!("received init payload: {value}");
                if self.state == LifecycleState::Handshaking {
                    self.set_state(LifecycleState::Syncing);
                    self.start_sync_timeout();
                }
            }
            TransportEvent::Ephemeral(value) => self.handle_ephemeral(value),
            TransportEvent::ServerMessage(bytes) => {
                self.maybe_promote_active();
                self.events.emit(Event::AuthorityMessage(bytes));
            }
        }
    }

    fn handle_ephemeral(&mut self, value: serde_json::Value) {
        match value.get("type").and_then(|t| t.as_str()) {
            Some(diagnostics::PING_TYPE) => {
                let (Some(request_id), Some(from)) = (
                    value.get("request_id").and_then(|v| v.as_str()),
                    value.get("from").and_then(|v| v.as_str()),
                ) else {
                    return;
                };
                let echoed_timestamp = value.get("timestamp").and_then(|v| v.as_i64()).unwrap_or(diagnostics::now_ms());
                let reply = serde_json::json!({
                    "type": diagnostics::PONG_TYPE,
                    "request_id": request_id,
                    "timestamp": echoed_timestamp,
                });
                let _ = self
                    .transport
                    .send_ephemeral(EphemeralPayload::Json(reply), Some(&PeerId::from(from)));
            }
            Some(diagnostics::PONG_TYPE) => {
                let Some(request_id) = value.get("request_id").and_then(|v| v.as_str()) else {
                    return;
                };
                let sent_at = value.get("timestamp").and_then(|v| v.as_i64()).unwrap_or(diagnostics::now_ms());
                let latency = (diagnostics::now_ms() - sent_at).max(0);
                self.ping_table.resolve(request_id, latency);
            }
            _ => self.events.emit(Event::Ephemeral(value)),
        }
    }

    async fn handle_presence(&mut self, peers: Vec<PeerId>) {
        let new_set: HashSet<PeerId> = peers.into_iter().filter(|p| *p != self.local_id).collect();
        let joined: Vec<PeerId> = new_set.difference(&self.roster).cloned().collect();
        let left: Vec<PeerId> = self.roster.difference(&new_set).cloned().collect();

        if let Some((topology, reason)) = self.topology.update(new_set.len()) {
            self.events.emit(Event::TopologyChange(topology, reason));
        }

        for peer in joined {
            self.peer_status.insert(peer.clone(), PeerTransport::Relay);
            self.events.emit(Event::PeerJoin(peer.clone()));
            if self.topology.effective() == Topology::Mesh && self.local_id.initiates_over(&peer) {
                if let Err(e) = self.connections.initiate_connection(peer.clone()).await {
                    log::warn!("failed to initiate connection to {peer}: {e}");
                }
            }
        }
        for peer in left {
            self.connections.close_peer(&peer).await;
            self.peer_status.remove(&peer);
            self.events.emit(Event::PeerDisconnect(peer));
        }
        self.roster = new_set;
        self.sync_shared_roster();
        self.sync_shared_peer_status();

        if self.state == LifecycleState::Handshaking {
            self.set_state(LifecycleState::Syncing);
            self.start_sync_timeout();
        }
    }

    async fn handle_signal(&mut self, envelope: crate::codec::SignalEnvelope) {
        let from = envelope.from_peer();
        if from == self.local_id {
            return;
        }
        match envelope.payload {
            SignalPayload::Join { .. } => {
                if self.roster.insert(from.clone()) {
                    self.peer_status.insert(from.clone(), PeerTransport::Relay);
                    self.sync_shared_roster();
                    self.sync_shared_peer_status();
                    self.events.emit(Event::PeerJoin(from.clone()));
                    if self.topology.effective() == Topology::Mesh && self.local_id.initiates_over(&from) {
                        if let Err(e) = self.connections.initiate_connection(from.clone()).await {
                            log::warn!("failed to initiate connection to {from}: {e}");
                        }
                    }
                }
            }
            SignalPayload::Offer { sdp } => {
                if let Err(e) = self.connections.handle_offer(from.clone(), sdp).await {
                    log::warn!("failed to handle offer from {from}: {e}");
                }
            }
            SignalPayload::Answer { sdp } => {
                if let Err(e) = self.connections.handle_answer(from.clone(), sdp).await {
                    log::warn!("failed to handle answer from {from}: {e}");
                }
            }
            SignalPayload::Candidate {
                candidate,
                sdp_mid,
                sdp_m_line_index,
            } => {
                self.connections.handle_candidate(from, candidate, sdp_mid, sdp_m_line_index).await;
            }
            SignalPayload::Relay { data } => {
                self.maybe_promote_active();
                self.events.emit(Event::Message(from, data));
            }
        }
    }

    async fn handle_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::PeerJoin { peer } => {
                self.peer_status.insert(peer.clone(), PeerTransport::Direct);
                self.sync_shared_peer_status();
                self.events.emit(Event::PeerStatus(peer.clone(), PeerTransport::Direct));
                self.events.emit(Event::PeerJoin(peer));
            }
            ConnectionEvent::PeerDisconnect { peer } => {
                if self.roster.contains(&peer) {
                    self.peer_status.insert(peer.clone(), PeerTransport::Relay);
                    self.sync_shared_peer_status();
                    self.events.emit(Event::PeerStatus(peer, PeerTransport::Relay));
                }
            }
            ConnectionEvent::Message { peer, bytes } => {
                self.maybe_promote_active();
                self.events.emit(Event::Message(peer, bytes));
            }
            ConnectionEvent::Error { peer, message } => {
                self.events.emit(Event::Error(format!("connection error with {peer}: {message}")));
            }
            ConnectionEvent::LocalOffer { peer, sdp } => {
                let _ = self.transport.send_signal(&peer, &self.local_id, SignalPayload::Offer { sdp });
            }
            ConnectionEvent::LocalAnswer { peer, sdp } => {
                let _ = self.transport.send_signal(&peer, &self.local_id, SignalPayload::Answer { sdp });
            }
            ConnectionEvent::LocalCandidate {
                peer,
                candidate,
                sdp_mid,
                sdp_m_line_index,
            } => {
                let _ = self.transport.send_signal(
                    &peer,
                    &self.local_id,
                    SignalPayload::Candidate {
                        candidate,
                        sdp_mid,
                        sdp_m_line_index,
                    },
                );
            }
            ConnectionEvent::Closed { .. } | ConnectionEvent::ChannelOpen { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_workspace_id_is_rejected_at_construction() {
        let config = ClientConfig::new("", Credential::Static("tok".to_string()));
        assert!(matches!(Client::new(config), Err(MeshError::MissingWorkspaceId)));
    }

    #[test]
    fn missing_credential_is_rejected_at_construction() {
        let config = ClientConfig::new("workspace", Credential::Static(String::new()));
        assert!(matches!(Client::new(config), Err(MeshError::MissingCredentials)));
    }

    #[test]
    fn valid_config_constructs_idle_client() {
        let config = ClientConfig::new("workspace", Credential::Static("tok".to_string()));
        let (client, _driver) = Client::new(config).unwrap();
        assert_eq!(client.lifecycle_state(), LifecycleState::Idle);
        assert!(client.get_peers().is_empty());
        assert!(!client.can_send());
    }

    #[test]
    fn default_config_refreshes_peer_list_but_does_not_report_stats() {
        let config = ClientConfig::new("workspace", Credential::Static("tok".to_string()));
        assert_eq!(config.peer_list_refresh_interval, Some(Duration::from_secs(10)));
        assert_eq!(config.report_stats_interval, None);
    }

    #[test]
    fn report_stats_interval_builder_is_applied() {
        let config = ClientConfig::new("workspace", Credential::Static("tok".to_string())).report_stats_interval(Some(Duration::from_secs(5)));
        let (_client, driver) = Client::new(config).unwrap();
        assert_eq!(driver.report_stats_interval, Some(Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn connection_stats_is_none_once_driver_is_dropped() {
        let config = ClientConfig::new("workspace", Credential::Static("tok".to_string()));
        let (client, driver) = Client::new(config).unwrap();
        drop(driver);
        assert!(client.get_connection_stats(&PeerId::from("ghost")).await.is_none());
    }

    #[tokio::test]
    async fn sends_are_rejected_before_active() {
        let config = ClientConfig::new("workspace", Credential::Static("tok".to_string()));
        let (client, driver) = Client::new(config).unwrap();
        let handle = tokio::spawn(driver.run());
        assert!(!client.send_to_peer(&PeerId::from("ghost"), Bytes::from_static(b"hi")).await);
        client.destroy().await;
        let _ = handle.await;
    }
}
