use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::client::Credential;
use crate::codec::{self, Frame, SignalEnvelope, SignalPayload};
use crate::error::TransportError;
use crate::identity::{PeerId, SERVER_ID};
use crate::tasks::{self, Backoff};

/// Normal-closure WebSocket codes that never trigger a reconnect.
const NORMAL_CLOSURE: [u16; 2] = [1000, 1001];
/// Close code this transport uses for a heartbeat timeout.
const HEARTBEAT_TIMEOUT_CODE: u16 = 4000;

#[derive(Debug, Clone, Copy)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    pub missed_ceiling: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1000),
            missed_ceiling: 3,
        }
    }
}

/// Everything the transport reports to its owner: the documented
/// `onX` inbound-dispatch callbacks, plus a handful of internal driver
/// signals (`ConnectionLost`, `ReconnectDue`,
/// `GaveUp`) that exist only because reconnection here is modeled as the
/// owning [`crate::client::Client`] reacting to timer/socket events
/// rather than the transport recursively calling itself from a spawned
/// task.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Channel open and `Join` sent.
    Connected,
    /// The underlying socket went away; not yet classified as
    /// intentional or not.
    ConnectionLost { code: u16, reason: String },
    /// Classified result of a [`TransportEvent::ConnectionLost`]: either
    /// the close was requested via [`SignalingTransport::close`], or it
    /// wasn't and a reconnect has been scheduled.
    Disconnected { intentional: bool },
    /// Reconnect attempts exhausted: at most 10.
    GaveUp,
    /// A scheduled reconnect delay elapsed; the owner should call
    /// [`SignalingTransport::connect`] again.
    ReconnectDue,
    Error(String),
    Signal(SignalEnvelope),
    /// The complete set of peers the server currently considers online in
    /// this workspace. Sent as a full snapshot rather than incremental
    /// online/offline deltas, so the owner diffs it against its own
    /// roster to derive joins and departures.
    Presence { peers: Vec<PeerId> },
    Init(serde_json::Value),
    Ephemeral(serde_json::Value),
    ServerMessage(Bytes),
}

enum WireCommand {
    Binary(Vec<u8>),
    Text(String),
    Ping,
    Pong(Vec<u8>),
    Close { code: u16, reason: String },
}

pub struct SignalingTransport {
    base_url: String,
    workspace_id: String,
    credential: Credential,
    heartbeat: HeartbeatConfig,
    list_refresh_interval: Option<Duration>,
    backoff: Backoff,
    attempt: u32,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    cmd_tx: Option<mpsc::UnboundedSender<WireCommand>>,
    intentional_close: Arc<AtomicBool>,
    missed_pongs: Arc<AtomicU32>,
    generation: Arc<AtomicU32>,
    reconnect_handle: Option<JoinHandle<()>>,
    heartbeat_handle: Option<JoinHandle<()>>,
    list_refresh_handle: Option<JoinHandle<()>>,
}

/// Default period for the peer-list liveness refresh: independent of
/// presence push notifications, in case one is missed.
const DEFAULT_LIST_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

impl SignalingTransport {
    pub fn new(
        base_url: String,
        workspace_id: String,
        credential: Credential,
        heartbeat: HeartbeatConfig,
        events_tx: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        Self {
            base_url,
            workspace_id,
            credential,
            heartbeat,
            list_refresh_interval: Some(DEFAULT_LIST_REFRESH_INTERVAL),
            backoff: Backoff::reconnect_policy(),
            attempt: 0,
            events_tx,
            cmd_tx: None,
            intentional_close: Arc::new(AtomicBool::new(false)),
            missed_pongs: Arc::new(AtomicU32::new(0)),
            generation: Arc::new(AtomicU32::new(0)),
            reconnect_handle: None,
            heartbeat_handle: None,
            list_refresh_handle: None,
        }
    }

    /// Overrides the peer-list refresh period; `None` disables it. Takes
    /// effect on the next `connect()`.
    pub fn set_list_refresh_interval(&mut self, interval: Option<Duration>) {
        self.list_refresh_interval = interval;
    }

    pub fn update_token(&mut self, token: String) {
        self.credential = Credential::Static(token);
    }

    async fn resolve_token(&self) -> String {
        match &self.credential {
            Credential::Static(token) => token.clone(),
            Credential::Provider(provider) => match provider().await {
                Ok(token) => token,
                Err(e) => {
                    log::warn!("token provider failed, proceeding unauthenticated: {e}");
                    String::new()
                }
            },
        }
    }

    fn build_url(&self, token: &str) -> String {
        let mut url = self.base_url.trim_end_matches('/').to_string();
        let suffix = format!("/{}", self.workspace_id);
        if !url.ends_with(&suffix) {
            url.push_str(&suffix);
        }
        let separator = if url.contains('?') { '&' } else { '?' };
        format!("{url}{separator}token={token}")
    }

    /// Opens the channel: resolves the bearer
    /// token, opens the socket, sends `Join`, and reports `Connected`.
    pub async fn connect(&mut self) -> Result<(), TransportError> {
        self.intentional_close.store(false, Ordering::SeqCst);
        let token = self.resolve_token().await;
        let url = self.build_url(&token);
        log::debug!("connecting to signaling server at {url}");

        let (ws, _) = connect_async(url).await?;
        let (write, read) = ws.split();

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        self.cmd_tx = Some(cmd_tx.clone());
        self.attempt = 0;
        self.missed_pongs.store(0, Ordering::SeqCst);

        spawn_writer(write, cmd_rx);
        spawn_reader(read, self.events_tx.clone(), Arc::clone(&self.missed_pongs));
        self.spawn_heartbeat(generation);
        self.spawn_list_refresh(generation);

        self.send_binary_frame(&Frame::Signal(SignalEnvelope::new(
            SERVER_ID,
            "",
            SignalPayload::Join {
                workspace_id: self.workspace_id.clone(),
            },
        )))?;
        let _ = self.events_tx.send(TransportEvent::Connected);
        Ok(())
    }

    fn spawn_heartbeat(&mut self, generation: u32) {
        if let Some(handle) = self.heartbeat_handle.take() {
            handle.abort();
        }
        let interval = self.heartbeat.interval;
        let ceiling = self.heartbeat.missed_ceiling;
        let cmd_tx = self.cmd_tx.clone();
        let missed = Arc::clone(&self.missed_pongs);
        let current_generation = Arc::clone(&self.generation);
        self.heartbeat_handle = Some(tokio::spawn(async move {
            let mut ticker = tasks::Interval::new(interval);
            loop {
                if ticker.next().await.is_none() {
                    return;
                }
                if current_generation.load(Ordering::SeqCst) != generation {
                    return;
                }
                let Some(cmd_tx) = cmd_tx.as_ref() else { return };
                if cmd_tx.send(WireCommand::Ping).is_err() {
                    return;
                }
                if missed.fetch_add(1, Ordering::SeqCst) + 1 >= ceiling {
                    log::warn!("heartbeat timeout after {ceiling} missed pongs");
                    let _ = cmd_tx.send(WireCommand::Close {
                        code: HEARTBEAT_TIMEOUT_CODE,
                        reason: "Heartbeat Timeout".to_string(),
                    });
                    return;
                }
            }
        }));
    }

    /// Liveness measure independent of presence push notifications: a
    /// push-only model is fragile against a missed notification, so this
    /// periodically re-requests the roster from the server regardless.
    fn spawn_list_refresh(&mut self, generation: u32) {
        if let Some(handle) = self.list_refresh_handle.take() {
            handle.abort();
        }
        let Some(interval) = self.list_refresh_interval else { return };
        let cmd_tx = self.cmd_tx.clone();
        let current_generation = Arc::clone(&self.generation);
        self.list_refresh_handle = Some(tokio::spawn(async move {
            let mut ticker = tasks::Interval::new(interval);
            loop {
                if ticker.next().await.is_none() {
                    return;
                }
                if current_generation.load(Ordering::SeqCst) != generation {
                    return;
                }
                let Some(cmd_tx) = cmd_tx.as_ref() else { return };
                let Ok(bytes) = codec::encode(&Frame::Sync(Bytes::from_static(br#"{"request":"list_peers"}"#))) else {
                    return;
                };
                if cmd_tx.send(WireCommand::Binary(bytes)).is_err() {
                    return;
                }
            }
        }));
    }

    /// Marks the close intentional, cancels any
    /// pending reconnect, closes the channel.
    pub fn close(&mut self) {
        self.intentional_close.store(true, Ordering::SeqCst);
        if let Some(handle) = self.reconnect_handle.take() {
            handle.abort();
        }
        if let Some(handle) = self.heartbeat_handle.take() {
            handle.abort();
        }
        if let Some(handle) = self.list_refresh_handle.take() {
            handle.abort();
        }
        if let Some(cmd_tx) = self.cmd_tx.take() {
            let _ = cmd_tx.send(WireCommand::Close {
                code: 1000,
                reason: "client disconnect".to_string(),
            });
        }
    }

    /// Classifies a [`TransportEvent::ConnectionLost`] and either
    /// schedules a reconnect or reports that attempts are exhausted.
    pub fn on_connection_lost(&mut self, code: u16, _reason: &str) {
        self.cmd_tx = None;
        if self.intentional_close.load(Ordering::SeqCst) {
            let _ = self.events_tx.send(TransportEvent::Disconnected { intentional: true });
            return;
        }
        if NORMAL_CLOSURE.contains(&code) {
            let _ = self.events_tx.send(TransportEvent::Disconnected { intentional: true });
            return;
        }
        match self.backoff.delay_for(self.attempt) {
            Some(delay) => {
                self.attempt += 1;
                self.schedule_reconnect(delay);
                let _ = self.events_tx.send(TransportEvent::Disconnected { intentional: false });
            }
            None => {
                let _ = self.events_tx.send(TransportEvent::GaveUp);
            }
        }
    }

    fn schedule_reconnect(&mut self, delay: Duration) {
        if let Some(handle) = self.reconnect_handle.take() {
            handle.abort();
        }
        let events_tx = self.events_tx.clone();
        self.reconnect_handle = Some(tokio::spawn(async move {
            tasks::wait(delay).await;
            let _ = events_tx.send(TransportEvent::ReconnectDue);
        }));
    }

    fn send_binary_frame(&self, frame: &Frame) -> Result<(), TransportError> {
        let Some(cmd_tx) = self.cmd_tx.as_ref() else {
            log::warn!("dropping outbound frame: signaling channel is not connected");
            return Ok(());
        };
        let bytes = codec::encode(frame)?;
        let _ = cmd_tx.send(WireCommand::Binary(bytes));
        Ok(())
    }

    /// Forwards a signaling payload addressed to a specific peer.
    pub fn send_signal(&self, to: &PeerId, from: &PeerId, payload: SignalPayload) -> Result<(), TransportError> {
        self.send_binary_frame(&Frame::Signal(SignalEnvelope::new(to.as_str(), from.as_str(), payload)))
    }

    /// An opaque binary payload addressed to the authoritative server,
    /// framed as `Sync` (symmetric with the inbound `onServerMessage`
    /// dispatch for the same frame type).
    pub fn send_payload(&self, bytes: Bytes) -> Result<(), TransportError> {
        self.send_binary_frame(&Frame::Sync(bytes))
    }

    /// JSON text for structured payloads, raw binary for byte payloads.
    /// Neither shape has a binary-schema entry, so a structured payload
    /// is sent using the same `{type, ...}` shape the legacy codec
    /// parses inbound, and a byte payload is sent as an unwrapped
    /// binary WebSocket message.
    pub fn send_ephemeral(&self, payload: EphemeralPayload, to: Option<&PeerId>) -> Result<(), TransportError> {
        let Some(cmd_tx) = self.cmd_tx.as_ref() else {
            log::warn!("dropping ephemeral payload: signaling channel is not connected");
            return Ok(());
        };
        match payload {
            EphemeralPayload::Json(value) => {
                #[derive(serde::Serialize)]
                struct Outbound<'a> {
                    r#type: &'static str,
                    data: &'a serde_json::Value,
                    #[serde(skip_serializing_if = "Option::is_none")]
                    to: Option<&'a str>,
                }
                let text = serde_json::to_string(&Outbound {
                    r#type: "ephemeral",
                    data: &value,
                    to: to.map(PeerId::as_str),
                })
                .map_err(crate::error::CodecError::from)?;
                let _ = cmd_tx.send(WireCommand::Text(text));
            }
            EphemeralPayload::Bytes(bytes) => {
                let _ = cmd_tx.send(WireCommand::Binary(bytes.to_vec()));
            }
        }
        Ok(())
    }
}

/// Either form `sendEphemeral` accepts.
#[derive(Debug, Clone)]
pub enum EphemeralPayload {
    Json(serde_json::Value),
    Bytes(Bytes),
}

fn spawn_writer(
    mut write: futures::stream::SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>,
    mut cmd_rx: mpsc::UnboundedReceiver<WireCommand>,
) {
    tokio::spawn(async move {
        while let Some(cmd) = cmd_rx.recv().await {
            let message = match cmd {
                WireCommand::Binary(bytes) => Message::Binary(bytes.into()),
                WireCommand::Text(text) => Message::Text(text.into()),
                WireCommand::Ping => Message::Ping(vec![0u8].into()),
                WireCommand::Pong(payload) => Message::Pong(payload.into()),
                WireCommand::Close { code, reason } => Message::Close(Some(CloseFrame {
                    code: CloseCode::from(code),
                    reason: reason.into(),
                })),
            };
            let is_close = matches!(message, Message::Close(_));
            if let Err(e) = write.send(message).await {
                log::debug!("error writing to signaling socket: {e}");
                return;
            }
            if is_close {
                let _ = write.close().await;
                return;
            }
        }
    });
}

fn spawn_reader(
    mut read: futures::stream::SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    missed_pongs: Arc<AtomicU32>,
) {
    tokio::spawn(async move {
        loop {
            match read.next().await {
                Some(Ok(Message::Binary(data))) => match codec::decode(&data) {
                    Some(Frame::Signal(envelope)) => {
                        let _ = events_tx.send(TransportEvent::Signal(envelope));
                    }
                    Some(Frame::Sync(bytes)) | Some(Frame::Op(bytes)) => {
                        let _ = events_tx.send(TransportEvent::ServerMessage(bytes));
                    }
                    None => {}
                },
                Some(Ok(Message::Text(text))) => dispatch_legacy_text(&text, &events_tx),
                Some(Ok(Message::Pong(_))) => {
                    missed_pongs.store(0, Ordering::SeqCst);
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.to_string()))
                        .unwrap_or((1006, "connection closed".to_string()));
                    let _ = events_tx.send(TransportEvent::ConnectionLost { code, reason });
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    let _ = events_tx.send(TransportEvent::ConnectionLost {
                        code: 1006,
                        reason: e.to_string(),
                    });
                    return;
                }
                None => {
                    let _ = events_tx.send(TransportEvent::ConnectionLost {
                        code: 1006,
                        reason: "stream ended".to_string(),
                    });
                    return;
                }
            }
        }
    });
}

fn dispatch_legacy_text(text: &str, events_tx: &mpsc::UnboundedSender<TransportEvent>) {
    use crate::codec::legacy::{self, LegacyMessage};

    let Some(message) = legacy::decode(text) else {
        return;
    };
    match message {
        LegacyMessage::Presence { peers } => {
            let _ = events_tx.send(TransportEvent::Presence {
                peers: peers.into_iter().map(PeerId::from).collect(),
            });
        }
        LegacyMessage::Init { workspace_id, peer_id } => {
            let _ = events_tx.send(TransportEvent::Init(serde_json::json!({
                "workspace_id": workspace_id,
                "peer_id": peer_id,
            })));
        }
        LegacyMessage::Signal { to, from, payload } => match serde_json::from_value::<SignalPayload>(payload) {
            Ok(payload) => {
                let _ = events_tx.send(TransportEvent::Signal(SignalEnvelope::new(to, from, payload)));
            }
            Err(e) => log::warn!("dropping legacy signal with unrecognized payload shape: {e}"),
        },
        LegacyMessage::Ephemeral { data } => {
            let _ = events_tx.send(TransportEvent::Ephemeral(data));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport() -> SignalingTransport {
        let (tx, _rx) = mpsc::unbounded_channel();
        SignalingTransport::new(
            "wss://example.test/ws".to_string(),
            "workspace-1".to_string(),
            Credential::Static("tok".to_string()),
            HeartbeatConfig::default(),
            tx,
        )
    }

    #[test]
    fn build_url_appends_workspace_and_token_once() {
        let t = transport();
        assert_eq!(t.build_url("abc"), "wss://example.test/ws/workspace-1?token=abc");
    }

    #[test]
    fn build_url_is_idempotent_on_workspace_segment() {
        let mut t = transport();
        t.base_url = "wss://example.test/ws/workspace-1".to_string();
        assert_eq!(t.build_url("abc"), "wss://example.test/ws/workspace-1?token=abc");
    }

    #[test]
    fn list_refresh_interval_defaults_to_ten_seconds() {
        let t = transport();
        assert_eq!(t.list_refresh_interval, Some(DEFAULT_LIST_REFRESH_INTERVAL));
    }

    #[test]
    fn list_refresh_interval_can_be_overridden_or_disabled() {
        let mut t = transport();
        t.set_list_refresh_interval(Some(Duration::from_secs(30)));
        assert_eq!(t.list_refresh_interval, Some(Duration::from_secs(30)));
        t.set_list_refresh_interval(None);
        assert_eq!(t.list_refresh_interval, None);
    }

    #[tokio::test]
    async fn spawn_list_refresh_is_a_noop_when_disabled() {
        let mut t = transport();
        t.set_list_refresh_interval(None);
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
        t.cmd_tx = Some(cmd_tx);
        t.spawn_list_refresh(1);
        assert!(t.list_refresh_handle.is_none());
        assert!(cmd_rx.try_recv().is_err());
    }
}
