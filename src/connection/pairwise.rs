//! A single pairwise connection.
//!
//! Wraps one `webrtc::peer_connection::RTCPeerConnection`, the same crate
//! `flarch::web_rtc::libc::web_rtc_setup::WebRTCConnectionSetupLibc` builds
//! its connections on. That file threads connection state back to its
//! owner through a `Broker`; here the owning [`super::manager::ConnectionManager`]
//! is not itself an actor, so the `on_*` closures push
//! [`super::manager::ConnectionEvent`]s onto a plain `mpsc` channel instead.
//!
//! The signaling-state names (`stable` / `have-local-offer` /
//! `have-remote-offer` / `closed`) follow the WebRTC signaling state
//! machine directly rather than collapsing to a simplified
//! `SignalingState::{Closed,Setup,Stable}` — glare resolution needs to
//! distinguish "offer sent" from "offer received" to decide who rolls
//! back, which a three-state version can't express.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::lock::Mutex as AsyncMutex;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice::mdns::MulticastDnsMode;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::connection::manager::ConnectionEvent;
use crate::error::ConnectionError;
use crate::identity::PeerId;

/// The standard WebRTC signaling negotiation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

impl SignalingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalingState::Stable => "stable",
            SignalingState::HaveLocalOffer => "have-local-offer",
            SignalingState::HaveRemoteOffer => "have-remote-offer",
            SignalingState::Closed => "closed",
        }
    }
}

fn session_description(sdp_type: RTCSdpType, sdp: &str) -> Result<RTCSessionDescription, ConnectionError> {
    let sdp_escaped = sdp.replace('\\', "\\\\").replace('\n', "\\n").replace('\r', "\\r");
    let json = format!(r#"{{"type":"{sdp_type}","sdp":"{sdp_escaped}"}}"#);
    serde_json::from_str(&json).map_err(|e| ConnectionError::InvalidState(e.to_string()))
}

async fn build_peer_connection(ice_servers: &[String]) -> anyhow::Result<RTCPeerConnection> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    let mut setting_engine = SettingEngine::default();
    setting_engine.set_ice_multicast_dns_mode(MulticastDnsMode::Disabled);

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .with_setting_engine(setting_engine)
        .build();

    let config = RTCConfiguration {
        ice_servers: ice_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    };

    Ok(api.new_peer_connection(config).await?)
}

/// Data channel label used for the single logical channel every pairwise
/// connection carries; only one logical channel is ever used per peer.
pub const DATA_CHANNEL_LABEL: &str = "mesh";

pub struct PairwiseConnection {
    pub(crate) peer: PeerId,
    pc: RTCPeerConnection,
    pub(crate) signaling_state: SignalingState,
    pub(crate) remote_description_installed: bool,
    pub(crate) pending_candidates: Vec<RTCIceCandidateInit>,
    data_channel: Arc<AsyncMutex<Option<Arc<RTCDataChannel>>>>,
    pub(crate) join_fired: bool,
    generation: Arc<AtomicU64>,
    bytes_sent: Arc<AtomicU64>,
    bytes_received: Arc<AtomicU64>,
}

/// A point-in-time snapshot of one pairwise connection's health, modeled
/// on the per-connection counters the signaling server's stats report
/// carries. Returned by [`super::manager::ConnectionManager::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStats {
    pub signaling_state: SignalingState,
    pub channel_open: bool,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl PairwiseConnection {
    pub async fn new(
        peer: PeerId,
        ice_servers: &[String],
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> anyhow::Result<Self> {
        let pc = build_peer_connection(ice_servers).await?;
        let generation = Arc::new(AtomicU64::new(0));

        let mut conn = Self {
            peer,
            pc,
            signaling_state: SignalingState::Stable,
            remote_description_installed: false,
            pending_candidates: Vec::new(),
            data_channel: Arc::new(AsyncMutex::new(None)),
            join_fired: false,
            generation,
            bytes_sent: Arc::new(AtomicU64::new(0)),
            bytes_received: Arc::new(AtomicU64::new(0)),
        };
        conn.register_connection_callbacks(events);
        Ok(conn)
    }

    fn register_connection_callbacks(&mut self, events: mpsc::UnboundedSender<ConnectionEvent>) {
        let peer = self.peer.clone();
        let gen = Arc::clone(&self.generation);
        let gen_at_registration = gen.load(Ordering::SeqCst);
        let events_ice = events.clone();
        self.pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            if gen.load(Ordering::SeqCst) != gen_at_registration {
                return Box::pin(async {});
            }
            let peer = peer.clone();
            let events_ice = events_ice.clone();
            Box::pin(async move {
                if let Some(candidate) = candidate {
                    match candidate.to_json() {
                        Ok(init) => {
                            let _ = events_ice.send(ConnectionEvent::LocalCandidate {
                                peer,
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid.unwrap_or_default(),
                                sdp_m_line_index: init.sdp_mline_index.unwrap_or_default() as u32,
                            });
                        }
                        Err(e) => log::warn!("failed to serialize local ICE candidate: {e}"),
                    }
                }
            })
        }));

        let peer = self.peer.clone();
        let gen = Arc::clone(&self.generation);
        self.pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            if gen.load(Ordering::SeqCst) != gen_at_registration {
                return Box::pin(async {});
            }
            log::trace!("peer connection state for {peer} changed to {state}");
            if matches!(state, RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed | RTCPeerConnectionState::Disconnected) {
                let _ = events.send(ConnectionEvent::Closed { peer: peer.clone() });
            }
            Box::pin(async {})
        }));
    }

    fn register_data_channel(&mut self, dc: Arc<RTCDataChannel>, events: mpsc::UnboundedSender<ConnectionEvent>) {
        let peer = self.peer.clone();
        let events_open = events.clone();
        let data_channel = Arc::clone(&self.data_channel);
        let dc_for_open = Arc::clone(&dc);
        dc.on_open(Box::new(move || {
            let peer = peer.clone();
            let events_open = events_open.clone();
            let data_channel = Arc::clone(&data_channel);
            let dc_for_open = Arc::clone(&dc_for_open);
            Box::pin(async move {
                data_channel.lock().await.replace(dc_for_open);
                let _ = events_open.send(ConnectionEvent::ChannelOpen { peer });
            })
        }));

        let peer = self.peer.clone();
        let bytes_received = Arc::clone(&self.bytes_received);
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let peer = peer.clone();
            let events = events.clone();
            bytes_received.fetch_add(msg.data.len() as u64, Ordering::SeqCst);
            Box::pin(async move {
                let _ = events.send(ConnectionEvent::Message {
                    peer,
                    bytes: Bytes::from(msg.data.to_vec()),
                });
            })
        }));

        let peer = self.peer.clone();
        dc.on_close(Box::new(move || {
            log::trace!("data channel to {peer} closed");
            Box::pin(async {})
        }));
    }

    /// Produces a local offer, installs it, and opens the `mesh` data
    /// channel.
    pub async fn create_offer(&mut self, events: mpsc::UnboundedSender<ConnectionEvent>) -> anyhow::Result<String> {
        let dc = self.pc.create_data_channel(DATA_CHANNEL_LABEL, None).await?;
        self.register_data_channel(dc, events);

        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        self.signaling_state = SignalingState::HaveLocalOffer;
        Ok(offer.sdp)
    }

    /// Installs a remote offer, rolling back any local offer first if a
    /// glare has occurred.
    pub async fn accept_offer(&mut self, sdp: &str, events: mpsc::UnboundedSender<ConnectionEvent>) -> Result<String, ConnectionError> {
        if self.signaling_state == SignalingState::HaveLocalOffer {
            log::debug!("glare detected with {}: rolling back local offer", self.peer);
            let rollback = session_description(RTCSdpType::Rollback, "")?;
            self.pc.set_local_description(rollback).await.map_err(|e| ConnectionError::InvalidState(e.to_string()))?;
        }

        let desc = session_description(RTCSdpType::Offer, sdp)?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|e| ConnectionError::InvalidState(e.to_string()))?;
        self.remote_description_installed = true;
        self.signaling_state = SignalingState::HaveRemoteOffer;
        self.drain_pending_candidates().await;

        let events_dc = events.clone();
        let peer = self.peer.clone();
        let data_channel = Arc::clone(&self.data_channel);
        let bytes_received = Arc::clone(&self.bytes_received);
        self.pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            log::trace!("incoming data channel {} from {peer}", dc.label());
            let events_dc = events_dc.clone();
            let peer = peer.clone();
            let data_channel = Arc::clone(&data_channel);
            let bytes_received = Arc::clone(&bytes_received);
            Box::pin(async move {
                let events_open = events_dc.clone();
                let peer_open = peer.clone();
                let dc_for_open = Arc::clone(&dc);
                dc.on_open(Box::new(move || {
                    let peer_open = peer_open.clone();
                    let events_open = events_open.clone();
                    let data_channel = Arc::clone(&data_channel);
                    let dc_for_open = Arc::clone(&dc_for_open);
                    Box::pin(async move {
                        data_channel.lock().await.replace(dc_for_open);
                        let _ = events_open.send(ConnectionEvent::ChannelOpen { peer: peer_open });
                    })
                }));
                let peer_msg = peer.clone();
                let bytes_received = Arc::clone(&bytes_received);
                dc.on_message(Box::new(move |msg: DataChannelMessage| {
                    let peer_msg = peer_msg.clone();
                    let events_dc = events_dc.clone();
                    bytes_received.fetch_add(msg.data.len() as u64, Ordering::SeqCst);
                    Box::pin(async move {
                        let _ = events_dc.send(ConnectionEvent::Message {
                            peer: peer_msg,
                            bytes: Bytes::from(msg.data.to_vec()),
                        });
                    })
                }));
            })
        }));

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| ConnectionError::InvalidState(e.to_string()))?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|e| ConnectionError::InvalidState(e.to_string()))?;
        self.signaling_state = SignalingState::Stable;
        Ok(answer.sdp)
    }

    /// Installs a remote answer. Callers must
    /// have already checked `signaling_state == HaveLocalOffer`.
    pub async fn accept_answer(&mut self, sdp: &str) -> Result<(), ConnectionError> {
        let desc = session_description(RTCSdpType::Answer, sdp)?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|e| ConnectionError::InvalidState(e.to_string()))?;
        self.remote_description_installed = true;
        self.signaling_state = SignalingState::Stable;
        self.drain_pending_candidates().await;
        Ok(())
    }

    async fn drain_pending_candidates(&mut self) {
        for candidate in self.pending_candidates.drain(..) {
            if let Err(e) = self.pc.add_ice_candidate(candidate).await {
                log::warn!("error applying buffered candidate for {}: {e}", self.peer);
            }
        }
    }

    /// Applies or buffers an inbound candidate.
    pub async fn add_candidate(&mut self, candidate: String, sdp_mid: String, sdp_m_line_index: u32) {
        let init = RTCIceCandidateInit {
            candidate,
            sdp_mid: Some(sdp_mid),
            sdp_mline_index: Some(sdp_m_line_index as u16),
            ..Default::default()
        };
        if self.remote_description_installed {
            if let Err(e) = self.pc.add_ice_candidate(init).await {
                log::warn!("error applying candidate for {}: {e}", self.peer);
            }
        } else {
            self.pending_candidates.push(init);
        }
    }

    pub async fn is_open(&self) -> bool {
        self.data_channel.lock().await.is_some()
    }

    pub async fn send(&self, bytes: Bytes) -> bool {
        let guard = self.data_channel.lock().await;
        if let Some(dc) = guard.as_ref() {
            if let Err(e) = dc.send(&bytes).await {
                log::warn!("error sending on data channel to {}: {e}", self.peer);
                return false;
            }
            self.bytes_sent.fetch_add(bytes.len() as u64, Ordering::SeqCst);
            true
        } else {
            log::warn!("dropping send to {}: data channel not open", self.peer);
            false
        }
    }

    pub async fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            signaling_state: self.signaling_state,
            channel_open: self.is_open().await,
            bytes_sent: self.bytes_sent.load(Ordering::SeqCst),
            bytes_received: self.bytes_received.load(Ordering::SeqCst),
        }
    }

    pub async fn close(mut self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.signaling_state = SignalingState::Closed;
        if let Err(e) = self.pc.close().await {
            log::warn!("error closing peer connection to {}: {e}", self.peer);
        }
    }
}
