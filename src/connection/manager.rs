//! The Connection Manager: owns every [`PairwiseConnection`],
//! implements the offer/answer/candidate contracts, and observes the
//! cleanup invariant (remove from the registry before closing the
//! underlying connection, so a close callback firing during teardown
//! can't re-enter and double-notify).

use std::collections::HashMap;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::connection::pairwise::{ConnectionStats, PairwiseConnection, SignalingState};
use crate::error::ConnectionError;
use crate::identity::PeerId;

/// Everything the manager reports upward, whether sourced from a webrtc
/// callback or produced synchronously by a manager method. The Client
/// drains these from the paired receiver inside its own event loop —
/// there is no back-pointer from the manager to its owner.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// The datagram channel to `peer` is open; fire at most once per
    /// direct-transition.
    PeerJoin { peer: PeerId },
    /// The connection to `peer` is gone; registry already cleaned up.
    PeerDisconnect { peer: PeerId },
    /// Bytes arrived verbatim over the direct channel.
    Message { peer: PeerId, bytes: Bytes },
    /// A negotiation error occurred; the connection is not torn down
    /// automatically.
    Error { peer: PeerId, message: String },
    /// A local offer/answer/candidate must be forwarded to `peer` via
    /// the Signaling Transport. The Connection Manager has no notion of
    /// the wire format.
    LocalOffer { peer: PeerId, sdp: String },
    LocalAnswer { peer: PeerId, sdp: String },
    LocalCandidate {
        peer: PeerId,
        candidate: String,
        sdp_mid: String,
        sdp_m_line_index: u32,
    },
    /// Internal: the peer connection closed or failed. Not surfaced
    /// directly; [`ConnectionManager::drain_internal`] turns this into
    /// [`ConnectionEvent::PeerDisconnect`] after running cleanup.
    Closed { peer: PeerId },
    /// Internal: the webrtc data channel finished its open handshake.
    /// Turned into [`ConnectionEvent::PeerJoin`] on first occurrence.
    ChannelOpen { peer: PeerId },
}

pub struct ConnectionManager {
    local_id: PeerId,
    ice_servers: Vec<String>,
    peers: HashMap<PeerId, PairwiseConnection>,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    events_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
}

impl ConnectionManager {
    pub fn new(local_id: PeerId, ice_servers: Vec<String>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            local_id,
            ice_servers,
            peers: HashMap::new(),
            events_tx,
            events_rx,
        }
    }

    /// Receives the next raw event from a webrtc callback and applies any
    /// bookkeeping the callback itself couldn't (it only has a channel
    /// handle, not `&mut self`). Called from the Client's event loop.
    pub async fn poll(&mut self) -> Option<ConnectionEvent> {
        loop {
            let event = self.events_rx.recv().await?;
            match event {
                ConnectionEvent::ChannelOpen { peer } => {
                    if let Some(conn) = self.peers.get_mut(&peer) {
                        if !conn.join_fired {
                            conn.join_fired = true;
                            return Some(ConnectionEvent::PeerJoin { peer });
                        }
                    }
                }
                ConnectionEvent::Closed { peer } => {
                    if self.peers.remove(&peer).is_some() {
                        return Some(ConnectionEvent::PeerDisconnect { peer });
                    }
                }
                other => return Some(other),
            }
        }
    }

    /// No-op if a record already exists: exactly one Pairwise Connection
    /// per peer.
    pub async fn initiate_connection(&mut self, peer: PeerId) -> Result<(), ConnectionError> {
        if self.peers.contains_key(&peer) {
            return Ok(());
        }
        let mut conn = PairwiseConnection::new(peer.clone(), &self.ice_servers, self.events_tx.clone())
            .await
            .map_err(|e| ConnectionError::InvalidState(e.to_string()))?;
        let sdp = conn
            .create_offer(self.events_tx.clone())
            .await
            .map_err(|e| ConnectionError::InvalidState(e.to_string()))?;
        self.peers.insert(peer.clone(), conn);
        let _ = self.events_tx.send(ConnectionEvent::LocalOffer { peer, sdp });
        Ok(())
    }

    /// Creates the record if absent; resolves
    /// glare via rollback if the local side already has an offer out.
    pub async fn handle_offer(&mut self, peer: PeerId, sdp: String) -> Result<(), ConnectionError> {
        if !self.peers.contains_key(&peer) {
            let conn = PairwiseConnection::new(peer.clone(), &self.ice_servers, self.events_tx.clone())
                .await
                .map_err(|e| ConnectionError::InvalidState(e.to_string()))?;
            self.peers.insert(peer.clone(), conn);
        }
        let conn = self.peers.get_mut(&peer).ok_or_else(|| ConnectionError::Missing(peer.clone()))?;
        let answer = conn.accept_offer(&sdp, self.events_tx.clone()).await?;
        let _ = self.events_tx.send(ConnectionEvent::LocalAnswer { peer, sdp: answer });
        Ok(())
    }

    /// Silently ignored with no record; ignored
    /// with a warning if the state isn't `have-local-offer` (stale
    /// answer, e.g. a duplicate delivery after the peer already moved on).
    pub async fn handle_answer(&mut self, peer: PeerId, sdp: String) -> Result<(), ConnectionError> {
        let Some(conn) = self.peers.get_mut(&peer) else {
            log::debug!("ignoring answer from unknown peer {peer}");
            return Ok(());
        };
        if conn.signaling_state != SignalingState::HaveLocalOffer {
            log::warn!("ignoring stale answer from {peer}: state is {}", conn.signaling_state.as_str());
            return Ok(());
        }
        conn.accept_answer(&sdp).await
    }

    /// Ignored entirely with no record;
    /// buffered or applied depending on whether the remote description
    /// is installed yet.
    pub async fn handle_candidate(&mut self, peer: PeerId, candidate: String, sdp_mid: String, sdp_m_line_index: u32) {
        let Some(conn) = self.peers.get_mut(&peer) else {
            log::debug!("ignoring candidate from unknown peer {peer}");
            return;
        };
        conn.add_candidate(candidate, sdp_mid, sdp_m_line_index).await;
    }

    /// No-op with a warning if not open.
    pub async fn send_to_peer(&self, peer: &PeerId, bytes: Bytes) -> bool {
        match self.peers.get(peer) {
            Some(conn) => conn.send(bytes).await,
            None => {
                log::warn!("dropping send to unknown peer {peer}");
                false
            }
        }
    }

    /// Reaches every peer with an open channel.
    pub async fn broadcast(&self, bytes: Bytes) {
        for conn in self.peers.values() {
            conn.send(bytes.clone()).await;
        }
    }

    pub fn is_direct(&self, peer: &PeerId) -> bool {
        self.peers
            .get(peer)
            .map(|c| c.join_fired && c.signaling_state != SignalingState::Closed)
            .unwrap_or(false)
    }

    pub fn has_peer(&self, peer: &PeerId) -> bool {
        self.peers.contains_key(peer)
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.peers.keys().cloned().collect()
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    /// Removes each peer from the registry before
    /// closing its underlying connection (cleanup invariant), firing
    /// `PeerDisconnect` exactly once per peer that was actually present.
    pub async fn close_all(&mut self) -> Vec<PeerId> {
        let peers: Vec<_> = self.peers.drain().collect();
        let mut disconnected = Vec::with_capacity(peers.len());
        for (peer, conn) in peers {
            conn.close().await;
            disconnected.push(peer);
        }
        disconnected
    }

    /// Per-peer connection health snapshot: signaling state, whether the
    /// direct channel is open, and running byte counters in each
    /// direction. `None` if there is no record for `peer`.
    pub async fn stats(&self, peer: &PeerId) -> Option<ConnectionStats> {
        match self.peers.get(peer) {
            Some(conn) => Some(conn.stats().await),
            None => None,
        }
    }

    pub async fn close_peer(&mut self, peer: &PeerId) -> bool {
        if let Some(conn) = self.peers.remove(peer) {
            conn.close().await;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_direct_is_false_for_unknown_peer() {
        let manager = ConnectionManager::new(PeerId::from("local"), vec![]);
        assert!(!manager.is_direct(&PeerId::from("ghost")));
        assert!(!manager.has_peer(&PeerId::from("ghost")));
        assert!(manager.peer_ids().is_empty());
    }

    /// Both sides send an offer before either sees the other's: each must
    /// roll back its own outstanding offer and answer instead of
    /// erroring out (the tie-break in `Client` makes this rare in
    /// practice, not impossible — it only decides who initiates first,
    /// not who wins a race that already started).
    #[tokio::test]
    async fn glare_is_resolved_without_error_on_both_sides() {
        let mut a = ConnectionManager::new(PeerId::from("aaa"), vec![]);
        let mut b = ConnectionManager::new(PeerId::from("zzz"), vec![]);

        a.initiate_connection(PeerId::from("zzz")).await.unwrap();
        let offer_a = match a.poll().await.unwrap() {
            ConnectionEvent::LocalOffer { sdp, .. } => sdp,
            other => panic!("expected LocalOffer, got {other:?}"),
        };

        b.initiate_connection(PeerId::from("aaa")).await.unwrap();
        let offer_b = match b.poll().await.unwrap() {
            ConnectionEvent::LocalOffer { sdp, .. } => sdp,
            other => panic!("expected LocalOffer, got {other:?}"),
        };

        a.handle_offer(PeerId::from("zzz"), offer_b).await.unwrap();
        b.handle_offer(PeerId::from("aaa"), offer_a).await.unwrap();

        assert!(a.has_peer(&PeerId::from("zzz")));
        assert!(b.has_peer(&PeerId::from("aaa")));
    }

    #[tokio::test]
    async fn stats_reports_signaling_state_before_channel_opens() {
        let mut manager = ConnectionManager::new(PeerId::from("local"), vec![]);
        manager.initiate_connection(PeerId::from("remote")).await.unwrap();

        let stats = manager.stats(&PeerId::from("remote")).await.unwrap();
        assert_eq!(stats.signaling_state, SignalingState::HaveLocalOffer);
        assert!(!stats.channel_open);
        assert_eq!(stats.bytes_sent, 0);
        assert_eq!(stats.bytes_received, 0);
    }

    #[tokio::test]
    async fn stats_is_none_for_unknown_peer() {
        let manager = ConnectionManager::new(PeerId::from("local"), vec![]);
        assert!(manager.stats(&PeerId::from("ghost")).await.is_none());
    }
}
