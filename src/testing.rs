//! Test-only helpers: a once-guarded logging initializer mirroring
//! `flarch::start_logging`, and an in-memory signaling double that lets
//! protocol-level tests exchange envelopes without a live server.

use std::sync::Once;

use tokio::sync::mpsc;

use crate::codec::SignalEnvelope;

static INIT: Once = Once::new();

/// Installs `env_logger` once per process. Safe to call at the top of
/// every test; repeated calls are no-ops.
pub fn init_logging() {
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// An in-memory relay standing in for the signaling server: an envelope
/// sent from one side of the pair is delivered to the other side's
/// `recv`, the same pairing the real server performs for two
/// participants sharing a workspace.
pub struct FakeSignalingChannel {
    outbound: mpsc::UnboundedSender<SignalEnvelope>,
    inbound: mpsc::UnboundedReceiver<SignalEnvelope>,
}

impl FakeSignalingChannel {
    /// Builds a connected pair, as if two participants had joined the
    /// same workspace on a real server.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        (
            Self {
                outbound: tx_b,
                inbound: rx_a,
            },
            Self {
                outbound: tx_a,
                inbound: rx_b,
            },
        )
    }

    pub fn send(&self, envelope: SignalEnvelope) {
        let _ = self.outbound.send(envelope);
    }

    pub async fn recv(&mut self) -> Option<SignalEnvelope> {
        self.inbound.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::SignalPayload;
    use crate::identity::PeerId;

    #[tokio::test]
    async fn pair_delivers_envelopes_to_the_other_side() {
        init_logging();
        let (a, mut b) = FakeSignalingChannel::pair();
        a.send(SignalEnvelope::new(
            "b",
            "a",
            SignalPayload::Join {
                workspace_id: "w".to_string(),
            },
        ));
        let received = b.recv().await.unwrap();
        assert_eq!(received.from_peer(), PeerId::from("a"));
    }
}
