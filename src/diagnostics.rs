//! Ephemeral ping/pong round-trip and development-only chaos injection.
//! The correlation table is a map of pending promises, modeled with
//! `tokio::sync::oneshot` the way `flarch`'s WASM brokers resolve
//! one-shot JS promises internally, except here the sender side lives
//! entirely in this crate.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use tokio::sync::oneshot;

pub const PING_TYPE: &str = "__ping__";
pub const PONG_TYPE: &str = "__pong__";

/// Milliseconds since the Unix epoch, used as the ping/pong wire
/// `timestamp` field.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Correlation table for outstanding pings, keyed by request id. A
/// resolve for an unknown id is a silent no-op: a `__pong__` whose id is
/// unknown is dropped without complaint.
#[derive(Default)]
pub struct PingTable {
    pending: HashMap<String, oneshot::Sender<i64>>,
}

impl PingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, request_id: String) -> oneshot::Receiver<i64> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id, tx);
        rx
    }

    pub fn resolve(&mut self, request_id: &str, latency_ms: i64) {
        if let Some(tx) = self.pending.remove(request_id) {
            let _ = tx.send(latency_ms);
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Development-only network chaos for `simulateNetwork`. Applies only to
/// outgoing `broadcast`/`sendToPeer` calls; inbound traffic is never
/// affected.
#[derive(Debug, Clone, Copy)]
pub struct ChaosConfig {
    pub packet_loss_pct: f64,
    pub latency_ms: u64,
    pub jitter_ms: u64,
}

impl ChaosConfig {
    pub fn new(packet_loss_pct: f64, latency_ms: u64, jitter_ms: u64) -> Self {
        Self {
            packet_loss_pct: packet_loss_pct.clamp(0.0, 1.0),
            latency_ms,
            jitter_ms,
        }
    }

    /// Rolls the drop decision for one call.
    pub fn should_drop(&self) -> bool {
        self.packet_loss_pct > 0.0 && rand::thread_rng().gen_bool(self.packet_loss_pct)
    }

    /// The delay to apply before the real send, uniform jitter around
    /// `latency_ms`: delays the call by `latency + uniform(-jitter,
    /// +jitter)` milliseconds.
    pub fn delay_ms(&self) -> u64 {
        let jitter: i64 = if self.jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(-(self.jitter_ms as i64)..=(self.jitter_ms as i64))
        };
        (self.latency_ms as i64 + jitter).max(0) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_wakes_the_waiting_receiver() {
        let mut table = PingTable::new();
        let rx = table.register("req-1".to_string());
        table.resolve("req-1", 42);
        assert_eq!(rx.await.unwrap(), 42);
    }

    #[test]
    fn resolve_for_unknown_id_is_a_silent_no_op() {
        let mut table = PingTable::new();
        table.resolve("ghost", 1);
        assert!(table.is_empty());
    }

    #[test]
    fn zero_loss_never_drops() {
        let chaos = ChaosConfig::new(0.0, 50, 10);
        for _ in 0..50 {
            assert!(!chaos.should_drop());
        }
    }

    #[test]
    fn full_loss_always_drops() {
        let chaos = ChaosConfig::new(1.0, 0, 0);
        assert!(chaos.should_drop());
    }

    #[test]
    fn delay_stays_within_jitter_bounds() {
        let chaos = ChaosConfig::new(0.0, 100, 20);
        for _ in 0..50 {
            let d = chaos.delay_ms();
            assert!(d >= 80 && d <= 120);
        }
    }
}
