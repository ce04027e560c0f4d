//! Timer helpers shared by the signaling transport's reconnect/heartbeat
//! loops and the diagnostics ping timeout. Adapted from
//! `flarch::tasks::libc`'s `wait`/`wait_ms`/`Interval`, dropping the wasm
//! branch this crate doesn't need.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use rand::Rng;
use tokio::time::{self, sleep, Duration, Instant};

/// Waits for `dur`.
pub async fn wait(dur: Duration) {
    sleep(dur).await;
}

/// Waits for `ms` milliseconds.
pub async fn wait_ms(ms: u64) {
    wait(Duration::from_millis(ms)).await;
}

/// A stream that fires every `dur`, starting immediately.
pub struct Interval {
    interval: time::Interval,
}

impl Interval {
    pub fn new(dur: Duration) -> Self {
        Self {
            interval: time::interval_at(Instant::now(), dur),
        }
    }
}

impl Stream for Interval {
    type Item = Instant;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.interval.poll_tick(cx).map(Some)
    }
}

/// Exponential backoff with jitter: starts at
/// `base`, doubles each attempt, capped at `max`, with up to `jitter_pct`
/// percent of random jitter added on top, bounded to `max_attempts`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter_pct: f64,
    max_attempts: u32,
}

impl Backoff {
    pub const fn new(base: Duration, max: Duration, jitter_pct: f64, max_attempts: u32) -> Self {
        Self {
            base,
            max,
            jitter_pct,
            max_attempts,
        }
    }

    /// The reconnect policy: 1000ms base, doubling, capped at 30000ms, up
    /// to 30% jitter, 10 attempts.
    pub const fn reconnect_policy() -> Self {
        Self::new(Duration::from_millis(1000), Duration::from_millis(30_000), 0.30, 10)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay for the given zero-indexed attempt number, with jitter
    /// applied. Returns `None` once `max_attempts` has been exceeded.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let doubled = self
            .base
            .as_millis()
            .saturating_mul(1u128 << attempt.min(20));
        let capped = doubled.min(self.max.as_millis());
        let jitter_span = (capped as f64 * self.jitter_pct) as u64;
        let jitter = if jitter_span == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_span)
        };
        Some(Duration::from_millis(capped as u64 + jitter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_and_caps() {
        let b = Backoff::reconnect_policy();
        let d0 = b.delay_for(0).unwrap();
        assert!(d0.as_millis() >= 1000 && d0.as_millis() <= 1300);
        let d4 = b.delay_for(4).unwrap();
        // 1000 * 2^4 = 16000, plus up to 30% jitter
        assert!(d4.as_millis() >= 16000 && d4.as_millis() <= 20800);
        let d_big = b.delay_for(10_u32.saturating_sub(1)).unwrap();
        assert!(d_big.as_millis() <= 39_000);
    }

    #[test]
    fn stops_after_max_attempts() {
        let b = Backoff::reconnect_policy();
        assert!(b.delay_for(10).is_none());
        assert!(b.delay_for(9).is_some());
    }
}
