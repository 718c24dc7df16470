//! Adaptive backoff used by every bounded retry loop in the pipeline.
//!
//! The loops themselves (free-surface scan, device-busy resubmission) own the
//! iteration count and the ceiling; a [`Backoff`] only decides how long to
//! pause for a given iteration. Tests inject [`InstantBackoff`] so that
//! "busy" can be simulated without real delays.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub trait Backoff: Send + Sync + fmt::Debug {
    /// Pause before retry number `iteration` (0-based).
    fn pause(&self, iteration: u32);
}

/// Spin first, then yield, then sleep: short stalls stay cheap while a stalled
/// device does not burn a full core.
#[derive(Debug, Clone)]
pub struct HybridBackoff {
    yield_every: u32,
    sleep_every: u32,
    sleep_for: Duration,
}

impl Default for HybridBackoff {
    fn default() -> Self {
        Self {
            yield_every: 512,
            sleep_every: 4096,
            sleep_for: Duration::from_millis(1),
        }
    }
}

impl HybridBackoff {
    pub fn new(yield_every: u32, sleep_every: u32, sleep_for: Duration) -> Self {
        Self {
            yield_every: yield_every.max(1),
            sleep_every: sleep_every.max(1),
            sleep_for,
        }
    }
}

impl Backoff for HybridBackoff {
    fn pause(&self, iteration: u32) {
        std::hint::spin_loop();
        let step = iteration.wrapping_add(1);
        if step % self.sleep_every == 0 {
            std::thread::sleep(self.sleep_for);
        } else if step % self.yield_every == 0 {
            std::thread::yield_now();
        }
    }
}

/// Never waits; only counts how often it was asked to.
#[derive(Debug, Default)]
pub struct InstantBackoff {
    pauses: AtomicU64,
}

impl InstantBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pauses(&self) -> u64 {
        self.pauses.load(Ordering::Relaxed)
    }
}

impl Backoff for InstantBackoff {
    fn pause(&self, _iteration: u32) {
        self.pauses.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instant_backoff_counts_pauses() {
        let backoff = InstantBackoff::new();
        for i in 0..5 {
            backoff.pause(i);
        }
        assert_eq!(backoff.pauses(), 5);
    }

    #[test]
    fn hybrid_backoff_clamps_zero_periods() {
        let backoff = HybridBackoff::new(0, 0, Duration::ZERO);
        backoff.pause(0);
        backoff.pause(u32::MAX);
    }
}
