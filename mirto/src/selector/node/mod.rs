//! [`WeightedNode`](super::WeightedNode) flavours.
//!
//! [`direct`] nodes report the weight published through discovery and are used by the
//! random and weighted round robin policies. [`ewma`] nodes derive their weight from
//! the latency and success rate of recent calls and back the p2c policy.

pub mod direct;
pub mod ewma;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Monotonic record of when a node was last picked.
#[derive(Debug)]
pub(crate) struct LastPick {
    base: Instant,
    // Nanoseconds since `base`, offset by one. Zero means never picked.
    nanos: AtomicU64,
}

impl LastPick {
    pub(crate) fn new() -> Self {
        Self {
            base: Instant::now(),
            nanos: AtomicU64::new(0),
        }
    }

    pub(crate) fn touch(&self) {
        let since_base = self.base.elapsed().as_nanos() as u64;
        self.nanos.store(since_base + 1, Ordering::Release);
    }

    pub(crate) fn elapsed(&self) -> Duration {
        match self.nanos.load(Ordering::Acquire) {
            0 => Duration::MAX,
            nanos => self
                .base
                .elapsed()
                .saturating_sub(Duration::from_nanos(nanos - 1)),
        }
    }
}
