//! Nodes weighted by an exponentially weighted moving average of their
//! latency and success rate.
//!
//! Every completed call decays the previous averages by `exp(-td / 600ms)`, where `td` is
//! the time since the previous completion on the node, and blends in the new sample.
//! The node's load is its average latency multiplied by the number of calls in flight,
//! and its weight is its success rate divided by that load.

use super::LastPick;
use crate::selector::{
    DoneFunc, DoneInfo, Node, WeightedNode, WeightedNodeBuilder, DEFAULT_WEIGHT,
};
use std::{
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::time::Instant;
use tonic::Code;

/// Decay constant of the moving averages.
const TAU: Duration = Duration::from_millis(600);
/// Latency assumed for a node that has not completed any call yet.
const PENALTY: Duration = Duration::from_micros(250);
/// Success score of a call that went well.
const SUCCESS: u64 = 1000;

/// A node weighted by the EWMA of its recent latency and success rate.
#[derive(Debug)]
pub struct EwmaNode {
    node: Node,
    last_pick: LastPick,
    stats: Arc<Stats>,
}

#[derive(Debug)]
struct Stats {
    base: Instant,
    // Starts at one, so that the load of an idle node is its latency.
    inflight: AtomicI64,
    // Average latency in nanoseconds, zero until the first completion.
    lag: AtomicI64,
    // Average success score, between 0 and `SUCCESS`.
    success: AtomicU64,
    // Nanoseconds since `base` of the last completion.
    stamp: AtomicI64,
}

impl Stats {
    fn new() -> Self {
        Self {
            base: Instant::now(),
            inflight: AtomicI64::new(1),
            lag: AtomicI64::new(0),
            success: AtomicU64::new(SUCCESS),
            stamp: AtomicI64::new(0),
        }
    }

    fn now(&self) -> i64 {
        self.base.elapsed().as_nanos() as i64
    }

    fn complete(&self, start: i64, info: &DoneInfo<'_>) {
        self.inflight.fetch_sub(1, Ordering::AcqRel);

        let now = self.now();
        let stamp = self.stamp.swap(now, Ordering::AcqRel);
        let td = (now - stamp).max(0);
        let rtt = (now - start).max(0);

        let old_lag = self.lag.load(Ordering::Acquire);
        let w = if old_lag == 0 {
            0.0
        } else {
            (-(td as f64) / TAU.as_nanos() as f64).exp()
        };

        let lag = old_lag as f64 * w + rtt as f64 * (1.0 - w);
        self.lag.store(lag as i64, Ordering::Release);

        let score = if is_failure(info) { 0 } else { SUCCESS };
        let old_success = self.success.load(Ordering::Acquire);
        let success = old_success as f64 * w + score as f64 * (1.0 - w);
        self.success.store(success as u64, Ordering::Release);
    }

    fn load(&self) -> u64 {
        let inflight = self.inflight.load(Ordering::Acquire).max(1) as u64;
        match self.lag.load(Ordering::Acquire) {
            0 => PENALTY.as_nanos() as u64 * inflight,
            lag => lag as u64 * inflight,
        }
    }
}

/// One call in flight on a node. Dropping it without [`InFlight::finish`] only frees
/// its in-flight slot, since an abandoned call says nothing about latency.
struct InFlight {
    stats: Arc<Stats>,
    start: i64,
    finished: bool,
}

impl InFlight {
    fn finish(mut self, info: &DoneInfo<'_>) {
        self.finished = true;
        self.stats.complete(self.start, info);
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if !self.finished {
            self.stats.inflight.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// Whether a call outcome should count against the node's success rate.
///
/// Transport errors always do; gRPC statuses only when they point at the server.
fn is_failure(info: &DoneInfo<'_>) -> bool {
    if let Some(err) = info.err {
        return match err.downcast_ref::<tonic::Status>() {
            Some(status) => is_server_failure(status.code()),
            None => true,
        };
    }

    info.reply_md
        .and_then(|md| md.get("grpc-status"))
        .map(|status| is_server_failure(Code::from_bytes(status.as_bytes())))
        .unwrap_or(false)
}

fn is_server_failure(code: Code) -> bool {
    matches!(
        code,
        Code::Unavailable | Code::DeadlineExceeded | Code::ResourceExhausted | Code::Internal
    )
}

impl WeightedNode for EwmaNode {
    fn raw(&self) -> &Node {
        &self.node
    }

    fn weight(&self) -> f64 {
        let scale = self
            .node
            .initial_weight()
            .map(|weight| weight as f64)
            .unwrap_or(DEFAULT_WEIGHT)
            / DEFAULT_WEIGHT;
        let success = self.stats.success.load(Ordering::Acquire) as f64;

        success * scale * Duration::from_secs(1).as_nanos() as f64
            / (self.stats.load() as f64 + 1.0)
    }

    fn pick(&self) -> DoneFunc {
        self.last_pick.touch();
        self.stats.inflight.fetch_add(1, Ordering::AcqRel);

        let call = InFlight {
            stats: Arc::clone(&self.stats),
            start: self.stats.now(),
            finished: false,
        };
        Box::new(move |info: &DoneInfo<'_>| call.finish(info))
    }

    fn pick_elapsed(&self) -> Duration {
        self.last_pick.elapsed()
    }
}

/// Builds [`EwmaNode`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct Builder;

impl WeightedNodeBuilder for Builder {
    fn build(&self, node: Node) -> Arc<dyn WeightedNode> {
        Arc::new(EwmaNode {
            node,
            last_pick: LastPick::new(),
            stats: Arc::new(Stats::new()),
        })
    }
}
