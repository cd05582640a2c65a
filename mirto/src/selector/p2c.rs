//! Power of two choices.
//!
//! Two distinct candidates are drawn at random and the one with the higher weight wins.
//! A candidate that keeps losing would never be picked again, and with no traffic its
//! statistics would never recover. To avoid that, a loser that has not been picked for
//! [`FORCE_PICK`] is picked instead, once.

use super::{
    node::ewma, Balancer, BalancerBuilder, DefaultBuilder, DoneFunc, PickContext, WeightedNode,
};
use crate::Error;
use rand::Rng;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

/// Name of the power of two choices policy.
pub const NAME: &str = "p2c";

/// A losing candidate idle for longer than this is forced to be picked.
pub const FORCE_PICK: Duration = Duration::from_secs(3);

/// Power of two choices balancer.
#[derive(Debug, Default)]
pub struct P2cBalancer {
    // Set while a forced pick is being decided.
    picked: AtomicBool,
}

impl P2cBalancer {
    /// Draw two distinct candidates.
    fn pre_pick<'a>(
        &self,
        nodes: &'a [Arc<dyn WeightedNode>],
    ) -> (&'a Arc<dyn WeightedNode>, &'a Arc<dyn WeightedNode>) {
        let mut rng = rand::thread_rng();
        let a = rng.gen_range(0..nodes.len());
        let mut b = rng.gen_range(0..nodes.len() - 1);
        if b >= a {
            b += 1;
        }
        (&nodes[a], &nodes[b])
    }
}

impl Balancer for P2cBalancer {
    fn pick(
        &self,
        _cx: &PickContext,
        nodes: &[Arc<dyn WeightedNode>],
    ) -> Result<(Arc<dyn WeightedNode>, DoneFunc), Error> {
        match nodes {
            [] => return Err(Error::NoAvailable),
            [only] => {
                let done = only.pick();
                return Ok((Arc::clone(only), done));
            }
            _ => {}
        }

        let (a, b) = self.pre_pick(nodes);
        let (mut picked, unpicked) = if b.weight() > a.weight() {
            (b, a)
        } else {
            (a, b)
        };

        if unpicked.pick_elapsed() > FORCE_PICK
            && self
                .picked
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            tracing::debug!(
                address = unpicked.raw().address(),
                "forcing pick of an idle node"
            );
            picked = unpicked;
            self.picked.store(false, Ordering::Release);
        }

        let done = picked.pick();
        Ok((Arc::clone(picked), done))
    }
}

/// Builds [`P2cBalancer`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct Builder;

impl BalancerBuilder for Builder {
    fn build(&self) -> Box<dyn Balancer> {
        Box::new(P2cBalancer::default())
    }
}

/// A selector builder pairing power of two choices with [`ewma`] nodes.
pub fn builder() -> DefaultBuilder {
    DefaultBuilder::new(ewma::Builder, Builder)
}
