//! Uniformly random selection.

use super::{
    node::direct, Balancer, BalancerBuilder, DefaultBuilder, DoneFunc, PickContext, WeightedNode,
};
use crate::Error;
use rand::Rng;
use std::sync::Arc;

/// Name of the random policy.
pub const NAME: &str = "random";

/// Picks one of the candidates uniformly at random.
#[derive(Debug, Default)]
pub struct RandomBalancer;

impl Balancer for RandomBalancer {
    fn pick(
        &self,
        _cx: &PickContext,
        nodes: &[Arc<dyn WeightedNode>],
    ) -> Result<(Arc<dyn WeightedNode>, DoneFunc), Error> {
        if nodes.is_empty() {
            return Err(Error::NoAvailable);
        }

        let selected = &nodes[rand::thread_rng().gen_range(0..nodes.len())];
        let done = selected.pick();
        Ok((Arc::clone(selected), done))
    }
}

/// Builds [`RandomBalancer`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct Builder;

impl BalancerBuilder for Builder {
    fn build(&self) -> Box<dyn Balancer> {
        Box::new(RandomBalancer)
    }
}

/// A selector builder pairing the random policy with [`direct`] nodes.
pub fn builder() -> DefaultBuilder {
    DefaultBuilder::new(direct::Builder, Builder)
}
