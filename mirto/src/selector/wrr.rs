//! Smooth weighted round robin, as implemented by nginx.
//!
//! On every pick each candidate's current weight grows by its effective weight, the
//! candidate with the highest current weight is selected, and the selected candidate's
//! current weight drops by the sum of all effective weights. Over time each node is
//! picked in proportion to its weight, and picks of the same node are spread out.

use super::{
    node::direct, Balancer, BalancerBuilder, DefaultBuilder, DoneFunc, PickContext, WeightedNode,
};
use crate::Error;
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};

/// Name of the weighted round robin policy.
pub const NAME: &str = "wrr";

/// Weighted round robin balancer.
#[derive(Debug, Default)]
pub struct WrrBalancer {
    // Current weight per node address.
    current_weight: Mutex<HashMap<String, f64>>,
}

impl Balancer for WrrBalancer {
    fn pick(
        &self,
        _cx: &PickContext,
        nodes: &[Arc<dyn WeightedNode>],
    ) -> Result<(Arc<dyn WeightedNode>, DoneFunc), Error> {
        if nodes.is_empty() {
            return Err(Error::NoAvailable);
        }

        let mut total_weight = 0.0;
        let mut selected: Option<(&Arc<dyn WeightedNode>, f64)> = None;

        let mut current_weight = self.current_weight.lock();
        // Forget nodes that left the candidate list.
        if current_weight.len() > nodes.len() {
            current_weight
                .retain(|address, _| nodes.iter().any(|node| node.raw().address() == address));
        }

        for node in nodes {
            let weight = node.weight();
            total_weight += weight;

            let current = current_weight
                .entry(node.raw().address().to_string())
                .or_insert(0.0);
            *current += weight;

            if selected.map_or(true, |(_, selected_weight)| selected_weight < *current) {
                selected = Some((node, *current));
            }
        }

        let (selected, selected_weight) = selected.ok_or(Error::NoAvailable)?;
        current_weight.insert(
            selected.raw().address().to_string(),
            selected_weight - total_weight,
        );
        drop(current_weight);

        let done = selected.pick();
        Ok((Arc::clone(selected), done))
    }
}

/// Builds [`WrrBalancer`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct Builder;

impl BalancerBuilder for Builder {
    fn build(&self) -> Box<dyn Balancer> {
        Box::new(WrrBalancer::default())
    }
}

/// A selector builder pairing weighted round robin with [`direct`] nodes.
pub fn builder() -> DefaultBuilder {
    DefaultBuilder::new(direct::Builder, Builder)
}
