//! Nodes weighted by the value their instance published through discovery.

use super::LastPick;
use crate::selector::{
    DoneFunc, DoneInfo, Node, WeightedNode, WeightedNodeBuilder, DEFAULT_WEIGHT,
};
use std::{sync::Arc, time::Duration};

/// A node whose weight is the one published in its instance metadata,
/// or [`DEFAULT_WEIGHT`].
#[derive(Debug)]
pub struct DirectNode {
    node: Node,
    last_pick: LastPick,
}

impl WeightedNode for DirectNode {
    fn raw(&self) -> &Node {
        &self.node
    }

    fn weight(&self) -> f64 {
        self.node
            .initial_weight()
            .map(|weight| weight as f64)
            .unwrap_or(DEFAULT_WEIGHT)
    }

    fn pick(&self) -> DoneFunc {
        self.last_pick.touch();
        Box::new(|_: &DoneInfo<'_>| {})
    }

    fn pick_elapsed(&self) -> Duration {
        self.last_pick.elapsed()
    }
}

/// Builds [`DirectNode`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct Builder;

impl WeightedNodeBuilder for Builder {
    fn build(&self, node: Node) -> Arc<dyn WeightedNode> {
        Arc::new(DirectNode {
            node,
            last_pick: LastPick::new(),
        })
    }
}
