use super::{
    Balancer, BalancerBuilder, DoneFunc, Node, PickContext, Selector, SelectorBuilder,
    WeightedNode, WeightedNodeBuilder,
};
use crate::Error;
use arc_swap::ArcSwapOption;
use std::sync::Arc;

type Snapshot = Vec<Arc<dyn WeightedNode>>;

/// Composes a [`WeightedNodeBuilder`] and a [`Balancer`] into a [`Selector`].
///
/// The node snapshot lives in an atomically swapped pointer: [`Selector::select`] never
/// takes a lock and always observes one complete snapshot.
pub struct DefaultSelector {
    node_builder: Arc<dyn WeightedNodeBuilder>,
    balancer: Box<dyn Balancer>,
    nodes: ArcSwapOption<Snapshot>,
}

impl DefaultSelector {
    pub fn new(node_builder: Arc<dyn WeightedNodeBuilder>, balancer: Box<dyn Balancer>) -> Self {
        Self {
            node_builder,
            balancer,
            nodes: ArcSwapOption::empty(),
        }
    }
}

impl Selector for DefaultSelector {
    fn select(&self, cx: &PickContext) -> Result<(Node, DoneFunc), Error> {
        let snapshot = self.nodes.load();
        let candidates = match snapshot.as_deref() {
            Some(candidates) if !candidates.is_empty() => candidates,
            _ => return Err(Error::NoAvailable),
        };

        let (selected, done) = self.balancer.pick(cx, candidates)?;
        let node = selected.raw().clone();

        if let Some(peer) = cx.peer() {
            peer.set_node(node.clone());
        }

        Ok((node, done))
    }

    fn apply(&self, nodes: Vec<Node>) {
        let weighted: Snapshot = nodes
            .into_iter()
            .map(|node| self.node_builder.build(node))
            .collect();

        tracing::debug!(nodes = weighted.len(), "applying new node snapshot");

        // Statistics are not carried over from the previous snapshot.
        self.nodes.store(Some(Arc::new(weighted)));
    }
}

/// A [`SelectorBuilder`] made of a node flavour and a balancer policy.
#[derive(Clone)]
pub struct DefaultBuilder {
    pub node: Arc<dyn WeightedNodeBuilder>,
    pub balancer: Arc<dyn BalancerBuilder>,
}

impl DefaultBuilder {
    pub fn new<N, B>(node: N, balancer: B) -> Self
    where
        N: WeightedNodeBuilder + 'static,
        B: BalancerBuilder + 'static,
    {
        Self {
            node: Arc::new(node),
            balancer: Arc::new(balancer),
        }
    }
}

impl SelectorBuilder for DefaultBuilder {
    fn build(&self) -> Box<dyn Selector> {
        Box::new(DefaultSelector::new(
            Arc::clone(&self.node),
            self.balancer.build(),
        ))
    }
}
