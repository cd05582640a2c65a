//! Client-side node selection.
//!
//! A [`Selector`] owns the current snapshot of backend [`Node`]s for one logical service and
//! delegates every pick to a [`Balancer`] policy. Each snapshot is rebuilt from scratch on
//! [`Selector::apply`]: the [`WeightedNodeBuilder`] wraps every [`Node`] into the
//! [`WeightedNode`] flavour the policy wants, and the new list replaces the old one atomically.
//!
//! ```
//! use mirto::{Node, PickContext, Policy, SelectorBuilder};
//!
//! let selector = Policy::Wrr.builder().build();
//! selector.apply(vec![
//!     Node::new("grpc", "10.0.0.1:9000", None),
//!     Node::new("grpc", "10.0.0.2:9000", None),
//! ]);
//!
//! let (node, done) = selector.select(&PickContext::default()).unwrap();
//! assert_eq!(node.scheme(), "grpc");
//! done(&Default::default());
//! ```

mod default_selector;
pub mod node;
pub mod p2c;
pub mod random;
pub mod wrr;

pub use default_selector::{DefaultBuilder, DefaultSelector};

use crate::{Error, ServiceInstance};
use std::{fmt, str::FromStr, sync::Arc, time::Duration};

/// Weight of a node that did not publish one through discovery.
pub const DEFAULT_WEIGHT: f64 = 100.0;

/// Metadata key under which an instance publishes its initial weight.
const WEIGHT_METADATA_KEY: &str = "weight";

/// Callback invoked exactly once when a picked call completes.
pub type DoneFunc = Box<dyn FnOnce(&DoneInfo<'_>) + Send + 'static>;

/// Outcome of one call, handed to the [`DoneFunc`] returned by a pick.
#[derive(Debug, Default, Clone, Copy)]
pub struct DoneInfo<'a> {
    /// The error the call failed with, if any.
    pub err: Option<&'a (dyn std::error::Error + Send + Sync + 'static)>,
    /// Bytes sent to the backend, `None` when the transport does not know.
    pub bytes_sent: Option<u64>,
    /// Bytes received from the backend, `None` when the transport does not know.
    pub bytes_received: Option<u64>,
    /// Metadata returned by the backend alongside its reply.
    pub reply_md: Option<&'a http::HeaderMap>,
}

/// One network-addressable endpoint of a [`ServiceInstance`].
///
/// Cloning a `Node` is cheap.
#[derive(Clone)]
pub struct Node(Arc<NodeInner>);

struct NodeInner {
    scheme: String,
    address: String,
    instance: Option<Arc<ServiceInstance>>,
    initial_weight: Option<i64>,
}

impl Node {
    /// Create a node for `address`, reached through `scheme`.
    ///
    /// When the owning `instance` publishes a positive `weight` in its metadata, that
    /// becomes the node's initial weight.
    pub fn new<S, A>(scheme: S, address: A, instance: Option<Arc<ServiceInstance>>) -> Self
    where
        S: Into<String>,
        A: Into<String>,
    {
        let initial_weight = instance.as_ref().and_then(|instance| {
            instance
                .metadata
                .get(WEIGHT_METADATA_KEY)
                .and_then(|weight| weight.parse::<i64>().ok())
                .filter(|weight| *weight > 0)
        });

        Self(Arc::new(NodeInner {
            scheme: scheme.into(),
            address: address.into(),
            instance,
            initial_weight,
        }))
    }

    /// The transport scheme, e.g `grpc`.
    pub fn scheme(&self) -> &str {
        &self.0.scheme
    }

    /// The `host:port` the node is reachable at.
    pub fn address(&self) -> &str {
        &self.0.address
    }

    /// The instance this endpoint belongs to, if discovery supplied one.
    pub fn instance(&self) -> Option<&Arc<ServiceInstance>> {
        self.0.instance.as_ref()
    }

    /// The weight published by the instance, if any.
    pub fn initial_weight(&self) -> Option<i64> {
        self.0.initial_weight
    }

    pub fn service_name(&self) -> Option<&str> {
        self.0.instance.as_deref().map(|instance| instance.name.as_str())
    }

    pub fn version(&self) -> Option<&str> {
        self.0
            .instance
            .as_deref()
            .map(|instance| instance.version.as_str())
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.scheme() == other.scheme() && self.address() == other.address()
    }
}

impl Eq for Node {}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("scheme", &self.0.scheme)
            .field("address", &self.0.address)
            .field("initial_weight", &self.0.initial_weight)
            .finish()
    }
}

/// A [`Node`] decorated with the runtime statistics a [`Balancer`] policy uses.
pub trait WeightedNode: Send + Sync {
    /// The wrapped node.
    fn raw(&self) -> &Node;

    /// The current effective weight. Higher is better.
    fn weight(&self) -> f64;

    /// Record that the node was just chosen.
    ///
    /// The returned callback must be invoked once the call completes.
    fn pick(&self) -> DoneFunc;

    /// Time since the node was last picked, [`Duration::MAX`] if it never was.
    fn pick_elapsed(&self) -> Duration;
}

/// Builds the [`WeightedNode`] flavour a policy works with.
pub trait WeightedNodeBuilder: Send + Sync {
    fn build(&self, node: Node) -> Arc<dyn WeightedNode>;
}

/// Per-call context passed through [`Selector::select`] to the [`Balancer`].
#[derive(Debug, Clone, Default)]
pub struct PickContext {
    peer: Option<Arc<Peer>>,
}

impl PickContext {
    /// A context carrying `peer`, on which the selected node will be recorded.
    pub fn with_peer(peer: Arc<Peer>) -> Self {
        Self { peer: Some(peer) }
    }

    pub fn peer(&self) -> Option<&Peer> {
        self.peer.as_deref()
    }
}

/// Records the node a call was routed to, for downstream observability.
#[derive(Debug, Default)]
pub struct Peer {
    node: parking_lot::Mutex<Option<Node>>,
}

impl Peer {
    /// The node chosen for the call, once selection happened.
    pub fn node(&self) -> Option<Node> {
        self.node.lock().clone()
    }

    pub(crate) fn set_node(&self, node: Node) {
        *self.node.lock() = Some(node);
    }
}

/// A selection policy.
///
/// Implementations must tolerate concurrent calls over the same candidate slice,
/// and never mutate it.
pub trait Balancer: Send + Sync {
    /// Pick one of `nodes`. Fails with [`Error::NoAvailable`] if `nodes` is empty.
    fn pick(
        &self,
        cx: &PickContext,
        nodes: &[Arc<dyn WeightedNode>],
    ) -> Result<(Arc<dyn WeightedNode>, DoneFunc), Error>;
}

/// Creates a fresh [`Balancer`].
pub trait BalancerBuilder: Send + Sync {
    fn build(&self) -> Box<dyn Balancer>;
}

/// Owns the current node snapshot of a service and picks a node per call.
pub trait Selector: Send + Sync {
    /// Pick a node for one call.
    ///
    /// Never blocks: fails with [`Error::NoAvailable`] when there is nothing to pick from.
    fn select(&self, cx: &PickContext) -> Result<(Node, DoneFunc), Error>;

    /// Replace the node snapshot.
    fn apply(&self, nodes: Vec<Node>);
}

/// Creates a fresh [`Selector`].
pub trait SelectorBuilder: Send + Sync {
    fn build(&self) -> Box<dyn Selector>;
}

/// The built-in balancing policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Policy {
    /// Power of two choices over EWMA-weighted nodes.
    #[default]
    P2c,
    /// Smooth weighted round robin.
    Wrr,
    /// Uniformly random.
    Random,
}

impl Policy {
    /// The selector builder pairing this policy with its preferred node flavour.
    pub fn builder(self) -> DefaultBuilder {
        match self {
            Policy::P2c => p2c::builder(),
            Policy::Wrr => wrr::builder(),
            Policy::Random => random::builder(),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Policy::P2c => p2c::NAME,
            Policy::Wrr => wrr::NAME,
            Policy::Random => random::NAME,
        }
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Policy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            p2c::NAME => Ok(Policy::P2c),
            wrr::NAME => Ok(Policy::Wrr),
            random::NAME => Ok(Policy::Random),
            other => Err(Error::InvalidConfig(format!(
                "unknown balancer policy '{}'",
                other
            ))),
        }
    }
}
