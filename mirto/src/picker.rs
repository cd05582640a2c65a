//! Bridges a [`Selector`] to a pool of transport connections.
//!
//! A [`Picker`] is built from the connections that are ready at one point in time, one
//! [`Node`] per connection, and is replaced as a whole whenever the pool changes.

use crate::{DoneFunc, Error, Node, PickContext, Selector, SelectorBuilder};
use std::collections::HashMap;

/// The connection chosen for one call, and the callback reporting its outcome.
pub struct PickResult<S> {
    pub node: Node,
    pub connection: S,
    pub done: DoneFunc,
}

/// Picks a ready connection per call through a [`Selector`].
pub struct Picker<S> {
    selector: Box<dyn Selector>,
    connections: HashMap<String, S>,
}

impl<S: Clone> Picker<S> {
    /// Build a picker over the `ready` connections, keyed by node address.
    ///
    /// A fresh selector is built and applied, so balancing statistics start over.
    pub fn build<I>(builder: &dyn SelectorBuilder, ready: I) -> Self
    where
        I: IntoIterator<Item = (Node, S)>,
    {
        let selector = builder.build();
        let mut connections = HashMap::new();
        let mut nodes = Vec::new();

        for (node, connection) in ready {
            if connections.contains_key(node.address()) {
                continue;
            }
            connections.insert(node.address().to_string(), connection);
            nodes.push(node);
        }

        selector.apply(nodes);

        Self {
            selector,
            connections,
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Pick a connection for one call.
    ///
    /// Fails with [`Error::NoSubConnAvailable`] when no connection is ready: the caller
    /// should wait for the next pool update.
    pub fn pick(&self, cx: &PickContext) -> Result<PickResult<S>, Error> {
        if self.connections.is_empty() {
            return Err(Error::NoSubConnAvailable);
        }

        let (node, done) = self.selector.select(cx)?;
        let connection = self
            .connections
            .get(node.address())
            .cloned()
            .ok_or(Error::NoSubConnAvailable)?;

        Ok(PickResult {
            node,
            connection,
            done,
        })
    }
}
