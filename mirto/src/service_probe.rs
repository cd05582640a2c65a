//! Keeps the connection pool of a [`LoadBalancedChannel`](crate::LoadBalancedChannel)
//! in sync with the instances published by a [`Discovery`].

use crate::{
    balanced_channel::{ConnectOptions, Connector, PoolReporter},
    Discovery, Node, ServiceInstance, Watcher,
};
use std::{collections::HashMap, sync::Arc};
use tokio::time::Duration;

// Delay before watching again after the watch failed.
const RETRY_INTERVAL: Duration = Duration::from_secs(1);

pub(crate) struct ServiceProbe<C: Connector> {
    service: String,
    scheme: String,
    discovery: Arc<dyn Discovery>,
    connector: C,
    options: ConnectOptions,
    reporter: PoolReporter<C::Connection>,
    connections: HashMap<String, C::Connection>,
}

impl<C: Connector> ServiceProbe<C> {
    pub(crate) fn new(
        service: String,
        scheme: String,
        discovery: Arc<dyn Discovery>,
        connector: C,
        options: ConnectOptions,
        reporter: PoolReporter<C::Connection>,
    ) -> Self {
        Self {
            service,
            scheme,
            discovery,
            connector,
            options,
            reporter,
            connections: HashMap::new(),
        }
    }

    /// Look the instances up once and report them.
    pub(crate) async fn probe_once(&mut self) -> Result<usize, anyhow::Error> {
        let instances = self.discovery.get_service(&self.service).await?;
        Ok(self.apply_instances(instances))
    }

    /// Follow the instances until the channel is dropped.
    pub(crate) async fn probe(mut self) {
        loop {
            let watcher = tokio::select! {
                _ = self.reporter.closed() => return,
                watcher = self.discovery.watch(&self.service) => watcher,
            };
            let mut watcher = match watcher {
                Ok(watcher) => watcher,
                Err(err) => {
                    tracing::warn!(error = %format!("{:#}", err), "failed to watch service");
                    tokio::time::sleep(RETRY_INTERVAL).await;
                    continue;
                }
            };

            if self.follow(watcher.as_mut()).await {
                if let Err(err) = watcher.stop().await {
                    tracing::debug!(error = %format!("{:#}", err), "failed to stop watcher");
                }
                return;
            }
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
    }

    /// Apply every update from `watcher`. Returns `true` once the channel is gone,
    /// `false` if the watch failed and should be restarted.
    async fn follow(&mut self, watcher: &mut dyn Watcher) -> bool {
        loop {
            let update = tokio::select! {
                _ = self.reporter.closed() => return true,
                update = watcher.next() => update,
            };

            match update {
                Ok(instances) => {
                    self.apply_instances(instances);
                }
                Err(err) => {
                    tracing::warn!(error = %format!("{:#}", err), "service watch failed");
                    return false;
                }
            }
        }
    }

    /// Report a pool made of one connection per endpoint of `instances`.
    ///
    /// Connections to addresses that are still present are reused. An empty update is
    /// ignored, so a registry glitch does not drain the pool.
    pub(crate) fn apply_instances(&mut self, instances: Vec<ServiceInstance>) -> usize {
        if instances.is_empty() {
            tracing::warn!(service = %self.service, "ignoring empty instance list");
            return self.connections.len();
        }

        let mut connections = HashMap::new();
        let mut ready = Vec::new();

        for instance in instances {
            let instance = Arc::new(instance);
            for address in instance.endpoints_for(&self.scheme) {
                if connections.contains_key(&address) {
                    continue;
                }
                let node = Node::new(
                    self.scheme.as_str(),
                    address.as_str(),
                    Some(Arc::clone(&instance)),
                );

                let connection = match self.connections.remove(&address) {
                    Some(connection) => connection,
                    None => match self.connector.connect(&node, &self.options) {
                        Ok(connection) => {
                            tracing::debug!(address = %address, "connected to new endpoint");
                            connection
                        }
                        Err(err) => {
                            tracing::warn!(
                                address = %address,
                                error = %format!("{:#}", err),
                                "failed to connect"
                            );
                            continue;
                        }
                    },
                };

                connections.insert(address, connection.clone());
                ready.push((node, connection));
            }
        }

        for address in self.connections.keys() {
            tracing::debug!(address = %address, "removing endpoint");
        }
        self.connections = connections;

        let ready = self.reporter.report(ready);
        tracing::info!(service = %self.service, ready, "updated connection pool");
        ready
    }
}
