//! Defines the interfaces that [`App`](crate::App) and
//! [`LoadBalancedChannel`](crate::LoadBalancedChannel) require from a service registry.
//!
//! Concrete backends (etcd, consul, ...) live outside of this crate.

use std::collections::HashMap;

/// A discoverable instance of a service, as stored in the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceInstance {
    /// Unique id of the instance in the registry.
    pub id: String,
    /// Logical service name, shared by all instances of a service.
    pub name: String,
    /// Version of the service.
    pub version: String,
    /// One endpoint per transport scheme, e.g `grpc://127.0.0.1:9000`.
    pub endpoints: Vec<String>,
    /// Opaque metadata published alongside the instance.
    pub metadata: HashMap<String, String>,
}

impl ServiceInstance {
    /// Return the `host:port` authority of every endpoint using `scheme`.
    ///
    /// Endpoints that are not valid URIs, or lack an authority, are skipped.
    ///
    /// ```
    /// let instance = mirto::ServiceInstance {
    ///     endpoints: vec![
    ///         "grpc://10.0.0.1:9000".to_string(),
    ///         "http://10.0.0.1:8000".to_string(),
    ///     ],
    ///     ..Default::default()
    /// };
    /// assert_eq!(instance.endpoints_for("grpc"), vec!["10.0.0.1:9000".to_string()]);
    /// ```
    pub fn endpoints_for(&self, scheme: &str) -> Vec<String> {
        self.endpoints
            .iter()
            .filter_map(|endpoint| {
                let uri = endpoint.parse::<http::Uri>().ok()?;
                if uri.scheme_str()? != scheme {
                    return None;
                }
                uri.authority().map(|authority| authority.to_string())
            })
            .collect()
    }
}

/// Registers and deregisters service instances.
#[async_trait::async_trait]
pub trait Registrar: Send + Sync {
    /// Publish `instance` to the registry.
    async fn register(&self, instance: &ServiceInstance) -> Result<(), anyhow::Error>;

    /// Remove `instance` from the registry.
    async fn deregister(&self, instance: &ServiceInstance) -> Result<(), anyhow::Error>;
}

/// Looks up and watches the instances of a service.
#[async_trait::async_trait]
pub trait Discovery: Send + Sync {
    /// Return the current instances registered under `name`.
    async fn get_service(&self, name: &str) -> Result<Vec<ServiceInstance>, anyhow::Error>;

    /// Start watching the instances registered under `name`.
    async fn watch(&self, name: &str) -> Result<Box<dyn Watcher>, anyhow::Error>;
}

/// A live watch over the instances of one service.
#[async_trait::async_trait]
pub trait Watcher: Send {
    /// Block until the instance list changes, then return the full list.
    ///
    /// The first call returns the current list immediately.
    async fn next(&mut self) -> Result<Vec<ServiceInstance>, anyhow::Error>;

    /// End the watch. Subsequent calls to [`Watcher::next`] fail.
    async fn stop(&mut self) -> Result<(), anyhow::Error>;
}
