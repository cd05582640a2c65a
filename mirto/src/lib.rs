//! `mirto` runs gRPC services and balances the calls between them.
//!
//! It has two halves that share a service registry:
//! * [`App`] starts a set of [`Server`]s, registers the process as a [`ServiceInstance`]
//!   once they are all ready, and tears everything down on a termination signal, on
//!   [`App::stop`], or as soon as any server fails.
//! * [`LoadBalancedChannel`] is a tonic compatible channel that follows the instances of a
//!   service through a [`Discovery`] and picks a backend for every call with a [`Selector`].
//!
//! # Running an app
//!
//! ```rust,no_run
//! use mirto::{App, Ready, Server};
//! use tokio_util::sync::CancellationToken;
//!
//! struct Greeter;
//!
//! #[async_trait::async_trait]
//! impl Server for Greeter {
//!     async fn start(&self, ready: Ready, shutdown: CancellationToken) -> Result<(), anyhow::Error> {
//!         // Bind the listener, then tell the app we are serving.
//!         ready.notify();
//!         shutdown.cancelled().await;
//!         Ok(())
//!     }
//!
//!     async fn stop(&self) -> Result<(), anyhow::Error> {
//!         Ok(())
//!     }
//!
//!     fn address(&self) -> String {
//!         "127.0.0.1:9000".to_string()
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), mirto::Error> {
//!     App::builder()
//!         .name("greeter")
//!         .version("v1")
//!         .metadata("weight", "50")
//!         .server(Greeter)
//!         .build()?
//!         .run()
//!         .await
//! }
//! ```
//!
//! # Balancing calls
//!
//! A [`LoadBalancedChannel`] is built for a [`Target`]: either a service name resolved
//! through a [`Discovery`], or a fixed list of addresses.
//!
//! ```rust
//! use mirto::{Discovery, ServiceInstance, Watcher};
//!
//! // Knows a single instance, and never sees it change.
//! struct StaticDiscovery;
//!
//! #[async_trait::async_trait]
//! impl Discovery for StaticDiscovery {
//!     async fn get_service(&self, name: &str) -> Result<Vec<ServiceInstance>, anyhow::Error> {
//!         Ok(vec![ServiceInstance {
//!             id: "1".to_string(),
//!             name: name.to_string(),
//!             endpoints: vec!["grpc://127.0.0.1:9000".to_string()],
//!             ..Default::default()
//!         }])
//!     }
//!
//!     async fn watch(&self, _name: &str) -> Result<Box<dyn Watcher>, anyhow::Error> {
//!         Err(anyhow::anyhow!("watching is not supported"))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     use mirto::{LoadBalancedChannel, Policy, ResolutionStrategy};
//!     use std::time::Duration;
//!
//!     let load_balanced_channel = LoadBalancedChannel::builder("discovery:///greeter")
//!         .discovery(StaticDiscovery)
//!         .policy(Policy::Wrr)
//!         .timeout(Duration::from_secs(5))
//!         .resolution_strategy(ResolutionStrategy::Eager {
//!             timeout: Duration::from_secs(1),
//!         })
//!         .channel()
//!         .await
//!         .expect("failed to construct LoadBalancedChannel");
//! }
//! ```
//!
//! The channel implements tower's `Service` for `http::Request`, so any tonic generated
//! client can be created from it.
//!
//! # Internals
//! Every time the set of ready connections changes, a new [`Picker`] is built over a
//! fresh [`Selector`] and swapped in atomically. Calls issued while no connection is ready
//! wait for the next swap, bounded by the channel timeout.

mod app;
mod balanced_channel;
mod error;
mod picker;
mod registry;
pub mod selector;
mod server;
mod service_probe;

#[cfg(unix)]
pub use app::SignalKind;
pub use app::{App, AppBuilder, State};
pub use balanced_channel::*;
pub use error::Error;
pub use picker::{PickResult, Picker};
pub use registry::{Discovery, Registrar, ServiceInstance, Watcher};
pub use selector::{
    Balancer, BalancerBuilder, DefaultBuilder, DefaultSelector, DoneFunc, DoneInfo, Node, Peer,
    PickContext, Policy, Selector, SelectorBuilder, WeightedNode, WeightedNodeBuilder,
};
pub use server::{Ready, Server};
