//! Provides the builder and implementation of a client-side load balanced channel
//! that follows the instances of a service through its [`Discovery`].

use crate::{
    picker::{PickResult, Picker},
    service_probe::ServiceProbe,
    Discovery, DoneFunc, DoneInfo, Error, Node, Peer, PickContext, Policy, SelectorBuilder,
};
use arc_swap::ArcSwapOption;
use http::Request;
use std::{
    future::Future,
    pin::Pin,
    str::FromStr,
    sync::{Arc, Weak},
    task::{Context, Poll},
};
use tokio::{sync::watch, time::Duration};
use tokio_util::sync::{CancellationToken, DropGuard};
use tonic::transport::{Channel, Endpoint};
use tower::ServiceExt;
use tower_service::Service;
use tracing_futures::Instrument;

/// Error type surfaced by [`LoadBalancedChannel`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

// Per-request timeout applied when none is configured.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// The set of backends a [`LoadBalancedChannel`] balances over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Follow the instances registered under a service name, e.g `discovery:///orders`.
    Discovery(String),
    /// Balance over a fixed list of addresses, e.g `direct:///10.0.0.1:9000,10.0.0.2:9000`.
    Direct(Vec<String>),
}

impl FromStr for Target {
    type Err = Error;

    /// ```
    /// use mirto::Target;
    ///
    /// assert_eq!("discovery:///orders".parse::<Target>().unwrap(), Target::Discovery("orders".into()));
    /// assert_eq!("orders".parse::<Target>().unwrap(), Target::Discovery("orders".into()));
    /// assert_eq!(
    ///     "direct:///10.0.0.1:9000,10.0.0.2:9000".parse::<Target>().unwrap(),
    ///     Target::Direct(vec!["10.0.0.1:9000".into(), "10.0.0.2:9000".into()]),
    /// );
    /// ```
    fn from_str(target: &str) -> Result<Self, Self::Err> {
        let (kind, rest) = match target.split_once(":///") {
            Some((kind, rest)) => (kind, rest),
            None => ("discovery", target),
        };

        match kind {
            "discovery" if !rest.is_empty() && !rest.contains('/') => {
                Ok(Target::Discovery(rest.to_string()))
            }
            "direct" => {
                let addresses: Vec<String> = rest
                    .split(',')
                    .map(str::trim)
                    .filter(|address| !address.is_empty())
                    .map(ToString::to_string)
                    .collect();
                if addresses.is_empty() {
                    return Err(Error::InvalidConfig(format!(
                        "target '{}' has no address",
                        target
                    )));
                }
                Ok(Target::Direct(addresses))
            }
            _ => Err(Error::InvalidConfig(format!(
                "target '{}' is neither a discovery nor a direct target",
                target
            ))),
        }
    }
}

impl TryFrom<&str> for Target {
    type Error = Error;

    fn try_from(target: &str) -> Result<Self, Self::Error> {
        target.parse()
    }
}

impl TryFrom<String> for Target {
    type Error = Error;

    fn try_from(target: String) -> Result<Self, Self::Error> {
        target.parse()
    }
}

/// Timeouts applied to every connection a [`Connector`] opens.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectOptions {
    pub timeout: Option<Duration>,
    pub connect_timeout: Option<Duration>,
}

/// Opens a transport connection to a [`Node`].
pub trait Connector: Send + Sync + 'static {
    type Connection: Clone + Send + Sync + 'static;

    fn connect(
        &self,
        node: &Node,
        options: &ConnectOptions,
    ) -> Result<Self::Connection, anyhow::Error>;
}

/// Opens lazily connected tonic [`Channel`]s over plaintext HTTP/2.
#[derive(Debug, Clone, Copy, Default)]
pub struct TonicConnector;

impl Connector for TonicConnector {
    type Connection = Channel;

    fn connect(&self, node: &Node, options: &ConnectOptions) -> Result<Channel, anyhow::Error> {
        let mut endpoint = Endpoint::from_shared(format!("http://{}", node.address()))?;

        if let Some(timeout) = options.timeout {
            endpoint = endpoint.timeout(timeout);
        }
        if let Some(connect_timeout) = options.connect_timeout {
            endpoint = endpoint.connect_timeout(connect_timeout);
        }

        Ok(endpoint.connect_lazy())
    }
}

/// The current [`Picker`] of a channel, and a notification for every replacement.
struct Pool<S> {
    picker: ArcSwapOption<Picker<S>>,
    updates: watch::Sender<u64>,
    selector_builder: Arc<dyn SelectorBuilder>,
    wait_timeout: Option<Duration>,
    // Stops the probe once the last clone of the channel is gone.
    _closed: DropGuard,
}

impl<S: Clone + Send + Sync + 'static> Pool<S> {
    fn report<I>(&self, ready: I) -> usize
    where
        I: IntoIterator<Item = (Node, S)>,
    {
        let picker = Picker::build(self.selector_builder.as_ref(), ready);
        let ready = picker.len();
        self.picker.store(Some(Arc::new(picker)));
        self.updates.send_modify(|version| *version += 1);
        ready
    }

    /// Pick a connection, waiting for pool updates while none is ready.
    async fn pick(&self, cx: &PickContext) -> Result<PickResult<S>, Error> {
        let mut updates = self.updates.subscribe();
        loop {
            if let Some(picker) = self.picker.load_full() {
                match picker.pick(cx) {
                    Ok(result) => return Ok(result),
                    Err(err) if err.is_unavailable() => {}
                    Err(err) => return Err(err),
                }
            }
            if updates.changed().await.is_err() {
                return Err(Error::NoSubConnAvailable);
            }
        }
    }
}

/// Reports the ready connections of a [`LoadBalancedChannel`] built with
/// [`LoadBalancedChannel::with_reporter`].
pub struct PoolReporter<S> {
    pool: Weak<Pool<S>>,
    closed: CancellationToken,
}

impl<S: Clone + Send + Sync + 'static> PoolReporter<S> {
    /// Replace the ready connections. Returns how many distinct connections are ready,
    /// or `0` once the channel is gone.
    pub fn report<I>(&self, ready: I) -> usize
    where
        I: IntoIterator<Item = (Node, S)>,
    {
        match self.pool.upgrade() {
            Some(pool) => pool.report(ready),
            None => 0,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Completes once every clone of the channel has been dropped.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

/// Implements tower [`Service`] for a client-side load balanced [`Channel`].
///
/// Every call is routed to the connection picked by the configured [`Policy`] (`The Power
/// of Two Choices` by default), and its outcome is fed back to the policy. Calls issued
/// while no backend is ready wait for the next pool update, up to the configured timeout.
///
/// ```rust
/// #[tokio::main]
/// async fn main() {
///     use mirto::LoadBalancedChannel;
///
///     let load_balanced_channel = LoadBalancedChannel::builder("direct:///127.0.0.1:5000")
///         .channel()
///         .await
///         .expect("failed to construct LoadBalancedChannel");
/// }
/// ```
pub struct LoadBalancedChannel<S = Channel> {
    pool: Arc<Pool<S>>,
}

impl<S> Clone for LoadBalancedChannel<S> {
    fn clone(&self) -> Self {
        Self {
            pool: Arc::clone(&self.pool),
        }
    }
}

impl<S> std::fmt::Debug for LoadBalancedChannel<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadBalancedChannel").finish_non_exhaustive()
    }
}

impl LoadBalancedChannel {
    /// Start configuring a `LoadBalancedChannel` for `target`, e.g `discovery:///orders`
    /// or `direct:///10.0.0.1:9000,10.0.0.2:9000`.
    pub fn builder<T>(target: T) -> LoadBalancedChannelBuilder<T>
    where
        T: TryInto<Target>,
        T::Error: Into<BoxError>,
    {
        LoadBalancedChannelBuilder::new_with_target(target)
    }
}

impl<S: Clone + Send + Sync + 'static> LoadBalancedChannel<S> {
    /// Create a channel whose ready connections are reported by hand through the
    /// returned [`PoolReporter`], for transports other than tonic.
    pub fn with_reporter<B>(
        selector_builder: B,
        wait_timeout: Option<Duration>,
    ) -> (Self, PoolReporter<S>)
    where
        B: SelectorBuilder + 'static,
    {
        Self::with_shared_reporter(Arc::new(selector_builder), wait_timeout)
    }

    fn with_shared_reporter(
        selector_builder: Arc<dyn SelectorBuilder>,
        wait_timeout: Option<Duration>,
    ) -> (Self, PoolReporter<S>) {
        let closed = CancellationToken::new();
        let (updates, _) = watch::channel(0);
        let pool = Arc::new(Pool {
            picker: ArcSwapOption::empty(),
            updates,
            selector_builder,
            wait_timeout,
            _closed: closed.clone().drop_guard(),
        });

        let reporter = PoolReporter {
            pool: Arc::downgrade(&pool),
            closed,
        };
        (Self { pool }, reporter)
    }
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for LoadBalancedChannel<S>
where
    S: Service<Request<ReqBody>, Response = http::Response<ResBody>> + Clone + Send + Sync + 'static,
    S::Error: Into<BoxError>,
    S::Future: Send,
    ReqBody: Send + 'static,
    ResBody: Send + 'static,
{
    type Response = http::Response<ResBody>;
    type Error = BoxError;
    type Future = BoxFuture<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // Readiness is resolved per call, once a connection has been picked.
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        let pool = Arc::clone(&self.pool);
        Box::pin(async move {
            let cx = match request.extensions().get::<Arc<Peer>>() {
                Some(peer) => PickContext::with_peer(Arc::clone(peer)),
                None => PickContext::default(),
            };

            let picked = match pool.wait_timeout {
                Some(timeout) => tokio::time::timeout(timeout, pool.pick(&cx))
                    .await
                    .unwrap_or(Err(Error::NoSubConnAvailable)),
                None => pool.pick(&cx).await,
            };
            let PickResult {
                node,
                mut connection,
                done,
            } = picked?;
            let done = CallGuard(Some(done));

            tracing::trace!(address = node.address(), "routing call");

            if let Err(err) = ServiceExt::<Request<ReqBody>>::ready(&mut connection).await {
                let err: BoxError = err.into();
                done.finish(&DoneInfo {
                    err: Some(&*err),
                    bytes_sent: Some(0),
                    ..Default::default()
                });
                return Err(err);
            }

            let bytes_sent = content_length(request.headers());
            match connection.call(request).await {
                Ok(response) => {
                    done.finish(&DoneInfo {
                        err: None,
                        bytes_sent,
                        bytes_received: content_length(response.headers()),
                        reply_md: Some(response.headers()),
                    });
                    Ok(response)
                }
                Err(err) => {
                    let err: BoxError = err.into();
                    done.finish(&DoneInfo {
                        err: Some(&*err),
                        bytes_sent,
                        ..Default::default()
                    });
                    Err(err)
                }
            }
        })
    }
}

/// Invokes the [`DoneFunc`] of a picked call once, reporting the call as cancelled
/// when its future is dropped before completion.
struct CallGuard(Option<DoneFunc>);

impl CallGuard {
    fn finish(mut self, info: &DoneInfo<'_>) {
        if let Some(done) = self.0.take() {
            done(info);
        }
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        if let Some(done) = self.0.take() {
            let status = tonic::Status::cancelled("call dropped before completion");
            done(&DoneInfo {
                err: Some(&status),
                ..Default::default()
            });
        }
    }
}

fn content_length(headers: &http::HeaderMap) -> Option<u64> {
    headers
        .get(http::header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

/// Enumerates the different resolution strategies that
/// the [`LoadBalancedChannelBuilder`] supports.
pub enum ResolutionStrategy {
    /// Creates the channel without looking up an initial set of instances.
    Lazy,
    /// Looks up the instances before creating the channel
    /// in order to start with a non-empty set of nodes.
    Eager { timeout: Duration },
}

/// Builder to configure and create a [`LoadBalancedChannel`].
pub struct LoadBalancedChannelBuilder<T, C = TonicConnector> {
    target: T,
    discovery: Option<Arc<dyn Discovery>>,
    selector_builder: Arc<dyn SelectorBuilder>,
    scheme: String,
    resolution_strategy: ResolutionStrategy,
    timeout: Option<Duration>,
    connect_timeout: Option<Duration>,
    connector: C,
}

impl<T> LoadBalancedChannelBuilder<T, TonicConnector>
where
    T: TryInto<Target>,
    T::Error: Into<BoxError>,
{
    /// Set the [`Target`] to balance over.
    ///
    /// A discovery target is resolved through the [`Discovery`] set with
    /// [`LoadBalancedChannelBuilder::discovery`], keeping the endpoints whose scheme
    /// matches [`LoadBalancedChannelBuilder::scheme`].
    pub fn new_with_target(target: T) -> Self {
        Self {
            target,
            discovery: None,
            selector_builder: Arc::new(Policy::default().builder()),
            scheme: "grpc".to_string(),
            resolution_strategy: ResolutionStrategy::Lazy,
            timeout: None,
            connect_timeout: None,
            connector: TonicConnector,
        }
    }
}

impl<T, C> LoadBalancedChannelBuilder<T, C>
where
    T: TryInto<Target>,
    T::Error: Into<BoxError>,
    C: Connector,
{
    /// Set a custom [`Connector`].
    pub fn connector<U: Connector>(self, connector: U) -> LoadBalancedChannelBuilder<T, U> {
        LoadBalancedChannelBuilder {
            connector,
            target: self.target,
            discovery: self.discovery,
            selector_builder: self.selector_builder,
            scheme: self.scheme,
            resolution_strategy: self.resolution_strategy,
            timeout: self.timeout,
            connect_timeout: self.connect_timeout,
        }
    }

    /// Set the [`Discovery`] used to resolve a discovery target.
    pub fn discovery<D: Discovery + 'static>(self, discovery: D) -> Self {
        Self {
            discovery: Some(Arc::new(discovery)),
            ..self
        }
    }

    /// Set the balancing [`Policy`]. Default is [`Policy::P2c`].
    pub fn policy(self, policy: Policy) -> Self {
        Self {
            selector_builder: Arc::new(policy.builder()),
            ..self
        }
    }

    /// Set a custom [`SelectorBuilder`], replacing the policy.
    pub fn selector_builder<B: SelectorBuilder + 'static>(self, selector_builder: B) -> Self {
        Self {
            selector_builder: Arc::new(selector_builder),
            ..self
        }
    }

    /// Set the endpoint scheme to keep from discovered instances. Default is `grpc`.
    pub fn scheme<S: Into<String>>(self, scheme: S) -> Self {
        Self {
            scheme: scheme.into(),
            ..self
        }
    }

    /// Set a request timeout that will be applied to every new connection, and to the
    /// time a call may wait for a ready connection.
    ///
    /// Default is 2 seconds.
    pub fn timeout(self, timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..self
        }
    }

    /// Set a connection timeout that will be applied to every new connection.
    ///
    /// Defaults to the overall request `timeout` if not set.
    pub fn connect_timeout(self, connect_timeout: Duration) -> Self {
        Self {
            connect_timeout: Some(connect_timeout),
            ..self
        }
    }

    /// Set the [`ResolutionStrategy`].
    ///
    /// Default set to [`ResolutionStrategy::Lazy`].
    ///
    /// If [`ResolutionStrategy::Eager`] is set, the instances are looked up once before
    /// the [`LoadBalancedChannel`] is created, which ensures that the channel starts with
    /// a non-empty set of nodes. If the lookup fails the channel creation also fails.
    pub fn resolution_strategy(self, resolution_strategy: ResolutionStrategy) -> Self {
        Self {
            resolution_strategy,
            ..self
        }
    }

    /// Construct a [`LoadBalancedChannel`] from the [`LoadBalancedChannelBuilder`] instance.
    pub async fn channel(self) -> Result<LoadBalancedChannel<C::Connection>, Error> {
        let target: Target = self
            .target
            .try_into()
            .map_err(|err| {
                let err: BoxError = err.into();
                Error::InvalidConfig(err.to_string())
            })?;

        let timeout = self.timeout.unwrap_or(DEFAULT_TIMEOUT);
        let options = ConnectOptions {
            timeout: Some(timeout),
            connect_timeout: self.connect_timeout.or(Some(timeout)),
        };

        let (channel, reporter) =
            LoadBalancedChannel::with_shared_reporter(self.selector_builder, Some(timeout));

        match target {
            Target::Direct(addresses) => {
                let ready = addresses
                    .into_iter()
                    .map(|address| {
                        let node = Node::new(self.scheme.clone(), address, None);
                        let connection = self
                            .connector
                            .connect(&node, &options)
                            .map_err(|err| Error::InvalidConfig(format!("{:#}", err)))?;
                        Ok((node, connection))
                    })
                    .collect::<Result<Vec<_>, Error>>()?;
                reporter.report(ready);
            }
            Target::Discovery(name) => {
                let discovery = self.discovery.ok_or_else(|| {
                    Error::InvalidConfig(format!(
                        "a discovery is required to resolve service '{}'",
                        name
                    ))
                })?;

                let mut probe = ServiceProbe::new(
                    name.clone(),
                    self.scheme,
                    discovery,
                    self.connector,
                    options,
                    reporter,
                );

                if let ResolutionStrategy::Eager { timeout } = self.resolution_strategy {
                    // Make sure we have looked the instances up once before we create the channel.
                    tokio::time::timeout(timeout, probe.probe_once())
                        .await
                        .map_err(|_| {
                            Error::InvalidConfig(format!(
                                "timed out while resolving service '{}'",
                                name
                            ))
                        })?
                        .map_err(|err| {
                            Error::InvalidConfig(format!(
                                "failed to resolve service '{}': {:#}",
                                name, err
                            ))
                        })?;
                }

                tokio::spawn(
                    probe
                        .probe()
                        .instrument(tracing::info_span!("service_probe", service = %name)),
                );
            }
        }

        Ok(channel)
    }
}

const _: () = {
    const fn assert_is_send<T: Send>() {}
    assert_is_send::<LoadBalancedChannelBuilder<Target>>();
    assert_is_send::<LoadBalancedChannel>();
};
