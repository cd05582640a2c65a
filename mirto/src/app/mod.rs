//! Process lifecycle: run a set of servers, register the process as a service
//! instance, and tear everything down on a signal or on the first failure.

mod group;
mod options;
mod signal;

pub use options::AppBuilder;
#[cfg(unix)]
pub use signal::SignalKind;

use crate::{server::Ready, Error, Registrar, ServiceInstance};
use group::TaskGroup;
use options::AppOptions;
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicU8, Ordering},
    Arc,
};
use tokio_util::sync::CancellationToken;

/// Lifecycle state of an [`App`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Built, not yet running.
    Created,
    /// [`App::run`] is starting or serving.
    Running,
    /// A shutdown was requested.
    Stopping,
    /// Every server task finished. Terminal.
    Stopped,
}

impl State {
    fn from_u8(state: u8) -> Self {
        match state {
            0 => State::Created,
            1 => State::Running,
            2 => State::Stopping,
            _ => State::Stopped,
        }
    }
}

/// Runs servers side by side and keeps the registry in sync with their lifecycle.
///
/// ```no_run
/// use mirto::{App, Ready, Server};
/// use tokio_util::sync::CancellationToken;
///
/// struct Noop;
///
/// #[async_trait::async_trait]
/// impl Server for Noop {
///     async fn start(&self, ready: Ready, shutdown: CancellationToken) -> Result<(), anyhow::Error> {
///         ready.notify();
///         shutdown.cancelled().await;
///         Ok(())
///     }
///
///     async fn stop(&self) -> Result<(), anyhow::Error> {
///         Ok(())
///     }
///
///     fn address(&self) -> String {
///         "127.0.0.1:9000".to_string()
///     }
/// }
///
/// #[tokio::main]
/// async fn main() -> Result<(), mirto::Error> {
///     let app = App::builder().name("orders").server(Noop).build()?;
///     app.run().await
/// }
/// ```
#[derive(Clone)]
pub struct App {
    inner: Arc<Inner>,
}

struct Inner {
    options: AppOptions,
    state: AtomicU8,
    binding: Mutex<Binding>,
    shutdown: CancellationToken,
}

/// The instance built by `run`, and whether the registry currently knows it.
#[derive(Default)]
struct Binding {
    instance: Option<Arc<ServiceInstance>>,
    registered: bool,
    // Set by the first deregistration. A registration completing afterwards is undone.
    stopping: bool,
}

impl App {
    /// Start configuring an [`App`].
    pub fn builder() -> AppBuilder {
        AppBuilder::new()
    }

    pub(crate) fn from_options(options: AppOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                options,
                state: AtomicU8::new(State::Created as u8),
                binding: Mutex::new(Binding::default()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn state(&self) -> State {
        State::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// The instance registered by [`App::run`], once it has been built.
    pub fn instance(&self) -> Option<Arc<ServiceInstance>> {
        self.inner.binding.lock().instance.clone()
    }

    /// Start every server and block until they have all stopped.
    ///
    /// The instance is registered once every server is ready. A termination signal, a call
    /// to [`App::stop`], or the failure of any server deregisters the instance and shuts
    /// every server down. Returns the first error reported by any server, or `Ok(())` after
    /// an orderly shutdown.
    pub async fn run(&self) -> Result<(), Error> {
        let inner = &self.inner;
        inner
            .state
            .compare_exchange(
                State::Created as u8,
                State::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| Error::AlreadyStarted)?;

        let instance = Arc::new(self.build_instance());
        inner.binding.lock().instance = Some(Arc::clone(&instance));
        tracing::info!(
            id = %instance.id,
            name = %instance.name,
            endpoints = ?instance.endpoints,
            "starting app"
        );

        let shutdown = inner.shutdown.clone();
        let mut group = TaskGroup::new(shutdown.clone());
        let mut readiness = Vec::with_capacity(inner.options.servers.len());

        for (index, server) in inner.options.servers.iter().enumerate() {
            let stop_timeout = inner.options.stop_timeout;
            let (stopping, token) = (Arc::clone(server), shutdown.clone());
            group.spawn(async move {
                token.cancelled().await;
                tracing::info!(server = index, "stopping server");
                match tokio::time::timeout(stop_timeout, stopping.stop()).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(source)) => Err(Error::StopFailed { index, source }),
                    Err(elapsed) => Err(Error::StopFailed {
                        index,
                        source: anyhow::Error::new(elapsed).context("server did not stop in time"),
                    }),
                }
            });

            let (ready, ready_receiver) = Ready::channel();
            readiness.push(ready_receiver);
            let (starting, token) = (Arc::clone(server), shutdown.clone());
            group.spawn(async move {
                tracing::info!(server = index, address = %starting.address(), "starting server");
                starting
                    .start(ready, token)
                    .await
                    .map_err(|source| Error::StartFailed { index, source })
            });
        }

        self.spawn_signal_handler(&mut group);
        self.spawn_deregistration(&mut group);

        let ready_timeout = inner.options.ready_timeout;
        let all_ready = tokio::select! {
            _ = shutdown.cancelled() => false,
            _ = futures::future::join_all(readiness) => true,
            _ = tokio::time::sleep(ready_timeout) => {
                group.fail(Error::NotReady(ready_timeout));
                false
            }
        };

        if all_ready && !shutdown.is_cancelled() {
            if let Err(err) = self.register(&instance).await {
                group.fail(err);
            }
        }

        let result = group.wait().await;
        inner.state.store(State::Stopped as u8, Ordering::Release);
        tracing::info!(id = %instance.id, "app stopped");
        result
    }

    /// Deregister the instance, then shut every server down.
    ///
    /// Safe to call any number of times, concurrently with [`App::run`]. The shutdown
    /// happens even if deregistration fails, in which case the error is returned.
    pub async fn stop(&self) -> Result<(), Error> {
        let inner = &self.inner;
        let _ = inner.state.compare_exchange(
            State::Running as u8,
            State::Stopping as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        let _ = inner.state.compare_exchange(
            State::Created as u8,
            State::Stopped as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );

        let result = self.deregister().await;
        inner.shutdown.cancel();
        result
    }

    fn spawn_signal_handler(&self, group: &mut TaskGroup) {
        let app = self.clone();
        let token = self.inner.shutdown.clone();
        #[cfg(unix)]
        let signals = self.inner.options.signals.clone();

        group.spawn(async move {
            #[cfg(unix)]
            let received = signal::wait_for(&signals);
            #[cfg(not(unix))]
            let received = signal::wait_for_ctrl_c();

            tokio::select! {
                _ = token.cancelled() => Ok(()),
                signal = received => {
                    let signal = signal?;
                    tracing::info!(?signal, "received shutdown signal");
                    app.stop().await
                }
            }
        });
    }

    /// Withdraw the instance as soon as the app shuts down, whatever the cause, while the
    /// servers drain.
    fn spawn_deregistration(&self, group: &mut TaskGroup) {
        let app = self.clone();
        let token = self.inner.shutdown.clone();

        group.spawn(async move {
            token.cancelled().await;
            if let Err(err) = app.deregister().await {
                tracing::warn!(error = %err, "failed to deregister on shutdown");
            }
            Ok(())
        });
    }

    #[tracing::instrument(level = "debug", skip_all, fields(id = %instance.id))]
    async fn register(&self, instance: &ServiceInstance) -> Result<(), Error> {
        let inner = &self.inner;
        let registrar = match &inner.options.registrar {
            Some(registrar) => registrar,
            None => return Ok(()),
        };
        let stopping = inner.binding.lock().stopping;
        if stopping {
            return Ok(());
        }

        match tokio::time::timeout(inner.options.registrar_timeout, registrar.register(instance))
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(source)) => return Err(Error::Registration(source)),
            Err(elapsed) => {
                return Err(Error::Registration(
                    anyhow::Error::new(elapsed).context("registration timed out"),
                ))
            }
        }

        let stopping = {
            let mut binding = inner.binding.lock();
            let stopping = binding.stopping;
            binding.registered = !stopping;
            stopping
        };
        if stopping {
            // A stop that ran during registration found nothing to deregister.
            tracing::info!("app stopped while registering, withdrawing instance");
            if let Err(err) = self.withdraw(registrar.as_ref(), instance).await {
                tracing::warn!(error = %err, "failed to deregister after concurrent stop");
            }
            return Ok(());
        }

        tracing::info!("registered service instance");
        Ok(())
    }

    async fn deregister(&self) -> Result<(), Error> {
        let inner = &self.inner;
        let registrar = match &inner.options.registrar {
            Some(registrar) => registrar,
            None => return Ok(()),
        };
        // Claim the registration so that concurrent stops deregister once.
        let instance = {
            let mut binding = inner.binding.lock();
            binding.stopping = true;
            let instance = match (&binding.instance, binding.registered) {
                (Some(instance), true) => Arc::clone(instance),
                _ => return Ok(()),
            };
            binding.registered = false;
            instance
        };

        tracing::info!(id = %instance.id, "deregistering service instance");
        let result = self.withdraw(registrar.as_ref(), &instance).await;
        if result.is_err() {
            inner.binding.lock().registered = true;
        }
        result
    }

    async fn withdraw(
        &self,
        registrar: &dyn Registrar,
        instance: &ServiceInstance,
    ) -> Result<(), Error> {
        match tokio::time::timeout(self.inner.options.stop_timeout, registrar.deregister(instance))
            .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => Err(Error::Deregistration(source)),
            Err(elapsed) => Err(Error::Deregistration(
                anyhow::Error::new(elapsed).context("deregistration timed out"),
            )),
        }
    }

    fn build_instance(&self) -> ServiceInstance {
        let options = &self.inner.options;

        let mut endpoints: Vec<String> = options.endpoints.iter().map(endpoint_string).collect();
        for server in &options.servers {
            let endpoint = match server.endpoint() {
                Some(endpoint) => endpoint_string(&endpoint),
                None => format!("{}://{}", server.scheme(), server.address()),
            };
            endpoints.push(endpoint);
        }

        ServiceInstance {
            id: options.id.clone(),
            name: options.name.clone(),
            version: options.version.clone(),
            endpoints,
            metadata: options.metadata.clone(),
        }
    }
}

/// Render an endpoint as `scheme://authority`, without the root path `Uri` appends.
fn endpoint_string(uri: &http::Uri) -> String {
    match (uri.scheme_str(), uri.authority()) {
        (Some(scheme), Some(authority)) if uri.path() == "/" => {
            format!("{}://{}", scheme, authority)
        }
        _ => uri.to_string(),
    }
}
