//! Builder and options of an [`App`].

use super::App;
use crate::{Error, Registrar, Server};
use std::{collections::HashMap, sync::Arc, time::Duration};

#[cfg(unix)]
use super::signal::{self, SignalKind};

const DEFAULT_REGISTRAR_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) struct AppOptions {
    pub(crate) id: String,
    pub(crate) name: String,
    pub(crate) version: String,
    pub(crate) metadata: HashMap<String, String>,
    pub(crate) endpoints: Vec<http::Uri>,
    pub(crate) servers: Vec<Arc<dyn Server>>,
    pub(crate) registrar: Option<Arc<dyn Registrar>>,
    #[cfg(unix)]
    pub(crate) signals: Vec<SignalKind>,
    pub(crate) registrar_timeout: Duration,
    pub(crate) stop_timeout: Duration,
    pub(crate) ready_timeout: Duration,
}

/// Builder to configure and create an [`App`].
pub struct AppBuilder {
    options: AppOptions,
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AppBuilder {
    /// Start configuring an [`App`] with a random instance id and the default timeouts.
    pub fn new() -> Self {
        Self {
            options: AppOptions {
                id: uuid::Uuid::new_v4().to_string(),
                name: String::new(),
                version: String::new(),
                metadata: HashMap::new(),
                endpoints: Vec::new(),
                servers: Vec::new(),
                registrar: None,
                #[cfg(unix)]
                signals: signal::default_signals(),
                registrar_timeout: DEFAULT_REGISTRAR_TIMEOUT,
                stop_timeout: DEFAULT_STOP_TIMEOUT,
                ready_timeout: DEFAULT_READY_TIMEOUT,
            },
        }
    }

    /// Set the instance id. Defaults to a random UUID.
    pub fn id<T: Into<String>>(mut self, id: T) -> Self {
        self.options.id = id.into();
        self
    }

    /// Set the service name. Required.
    pub fn name<T: Into<String>>(mut self, name: T) -> Self {
        self.options.name = name.into();
        self
    }

    /// Set the service version.
    pub fn version<T: Into<String>>(mut self, version: T) -> Self {
        self.options.version = version.into();
        self
    }

    /// Add a metadata entry published with the instance.
    pub fn metadata<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.options.metadata.insert(key.into(), value.into());
        self
    }

    /// Advertise an extra endpoint, on top of the ones reported by the servers.
    pub fn endpoint(mut self, endpoint: http::Uri) -> Self {
        self.options.endpoints.push(endpoint);
        self
    }

    /// Add a server to run.
    pub fn server<S: Server + 'static>(mut self, server: S) -> Self {
        self.options.servers.push(Arc::new(server));
        self
    }

    /// Set the [`Registrar`] the instance is registered with.
    pub fn registrar<R: Registrar + 'static>(mut self, registrar: R) -> Self {
        self.options.registrar = Some(Arc::new(registrar));
        self
    }

    /// Set the signals that trigger a shutdown.
    /// Defaults to terminate, quit and interrupt.
    #[cfg(unix)]
    pub fn signals(mut self, signals: Vec<SignalKind>) -> Self {
        self.options.signals = signals;
        self
    }

    /// Set how long registration may take. Default is 10 seconds.
    pub fn registrar_timeout(mut self, timeout: Duration) -> Self {
        self.options.registrar_timeout = timeout;
        self
    }

    /// Set how long each server, and deregistration, may take to stop.
    /// Default is 10 seconds.
    pub fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.options.stop_timeout = timeout;
        self
    }

    /// Set how long servers may take to become ready before the app gives up.
    /// Default is 10 seconds.
    pub fn ready_timeout(mut self, timeout: Duration) -> Self {
        self.options.ready_timeout = timeout;
        self
    }

    /// Construct an [`App`] from the [`AppBuilder`] instance.
    pub fn build(self) -> Result<App, Error> {
        let options = self.options;

        if options.name.is_empty() {
            return Err(Error::InvalidConfig("the app name is required".to_string()));
        }

        for (name, timeout) in [
            ("registrar", options.registrar_timeout),
            ("stop", options.stop_timeout),
            ("ready", options.ready_timeout),
        ] {
            if timeout.is_zero() {
                return Err(Error::InvalidConfig(format!(
                    "the {} timeout must not be zero",
                    name
                )));
            }
        }

        if let Some(endpoint) = options
            .endpoints
            .iter()
            .find(|endpoint| endpoint.scheme().is_none() || endpoint.authority().is_none())
        {
            return Err(Error::InvalidConfig(format!(
                "endpoint '{}' must have a scheme and an authority",
                endpoint
            )));
        }

        Ok(App::from_options(options))
    }
}
