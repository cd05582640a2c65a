//! Errors surfaced by the selector and the [`App`](crate::App) lifecycle.

/// Errors returned by [`Selector`](crate::Selector), [`LoadBalancedChannel`](crate::LoadBalancedChannel)
/// and [`App`](crate::App).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The balancer had no candidate node to pick from.
    ///
    /// This is recoverable: the caller should retry or back off.
    #[error("no available node")]
    NoAvailable,
    /// The transport pool has no ready connection yet.
    ///
    /// Callers should wait for the next pool update instead of failing.
    #[error("no ready connection available")]
    NoSubConnAvailable,
    /// Malformed options were supplied at construction time.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// A server returned an error from `start`.
    #[error("server #{index} failed to start")]
    StartFailed {
        index: usize,
        #[source]
        source: anyhow::Error,
    },
    /// A server returned an error from `stop`, or did not stop in time.
    #[error("server #{index} failed to stop")]
    StopFailed {
        index: usize,
        #[source]
        source: anyhow::Error,
    },
    /// Servers did not signal readiness in time.
    #[error("servers were not ready within {0:?}")]
    NotReady(std::time::Duration),
    /// The registrar refused or timed out registering the instance.
    #[error("failed to register service instance")]
    Registration(#[source] anyhow::Error),
    /// The registrar refused or timed out deregistering the instance.
    #[error("failed to deregister service instance")]
    Deregistration(#[source] anyhow::Error),
    /// [`App::run`](crate::App::run) was called more than once.
    #[error("app has already been started")]
    AlreadyStarted,
    /// The OS signal handler could not be installed.
    #[error("failed to install signal handler")]
    Signal(#[source] std::io::Error),
    /// A lifecycle task panicked or was aborted.
    #[error("lifecycle task did not complete")]
    Join(#[from] tokio::task::JoinError),
}

impl Error {
    /// Returns `true` if the error only means that no backend is currently
    /// available, and the call can be retried later.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Error::NoAvailable | Error::NoSubConnAvailable)
    }
}
