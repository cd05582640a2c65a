//! Defines the interface [`App`](crate::App) requires from each server it runs.

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// A network server whose lifecycle is driven by an [`App`](crate::App).
#[async_trait::async_trait]
pub trait Server: Send + Sync {
    /// Serve until `shutdown` is cancelled or a fatal error occurs.
    ///
    /// Implementations call [`Ready::notify`] once they accept traffic: the app registers
    /// the instance only after every server is ready. Dropping `ready`, or returning,
    /// counts as ready.
    async fn start(&self, ready: Ready, shutdown: CancellationToken) -> Result<(), anyhow::Error>;

    /// Gracefully stop the server. The app bounds this call with its stop timeout.
    async fn stop(&self) -> Result<(), anyhow::Error>;

    /// The endpoint to advertise in the registry, if the server knows it.
    fn endpoint(&self) -> Option<http::Uri> {
        None
    }

    /// The scheme advertised when [`Server::endpoint`] is unknown.
    fn scheme(&self) -> &str {
        "grpc"
    }

    /// The configured address, advertised when [`Server::endpoint`] is unknown.
    fn address(&self) -> String;
}

/// Handle a [`Server`] uses to signal that it accepts traffic.
#[derive(Debug)]
pub struct Ready(Option<oneshot::Sender<()>>);

impl Ready {
    pub(crate) fn channel() -> (Self, oneshot::Receiver<()>) {
        let (sender, receiver) = oneshot::channel();
        (Self(Some(sender)), receiver)
    }

    /// A handle nobody waits on.
    pub fn detached() -> Self {
        Self(None)
    }

    /// Mark the server as ready.
    pub fn notify(mut self) {
        if let Some(sender) = self.0.take() {
            let _ = sender.send(());
        }
    }
}
