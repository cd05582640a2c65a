use mirto::{Ready, Server};
use parking_lot::Mutex;
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;

/// A tonic gRPC server exposing the standard health service, run by an [`mirto::App`].
///
/// The listener is bound up front, so the advertised endpoint is known before the app
/// starts the server.
pub struct TestServer {
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
}

impl TestServer {
    /// Bind a listener on a random local port.
    pub async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind tcplistener");
        let local_addr = listener
            .local_addr()
            .expect("failed to retrieve sockeaddr from tokio listener");
        tracing::info!("server address: {}", local_addr);

        Self {
            listener: Mutex::new(Some(listener)),
            local_addr,
        }
    }

    /// Get the address `TestServer` is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[async_trait::async_trait]
impl Server for TestServer {
    async fn start(&self, ready: Ready, shutdown: CancellationToken) -> Result<(), anyhow::Error> {
        let listener = self
            .listener
            .lock()
            .take()
            .ok_or_else(|| anyhow::anyhow!("server has already been started"))?;
        let (_reporter, health) = tonic_health::server::health_reporter();

        ready.notify();
        tonic::transport::Server::builder()
            .add_service(health)
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                shutdown.cancelled().await
            })
            .await?;
        Ok(())
    }

    async fn stop(&self) -> Result<(), anyhow::Error> {
        Ok(())
    }

    fn endpoint(&self) -> Option<http::Uri> {
        format!("grpc://{}", self.local_addr).parse().ok()
    }

    fn address(&self) -> String {
        self.local_addr.to_string()
    }
}

/// What a [`ScriptedServer`] does when the app drives it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    /// Become ready after the delay, then serve until shut down.
    Serve { ready_after: Duration },
    /// Fail `start` after the delay, without becoming ready.
    FailStart { after: Duration },
    /// Serve, but never signal readiness.
    NeverReady,
    /// Serve normally, and fail `stop`.
    FailStop,
    /// Become ready immediately, then fail `start` after the delay.
    Crash { after: Duration },
}

/// A server that follows a [`Script`] and counts how the app drove it.
#[derive(Clone)]
pub struct ScriptedServer {
    address: String,
    script: Script,
    starts: Arc<AtomicUsize>,
    stops: Arc<AtomicUsize>,
}

impl ScriptedServer {
    pub fn new<T: Into<String>>(address: T, script: Script) -> Self {
        Self {
            address: address.into(),
            script,
            starts: Arc::new(AtomicUsize::new(0)),
            stops: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// A server that is ready immediately.
    pub fn serving<T: Into<String>>(address: T) -> Self {
        Self::new(
            address,
            Script::Serve {
                ready_after: Duration::ZERO,
            },
        )
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Server for ScriptedServer {
    async fn start(&self, ready: Ready, shutdown: CancellationToken) -> Result<(), anyhow::Error> {
        self.starts.fetch_add(1, Ordering::SeqCst);

        match self.script {
            Script::Serve { ready_after } => {
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(ready_after) => ready.notify(),
                }
            }
            Script::FailStart { after } => {
                tokio::time::sleep(after).await;
                anyhow::bail!("{} failed to bind", self.address);
            }
            Script::NeverReady => {
                // Keep the handle alive so the app keeps waiting.
                let _ready = ready;
                shutdown.cancelled().await;
                return Ok(());
            }
            Script::FailStop => ready.notify(),
            Script::Crash { after } => {
                ready.notify();
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(after) => {}
                }
                anyhow::bail!("{} lost its listener", self.address);
            }
        }

        shutdown.cancelled().await;
        Ok(())
    }

    async fn stop(&self) -> Result<(), anyhow::Error> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        if self.script == Script::FailStop {
            anyhow::bail!("{} failed to drain connections", self.address);
        }
        Ok(())
    }

    fn address(&self) -> String {
        self.address.clone()
    }
}
