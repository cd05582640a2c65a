//! Waiting for process termination signals.

use crate::Error;

#[cfg(unix)]
pub use tokio::signal::unix::SignalKind;

/// The signals trapped by default: terminate, quit and interrupt.
#[cfg(unix)]
pub(crate) fn default_signals() -> Vec<SignalKind> {
    vec![
        SignalKind::terminate(),
        SignalKind::quit(),
        SignalKind::interrupt(),
    ]
}

/// Wait until one of `signals` is delivered to the process.
///
/// Never completes if `signals` is empty.
#[cfg(unix)]
pub(crate) async fn wait_for(signals: &[SignalKind]) -> Result<SignalKind, Error> {
    use tokio::signal::unix::signal;

    let mut streams = signals
        .iter()
        .map(|kind| signal(*kind).map(|stream| (*kind, stream)))
        .collect::<Result<Vec<_>, _>>()
        .map_err(Error::Signal)?;

    if streams.is_empty() {
        return futures::future::pending().await;
    }

    let received = streams.iter_mut().map(|(kind, stream)| {
        Box::pin(async move {
            stream.recv().await;
            *kind
        })
    });
    let (kind, _, _) = futures::future::select_all(received).await;

    Ok(kind)
}

/// Wait for Ctrl-C.
#[cfg(not(unix))]
pub(crate) async fn wait_for_ctrl_c() -> Result<(), Error> {
    tokio::signal::ctrl_c().await.map_err(Error::Signal)
}
