//! A group of tasks that is torn down as soon as one of them fails.

use crate::Error;
use parking_lot::Mutex;
use std::{future::Future, sync::Arc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Runs tasks concurrently, cancels `token` on the first failure, and reports
/// that failure once every task has finished.
pub(crate) struct TaskGroup {
    tasks: JoinSet<()>,
    token: CancellationToken,
    first_error: Arc<Mutex<Option<Error>>>,
}

impl TaskGroup {
    pub(crate) fn new(token: CancellationToken) -> Self {
        Self {
            tasks: JoinSet::new(),
            token,
            first_error: Arc::new(Mutex::new(None)),
        }
    }

    pub(crate) fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = Result<(), Error>> + Send + 'static,
    {
        let token = self.token.clone();
        let first_error = Arc::clone(&self.first_error);

        self.tasks.spawn(async move {
            if let Err(err) = task.await {
                record(&first_error, &token, err);
            }
        });
    }

    /// Fail the group from outside of its tasks.
    pub(crate) fn fail(&self, err: Error) {
        record(&self.first_error, &self.token, err);
    }

    /// Wait for every task, returning the first error any of them reported.
    pub(crate) async fn wait(mut self) -> Result<(), Error> {
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(err) = joined {
                record(&self.first_error, &self.token, Error::Join(err));
            }
        }

        match self.first_error.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn record(first_error: &Mutex<Option<Error>>, token: &CancellationToken, err: Error) {
    tracing::error!(error = %err, "lifecycle task failed");
    first_error.lock().get_or_insert(err);
    token.cancel();
}
