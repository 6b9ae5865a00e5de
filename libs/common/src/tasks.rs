//! Supervision for a node's long-running components.

use std::future::Future;

use eyre::eyre;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Runs tasks until the first one fails, then cancels the rest.
pub struct TaskGroup {
    cancel: CancellationToken,
    tasks: JoinSet<eyre::Result<()>>,
}

impl TaskGroup {
    /// The group's token is a child of `parent`, so cancelling the parent
    /// stops the group but a failure in the group does not cancel the parent.
    pub fn new(parent: &CancellationToken) -> Self {
        Self {
            cancel: parent.child_token(),
            tasks: JoinSet::new(),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = eyre::Result<()>> + Send + 'static,
    {
        self.tasks.spawn(async move {
            let result = task.await;
            match &result {
                Ok(()) => tracing::debug!(task = name, "Task finished"),
                Err(e) => tracing::error!(task = name, error = %e, "Task failed"),
            }
            result
        });
    }

    /// Waits for every task and returns the first error, if any.
    pub async fn wait(mut self) -> eyre::Result<()> {
        let mut first_error = None;
        while let Some(joined) = self.tasks.join_next().await {
            let result = joined.unwrap_or_else(|e| Err(eyre!("task panicked: {e}")));
            if let Err(e) = result {
                if first_error.is_none() {
                    self.cancel.cancel();
                    first_error = Some(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
