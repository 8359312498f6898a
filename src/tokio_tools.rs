use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const LOG_TARGET: &str = "legit_crowd::tokio_tools";

/// Spawn a Tokio task with a stable name when supported, and trace span otherwise.
pub fn spawn_named_task<F, S>(name: S, future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
    S: Into<String>,
{
    let name_owned = name.into();
    #[cfg(tokio_unstable)]
    {
        tokio::task::Builder::new()
            .name(&name_owned)
            .spawn(future)
            .unwrap_or_else(|err| panic!("failed to spawn task {name_owned}: {err}"))
    }
    #[cfg(not(tokio_unstable))]
    {
        use tracing::Instrument;
        let span = tracing::info_span!("task", task_name = %name_owned);
        tokio::spawn(future.instrument(span))
    }
}

/// Run CPU-heavy work (key generation, big modexp batches) off the async workers.
pub async fn run_blocking<F, T>(name: &'static str, work: F) -> anyhow::Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let span = tracing::info_span!("blocking", task_name = name);
    tokio::task::spawn_blocking(move || span.in_scope(work))
        .await
        .map_err(|err| anyhow::anyhow!("blocking task {name} failed: {err}"))
}

/// The long-lived tasks of one node, stopped together through a shared token.
pub struct TaskGroup {
    cancel: CancellationToken,
    tasks: Vec<(String, JoinHandle<()>)>,
}

impl TaskGroup {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            tasks: Vec::new(),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn spawn<F>(&mut self, name: impl Into<String>, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let handle = spawn_named_task(name.clone(), future);
        self.tasks.push((name, handle));
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Cancel every task and wait up to `grace` for each; stragglers are aborted.
    pub async fn shutdown(mut self, grace: Duration) {
        self.cancel.cancel();
        for (name, mut handle) in std::mem::take(&mut self.tasks) {
            match tokio::time::timeout(grace, &mut handle).await {
                Ok(Ok(())) => debug!(target: LOG_TARGET, task = %name, "task stopped"),
                Ok(Err(err)) => warn!(target: LOG_TARGET, task = %name, error = %err, "task ended abnormally"),
                Err(_) => {
                    warn!(target: LOG_TARGET, task = %name, "task ignored cancellation; aborting");
                    handle.abort();
                }
            }
        }
    }
}

impl Drop for TaskGroup {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
