use std::{borrow::Cow, time::Duration};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// A named background task owned by the server process.
#[derive(Debug)]
pub struct TaskHandle {
    name: Cow<'static, str>,
    handle: JoinHandle<()>,
}

impl TaskHandle {
    pub fn new(name: impl Into<Cow<'static, str>>, handle: JoinHandle<()>) -> Self {
        Self {
            name: name.into(),
            handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn into_inner(self) -> (Cow<'static, str>, JoinHandle<()>) {
        (self.name, self.handle)
    }
}

#[derive(Debug, Default)]
pub struct TaskManager {
    tasks: Vec<TaskHandle>,
    cancel: CancellationToken,
}

impl TaskManager {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Token that fires when shutdown begins. Loops that watch it exit
    /// inside the grace period instead of being aborted.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    pub fn push(&mut self, task: TaskHandle) {
        trace!(target: "fleet::tasks", task = task.name(), "task registered");
        self.tasks.push(task);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn names(&self) -> Vec<String> {
        self.tasks.iter().map(|task| task.name().to_string()).collect()
    }

    /// Signal cancellation, give each task up to `grace` to finish on its
    /// own, then abort it. A zero grace aborts immediately.
    pub async fn shutdown_with_grace(self, grace: Duration) {
        self.cancel.cancel();
        for task in self.tasks {
            let (name, mut handle) = task.into_inner();
            if grace.is_zero() {
                handle.abort();
                if let Err(err) = handle.await {
                    if !err.is_cancelled() {
                        debug!(target: "fleet::tasks", task = %name, ?err, "task join after abort failed");
                    }
                }
                continue;
            }

            let sleeper = tokio::time::sleep(grace);
            tokio::pin!(sleeper);
            tokio::select! {
                res = &mut handle => {
                    if let Err(err) = res {
                        debug!(target: "fleet::tasks", task = %name, ?err, "task exited with error");
                    }
                }
                _ = &mut sleeper => {
                    handle.abort();
                    if let Err(err) = handle.await {
                        if !err.is_cancelled() {
                            debug!(target: "fleet::tasks", task = %name, ?err, "task join after abort failed");
                        }
                    }
                }
            }
            trace!(target: "fleet::tasks", task = %name, "task stopped");
        }
    }
}
