//! Cleanup registry executed in LIFO order.

use crate::errors::CleanupWarning;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

type CleanupFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), String>> + Send>;

/// A named cleanup task.
struct CleanupTask {
    name: String,
    run: CleanupFn,
}

/// Registry for async cleanup tasks executed in LIFO order.
#[derive(Default)]
pub struct CleanupRegistry {
    tasks: Mutex<Vec<CleanupTask>>,
}

impl CleanupRegistry {
    /// Creates a new cleanup registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a cleanup task.
    pub fn register<F, Fut>(&self, name: impl Into<String>, task: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        self.tasks.lock().push(CleanupTask {
            name: name.into(),
            run: Box::new(move || Box::pin(task())),
        });
    }

    /// Returns the number of pending tasks.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Returns the pending task names in execution order.
    #[must_use]
    pub fn pending_names(&self) -> Vec<String> {
        self.tasks.lock().iter().rev().map(|t| t.name.clone()).collect()
    }

    /// Runs all tasks in LIFO order and clears the registry.
    ///
    /// Each task gets an equal share of `total_timeout`. Failures, panics and
    /// timeouts become warnings; they never stop the remaining tasks.
    pub async fn run_all(&self, total_timeout: Duration) -> (usize, Vec<CleanupWarning>) {
        let tasks: Vec<CleanupTask> = std::mem::take(&mut *self.tasks.lock());
        if tasks.is_empty() {
            return (0, Vec::new());
        }

        let count = tasks.len();
        let divisor = u32::try_from(count).unwrap_or(u32::MAX);
        let per_task = (total_timeout / divisor).max(Duration::from_millis(10));
        let mut warnings = Vec::new();

        for task in tasks.into_iter().rev() {
            let name = task.name;
            debug!(task = %name, "Running cleanup task");

            // Spawned so a panicking task surfaces as a JoinError.
            let handle = tokio::spawn((task.run)());
            let abort = handle.abort_handle();

            let failure = match tokio::time::timeout(per_task, handle).await {
                Ok(Ok(Ok(()))) => None,
                Ok(Ok(Err(message))) => Some(message),
                Ok(Err(join_err)) => Some(format!("cleanup task panicked: {join_err}")),
                Err(_) => {
                    abort.abort();
                    Some(format!("cleanup task timed out after {}ms", per_task.as_millis()))
                }
            };

            if let Some(message) = failure {
                warn!(task = %name, "Cleanup warning: {}", message);
                warnings.push(CleanupWarning::new(name, message));
            }
        }

        (count, warnings)
    }
}

impl std::fmt::Debug for CleanupRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupRegistry")
            .field("pending_count", &self.pending_count())
            .finish()
    }
}
