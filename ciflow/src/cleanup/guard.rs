//! The cleanup guard that runs once per run, whatever the outcome.

use super::registry::CleanupRegistry;
use crate::context::RunWorkspace;
use crate::core::PipelineEvent;
use crate::credentials::{artifact_paths, CredentialBroker};
use crate::errors::CleanupWarning;
use crate::events::{EventSink, NoOpEventSink};
use crate::provisioning::ProvisioningLedger;
use crate::sandbox::ContextPool;
use crate::utils::{iso_timestamp, remove_file_if_exists};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{info, warn};

/// Default bound on the whole cleanup pass.
pub const DEFAULT_CLEANUP_TIMEOUT: Duration = Duration::from_secs(120);

/// What the cleanup pass did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    /// Number of tasks executed.
    pub tasks_run: usize,
    /// Non-fatal failures.
    pub warnings: Vec<CleanupWarning>,
    /// True when no credential artifact remained afterwards.
    pub credentials_removed: bool,
    /// When the pass finished (ISO 8601).
    pub finished_at: String,
}

impl CleanupReport {
    /// Returns true if every task succeeded.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// Erases run artifacts exactly once.
///
/// Resources are handed to the guard as they are created; `finalize` runs
/// the registered tasks in reverse order. Concurrent or repeated calls to
/// `finalize` all observe the first pass's report.
pub struct CleanupGuard {
    registry: CleanupRegistry,
    credential_dirs: Mutex<Vec<PathBuf>>,
    timeout: Duration,
    events: Arc<dyn EventSink>,
    report: OnceCell<CleanupReport>,
}

impl std::fmt::Debug for CleanupGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupGuard")
            .field("registry", &self.registry)
            .field("timeout", &self.timeout)
            .field("finalized", &self.is_finalized())
            .finish_non_exhaustive()
    }
}

impl Default for CleanupGuard {
    fn default() -> Self {
        Self::new(DEFAULT_CLEANUP_TIMEOUT)
    }
}

impl CleanupGuard {
    /// Creates a guard with the given overall timeout.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            registry: CleanupRegistry::new(),
            credential_dirs: Mutex::new(Vec::new()),
            timeout,
            events: Arc::new(NoOpEventSink),
            report: OnceCell::new(),
        }
    }

    /// Sets the sink that receives `cleanup.finalized`.
    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Registers an arbitrary cleanup task.
    pub fn register<F, Fut>(&self, name: impl Into<String>, task: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<(), String>> + Send + 'static,
    {
        self.registry.register(name, task);
    }

    /// Takes ownership of the run workspace; it is removed last.
    pub fn own_workspace(&self, workspace: RunWorkspace) {
        self.registry.register("remove-workspace", move || async move {
            workspace
                .remove()
                .map(|_| ())
                .map_err(|e| format!("removing {}: {e}", workspace.run_dir().display()))
        });
    }

    /// Takes responsibility for shutting down every context in `pool`.
    ///
    /// A context's provisioning record is dropped with it, whether or not the
    /// shutdown succeeded.
    pub fn own_contexts(&self, pool: &ContextPool, ledger: &Arc<ProvisioningLedger>) {
        for context in pool.all() {
            let context = context.clone();
            let ledger = ledger.clone();
            let name = format!("shutdown-context:{}", context.name());
            self.registry.register(name, move || async move {
                let result = context.shutdown().await.map_err(|e| e.to_string());
                ledger.forget(context.id());
                result
            });
        }
    }

    /// Takes responsibility for the broker's artifacts in `credentials_dir`.
    ///
    /// Registered last so the credentials are the first thing erased.
    pub fn own_credentials(&self, credentials_dir: PathBuf) {
        self.credential_dirs.lock().push(credentials_dir.clone());
        self.registry.register("release-credentials", move || async move {
            CredentialBroker::release_dir(&credentials_dir)
                .map(|_| ())
                .map_err(|e| e.to_string())
        });
    }

    /// Returns true once `finalize` has completed.
    #[must_use]
    pub fn is_finalized(&self) -> bool {
        self.report.initialized()
    }

    /// Number of pending tasks.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.registry.pending_count()
    }

    /// Runs all cleanup tasks exactly once and returns the report.
    pub async fn finalize(&self) -> CleanupReport {
        self.report.get_or_init(|| self.run()).await.clone()
    }

    async fn run(&self) -> CleanupReport {
        info!(pending = self.registry.pending_count(), "Running cleanup");
        let (tasks_run, mut warnings) = self.registry.run_all(self.timeout).await;

        // Credential files must not survive even if their task timed out.
        let mut credentials_removed = true;
        for dir in self.credential_dirs.lock().iter() {
            for path in artifact_paths(dir) {
                if let Err(e) = remove_file_if_exists(&path) {
                    credentials_removed = false;
                    warn!(path = %path.display(), error = %e, "Credential artifact could not be removed");
                    warnings.push(CleanupWarning::new(
                        "verify-credentials",
                        format!("{} still present: {e}", path.display()),
                    ));
                }
            }
        }

        let report = CleanupReport {
            tasks_run,
            warnings,
            credentials_removed,
            finished_at: iso_timestamp(),
        };

        if report.is_clean() {
            info!(tasks_run, "Cleanup finished");
        } else {
            warn!(tasks_run, warnings = report.warnings.len(), "Cleanup finished with warnings");
        }

        self.events
            .emit(
                PipelineEvent::new("cleanup.finalized")
                    .add_data("tasks_run", serde_json::json!(report.tasks_run))
                    .add_data("warnings", serde_json::json!(report.warnings.len()))
                    .add_data("credentials_removed", serde_json::json!(report.credentials_removed)),
            )
            .await;

        report
    }
}
