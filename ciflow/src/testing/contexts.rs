//! A scripted execution context for tests.

use crate::errors::CiflowError;
use crate::sandbox::{ExecOutcome, ExecRequest, ExecStatus, ExecutionContext, StepEnvironment};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Name of the variable carrying a stage's results directory.
const RESULTS_DIR_VAR: &str = "CIFLOW_RESULTS_DIR";

/// One recorded `exec` call.
#[derive(Debug, Clone)]
pub struct RecordedExec {
    /// The request label.
    pub label: String,
    /// The script as requested.
    pub script: String,
    /// The environment the step received.
    pub env: StepEnvironment,
    /// Requested working directory.
    pub workdir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
enum Behavior {
    Exit(i32),
    Hang,
    WriteResult { file_name: String, contents: String },
}

#[derive(Debug, Clone)]
struct Rule {
    pattern: String,
    behavior: Behavior,
}

/// An [`ExecutionContext`] that never spawns processes.
///
/// Every script exits 0 unless a rule matching a substring of the script
/// says otherwise. The first matching rule wins.
#[derive(Debug)]
pub struct ScriptedContext {
    id: Uuid,
    name: String,
    rules: Vec<Rule>,
    install_gate: Option<(String, String)>,
    installed: AtomicBool,
    executions: Mutex<Vec<RecordedExec>>,
    shutdowns: AtomicUsize,
}

impl ScriptedContext {
    /// Creates a context where everything succeeds.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            rules: Vec::new(),
            install_gate: None,
            installed: AtomicBool::new(false),
            executions: Mutex::new(Vec::new()),
            shutdowns: AtomicUsize::new(0),
        }
    }

    /// Scripts containing `pattern` exit with `code`.
    #[must_use]
    pub fn fail_when(mut self, pattern: impl Into<String>, code: i32) -> Self {
        self.rules.push(Rule {
            pattern: pattern.into(),
            behavior: Behavior::Exit(code),
        });
        self
    }

    /// Scripts containing `pattern` block until timeout or cancellation.
    #[must_use]
    pub fn hang_when(mut self, pattern: impl Into<String>) -> Self {
        self.rules.push(Rule {
            pattern: pattern.into(),
            behavior: Behavior::Hang,
        });
        self
    }

    /// Scripts containing `pattern` write `contents` into the stage's
    /// results directory as `file_name`.
    #[must_use]
    pub fn write_result_when(
        mut self,
        pattern: impl Into<String>,
        file_name: impl Into<String>,
        contents: impl Into<String>,
    ) -> Self {
        self.rules.push(Rule {
            pattern: pattern.into(),
            behavior: Behavior::WriteResult {
                file_name: file_name.into(),
                contents: contents.into(),
            },
        });
        self
    }

    /// Scripts containing `probe` fail until a script containing `marker` ran.
    #[must_use]
    pub fn probe_fails_until_installed(mut self, probe: impl Into<String>, marker: impl Into<String>) -> Self {
        self.install_gate = Some((probe.into(), marker.into()));
        self
    }

    /// All recorded executions.
    #[must_use]
    pub fn executions(&self) -> Vec<RecordedExec> {
        self.executions.lock().clone()
    }

    /// Scripts in execution order.
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        self.executions.lock().iter().map(|e| e.script.clone()).collect()
    }

    /// Number of executed scripts containing `pattern`.
    #[must_use]
    pub fn count_matching(&self, pattern: &str) -> usize {
        self.executions
            .lock()
            .iter()
            .filter(|e| e.script.contains(pattern))
            .count()
    }

    /// Number of `shutdown` calls.
    #[must_use]
    pub fn shutdown_count(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    fn decide(&self, script: &str) -> Behavior {
        if let Some((probe, marker)) = &self.install_gate {
            if script.contains(marker.as_str()) {
                self.installed.store(true, Ordering::SeqCst);
            } else if script.contains(probe.as_str()) {
                let code = if self.installed.load(Ordering::SeqCst) { 0 } else { 1 };
                return Behavior::Exit(code);
            }
        }
        self.rules
            .iter()
            .find(|r| script.contains(r.pattern.as_str()))
            .map_or(Behavior::Exit(0), |r| r.behavior.clone())
    }
}

#[async_trait]
impl ExecutionContext for ScriptedContext {
    fn id(&self) -> Uuid {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "scripted"
    }

    fn map_path(&self, host_path: &Path) -> PathBuf {
        host_path.to_path_buf()
    }

    async fn exec(&self, request: ExecRequest<'_>) -> Result<ExecOutcome, CiflowError> {
        self.executions.lock().push(RecordedExec {
            label: request.label.to_string(),
            script: request.script.to_string(),
            env: request.env.clone(),
            workdir: request.workdir.map(Path::to_path_buf),
        });

        let started = Instant::now();
        if request.cancel.is_cancelled() {
            return Ok(outcome(ExecStatus::Cancelled, started));
        }

        // Let concurrent callers interleave.
        tokio::task::yield_now().await;

        let status = match self.decide(request.script) {
            Behavior::Exit(code) => ExecStatus::Exited(code),
            Behavior::Hang => {
                tokio::select! {
                    () = request.cancel.cancelled() => ExecStatus::Cancelled,
                    () = tokio::time::sleep(request.timeout) => ExecStatus::TimedOut,
                }
            }
            Behavior::WriteResult { file_name, contents } => {
                let dir = request.env.get(RESULTS_DIR_VAR).ok_or_else(|| {
                    CiflowError::context(&self.name, format!("{RESULTS_DIR_VAR} is not set"))
                })?;
                std::fs::create_dir_all(dir)?;
                std::fs::write(Path::new(dir).join(file_name), contents)?;
                ExecStatus::Exited(0)
            }
        };
        Ok(outcome(status, started))
    }

    async fn shutdown(&self) -> Result<(), CiflowError> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn outcome(status: ExecStatus, started: Instant) -> ExecOutcome {
    ExecOutcome {
        status,
        duration: started.elapsed().max(Duration::from_micros(1)),
        tail: Vec::new(),
    }
}
