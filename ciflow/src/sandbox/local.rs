//! Host-process execution context.

use super::process::{run_child, ExecOutcome, ExecRequest};
use super::ExecutionContext;
use crate::errors::CiflowError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;
use uuid::Uuid;

/// Runs steps as `sh -c` children of the orchestrator, rooted at the checkout.
///
/// The inherited environment is cleared; only the step environment applies.
#[derive(Debug, Clone)]
pub struct LocalContext {
    id: Uuid,
    name: String,
    root: PathBuf,
}

impl LocalContext {
    /// Creates a context named `name` rooted at `root`.
    #[must_use]
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            root: root.into(),
        }
    }

    /// The directory steps run in by default.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl ExecutionContext for LocalContext {
    fn id(&self) -> Uuid {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "local"
    }

    fn map_path(&self, host_path: &Path) -> PathBuf {
        host_path.to_path_buf()
    }

    async fn exec(&self, request: ExecRequest<'_>) -> Result<ExecOutcome, CiflowError> {
        let workdir = request
            .workdir
            .map_or_else(|| self.root.clone(), |dir| self.root.join(dir));

        let mut script = String::new();
        for name in request.env.unset_names() {
            script.push_str("unset ");
            script.push_str(name);
            script.push_str("; ");
        }
        script.push_str(request.script);

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&script)
            .current_dir(&workdir)
            .env_clear()
            .envs(request.env.vars());

        debug!(context = %self.name, step = %request.label, workdir = %workdir.display(), "Running step locally");
        run_child(cmd, &request, &self.name).await
    }

    async fn shutdown(&self) -> Result<(), CiflowError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancellation::CancellationToken;
    use crate::sandbox::{ExecStatus, StepEnvironment};
    use std::time::Duration;

    #[tokio::test]
    async fn test_environment_is_explicit() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = LocalContext::new("node", dir.path());
        let env = StepEnvironment::new()
            .with("PATH", std::env::var("PATH").unwrap_or_default())
            .with("GREETING", "hi");
        let cancel = CancellationToken::new();

        // CARGO is always set for test processes; it must not leak into the step.
        let script = r#"test "$GREETING" = hi && test -z "${CARGO:-}" && pwd > where.txt"#;
        let outcome = ctx
            .exec(ExecRequest {
                label: "env/check",
                script,
                env: &env,
                workdir: None,
                timeout: Duration::from_secs(10),
                cancel: &cancel,
                quiet: true,
            })
            .await
            .unwrap();

        assert_eq!(outcome.status, ExecStatus::Exited(0));
        assert!(dir.path().join("where.txt").exists());
    }

    #[tokio::test]
    async fn test_workdir_is_relative_to_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let ctx = LocalContext::new("node", dir.path());
        let env = StepEnvironment::from_host();
        let cancel = CancellationToken::new();

        let outcome = ctx
            .exec(ExecRequest {
                label: "wd/check",
                script: "touch marker",
                env: &env,
                workdir: Some(Path::new("sub")),
                timeout: Duration::from_secs(10),
                cancel: &cancel,
                quiet: true,
            })
            .await
            .unwrap();

        assert!(outcome.success());
        assert!(dir.path().join("sub").join("marker").exists());
        assert_eq!(ctx.map_path(dir.path()), dir.path());
        assert!(ctx.shutdown().await.is_ok());
    }
}
