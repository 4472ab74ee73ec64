//! Container execution context driven through the docker CLI.
//!
//! The container is started lazily on first use with the checkout mounted
//! at [`CONTAINER_ROOT`] and kept alive with `sleep infinity`; each step is a
//! `docker exec`. Step variables travel as `-e NAME` (no value), so the
//! docker client forwards them from its own environment and secrets never
//! appear on a command line.

use super::env::HOST_ALLOW_LIST;
use super::process::{run_child, ExecOutcome, ExecRequest};
use super::ExecutionContext;
use crate::context::sanitize_path_component;
use crate::errors::CiflowError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Where the checkout is mounted inside the container.
pub const CONTAINER_ROOT: &str = "/workspace";

/// Host variables the docker client itself needs.
const CLIENT_ENV: [&str; 7] = [
    "PATH",
    "HOME",
    "DOCKER_HOST",
    "DOCKER_CONFIG",
    "DOCKER_CONTEXT",
    "DOCKER_CERT_PATH",
    "DOCKER_TLS_VERIFY",
];

/// Bound on `docker run` (includes pulling the image).
const START_TIMEOUT: Duration = Duration::from_secs(600);
/// Bound on `docker rm -f`.
const STOP_TIMEOUT: Duration = Duration::from_secs(60);

/// A long-lived container per execution context.
#[derive(Debug)]
pub struct ContainerContext {
    id: Uuid,
    name: String,
    image: String,
    host_root: PathBuf,
    container_name: String,
    docker: String,
    started: Mutex<bool>,
}

impl ContainerContext {
    /// Creates a context that will run `image` with `host_root` mounted.
    ///
    /// `run_label` makes the container name unique per run.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        image: impl Into<String>,
        host_root: impl Into<PathBuf>,
        run_label: &str,
    ) -> Self {
        let name = name.into();
        let id = Uuid::new_v4();
        let short = id.simple().to_string();
        let container_name = format!(
            "ciflow-{}-{}-{}",
            sanitize_path_component(run_label),
            sanitize_path_component(&name),
            &short[..8]
        );
        Self {
            id,
            name,
            image: image.into(),
            host_root: host_root.into(),
            container_name,
            docker: "docker".to_string(),
            started: Mutex::new(false),
        }
    }

    /// Uses a different docker-compatible client binary.
    #[must_use]
    pub fn with_client(mut self, program: impl Into<String>) -> Self {
        self.docker = program.into();
        self
    }

    /// The image the container runs.
    #[must_use]
    pub fn image(&self) -> &str {
        &self.image
    }

    /// The docker container name.
    #[must_use]
    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    fn client(&self) -> Command {
        let mut cmd = Command::new(&self.docker);
        cmd.env_clear();
        for name in CLIENT_ENV {
            if let Ok(value) = std::env::var(name) {
                cmd.env(name, value);
            }
        }
        cmd
    }

    async fn client_output(&self, mut cmd: Command, timeout: Duration, what: &str) -> Result<(), CiflowError> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| CiflowError::context(&self.name, format!("{what} timed out after {}s", timeout.as_secs())))?
            .map_err(|e| CiflowError::context(&self.name, format!("{what} failed to start: {e}")))?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(CiflowError::context(
                &self.name,
                format!("{what} failed ({}): {}", output.status, stderr.trim()),
            ))
        }
    }

    async fn ensure_started(&self) -> Result<(), CiflowError> {
        let mut started = self.started.lock().await;
        if *started {
            return Ok(());
        }

        info!(context = %self.name, image = %self.image, container = %self.container_name, "Starting container");
        let mut cmd = self.client();
        cmd.arg("run")
            .arg("-d")
            .arg("--name")
            .arg(&self.container_name)
            .arg("-v")
            .arg(format!("{}:{CONTAINER_ROOT}", self.host_root.display()))
            .arg("-w")
            .arg(CONTAINER_ROOT)
            .arg("--entrypoint")
            .arg("sleep")
            .arg(&self.image)
            .arg("infinity");
        self.client_output(cmd, START_TIMEOUT, "docker run").await?;

        *started = true;
        Ok(())
    }

    fn container_workdir(&self, workdir: Option<&Path>) -> String {
        let base = Path::new(CONTAINER_ROOT);
        workdir
            .map_or_else(|| base.to_path_buf(), |dir| base.join(dir))
            .display()
            .to_string()
    }
}

#[async_trait]
impl ExecutionContext for ContainerContext {
    fn id(&self) -> Uuid {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "container"
    }

    fn map_path(&self, host_path: &Path) -> PathBuf {
        match host_path.strip_prefix(&self.host_root) {
            Ok(rel) => Path::new(CONTAINER_ROOT).join(rel),
            Err(_) => host_path.to_path_buf(),
        }
    }

    async fn exec(&self, request: ExecRequest<'_>) -> Result<ExecOutcome, CiflowError> {
        self.ensure_started().await?;

        let mut script = String::new();
        for name in request.env.unset_names() {
            script.push_str("unset ");
            script.push_str(name);
            script.push_str("; ");
        }
        script.push_str(request.script);

        let mut cmd = self.client();
        cmd.arg("exec").arg("-w").arg(self.container_workdir(request.workdir));
        // Host PATH/HOME/LANG belong to the host; the image brings its own.
        for (name, value) in request.env.vars().filter(|(n, _)| !HOST_ALLOW_LIST.contains(n)) {
            cmd.env(name, value);
            cmd.arg("-e").arg(name);
        }
        cmd.arg(&self.container_name).arg("sh").arg("-c").arg(&script);

        debug!(context = %self.name, container = %self.container_name, step = %request.label, "Running step in container");
        run_child(cmd, &request, &self.name).await
    }

    async fn shutdown(&self) -> Result<(), CiflowError> {
        let mut started = self.started.lock().await;
        if !*started {
            return Ok(());
        }

        info!(context = %self.name, container = %self.container_name, "Removing container");
        let mut cmd = self.client();
        cmd.arg("rm").arg("-f").arg(&self.container_name);
        let result = self.client_output(cmd, STOP_TIMEOUT, "docker rm").await;
        if let Err(e) = &result {
            warn!(context = %self.name, error = %e, "Container removal failed");
        }
        *started = false;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancellation::CancellationToken;
    use crate::sandbox::StepEnvironment;

    #[test]
    fn test_map_path_into_mount() {
        let ctx = ContainerContext::new("tester", "python:3.11-slim", "/srv/checkout", "42");
        assert_eq!(
            ctx.map_path(Path::new("/srv/checkout/.ciflow/runs/42/results/t1")),
            PathBuf::from("/workspace/.ciflow/runs/42/results/t1")
        );
        assert_eq!(ctx.map_path(Path::new("/etc/hosts")), PathBuf::from("/etc/hosts"));
        assert_eq!(ctx.container_workdir(None), "/workspace");
        assert_eq!(ctx.container_workdir(Some(Path::new("tests"))), "/workspace/tests");
    }

    #[test]
    fn test_container_names_are_unique() {
        let a = ContainerContext::new("sql runner", "img", "/srv", "7");
        let b = ContainerContext::new("sql runner", "img", "/srv", "7");
        assert!(a.container_name().starts_with("ciflow-7-sql_runner-"));
        assert_ne!(a.container_name(), b.container_name());
        assert_eq!(a.kind(), "container");
    }

    #[tokio::test]
    async fn test_shutdown_before_start_is_noop() {
        let ctx = ContainerContext::new("tester", "img", "/srv", "1").with_client("ciflow-missing-docker");
        assert!(ctx.shutdown().await.is_ok());
    }

    #[tokio::test]
    async fn test_missing_client_is_context_error() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ContainerContext::new("tester", "img", dir.path(), "1").with_client("ciflow-missing-docker");
        let env = StepEnvironment::new();
        let cancel = CancellationToken::new();
        let err = ctx
            .exec(ExecRequest {
                label: "t/s",
                script: "true",
                env: &env,
                workdir: None,
                timeout: Duration::from_secs(5),
                cancel: &cancel,
                quiet: true,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "context_error");
    }
}
