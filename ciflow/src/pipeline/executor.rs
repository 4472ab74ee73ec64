//! Sequential, fail-fast stage execution.

use super::spec::{StageSpec, StepSpec};
use crate::cancellation::CancellationToken;
use crate::context::{RunIdentity, RunWorkspace};
use crate::core::{Capability, Outcome, PipelineEvent, RunState, StageStatus};
use crate::credentials::{CredentialBroker, CredentialEnv, CredentialSession};
use crate::errors::{
    CiflowError, CredentialError, MissingCredentialError, ProvisioningError, StepFailure, EXIT_CANCELLED,
};
use crate::events::{EventSink, NoOpEventSink};
use crate::provisioning::EnvironmentProvisioner;
use crate::sandbox::{ContextPool, ExecRequest, ExecStatus, ExecutionContext, StepEnvironment};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, instrument, warn};

/// Default bound on a single step.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(1800);

/// Variable carrying the stage's results directory as seen inside the context.
pub const RESULTS_DIR_VAR: &str = "CIFLOW_RESULTS_DIR";
/// Variable carrying the credential artifact path as seen inside the context.
pub const CREDENTIALS_FILE_VAR: &str = "CIFLOW_CREDENTIALS_FILE";

/// What the run knows about credentials when stages start.
#[derive(Debug, Clone, Default)]
pub enum CredentialState {
    /// Credentials were not requested for this run.
    #[default]
    NotRequested,
    /// A session was established.
    Acquired(Arc<CredentialSession>),
    /// Acquisition was attempted and failed.
    Failed(CredentialError),
}

impl CredentialState {
    /// The session, if one was established.
    #[must_use]
    pub fn session(&self) -> Option<&Arc<CredentialSession>> {
        match self {
            Self::Acquired(session) => Some(session),
            Self::NotRequested | Self::Failed(_) => None,
        }
    }
}

/// Executor settings.
#[derive(Debug, Clone, Copy)]
pub struct ExecutorConfig {
    /// Timeout for steps that don't set one.
    pub default_step_timeout: Duration,
    /// Install the SQL driver when missing instead of failing.
    pub install_driver: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_step_timeout: DEFAULT_STEP_TIMEOUT,
            install_driver: true,
        }
    }
}

/// Result of one step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepReport {
    /// Step name.
    pub name: String,
    /// Final status.
    pub status: StageStatus,
    /// Exit code, if the process exited.
    pub exit_code: Option<i32>,
    /// True if the step hit its timeout.
    pub timed_out: bool,
    /// Wall-clock duration.
    pub duration_ms: f64,
}

/// Result of one stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageReport {
    /// Stage name.
    pub name: String,
    /// Context the stage ran (or would have run) in.
    pub context: String,
    /// Final status.
    pub status: StageStatus,
    /// Steps that ran.
    pub steps: Vec<StepReport>,
    /// Error kind for failed stages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    /// Error or abort reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Host path of the results directory, for stages that collect results.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results_dir: Option<PathBuf>,
    /// Wall-clock duration.
    pub duration_ms: f64,
}

impl StageReport {
    fn new(stage: &StageSpec) -> Self {
        Self {
            name: stage.name.clone(),
            context: stage.context.clone(),
            status: StageStatus::Pending,
            steps: Vec::new(),
            error_kind: None,
            message: None,
            results_dir: None,
            duration_ms: 0.0,
        }
    }

    fn aborted(stage: &StageSpec, reason: &str) -> Self {
        let mut report = Self::new(stage);
        report.status = StageStatus::Aborted;
        report.message = Some(reason.to_string());
        report
    }
}

/// Result of running all stages.
#[derive(Debug)]
pub struct ExecutionReport {
    /// Terminal outcome.
    pub outcome: Outcome,
    /// One report per planned stage, in order.
    pub stages: Vec<StageReport>,
    /// The fatal error that ended the run, if any.
    pub failure: Option<CiflowError>,
}

impl ExecutionReport {
    /// Report for a named stage.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Process exit code for this outcome.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self.outcome {
            Outcome::Succeeded => 0,
            Outcome::Aborted => EXIT_CANCELLED,
            Outcome::Failed => self
                .failure
                .as_ref()
                .map_or(crate::errors::EXIT_FAILURE, CiflowError::exit_code),
        }
    }
}

enum StageEnd {
    Succeeded,
    Failed(CiflowError),
    Aborted(String),
}

/// Runs stages strictly in order, each in its designated context.
pub struct StageExecutor {
    contexts: ContextPool,
    provisioner: EnvironmentProvisioner,
    workspace: RunWorkspace,
    identity: RunIdentity,
    credentials: CredentialState,
    events: Arc<dyn EventSink>,
    cancel: Arc<CancellationToken>,
    config: ExecutorConfig,
}

impl std::fmt::Debug for StageExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageExecutor")
            .field("contexts", &self.contexts)
            .field("run_id", &self.identity.run_id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl StageExecutor {
    /// Creates an executor over the run's contexts and workspace.
    #[must_use]
    pub fn new(
        contexts: ContextPool,
        provisioner: EnvironmentProvisioner,
        workspace: RunWorkspace,
        identity: RunIdentity,
    ) -> Self {
        Self {
            contexts,
            provisioner,
            workspace,
            identity,
            credentials: CredentialState::NotRequested,
            events: Arc::new(NoOpEventSink),
            cancel: Arc::new(CancellationToken::new()),
            config: ExecutorConfig::default(),
        }
    }

    /// Sets the credential state stages are gated on.
    #[must_use]
    pub fn with_credentials(mut self, credentials: CredentialState) -> Self {
        self.credentials = credentials;
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Sets the cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: Arc<CancellationToken>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Sets executor settings.
    #[must_use]
    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// Runs `stages` and reports every one of them.
    ///
    /// After the first failure or cancellation, every remaining stage is
    /// reported `Aborted` without running.
    #[instrument(skip_all, fields(run_id = %self.identity.run_id))]
    pub async fn run(&self, stages: &[StageSpec]) -> ExecutionReport {
        let mut state = RunState::Pending;
        let mut reports = Vec::with_capacity(stages.len());
        let mut failure: Option<CiflowError> = None;
        let mut abort_reason = String::new();

        for (index, stage) in stages.iter().enumerate() {
            if state.is_terminal() {
                self.events.emit(PipelineEvent::stage_aborted(&stage.name, &abort_reason)).await;
                reports.push(StageReport::aborted(stage, &abort_reason));
                continue;
            }

            if self.cancel.is_cancelled() {
                let reason = self.cancel_reason();
                state = advance(state, RunState::Aborted);
                abort_reason = format!("run cancelled: {reason}");
                failure = Some(CiflowError::Cancelled(reason));
                self.events.emit(PipelineEvent::stage_aborted(&stage.name, &abort_reason)).await;
                reports.push(StageReport::aborted(stage, &abort_reason));
                continue;
            }

            state = advance(state, RunState::Running(index));
            let (report, end) = self.run_stage(stage).await;
            reports.push(report);

            match end {
                StageEnd::Succeeded => {}
                StageEnd::Failed(err) => {
                    state = advance(state, RunState::Failed);
                    abort_reason = format!("stage '{}' failed", stage.name);
                    failure = Some(err);
                }
                StageEnd::Aborted(reason) => {
                    state = advance(state, RunState::Aborted);
                    abort_reason = format!("run cancelled: {reason}");
                    failure = Some(CiflowError::Cancelled(reason));
                }
            }
        }

        if !state.is_terminal() {
            state = advance(state, RunState::Succeeded);
        }
        let outcome = state.outcome().unwrap_or(Outcome::Failed);
        info!(%outcome, stages = reports.len(), "Stage sequence finished");

        ExecutionReport {
            outcome,
            stages: reports,
            failure,
        }
    }

    fn cancel_reason(&self) -> String {
        self.cancel.reason().unwrap_or_else(|| "cancelled".to_string())
    }

    async fn run_stage(&self, stage: &StageSpec) -> (StageReport, StageEnd) {
        let started = Instant::now();
        let mut report = StageReport::new(stage);
        report.status = StageStatus::Running;
        info!(stage = %stage.name, context = %stage.context, "Stage started");
        self.events
            .emit(PipelineEvent::stage_started(&stage.name, &stage.context))
            .await;

        let end = match self.contexts.get(&stage.context) {
            Some(context) => self.drive_stage(stage, context.as_ref(), &mut report).await,
            None => StageEnd::Failed(CiflowError::context(&stage.context, "no such execution context")),
        };

        report.duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        match &end {
            StageEnd::Succeeded => {
                report.status = StageStatus::Succeeded;
                info!(stage = %stage.name, duration_ms = report.duration_ms, "Stage succeeded");
                self.events
                    .emit(PipelineEvent::stage_completed(&stage.name, report.duration_ms))
                    .await;
            }
            StageEnd::Failed(err) => {
                report.status = StageStatus::Failed;
                report.error_kind = Some(err.kind().to_string());
                report.message = Some(err.to_string());
                error!(stage = %stage.name, kind = err.kind(), "Stage failed: {}", err);
                self.events
                    .emit(PipelineEvent::stage_failed(&stage.name, err.kind(), &err.to_string()))
                    .await;
            }
            StageEnd::Aborted(reason) => {
                report.status = StageStatus::Aborted;
                report.message = Some(format!("run cancelled: {reason}"));
                warn!(stage = %stage.name, "Stage aborted: {}", reason);
                self.events.emit(PipelineEvent::stage_aborted(&stage.name, reason)).await;
            }
        }
        (report, end)
    }

    async fn drive_stage(
        &self,
        stage: &StageSpec,
        context: &dyn ExecutionContext,
        report: &mut StageReport,
    ) -> StageEnd {
        let mut env = self.base_env(stage);

        if stage.needs(Capability::Credentials) {
            match self.credential_gate(stage) {
                Ok(credentials) => {
                    env.inject_credentials(&credentials);
                    if let Some(session) = self.credentials.session() {
                        env.set(
                            CREDENTIALS_FILE_VAR,
                            context.map_path(session.artifact_path()).display().to_string(),
                        );
                    }
                }
                Err(err) => return StageEnd::Failed(err),
            }
        }

        for capability in stage.requires.iter().copied().filter(Capability::is_provisioned) {
            if let Err(err) = self.provision_gate(capability, context).await {
                if self.cancel.is_cancelled() {
                    return StageEnd::Aborted(self.cancel_reason());
                }
                return StageEnd::Failed(err.into());
            }
        }

        if stage.collect_results {
            let dir = self.workspace.stage_results_dir(&stage.name);
            if let Err(e) = std::fs::create_dir_all(&dir) {
                return StageEnd::Failed(e.into());
            }
            env.set(RESULTS_DIR_VAR, context.map_path(&dir).display().to_string());
            report.results_dir = Some(dir);
        }

        for step in &stage.steps {
            match self.run_step(stage, step, context, &env, report).await {
                StageEnd::Succeeded => {}
                other => return other,
            }
        }
        StageEnd::Succeeded
    }

    async fn run_step(
        &self,
        stage: &StageSpec,
        step: &StepSpec,
        context: &dyn ExecutionContext,
        stage_env: &StepEnvironment,
        report: &mut StageReport,
    ) -> StageEnd {
        let mut env = stage_env.clone();
        env.extend(step.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        env.set("CIFLOW_STEP", step.name.clone());

        let timeout = step.timeout_or(self.config.default_step_timeout);
        let label = format!("{}/{}", stage.name, step.name);
        info!(step = %label, timeout_secs = timeout.as_secs(), "Running step");

        let outcome = match context
            .exec(ExecRequest {
                label: &label,
                script: &step.run,
                env: &env,
                workdir: step.workdir.as_deref(),
                timeout,
                cancel: &self.cancel,
                quiet: false,
            })
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => return StageEnd::Failed(err),
        };

        self.events
            .emit(PipelineEvent::step_completed(
                &stage.name,
                &step.name,
                outcome.exit_code(),
                outcome.duration_ms(),
            ))
            .await;

        let mut step_report = StepReport {
            name: step.name.clone(),
            status: StageStatus::Succeeded,
            exit_code: outcome.exit_code(),
            timed_out: false,
            duration_ms: outcome.duration_ms(),
        };

        let end = match outcome.status {
            ExecStatus::Exited(0) => StageEnd::Succeeded,
            ExecStatus::Exited(code) => {
                step_report.status = StageStatus::Failed;
                StageEnd::Failed(StepFailure::exited(&stage.name, &step.name, code).into())
            }
            ExecStatus::TimedOut => {
                step_report.status = StageStatus::Failed;
                step_report.timed_out = true;
                StageEnd::Failed(StepFailure::timed_out(&stage.name, &step.name, timeout.as_secs()).into())
            }
            ExecStatus::Cancelled => {
                step_report.status = StageStatus::Aborted;
                StageEnd::Aborted(self.cancel_reason())
            }
        };
        report.steps.push(step_report);
        end
    }

    fn base_env(&self, stage: &StageSpec) -> StepEnvironment {
        let mut env = StepEnvironment::from_host();
        env.set("CI", "true");
        env.set("CIFLOW_RUN_ID", self.identity.run_id.clone());
        env.set("CIFLOW_PIPELINE_RUN_ID", self.identity.pipeline_run_id.to_string());
        env.set("CIFLOW_SESSION_NAME", self.identity.session_name.clone());
        env.set("CIFLOW_STAGE", stage.name.clone());
        env.extend(stage.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        env
    }

    /// Verifies a live session and reads the artifact stages consume.
    fn credential_gate(&self, stage: &StageSpec) -> Result<CredentialEnv, CiflowError> {
        let missing = |expired| MissingCredentialError {
            stage: stage.name.clone(),
            expired,
        };

        match &self.credentials {
            CredentialState::NotRequested => Err(missing(false).into()),
            CredentialState::Failed(err) => Err(err.clone().into()),
            CredentialState::Acquired(session) => {
                if session.is_expired() {
                    return Err(missing(true).into());
                }
                CredentialBroker::load(session.artifact_path()).map_err(|e| {
                    warn!(stage = %stage.name, error = %e, "Credential artifact unreadable");
                    missing(false).into()
                })
            }
        }
    }

    /// Installs `capability` when allowed, otherwise only checks for it.
    async fn provision_gate(
        &self,
        capability: Capability,
        context: &dyn ExecutionContext,
    ) -> Result<(), ProvisioningError> {
        if self.config.install_driver {
            return self
                .provisioner
                .ensure(capability, context, &self.cancel)
                .await
                .map(|_| ());
        }
        if self.provisioner.probe(capability, context, &self.cancel).await? {
            return Ok(());
        }
        let mut err = ProvisioningError::new(
            capability,
            context.name(),
            format!("{capability} not present and installation is disabled"),
        );
        if let Some(recipe) = self.provisioner.recipe(capability) {
            err = err.with_command(recipe.probe.as_str(), None);
        }
        Err(err)
    }
}

fn advance(state: RunState, next: RunState) -> RunState {
    match state.transition(next) {
        Ok(next) => next,
        Err(e) => {
            warn!(error = %e, "Ignoring invalid run state transition");
            state
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingEventSink;
    use crate::provisioning::ProvisioningLedger;
    use crate::testing::{assert_aborted_from, assert_stage_status, ScriptedContext};

    struct Harness {
        _checkout: tempfile::TempDir,
        workspace: RunWorkspace,
        identity: RunIdentity,
        ctx: Arc<ScriptedContext>,
        sink: Arc<CollectingEventSink>,
    }

    impl Harness {
        fn new(ctx: ScriptedContext) -> Self {
            let checkout = tempfile::tempdir().unwrap();
            let identity = RunIdentity::new("11", "ciflow").unwrap();
            let workspace = RunWorkspace::create(checkout.path(), &identity).unwrap();
            Self {
                _checkout: checkout,
                workspace,
                identity,
                ctx: Arc::new(ctx),
                sink: Arc::new(CollectingEventSink::new()),
            }
        }

        fn executor(&self) -> StageExecutor {
            let mut pool = ContextPool::new();
            pool.insert(self.ctx.clone());
            StageExecutor::new(
                pool,
                EnvironmentProvisioner::new(Arc::new(ProvisioningLedger::new())),
                self.workspace.clone(),
                self.identity.clone(),
            )
            .with_events(self.sink.clone())
        }
    }

    fn stages() -> Vec<StageSpec> {
        vec![
            StageSpec::new("build", "node").step("compile", "make build"),
            StageSpec::new("test", "node").step("unit", "make test"),
            StageSpec::new("sql", "node").step("query", "make sql"),
        ]
    }

    #[tokio::test]
    async fn test_all_stages_succeed() {
        let h = Harness::new(ScriptedContext::new("node"));
        let report = h.executor().run(&stages()).await;

        assert_eq!(report.outcome, Outcome::Succeeded);
        assert_eq!(report.exit_code(), 0);
        assert!(report.stages.iter().all(|s| s.status == StageStatus::Succeeded));
        assert_eq!(h.sink.events_of_type("stage.completed").len(), 3);
        assert_eq!(h.sink.events_of_type("step.completed").len(), 3);
    }

    #[tokio::test]
    async fn test_fail_fast_aborts_tail() {
        let h = Harness::new(ScriptedContext::new("node").fail_when("make test", 3));
        let report = h.executor().run(&stages()).await;

        assert_eq!(report.outcome, Outcome::Failed);
        assert_eq!(report.exit_code(), 3);
        assert_stage_status(&report, "build", StageStatus::Succeeded);
        assert_stage_status(&report, "test", StageStatus::Failed);
        assert_aborted_from(&report, "sql");
        assert_eq!(h.ctx.count_matching("make sql"), 0);
        assert_eq!(h.sink.events_of_type("stage.aborted").len(), 1);
    }

    #[tokio::test]
    async fn test_step_timeout_is_typed() {
        let h = Harness::new(ScriptedContext::new("node").hang_when("make build"));
        let stages = vec![StageSpec::new("build", "node")
            .with_step(StepSpec::new("compile", "make build").with_timeout(Duration::from_secs(1)))];
        let report = h.executor().run(&stages).await;

        let build = report.stage("build").unwrap();
        assert_eq!(build.status, StageStatus::Failed);
        assert!(build.steps[0].timed_out);
        match report.failure {
            Some(CiflowError::Step(ref f)) => assert!(f.timed_out),
            ref other => panic!("expected step failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancellation_aborts_current_and_rest() {
        let h = Harness::new(ScriptedContext::new("node").hang_when("make test"));
        let cancel = Arc::new(CancellationToken::new());
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel("SIGINT");
        });

        let report = h.executor().with_cancellation(cancel).run(&stages()).await;

        assert_eq!(report.outcome, Outcome::Aborted);
        assert_eq!(report.exit_code(), EXIT_CANCELLED);
        assert_stage_status(&report, "build", StageStatus::Succeeded);
        assert_aborted_from(&report, "test");
    }

    #[tokio::test]
    async fn test_credentials_required_but_not_requested() {
        let h = Harness::new(ScriptedContext::new("node"));
        let stages = vec![
            StageSpec::new("build", "node").step("compile", "make build"),
            StageSpec::new("verify", "node")
                .requires(Capability::Credentials)
                .step("whoami", "aws sts get-caller-identity"),
        ];
        let report = h.executor().run(&stages).await;

        assert_stage_status(&report, "build", StageStatus::Succeeded);
        let verify = report.stage("verify").unwrap();
        assert_eq!(verify.status, StageStatus::Failed);
        assert_eq!(verify.error_kind.as_deref(), Some("missing_credential_error"));
        assert_eq!(h.ctx.count_matching("aws sts"), 0);
    }

    fn expired_session(workspace: &RunWorkspace) -> CredentialSession {
        let dir = workspace.credentials_dir();
        CredentialSession::new(
            "arn:aws:iam::123456789012:role/ci-runner".into(),
            "ciflow-11".into(),
            "us-east-1".into(),
            crate::credentials::CredentialSet {
                access_key_id: "ASIAEXPIRED0001".into(),
                secret_access_key: "stale-secret".into(),
                session_token: "stale-token".into(),
            },
            crate::utils::now_utc() - chrono::Duration::minutes(5),
            dir.join(crate::credentials::CREDENTIAL_FILE_NAME),
            dir.join(crate::credentials::RESPONSE_FILE_NAME),
        )
    }

    #[tokio::test]
    async fn test_expired_session_fails_credential_stage() {
        let h = Harness::new(ScriptedContext::new("node"));
        let stages = vec![
            StageSpec::new("build", "node").step("compile", "make build"),
            StageSpec::new("verify", "node")
                .requires(Capability::Credentials)
                .step("whoami", "aws sts get-caller-identity"),
            StageSpec::new("sql", "node").step("query", "make sql"),
        ];
        let session = Arc::new(expired_session(&h.workspace));
        let report = h
            .executor()
            .with_credentials(CredentialState::Acquired(session))
            .run(&stages)
            .await;

        assert_eq!(report.outcome, Outcome::Failed);
        assert_stage_status(&report, "build", StageStatus::Succeeded);
        let verify = report.stage("verify").unwrap();
        assert_eq!(verify.status, StageStatus::Failed);
        assert_eq!(verify.error_kind.as_deref(), Some("missing_credential_error"));
        assert!(verify.message.as_deref().unwrap().contains("expired"));
        match report.failure {
            Some(CiflowError::MissingCredential(ref e)) => assert!(e.expired),
            ref other => panic!("expected missing credentials, got {other:?}"),
        }
        assert_eq!(h.ctx.count_matching("aws sts"), 0);
        assert_aborted_from(&report, "sql");
        assert_eq!(h.ctx.count_matching("make sql"), 0);
    }

    #[tokio::test]
    async fn test_results_dir_and_run_env() {
        let h = Harness::new(ScriptedContext::new("node"));
        let stages = vec![StageSpec::new("test-run-1", "node")
            .with_results()
            .with_env("PYTHONPATH", ".ciflow/deps")
            .step("run", "python3 tests/test_run_1.py")];
        let report = h.executor().run(&stages).await;

        let dir = report.stage("test-run-1").unwrap().results_dir.clone().unwrap();
        assert!(dir.is_dir());
        let env = &h.ctx.executions()[0].env;
        assert_eq!(env.get(RESULTS_DIR_VAR), Some(dir.display().to_string().as_str()));
        assert_eq!(env.get("CIFLOW_RUN_ID"), Some("11"));
        assert_eq!(env.get("CIFLOW_SESSION_NAME"), Some("ciflow-11"));
        assert_eq!(env.get("PYTHONPATH"), Some(".ciflow/deps"));
        assert!(!env.has_credentials());
    }

    #[tokio::test]
    async fn test_driver_disabled_and_absent_fails_before_sql() {
        let h = Harness::new(ScriptedContext::new("node").fail_when("odbcinst", 1));
        let stages = vec![StageSpec::new("sql-test", "node")
            .requires(Capability::SqlDriver)
            .step("run", "python3 tests/run_sql_test.py")];
        let executor = h.executor().with_config(ExecutorConfig {
            install_driver: false,
            ..ExecutorConfig::default()
        });
        let report = executor.run(&stages).await;

        let sql = report.stage("sql-test").unwrap();
        assert_eq!(sql.error_kind.as_deref(), Some("provisioning_error"));
        assert!(sql.message.as_deref().unwrap().contains("installation is disabled"));
        assert_eq!(h.ctx.count_matching("run_sql_test"), 0);
        assert_eq!(h.ctx.count_matching("apt-get"), 0);
    }

    #[tokio::test]
    async fn test_unknown_context_fails_stage() {
        let h = Harness::new(ScriptedContext::new("node"));
        let stages = vec![StageSpec::new("build", "elsewhere").step("compile", "make")];
        let report = h.executor().run(&stages).await;
        assert_eq!(report.outcome, Outcome::Failed);
        assert_eq!(report.stages[0].error_kind.as_deref(), Some("context_error"));
    }
}
