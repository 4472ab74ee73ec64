//! One end-to-end pipeline run.

use super::executor::{CredentialState, ExecutionReport, ExecutorConfig, StageExecutor, DEFAULT_STEP_TIMEOUT};
use super::spec::PipelinePlan;
use crate::cancellation::{run_with_cleanup, CancellationToken};
use crate::cleanup::{CleanupGuard, CleanupReport, DEFAULT_CLEANUP_TIMEOUT};
use crate::context::{RunIdentity, RunWorkspace};
use crate::core::{Capability, Outcome, PipelineEvent};
use crate::credentials::{
    AwsCliIdentityService, CredentialBroker, IdentityService, DEFAULT_ACQUIRE_TIMEOUT, DEFAULT_DURATION_SECS,
};
use crate::errors::{CiflowError, ConfigError, CredentialError, CredentialErrorReason};
use crate::events::{EventSink, LoggingEventSink};
use crate::provisioning::{EnvironmentProvisioner, ProvisioningLedger, DEFAULT_INSTALL_TIMEOUT};
use crate::report::{ConsolidatedReport, DirectoryPublisher, ReportAggregator, ReportPublisher};
use crate::sandbox::{ContextPool, ExecutionContext};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

/// Default prefix for derived session names.
pub const DEFAULT_SESSION_PREFIX: &str = "ciflow";
/// Default region.
pub const DEFAULT_REGION: &str = "us-east-1";

/// Everything a run needs besides its plan.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Caller-supplied run/build id.
    pub run_id: String,
    /// Repository checkout the stages run against.
    pub checkout: PathBuf,
    /// Prefix of the derived session name.
    pub session_prefix: String,
    /// Acquire a credential session before the first stage.
    pub require_credentials: bool,
    /// Role to assume when credentials are required.
    pub target_identity: Option<String>,
    /// Region written into the credential environment.
    pub region: String,
    /// Install the SQL driver when missing.
    pub install_driver: bool,
    /// Requested session lifetime.
    pub credential_duration_secs: u32,
    /// Bound on credential acquisition.
    pub acquire_timeout: Duration,
    /// Timeout for steps that don't set one.
    pub default_step_timeout: Duration,
    /// Bound on one driver install.
    pub install_timeout: Duration,
    /// Bound on the whole cleanup pass.
    pub cleanup_timeout: Duration,
    /// Where to publish the report. Defaults to `.ciflow/reports/<run>` in the checkout.
    pub report_dir: Option<PathBuf>,
    /// Leave the run workspace on disk. Credential artifacts are erased regardless.
    pub keep_workspace: bool,
}

impl RunOptions {
    /// Options with defaults for everything but the run id and checkout.
    #[must_use]
    pub fn new(run_id: impl Into<String>, checkout: impl Into<PathBuf>) -> Self {
        Self {
            run_id: run_id.into(),
            checkout: checkout.into(),
            session_prefix: DEFAULT_SESSION_PREFIX.to_string(),
            require_credentials: false,
            target_identity: None,
            region: DEFAULT_REGION.to_string(),
            install_driver: true,
            credential_duration_secs: DEFAULT_DURATION_SECS,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            default_step_timeout: DEFAULT_STEP_TIMEOUT,
            install_timeout: DEFAULT_INSTALL_TIMEOUT,
            cleanup_timeout: DEFAULT_CLEANUP_TIMEOUT,
            report_dir: None,
            keep_workspace: false,
        }
    }

    /// Requires credentials for `target_identity`.
    #[must_use]
    pub fn with_credentials(mut self, target_identity: impl Into<String>) -> Self {
        self.require_credentials = true;
        self.target_identity = Some(target_identity.into());
        self
    }

    /// Checks option combinations that no stage could recover from.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.run_id.trim().is_empty() {
            return Err(ConfigError::invalid("run_id", "must not be empty"));
        }
        if self.require_credentials {
            match self.target_identity.as_deref().map(str::trim) {
                None | Some("") => {
                    return Err(ConfigError::invalid(
                        "target_identity",
                        "required when require_credentials is set",
                    ))
                }
                Some(_) => {}
            }
            if self.region.trim().is_empty() {
                return Err(ConfigError::invalid("region", "must not be empty"));
            }
        }
        Ok(())
    }
}

/// What a finished run produced.
#[derive(Debug)]
pub struct RunSummary {
    /// The run's identifiers.
    pub identity: RunIdentity,
    /// Stage results and the terminal outcome.
    pub execution: ExecutionReport,
    /// The consolidated test report.
    pub report: ConsolidatedReport,
    /// Files written by the publisher.
    pub report_paths: Vec<PathBuf>,
    /// Set when publishing failed.
    pub publish_warning: Option<String>,
    /// What cleanup did.
    pub cleanup: CleanupReport,
}

impl RunSummary {
    /// The terminal outcome.
    #[must_use]
    pub fn outcome(&self) -> Outcome {
        self.execution.outcome
    }

    /// Process exit code.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        self.execution.exit_code()
    }
}

struct Executed {
    execution: ExecutionReport,
    report: ConsolidatedReport,
    report_paths: Vec<PathBuf>,
    publish_warning: Option<String>,
}

/// Drives one run from identity to cleanup.
///
/// Everything the run creates lives under its own workspace directory and is
/// handed to a [`CleanupGuard`] as soon as it exists, so `finalize` runs on
/// success, failure and cancellation alike.
pub struct PipelineRun {
    options: RunOptions,
    plan: PipelinePlan,
    identity_service: Arc<dyn IdentityService>,
    publisher: Arc<dyn ReportPublisher>,
    events: Arc<dyn EventSink>,
    cancel: Arc<CancellationToken>,
    overrides: Vec<Arc<dyn ExecutionContext>>,
}

impl std::fmt::Debug for PipelineRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineRun")
            .field("options", &self.options)
            .field("stages", &self.plan.stage_names())
            .finish_non_exhaustive()
    }
}

impl PipelineRun {
    /// Creates a run using the `aws` CLI and a directory publisher.
    #[must_use]
    pub fn new(options: RunOptions, plan: PipelinePlan) -> Self {
        Self {
            options,
            plan,
            identity_service: Arc::new(AwsCliIdentityService::new()),
            publisher: Arc::new(DirectoryPublisher),
            events: Arc::new(LoggingEventSink::default()),
            cancel: Arc::new(CancellationToken::new()),
            overrides: Vec::new(),
        }
    }

    /// Sets the identity service.
    #[must_use]
    pub fn with_identity_service(mut self, service: Arc<dyn IdentityService>) -> Self {
        self.identity_service = service;
        self
    }

    /// Sets the report publisher.
    #[must_use]
    pub fn with_publisher(mut self, publisher: Arc<dyn ReportPublisher>) -> Self {
        self.publisher = publisher;
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

    /// Replaces the planned context of the same name.
    #[must_use]
    pub fn with_context(mut self, context: Arc<dyn ExecutionContext>) -> Self {
        self.overrides.push(context);
        self
    }

    /// The token that cancels this run.
    #[must_use]
    pub fn cancellation(&self) -> Arc<CancellationToken> {
        self.cancel.clone()
    }

    /// Runs every stage, publishes the report and cleans up.
    ///
    /// Returns `Err` only when the run could not be set up at all; stage
    /// failures are reported through the summary.
    #[instrument(skip_all, fields(run_id = %self.options.run_id))]
    pub async fn execute(self) -> Result<RunSummary, CiflowError> {
        self.options.validate()?;
        self.plan.validate()?;

        let identity = RunIdentity::new(&self.options.run_id, &self.options.session_prefix)?;
        let workspace = RunWorkspace::create(&self.options.checkout, &identity)?;

        let mut contexts =
            ContextPool::from_specs(&self.plan.contexts, &self.options.checkout, &identity.workspace_dir_name());
        for context in &self.overrides {
            contexts.insert(context.clone());
        }

        let guard = CleanupGuard::new(self.options.cleanup_timeout).with_events(self.events.clone());
        if !self.options.keep_workspace {
            guard.own_workspace(workspace.clone());
        }
        let ledger = Arc::new(ProvisioningLedger::new());
        guard.own_contexts(&contexts, &ledger);
        guard.own_credentials(workspace.credentials_dir());

        let events = self.events.clone();
        self.cancel
            .on_cancel(move || events.try_emit(PipelineEvent::new("run.cancel_requested")));

        info!(
            pipeline_run_id = %identity.pipeline_run_id,
            session_name = %identity.session_name,
            stages = self.plan.stages.len(),
            "Run started"
        );
        self.events
            .emit(PipelineEvent::new("run.started").add_data("identity", identity.to_json()))
            .await;

        let (executed, cleanup) = run_with_cleanup(
            || self.drive(&identity, &workspace, contexts, ledger),
            || guard.finalize(),
        )
        .await;

        let outcome = executed.execution.outcome;
        if outcome.is_success() {
            info!(%outcome, cleanup_warnings = cleanup.warnings.len(), "Run finished");
        } else {
            error!(%outcome, cleanup_warnings = cleanup.warnings.len(), "Run finished");
        }
        self.events
            .emit(
                PipelineEvent::new("run.finished")
                    .add_data("outcome", serde_json::json!(outcome))
                    .add_data("exit_code", serde_json::json!(executed.execution.exit_code())),
            )
            .await;

        Ok(RunSummary {
            identity,
            execution: executed.execution,
            report: executed.report,
            report_paths: executed.report_paths,
            publish_warning: executed.publish_warning,
            cleanup,
        })
    }

    async fn drive(
        &self,
        identity: &RunIdentity,
        workspace: &RunWorkspace,
        contexts: ContextPool,
        ledger: Arc<ProvisioningLedger>,
    ) -> Executed {
        let credentials = self.acquire_credentials(identity, workspace).await;

        let provisioner = EnvironmentProvisioner::new(ledger)
            .with_install_timeout(self.options.install_timeout);
        let executor = StageExecutor::new(contexts, provisioner, workspace.clone(), identity.clone())
            .with_credentials(credentials)
            .with_events(self.events.clone())
            .with_cancellation(self.cancel.clone())
            .with_config(ExecutorConfig {
                default_step_timeout: self.options.default_step_timeout,
                install_driver: self.options.install_driver,
            });

        let execution = executor.run(&self.plan.stages).await;
        let report = ReportAggregator::new(identity).collect_execution(&execution);

        let destination = self.options.report_dir.clone().unwrap_or_else(|| {
            self.options
                .checkout
                .join(".ciflow")
                .join("reports")
                .join(identity.workspace_dir_name())
        });
        let (report_paths, publish_warning) = match self.publisher.publish(&report, &destination).await {
            Ok(paths) => (paths, None),
            Err(e) => {
                warn!(error = %e, "Report publishing failed");
                (Vec::new(), Some(e.to_string()))
            }
        };

        Executed {
            execution,
            report,
            report_paths,
            publish_warning,
        }
    }

    async fn acquire_credentials(&self, identity: &RunIdentity, workspace: &RunWorkspace) -> CredentialState {
        if !self.options.require_credentials {
            return CredentialState::NotRequested;
        }
        let wanted = self
            .plan
            .stages
            .iter()
            .any(|s| s.needs(Capability::Credentials));
        if !wanted {
            info!("No stage requires credentials, skipping acquisition");
            return CredentialState::NotRequested;
        }

        let target = self.options.target_identity.as_deref().unwrap_or_default();
        let broker = CredentialBroker::new(self.identity_service.clone())
            .with_duration_secs(self.options.credential_duration_secs)
            .with_timeout(self.options.acquire_timeout);
        let credentials_dir = workspace.credentials_dir();

        let acquired = tokio::select! {
            result = broker.acquire(target, &identity.session_name, &self.options.region, &credentials_dir) => result,
            () = self.cancel.cancelled() => Err(CredentialError::new(
                CredentialErrorReason::ServiceUnavailable,
                "acquisition interrupted by cancellation",
            )),
        };

        match acquired {
            Ok(session) => {
                info!(
                    session_name = %session.session_name(),
                    expires_at = %session.expires_at(),
                    "Credential session established"
                );
                self.events
                    .emit(
                        PipelineEvent::new("credentials.acquired")
                            .add_data("session_name", serde_json::json!(session.session_name()))
                            .add_data("expires_at", serde_json::json!(session.expires_at().to_rfc3339())),
                    )
                    .await;
                CredentialState::Acquired(Arc::new(session))
            }
            Err(e) => {
                error!(reason = %e.reason, "Credential acquisition failed: {}", e.message);
                self.events
                    .emit(
                        PipelineEvent::new("credentials.failed")
                            .add_data("reason", serde_json::json!(e.reason.code()))
                            .add_data("message", serde_json::json!(e.message)),
                    )
                    .await;
                CredentialState::Failed(e)
            }
        }
    }
}
