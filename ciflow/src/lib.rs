//! # ciflow
//!
//! A single-run CI orchestrator.
//!
//! A run executes an ordered list of stages (build, tests, SQL checks), each
//! in a named execution context, with:
//!
//! - **Scoped credentials**: a time-limited session obtained by assuming a
//!   target role, injected only into the stages that declare the need
//! - **Idempotent provisioning**: capabilities such as the SQL driver are
//!   probed and installed at most once per context
//! - **Fail-fast execution**: the first failing step aborts every later stage
//! - **Unconditional cleanup**: credential files, containers and the run
//!   workspace are erased exactly once, whatever the outcome
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use ciflow::prelude::*;
//!
//! let plan = Preset::SingleNode.plan(&PresetOptions::default());
//! let options = RunOptions::new("1234", "/var/ci/checkout");
//! let summary = PipelineRun::new(options, plan).execute().await?;
//! std::process::exit(summary.exit_code());
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, missing_docs, rust_2018_idioms)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod cleanup;
pub mod config;
pub mod context;
pub mod core;
pub mod credentials;
pub mod errors;
pub mod events;
pub mod observability;
pub mod pipeline;
pub mod provisioning;
pub mod report;
pub mod sandbox;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::cleanup::{CleanupGuard, CleanupReport};
    pub use crate::config::PipelineConfig;
    pub use crate::context::{RunIdentity, RunWorkspace};
    pub use crate::core::{Capability, Outcome, PipelineEvent, StageStatus};
    pub use crate::credentials::{CredentialBroker, CredentialSession, IdentityService};
    pub use crate::errors::{
        CiflowError, CleanupWarning, ConfigError, CredentialError, MissingCredentialError,
        ProvisioningError, StepFailure,
    };
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::pipeline::{
        ExecutionReport, PipelinePlan, PipelineRun, Preset, PresetOptions, RunOptions, RunSummary,
        StageExecutor, StageSpec, StepSpec,
    };
    pub use crate::provisioning::{EnvironmentProvisioner, ProvisioningLedger};
    pub use crate::report::{ConsolidatedReport, DirectoryPublisher, ReportAggregator, ReportPublisher};
    pub use crate::sandbox::{ContextPool, ContextSpec, ExecutionContext};
}
