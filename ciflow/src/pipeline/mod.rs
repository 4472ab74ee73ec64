//! Stage plans and their execution.
//!
//! A [`PipelinePlan`] names execution contexts and the ordered stages that run
//! in them. [`Preset`]s build the standard plans; [`StageExecutor`] runs the
//! stages fail-fast; [`PipelineRun`] wraps one execution with credential
//! acquisition, reporting and cleanup.

mod executor;
mod presets;
mod run;
mod spec;


pub use executor::{
    CredentialState, ExecutionReport, ExecutorConfig, StageExecutor, StageReport, StepReport,
    CREDENTIALS_FILE_VAR, DEFAULT_STEP_TIMEOUT, RESULTS_DIR_VAR,
};
pub use presets::{Preset, PresetOptions, DEFAULT_IMAGE};
pub use run::{PipelineRun, RunOptions, RunSummary, DEFAULT_REGION, DEFAULT_SESSION_PREFIX};
pub use spec::{PipelinePlan, StageSpec, StepSpec};
