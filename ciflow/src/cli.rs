//! Command-line interface.
//!
//! Declarative only: flags here are the last override layer on top of
//! `ciflow.toml` and the environment.

use ciflow::config::PipelineConfig;
use ciflow::pipeline::Preset;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Runs a CI pipeline with scoped credentials and guaranteed cleanup.
#[derive(Parser, Debug)]
#[command(name = "ciflow", version, about, long_about = None)]
pub struct Cli {
    /// Configuration file. Defaults to `ciflow.toml` in the workspace, if present.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Override log format (pretty, json).
    #[arg(long, global = true)]
    pub log_format: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Execute the pipeline.
    Run(RunArgs),

    /// Check the configuration and print the resolved plan.
    Validate(RunArgs),

    /// Print the stages that would run.
    Plan(RunArgs),
}

impl Commands {
    /// The run arguments of any subcommand.
    pub fn args(&self) -> &RunArgs {
        match self {
            Self::Run(args) | Self::Validate(args) | Self::Plan(args) => args,
        }
    }
}

/// Settings shared by every subcommand.
#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Run/build identifier.
    #[arg(long)]
    pub run_id: Option<String>,

    /// Repository checkout.
    #[arg(short, long)]
    pub workspace: Option<PathBuf>,

    /// Stage plan preset (single-node, multi-container).
    #[arg(long)]
    pub preset: Option<Preset>,

    /// Image for container contexts.
    #[arg(long)]
    pub image: Option<String>,

    /// Acquire a credential session (true/false).
    #[arg(long, value_name = "BOOL")]
    pub require_credentials: Option<bool>,

    /// Role to assume.
    #[arg(long)]
    pub target_identity: Option<String>,

    /// Region for the credential environment.
    #[arg(long)]
    pub region: Option<String>,

    /// Install the SQL driver when missing (true/false).
    #[arg(long, value_name = "BOOL")]
    pub install_driver: Option<bool>,

    /// Where to publish the report.
    #[arg(long)]
    pub report_dir: Option<PathBuf>,

    /// Leave the run workspace on disk.
    #[arg(long)]
    pub keep_workspace: bool,
}

impl RunArgs {
    /// Applies the flags that were given.
    pub fn apply(&self, config: &mut PipelineConfig) {
        if let Some(run_id) = &self.run_id {
            config.run_id = Some(run_id.clone());
        }
        if let Some(workspace) = &self.workspace {
            config.workspace = Some(workspace.clone());
        }
        if let Some(preset) = self.preset {
            config.preset = preset;
        }
        if let Some(image) = &self.image {
            config.image.clone_from(image);
        }
        if let Some(require) = self.require_credentials {
            config.require_credentials = require;
        }
        if let Some(target) = &self.target_identity {
            config.target_identity = Some(target.clone());
        }
        if let Some(region) = &self.region {
            config.region.clone_from(region);
        }
        if let Some(install) = self.install_driver {
            config.install_driver = install;
        }
        if let Some(dir) = &self.report_dir {
            config.report_dir = Some(dir.clone());
        }
        if self.keep_workspace {
            config.keep_workspace = true;
        }
    }
}
