//! ciflow command-line entry point.

mod cli;

use anyhow::{Context, Result};
use ciflow::config::{PipelineConfig, DEFAULT_CONFIG_FILE};
use ciflow::errors::{CiflowError, ConfigError, EXIT_CANCELLED, EXIT_CONFIG, EXIT_FAILURE};
use ciflow::observability::init_tracing;
use ciflow::pipeline::{PipelinePlan, PipelineRun, RunSummary};
use clap::Parser;
use cli::{Cli, Commands};
use std::path::PathBuf;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("ciflow: {e:#}");
            exit_code_for(&e)
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let config = load_config(&cli).await?;
    init_tracing(&config.logging)?;

    let plan = config.plan();
    match cli.command {
        Commands::Plan(_) => {
            print_plan(&plan);
            Ok(0)
        }
        Commands::Validate(_) => {
            println!("{}", serde_json::to_string_pretty(&plan).context("rendering plan")?);
            println!("configuration ok");
            Ok(0)
        }
        Commands::Run(_) => {
            let options = config.run_options()?;
            let pipeline = PipelineRun::new(options, plan);
            let cancel = pipeline.cancellation();
            tokio::spawn(async move {
                let mut signals = match ShutdownSignals::install() {
                    Ok(signals) => signals,
                    Err(e) => {
                        error!(error = %e, "Signal handlers unavailable");
                        return;
                    }
                };
                let mut received = 0;
                loop {
                    let signal = signals.recv().await;
                    received += 1;
                    match signal_action(received) {
                        SignalAction::Cancel => {
                            warn!(signal, "Cancelling run; send again to exit without cleanup");
                            cancel.cancel(signal);
                        }
                        SignalAction::ForceExit => {
                            eprintln!("ciflow: {signal} received again, exiting without waiting for cleanup");
                            std::process::exit(EXIT_CANCELLED);
                        }
                    }
                }
            });

            let summary = pipeline.execute().await?;
            report(&summary);
            Ok(summary.exit_code())
        }
    }
}

/// File, then environment, then flags.
async fn load_config(cli: &Cli) -> Result<PipelineConfig> {
    let args = cli.command.args();
    let mut config = match &cli.config {
        Some(path) => PipelineConfig::from_file(path).await?,
        None => {
            let workspace = args
                .workspace
                .clone()
                .or_else(|| std::env::var_os("CIFLOW_WORKSPACE").map(PathBuf::from))
                .or_else(|| std::env::var_os("WORKSPACE").map(PathBuf::from))
                .unwrap_or_else(|| PathBuf::from("."));
            PipelineConfig::load_or_default(&workspace.join(DEFAULT_CONFIG_FILE)).await?
        }
    };
    config.apply_env_overrides()?;
    args.apply(&mut config);
    if let Some(level) = &cli.log_level {
        config.logging.level.clone_from(level);
    }
    if let Some(format) = &cli.log_format {
        config.logging.format.clone_from(format);
    }
    config.validate()?;
    Ok(config)
}

fn print_plan(plan: &PipelinePlan) {
    for (index, stage) in plan.stages.iter().enumerate() {
        let requires: Vec<String> = stage.requires.iter().map(ToString::to_string).collect();
        let requires = if requires.is_empty() {
            String::new()
        } else {
            format!(" requires [{}]", requires.join(", "))
        };
        println!("{:>2}. {} @ {}{}", index + 1, stage.name, stage.context, requires);
        for step in &stage.steps {
            println!("      - {}: {}", step.name, step.run);
        }
    }
}

fn report(summary: &RunSummary) {
    print!("{}", summary.report.summary_text());

    if let Some(warning) = &summary.publish_warning {
        warn!(%warning, "Report was not published");
    }
    for path in &summary.report_paths {
        info!(path = %path.display(), "Report written");
    }

    let cleanup = &summary.cleanup;
    if cleanup.is_clean() {
        println!("cleanup: {} task(s), ok", cleanup.tasks_run);
    } else {
        println!("cleanup: {} task(s), {} warning(s)", cleanup.tasks_run, cleanup.warnings.len());
        for warning in &cleanup.warnings {
            println!("  {warning}");
        }
    }
    if !cleanup.credentials_removed {
        error!("Credential artifacts could not be removed");
    }

    let outcome = summary.outcome();
    match &summary.execution.failure {
        Some(failure) => println!("ciflow: {outcome} ({failure}), exit code {}", summary.exit_code()),
        None => println!("ciflow: {outcome}, exit code {}", summary.exit_code()),
    }
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    if let Some(e) = err.downcast_ref::<CiflowError>() {
        e.exit_code()
    } else if err.downcast_ref::<ConfigError>().is_some() {
        EXIT_CONFIG
    } else {
        EXIT_FAILURE
    }
}

/// What to do on the n-th shutdown signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignalAction {
    /// Cancel the run and let cleanup finish.
    Cancel,
    /// Leave immediately.
    ForceExit,
}

fn signal_action(received: usize) -> SignalAction {
    if received <= 1 {
        SignalAction::Cancel
    } else {
        SignalAction::ForceExit
    }
}

/// SIGTERM and SIGINT, installed once for the life of the run.
#[cfg(unix)]
struct ShutdownSignals {
    sigterm: tokio::signal::unix::Signal,
    sigint: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl ShutdownSignals {
    fn install() -> Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            sigterm: signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?,
            sigint: signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?,
        })
    }

    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.sigterm.recv() => "SIGTERM",
            _ = self.sigint.recv() => "SIGINT",
        }
    }
}

#[cfg(not(unix))]
struct ShutdownSignals;

#[cfg(not(unix))]
impl ShutdownSignals {
    #[allow(clippy::unnecessary_wraps)]
    fn install() -> Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) -> &'static str {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
        "ctrl-c"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_signal_cancels_second_exits() {
        assert_eq!(signal_action(1), SignalAction::Cancel);
        assert_eq!(signal_action(2), SignalAction::ForceExit);
        assert_eq!(signal_action(5), SignalAction::ForceExit);
    }

    #[test]
    fn test_exit_codes_for_startup_errors() {
        let config = anyhow::Error::new(ConfigError::invalid("region", "must not be empty"));
        assert_eq!(exit_code_for(&config), EXIT_CONFIG);
        assert_eq!(exit_code_for(&anyhow::anyhow!("boom")), EXIT_FAILURE);
        let cancelled = anyhow::Error::new(CiflowError::Cancelled("SIGINT".into()));
        assert_eq!(exit_code_for(&cancelled), EXIT_CANCELLED);
    }
}
