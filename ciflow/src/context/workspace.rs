//! Per-run private workspace.
//!
//! Every sensitive or run-scoped artifact lives under
//! `<checkout>/.ciflow/runs/<run dir>/`, so concurrent runs sharing a
//! checkout never touch each other's credential files or results.

use super::identity::{sanitize_path_component, RunIdentity};
use crate::utils::create_private_dir;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Directory under the checkout that holds all run directories.
pub const RUNS_DIR: &str = ".ciflow/runs";

/// The ephemeral workspace owned by a single run.
#[derive(Debug, Clone)]
pub struct RunWorkspace {
    checkout: PathBuf,
    run_dir: PathBuf,
}

impl RunWorkspace {
    /// Creates the run directory for `identity` under `checkout`.
    pub fn create(checkout: &Path, identity: &RunIdentity) -> io::Result<Self> {
        let run_dir = checkout.join(RUNS_DIR).join(identity.workspace_dir_name());
        create_private_dir(&run_dir)?;
        debug!(run_dir = %run_dir.display(), "Created run workspace");
        Ok(Self {
            checkout: checkout.to_path_buf(),
            run_dir,
        })
    }

    /// The source checkout shared by every stage.
    #[must_use]
    pub fn checkout(&self) -> &Path {
        &self.checkout
    }

    /// The run's private directory.
    #[must_use]
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Directory holding the credential artifacts.
    #[must_use]
    pub fn credentials_dir(&self) -> PathBuf {
        self.run_dir.join("credentials")
    }

    /// Root of the per-stage test result directories.
    #[must_use]
    pub fn results_root(&self) -> PathBuf {
        self.run_dir.join("results")
    }

    /// Result directory for one stage.
    #[must_use]
    pub fn stage_results_dir(&self, stage: &str) -> PathBuf {
        self.results_root().join(sanitize_path_component(stage))
    }

    /// Removes the run directory. Returns `false` if it was already gone.
    pub fn remove(&self) -> io::Result<bool> {
        match std::fs::remove_dir_all(&self.run_dir) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}
