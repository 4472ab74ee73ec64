//! Run identity and the run-scoped workspace.

mod identity;
mod workspace;

pub use identity::{derive_session_name, sanitize_path_component, RunIdentity, MAX_SESSION_NAME_LEN};
pub use workspace::{RunWorkspace, RUNS_DIR};
