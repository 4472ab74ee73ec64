//! Unconditional end-of-run cleanup.
//!
//! - [`CleanupRegistry`] runs named async tasks in LIFO order with a bounded timeout
//! - [`CleanupGuard`] owns a run's credentials, contexts and workspace and
//!   erases them exactly once

mod guard;
mod registry;

pub use guard::{CleanupGuard, CleanupReport, DEFAULT_CLEANUP_TIMEOUT};
pub use registry::CleanupRegistry;
