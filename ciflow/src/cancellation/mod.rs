//! Structured cancellation utilities.
//!
//! This module provides:
//! - `CancellationToken` for cooperative cancellation of a run
//! - `run_with_cleanup` for "always finalize" control flow

mod token;

pub use token::{CancelCallback, CancellationToken};

use std::future::Future;

/// Runs `operation`, then always runs `cleanup`, returning both results.
///
/// Errors and cancellation inside `operation` are values, so the cleanup
/// future is reached on every path that does not panic.
pub async fn run_with_cleanup<T, R, F, Fut, C, CFut>(operation: F, cleanup: C) -> (T, R)
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
    C: FnOnce() -> CFut,
    CFut: Future<Output = R>,
{
    let result = operation().await;
    let cleaned = cleanup().await;
    (result, cleaned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_cleanup_runs_after_error() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();

        let (result, ()) = run_with_cleanup(
            || async { Err::<(), _>("boom") },
            || async move {
                flag.store(true, Ordering::SeqCst);
            },
        )
        .await;

        assert!(result.is_err());
        assert!(ran.load(Ordering::SeqCst));
    }
}
