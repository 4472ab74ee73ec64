//! Assertion helpers for run reports.

use crate::core::{Outcome, StageStatus};
use crate::credentials::{CREDENTIAL_FILE_NAME, RESPONSE_FILE_NAME};
use crate::pipeline::ExecutionReport;
use std::path::{Path, PathBuf};

/// Asserts the status of a named stage.
///
/// # Panics
///
/// Panics if the stage is missing or has a different status.
pub fn assert_stage_status(report: &ExecutionReport, stage: &str, expected: StageStatus) {
    let found = report
        .stage(stage)
        .unwrap_or_else(|| panic!("stage '{stage}' not in report"));
    assert_eq!(
        found.status, expected,
        "stage '{stage}' status: {:?}",
        found.message
    );
}

/// Asserts the run outcome.
///
/// # Panics
///
/// Panics on a different outcome.
pub fn assert_outcome(report: &ExecutionReport, expected: Outcome) {
    assert_eq!(
        report.outcome,
        expected,
        "outcome (failure: {:?})",
        report.failure.as_ref().map(ToString::to_string)
    );
}

/// Asserts that `stage` and every stage after it were aborted without
/// running a step.
///
/// # Panics
///
/// Panics if the stage is missing or any stage from it onward ran.
pub fn assert_aborted_from(report: &ExecutionReport, stage: &str) {
    let start = report
        .stages
        .iter()
        .position(|s| s.name == stage)
        .unwrap_or_else(|| panic!("stage '{stage}' not in report"));
    for s in &report.stages[start..] {
        assert_eq!(s.status, StageStatus::Aborted, "stage '{}' should be aborted", s.name);
        assert!(
            s.steps.iter().all(|step| step.status == StageStatus::Aborted),
            "stage '{}' ran steps after the abort",
            s.name
        );
    }
}

/// Credential artifact files anywhere under `root`.
#[must_use]
pub fn find_credential_artifacts(root: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.filter_map(Result::ok) {
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else if path
                .file_name()
                .is_some_and(|n| n == CREDENTIAL_FILE_NAME || n == RESPONSE_FILE_NAME)
            {
                found.push(path);
            }
        }
    }
    found
}

/// Asserts that no credential artifact exists under `root`.
///
/// # Panics
///
/// Panics if any artifact is found.
pub fn assert_no_credential_artifacts(root: &Path) {
    let found = find_credential_artifacts(root);
    assert!(found.is_empty(), "credential artifacts left behind: {found:?}");
}
