//! Merges per-stage result directories into one report.

use super::result::{AllureResult, TestResult, TestTotals};
use crate::context::RunIdentity;
use crate::core::{Outcome, StageStatus};
use crate::pipeline::ExecutionReport;
use crate::utils::iso_timestamp;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

/// Suffix of the files read from a results directory.
pub const RESULT_FILE_SUFFIX: &str = "-result.json";

/// Where one stage left its results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageOutput {
    /// Stage name.
    pub stage: String,
    /// Results directory; `None` or missing means zero tests.
    pub results_dir: Option<PathBuf>,
}

impl StageOutput {
    /// Creates an output entry.
    #[must_use]
    pub fn new(stage: impl Into<String>, results_dir: Option<PathBuf>) -> Self {
        Self {
            stage: stage.into(),
            results_dir,
        }
    }
}

/// Tests from one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageResults {
    /// Stage name.
    pub stage: String,
    /// Totals for this stage.
    pub totals: TestTotals,
    /// Individual results, ordered by source file.
    pub tests: Vec<TestResult>,
}

/// Status line for one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSummary {
    /// Stage name.
    pub name: String,
    /// Final status.
    pub status: StageStatus,
    /// Wall-clock duration.
    pub duration_ms: f64,
    /// Failure or abort reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// The consolidated report for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidatedReport {
    /// Caller-supplied run id.
    pub run_id: String,
    /// Generated run id.
    pub pipeline_run_id: Uuid,
    /// Run outcome, when built from an execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    /// When the report was built (ISO 8601).
    pub generated_at: String,
    /// Every planned stage and how it ended.
    #[serde(default)]
    pub stages: Vec<StageSummary>,
    /// Test results per stage.
    pub results: Vec<StageResults>,
    /// Totals across all stages.
    pub totals: TestTotals,
}

impl ConsolidatedReport {
    /// Results of a named stage.
    #[must_use]
    pub fn stage_results(&self, stage: &str) -> Option<&StageResults> {
        self.results.iter().find(|r| r.stage == stage)
    }

    /// Renders the plain-text summary.
    #[must_use]
    pub fn summary_text(&self) -> String {
        let mut out = String::new();
        let outcome = self.outcome.map_or_else(|| "unknown".to_string(), |o| o.to_string());
        let _ = writeln!(out, "ciflow run {} ({}): {}", self.run_id, self.pipeline_run_id, outcome);

        let width = self.stages.iter().map(|s| s.name.len()).max().unwrap_or(0);
        for stage in &self.stages {
            let _ = write!(
                out,
                "  {:<width$}  {:<9}  {:>8.1}s",
                stage.name,
                stage.status.to_string(),
                stage.duration_ms / 1000.0,
            );
            if let Some(results) = self.stage_results(&stage.name) {
                let _ = write!(out, "  {}", results.totals);
            }
            if let Some(message) = &stage.message {
                let _ = write!(out, "  ({message})");
            }
            out.push('\n');
        }

        let _ = writeln!(out, "Total: {}", self.totals);
        out
    }
}

/// Reads stage result directories for one run.
#[derive(Debug, Clone)]
pub struct ReportAggregator {
    run_id: String,
    pipeline_run_id: Uuid,
}

impl ReportAggregator {
    /// Creates an aggregator for `identity`'s run.
    #[must_use]
    pub fn new(identity: &RunIdentity) -> Self {
        Self {
            run_id: identity.run_id.clone(),
            pipeline_run_id: identity.pipeline_run_id,
        }
    }

    /// Reads every output directory and merges entries by stage name.
    #[must_use]
    pub fn collect(&self, outputs: &[StageOutput]) -> ConsolidatedReport {
        let mut by_stage: BTreeMap<&str, Vec<TestResult>> = BTreeMap::new();
        let mut order: Vec<&str> = Vec::new();

        for output in outputs {
            let tests = by_stage.entry(output.stage.as_str()).or_insert_with(|| {
                order.push(output.stage.as_str());
                Vec::new()
            });
            if let Some(dir) = &output.results_dir {
                tests.extend(read_results_dir(dir));
            }
        }

        let mut totals = TestTotals::default();
        let results = order
            .into_iter()
            .map(|stage| {
                let tests = by_stage.remove(stage).unwrap_or_default();
                let stage_totals = TestTotals::of(&tests);
                totals.merge(&stage_totals);
                StageResults {
                    stage: stage.to_string(),
                    totals: stage_totals,
                    tests,
                }
            })
            .collect();

        ConsolidatedReport {
            run_id: self.run_id.clone(),
            pipeline_run_id: self.pipeline_run_id,
            outcome: None,
            generated_at: iso_timestamp(),
            stages: Vec::new(),
            results,
            totals,
        }
    }

    /// Builds the report for a finished execution.
    ///
    /// Every stage that was set up to collect results contributes an entry.
    #[must_use]
    pub fn collect_execution(&self, execution: &ExecutionReport) -> ConsolidatedReport {
        let outputs: Vec<StageOutput> = execution
            .stages
            .iter()
            .filter(|s| s.results_dir.is_some())
            .map(|s| StageOutput::new(&s.name, s.results_dir.clone()))
            .collect();

        let mut report = self.collect(&outputs);
        report.outcome = Some(execution.outcome);
        report.stages = execution
            .stages
            .iter()
            .map(|s| StageSummary {
                name: s.name.clone(),
                status: s.status,
                duration_ms: s.duration_ms,
                message: s.message.clone(),
            })
            .collect();
        report
    }
}

/// Reads the `*-result.json` files in `dir`, sorted by file name.
///
/// A missing directory yields no results. Unparseable files become broken
/// entries.
pub fn read_results_dir(dir: &Path) -> Vec<TestResult> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(dir = %dir.display(), "No results directory");
            return Vec::new();
        }
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "Cannot read results directory");
            return Vec::new();
        }
    };

    let mut files: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(RESULT_FILE_SUFFIX))
        })
        .collect();
    files.sort();

    files.iter().map(|path| read_result_file(path)).collect()
}

fn read_result_file(path: &Path) -> TestResult {
    let source = path
        .file_name()
        .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned());

    let parsed = std::fs::read_to_string(path)
        .map_err(|e| e.to_string())
        .and_then(|raw| serde_json::from_str::<AllureResult>(&raw).map_err(|e| e.to_string()));

    match parsed {
        Ok(result) => TestResult::from_allure(result, source),
        Err(message) => {
            warn!(file = %source, error = %message, "Unparseable result file");
            TestResult::unreadable(source, format!("unparseable result file: {message}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::TestStatus;
    use pretty_assertions::assert_eq;

    fn write(dir: &Path, name: &str, status: &str) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(
            dir.join(name),
            format!(r#"{{"name": "{name}", "status": "{status}", "start": 10, "stop": 15}}"#),
        )
        .unwrap();
    }

    fn aggregator() -> ReportAggregator {
        ReportAggregator::new(&RunIdentity::new("7", "ciflow").unwrap())
    }

    #[test]
    fn test_missing_directory_is_zero_tests() {
        let tmp = tempfile::tempdir().unwrap();
        let report = aggregator().collect(&[
            StageOutput::new("test-run-1", Some(tmp.path().join("absent"))),
            StageOutput::new("test-run-3", None),
        ]);
        assert_eq!(report.results.len(), 2);
        assert_eq!(report.totals.total(), 0);
        assert_eq!(report.stage_results("test-run-3").unwrap().tests.len(), 0);
    }

    #[test]
    fn test_merge_by_stage_and_broken_files() {
        let tmp = tempfile::tempdir().unwrap();
        let a = tmp.path().join("a");
        let b = tmp.path().join("b");
        write(&a, "1-result.json", "passed");
        write(&a, "2-result.json", "failed");
        write(&b, "3-result.json", "skipped");
        std::fs::write(b.join("4-result.json"), "{not json").unwrap();
        std::fs::write(b.join("c-container.json"), "{}").unwrap();

        let report = aggregator().collect(&[
            StageOutput::new("etl", Some(a)),
            StageOutput::new("etl", Some(b)),
        ]);

        assert_eq!(report.results.len(), 1);
        let etl = report.stage_results("etl").unwrap();
        assert_eq!(
            etl.totals,
            TestTotals { passed: 1, failed: 1, broken: 1, skipped: 1 }
        );
        let broken = etl.tests.iter().find(|t| t.status == TestStatus::Broken).unwrap();
        assert_eq!(broken.source, "4-result.json");
        assert!(broken.message.as_deref().unwrap().starts_with("unparseable result file"));
        assert_eq!(etl.tests[0].duration_ms, Some(5));
    }

    #[test]
    fn test_summary_text() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "1-result.json", "passed");
        let mut report = aggregator().collect(&[StageOutput::new("test-run-1", Some(tmp.path().into()))]);
        report.outcome = Some(Outcome::Failed);
        report.stages = vec![
            StageSummary {
                name: "test-run-1".into(),
                status: StageStatus::Succeeded,
                duration_ms: 1500.0,
                message: None,
            },
            StageSummary {
                name: "sql-test".into(),
                status: StageStatus::Aborted,
                duration_ms: 0.0,
                message: Some("stage 'x' failed".into()),
            },
        ];

        let text = report.summary_text();
        assert!(text.starts_with("ciflow run 7 ("));
        assert!(text.contains("): failed"));
        assert!(text.contains("1 tests: 1 passed"));
        assert!(text.contains("aborted"));
        assert!(text.ends_with("Total: 1 tests: 1 passed, 0 failed, 0 broken, 0 skipped\n"));
    }
}
