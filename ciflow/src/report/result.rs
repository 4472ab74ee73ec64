//! Test result records and totals.

use crate::utils::from_unix_millis;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a single test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    /// The test passed.
    Passed,
    /// An assertion failed.
    Failed,
    /// The test errored outside its assertions, or its result was unreadable.
    Broken,
    /// The test did not run.
    Skipped,
}

impl TestStatus {
    /// Maps an Allure status string. Unknown values count as broken.
    #[must_use]
    pub fn from_allure(status: &str) -> Self {
        match status.trim().to_ascii_lowercase().as_str() {
            "passed" => Self::Passed,
            "failed" => Self::Failed,
            "skipped" => Self::Skipped,
            _ => Self::Broken,
        }
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Passed => write!(f, "passed"),
            Self::Failed => write!(f, "failed"),
            Self::Broken => write!(f, "broken"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// The subset of an Allure `*-result.json` file that is read.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllureResult {
    /// Test name.
    #[serde(default)]
    pub name: String,
    /// Fully qualified name.
    #[serde(default)]
    pub full_name: Option<String>,
    /// Status string.
    #[serde(default)]
    pub status: Option<String>,
    /// Start, epoch millis.
    #[serde(default)]
    pub start: Option<i64>,
    /// Stop, epoch millis.
    #[serde(default)]
    pub stop: Option<i64>,
    /// Failure details.
    #[serde(default)]
    pub status_details: Option<StatusDetails>,
}

/// Allure `statusDetails`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusDetails {
    /// Failure message.
    #[serde(default)]
    pub message: Option<String>,
}

/// One test outcome in the consolidated report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    /// Test name.
    pub name: String,
    /// Fully qualified name, if reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    /// Status.
    pub status: TestStatus,
    /// Start time (ISO 8601), when reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    /// Duration in milliseconds, when both timestamps were present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    /// Failure or parse message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// The file the result was read from.
    pub source: String,
}

impl TestResult {
    /// Converts a parsed Allure record.
    #[must_use]
    pub fn from_allure(result: AllureResult, source: impl Into<String>) -> Self {
        let duration_ms = match (result.start, result.stop) {
            (Some(start), Some(stop)) => stop.checked_sub(start).filter(|d| *d >= 0),
            _ => None,
        };
        let status = result
            .status
            .as_deref()
            .map_or(TestStatus::Broken, TestStatus::from_allure);
        Self {
            name: result.name,
            full_name: result.full_name,
            status,
            started_at: result.start.and_then(from_unix_millis).map(|t| t.to_rfc3339()),
            duration_ms,
            message: result.status_details.and_then(|d| d.message),
            source: source.into(),
        }
    }

    /// A broken entry standing in for a file that could not be read.
    #[must_use]
    pub fn unreadable(source: impl Into<String>, message: impl Into<String>) -> Self {
        let source = source.into();
        Self {
            name: source.clone(),
            full_name: None,
            status: TestStatus::Broken,
            started_at: None,
            duration_ms: None,
            message: Some(message.into()),
            source,
        }
    }
}

/// Counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestTotals {
    /// Passed tests.
    pub passed: usize,
    /// Failed tests.
    pub failed: usize,
    /// Broken tests.
    pub broken: usize,
    /// Skipped tests.
    pub skipped: usize,
}

impl TestTotals {
    /// Counts one result.
    pub fn add(&mut self, status: TestStatus) {
        match status {
            TestStatus::Passed => self.passed += 1,
            TestStatus::Failed => self.failed += 1,
            TestStatus::Broken => self.broken += 1,
            TestStatus::Skipped => self.skipped += 1,
        }
    }

    /// Adds another set of totals.
    pub fn merge(&mut self, other: &Self) {
        self.passed += other.passed;
        self.failed += other.failed;
        self.broken += other.broken;
        self.skipped += other.skipped;
    }

    /// All tests counted.
    #[must_use]
    pub fn total(&self) -> usize {
        self.passed + self.failed + self.broken + self.skipped
    }

    /// Totals over a set of results.
    #[must_use]
    pub fn of(results: &[TestResult]) -> Self {
        let mut totals = Self::default();
        for r in results {
            totals.add(r.status);
        }
        totals
    }
}

impl fmt::Display for TestTotals {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} tests: {} passed, {} failed, {} broken, {} skipped",
            self.total(),
            self.passed,
            self.failed,
            self.broken,
            self.skipped
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_allure_record() {
        let raw = r#"{
            "uuid": "b1",
            "name": "test_extract",
            "fullName": "tests.test_etl_allure#test_extract",
            "status": "failed",
            "statusDetails": {"message": "AssertionError: 3 != 4", "trace": "..."},
            "start": 1700000000000,
            "stop": 1700000000250,
            "labels": []
        }"#;
        let parsed: AllureResult = serde_json::from_str(raw).unwrap();
        let result = TestResult::from_allure(parsed, "b1-result.json");

        assert_eq!(result.status, TestStatus::Failed);
        assert_eq!(result.duration_ms, Some(250));
        assert!(result.started_at.as_deref().unwrap().starts_with("2023-11-14T22:13:20"));
        assert_eq!(result.message.as_deref(), Some("AssertionError: 3 != 4"));
        assert_eq!(result.full_name.as_deref(), Some("tests.test_etl_allure#test_extract"));
    }

    #[test]
    fn test_unknown_or_missing_status_is_broken() {
        assert_eq!(TestStatus::from_allure("PASSED"), TestStatus::Passed);
        assert_eq!(TestStatus::from_allure("unknown"), TestStatus::Broken);
        let result = TestResult::from_allure(AllureResult::default(), "x-result.json");
        assert_eq!(result.status, TestStatus::Broken);
        assert_eq!(result.duration_ms, None);
    }

    #[test]
    fn test_hostile_timestamps_do_not_overflow() {
        let parsed: AllureResult =
            serde_json::from_str(&format!(r#"{{"name": "t", "status": "passed", "start": -1, "stop": {}}}"#, i64::MAX))
                .unwrap();
        let result = TestResult::from_allure(parsed, "t-result.json");
        assert_eq!(result.status, TestStatus::Passed);
        assert_eq!(result.duration_ms, None);

        let backwards = AllureResult {
            start: Some(500),
            stop: Some(100),
            ..AllureResult::default()
        };
        assert_eq!(TestResult::from_allure(backwards, "b-result.json").duration_ms, None);
    }

    #[test]
    fn test_totals() {
        let mut totals = TestTotals::default();
        totals.add(TestStatus::Passed);
        totals.add(TestStatus::Passed);
        totals.add(TestStatus::Skipped);
        let mut all = TestTotals { broken: 1, ..TestTotals::default() };
        all.merge(&totals);
        assert_eq!(all.total(), 4);
        assert_eq!(all.to_string(), "4 tests: 2 passed, 0 failed, 1 broken, 1 skipped");
    }
}
