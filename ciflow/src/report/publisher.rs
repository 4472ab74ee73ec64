//! Report publishing.

use super::aggregator::ConsolidatedReport;
use crate::errors::PublishError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::info;

/// File name of the consolidated JSON report.
pub const REPORT_FILE_NAME: &str = "report.json";
/// File name of the plain-text summary.
pub const SUMMARY_FILE_NAME: &str = "summary.txt";

/// Writes a consolidated report somewhere.
#[async_trait]
pub trait ReportPublisher: Send + Sync {
    /// Publishes `report` to `destination` and returns the paths written.
    async fn publish(&self, report: &ConsolidatedReport, destination: &Path) -> Result<Vec<PathBuf>, PublishError>;
}

/// Writes `report.json` and `summary.txt` into a directory.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectoryPublisher;

#[async_trait]
impl ReportPublisher for DirectoryPublisher {
    async fn publish(&self, report: &ConsolidatedReport, destination: &Path) -> Result<Vec<PathBuf>, PublishError> {
        let fail = |message: String| PublishError {
            destination: destination.to_path_buf(),
            message,
        };

        tokio::fs::create_dir_all(destination)
            .await
            .map_err(|e| fail(format!("creating directory: {e}")))?;

        let json = serde_json::to_string_pretty(report).map_err(|e| fail(format!("serializing report: {e}")))?;
        let report_path = destination.join(REPORT_FILE_NAME);
        tokio::fs::write(&report_path, json)
            .await
            .map_err(|e| fail(format!("writing {REPORT_FILE_NAME}: {e}")))?;

        let summary_path = destination.join(SUMMARY_FILE_NAME);
        tokio::fs::write(&summary_path, report.summary_text())
            .await
            .map_err(|e| fail(format!("writing {SUMMARY_FILE_NAME}: {e}")))?;

        info!(destination = %destination.display(), tests = report.totals.total(), "Report published");
        Ok(vec![report_path, summary_path])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RunIdentity;
    use crate::report::{ReportAggregator, StageOutput};

    #[tokio::test]
    async fn test_directory_publisher_writes_both_files() {
        let tmp = tempfile::tempdir().unwrap();
        let identity = RunIdentity::new("3", "ciflow").unwrap();
        let report = ReportAggregator::new(&identity).collect(&[StageOutput::new("test-run-1", None)]);

        let dest = tmp.path().join("reports").join("3");
        let written = DirectoryPublisher.publish(&report, &dest).await.unwrap();

        assert_eq!(written.len(), 2);
        let back: ConsolidatedReport =
            serde_json::from_str(&std::fs::read_to_string(dest.join(REPORT_FILE_NAME)).unwrap()).unwrap();
        assert_eq!(back.run_id, "3");
        assert_eq!(back.pipeline_run_id, identity.pipeline_run_id);
        assert!(std::fs::read_to_string(dest.join(SUMMARY_FILE_NAME))
            .unwrap()
            .contains("Total: 0 tests"));
    }

    #[tokio::test]
    async fn test_unwritable_destination_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("file");
        std::fs::write(&blocker, "x").unwrap();
        let identity = RunIdentity::new("3", "ciflow").unwrap();
        let report = ReportAggregator::new(&identity).collect(&[]);

        let err = DirectoryPublisher.publish(&report, &blocker.join("sub")).await.unwrap_err();
        assert!(err.message.contains("creating directory"));
    }
}
