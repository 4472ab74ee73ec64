//! Test report aggregation and publishing.
//!
//! Test stages write Allure-style `*-result.json` files into their results
//! directory. After the run the aggregator merges them by stage name into a
//! [`ConsolidatedReport`], which a [`ReportPublisher`] writes out. Publishing
//! is best-effort and never changes a run's outcome.

mod aggregator;
mod publisher;
mod result;

pub use aggregator::{
    read_results_dir, ConsolidatedReport, ReportAggregator, StageOutput, StageResults, StageSummary,
    RESULT_FILE_SUFFIX,
};
pub use publisher::{DirectoryPublisher, ReportPublisher, REPORT_FILE_NAME, SUMMARY_FILE_NAME};
pub use result::{AllureResult, StatusDetails, TestResult, TestStatus, TestTotals};
