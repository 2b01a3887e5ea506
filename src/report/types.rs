use crate::runner::state::{RunStatus, TestResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub total_files: u32,
    pub total_steps: u32,
    pub passed: u32,
    pub failed: u32,
    pub total_duration_ms: u64,
}

/// Report envelope for one run or one folder batch
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResults {
    pub results: Vec<TestResult>,
    pub summary: RunSummary,
    pub generated_at: String,
}

impl TestResults {
    pub fn from_results(results: Vec<TestResult>) -> Self {
        let summary = RunSummary {
            total_files: results.len() as u32,
            total_steps: results.iter().map(|r| r.steps.len() as u32).sum(),
            passed: results.iter().map(|r| r.passed).sum(),
            failed: results.iter().map(|r| r.failed).sum(),
            total_duration_ms: results.iter().map(|r| r.total_duration_ms).sum(),
        };
        Self {
            results,
            summary,
            generated_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn all_passed(&self) -> bool {
        self.results
            .iter()
            .all(|r| r.status == RunStatus::Passed)
    }
}
