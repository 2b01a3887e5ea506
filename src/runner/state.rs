use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Step execution status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Passed,
    Failed,
    Skipped,
    Cancelled,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StepStatus::Pending | StepStatus::Running)
    }
}

/// Status of one run of one file
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Passed,
    Failed,
    Cancelled,
}

/// Captured request, as actually issued
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RequestSnapshot {
    pub url: String,
    pub method: String,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
}

/// Captured response, after decoding
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResponseSnapshot {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
}

/// Result of a single step execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub name: String,
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub request: Option<RequestSnapshot>,
    pub response: Option<ResponseSnapshot>,
    pub error: Option<String>,
    /// Nesting level relative to the run's root file, for display indentation
    pub depth: usize,
    /// Physical file this result belongs to
    pub file_id: String,
    /// Index within that file's flattened step space
    pub local_index: usize,
    #[serde(default)]
    pub logs: Vec<String>,
}

impl StepResult {
    pub fn new(name: &str, depth: usize, file_id: &str, local_index: usize) -> Self {
        Self {
            name: name.to_string(),
            status: StepStatus::Pending,
            started_at: None,
            finished_at: None,
            duration_ms: None,
            request: None,
            response: None,
            error: None,
            depth,
            file_id: file_id.to_string(),
            local_index,
            logs: Vec::new(),
        }
    }

    pub fn start(&mut self) {
        self.status = StepStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn pass(&mut self) {
        self.finish(StepStatus::Passed);
    }

    pub fn fail(&mut self, error: String) {
        self.error = Some(error);
        self.finish(StepStatus::Failed);
    }

    pub fn cancel(&mut self) {
        self.finish(StepStatus::Cancelled);
    }

    fn finish(&mut self, status: StepStatus) {
        self.status = status;
        let now = Utc::now();
        if let Some(started) = self.started_at {
            self.duration_ms = Some((now - started).num_milliseconds().max(0) as u64);
        }
        self.finished_at = Some(now);
    }

    /// Synthetic marker for a nested-flow group boundary
    pub fn flow_marker(name: String, depth: usize, file_id: &str, local_index: usize) -> Self {
        let mut result = Self::new(&name, depth, file_id, local_index);
        let now = Utc::now();
        result.status = StepStatus::Passed;
        result.started_at = Some(now);
        result.finished_at = Some(now);
        result.duration_ms = Some(0);
        result
    }

    /// Synthetic failed result for a nested flow that could not run
    pub fn flow_error(
        name: String,
        error: String,
        depth: usize,
        file_id: &str,
        local_index: usize,
    ) -> Self {
        let mut result = Self::new(&name, depth, file_id, local_index);
        result.start();
        result.fail(error);
        result
    }
}

/// Aggregated pass/fail counters for one flow invocation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunTotals {
    pub passed: u32,
    pub failed: u32,
}

impl RunTotals {
    pub fn absorb(&mut self, other: RunTotals) {
        self.passed += other.passed;
        self.failed += other.failed;
    }
}

/// Result of one run of one file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    pub id: String,
    pub file_id: String,
    pub file_name: String,
    pub status: RunStatus,
    pub timestamp: DateTime<Utc>,
    pub total_duration_ms: u64,
    pub passed: u32,
    pub failed: u32,
    pub steps: Vec<StepResult>,
    /// Set when the run is part of a folder-level batch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder_name: Option<String>,
}

impl TestResult {
    pub fn new(file_id: &str, file_name: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            file_id: file_id.to_string(),
            file_name: file_name.to_string(),
            status: RunStatus::Running,
            timestamp: Utc::now(),
            total_duration_ms: 0,
            passed: 0,
            failed: 0,
            steps: Vec::new(),
            batch_id: None,
            folder_name: None,
        }
    }

    /// Fold one step into the ordered list and the counters
    pub fn record_step(&mut self, step: StepResult) {
        match step.status {
            StepStatus::Passed => self.passed += 1,
            StepStatus::Failed => self.failed += 1,
            _ => {}
        }
        self.steps.push(step);
    }

    /// Close the record: failed if any step failed, cancelled wins over both
    pub fn finalize(&mut self, cancelled: bool) {
        self.total_duration_ms = (Utc::now() - self.timestamp).num_milliseconds().max(0) as u64;
        self.status = if cancelled {
            RunStatus::Cancelled
        } else if self.failed > 0 {
            RunStatus::Failed
        } else {
            RunStatus::Passed
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_lifecycle() {
        let mut step = StepResult::new("a", 0, "f", 0);
        assert_eq!(step.status, StepStatus::Pending);
        step.start();
        assert_eq!(step.status, StepStatus::Running);
        step.pass();
        assert_eq!(step.status, StepStatus::Passed);
        assert!(step.duration_ms.is_some());
        assert!(step.status.is_terminal());
    }

    #[test]
    fn test_result_aggregation() {
        let mut result = TestResult::new("file-1", "login.yaml");

        let mut ok = StepResult::new("ok", 0, "file-1", 0);
        ok.start();
        ok.pass();
        result.record_step(ok);

        let mut bad = StepResult::new("bad", 0, "file-1", 1);
        bad.start();
        bad.fail("boom".to_string());
        result.record_step(bad);

        result.finalize(false);
        assert_eq!(result.passed, 1);
        assert_eq!(result.failed, 1);
        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.steps.len(), 2);
    }

    #[test]
    fn test_cancelled_wins() {
        let mut result = TestResult::new("file-1", "a.yaml");
        result.finalize(true);
        assert_eq!(result.status, RunStatus::Cancelled);
    }
}
