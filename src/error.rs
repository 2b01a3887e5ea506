use thiserror::Error;

/// Engine error kinds. Nested-flow errors (`FlowNotFound`,
/// `CyclicFlowReference`) are recorded as failed synthetic steps by the
/// composer and never propagate out of a run.
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("failed to load flow document: {0}")]
    Load(String),

    #[error("referenced flow not found: {0}")]
    FlowNotFound(String),

    #[error("cyclic flow reference: {0}")]
    CyclicFlowReference(String),

    #[error("verification failed: {0}")]
    Verification(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out after {0}ms")]
    Timeout(u64),

    #[error("run cancelled")]
    Cancelled,

    #[error("could not resolve event path: {0}")]
    PathResolution(String),
}

impl FlowError {
    /// Whether this error should map a step to `Cancelled` rather than
    /// `Failed`.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, FlowError::Cancelled)
    }
}
