//! Error taxonomy for flowgate stages.

use thiserror::Error;

/// Opaque cause reported by a task unit.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type FlowgateResult<T> = Result<T, FlowgateError>;

#[derive(Debug, Error)]
pub enum FlowgateError {
    /// Invalid stage or gate configuration. Raised at construction time.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A task unit failed. Aborts the stage that ran it.
    #[error("task '{task}' failed on item #{index}: {source}")]
    Task {
        index: u64,
        task: String,
        #[source]
        source: BoxError,
    },

    /// A completion event arrived after the stage had terminated.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl FlowgateError {
    pub fn task(index: u64, task: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Task {
            index,
            task: task.into(),
            source: source.into(),
        }
    }

    pub fn is_task(&self) -> bool {
        matches!(self, Self::Task { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_task_error_keeps_cause() {
        let err = FlowgateError::task(3, "double", "boom");

        assert!(err.is_task());
        assert_eq!(err.to_string(), "task 'double' failed on item #3: boom");
        assert_eq!(err.source().map(|s| s.to_string()), Some("boom".into()));
    }

    #[test]
    fn test_configuration_message() {
        let err = FlowgateError::Configuration("concurrency must be greater than 0".into());
        assert!(!err.is_task());
        assert!(err.to_string().contains("concurrency must be greater than 0"));
    }
}
