//! Unified error types for Parley

use thiserror::Error;

use crate::types::TaskId;

/// Unified error type for all Parley operations
#[derive(Error, Debug)]
pub enum ParleyError {
    // Channel errors
    #[error("Transient channel error: {0}")]
    TransientChannel(String),

    #[error("Channel error: {0}")]
    Channel(String),

    // Protocol errors
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    // Routing outcomes that are not decisions
    #[error("Task {0} was cancelled before a decision was committed")]
    Cancelled(TaskId),

    #[error("Assignment status unknown for task {task_id}: {reason}")]
    CommitFailure { task_id: TaskId, reason: String },

    #[error("A different decision was already committed for task {0}")]
    AlreadyCommitted(TaskId),

    #[error("Task already in flight: {0}")]
    DuplicateTask(TaskId),

    #[error("Task id {0:?} must be a single whitespace-free token")]
    InvalidTaskId(String),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    Config(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ParleyError {
    /// Whether retrying the same operation may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientChannel(_))
    }
}

/// Result type alias using ParleyError
pub type Result<T> = std::result::Result<T, ParleyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ParleyError::TransientChannel("ratelimited".into()).is_transient());
        assert!(!ParleyError::Channel("channel_not_found".into()).is_transient());
        assert!(!ParleyError::Cancelled(TaskId::new("t-1")).is_transient());
    }

    #[test]
    fn test_commit_failure_message() {
        let err = ParleyError::CommitFailure {
            task_id: TaskId::new("t-abc"),
            reason: "timeout".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Assignment status unknown for task t-abc: timeout"
        );
    }

    #[test]
    fn test_invalid_task_id_message() {
        let err = ParleyError::InvalidTaskId("a b".to_string());
        assert_eq!(
            err.to_string(),
            "Task id \"a b\" must be a single whitespace-free token"
        );
        assert!(!err.is_transient());
    }
}
