//! Error types for the execution engine.
//!
//! Step-level failures never surface here: they are absorbed into a
//! `StepResult`. What remains is split in two:
//! - `ExecutionError`: why a run ended unsuccessfully (rendered into `TaskResult.error`)
//! - `EngineError`: misuse of the public API or storage failures on explicit calls

use thiserror::Error;

/// Reason a task run terminated without success.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExecutionError {
    #[error("Task cancelled")]
    Cancelled,

    #[error("Critical step '{step_id}' failed: {reason}")]
    CriticalStepFailed { step_id: String, reason: String },

    #[error("Step '{step_id}' rejected by human reviewer")]
    ConfidenceRejected { step_id: String },

    #[error("Human response for step '{step_id}' timed out")]
    HumanTimeout { step_id: String },

    #[error("Budget exceeded: used ${used:.4} of ${limit:.4}")]
    BudgetExceeded { used: f64, limit: f64 },
}

/// Errors raised by checkpoint stores.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Checkpoint I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Checkpoint serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Checkpoint database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Checkpoint task join error: {0}")]
    Join(String),
}

/// Errors raised while waiting on a human response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HumanInputError {
    #[error("Human prompt {0} timed out")]
    Timeout(String),

    #[error("Human prompt {0} was dropped before a response arrived")]
    Dropped(String),

    #[error("Human prompt {0} already pending")]
    DuplicatePrompt(String),

    #[error("Human prompt {0} abandoned because the task was cancelled")]
    Cancelled(String),
}

/// Errors returned by the public engine API.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid task definition: {0}")]
    InvalidDefinition(String),

    #[error("Task execution {0} has already been started")]
    AlreadyStarted(String),

    #[error("Task {0} is already running")]
    TaskAlreadyRunning(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Checkpoint not found: {0}")]
    CheckpointNotFound(String),

    #[error("Checkpoint {checkpoint_id} does not match the registered definition of task {task_id}")]
    DefinitionMismatch {
        task_id: String,
        checkpoint_id: String,
    },

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    HumanInput(#[from] HumanInputError),
}
