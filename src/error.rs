//! Error types for the orchestrator.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors surfaced by the task queue API.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue unavailable: {0}")]
    Unavailable(#[from] DatabaseError),

    #[error("Invalid task: {0}")]
    Validation(String),

    #[error("Task {id} not found")]
    NotFound { id: Uuid },
}

/// Failure raised while processing a task.
///
/// The variant decides how the failure is classified by
/// [`crate::resilience::TaskErrorHandler`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TaskError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Lease expired before the task was acknowledged")]
    LeaseExpired,

    #[error("Capacity exceeded: {0}")]
    Capacity(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("No handler registered for task type '{0}'")]
    UnsupportedType(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Handler failed: {0}")]
    Handler(String),
}

/// Errors raised while executing a single workflow step.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StepError {
    #[error("Step {step_id} timed out after {timeout:?}")]
    Timeout { step_id: String, timeout: Duration },

    #[error("Unknown step type '{step_type}'")]
    UnknownType { step_type: String },

    #[error("Invalid config for step {step_id}: {reason}")]
    InvalidConfig { step_id: String, reason: String },

    #[error("Expression evaluation failed: {0}")]
    Evaluation(String),

    /// Retryable failure reported by a step handler.
    #[error("Step {step_id} failed: {reason}")]
    Failed { step_id: String, reason: String },

    /// Non-retryable failure reported by a step handler.
    #[error("Step {step_id} rejected: {reason}")]
    Rejected { step_id: String, reason: String },
}

impl From<StepError> for TaskError {
    fn from(err: StepError) -> Self {
        match err {
            StepError::Timeout { timeout, .. } => TaskError::Timeout(timeout),
            StepError::Failed { .. } => TaskError::Handler(err.to_string()),
            StepError::UnknownType { .. }
            | StepError::InvalidConfig { .. }
            | StepError::Evaluation(_)
            | StepError::Rejected { .. } => TaskError::Validation(err.to_string()),
        }
    }
}

/// Workflow engine errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("Workflow definition {id} not found")]
    DefinitionNotFound { id: String },

    #[error("Execution {id} not found")]
    ExecutionNotFound { id: Uuid },

    #[error("Invalid workflow definition: {0}")]
    InvalidDefinition(String),

    #[error("Workflow definition {id} is {status}, cannot start")]
    NotStartable { id: String, status: String },

    #[error("Execution {id} is {state}, cannot transition to {target}")]
    InvalidTransition {
        id: Uuid,
        state: String,
        target: String,
    },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Result type alias for the orchestrator.
pub type Result<T> = std::result::Result<T, Error>;
