//! Error types for the Crucible scheduler.
//!
//! Scheduling refusals are not errors: an item that cannot run right
//! now carries a `CauseOfBlockage` and is re-evaluated on the next
//! maintenance pass. This enum covers genuine failures only.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Task errors
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Failed to create executable for {task}: {message}")]
    ExecutableCreation { task: String, message: String },

    // Label errors
    #[error("Invalid label expression: {0}")]
    LabelParse(String),

    // Node errors
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    // Queue errors
    #[error("Queue is shut down")]
    QueueShutDown,

    #[error("Item not found: {0}")]
    ItemNotFound(String),

    // Permission backend
    #[error("Permission check failed: {0}")]
    Permission(String),

    // Generic
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
