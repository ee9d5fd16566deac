use thiserror::Error;

/// Errors that can occur within the task-queue subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A task payload or result could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No live task row with the given ID exists in the store.
    #[error("Task not found: {id}")]
    TaskNotFound { id: i64 },
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
