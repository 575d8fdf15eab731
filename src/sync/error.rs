use thiserror::Error;

use crate::storage::StorageError;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Queue full: {capacity} operations already waiting")]
    QueueFull { capacity: usize },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Sync engine is shutting down")]
    ShuttingDown,
}

pub type Result<T> = std::result::Result<T, SyncError>;
