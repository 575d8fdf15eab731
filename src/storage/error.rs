use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Sled error: {0}")]
    SledError(String),

    #[error("Encoding error: {0}")]
    EncodingError(String),

    #[error("Corrupt record '{key}' in {keyspace}: {reason}")]
    Corrupt {
        keyspace: String,
        key: String,
        reason: String,
    },
}

impl From<sled::Error> for StorageError {
    fn from(err: sled::Error) -> Self {
        StorageError::SledError(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::EncodingError(err.to_string())
    }
}
