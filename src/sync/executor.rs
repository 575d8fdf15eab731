use std::fmt;

use async_trait::async_trait;

use super::operation::SyncOperation;

/// Failure reported by a remote executor, before classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawError {
    /// The remote answered with an HTTP-style status code.
    Http { status: u16, message: String },
    /// The request never reached the remote (refused, DNS, offline).
    Network(String),
    /// No answer within the request timeout.
    Timeout,
    Other(String),
}

impl RawError {
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        RawError::Http {
            status,
            message: message.into(),
        }
    }
}

impl fmt::Display for RawError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawError::Http { status, message } => write!(f, "HTTP {status}: {message}"),
            RawError::Network(e) => write!(f, "Network error: {e}"),
            RawError::Timeout => write!(f, "Request timed out"),
            RawError::Other(e) => write!(f, "{e}"),
        }
    }
}

/// Pushes one operation to the remote store.
///
/// Implementations must be idempotent per operation id: an operation that
/// was in flight during a crash is dispatched again after restart.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn execute(&self, op: &SyncOperation) -> Result<(), RawError>;
}
