//! Offline-capable synchronization engine.
//!
//! Local mutations are appended to a durable queue and pushed to a remote
//! store by a bounded worker pool. Failures are classified, retried with
//! jittered exponential backoff under a global retry budget, gated by a
//! circuit breaker, and finally isolated as dead letters.

pub mod common;
pub mod config;
pub mod network;
pub mod storage;
pub mod sync;

pub use config::Config;
pub use sync::{
    ErrorCategory, HealthReport, NewOperation, OperationStatus, OperationType, RawError,
    RemoteExecutor, SyncEngine, SyncError, SyncOperation,
};
