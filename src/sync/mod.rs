//! The sync core: an ordered, durable operation queue drained by a
//! dispatcher that classifies failures, schedules retries under a global
//! budget, trips a circuit breaker and isolates dead letters.

mod budget;
mod circuit_breaker;
mod classifier;
mod dead_letter;
mod dispatcher;
mod engine;
mod error;
mod executor;
mod health;
mod metrics;
mod operation;
mod queue;
mod scheduler;

pub use budget::{BudgetSnapshot, RetryBudget};
pub use circuit_breaker::{
    Admission, BreakerTransition, CircuitBreaker, CircuitBreakerState, CircuitState,
};
pub use classifier::{classify, ErrorCategory};
pub use dead_letter::{DeadLetter, DeadLetterStore, FinalError};
pub use engine::{SyncEngine, SyncEngineBuilder};
pub use error::{Result, SyncError};
pub use executor::{RawError, RemoteExecutor};
pub use health::{CircuitBreakerHealth, DeadLetterHealth, HealthReport};
pub use metrics::{
    ErrorRecoveryMetrics, LogObserver, MetricsAggregator, SyncEvent, SyncObserver, SyncStatus,
};
pub use operation::{AttemptRecord, NewOperation, OperationStatus, OperationType, SyncOperation};
pub use queue::{OperationQueue, QueueStats};
pub use scheduler::{DeadReason, RetryDecision, RetryScheduler};
