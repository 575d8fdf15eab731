use std::fmt;

use serde::{Deserialize, Serialize};

use super::classifier::ErrorCategory;
use super::error::{Result, SyncError};
use crate::storage::record::Versioned;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Create,
    Update,
    Delete,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Create => "create",
            OperationType::Update => "update",
            OperationType::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Syncing,
    Success,
    /// Last attempt failed; a retry timer is armed.
    Failed,
    Dead,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationStatus::Success | OperationStatus::Dead)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Syncing => "syncing",
            OperationStatus::Success => "success",
            OperationStatus::Failed => "failed",
            OperationStatus::Dead => "dead",
        }
    }
}

/// One failed dispatch attempt. Never modified after it is written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptRecord {
    pub attempt: u32,
    pub timestamp: u64,
    pub category: ErrorCategory,
    pub error: String,
    /// Backoff (ms) waited before this attempt; 0 for a first attempt.
    pub delay: u64,
}

/// A local mutation waiting to be propagated to the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOperation {
    pub id: String,
    /// Creation sequence; orders operations across restarts.
    pub seq: u64,
    pub table: String,
    pub record_id: String,
    #[serde(rename = "type")]
    pub op_type: OperationType,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub created_at: u64,
    pub attempt: u32,
    pub status: OperationStatus,
    #[serde(default)]
    pub history: Vec<AttemptRecord>,
    #[serde(default)]
    pub next_attempt_at: Option<u64>,
    #[serde(default)]
    pub pending_delay: u64,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub updated_at: u64,
    /// Dead-letter id this operation was re-driven from, if any.
    #[serde(default)]
    pub origin: Option<String>,
}

impl Versioned for SyncOperation {
    const KIND: &'static str = "sync_operation";
    const SCHEMA: u16 = 1;
}

impl SyncOperation {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Input to `enqueue`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOperation {
    #[serde(default)]
    pub table: String,
    #[serde(default)]
    pub record_id: String,
    #[serde(rename = "type", default)]
    pub op_type: Option<OperationType>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl NewOperation {
    pub fn new(table: impl Into<String>, record_id: impl Into<String>, op_type: OperationType) -> Self {
        Self {
            table: table.into(),
            record_id: record_id.into(),
            op_type: Some(op_type),
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Checks required fields and returns the operation type.
    pub fn validate(&self) -> Result<OperationType> {
        if self.table.trim().is_empty() {
            return Err(SyncError::Validation("table is required".to_string()));
        }
        if self.record_id.trim().is_empty() {
            return Err(SyncError::Validation("recordId is required".to_string()));
        }
        self.op_type
            .ok_or_else(|| SyncError::Validation("type is required".to_string()))
    }
}
