use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::classifier::ErrorCategory;
use super::error::{Result, SyncError};
use super::operation::{AttemptRecord, SyncOperation};
use super::scheduler::DeadReason;
use crate::storage::record::{self, Versioned};
use crate::storage::{Keyspace, KvStore};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalError {
    pub category: Option<ErrorCategory>,
    pub message: String,
    pub reason: DeadReason,
}

/// An operation that left the automatic retry path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub operation: SyncOperation,
    pub final_error: FinalError,
    pub attempt_history: Vec<AttemptRecord>,
    pub dead_at: u64,
    /// Id of the queued operation currently re-driving this entry.
    #[serde(default)]
    pub retrying: Option<String>,
}

impl Versioned for DeadLetter {
    const KIND: &'static str = "dead_letter";
    const SCHEMA: u16 = 1;
}

impl DeadLetter {
    /// The key this entry is stored under: the id of the operation that
    /// first died. Re-driven operations point back at it through `origin`.
    pub fn id(&self) -> &str {
        self.operation.origin.as_deref().unwrap_or(&self.operation.id)
    }
}

/// Durable dead-letter entries keyed by original operation id.
pub struct DeadLetterStore {
    store: Arc<dyn KvStore>,
    entries: HashMap<String, DeadLetter>,
}

impl DeadLetterStore {
    pub fn open(store: Arc<dyn KvStore>) -> Result<Self> {
        let mut entries = HashMap::new();
        for (key, value) in store.scan(Keyspace::DeadLetters)? {
            let letter: DeadLetter = record::decode(Keyspace::DeadLetters, &key, &value)?;
            entries.insert(key, letter);
        }
        if !entries.is_empty() {
            log::info!("Loaded {} dead letters", entries.len());
        }
        Ok(Self { store, entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&DeadLetter> {
        self.entries.get(id)
    }

    /// All entries, oldest death first.
    pub fn list(&self) -> Vec<DeadLetter> {
        let mut items: Vec<DeadLetter> = self.entries.values().cloned().collect();
        items.sort_by(|a, b| a.dead_at.cmp(&b.dead_at).then_with(|| a.id().cmp(b.id())));
        items
    }

    /// Insert or replace the entry for `op`. A re-driven operation that dies
    /// again replaces its origin entry, carrying the full history forward.
    pub fn add(&mut self, op: SyncOperation, final_error: FinalError, dead_at: u64) -> Result<DeadLetter> {
        let letter = DeadLetter {
            attempt_history: op.history.clone(),
            operation: op,
            final_error,
            dead_at,
            retrying: None,
        };
        let key = letter.id().to_string();
        self.store
            .put(Keyspace::DeadLetters, &key, record::encode(&letter)?)?;
        self.entries.insert(key, letter.clone());
        Ok(letter)
    }

    /// Flag an entry as being re-driven by queued operation `op_id`.
    pub fn mark_retrying(&mut self, id: &str, op_id: &str) -> Result<()> {
        let mut letter = self
            .entries
            .get(id)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(format!("dead letter {id}")))?;
        letter.retrying = Some(op_id.to_string());
        self.store
            .put(Keyspace::DeadLetters, id, record::encode(&letter)?)?;
        self.entries.insert(id.to_string(), letter);
        Ok(())
    }

    pub fn remove(&mut self, id: &str) -> Result<Option<DeadLetter>> {
        if !self.entries.contains_key(id) {
            return Ok(None);
        }
        self.store.delete(Keyspace::DeadLetters, id)?;
        Ok(self.entries.remove(id))
    }

    /// Remove every entry. Returns how many were dropped.
    pub fn clear(&mut self) -> Result<usize> {
        let count = self.entries.len();
        self.store.clear(Keyspace::DeadLetters)?;
        self.entries.clear();
        Ok(count)
    }
}
