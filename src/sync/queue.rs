use std::collections::{BTreeMap, HashMap, HashSet};
use std::convert::TryInto;
use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use super::classifier::ErrorCategory;
use super::error::{Result, SyncError};
use super::operation::{AttemptRecord, NewOperation, OperationStatus, SyncOperation};
use crate::storage::{record, Keyspace, KvStore, StorageError};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub total: usize,
    pub pending: usize,
    pub syncing: usize,
    pub success: usize,
    pub failed: usize,
    pub oldest_pending_at: Option<u64>,
}

/// Durable, creation-ordered store of sync operations.
///
/// Operations are persisted under their id. A monotonically increasing
/// sequence number (persisted in the meta keyspace, so it never resets
/// even when the queue drains) fixes their relative order across restarts.
pub struct OperationQueue {
    store: Arc<dyn KvStore>,
    ops: BTreeMap<u64, SyncOperation>,
    index: HashMap<String, u64>,
    next_seq: u64,
    capacity: usize,
}

impl OperationQueue {
    const META_NEXT_SEQ_KEY: &'static str = "next_seq";

    /// Load the queue from `store`. Operations left `syncing` by a crash
    /// are put back to `pending`.
    pub fn open(store: Arc<dyn KvStore>, capacity: usize) -> Result<Self> {
        let mut next_seq: u64 = 0;
        if let Some(bytes) = store.get(Keyspace::Meta, Self::META_NEXT_SEQ_KEY)? {
            if let Ok(arr) = bytes.as_slice().try_into() as std::result::Result<[u8; 8], _> {
                next_seq = u64::from_be_bytes(arr);
            }
        }

        let mut ops = BTreeMap::new();
        let mut index = HashMap::new();
        for (key, value) in store.scan(Keyspace::Operations)? {
            let op: SyncOperation = record::decode(Keyspace::Operations, &key, &value)?;
            next_seq = next_seq.max(op.seq);
            index.insert(op.id.clone(), op.seq);
            ops.insert(op.seq, op);
        }

        let mut queue = Self {
            store,
            ops,
            index,
            next_seq,
            capacity,
        };

        let recovered = queue.revert_in_flight()?;
        if !recovered.is_empty() {
            log::info!(
                "Recovered {} operations interrupted mid-dispatch; re-queued as pending",
                recovered.len()
            );
        }
        log::debug!("Operation queue loaded with {} entries", queue.ops.len());

        Ok(queue)
    }

    fn persist(&self, op: &SyncOperation) -> std::result::Result<(), StorageError> {
        let bytes = record::encode(op)?;
        self.store.put(Keyspace::Operations, &op.id, bytes)
    }

    fn get_mut_checked(&mut self, id: &str) -> Result<&mut SyncOperation> {
        let seq = *self
            .index
            .get(id)
            .ok_or_else(|| SyncError::NotFound(format!("operation {id}")))?;
        self.ops
            .get_mut(&seq)
            .ok_or_else(|| SyncError::NotFound(format!("operation {id}")))
    }

    /// Persist `updated` and then swap it into memory, so a failed write
    /// leaves the in-memory view untouched.
    fn commit(&mut self, updated: SyncOperation) -> Result<SyncOperation> {
        self.persist(&updated)?;
        let slot = self.get_mut_checked(&updated.id)?;
        *slot = updated.clone();
        Ok(updated)
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Operations that have not reached a terminal state.
    pub fn active_len(&self) -> usize {
        self.ops.values().filter(|op| !op.is_terminal()).count()
    }

    pub fn get(&self, id: &str) -> Option<&SyncOperation> {
        self.index.get(id).and_then(|seq| self.ops.get(seq))
    }

    pub fn list(&self) -> Vec<SyncOperation> {
        self.ops.values().cloned().collect()
    }

    pub fn enqueue(&mut self, new: NewOperation, now_ms: u64) -> Result<SyncOperation> {
        self.enqueue_with(new, None, Vec::new(), now_ms)
    }

    /// Enqueue carrying an origin dead-letter id and its attempt history.
    pub fn enqueue_with(
        &mut self,
        new: NewOperation,
        origin: Option<String>,
        history: Vec<AttemptRecord>,
        now_ms: u64,
    ) -> Result<SyncOperation> {
        let op_type = new.validate()?;

        if self.active_len() >= self.capacity {
            return Err(SyncError::QueueFull {
                capacity: self.capacity,
            });
        }

        let seq = self.next_seq + 1;
        let op = SyncOperation {
            id: Uuid::new_v4().to_string(),
            seq,
            table: new.table,
            record_id: new.record_id,
            op_type,
            payload: new.payload,
            created_at: now_ms,
            attempt: 0,
            status: OperationStatus::Pending,
            history,
            next_attempt_at: None,
            pending_delay: 0,
            last_error: None,
            updated_at: now_ms,
            origin,
        };

        self.persist(&op)?;
        self.store
            .put(Keyspace::Meta, Self::META_NEXT_SEQ_KEY, seq.to_be_bytes().to_vec())?;
        self.next_seq = seq;

        self.index.insert(op.id.clone(), seq);
        self.ops.insert(seq, op.clone());
        Ok(op)
    }

    /// Oldest dispatchable operation. Only the oldest non-terminal operation
    /// of each record is a candidate, and only once it is `pending` and due;
    /// anything `syncing` or awaiting a retry holds back its whole record.
    pub fn dequeue_next(&self, now_ms: u64) -> Option<SyncOperation> {
        let mut blocked: HashSet<&str> = HashSet::new();
        for op in self.ops.values() {
            if op.is_terminal() {
                continue;
            }
            if !blocked.insert(op.record_id.as_str()) {
                continue;
            }
            let due = op.next_attempt_at.map_or(true, |at| at <= now_ms);
            if op.status == OperationStatus::Pending && due {
                return Some(op.clone());
            }
        }
        None
    }

    pub fn mark_syncing(&mut self, id: &str, now_ms: u64) -> Result<SyncOperation> {
        let mut op = self.get_mut_checked(id)?.clone();
        if op.status != OperationStatus::Pending {
            return Err(SyncError::Validation(format!(
                "operation {id} is {}, not pending",
                op.status.as_str()
            )));
        }
        op.status = OperationStatus::Syncing;
        op.attempt += 1;
        op.next_attempt_at = None;
        op.updated_at = now_ms;
        self.commit(op)
    }

    pub fn mark_success(&mut self, id: &str, now_ms: u64) -> Result<SyncOperation> {
        let mut op = self.get_mut_checked(id)?.clone();
        op.status = OperationStatus::Success;
        op.last_error = None;
        op.pending_delay = 0;
        op.updated_at = now_ms;
        self.commit(op)
    }

    /// Record a failed attempt. The operation stays non-terminal until the
    /// scheduler either arms a retry or dead-letters it.
    pub fn mark_failed(
        &mut self,
        id: &str,
        category: ErrorCategory,
        error: String,
        now_ms: u64,
    ) -> Result<SyncOperation> {
        let mut op = self.get_mut_checked(id)?.clone();
        op.history.push(AttemptRecord {
            attempt: op.attempt,
            timestamp: now_ms,
            category,
            error: error.clone(),
            delay: op.pending_delay,
        });
        op.status = OperationStatus::Failed;
        op.last_error = Some(error);
        op.updated_at = now_ms;
        self.commit(op)
    }

    pub fn schedule_retry(&mut self, id: &str, delay_ms: u64, now_ms: u64) -> Result<SyncOperation> {
        let mut op = self.get_mut_checked(id)?.clone();
        op.next_attempt_at = Some(now_ms + delay_ms);
        op.pending_delay = delay_ms;
        op.updated_at = now_ms;
        self.commit(op)
    }

    /// Move a `failed` operation back to `pending`, due immediately.
    /// Returns false if the operation is gone or not waiting on a retry.
    pub fn make_ready(&mut self, id: &str, now_ms: u64) -> Result<bool> {
        let mut op = match self.get(id) {
            Some(op) if op.status == OperationStatus::Failed => op.clone(),
            _ => return Ok(false),
        };
        op.status = OperationStatus::Pending;
        op.next_attempt_at = None;
        op.updated_at = now_ms;
        self.commit(op)?;
        Ok(true)
    }

    /// Take an operation out of the active queue as `dead`.
    pub fn remove_dead(&mut self, id: &str, now_ms: u64) -> Result<SyncOperation> {
        let mut op = self.get_mut_checked(id)?.clone();
        self.store.delete(Keyspace::Operations, id)?;
        self.index.remove(id);
        self.ops.remove(&op.seq);
        op.status = OperationStatus::Dead;
        op.next_attempt_at = None;
        op.updated_at = now_ms;
        Ok(op)
    }

    /// Put every `syncing` operation back to `pending`. The interrupted
    /// attempt is not counted since no outcome was recorded for it.
    pub fn revert_in_flight(&mut self) -> Result<Vec<String>> {
        let in_flight: Vec<SyncOperation> = self
            .ops
            .values()
            .filter(|op| op.status == OperationStatus::Syncing)
            .cloned()
            .collect();

        let mut ids = Vec::with_capacity(in_flight.len());
        for mut op in in_flight {
            op.status = OperationStatus::Pending;
            op.attempt = op.attempt.saturating_sub(1);
            ids.push(op.id.clone());
            self.commit(op)?;
        }
        Ok(ids)
    }

    /// `(id, due_at)` for every operation waiting on a retry timer.
    pub fn awaiting_retry(&self) -> Vec<(String, u64)> {
        self.ops
            .values()
            .filter(|op| op.status == OperationStatus::Failed)
            .map(|op| (op.id.clone(), op.next_attempt_at.unwrap_or(0)))
            .collect()
    }

    pub fn stats(&self) -> QueueStats {
        let mut stats = QueueStats {
            total: self.ops.len(),
            ..Default::default()
        };
        for op in self.ops.values() {
            match op.status {
                OperationStatus::Pending => {
                    stats.pending += 1;
                    stats.oldest_pending_at = Some(
                        stats
                            .oldest_pending_at
                            .map_or(op.created_at, |at| at.min(op.created_at)),
                    );
                }
                OperationStatus::Syncing => stats.syncing += 1,
                OperationStatus::Success => stats.success += 1,
                OperationStatus::Failed => stats.failed += 1,
                OperationStatus::Dead => {}
            }
        }
        stats
    }

    /// Delete operations whose record no longer exists locally. In-flight
    /// operations are left alone. Returns the removed operations.
    pub fn remove_orphaned(&mut self, valid_record_ids: &HashSet<String>) -> Result<Vec<SyncOperation>> {
        let orphaned: Vec<SyncOperation> = self
            .ops
            .values()
            .filter(|op| {
                op.status != OperationStatus::Syncing && !valid_record_ids.contains(&op.record_id)
            })
            .cloned()
            .collect();

        for op in &orphaned {
            self.store.delete(Keyspace::Operations, &op.id)?;
            self.index.remove(&op.id);
            self.ops.remove(&op.seq);
        }
        Ok(orphaned)
    }

    /// Drop `success` rows. Returns how many were removed.
    pub fn purge_completed(&mut self) -> Result<usize> {
        self.purge_completed_before(u64::MAX)
    }

    /// Drop `success` rows that finished at or before `cutoff_ms`.
    pub fn purge_completed_before(&mut self, cutoff_ms: u64) -> Result<usize> {
        let done: Vec<(u64, String)> = self
            .ops
            .values()
            .filter(|op| op.status == OperationStatus::Success && op.updated_at <= cutoff_ms)
            .map(|op| (op.seq, op.id.clone()))
            .collect();

        for (seq, id) in &done {
            self.store.delete(Keyspace::Operations, id)?;
            self.index.remove(id);
            self.ops.remove(seq);
        }
        Ok(done.len())
    }
}
