mod common;

use std::sync::{Arc, Weak};

use tempfile::TempDir;

use common::{start_engine_with_store, test_config, wait_until, ScriptedExecutor};
use syncline::storage::{KvStore, SledStore};
use syncline::sync::{
    DeadLetterStore, DeadReason, ErrorCategory, FinalError, NewOperation, OperationQueue,
    OperationStatus, OperationType, RawError,
};

fn open_sled(dir: &TempDir) -> (Arc<dyn KvStore>, Weak<dyn KvStore>) {
    let store: Arc<dyn KvStore> = Arc::new(SledStore::open(dir.path()).unwrap());
    let weak = Arc::downgrade(&store);
    (store, weak)
}

/// Sled holds a file lock until every handle is gone.
async fn wait_released(weak: &Weak<dyn KvStore>) {
    wait_until("sled store released", || weak.strong_count() == 0).await;
}

#[tokio::test(start_paused = true)]
async fn waiting_retry_survives_restart() {
    let dir = TempDir::new().unwrap();
    let (store, weak) = open_sled(&dir);

    let executor = Arc::new(ScriptedExecutor::new());
    executor.always_fail(RawError::Network("connection reset".into()));
    let h = start_engine_with_store(test_config(), executor, store);

    let op = h
        .engine
        .enqueue(
            NewOperation::new("notes", "note-1", OperationType::Update)
                .with_payload(serde_json::json!({ "body": "draft" })),
        )
        .unwrap();
    wait_until("first failure", || h.engine.get_stats().failed == 1).await;

    h.engine.shutdown().await;
    let stopped = h.engine.get_operation(&op.id).unwrap();
    assert_eq!(stopped.status, OperationStatus::Failed);
    assert!(stopped.next_attempt_at.is_some());
    drop(h);
    wait_released(&weak).await;

    let (store, _) = open_sled(&dir);
    let resumed = start_engine_with_store(test_config(), Arc::new(ScriptedExecutor::new()), store);
    wait_until("resumed success", || resumed.engine.get_stats().success == 1).await;

    let done = resumed.engine.get_operation(&op.id).unwrap();
    assert_eq!(done.attempt, 2);
    assert_eq!(done.history.len(), 1);
    assert_eq!(done.history[0].category, ErrorCategory::Network);
    assert_eq!(done.payload, serde_json::json!({ "body": "draft" }));

    let calls = resumed.executor.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].attempt, 2);
}

#[tokio::test(start_paused = true)]
async fn operation_interrupted_mid_dispatch_is_retried_without_penalty() {
    let dir = TempDir::new().unwrap();
    let (store, weak) = open_sled(&dir);

    // A process that died while the dispatch was in flight.
    let op_id = {
        let mut queue = OperationQueue::open(Arc::clone(&store), 100).unwrap();
        let op = queue
            .enqueue(NewOperation::new("notes", "note-1", OperationType::Create), 1_000)
            .unwrap();
        let syncing = queue.mark_syncing(&op.id, 1_001).unwrap();
        assert_eq!(syncing.attempt, 1);
        op.id
    };
    drop(store);
    wait_released(&weak).await;

    let (store, _) = open_sled(&dir);
    let h = start_engine_with_store(test_config(), Arc::new(ScriptedExecutor::new()), store);
    wait_until("recovered success", || h.engine.get_stats().success == 1).await;

    let done = h.engine.get_operation(&op_id).unwrap();
    assert_eq!(done.attempt, 1);
    assert!(done.history.is_empty());
}

#[tokio::test(start_paused = true)]
async fn half_finished_dead_letter_move_is_completed_on_open() {
    let dir = TempDir::new().unwrap();
    let (store, weak) = open_sled(&dir);

    // Dead letter written, queue row not yet removed.
    let (dead_id, live_id) = {
        let mut queue = OperationQueue::open(Arc::clone(&store), 100).unwrap();
        let dead = queue
            .enqueue(NewOperation::new("notes", "note-1", OperationType::Delete), 1_000)
            .unwrap();
        let live = queue
            .enqueue(NewOperation::new("notes", "note-2", OperationType::Create), 1_001)
            .unwrap();
        let mut letters = DeadLetterStore::open(Arc::clone(&store)).unwrap();
        letters
            .add(
                dead.clone(),
                FinalError {
                    category: Some(ErrorCategory::ClientError),
                    message: "HTTP 400: bad request".into(),
                    reason: DeadReason::NonRetryable,
                },
                1_002,
            )
            .unwrap();
        (dead.id, live.id)
    };
    drop(store);
    wait_released(&weak).await;

    let (store, _) = open_sled(&dir);
    let h = start_engine_with_store(test_config(), Arc::new(ScriptedExecutor::new()), store);
    wait_until("live op synced", || h.engine.get_stats().success == 1).await;

    assert!(h.engine.get_operation(&dead_id).is_none());
    assert!(h.engine.get_operation(&live_id).is_some());
    assert_eq!(h.engine.get_dead_letters().len(), 1);
    assert_eq!(h.executor.calls_for(&dead_id), 0);
}

#[tokio::test(start_paused = true)]
async fn dead_letters_survive_restart() {
    let dir = TempDir::new().unwrap();
    let (store, weak) = open_sled(&dir);

    let executor = Arc::new(ScriptedExecutor::new());
    executor.always_fail(RawError::http(403, "forbidden"));
    let h = start_engine_with_store(test_config(), executor, store);
    let op = h
        .engine
        .enqueue(NewOperation::new("notes", "note-1", OperationType::Create))
        .unwrap();
    wait_until("dead letter", || h.engine.get_dead_letters().len() == 1).await;
    h.engine.shutdown().await;
    drop(h);
    wait_released(&weak).await;

    let (store, _) = open_sled(&dir);
    let h = start_engine_with_store(test_config(), Arc::new(ScriptedExecutor::new()), store);
    let letters = h.engine.get_dead_letters();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].operation.id, op.id);
    assert_eq!(letters[0].final_error.category, Some(ErrorCategory::Authentication));

    assert!(h.engine.retry_dead_letter(&op.id).unwrap());
    wait_until("dead letter resolved", || h.engine.get_dead_letters().is_empty()).await;
}

#[tokio::test(start_paused = true)]
async fn sequence_numbers_keep_growing_across_restarts() {
    let dir = TempDir::new().unwrap();
    let (store, weak) = open_sled(&dir);
    let first_seq = {
        let mut queue = OperationQueue::open(Arc::clone(&store), 100).unwrap();
        let a = queue
            .enqueue(NewOperation::new("notes", "a", OperationType::Create), 1)
            .unwrap();
        let b = queue
            .enqueue(NewOperation::new("notes", "b", OperationType::Create), 2)
            .unwrap();
        assert!(b.seq > a.seq);
        b.seq
    };
    drop(store);
    wait_released(&weak).await;

    let (store, _) = open_sled(&dir);
    let mut queue = OperationQueue::open(store, 100).unwrap();
    let c = queue
        .enqueue(NewOperation::new("notes", "c", OperationType::Create), 3)
        .unwrap();
    assert!(c.seq > first_seq);
    let order: Vec<String> = queue.list().into_iter().map(|op| op.record_id).collect();
    assert_eq!(order, vec!["a", "b", "c"]);
}
