#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use syncline::common::FixedJitter;
use syncline::config::SyncConfig;
use syncline::storage::{KvStore, MemoryStore};
use syncline::sync::{
    OperationType, RawError, RemoteExecutor, SyncEngine, SyncEvent, SyncObserver, SyncOperation,
};

#[derive(Debug, Clone)]
pub struct Call {
    pub op_id: String,
    pub record_id: String,
    pub op_type: OperationType,
    pub attempt: u32,
    pub at: tokio::time::Instant,
}

type Responder = dyn Fn(&SyncOperation) -> Result<(), RawError> + Send + Sync;

/// Remote executor driven by a script of results, then a fallback rule.
pub struct ScriptedExecutor {
    script: Mutex<VecDeque<Result<(), RawError>>>,
    fallback: Mutex<Box<Responder>>,
    calls: Mutex<Vec<Call>>,
    active: Mutex<HashSet<String>>,
    overlap: AtomicBool,
    latency: Duration,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(Box::new(|_| Ok(()))),
            calls: Mutex::new(Vec::new()),
            active: Mutex::new(HashSet::new()),
            overlap: AtomicBool::new(false),
            latency: Duration::ZERO,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Results handed out in order before the fallback applies.
    pub fn push(&self, results: impl IntoIterator<Item = Result<(), RawError>>) {
        self.script.lock().extend(results);
    }

    pub fn always(&self, f: impl Fn(&SyncOperation) -> Result<(), RawError> + Send + Sync + 'static) {
        *self.fallback.lock() = Box::new(f);
    }

    pub fn always_fail(&self, err: RawError) {
        self.always(move |_| Err(err.clone()));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn calls_for(&self, op_id: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.op_id == op_id).count()
    }

    /// True if two dispatches for the same record were ever in flight together.
    pub fn saw_overlap(&self) -> bool {
        self.overlap.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteExecutor for ScriptedExecutor {
    async fn execute(&self, op: &SyncOperation) -> Result<(), RawError> {
        self.calls.lock().push(Call {
            op_id: op.id.clone(),
            record_id: op.record_id.clone(),
            op_type: op.op_type,
            attempt: op.attempt,
            at: tokio::time::Instant::now(),
        });
        if !self.active.lock().insert(op.record_id.clone()) {
            self.overlap.store(true, Ordering::SeqCst);
        }

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let scripted = self.script.lock().pop_front();
        let result = match scripted {
            Some(result) => result,
            None => (*self.fallback.lock())(op),
        };
        self.active.lock().remove(&op.record_id);
        result
    }
}

/// Observer that keeps every event for later assertions.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<SyncEvent>>,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<SyncEvent> {
        self.events.lock().clone()
    }
}

impl SyncObserver for RecordingObserver {
    fn on_event(&self, event: &SyncEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Defaults, except completed rows stay until a test purges them.
pub fn test_config() -> SyncConfig {
    SyncConfig {
        completed_retention_ms: 0,
        ..SyncConfig::default()
    }
}

pub struct Harness {
    pub engine: Arc<SyncEngine>,
    pub executor: Arc<ScriptedExecutor>,
    pub observer: Arc<RecordingObserver>,
    pub store: Arc<dyn KvStore>,
}

/// Engine on the tokio clock with neutral jitter, started.
pub fn start_engine(config: SyncConfig, executor: Arc<ScriptedExecutor>) -> Harness {
    start_engine_with_store(config, executor, Arc::new(MemoryStore::new()))
}

pub fn start_engine_with_store(
    config: SyncConfig,
    executor: Arc<ScriptedExecutor>,
    store: Arc<dyn KvStore>,
) -> Harness {
    let observer = Arc::new(RecordingObserver::default());
    let engine = SyncEngine::builder(config)
        .store(Arc::clone(&store))
        .executor(executor.clone())
        .jitter(Arc::new(FixedJitter(1.0)))
        .observer(observer.clone())
        .build()
        .expect("build engine");
    let engine = Arc::new(engine);
    engine.start();
    Harness {
        engine,
        executor,
        observer,
        store,
    }
}

/// Poll `check` on the (usually paused) tokio clock until it holds.
pub async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..60_000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
