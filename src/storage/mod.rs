mod error;
mod memory;
pub mod record;
mod sled_engine;

use std::sync::Arc;

use crate::config::StorageConfig;

pub use self::error::StorageError;
pub use self::memory::MemoryStore;
pub use self::sled_engine::SledStore;

/// Named keyspaces of the sync store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Keyspace {
    Operations,
    DeadLetters,
    Meta,
}

impl Keyspace {
    pub fn tree_name(&self) -> &'static str {
        match self {
            Keyspace::Operations => "operations",
            Keyspace::DeadLetters => "dead_letters",
            Keyspace::Meta => "__meta__",
        }
    }
}

/// Durable key-value persistence used by the operation queue and the
/// dead-letter store. Writes are durable once the call returns.
pub trait KvStore: Send + Sync {
    fn get(&self, space: Keyspace, key: &str) -> Result<Option<Vec<u8>>, StorageError>;
    fn put(&self, space: Keyspace, key: &str, value: Vec<u8>) -> Result<(), StorageError>;
    fn delete(&self, space: Keyspace, key: &str) -> Result<(), StorageError>;
    fn scan(&self, space: Keyspace) -> Result<Vec<(String, Vec<u8>)>, StorageError>;
    fn clear(&self, space: Keyspace) -> Result<(), StorageError>;
}

pub fn open_store(config: &StorageConfig) -> Result<Arc<dyn KvStore>, StorageError> {
    match config {
        StorageConfig::Sled { data_dir } => Ok(Arc::new(SledStore::open(data_dir)?)),
        StorageConfig::Memory => {
            log::warn!("Using in-memory sync store; queued operations will not survive a restart");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}
