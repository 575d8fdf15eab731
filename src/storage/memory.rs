use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;

use super::{error::StorageError, Keyspace, KvStore};

/// Non-durable store for tests and ephemeral nodes.
#[derive(Debug, Default)]
pub struct MemoryStore {
    spaces: RwLock<HashMap<Keyspace, BTreeMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, space: Keyspace, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self
            .spaces
            .read()
            .get(&space)
            .and_then(|tree| tree.get(key).cloned()))
    }

    fn put(&self, space: Keyspace, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        self.spaces
            .write()
            .entry(space)
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    fn delete(&self, space: Keyspace, key: &str) -> Result<(), StorageError> {
        if let Some(tree) = self.spaces.write().get_mut(&space) {
            tree.remove(key);
        }
        Ok(())
    }

    fn scan(&self, space: Keyspace) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        Ok(self
            .spaces
            .read()
            .get(&space)
            .map(|tree| tree.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    fn clear(&self, space: Keyspace) -> Result<(), StorageError> {
        self.spaces.write().remove(&space);
        Ok(())
    }
}
