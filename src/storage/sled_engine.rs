// Sled-backed durable store: one sled tree per keyspace.

use std::path::{Path, PathBuf};

use super::{error::StorageError, Keyspace, KvStore};

pub struct SledStore {
    db: sled::Db,
    path: PathBuf,
}

impl SledStore {
    pub fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self, StorageError> {
        let path = data_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&path)?;

        let db = sled::open(&path)?;

        log::info!("Sled sync store initialized at {:?}", path);

        Ok(Self { db, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tree(&self, space: Keyspace) -> Result<sled::Tree, StorageError> {
        self.db
            .open_tree(space.tree_name())
            .map_err(|e| StorageError::SledError(e.to_string()))
    }

    /// Flush all dirty pages to disk.
    pub fn checkpoint(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        log::debug!("Checkpoint completed for sled sync store");
        Ok(())
    }
}

impl KvStore for SledStore {
    fn get(&self, space: Keyspace, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let tree = self.tree(space)?;
        Ok(tree.get(key.as_bytes())?.map(|v| v.to_vec()))
    }

    fn put(&self, space: Keyspace, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        let tree = self.tree(space)?;
        tree.insert(key.as_bytes(), value)?;
        tree.flush()?;
        Ok(())
    }

    fn delete(&self, space: Keyspace, key: &str) -> Result<(), StorageError> {
        let tree = self.tree(space)?;
        tree.remove(key.as_bytes())?;
        tree.flush()?;
        Ok(())
    }

    fn scan(&self, space: Keyspace) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        let tree = self.tree(space)?;
        let mut out = Vec::new();
        for item in tree.iter() {
            let (key, value) = item?;
            let key = String::from_utf8(key.to_vec()).map_err(|e| StorageError::Corrupt {
                keyspace: space.tree_name().to_string(),
                key: format!("{:?}", key),
                reason: e.to_string(),
            })?;
            out.push((key, value.to_vec()));
        }
        Ok(out)
    }

    fn clear(&self, space: Keyspace) -> Result<(), StorageError> {
        let tree = self.tree(space)?;
        tree.clear()?;
        tree.flush()?;
        log::info!("Cleared keyspace '{}'", space.tree_name());
        Ok(())
    }
}
