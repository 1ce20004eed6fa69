use std::collections::HashMap;
use std::sync::Mutex;

use super::{StorageTier, StoreRecord};
use crate::error::StorageError;

type Shelf = HashMap<String, HashMap<String, StoreRecord>>;

/// Last-resort tier: a plain map, lost on process exit. Always succeeds, so
/// a chain ending here can only report `Failed` when this tier is absent.
#[derive(Default)]
pub struct MemoryTier {
  shelves: Mutex<Shelf>,
}

impl MemoryTier {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Shelf>, StorageError> {
    self
      .shelves
      .lock()
      .map_err(|_| StorageError::Backend("memory tier lock poisoned".to_string()))
  }
}

impl StorageTier for MemoryTier {
  fn name(&self) -> &'static str {
    "memory"
  }

  fn volatile(&self) -> bool {
    true
  }

  fn put(&self, namespace: &str, record: &StoreRecord) -> Result<(), StorageError> {
    self
      .lock()?
      .entry(namespace.to_string())
      .or_default()
      .insert(record.key.clone(), record.clone());
    Ok(())
  }

  fn get(&self, namespace: &str, key: &str) -> Result<Option<StoreRecord>, StorageError> {
    Ok(
      self
        .lock()?
        .get(namespace)
        .and_then(|shelf| shelf.get(key))
        .cloned(),
    )
  }

  fn remove(&self, namespace: &str, key: &str) -> Result<(), StorageError> {
    if let Some(shelf) = self.lock()?.get_mut(namespace) {
      shelf.remove(key);
    }
    Ok(())
  }

  fn list(&self, namespace: &str) -> Result<Vec<StoreRecord>, StorageError> {
    let mut records: Vec<StoreRecord> = self
      .lock()?
      .get(namespace)
      .map(|shelf| shelf.values().cloned().collect())
      .unwrap_or_default();
    records.sort_by_key(|r| r.stored_at);
    Ok(records)
  }

  fn clear(&self, namespace: &str) -> Result<(), StorageError> {
    self.lock()?.remove(namespace);
    Ok(())
  }
}
