//! Tiered persistence for everything the subsystem keeps locally.
//!
//! Three backends with different durability/capacity tradeoffs sit behind one
//! trait: a structured SQLite store (durable, large, queryable), a flat
//! JSON-per-record store under a byte quota (durable, small), and an
//! in-memory map (fastest, gone on exit). [`TieredStore`] tries them in that
//! order and degrades instead of failing: a write that cannot reach a durable
//! tier lands in the volatile one and the caller learns about it through the
//! returned [`WriteOutcome`], never through a panic or an error bubble.

mod file;
mod memory;
mod sqlite;

pub use file::FileTier;
pub use memory::MemoryTier;
pub use sqlite::SqliteTier;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::StorageConfig;
use crate::error::StorageError;
use crate::metrics::Metrics;

/// One persisted record. The payload is opaque bytes; components serialize
/// their own types into it (JSON throughout this crate).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreRecord {
  pub key: String,
  #[serde(with = "payload_encoding")]
  pub payload: Vec<u8>,
  pub stored_at: DateTime<Utc>,
  /// Critical records survive emergency evictions.
  #[serde(default)]
  pub critical: bool,
}

impl StoreRecord {
  pub fn new(key: impl Into<String>, payload: Vec<u8>) -> Self {
    Self {
      key: key.into(),
      payload,
      stored_at: Utc::now(),
      critical: false,
    }
  }

  /// Serialize a value to JSON and wrap it in a record.
  pub fn json<T: Serialize>(key: impl Into<String>, value: &T) -> Result<Self, StorageError> {
    Ok(Self::new(key, serde_json::to_vec(value)?))
  }

  /// Mark this record as exempt from emergency eviction.
  pub fn mark_critical(mut self) -> Self {
    self.critical = true;
    self
  }

  /// Decode the payload back into a value.
  pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StorageError> {
    Ok(serde_json::from_slice(&self.payload)?)
  }

  /// Approximate on-disk footprint, used for quota accounting.
  pub fn size_bytes(&self) -> u64 {
    // Key, payload, timestamp and JSON framing; close enough for a budget.
    (self.key.len() + self.payload.len() + 64) as u64
  }
}

/// Base64 payload encoding so records stay printable in the flat tier.
pub(crate) mod payload_encoding {
  use base64::engine::general_purpose::STANDARD as BASE64;
  use base64::Engine;
  use serde::{Deserialize, Deserializer, Serialize, Serializer};

  pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    BASE64.encode(bytes).serialize(serializer)
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let s = String::deserialize(deserializer)?;
    BASE64
      .decode(s.as_bytes())
      .map_err(serde::de::Error::custom)
  }
}

/// One persistence backend.
///
/// Implementations are synchronous local I/O guarded internally; the async
/// services above them never hold a lock across an await point.
pub trait StorageTier: Send + Sync {
  fn name(&self) -> &'static str;

  /// Volatile tiers lose their contents on process exit.
  fn volatile(&self) -> bool {
    false
  }

  fn put(&self, namespace: &str, record: &StoreRecord) -> Result<(), StorageError>;

  fn get(&self, namespace: &str, key: &str) -> Result<Option<StoreRecord>, StorageError>;

  fn remove(&self, namespace: &str, key: &str) -> Result<(), StorageError>;

  fn list(&self, namespace: &str) -> Result<Vec<StoreRecord>, StorageError>;

  fn clear(&self, namespace: &str) -> Result<(), StorageError>;
}

/// Where a write ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
  /// Landed in the primary durable tier.
  Durable,
  /// Primary refused; landed in a lower durable tier.
  Degraded,
  /// Only the volatile tier accepted it; gone on exit.
  Volatile,
  /// No tier accepted the write.
  Failed,
}

impl WriteOutcome {
  /// True when the record exists somewhere, even if only in memory.
  pub fn persisted(&self) -> bool {
    !matches!(self, WriteOutcome::Failed)
  }

  /// True when the record survives a process restart.
  pub fn durable(&self) -> bool {
    matches!(self, WriteOutcome::Durable | WriteOutcome::Degraded)
  }
}

/// Ordered fallback chain over the configured tiers.
pub struct TieredStore {
  tiers: Vec<Box<dyn StorageTier>>,
  metrics: Arc<Metrics>,
}

impl TieredStore {
  /// Build a chain from explicit tiers, tried in the given order.
  pub fn new(tiers: Vec<Box<dyn StorageTier>>, metrics: Arc<Metrics>) -> Self {
    Self { tiers, metrics }
  }

  /// Open the standard chain: SQLite, then the quota-limited flat store,
  /// then memory.
  pub fn open_default(
    config: &StorageConfig,
    metrics: Arc<Metrics>,
  ) -> Result<Self, StorageError> {
    let data_dir = config
      .resolve_data_dir()
      .map_err(|e| StorageError::Unsupported(e.to_string()))?;
    let tiers: Vec<Box<dyn StorageTier>> = vec![
      Box::new(SqliteTier::open(data_dir.join("lifeboat.db"))?),
      Box::new(FileTier::open(
        data_dir.join("flat"),
        config.flat_quota_bytes,
        Arc::clone(&metrics),
      )?),
      Box::new(MemoryTier::new()),
    ];
    Ok(Self::new(tiers, metrics))
  }

  /// Write through the chain. Never panics and never returns an error; the
  /// outcome says how durable the record ended up.
  pub fn put(&self, namespace: &str, record: &StoreRecord) -> WriteOutcome {
    for (idx, tier) in self.tiers.iter().enumerate() {
      match tier.put(namespace, record) {
        Ok(()) => {
          if idx == 0 {
            return WriteOutcome::Durable;
          }
          if tier.volatile() {
            warn!(
              namespace,
              key = %record.key,
              tier = tier.name(),
              "degraded durability: record held in volatile storage only"
            );
            self.metrics.record_volatile_write();
            return WriteOutcome::Volatile;
          }
          debug!(
            namespace,
            key = %record.key,
            tier = tier.name(),
            "primary tier unavailable, wrote to fallback"
          );
          self.metrics.record_degraded_write();
          return WriteOutcome::Degraded;
        }
        Err(e) => {
          warn!(
            namespace,
            key = %record.key,
            tier = tier.name(),
            error = %e,
            "tier rejected write, falling through"
          );
        }
      }
    }
    self.metrics.record_failed_write();
    warn!(namespace, key = %record.key, "write failed on every tier");
    WriteOutcome::Failed
  }

  /// Write a copy to every tier that will take one. Used for emergency
  /// snapshots that must survive as many failure modes as possible.
  /// Returns how many tiers accepted the record.
  pub fn put_redundant(&self, namespace: &str, record: &StoreRecord) -> usize {
    let mut stored = 0;
    for tier in &self.tiers {
      match tier.put(namespace, record) {
        Ok(()) => stored += 1,
        Err(e) => {
          debug!(
            namespace,
            key = %record.key,
            tier = tier.name(),
            error = %e,
            "redundant write skipped tier"
          );
        }
      }
    }
    if stored == 0 {
      self.metrics.record_failed_write();
    }
    stored
  }

  /// Read through the chain. Falls to the next tier on backend failure *and*
  /// on absence, since degraded writes may have landed below the primary.
  pub fn get(&self, namespace: &str, key: &str) -> Option<StoreRecord> {
    for tier in &self.tiers {
      match tier.get(namespace, key) {
        Ok(Some(record)) => return Some(record),
        Ok(None) => {}
        Err(e) => {
          warn!(namespace, key, tier = tier.name(), error = %e, "tier read failed");
        }
      }
    }
    None
  }

  /// Remove from every tier; redundant copies must all go.
  pub fn remove(&self, namespace: &str, key: &str) {
    for tier in &self.tiers {
      if let Err(e) = tier.remove(namespace, key) {
        warn!(namespace, key, tier = tier.name(), error = %e, "tier remove failed");
      }
    }
  }

  /// All records in a namespace, merged across tiers. When a key exists in
  /// several tiers the highest tier wins.
  pub fn list(&self, namespace: &str) -> Vec<StoreRecord> {
    let mut merged: BTreeMap<String, StoreRecord> = BTreeMap::new();
    for tier in &self.tiers {
      match tier.list(namespace) {
        Ok(records) => {
          for record in records {
            merged.entry(record.key.clone()).or_insert(record);
          }
        }
        Err(e) => {
          warn!(namespace, tier = tier.name(), error = %e, "tier list failed");
        }
      }
    }
    merged.into_values().collect()
  }

  /// Drop a whole namespace from every tier.
  pub fn clear_namespace(&self, namespace: &str) {
    for tier in &self.tiers {
      if let Err(e) = tier.clear(namespace) {
        warn!(namespace, tier = tier.name(), error = %e, "tier clear failed");
      }
    }
  }

  /// Distinct keys currently visible in a namespace.
  pub fn count(&self, namespace: &str) -> usize {
    self.list(namespace).len()
  }

  /// Serialize a value and write it through the chain.
  pub fn put_json<T: Serialize>(
    &self,
    namespace: &str,
    key: &str,
    value: &T,
    critical: bool,
  ) -> WriteOutcome {
    match StoreRecord::json(key, value) {
      Ok(record) => {
        let record = if critical { record.mark_critical() } else { record };
        self.put(namespace, &record)
      }
      Err(e) => {
        warn!(namespace, key, error = %e, "failed to serialize record");
        self.metrics.record_failed_write();
        WriteOutcome::Failed
      }
    }
  }

  /// Read and decode a value; decode failures are treated as absence.
  pub fn get_json<T: DeserializeOwned>(&self, namespace: &str, key: &str) -> Option<T> {
    let record = self.get(namespace, key)?;
    match record.decode() {
      Ok(value) => Some(value),
      Err(e) => {
        warn!(namespace, key, error = %e, "discarding undecodable record");
        None
      }
    }
  }

  pub fn metrics(&self) -> &Arc<Metrics> {
    &self.metrics
  }

  /// Names of the configured tiers, in fallback order.
  pub fn tier_names(&self) -> Vec<&'static str> {
    self.tiers.iter().map(|t| t.name()).collect()
  }
}

#[cfg(test)]
pub(crate) mod testing {
  use super::*;

  /// A backend that rejects everything, for exercising the fallback chain.
  pub struct FailingTier {
    pub label: &'static str,
  }

  impl StorageTier for FailingTier {
    fn name(&self) -> &'static str {
      self.label
    }

    fn put(&self, _namespace: &str, _record: &StoreRecord) -> Result<(), StorageError> {
      Err(StorageError::Backend("injected failure".to_string()))
    }

    fn get(&self, _namespace: &str, _key: &str) -> Result<Option<StoreRecord>, StorageError> {
      Err(StorageError::Backend("injected failure".to_string()))
    }

    fn remove(&self, _namespace: &str, _key: &str) -> Result<(), StorageError> {
      Err(StorageError::Backend("injected failure".to_string()))
    }

    fn list(&self, _namespace: &str) -> Result<Vec<StoreRecord>, StorageError> {
      Err(StorageError::Backend("injected failure".to_string()))
    }

    fn clear(&self, _namespace: &str) -> Result<(), StorageError> {
      Err(StorageError::Backend("injected failure".to_string()))
    }
  }

  /// Chain of memory tiers only, for tests that do not touch disk.
  pub fn memory_store() -> TieredStore {
    TieredStore::new(
      vec![Box::new(MemoryTier::new())],
      Arc::new(Metrics::new()),
    )
  }
}
