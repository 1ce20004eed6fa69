use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::{StorageTier, StoreRecord};
use crate::error::StorageError;
use crate::metrics::Metrics;

/// Fallback tier: one JSON file per record under a byte quota.
///
/// Survives restarts like the SQLite tier but holds far less, so it only sees
/// traffic when the primary is down. When a write would blow the quota the
/// tier evicts the oldest half of its non-critical records and retries once.
pub struct FileTier {
  root: PathBuf,
  quota_bytes: u64,
  metrics: Arc<Metrics>,
  // Serializes the check-quota-then-write sequence.
  write_lock: Mutex<()>,
}

impl FileTier {
  pub fn open(
    root: impl Into<PathBuf>,
    quota_bytes: u64,
    metrics: Arc<Metrics>,
  ) -> Result<Self, StorageError> {
    let root = root.into();
    fs::create_dir_all(&root)?;
    debug!(root = %root.display(), quota_bytes, "opened flat file tier");
    Ok(Self {
      root,
      quota_bytes,
      metrics,
      write_lock: Mutex::new(()),
    })
  }

  fn namespace_dir(&self, namespace: &str) -> PathBuf {
    self.root.join(sanitize(namespace))
  }

  fn record_path(&self, namespace: &str, key: &str) -> PathBuf {
    self.namespace_dir(namespace).join(format!("{}.json", sanitize(key)))
  }

  /// Total bytes currently held, across all namespaces.
  fn usage_bytes(&self) -> u64 {
    let mut total = 0;
    for file in self.walk_files() {
      if let Ok(meta) = fs::metadata(&file) {
        total += meta.len();
      }
    }
    total
  }

  fn walk_files(&self) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let Ok(namespaces) = fs::read_dir(&self.root) else {
      return files;
    };
    for ns in namespaces.flatten() {
      let Ok(entries) = fs::read_dir(ns.path()) else {
        continue;
      };
      for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "json") {
          files.push(path);
        }
      }
    }
    files
  }

  /// Delete the oldest half of non-critical records to make room.
  /// Unreadable files are treated as oldest; they are dead weight either way.
  fn emergency_evict(&self) -> usize {
    let mut candidates: Vec<(PathBuf, DateTime<Utc>)> = Vec::new();
    for path in self.walk_files() {
      match fs::read(&path).map(|bytes| serde_json::from_slice::<StoreRecord>(&bytes)) {
        Ok(Ok(record)) => {
          if !record.critical {
            candidates.push((path, record.stored_at));
          }
        }
        _ => candidates.push((path, DateTime::<Utc>::MIN_UTC)),
      }
    }

    candidates.sort_by_key(|(_, stored_at)| *stored_at);
    let evict_count = candidates.len().div_ceil(2);
    let mut evicted = 0;
    for (path, _) in candidates.into_iter().take(evict_count) {
      match fs::remove_file(&path) {
        Ok(()) => evicted += 1,
        Err(e) => warn!(path = %path.display(), error = %e, "eviction failed to remove file"),
      }
    }
    if evicted > 0 {
      warn!(evicted, "flat tier over quota, evicted oldest non-critical records");
      self.metrics.record_emergency_eviction(evicted as u64);
    }
    evicted
  }
}

/// Keep filenames portable; anything outside a safe set becomes '_'.
fn sanitize(raw: &str) -> String {
  raw
    .chars()
    .map(|c| {
      if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
        c
      } else {
        '_'
      }
    })
    .collect()
}

impl StorageTier for FileTier {
  fn name(&self) -> &'static str {
    "flat-file"
  }

  fn put(&self, namespace: &str, record: &StoreRecord) -> Result<(), StorageError> {
    let _guard = self
      .write_lock
      .lock()
      .map_err(|_| StorageError::Backend("file tier lock poisoned".to_string()))?;

    let bytes = serde_json::to_vec(record)?;
    let path = self.record_path(namespace, &record.key);
    let replaced = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);

    let fits = |usage: u64| usage - replaced.min(usage) + bytes.len() as u64 <= self.quota_bytes;
    if !fits(self.usage_bytes()) {
      self.emergency_evict();
      if !fits(self.usage_bytes()) {
        return Err(StorageError::QuotaExceeded(format!(
          "record of {} bytes does not fit in {} byte quota",
          bytes.len(),
          self.quota_bytes
        )));
      }
    }

    fs::create_dir_all(self.namespace_dir(namespace))?;
    fs::write(&path, &bytes)?;
    Ok(())
  }

  fn get(&self, namespace: &str, key: &str) -> Result<Option<StoreRecord>, StorageError> {
    let path = self.record_path(namespace, key);
    let bytes = match fs::read(&path) {
      Ok(bytes) => bytes,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
      Err(e) => return Err(e.into()),
    };
    let record = serde_json::from_slice(&bytes)
      .map_err(|e| StorageError::Corrupted(format!("{}: {e}", path.display())))?;
    Ok(Some(record))
  }

  fn remove(&self, namespace: &str, key: &str) -> Result<(), StorageError> {
    match fs::remove_file(self.record_path(namespace, key)) {
      Ok(()) => Ok(()),
      Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
      Err(e) => Err(e.into()),
    }
  }

  fn list(&self, namespace: &str) -> Result<Vec<StoreRecord>, StorageError> {
    let dir = self.namespace_dir(namespace);
    let entries = match fs::read_dir(&dir) {
      Ok(entries) => entries,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
      Err(e) => return Err(e.into()),
    };

    let mut records = Vec::new();
    for entry in entries.flatten() {
      let path = entry.path();
      if !path.extension().is_some_and(|ext| ext == "json") {
        continue;
      }
      match fs::read(&path).map(|bytes| serde_json::from_slice::<StoreRecord>(&bytes)) {
        Ok(Ok(record)) => records.push(record),
        Ok(Err(e)) => warn!(path = %path.display(), error = %e, "skipping corrupted record"),
        Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable record"),
      }
    }
    records.sort_by_key(|r| r.stored_at);
    Ok(records)
  }

  fn clear(&self, namespace: &str) -> Result<(), StorageError> {
    match fs::remove_dir_all(self.namespace_dir(namespace)) {
      Ok(()) => Ok(()),
      Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
      Err(e) => Err(e.into()),
    }
  }
}
