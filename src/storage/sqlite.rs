use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use super::{StorageTier, StoreRecord};
use crate::error::StorageError;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS records (
    namespace TEXT NOT NULL,
    key TEXT NOT NULL,
    payload BLOB NOT NULL,
    stored_at TEXT NOT NULL,
    critical INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (namespace, key)
);

CREATE INDEX IF NOT EXISTS idx_records_namespace_stored
    ON records (namespace, stored_at);
";

/// Primary tier: structured, indexed, effectively unbounded for this
/// workload. All access goes through one connection behind a mutex.
pub struct SqliteTier {
  conn: Mutex<Connection>,
}

impl SqliteTier {
  pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(path)?;
    conn.execute_batch(SCHEMA)?;
    debug!(path = %path.display(), "opened sqlite tier");
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  /// Private database for tests; contents vanish with the handle.
  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self, StorageError> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch(SCHEMA)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StorageError> {
    self
      .conn
      .lock()
      .map_err(|_| StorageError::Backend("sqlite lock poisoned".to_string()))
  }
}

fn parse_stored_at(raw: &str) -> Result<DateTime<Utc>, StorageError> {
  DateTime::parse_from_rfc3339(raw)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| StorageError::Corrupted(format!("bad timestamp {raw:?}: {e}")))
}

impl StorageTier for SqliteTier {
  fn name(&self) -> &'static str {
    "sqlite"
  }

  fn put(&self, namespace: &str, record: &StoreRecord) -> Result<(), StorageError> {
    let conn = self.lock()?;
    conn.execute(
      "INSERT OR REPLACE INTO records (namespace, key, payload, stored_at, critical)
       VALUES (?1, ?2, ?3, ?4, ?5)",
      params![
        namespace,
        record.key,
        record.payload,
        record.stored_at.to_rfc3339(),
        record.critical as i64,
      ],
    )?;
    Ok(())
  }

  fn get(&self, namespace: &str, key: &str) -> Result<Option<StoreRecord>, StorageError> {
    let conn = self.lock()?;
    let row = conn
      .query_row(
        "SELECT key, payload, stored_at, critical FROM records
         WHERE namespace = ?1 AND key = ?2",
        params![namespace, key],
        |row| {
          Ok((
            row.get::<_, String>(0)?,
            row.get::<_, Vec<u8>>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, i64>(3)?,
          ))
        },
      )
      .optional()?;

    match row {
      Some((key, payload, stored_at, critical)) => Ok(Some(StoreRecord {
        key,
        payload,
        stored_at: parse_stored_at(&stored_at)?,
        critical: critical != 0,
      })),
      None => Ok(None),
    }
  }

  fn remove(&self, namespace: &str, key: &str) -> Result<(), StorageError> {
    let conn = self.lock()?;
    conn.execute(
      "DELETE FROM records WHERE namespace = ?1 AND key = ?2",
      params![namespace, key],
    )?;
    Ok(())
  }

  fn list(&self, namespace: &str) -> Result<Vec<StoreRecord>, StorageError> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare(
      "SELECT key, payload, stored_at, critical FROM records
       WHERE namespace = ?1 ORDER BY stored_at ASC",
    )?;
    let rows = stmt.query_map(params![namespace], |row| {
      Ok((
        row.get::<_, String>(0)?,
        row.get::<_, Vec<u8>>(1)?,
        row.get::<_, String>(2)?,
        row.get::<_, i64>(3)?,
      ))
    })?;

    let mut records = Vec::new();
    for row in rows {
      let (key, payload, stored_at, critical) = row?;
      records.push(StoreRecord {
        key,
        payload,
        stored_at: parse_stored_at(&stored_at)?,
        critical: critical != 0,
      });
    }
    Ok(records)
  }

  fn clear(&self, namespace: &str) -> Result<(), StorageError> {
    let conn = self.lock()?;
    conn.execute("DELETE FROM records WHERE namespace = ?1", params![namespace])?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_put_get_round_trip() {
    let tier = SqliteTier::open_in_memory().unwrap();
    let record = StoreRecord::new("k1", b"payload".to_vec()).mark_critical();
    tier.put("ns", &record).unwrap();

    let back = tier.get("ns", "k1").unwrap().unwrap();
    assert_eq!(back.key, "k1");
    assert_eq!(back.payload, b"payload".to_vec());
    assert!(back.critical);
    assert_eq!(back.stored_at.timestamp(), record.stored_at.timestamp());
  }

  #[test]
  fn test_get_missing_returns_none() {
    let tier = SqliteTier::open_in_memory().unwrap();
    assert!(tier.get("ns", "absent").unwrap().is_none());
  }

  #[test]
  fn test_put_replaces_existing_key() {
    let tier = SqliteTier::open_in_memory().unwrap();
    tier.put("ns", &StoreRecord::new("k", b"old".to_vec())).unwrap();
    tier.put("ns", &StoreRecord::new("k", b"new".to_vec())).unwrap();

    let back = tier.get("ns", "k").unwrap().unwrap();
    assert_eq!(back.payload, b"new".to_vec());
    assert_eq!(tier.list("ns").unwrap().len(), 1);
  }

  #[test]
  fn test_namespaces_are_isolated() {
    let tier = SqliteTier::open_in_memory().unwrap();
    tier.put("a", &StoreRecord::new("k", b"1".to_vec())).unwrap();
    tier.put("b", &StoreRecord::new("k", b"2".to_vec())).unwrap();

    tier.clear("a").unwrap();
    assert!(tier.get("a", "k").unwrap().is_none());
    assert_eq!(tier.get("b", "k").unwrap().unwrap().payload, b"2".to_vec());
  }

  #[test]
  fn test_list_orders_by_stored_at() {
    let tier = SqliteTier::open_in_memory().unwrap();
    let mut old = StoreRecord::new("old", b"1".to_vec());
    old.stored_at = Utc::now() - chrono::Duration::hours(2);
    let new = StoreRecord::new("new", b"2".to_vec());
    tier.put("ns", &new).unwrap();
    tier.put("ns", &old).unwrap();

    let keys: Vec<String> = tier.list("ns").unwrap().into_iter().map(|r| r.key).collect();
    assert_eq!(keys, vec!["old".to_string(), "new".to_string()]);
  }

  #[test]
  fn test_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.db");
    {
      let tier = SqliteTier::open(&path).unwrap();
      tier.put("ns", &StoreRecord::new("k", b"v".to_vec())).unwrap();
    }
    let tier = SqliteTier::open(&path).unwrap();
    assert_eq!(tier.get("ns", "k").unwrap().unwrap().payload, b"v".to_vec());
  }
}
