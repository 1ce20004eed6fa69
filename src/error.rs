//! Typed failure reasons shared across the subsystem.
//!
//! Storage backends, the network fetcher, and the sync transport each report
//! failures through one of these enums so callers (and tests) can distinguish
//! a full quota from a corrupted record from a flaky network without string
//! matching.

use thiserror::Error;
use uuid::Uuid;

/// Maximum length for response bodies carried inside error messages.
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Why a storage backend rejected an operation.
#[derive(Debug, Error)]
pub enum StorageError {
  /// The backend is out of room for this write.
  #[error("quota exceeded: {0}")]
  QuotaExceeded(String),

  /// The backend cannot operate in this environment (missing directory,
  /// unopenable database, read-only filesystem).
  #[error("backend unsupported: {0}")]
  Unsupported(String),

  /// A persisted record exists but cannot be decoded.
  #[error("corrupted record: {0}")]
  Corrupted(String),

  /// Any other backend fault.
  #[error("backend failure: {0}")]
  Backend(String),
}

impl From<rusqlite::Error> for StorageError {
  fn from(e: rusqlite::Error) -> Self {
    match e {
      rusqlite::Error::SqliteFailure(code, msg)
        if code.code == rusqlite::ErrorCode::DiskFull =>
      {
        StorageError::QuotaExceeded(msg.unwrap_or_else(|| "disk full".to_string()))
      }
      rusqlite::Error::SqliteFailure(code, msg)
        if code.code == rusqlite::ErrorCode::DatabaseCorrupt =>
      {
        StorageError::Corrupted(msg.unwrap_or_else(|| "database corrupt".to_string()))
      }
      other => StorageError::Backend(other.to_string()),
    }
  }
}

impl From<serde_json::Error> for StorageError {
  fn from(e: serde_json::Error) -> Self {
    StorageError::Corrupted(e.to_string())
  }
}

impl From<std::io::Error> for StorageError {
  fn from(e: std::io::Error) -> Self {
    StorageError::Backend(e.to_string())
  }
}

/// Why a network operation (cache fill or queued delivery) failed.
#[derive(Debug, Error)]
pub enum FetchError {
  /// Connection-level failure: DNS, refused, reset, TLS.
  #[error("network error: {0}")]
  Network(String),

  /// The server answered with a non-success status.
  #[error("http status {status}")]
  Status { status: u16, body: String },

  /// The platform-level request timeout elapsed.
  #[error("request timed out")]
  Timeout,

  /// The request could not be built at all (bad URL, bad method).
  #[error("invalid request: {0}")]
  InvalidRequest(String),
}

impl FetchError {
  /// Truncate a response body so errors stay loggable.
  fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY_LENGTH {
      return body.to_string();
    }
    let mut cut = MAX_ERROR_BODY_LENGTH;
    while !body.is_char_boundary(cut) {
      cut -= 1;
    }
    format!(
      "{}... (truncated, {} total bytes)",
      &body[..cut],
      body.len()
    )
  }

  /// Build a status error from an HTTP response.
  pub fn from_status(status: u16, body: &str) -> Self {
    FetchError::Status {
      status,
      body: Self::truncate_body(body),
    }
  }
}

impl From<reqwest::Error> for FetchError {
  fn from(e: reqwest::Error) -> Self {
    if e.is_timeout() {
      FetchError::Timeout
    } else if e.is_builder() {
      FetchError::InvalidRequest(e.to_string())
    } else {
      FetchError::Network(e.to_string())
    }
  }
}

/// Failures surfaced by the cache strategy engine.
#[derive(Debug, Error)]
pub enum CacheError {
  /// The network path failed and the strategy had no cached fallback.
  #[error(transparent)]
  Fetch(#[from] FetchError),

  /// A cache-only lookup found nothing servable.
  #[error("no cached entry for {0}")]
  Miss(String),
}

/// Failures surfaced by the backup manager.
#[derive(Debug, Error)]
pub enum BackupError {
  /// No snapshot with this id in any tier.
  #[error("no snapshot {0}")]
  NotFound(Uuid),

  /// The snapshot could not be written to any tier.
  #[error("could not persist snapshot: {0}")]
  Persist(String),

  /// The host declined to navigate back to the snapshot's location, so the
  /// captured fields have nowhere to land.
  #[error("restore declined: session is at {current}, snapshot was taken at {recorded}")]
  NavigationDeclined { current: String, recorded: String },
}

/// Failures surfaced by the durable retry queue.
#[derive(Debug, Error)]
pub enum SyncError {
  /// Rejected before enqueueing: the submission can never be delivered.
  #[error("invalid submission: {0}")]
  InvalidSubmission(String),

  /// The submission could not be written to any tier, so deferring it
  /// would silently lose it.
  #[error("could not persist submission: {0}")]
  Persist(String),

  /// No pending or dead item with this id.
  #[error("no queued item {0}")]
  NotFound(Uuid),
}
