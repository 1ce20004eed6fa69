//! Queued submission records and the retry schedule.

use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::SyncConfig;

/// Deferred-execution tag for queued form posts.
pub const FORM_TAG: &str = "sync-forms";
/// Deferred-execution tag for queued uploads.
pub const UPLOAD_TAG: &str = "sync-uploads";

/// Form post or file upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncKind {
  Form,
  Upload,
}

impl SyncKind {
  /// Tag used to group items for the host's deferred-execution facility.
  pub fn tag(self) -> &'static str {
    match self {
      SyncKind::Form => FORM_TAG,
      SyncKind::Upload => UPLOAD_TAG,
    }
  }
}

/// File contents carried inside a queued upload. Bytes are base64 in the
/// persisted JSON so the record survives the flat tier unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePayload {
  pub filename: String,
  pub content_type: String,
  #[serde(with = "crate::storage::payload_encoding")]
  pub bytes: Vec<u8>,
}

/// What gets delivered once the network cooperates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SyncPayload {
  /// JSON body sent to the target.
  Form { fields: serde_json::Value },
  /// Multipart request: every file plus any extra text fields.
  Upload {
    files: Vec<FilePayload>,
    fields: serde_json::Value,
  },
}

/// Per-submission delivery overrides. Everything unset falls back to the
/// queue's configuration.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
  /// HTTP method for delivery; POST when unset.
  pub method: Option<String>,
  /// Retry budget for this item alone.
  pub max_attempts: Option<u32>,
}

/// One queued submission, persisted before the first delivery attempt so a
/// crash between accept and delivery never loses user data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncItem {
  pub id: Uuid,
  pub kind: SyncKind,
  /// Absolute URL; validated at enqueue time.
  pub target: String,
  /// Uppercase HTTP method the delivery uses; validated at enqueue time.
  pub method: String,
  /// Short human description, used in notifications ("contact form").
  pub label: String,
  /// Deferred-execution grouping tag, derived from the kind.
  pub tag: String,
  pub payload: SyncPayload,
  pub created_at: DateTime<Utc>,
  /// Completed delivery attempts so far.
  pub attempts: u32,
  /// Retry budget fixed at enqueue time.
  pub max_attempts: u32,
  pub last_error: Option<String>,
  /// When the next attempt is allowed; `None` means immediately.
  pub next_attempt_at: Option<DateTime<Utc>>,
}

impl SyncItem {
  pub fn form(target: &str, label: &str, fields: serde_json::Value) -> Self {
    Self::new(target, label, SyncKind::Form, SyncPayload::Form { fields })
  }

  pub fn upload(
    target: &str,
    label: &str,
    files: Vec<FilePayload>,
    fields: serde_json::Value,
  ) -> Self {
    Self::new(
      target,
      label,
      SyncKind::Upload,
      SyncPayload::Upload { files, fields },
    )
  }

  fn new(target: &str, label: &str, kind: SyncKind, payload: SyncPayload) -> Self {
    Self {
      id: Uuid::new_v4(),
      kind,
      target: target.to_string(),
      method: "POST".to_string(),
      label: label.to_string(),
      tag: kind.tag().to_string(),
      payload,
      created_at: Utc::now(),
      attempts: 0,
      max_attempts: SyncConfig::default().max_attempts,
      last_error: None,
      next_attempt_at: None,
    }
  }

  /// Whether an attempt is allowed now.
  pub fn ready(&self, now: DateTime<Utc>) -> bool {
    self.next_attempt_at.map_or(true, |due| now >= due)
  }
}

/// Outcome handed to the queue by `enqueue_*`.
#[derive(Debug, Clone, Copy)]
pub struct EnqueueReceipt {
  pub id: Uuid,
  /// True when the immediate attempt succeeded; false means the item sits
  /// in the queue waiting for a retry or for connectivity.
  pub delivered: bool,
}

/// A submission that exhausted its retry budget, kept for inspection and
/// manual requeueing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
  pub item: SyncItem,
  pub failed_at: DateTime<Utc>,
}

/// Delay before the next attempt after `failed_attempts` consecutive
/// failures: the base delay doubles with each failure up to the ceiling
/// (1s, 2s, 4s, 8s, 16s, 30s, 30s, ... with the defaults).
pub fn retry_delay(failed_attempts: u32, config: &SyncConfig) -> StdDuration {
  let exponent = failed_attempts.saturating_sub(1).min(31);
  let delay = config
    .base_delay_ms
    .saturating_mul(1u64 << exponent)
    .min(config.max_delay_ms);
  StdDuration::from_millis(delay)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_backoff_doubles_then_caps() {
    let config = SyncConfig::default();
    let delays: Vec<u64> = (1..=8)
      .map(|n| retry_delay(n, &config).as_millis() as u64)
      .collect();
    assert_eq!(
      delays,
      vec![1000, 2000, 4000, 8000, 16000, 30000, 30000, 30000]
    );
  }

  #[test]
  fn test_backoff_survives_huge_attempt_counts() {
    let config = SyncConfig::default();
    assert_eq!(retry_delay(u32::MAX, &config).as_millis(), 30000);
    // A zeroth failure is nonsensical but must not underflow
    assert_eq!(retry_delay(0, &config).as_millis(), 1000);
  }

  #[test]
  fn test_kind_determines_tag() {
    let form = SyncItem::form("https://x.example/s", "form", serde_json::json!({}));
    assert_eq!(form.tag, FORM_TAG);

    let upload = SyncItem::upload(
      "https://x.example/u",
      "upload",
      vec![FilePayload {
        filename: "f.bin".to_string(),
        content_type: "application/octet-stream".to_string(),
        bytes: vec![1],
      }],
      serde_json::json!({}),
    );
    assert_eq!(upload.tag, UPLOAD_TAG);
    assert_eq!(upload.method, "POST");
  }

  #[test]
  fn test_ready_respects_next_attempt_at() {
    let mut item = SyncItem::form("https://x.example/submit", "form", serde_json::json!({}));
    let now = Utc::now();
    assert!(item.ready(now));

    item.next_attempt_at = Some(now + chrono::Duration::seconds(5));
    assert!(!item.ready(now));
    assert!(item.ready(now + chrono::Duration::seconds(5)));
  }

  #[test]
  fn test_item_json_round_trip_keeps_file_bytes() {
    let item = SyncItem::upload(
      "https://x.example/upload",
      "photo",
      vec![
        FilePayload {
          filename: "shot.png".to_string(),
          content_type: "image/png".to_string(),
          bytes: vec![0, 159, 146, 150],
        },
        FilePayload {
          filename: "notes.txt".to_string(),
          content_type: "text/plain".to_string(),
          bytes: b"caption".to_vec(),
        },
      ],
      serde_json::json!({"album": "trip"}),
    );
    let text = serde_json::to_string(&item).unwrap();
    let back: SyncItem = serde_json::from_str(&text).unwrap();
    assert_eq!(back, item);
  }
}
