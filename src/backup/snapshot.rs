//! Session snapshot data model and the sensitive-field deny list.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What prompted a capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackupTrigger {
  /// The periodic timer fired.
  Periodic,
  /// The host surface went invisible.
  VisibilityChange,
  /// The host is about to suspend or shut down.
  Suspend,
  /// The host caught a session-threatening error.
  Error,
  /// Explicit request from the user.
  Manual,
}

impl BackupTrigger {
  /// Emergency triggers capture the reduced critical scope and write
  /// redundant copies, since the process may not live much longer.
  pub fn is_emergency(self) -> bool {
    matches!(self, BackupTrigger::Suspend | BackupTrigger::Error)
  }
}

/// How much session state a snapshot carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupScope {
  /// Forms, navigation, history, error log, preferences.
  Full,
  /// Forms and location only; fast to serialize under pressure.
  Critical,
}

/// A field inside a named form, for focus restoration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRef {
  pub form: String,
  pub field: String,
}

/// Where the session was at capture time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NavState {
  /// Current location (route or path) of the host surface.
  pub location: String,
  /// Vertical scroll offset in host units.
  pub scroll_offset: f64,
  /// The field that held focus, if any.
  pub focused_field: Option<FieldRef>,
}

/// Everything the host can hand over for capture.
///
/// `forms` maps a form identifier to its field values. B-tree maps keep the
/// persisted JSON stable across captures of identical state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
  pub forms: BTreeMap<String, BTreeMap<String, String>>,
  pub nav: NavState,
  /// Recently visited locations, oldest first.
  pub history: Vec<String>,
  /// Recent host-side error messages, oldest first.
  pub recent_errors: Vec<String>,
  pub preferences: BTreeMap<String, String>,
}

/// A persisted point-in-time capture of session state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
  pub id: Uuid,
  pub captured_at: DateTime<Utc>,
  pub trigger: BackupTrigger,
  pub scope: BackupScope,
  /// User-supplied description on manual backups.
  pub description: Option<String>,
  /// Crate version that wrote the snapshot, for cross-version triage.
  pub app_version: String,
  pub state: SessionState,
}

impl Snapshot {
  /// Whether any captured form has at least one field value.
  pub fn has_form_data(&self) -> bool {
    self.state.forms.values().any(|fields| !fields.is_empty())
  }

  /// Whether retention and capacity eviction may remove this snapshot.
  /// Critical-scope and manual snapshots are only ever deleted explicitly.
  pub fn evictable(&self) -> bool {
    self.scope != BackupScope::Critical && self.trigger != BackupTrigger::Manual
  }

  pub fn summary(&self) -> SnapshotSummary {
    SnapshotSummary {
      id: self.id,
      captured_at: self.captured_at,
      trigger: self.trigger,
      scope: self.scope,
      description: self.description.clone(),
      field_count: self.state.forms.values().map(|f| f.len()).sum(),
      location: self.state.nav.location.clone(),
    }
  }
}

/// Compact description of a stored snapshot, for recovery offers and CLI
/// listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotSummary {
  pub id: Uuid,
  pub captured_at: DateTime<Utc>,
  pub trigger: BackupTrigger,
  pub scope: BackupScope,
  pub description: Option<String>,
  /// Captured form fields across all forms.
  pub field_count: usize,
  pub location: String,
}

/// Deny list for field names that must never reach a persisted snapshot.
///
/// Matching is case-insensitive substring, so `userPassword`, `CARD_NUMBER`
/// and `api_key_prod` are all caught by the default patterns.
#[derive(Debug, Clone)]
pub struct SensitiveFieldFilter {
  patterns: Vec<String>,
}

impl SensitiveFieldFilter {
  pub fn new(patterns: &[String]) -> Self {
    Self {
      patterns: patterns.iter().map(|p| p.to_lowercase()).collect(),
    }
  }

  pub fn is_sensitive(&self, field_name: &str) -> bool {
    let lowered = field_name.to_lowercase();
    self.patterns.iter().any(|p| lowered.contains(p))
  }

  /// Drop sensitive fields from every form, in place.
  pub fn scrub(&self, forms: &mut BTreeMap<String, BTreeMap<String, String>>) {
    for fields in forms.values_mut() {
      fields.retain(|name, _| !self.is_sensitive(name));
    }
  }
}

/// Host-side provider of the current session state. Captures run on
/// lifecycle events, so implementations should return quickly.
pub trait SessionSource: Send + Sync {
  /// Full capture: forms, navigation, history, errors, preferences.
  fn collect(&self) -> SessionState;

  /// Reduced capture for emergencies: forms and location only. The default
  /// derives it from [`SessionSource::collect`]; hosts whose full capture
  /// is expensive should override.
  fn collect_critical(&self) -> SessionState {
    let full = self.collect();
    SessionState {
      forms: full.forms,
      nav: NavState {
        location: full.nav.location,
        ..NavState::default()
      },
      ..SessionState::default()
    }
  }
}

/// Host-side receiver for a restore. Called in order: navigation check,
/// field values, scroll, focus.
pub trait SessionSink: Send + Sync {
  /// Where the session is right now, compared against the snapshot.
  fn current_location(&self) -> String;

  /// The snapshot was taken at `location` but the session is elsewhere.
  /// Return true to navigate there and continue the restore.
  fn confirm_navigation(&self, location: &str) -> bool;

  fn apply_field(&self, form: &str, field: &str, value: &str);

  fn apply_scroll(&self, offset: f64);

  fn apply_focus(&self, form: &str, field: &str);
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::BackupConfig;

  fn snapshot(trigger: BackupTrigger, scope: BackupScope) -> Snapshot {
    Snapshot {
      id: Uuid::new_v4(),
      captured_at: Utc::now(),
      trigger,
      scope,
      description: None,
      app_version: env!("CARGO_PKG_VERSION").to_string(),
      state: SessionState::default(),
    }
  }

  #[test]
  fn test_default_patterns_catch_credential_fields() {
    let filter = SensitiveFieldFilter::new(&BackupConfig::default().sensitive_patterns);
    assert!(filter.is_sensitive("password"));
    assert!(filter.is_sensitive("userPassword"));
    assert!(filter.is_sensitive("CARD_NUMBER"));
    assert!(filter.is_sensitive("api_key_prod"));
    assert!(filter.is_sensitive("cvv2"));
    assert!(!filter.is_sensitive("clientName"));
    assert!(!filter.is_sensitive("email"));
  }

  #[test]
  fn test_scrub_removes_only_sensitive_fields() {
    let filter = SensitiveFieldFilter::new(&BackupConfig::default().sensitive_patterns);
    let mut forms = BTreeMap::new();
    forms.insert(
      "login".to_string(),
      BTreeMap::from([
        ("username".to_string(), "jane".to_string()),
        ("password".to_string(), "hunter2".to_string()),
      ]),
    );

    filter.scrub(&mut forms);
    let login = &forms["login"];
    assert_eq!(login.len(), 1);
    assert!(login.contains_key("username"));
  }

  #[test]
  fn test_eviction_spares_critical_and_manual() {
    assert!(snapshot(BackupTrigger::Periodic, BackupScope::Full).evictable());
    assert!(snapshot(BackupTrigger::VisibilityChange, BackupScope::Full).evictable());
    assert!(!snapshot(BackupTrigger::Error, BackupScope::Critical).evictable());
    assert!(!snapshot(BackupTrigger::Manual, BackupScope::Full).evictable());
  }

  #[test]
  fn test_emergency_triggers() {
    assert!(BackupTrigger::Suspend.is_emergency());
    assert!(BackupTrigger::Error.is_emergency());
    assert!(!BackupTrigger::Periodic.is_emergency());
    assert!(!BackupTrigger::Manual.is_emergency());
  }

  #[test]
  fn test_summary_counts_fields_across_forms() {
    let mut snap = snapshot(BackupTrigger::Periodic, BackupScope::Full);
    snap.state.forms.insert(
      "a".to_string(),
      BTreeMap::from([("x".to_string(), "1".to_string())]),
    );
    snap.state.forms.insert(
      "b".to_string(),
      BTreeMap::from([
        ("y".to_string(), "2".to_string()),
        ("z".to_string(), "3".to_string()),
      ]),
    );
    assert_eq!(snap.summary().field_count, 3);
    assert!(snap.has_form_data());
  }

  #[test]
  fn test_default_critical_collection_keeps_forms_and_location() {
    struct Source;
    impl SessionSource for Source {
      fn collect(&self) -> SessionState {
        SessionState {
          forms: BTreeMap::from([(
            "wizard".to_string(),
            BTreeMap::from([("step".to_string(), "2".to_string())]),
          )]),
          nav: NavState {
            location: "/wizard/2".to_string(),
            scroll_offset: 480.0,
            focused_field: None,
          },
          history: vec!["/home".to_string(), "/wizard/1".to_string()],
          recent_errors: vec!["boom".to_string()],
          preferences: BTreeMap::from([("theme".to_string(), "dark".to_string())]),
        }
      }
    }

    let critical = Source.collect_critical();
    assert_eq!(critical.forms.len(), 1);
    assert_eq!(critical.nav.location, "/wizard/2");
    assert_eq!(critical.nav.scroll_offset, 0.0);
    assert!(critical.history.is_empty());
    assert!(critical.recent_errors.is_empty());
    assert!(critical.preferences.is_empty());
  }
}
