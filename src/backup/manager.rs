//! Capture, recovery, and retention of session snapshots.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::snapshot::{
  BackupScope, BackupTrigger, SensitiveFieldFilter, SessionSink, SessionSource, Snapshot,
  SnapshotSummary,
};
use crate::config::BackupConfig;
use crate::error::BackupError;
use crate::events::{EventBus, LifecycleEvent, Notification, Notifier};
use crate::metrics::Metrics;
use crate::storage::{StoreRecord, TieredStore};

const SNAPSHOT_NAMESPACE: &str = "backup:snapshots";
const META_NAMESPACE: &str = "backup:meta";
const INDEX_KEY: &str = "index";

/// Result of a capture.
#[derive(Debug, Clone, Serialize)]
pub struct BackupReceipt {
  pub id: Uuid,
  /// Serialized size of the persisted record.
  pub size_bytes: u64,
  /// How many tiers hold a copy; more than one for emergency captures.
  pub copies: usize,
}

/// Self-contained bundle of every stored snapshot, oldest first.
#[derive(Debug, Serialize, Deserialize)]
pub struct BackupExport {
  pub exported_at: chrono::DateTime<Utc>,
  pub snapshots: Vec<Snapshot>,
}

/// Owns the snapshot lifecycle: capture on triggers, offer on restart,
/// restore through a [`SessionSink`], prune on retention.
///
/// Snapshot records are keyed by id under one namespace; a separate index
/// record keeps ids in capture order and enforces the count cap. The index
/// is advisory - it is rebuilt from the records themselves during prune, so
/// a crash between writing a snapshot and its index entry loses nothing.
pub struct BackupManager {
  store: Arc<TieredStore>,
  source: Arc<dyn SessionSource>,
  events: Arc<EventBus>,
  notifier: Arc<Notifier>,
  config: BackupConfig,
  metrics: Arc<Metrics>,
  filter: SensitiveFieldFilter,
}

impl BackupManager {
  pub fn new(
    store: Arc<TieredStore>,
    source: Arc<dyn SessionSource>,
    events: Arc<EventBus>,
    notifier: Arc<Notifier>,
    config: BackupConfig,
    metrics: Arc<Metrics>,
  ) -> Self {
    let filter = SensitiveFieldFilter::new(&config.sensitive_patterns);
    Self {
      store,
      source,
      events,
      notifier,
      config,
      metrics,
      filter,
    }
  }

  /// Capture the current session under `trigger`. Emergency triggers use
  /// the reduced critical scope and write a copy to every tier.
  pub fn capture(&self, trigger: BackupTrigger) -> Result<BackupReceipt, BackupError> {
    self.capture_with(trigger, None)
  }

  /// Explicit user-requested backup, exempt from automatic eviction.
  pub fn create_manual_backup(&self, description: &str) -> Result<BackupReceipt, BackupError> {
    let description = (!description.is_empty()).then(|| description.to_string());
    self.capture_with(BackupTrigger::Manual, description)
  }

  fn capture_with(
    &self,
    trigger: BackupTrigger,
    description: Option<String>,
  ) -> Result<BackupReceipt, BackupError> {
    let scope = if trigger.is_emergency() {
      BackupScope::Critical
    } else {
      BackupScope::Full
    };
    let mut state = match scope {
      BackupScope::Critical => self.source.collect_critical(),
      BackupScope::Full => self.source.collect(),
    };
    self.filter.scrub(&mut state.forms);
    bound_tail(&mut state.history, self.config.history_limit);
    bound_tail(&mut state.recent_errors, self.config.error_log_limit);

    let snapshot = Snapshot {
      id: Uuid::new_v4(),
      captured_at: Utc::now(),
      trigger,
      scope,
      description,
      app_version: env!("CARGO_PKG_VERSION").to_string(),
      state,
    };
    let mut record = StoreRecord::json(snapshot.id.to_string(), &snapshot)
      .map_err(|e| BackupError::Persist(e.to_string()))?;
    if !snapshot.evictable() {
      record = record.mark_critical();
    }
    let size_bytes = record.size_bytes();

    let copies = if trigger.is_emergency() {
      self.store.put_redundant(SNAPSHOT_NAMESPACE, &record)
    } else if self.store.put(SNAPSHOT_NAMESPACE, &record).persisted() {
      1
    } else {
      0
    };
    if copies == 0 {
      return Err(BackupError::Persist(format!(
        "snapshot {} rejected by every storage tier",
        snapshot.id
      )));
    }
    self.metrics.record_snapshot_captured();
    info!(id = %snapshot.id, ?trigger, ?scope, size_bytes, copies, "session snapshot captured");

    let mut index = self.load_index();
    index.push(snapshot.id);
    let evicted = self.enforce_capacity(&mut index);
    if evicted > 0 {
      self.metrics.record_snapshots_evicted(evicted as u64);
    }
    self.store_index(&index);

    Ok(BackupReceipt {
      id: snapshot.id,
      size_bytes,
      copies,
    })
  }

  /// Every stored snapshot, newest first.
  pub fn snapshots(&self) -> Vec<Snapshot> {
    let mut all: Vec<Snapshot> = self
      .store
      .list(SNAPSHOT_NAMESPACE)
      .iter()
      .filter_map(|r| r.decode::<Snapshot>().ok())
      .collect();
    all.sort_by(|a, b| b.captured_at.cmp(&a.captured_at));
    all
  }

  /// Snapshots worth offering after a restart: inside the recency window,
  /// and either carrying form data or captured under emergency. Critical
  /// scope ranks ahead of full; within a scope, newest first.
  pub fn recovery_candidates(&self) -> Vec<SnapshotSummary> {
    let now = Utc::now();
    let window = chrono::Duration::seconds(self.config.recency_window_secs as i64);
    let mut candidates: Vec<Snapshot> = self
      .snapshots()
      .into_iter()
      .filter(|s| now.signed_duration_since(s.captured_at) <= window)
      .filter(|s| s.has_form_data() || s.trigger.is_emergency())
      .collect();
    candidates.sort_by(|a, b| {
      let rank = |s: &Snapshot| s.scope != BackupScope::Critical;
      rank(a)
        .cmp(&rank(b))
        .then(b.captured_at.cmp(&a.captured_at))
    });
    candidates.iter().map(Snapshot::summary).collect()
  }

  /// Scan for restorable snapshots and announce them through the notifier.
  /// Returns the best candidate, or `None` when nothing qualifies.
  pub fn offer_recovery(&self) -> Option<SnapshotSummary> {
    let candidates = self.recovery_candidates();
    let best = candidates.first().cloned()?;
    info!(count = candidates.len(), best = %best.id, "offering session recovery");
    self
      .notifier
      .emit(Notification::RecoveryAvailable { candidates });
    Some(best)
  }

  /// Reapply a snapshot through the sink: navigation check first, then
  /// field values, scroll, and focus.
  pub fn restore(&self, id: Uuid, sink: &dyn SessionSink) -> Result<SnapshotSummary, BackupError> {
    let snapshot = self.load_snapshot(id).ok_or(BackupError::NotFound(id))?;

    let recorded = snapshot.state.nav.location.clone();
    let current = sink.current_location();
    if !recorded.is_empty() && recorded != current && !sink.confirm_navigation(&recorded) {
      debug!(%id, %current, %recorded, "restore declined at navigation check");
      return Err(BackupError::NavigationDeclined { current, recorded });
    }

    for (form, fields) in &snapshot.state.forms {
      for (field, value) in fields {
        sink.apply_field(form, field, value);
      }
    }
    sink.apply_scroll(snapshot.state.nav.scroll_offset);
    if let Some(focus) = &snapshot.state.nav.focused_field {
      sink.apply_focus(&focus.form, &focus.field);
    }

    let summary = snapshot.summary();
    self.metrics.record_snapshot_restored();
    self.notifier.emit(Notification::RecoveryRestored { id });
    info!(%id, fields = summary.field_count, "session snapshot restored");
    Ok(summary)
  }

  /// Remove one snapshot regardless of scope. Explicit deletion is the only
  /// way critical and manual snapshots go away.
  pub fn delete_snapshot(&self, id: Uuid) -> Result<(), BackupError> {
    if self.load_snapshot(id).is_none() {
      return Err(BackupError::NotFound(id));
    }
    self.store.remove(SNAPSHOT_NAMESPACE, &id.to_string());
    let mut index = self.load_index();
    index.retain(|entry| *entry != id);
    self.store_index(&index);
    info!(%id, "snapshot deleted");
    Ok(())
  }

  /// Delete evictable snapshots past the retention window and rebuild the
  /// index from the surviving records. Returns how many were removed.
  pub fn prune(&self) -> usize {
    let cutoff = Utc::now() - chrono::Duration::seconds(self.config.retention_secs as i64);
    let mut removed = 0usize;
    let mut live = Vec::new();
    for snapshot in self
      .store
      .list(SNAPSHOT_NAMESPACE)
      .iter()
      .filter_map(|r| r.decode::<Snapshot>().ok())
    {
      if snapshot.evictable() && snapshot.captured_at < cutoff {
        self.store.remove(SNAPSHOT_NAMESPACE, &snapshot.id.to_string());
        removed += 1;
      } else {
        live.push(snapshot);
      }
    }
    live.sort_by_key(|s| s.captured_at);
    let index: Vec<Uuid> = live.iter().map(|s| s.id).collect();
    self.store_index(&index);
    if removed > 0 {
      self.metrics.record_snapshots_evicted(removed as u64);
      info!(removed, "expired snapshots pruned");
    }
    removed
  }

  /// Bundle every stored snapshot for download or transfer.
  pub fn export_backups(&self) -> BackupExport {
    let mut snapshots = self.snapshots();
    snapshots.reverse();
    BackupExport {
      exported_at: Utc::now(),
      snapshots,
    }
  }

  /// Capture on lifecycle triggers and the periodic timer; prune runs
  /// opportunistically before each periodic capture.
  pub fn spawn_worker(&self) -> JoinHandle<()> {
    let manager = self.clone();
    tokio::spawn(async move {
      let mut events = manager.events.subscribe();
      let period = StdDuration::from_secs(manager.config.periodic_interval_secs.max(1));
      let mut ticker = tokio::time::interval(period);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      // The interval fires immediately once; a capture at startup would
      // only duplicate what recovery just offered
      ticker.tick().await;
      loop {
        let trigger = tokio::select! {
          event = events.recv() => match event {
            Ok(LifecycleEvent::Hidden) => Some(BackupTrigger::VisibilityChange),
            Ok(LifecycleEvent::Suspend) => Some(BackupTrigger::Suspend),
            Ok(LifecycleEvent::AppError) => Some(BackupTrigger::Error),
            Ok(_) => None,
            Err(RecvError::Lagged(missed)) => {
              warn!(missed, "backup worker lagged behind lifecycle events");
              None
            }
            Err(RecvError::Closed) => return,
          },
          _ = ticker.tick() => {
            manager.prune();
            Some(BackupTrigger::Periodic)
          }
        };
        if let Some(trigger) = trigger {
          if let Err(e) = manager.capture(trigger) {
            warn!(?trigger, error = %e, "session capture failed");
          }
        }
      }
    })
  }

  fn load_snapshot(&self, id: Uuid) -> Option<Snapshot> {
    self.store.get_json(SNAPSHOT_NAMESPACE, &id.to_string())
  }

  fn load_index(&self) -> Vec<Uuid> {
    self
      .store
      .get_json(META_NAMESPACE, INDEX_KEY)
      .unwrap_or_default()
  }

  fn store_index(&self, index: &[Uuid]) {
    let outcome = self.store.put_json(META_NAMESPACE, INDEX_KEY, &index, true);
    if !outcome.persisted() {
      warn!("snapshot index could not be persisted");
    }
  }

  /// Shrink the index back under the cap by deleting the oldest evictable
  /// snapshots. Ids whose record no longer exists are dropped as repair.
  /// Protected snapshots are never deleted, even if that leaves the index
  /// over the cap.
  fn enforce_capacity(&self, index: &mut Vec<Uuid>) -> usize {
    let mut evicted = 0usize;
    while index.len() > self.config.max_snapshots {
      let mut removed_any = false;
      let mut i = 0;
      while i < index.len() {
        let id = index[i];
        match self.load_snapshot(id) {
          None => {
            index.remove(i);
            removed_any = true;
            break;
          }
          Some(snapshot) if snapshot.evictable() => {
            self.store.remove(SNAPSHOT_NAMESPACE, &id.to_string());
            index.remove(i);
            evicted += 1;
            removed_any = true;
            break;
          }
          Some(_) => i += 1,
        }
      }
      if !removed_any {
        warn!(
          len = index.len(),
          cap = self.config.max_snapshots,
          "snapshot index over cap but every snapshot is protected"
        );
        break;
      }
    }
    evicted
  }
}

impl Clone for BackupManager {
  fn clone(&self) -> Self {
    Self {
      store: Arc::clone(&self.store),
      source: Arc::clone(&self.source),
      events: Arc::clone(&self.events),
      notifier: Arc::clone(&self.notifier),
      config: self.config.clone(),
      metrics: Arc::clone(&self.metrics),
      filter: self.filter.clone(),
    }
  }
}

/// Keep only the newest `limit` entries.
fn bound_tail(entries: &mut Vec<String>, limit: usize) {
  if entries.len() > limit {
    let excess = entries.len() - limit;
    entries.drain(..excess);
  }
}
