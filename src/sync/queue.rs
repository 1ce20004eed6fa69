//! The durable retry queue.
//!
//! Accepted submissions are written to storage before the first delivery
//! attempt, so nothing the user handed over is lost to a crash or a dead
//! network. Deliveries run concurrently across items but strictly
//! sequentially per item; failures back off exponentially until the retry
//! budget is spent and the item moves to the dead-letter namespace.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use chrono::Utc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use super::item::{
  retry_delay, DeadLetter, EnqueueReceipt, FilePayload, SubmitOptions, SyncItem, SyncKind,
};
use super::transport::{parse_method, Transport};
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::events::{EventBus, LifecycleEvent, Notification, Notifier};
use crate::metrics::Metrics;
use crate::storage::TieredStore;

const PENDING_NAMESPACE: &str = "sync:pending";
const DEAD_NAMESPACE: &str = "sync:dead";

/// Hook into a host-level deferred execution facility (the analog of a
/// background sync registration). When present, the queue asks it to
/// schedule a flush for parked items; when absent or refused, the interval
/// sweep in [`SyncQueue::spawn_worker`] covers the same ground, just with
/// coarser timing.
pub trait SyncScheduler: Send + Sync {
  /// Ask the host to invoke a flush once conditions allow. `tag` groups
  /// items of one kind so the host can coalesce registrations. Returns
  /// false when the facility is unavailable.
  fn request_flush(&self, tag: &str) -> bool;
}

enum AttemptOutcome {
  Delivered,
  Retrying,
  Exhausted,
  /// Another task is mid-attempt on this item.
  Busy,
  /// The item disappeared from storage while the attempt ran.
  Gone,
}

pub struct SyncQueue {
  store: Arc<TieredStore>,
  transport: Arc<dyn Transport>,
  events: Arc<EventBus>,
  notifier: Arc<Notifier>,
  config: SyncConfig,
  metrics: Arc<Metrics>,
  in_flight: Arc<Mutex<HashSet<Uuid>>>,
  scheduler: Option<Arc<dyn SyncScheduler>>,
}

impl SyncQueue {
  pub fn new(
    store: Arc<TieredStore>,
    transport: Arc<dyn Transport>,
    events: Arc<EventBus>,
    notifier: Arc<Notifier>,
    config: SyncConfig,
    metrics: Arc<Metrics>,
  ) -> Self {
    Self {
      store,
      transport,
      events,
      notifier,
      config,
      metrics,
      in_flight: Arc::new(Mutex::new(HashSet::new())),
      scheduler: None,
    }
  }

  /// Attach a host scheduler for deferred flushes.
  pub fn with_scheduler(mut self, scheduler: Arc<dyn SyncScheduler>) -> Self {
    self.scheduler = Some(scheduler);
    self
  }

  /// Queue a form post for delivery.
  pub async fn enqueue_form(
    &self,
    target: &str,
    label: &str,
    fields: serde_json::Value,
  ) -> Result<EnqueueReceipt, SyncError> {
    self
      .enqueue_form_with(target, label, fields, SubmitOptions::default())
      .await
  }

  /// Queue a form post with per-submission overrides.
  pub async fn enqueue_form_with(
    &self,
    target: &str,
    label: &str,
    fields: serde_json::Value,
    options: SubmitOptions,
  ) -> Result<EnqueueReceipt, SyncError> {
    self
      .enqueue(SyncItem::form(target, label, fields), options)
      .await
  }

  /// Queue a file upload for delivery.
  pub async fn enqueue_upload(
    &self,
    target: &str,
    label: &str,
    files: Vec<FilePayload>,
    fields: serde_json::Value,
  ) -> Result<EnqueueReceipt, SyncError> {
    self
      .enqueue_upload_with(target, label, files, fields, SubmitOptions::default())
      .await
  }

  /// Queue a file upload with per-submission overrides.
  pub async fn enqueue_upload_with(
    &self,
    target: &str,
    label: &str,
    files: Vec<FilePayload>,
    fields: serde_json::Value,
    options: SubmitOptions,
  ) -> Result<EnqueueReceipt, SyncError> {
    if files.is_empty() {
      return Err(SyncError::InvalidSubmission(
        "upload needs at least one file".to_string(),
      ));
    }
    if files.iter().any(|f| f.filename.is_empty()) {
      return Err(SyncError::InvalidSubmission(
        "upload needs a filename".to_string(),
      ));
    }
    self
      .enqueue(SyncItem::upload(target, label, files, fields), options)
      .await
  }

  async fn enqueue(
    &self,
    mut item: SyncItem,
    options: SubmitOptions,
  ) -> Result<EnqueueReceipt, SyncError> {
    Url::parse(&item.target)
      .map_err(|e| SyncError::InvalidSubmission(format!("target {:?}: {e}", item.target)))?;
    if let Some(method) = options.method {
      item.method = method.trim().to_uppercase();
    }
    parse_method(&item.method).map_err(|e| SyncError::InvalidSubmission(e.to_string()))?;
    item.max_attempts = options.max_attempts.unwrap_or(self.config.max_attempts);

    let id = item.id;
    let label = item.label.clone();
    let tag = item.tag.clone();
    // Write-ahead: the submission must survive a crash from here on
    let outcome = self
      .store
      .put_json(PENDING_NAMESPACE, &id.to_string(), &item, true);
    if !outcome.persisted() {
      return Err(SyncError::Persist(format!(
        "submission {id} rejected by every storage tier"
      )));
    }
    info!(%id, kind = ?item.kind, target = %item.target, "submission queued");

    if self.events.is_online() {
      match self.attempt(id).await {
        AttemptOutcome::Delivered => return Ok(EnqueueReceipt { id, delivered: true }),
        AttemptOutcome::Retrying => {
          self.notifier.emit(Notification::SyncMessage {
            message: format!("{label} delivery failed, retrying in the background"),
          });
          self.spawn_drive(id);
        }
        AttemptOutcome::Exhausted | AttemptOutcome::Busy | AttemptOutcome::Gone => {}
      }
    } else {
      self.notifier.emit(Notification::SyncMessage {
        message: format!("{label} saved offline"),
      });
      self.request_deferred_flush(&tag);
    }
    Ok(EnqueueReceipt {
      id,
      delivered: false,
    })
  }

  /// One delivery attempt plus its bookkeeping. The in-flight set makes
  /// attempts per item strictly sequential even when several drivers race,
  /// and the item is re-read after the claim so one driver never acts on a
  /// snapshot another driver already advanced.
  async fn attempt(&self, id: Uuid) -> AttemptOutcome {
    if !self.begin(id) {
      return AttemptOutcome::Busy;
    }
    let Some(mut item) = self.load_pending(id) else {
      self.end(id);
      return AttemptOutcome::Gone;
    };
    if !item.ready(Utc::now()) {
      // A racing driver failed this item first and scheduled the backoff
      self.end(id);
      return AttemptOutcome::Retrying;
    }
    if item.attempts >= item.max_attempts {
      // An earlier burial did not stick; retry it instead of delivering
      self.bury(&item);
      self.end(id);
      return AttemptOutcome::Exhausted;
    }

    self.metrics.record_sync_attempt();
    let result = self.transport.deliver(&item).await;

    let outcome = match result {
      Ok(()) => {
        self.store.remove(PENDING_NAMESPACE, &id.to_string());
        self.metrics.record_sync_delivery();
        info!(%id, label = %item.label, attempt = item.attempts + 1, "submission delivered");
        self.notifier.emit(match item.kind {
          SyncKind::Form => Notification::SubmissionSuccess {
            id,
            label: item.label.clone(),
          },
          SyncKind::Upload => Notification::UploadSuccess {
            id,
            label: item.label.clone(),
          },
        });
        AttemptOutcome::Delivered
      }
      Err(e) => {
        self.metrics.record_sync_failure();
        if self.load_pending(id).is_none() {
          // Cancelled (or delivered elsewhere) while this attempt ran;
          // rescheduling would resurrect it
          debug!(%id, "item vanished mid-attempt, dropping bookkeeping");
          AttemptOutcome::Gone
        } else {
          item.attempts += 1;
          item.last_error = Some(e.to_string());
          if item.attempts >= item.max_attempts {
            if !self.bury(&item) {
              // Keep the spent budget on record so a later sweep can
              // retry the burial
              self
                .store
                .put_json(PENDING_NAMESPACE, &id.to_string(), &item, true);
            }
            AttemptOutcome::Exhausted
          } else {
            let delay = retry_delay(item.attempts, &self.config);
            item.next_attempt_at = Some(
              Utc::now()
                + chrono::Duration::from_std(delay)
                  .unwrap_or_else(|_| chrono::Duration::seconds(30)),
            );
            warn!(
              %id,
              attempts = item.attempts,
              next_in_ms = delay.as_millis() as u64,
              error = %e,
              "delivery failed, retry scheduled"
            );
            self
              .store
              .put_json(PENDING_NAMESPACE, &id.to_string(), &item, true);
            AttemptOutcome::Retrying
          }
        }
      }
    };
    self.end(id);
    outcome
  }

  /// Move an exhausted item to the dead-letter namespace and tell the host.
  /// The dead letter is written before the pending record is removed, so a
  /// submission is never lost to a half-finished move. Returns false when
  /// no tier took the dead letter; the item stays pending in that case.
  fn bury(&self, item: &SyncItem) -> bool {
    let id = item.id;
    let attempts = item.attempts;
    let label = item.label.clone();

    let dead = DeadLetter {
      item: item.clone(),
      failed_at: Utc::now(),
    };
    let outcome = self.store.put_json(DEAD_NAMESPACE, &id.to_string(), &dead, true);
    if !outcome.persisted() {
      warn!(%id, "dead letter rejected by every storage tier, keeping the item pending");
      return false;
    }
    self.store.remove(PENDING_NAMESPACE, &id.to_string());
    warn!(%id, %label, attempts, "retry budget exhausted, moved to dead letters");
    self.metrics.record_dead_letter();
    self.notifier.emit(match item.kind {
      SyncKind::Form => Notification::SubmissionFailure { id, label, attempts },
      SyncKind::Upload => Notification::UploadFailure { id, label, attempts },
    });
    true
  }

  /// Retry loop for one item. Exits when the item resolves, when the host
  /// goes offline (the worker resumes it on reconnect), or when another
  /// driver owns the attempt.
  async fn drive(self, id: Uuid) {
    loop {
      let Some(item) = self.load_pending(id) else {
        return;
      };
      let now = Utc::now();
      if let Some(due) = item.next_attempt_at {
        if due > now {
          let wait = (due - now).to_std().unwrap_or(StdDuration::ZERO);
          tokio::time::sleep(wait).await;
          continue;
        }
      }
      if !self.events.is_online() {
        debug!(%id, "offline, parking retries until connectivity returns");
        return;
      }
      match self.attempt(id).await {
        AttemptOutcome::Retrying => continue,
        _ => return,
      }
    }
  }

  fn spawn_drive(&self, id: Uuid) {
    let queue = self.clone();
    tokio::spawn(async move {
      queue.drive(id).await;
    });
  }

  /// Start a delivery driver for every due pending item, oldest first.
  /// Returns how many drivers were started.
  pub fn flush(&self) -> usize {
    let now = Utc::now();
    let mut started = 0;
    for item in self.pending() {
      if item.ready(now) {
        self.spawn_drive(item.id);
        started += 1;
      }
    }
    if started > 0 {
      debug!(started, "flush started deliveries");
    }
    started
  }

  /// Listen for connectivity and sweep the queue on an interval. The first
  /// sweep runs immediately so items persisted by a previous process get
  /// picked up at startup.
  pub fn spawn_worker(&self) -> JoinHandle<()> {
    let queue = self.clone();
    tokio::spawn(async move {
      let mut events = queue.events.subscribe();
      let period = StdDuration::from_secs(queue.config.sweep_interval_secs.max(1));
      let mut ticker = tokio::time::interval(period);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      loop {
        tokio::select! {
          event = events.recv() => match event {
            Ok(LifecycleEvent::Online) => {
              info!("connectivity restored, flushing sync queue");
              queue.flush();
            }
            Ok(_) => {}
            Err(RecvError::Lagged(missed)) => {
              warn!(missed, "sync worker lagged behind lifecycle events");
            }
            Err(RecvError::Closed) => return,
          },
          _ = ticker.tick() => {
            if queue.events.is_online() {
              queue.flush();
            }
          }
        }
      }
    })
  }

  /// Pending items in enqueue order.
  pub fn pending(&self) -> Vec<SyncItem> {
    let mut items: Vec<SyncItem> = self
      .store
      .list(PENDING_NAMESPACE)
      .iter()
      .filter_map(|r| r.decode::<SyncItem>().ok())
      .collect();
    items.sort_by_key(|i| i.created_at);
    items
  }

  /// Exhausted items, oldest failure first.
  pub fn dead_letters(&self) -> Vec<DeadLetter> {
    let mut items: Vec<DeadLetter> = self
      .store
      .list(DEAD_NAMESPACE)
      .iter()
      .filter_map(|r| r.decode::<DeadLetter>().ok())
      .collect();
    items.sort_by_key(|d| d.failed_at);
    items
  }

  /// Move a dead letter back into the pending queue with its attempt count
  /// reset and start delivering if online. The item keeps the retry budget
  /// it was enqueued with.
  pub fn requeue_dead_letter(&self, id: Uuid) -> Result<(), SyncError> {
    let key = id.to_string();
    let dead: DeadLetter = self
      .store
      .get_json(DEAD_NAMESPACE, &key)
      .ok_or(SyncError::NotFound(id))?;

    let mut item = dead.item;
    item.attempts = 0;
    item.last_error = None;
    item.next_attempt_at = None;

    let outcome = self.store.put_json(PENDING_NAMESPACE, &key, &item, true);
    if !outcome.persisted() {
      return Err(SyncError::Persist(format!(
        "requeued item {id} rejected by every storage tier"
      )));
    }
    self.store.remove(DEAD_NAMESPACE, &key);
    info!(%id, "dead letter requeued");
    if self.events.is_online() {
      self.spawn_drive(id);
    }
    Ok(())
  }

  /// Drop one dead letter without requeueing it.
  pub fn clear_dead_letter(&self, id: Uuid) -> Result<(), SyncError> {
    let key = id.to_string();
    if self.store.get(DEAD_NAMESPACE, &key).is_none() {
      return Err(SyncError::NotFound(id));
    }
    self.store.remove(DEAD_NAMESPACE, &key);
    info!(%id, "dead letter discarded");
    Ok(())
  }

  /// Drop all dead letters. Returns how many were removed.
  pub fn clear_dead_letters(&self) -> usize {
    let count = self.store.count(DEAD_NAMESPACE);
    self.store.clear_namespace(DEAD_NAMESPACE);
    if count > 0 {
      info!(count, "dead letters cleared");
    }
    count
  }

  /// Remove a pending item before it is delivered.
  pub fn cancel(&self, id: Uuid) -> Result<(), SyncError> {
    let key = id.to_string();
    if self.store.get(PENDING_NAMESPACE, &key).is_none() {
      return Err(SyncError::NotFound(id));
    }
    self.store.remove(PENDING_NAMESPACE, &key);
    info!(%id, "queued submission cancelled");
    Ok(())
  }

  fn load_pending(&self, id: Uuid) -> Option<SyncItem> {
    self.store.get_json(PENDING_NAMESPACE, &id.to_string())
  }

  fn request_deferred_flush(&self, tag: &str) {
    if let Some(scheduler) = &self.scheduler {
      if scheduler.request_flush(tag) {
        debug!(tag, "deferred flush registered with host scheduler");
        return;
      }
    }
    debug!(tag, "no deferred-flush facility; interval sweep will pick the item up");
  }

  fn begin(&self, id: Uuid) -> bool {
    match self.in_flight.lock() {
      Ok(mut guard) => guard.insert(id),
      // Poisoned guard set: refuse new attempts rather than risk doubles
      Err(_) => false,
    }
  }

  fn end(&self, id: Uuid) {
    if let Ok(mut guard) = self.in_flight.lock() {
      guard.remove(&id);
    }
  }
}

impl Clone for SyncQueue {
  fn clone(&self) -> Self {
    Self {
      store: Arc::clone(&self.store),
      transport: Arc::clone(&self.transport),
      events: Arc::clone(&self.events),
      notifier: Arc::clone(&self.notifier),
      config: self.config.clone(),
      metrics: Arc::clone(&self.metrics),
      in_flight: Arc::clone(&self.in_flight),
      scheduler: self.scheduler.clone(),
    }
  }
}
