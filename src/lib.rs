//! Offline-resilience toolkit for client applications.
//!
//! Four cooperating services keep a session usable when the network or the
//! primary store disappears:
//!
//! - [`storage::TieredStore`] writes through an ordered chain of backends
//!   (SQLite, flat files, memory) and falls back tier by tier on failure.
//! - [`cache::RequestCache`] serves network requests under five strategies
//!   (cache-first, network-first, stale-while-revalidate, cache-only,
//!   network-only) with per-partition TTLs and capacity trims.
//! - [`sync::SyncQueue`] persists outbound submissions write-ahead, retries
//!   them with exponential backoff, and parks dead letters for inspection.
//! - [`backup::BackupManager`] snapshots ambient session state on lifecycle
//!   triggers and offers the best snapshot back after a restart.
//!
//! Each service is constructed explicitly with its dependencies (store,
//! transport, event bus, metrics) so tests can swap any of them. [`Lifeboat`]
//! is the production wiring: it opens the default store, builds the HTTP
//! fetcher and transport, connects everything to one [`events::EventBus`] and
//! [`events::Notifier`], and runs the background workers until
//! [`Lifeboat::shutdown`].

pub mod backup;
pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod metrics;
pub mod storage;
pub mod sync;

pub use backup::{
  BackupExport, BackupManager, BackupReceipt, BackupScope, BackupTrigger, SessionSink,
  SessionSource, SessionState, Snapshot, SnapshotSummary,
};
pub use cache::{
  CacheSource, CachedResponse, Partition, RequestCache, RequestDescriptor, Strategy,
};
pub use config::Config;
pub use error::{BackupError, CacheError, FetchError, StorageError, SyncError};
pub use events::{EventBus, LifecycleEvent, Notification, Notifier};
pub use metrics::{Metrics, MetricsSnapshot};
pub use storage::TieredStore;
pub use sync::{EnqueueReceipt, FilePayload, SubmitOptions, SyncQueue, SyncScheduler};

use std::sync::Arc;
use std::time::Duration;

use color_eyre::Result;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::cache::HttpFetcher;
use crate::sync::HttpTransport;

/// Fully wired subsystem: tiered store, request cache, sync queue and backup
/// manager sharing one event bus, notifier and metrics set.
///
/// Dropping a `Lifeboat` aborts its background workers; call
/// [`Lifeboat::shutdown`] first to also capture a final suspend snapshot.
pub struct Lifeboat {
  store: Arc<TieredStore>,
  cache: RequestCache,
  queue: SyncQueue,
  backup: BackupManager,
  events: Arc<EventBus>,
  notifier: Arc<Notifier>,
  metrics: Arc<Metrics>,
  workers: Vec<JoinHandle<()>>,
}

impl Lifeboat {
  /// Open the default storage chain and start every service.
  ///
  /// Spawns the cache sweeper, the sync retry worker and the backup worker,
  /// so this must run inside a Tokio runtime. `source` is the host's view of
  /// the current session, polled on every backup trigger.
  pub fn start(config: Config, source: Arc<dyn SessionSource>) -> Result<Self> {
    Self::start_with_scheduler(config, source, None)
  }

  /// Like [`Lifeboat::start`], with a host scheduler that takes over
  /// deferred sync flushes (for platforms with their own background-task
  /// registration).
  pub fn start_with_scheduler(
    config: Config,
    source: Arc<dyn SessionSource>,
    scheduler: Option<Arc<dyn SyncScheduler>>,
  ) -> Result<Self> {
    let metrics = Arc::new(Metrics::new());
    let events = Arc::new(EventBus::new());
    let notifier = Arc::new(Notifier::new());
    let store = Arc::new(TieredStore::open_default(
      &config.storage,
      Arc::clone(&metrics),
    )?);

    let fetcher = Arc::new(HttpFetcher::new(Duration::from_secs(
      config.cache.request_timeout_secs,
    ))?);
    let transport = Arc::new(HttpTransport::new(Duration::from_secs(
      config.sync.request_timeout_secs,
    ))?);

    let cache = RequestCache::new(
      Arc::clone(&store),
      fetcher,
      Arc::clone(&events),
      config.cache,
      Arc::clone(&metrics),
    );
    let mut queue = SyncQueue::new(
      Arc::clone(&store),
      transport,
      Arc::clone(&events),
      Arc::clone(&notifier),
      config.sync,
      Arc::clone(&metrics),
    );
    if let Some(scheduler) = scheduler {
      queue = queue.with_scheduler(scheduler);
    }
    let backup = BackupManager::new(
      Arc::clone(&store),
      source,
      Arc::clone(&events),
      Arc::clone(&notifier),
      config.backup,
      Arc::clone(&metrics),
    );

    let workers = vec![
      cache.spawn_sweeper(),
      queue.spawn_worker(),
      backup.spawn_worker(),
    ];

    Ok(Self {
      store,
      cache,
      queue,
      backup,
      events,
      notifier,
      metrics,
      workers,
    })
  }

  /// Capture a final suspend snapshot and stop the background workers.
  ///
  /// Idempotent. The snapshot is best-effort: a failure is logged, never
  /// surfaced, because teardown must not be blockable.
  pub fn shutdown(&mut self) {
    if self.workers.is_empty() {
      return;
    }
    if let Err(e) = self.backup.capture(BackupTrigger::Suspend) {
      warn!(error = %e, "final suspend snapshot failed");
    }
    for worker in self.workers.drain(..) {
      worker.abort();
    }
  }

  pub fn store(&self) -> &TieredStore {
    &self.store
  }

  pub fn cache(&self) -> &RequestCache {
    &self.cache
  }

  pub fn queue(&self) -> &SyncQueue {
    &self.queue
  }

  pub fn backup(&self) -> &BackupManager {
    &self.backup
  }

  /// Bus the host feeds connectivity and lifecycle signals into.
  pub fn events(&self) -> &Arc<EventBus> {
    &self.events
  }

  /// Bus the host reads delivery and recovery notifications from.
  pub fn notifier(&self) -> &Arc<Notifier> {
    &self.notifier
  }

  pub fn metrics(&self) -> &Metrics {
    &self.metrics
  }

  /// Announce the best recovery candidate, if any. Subscribe to the
  /// notifier first; the offer is also broadcast as
  /// [`Notification::RecoveryAvailable`].
  pub fn offer_recovery(&self) -> Option<SnapshotSummary> {
    self.backup.offer_recovery()
  }
}

impl Drop for Lifeboat {
  fn drop(&mut self) {
    for worker in self.workers.drain(..) {
      worker.abort();
    }
  }
}
