//! The strategy engine: decides cache vs network per request and keeps the
//! partitions within policy.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::identity::{self, RequestDescriptor};
use super::{CacheEntry, CachedResponse, Fetcher, FetchedResponse, Partition, Strategy};
use crate::config::{CacheConfig, PartitionPolicy};
use crate::error::{CacheError, FetchError};
use crate::events::EventBus;
use crate::metrics::Metrics;
use crate::storage::TieredStore;

const META_NAMESPACE: &str = "cache:meta";
const VERSION_KEY: &str = "version";

/// Serves requests through the configured strategy, persisting responses in
/// per-partition namespaces of the tiered store.
///
/// Construction checks the version stamp: when the configured cache version
/// differs from the persisted one, every partition is purged before anything
/// is served. Entries written under an old deployment never leak into a new
/// one.
pub struct RequestCache {
  store: Arc<TieredStore>,
  fetcher: Arc<dyn Fetcher>,
  events: Arc<EventBus>,
  config: CacheConfig,
  metrics: Arc<Metrics>,
}

impl RequestCache {
  pub fn new(
    store: Arc<TieredStore>,
    fetcher: Arc<dyn Fetcher>,
    events: Arc<EventBus>,
    config: CacheConfig,
    metrics: Arc<Metrics>,
  ) -> Self {
    let cache = Self {
      store,
      fetcher,
      events,
      config,
      metrics,
    };
    cache.ensure_version();
    cache
  }

  /// Serve one request according to `strategy`.
  pub async fn handle(
    &self,
    request: &RequestDescriptor,
    partition: Partition,
    strategy: Strategy,
  ) -> Result<CachedResponse, CacheError> {
    let key = identity::cache_key(request);
    let response = match strategy {
      Strategy::CacheFirst => self.cache_first(partition, &key, request).await,
      Strategy::NetworkFirst => self.network_first(partition, &key, request).await,
      Strategy::StaleWhileRevalidate => {
        self.stale_while_revalidate(partition, &key, request).await
      }
      Strategy::NetworkOnly => self.network_only(request).await,
      Strategy::CacheOnly => self.cache_only(partition, &key, request),
    }?;
    debug!(
      url = %request.url,
      partition = %partition,
      strategy = %strategy,
      source = ?response.source,
      "request served"
    );
    Ok(response)
  }

  async fn cache_first(
    &self,
    partition: Partition,
    key: &str,
    request: &RequestDescriptor,
  ) -> Result<CachedResponse, CacheError> {
    if let Some(entry) = self.lookup(partition, key) {
      self.metrics.record_cache_hit();
      return Ok(CachedResponse::from_cache(entry, false));
    }
    self.metrics.record_cache_miss();
    self.fetch_and_fill(partition, key, request).await
  }

  async fn network_first(
    &self,
    partition: Partition,
    key: &str,
    request: &RequestDescriptor,
  ) -> Result<CachedResponse, CacheError> {
    let fetched = match self.ensure_online() {
      Ok(()) => self.fetcher.fetch(request).await,
      Err(e) => Err(e),
    };

    match fetched {
      Ok(fetched) => {
        self.write_through(partition, key, request, &fetched);
        Ok(CachedResponse::from_network(fetched))
      }
      Err(e) => match self.lookup(partition, key) {
        Some(entry) => {
          self.metrics.record_cache_hit();
          debug!(url = %request.url, error = %e, "network path failed, serving cached fallback");
          Ok(CachedResponse::offline(entry))
        }
        None => {
          self.metrics.record_cache_miss();
          Err(e.into())
        }
      },
    }
  }

  async fn stale_while_revalidate(
    &self,
    partition: Partition,
    key: &str,
    request: &RequestDescriptor,
  ) -> Result<CachedResponse, CacheError> {
    if let Some(entry) = self.lookup(partition, key) {
      self.metrics.record_cache_hit();
      if self.events.is_online() {
        self.spawn_revalidate(partition, key.to_string(), request.clone());
      }
      return Ok(CachedResponse::from_cache(entry, true));
    }
    self.metrics.record_cache_miss();
    self.fetch_and_fill(partition, key, request).await
  }

  async fn network_only(&self, request: &RequestDescriptor) -> Result<CachedResponse, CacheError> {
    self.ensure_online()?;
    let fetched = self.fetcher.fetch(request).await?;
    Ok(CachedResponse::from_network(fetched))
  }

  fn cache_only(
    &self,
    partition: Partition,
    key: &str,
    request: &RequestDescriptor,
  ) -> Result<CachedResponse, CacheError> {
    match self.lookup(partition, key) {
      Some(entry) => {
        self.metrics.record_cache_hit();
        Ok(CachedResponse::from_cache(entry, false))
      }
      None => {
        self.metrics.record_cache_miss();
        Err(CacheError::Miss(identity::normalize(&request.url)))
      }
    }
  }

  fn ensure_online(&self) -> Result<(), FetchError> {
    if self.events.is_online() {
      Ok(())
    } else {
      Err(FetchError::Network("host reports offline".to_string()))
    }
  }

  async fn fetch_and_fill(
    &self,
    partition: Partition,
    key: &str,
    request: &RequestDescriptor,
  ) -> Result<CachedResponse, CacheError> {
    self.ensure_online()?;
    let fetched = self.fetcher.fetch(request).await?;
    self.write_through(partition, key, request, &fetched);
    Ok(CachedResponse::from_network(fetched))
  }

  /// Look up a servable entry. Expired or undecodable entries count as
  /// absent and are deleted on the spot.
  fn lookup(&self, partition: Partition, key: &str) -> Option<CacheEntry> {
    let namespace = partition.namespace();
    let record = self.store.get(namespace, key)?;
    let entry: CacheEntry = match record.decode() {
      Ok(entry) => entry,
      Err(e) => {
        warn!(partition = %partition, key, error = %e, "dropping undecodable cache entry");
        self.store.remove(namespace, key);
        return None;
      }
    };
    if entry.is_expired(Utc::now()) {
      debug!(partition = %partition, key, "entry past its TTL, deleting");
      self.store.remove(namespace, key);
      return None;
    }
    Some(entry)
  }

  /// Persist a fetched response and trim the partition to capacity. The fill
  /// is best-effort: the response already left for the caller, so a failed
  /// write only costs a future cache hit.
  fn write_through(
    &self,
    partition: Partition,
    key: &str,
    request: &RequestDescriptor,
    fetched: &FetchedResponse,
  ) {
    let policy = partition.policy(&self.config.partitions);
    let now = Utc::now();
    let entry = CacheEntry {
      url: identity::normalize(&request.url),
      status: fetched.status,
      content_type: fetched.content_type.clone(),
      body: fetched.body.clone(),
      cached_at: now,
      expires_at: now + policy.ttl(),
    };
    let outcome = self.store.put_json(partition.namespace(), key, &entry, false);
    if !outcome.persisted() {
      warn!(partition = %partition, key, "cache fill failed on every tier");
      return;
    }
    self.trim_partition(partition, policy);
  }

  /// Evict the oldest entries beyond the partition's capacity. Returns how
  /// many were evicted.
  fn trim_partition(&self, partition: Partition, policy: PartitionPolicy) -> usize {
    let namespace = partition.namespace();
    let mut records = self.store.list(namespace);
    if records.len() <= policy.max_entries {
      return 0;
    }
    records.sort_by_key(|r| r.stored_at);
    let excess = records.len() - policy.max_entries;
    for record in records.iter().take(excess) {
      self.store.remove(namespace, &record.key);
    }
    self.metrics.record_cache_evictions(excess as u64);
    debug!(partition = %partition, evicted = excess, "trimmed partition to capacity");
    excess
  }

  fn spawn_revalidate(&self, partition: Partition, key: String, request: RequestDescriptor) {
    let cache = self.clone();
    tokio::spawn(async move {
      match cache.fetcher.fetch(&request).await {
        Ok(fetched) => {
          // A purge or eviction that raced the fetch wins; do not
          // resurrect an entry that was deliberately removed.
          if cache.store.get(partition.namespace(), &key).is_none() {
            debug!(partition = %partition, key, "entry vanished mid-revalidation, dropping result");
            return;
          }
          cache.write_through(partition, &key, &request, &fetched);
        }
        Err(e) => {
          debug!(partition = %partition, url = %request.url, error = %e, "background revalidation failed");
        }
      }
    });
  }

  /// Delete every expired entry across all partitions, then trim each
  /// partition back under its entry cap. Returns how many entries were
  /// removed. Runs periodically; lazy deletion at lookup time covers
  /// entries touched between sweeps, but only the sweep reconverges a
  /// partition whose cap was lowered.
  pub fn sweep(&self) -> usize {
    let now = Utc::now();
    let mut removed = 0;
    for partition in Partition::ALL {
      let namespace = partition.namespace();
      for record in self.store.list(namespace) {
        let expired = match record.decode::<CacheEntry>() {
          Ok(entry) => entry.is_expired(now),
          // Undecodable entries can never be served; sweep them too
          Err(_) => true,
        };
        if expired {
          self.store.remove(namespace, &record.key);
          removed += 1;
        }
      }
      removed += self.trim_partition(partition, partition.policy(&self.config.partitions));
    }
    if removed > 0 {
      debug!(removed, "sweep removed entries");
    }
    removed
  }

  /// Run the expiry sweep on its configured interval until the task is
  /// aborted.
  pub fn spawn_sweeper(&self) -> JoinHandle<()> {
    let cache = self.clone();
    tokio::spawn(async move {
      let period = StdDuration::from_secs(cache.config.sweep_interval_secs.max(1));
      let mut ticker = tokio::time::interval(period);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      // The first tick fires immediately; skip it so construction-time
      // version purging is not followed by a redundant sweep.
      ticker.tick().await;
      loop {
        ticker.tick().await;
        cache.sweep();
      }
    })
  }

  /// Drop every cached response while keeping the version stamp.
  pub fn purge_all(&self) {
    for partition in Partition::ALL {
      self.store.clear_namespace(partition.namespace());
    }
    info!("purged all cache partitions");
  }

  /// Entry counts per partition, for diagnostics.
  pub fn partition_counts(&self) -> Vec<(Partition, usize)> {
    Partition::ALL
      .iter()
      .map(|p| (*p, self.store.count(p.namespace())))
      .collect()
  }

  fn ensure_version(&self) {
    let stamped: Option<String> = self.store.get_json(META_NAMESPACE, VERSION_KEY);
    if stamped.as_deref() == Some(self.config.version.as_str()) {
      return;
    }
    info!(
      previous = ?stamped,
      version = %self.config.version,
      "cache version changed, purging all partitions"
    );
    for partition in Partition::ALL {
      self.store.clear_namespace(partition.namespace());
    }
    // The stamp is critical: losing it would force a purge on next start
    self
      .store
      .put_json(META_NAMESPACE, VERSION_KEY, &self.config.version, true);
  }
}

impl Clone for RequestCache {
  fn clone(&self) -> Self {
    Self {
      store: Arc::clone(&self.store),
      fetcher: Arc::clone(&self.fetcher),
      events: Arc::clone(&self.events),
      config: self.config.clone(),
      metrics: Arc::clone(&self.metrics),
    }
  }
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
  use std::sync::Mutex;

  use async_trait::async_trait;
  use url::Url;

  use super::*;
  use crate::cache::CacheSource;
  use crate::storage::MemoryTier;

  struct StubFetcher {
    calls: AtomicUsize,
    fail: AtomicBool,
    body: Mutex<Vec<u8>>,
    delay: Option<StdDuration>,
  }

  impl StubFetcher {
    fn new(body: &str) -> Arc<Self> {
      Arc::new(Self {
        calls: AtomicUsize::new(0),
        fail: AtomicBool::new(false),
        body: Mutex::new(body.as_bytes().to_vec()),
        delay: None,
      })
    }

    fn with_delay(body: &str, delay: StdDuration) -> Arc<Self> {
      Arc::new(Self {
        calls: AtomicUsize::new(0),
        fail: AtomicBool::new(false),
        body: Mutex::new(body.as_bytes().to_vec()),
        delay: Some(delay),
      })
    }

    fn set_body(&self, body: &str) {
      *self.body.lock().unwrap() = body.as_bytes().to_vec();
    }

    fn set_fail(&self, fail: bool) {
      self.fail.store(fail, Ordering::SeqCst);
    }

    fn calls(&self) -> usize {
      self.calls.load(Ordering::SeqCst)
    }
  }

  #[async_trait]
  impl Fetcher for StubFetcher {
    async fn fetch(&self, _request: &RequestDescriptor) -> Result<FetchedResponse, FetchError> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      if let Some(delay) = self.delay {
        tokio::time::sleep(delay).await;
      }
      if self.fail.load(Ordering::SeqCst) {
        return Err(FetchError::Network("stub is down".to_string()));
      }
      Ok(FetchedResponse {
        status: 200,
        content_type: Some("text/plain".to_string()),
        body: self.body.lock().unwrap().clone(),
      })
    }
  }

  struct Rig {
    cache: RequestCache,
    store: Arc<TieredStore>,
    events: Arc<EventBus>,
    metrics: Arc<Metrics>,
  }

  fn rig(fetcher: Arc<StubFetcher>) -> Rig {
    let metrics = Arc::new(Metrics::new());
    let store = Arc::new(TieredStore::new(
      vec![Box::new(MemoryTier::new())],
      Arc::clone(&metrics),
    ));
    let events = Arc::new(EventBus::new());
    let cache = RequestCache::new(
      Arc::clone(&store),
      fetcher,
      Arc::clone(&events),
      CacheConfig::default(),
      Arc::clone(&metrics),
    );
    Rig {
      cache,
      store,
      events,
      metrics,
    }
  }

  fn req(path: &str) -> RequestDescriptor {
    RequestDescriptor::get(Url::parse(&format!("https://app.example{path}")).unwrap())
  }

  fn plant_entry(
    store: &TieredStore,
    partition: Partition,
    target: &RequestDescriptor,
    body: &str,
    ttl_secs: i64,
  ) {
    let now = Utc::now();
    let entry = CacheEntry {
      url: identity::normalize(&target.url),
      status: 200,
      content_type: None,
      body: body.as_bytes().to_vec(),
      cached_at: now - chrono::Duration::minutes(1),
      expires_at: now + chrono::Duration::seconds(ttl_secs),
    };
    store.put_json(
      partition.namespace(),
      &identity::cache_key(target),
      &entry,
      false,
    );
  }

  #[tokio::test]
  async fn test_cache_first_fills_then_serves_from_cache() {
    let fetcher = StubFetcher::new("hello");
    let r = rig(Arc::clone(&fetcher));
    let target = req("/page");

    let first = r
      .cache
      .handle(&target, Partition::Static, Strategy::CacheFirst)
      .await
      .unwrap();
    assert_eq!(first.source, CacheSource::Network);

    let second = r
      .cache
      .handle(&target, Partition::Static, Strategy::CacheFirst)
      .await
      .unwrap();
    assert_eq!(second.source, CacheSource::CacheFresh);
    assert_eq!(second.body, b"hello".to_vec());
    assert_eq!(fetcher.calls(), 1);
    assert_eq!(r.metrics.snapshot().cache_hits, 1);
  }

  #[tokio::test]
  async fn test_cache_first_miss_offline_is_an_error() {
    let fetcher = StubFetcher::new("unreachable");
    let r = rig(Arc::clone(&fetcher));
    r.events.emit(crate::events::LifecycleEvent::Offline);

    let err = r
      .cache
      .handle(&req("/page"), Partition::Static, Strategy::CacheFirst)
      .await
      .unwrap_err();
    assert!(matches!(err, CacheError::Fetch(FetchError::Network(_))));
    // Offline is decided before any fetch is attempted
    assert_eq!(fetcher.calls(), 0);
  }

  #[tokio::test]
  async fn test_network_first_refreshes_cache() {
    let fetcher = StubFetcher::new("v1");
    let r = rig(Arc::clone(&fetcher));
    let target = req("/api/items");

    r.cache
      .handle(&target, Partition::Api, Strategy::NetworkFirst)
      .await
      .unwrap();
    fetcher.set_body("v2");

    let response = r
      .cache
      .handle(&target, Partition::Api, Strategy::NetworkFirst)
      .await
      .unwrap();
    assert_eq!(response.source, CacheSource::Network);
    assert_eq!(response.body, b"v2".to_vec());

    // The refresh also updated the cached copy
    let cached = r
      .cache
      .handle(&target, Partition::Api, Strategy::CacheOnly)
      .await
      .unwrap();
    assert_eq!(cached.body, b"v2".to_vec());
  }

  #[tokio::test]
  async fn test_network_first_falls_back_to_cache_on_failure() {
    let fetcher = StubFetcher::new("good");
    let r = rig(Arc::clone(&fetcher));
    let target = req("/api/items");

    r.cache
      .handle(&target, Partition::Api, Strategy::NetworkFirst)
      .await
      .unwrap();
    fetcher.set_fail(true);

    let response = r
      .cache
      .handle(&target, Partition::Api, Strategy::NetworkFirst)
      .await
      .unwrap();
    assert_eq!(response.source, CacheSource::OfflineFallback);
    assert_eq!(response.body, b"good".to_vec());
    assert!(response.cached_at.is_some());
  }

  #[tokio::test]
  async fn test_network_first_without_fallback_surfaces_the_error() {
    let fetcher = StubFetcher::new("never");
    fetcher.set_fail(true);
    let r = rig(Arc::clone(&fetcher));

    let err = r
      .cache
      .handle(&req("/api/fresh"), Partition::Api, Strategy::NetworkFirst)
      .await
      .unwrap_err();
    assert!(matches!(err, CacheError::Fetch(FetchError::Network(_))));
  }

  #[tokio::test]
  async fn test_network_only_skips_the_cache_entirely() {
    let fetcher = StubFetcher::new("live");
    let r = rig(Arc::clone(&fetcher));
    let target = req("/auth/session");

    let response = r
      .cache
      .handle(&target, Partition::Runtime, Strategy::NetworkOnly)
      .await
      .unwrap();
    assert_eq!(response.source, CacheSource::Network);

    // Nothing was stored
    assert_eq!(r.store.count(Partition::Runtime.namespace()), 0);
  }

  #[tokio::test]
  async fn test_cache_only_miss_is_an_error() {
    let fetcher = StubFetcher::new("x");
    let r = rig(Arc::clone(&fetcher));

    let err = r
      .cache
      .handle(&req("/missing"), Partition::Runtime, Strategy::CacheOnly)
      .await
      .unwrap_err();
    assert!(matches!(err, CacheError::Miss(_)));
    assert_eq!(fetcher.calls(), 0);
  }

  #[tokio::test]
  async fn test_expired_entry_is_absent_and_lazily_deleted() {
    let fetcher = StubFetcher::new("x");
    let r = rig(Arc::clone(&fetcher));
    let target = req("/old");
    plant_entry(&r.store, Partition::Runtime, &target, "ancient", -10);

    let err = r
      .cache
      .handle(&target, Partition::Runtime, Strategy::CacheOnly)
      .await
      .unwrap_err();
    assert!(matches!(err, CacheError::Miss(_)));

    // The lookup deleted the expired record
    let key = identity::cache_key(&target);
    assert!(r.store.get(Partition::Runtime.namespace(), &key).is_none());
  }

  #[tokio::test]
  async fn test_swr_serves_stale_and_revalidates_in_background() {
    let fetcher = StubFetcher::new("old");
    let r = rig(Arc::clone(&fetcher));
    let target = req("/feed");

    r.cache
      .handle(&target, Partition::Runtime, Strategy::CacheFirst)
      .await
      .unwrap();
    fetcher.set_body("new");

    let response = r
      .cache
      .handle(&target, Partition::Runtime, Strategy::StaleWhileRevalidate)
      .await
      .unwrap();
    assert_eq!(response.source, CacheSource::CacheStale);
    assert_eq!(response.body, b"old".to_vec());

    // Give the background refresh time to land
    tokio::time::sleep(StdDuration::from_millis(100)).await;
    assert_eq!(fetcher.calls(), 2);

    let refreshed = r
      .cache
      .handle(&target, Partition::Runtime, Strategy::CacheOnly)
      .await
      .unwrap();
    assert_eq!(refreshed.body, b"new".to_vec());
  }

  #[tokio::test]
  async fn test_swr_revalidation_respects_concurrent_removal() {
    let fetcher = StubFetcher::with_delay("late", StdDuration::from_millis(100));
    let r = rig(Arc::clone(&fetcher));
    let target = req("/feed");
    plant_entry(&r.store, Partition::Runtime, &target, "present", 3600);

    let response = r
      .cache
      .handle(&target, Partition::Runtime, Strategy::StaleWhileRevalidate)
      .await
      .unwrap();
    assert_eq!(response.body, b"present".to_vec());

    // Remove the entry while the background fetch is still sleeping
    let key = identity::cache_key(&target);
    r.store.remove(Partition::Runtime.namespace(), &key);

    tokio::time::sleep(StdDuration::from_millis(250)).await;
    assert_eq!(fetcher.calls(), 1);
    // The revalidation result was dropped, not resurrected
    assert!(r.store.get(Partition::Runtime.namespace(), &key).is_none());
  }

  #[tokio::test]
  async fn test_capacity_trim_evicts_oldest_beyond_max_entries() {
    let fetcher = StubFetcher::new("body");
    // Default api partition caps at 30 entries
    let r = rig(Arc::clone(&fetcher));

    for i in 0..35 {
      r.cache
        .handle(
          &req(&format!("/api/item/{i}")),
          Partition::Api,
          Strategy::CacheFirst,
        )
        .await
        .unwrap();
    }

    assert_eq!(r.store.count(Partition::Api.namespace()), 30);
    assert_eq!(r.metrics.snapshot().cache_evictions, 5);

    // The five oldest are gone, the newest survive
    for i in 0..5 {
      let err = r
        .cache
        .handle(
          &req(&format!("/api/item/{i}")),
          Partition::Api,
          Strategy::CacheOnly,
        )
        .await
        .unwrap_err();
      assert!(matches!(err, CacheError::Miss(_)), "item {i} should be evicted");
    }
    r.cache
      .handle(&req("/api/item/34"), Partition::Api, Strategy::CacheOnly)
      .await
      .unwrap();
  }

  #[tokio::test]
  async fn test_version_change_purges_every_partition() {
    let fetcher = StubFetcher::new("x");
    let r = rig(Arc::clone(&fetcher));
    r.cache
      .handle(&req("/a"), Partition::Static, Strategy::CacheFirst)
      .await
      .unwrap();
    r.cache
      .handle(&req("/b"), Partition::Api, Strategy::CacheFirst)
      .await
      .unwrap();

    let config = CacheConfig {
      version: "v2".to_string(),
      ..CacheConfig::default()
    };
    let _rebuilt = RequestCache::new(
      Arc::clone(&r.store),
      fetcher,
      Arc::clone(&r.events),
      config,
      Arc::clone(&r.metrics),
    );

    for partition in Partition::ALL {
      assert_eq!(r.store.count(partition.namespace()), 0, "{partition} not purged");
    }
    let stamp: String = r.store.get_json(META_NAMESPACE, VERSION_KEY).unwrap();
    assert_eq!(stamp, "v2");
  }

  #[tokio::test]
  async fn test_sweep_removes_expired_entries() {
    let fetcher = StubFetcher::new("x");
    let r = rig(Arc::clone(&fetcher));
    plant_entry(&r.store, Partition::Api, &req("/dead"), "gone", -5);
    plant_entry(&r.store, Partition::Api, &req("/alive"), "here", 3600);
    plant_entry(&r.store, Partition::Image, &req("/img.png"), "px", -5);

    let removed = r.cache.sweep();

    assert_eq!(removed, 2);
    assert_eq!(r.store.count(Partition::Api.namespace()), 1);
    assert_eq!(r.store.count(Partition::Image.namespace()), 0);
  }

  #[tokio::test]
  async fn test_sweep_trims_partitions_back_under_their_cap() {
    let fetcher = StubFetcher::new("x");
    // Default api partition caps at 30 entries
    let r = rig(Arc::clone(&fetcher));
    for i in 0..35 {
      plant_entry(
        &r.store,
        Partition::Api,
        &req(&format!("/api/item/{i}")),
        "fresh",
        3600,
      );
    }

    let removed = r.cache.sweep();

    assert_eq!(removed, 5);
    assert_eq!(r.store.count(Partition::Api.namespace()), 30);
    assert_eq!(r.metrics.snapshot().cache_evictions, 5);
    // The five oldest fell, the newest survive
    for i in 0..5 {
      let key = identity::cache_key(&req(&format!("/api/item/{i}")));
      assert!(
        r.store.get(Partition::Api.namespace(), &key).is_none(),
        "item {i} should be evicted"
      );
    }
    let newest = identity::cache_key(&req("/api/item/34"));
    assert!(r.store.get(Partition::Api.namespace(), &newest).is_some());
  }

  #[tokio::test]
  async fn test_fill_failure_still_serves_the_network_response() {
    let fetcher = StubFetcher::new("served anyway");
    let metrics = Arc::new(Metrics::new());
    let store = Arc::new(TieredStore::new(
      vec![Box::new(crate::storage::testing::FailingTier { label: "dead" })],
      Arc::clone(&metrics),
    ));
    let cache = RequestCache::new(
      store,
      fetcher,
      Arc::new(EventBus::new()),
      CacheConfig::default(),
      Arc::clone(&metrics),
    );

    let response = cache
      .handle(&req("/page"), Partition::Static, Strategy::CacheFirst)
      .await
      .unwrap();
    assert_eq!(response.source, CacheSource::Network);
    assert_eq!(response.body, b"served anyway".to_vec());
    assert!(metrics.snapshot().failed_writes >= 1);
  }
}
