//! Counter set shared by all components.
//!
//! One [`Metrics`] instance is injected into every service so instrumentation
//! stays decoupled from the implementations. Nothing behavioral reads these
//! counters; they exist for logging, tests, and the inspection CLI.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Shared counters. All methods are lock-free and callable from any task.
#[derive(Debug, Default)]
pub struct Metrics {
  cache_hits: AtomicU64,
  cache_misses: AtomicU64,
  cache_evictions: AtomicU64,
  degraded_writes: AtomicU64,
  volatile_writes: AtomicU64,
  failed_writes: AtomicU64,
  emergency_evictions: AtomicU64,
  sync_attempts: AtomicU64,
  sync_deliveries: AtomicU64,
  sync_failures: AtomicU64,
  dead_letters: AtomicU64,
  snapshots_captured: AtomicU64,
  snapshots_restored: AtomicU64,
  snapshots_evicted: AtomicU64,
}

impl Metrics {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn record_cache_hit(&self) {
    self.cache_hits.fetch_add(1, Ordering::Relaxed);
  }

  pub fn record_cache_miss(&self) {
    self.cache_misses.fetch_add(1, Ordering::Relaxed);
  }

  pub fn record_cache_evictions(&self, count: u64) {
    self.cache_evictions.fetch_add(count, Ordering::Relaxed);
  }

  pub fn record_degraded_write(&self) {
    self.degraded_writes.fetch_add(1, Ordering::Relaxed);
  }

  pub fn record_volatile_write(&self) {
    self.volatile_writes.fetch_add(1, Ordering::Relaxed);
  }

  pub fn record_failed_write(&self) {
    self.failed_writes.fetch_add(1, Ordering::Relaxed);
  }

  pub fn record_emergency_eviction(&self, count: u64) {
    self.emergency_evictions.fetch_add(count, Ordering::Relaxed);
  }

  pub fn record_sync_attempt(&self) {
    self.sync_attempts.fetch_add(1, Ordering::Relaxed);
  }

  pub fn record_sync_delivery(&self) {
    self.sync_deliveries.fetch_add(1, Ordering::Relaxed);
  }

  pub fn record_sync_failure(&self) {
    self.sync_failures.fetch_add(1, Ordering::Relaxed);
  }

  pub fn record_dead_letter(&self) {
    self.dead_letters.fetch_add(1, Ordering::Relaxed);
  }

  pub fn record_snapshot_captured(&self) {
    self.snapshots_captured.fetch_add(1, Ordering::Relaxed);
  }

  pub fn record_snapshot_restored(&self) {
    self.snapshots_restored.fetch_add(1, Ordering::Relaxed);
  }

  pub fn record_snapshots_evicted(&self, count: u64) {
    self.snapshots_evicted.fetch_add(count, Ordering::Relaxed);
  }

  /// Copy the current counter values.
  pub fn snapshot(&self) -> MetricsSnapshot {
    MetricsSnapshot {
      cache_hits: self.cache_hits.load(Ordering::Relaxed),
      cache_misses: self.cache_misses.load(Ordering::Relaxed),
      cache_evictions: self.cache_evictions.load(Ordering::Relaxed),
      degraded_writes: self.degraded_writes.load(Ordering::Relaxed),
      volatile_writes: self.volatile_writes.load(Ordering::Relaxed),
      failed_writes: self.failed_writes.load(Ordering::Relaxed),
      emergency_evictions: self.emergency_evictions.load(Ordering::Relaxed),
      sync_attempts: self.sync_attempts.load(Ordering::Relaxed),
      sync_deliveries: self.sync_deliveries.load(Ordering::Relaxed),
      sync_failures: self.sync_failures.load(Ordering::Relaxed),
      dead_letters: self.dead_letters.load(Ordering::Relaxed),
      snapshots_captured: self.snapshots_captured.load(Ordering::Relaxed),
      snapshots_restored: self.snapshots_restored.load(Ordering::Relaxed),
      snapshots_evicted: self.snapshots_evicted.load(Ordering::Relaxed),
    }
  }
}

/// Point-in-time view of every counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
  pub cache_hits: u64,
  pub cache_misses: u64,
  pub cache_evictions: u64,
  pub degraded_writes: u64,
  pub volatile_writes: u64,
  pub failed_writes: u64,
  pub emergency_evictions: u64,
  pub sync_attempts: u64,
  pub sync_deliveries: u64,
  pub sync_failures: u64,
  pub dead_letters: u64,
  pub snapshots_captured: u64,
  pub snapshots_restored: u64,
  pub snapshots_evicted: u64,
}
