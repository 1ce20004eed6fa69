//! Strategy-driven request cache.
//!
//! Responses are cached per partition (static assets, API data, images,
//! everything else), each with its own time-to-live and entry cap. A request
//! is served according to one of five strategies that trade freshness
//! against availability; every answer carries a [`CacheSource`] so callers
//! can tell fresh network data from a stale offline fallback.

mod engine;
mod fetcher;
mod identity;

pub use engine::RequestCache;
pub use fetcher::{FetchedResponse, Fetcher, HttpFetcher};
pub use identity::{cache_key, RequestDescriptor};

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{PartitionPolicies, PartitionPolicy};

/// Which bucket a response is cached in. Policies (TTL, capacity) are
/// attached per partition, not per entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Partition {
  /// Immutable application assets.
  Static,
  /// General runtime responses that fit nowhere else.
  Runtime,
  /// API responses; short-lived by design.
  Api,
  /// Images; long-lived and numerous.
  Image,
}

impl Partition {
  pub const ALL: [Partition; 4] = [
    Partition::Static,
    Partition::Runtime,
    Partition::Api,
    Partition::Image,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      Partition::Static => "static",
      Partition::Runtime => "runtime",
      Partition::Api => "api",
      Partition::Image => "image",
    }
  }

  /// Storage namespace backing this partition.
  pub fn namespace(&self) -> &'static str {
    match self {
      Partition::Static => "cache:static",
      Partition::Runtime => "cache:runtime",
      Partition::Api => "cache:api",
      Partition::Image => "cache:image",
    }
  }

  pub fn policy(&self, policies: &PartitionPolicies) -> PartitionPolicy {
    match self {
      Partition::Static => policies.static_assets,
      Partition::Runtime => policies.runtime,
      Partition::Api => policies.api,
      Partition::Image => policies.image,
    }
  }

  /// The strategy a router would pick for this partition when the caller
  /// has no opinion: immutable things cache-first, data network-first,
  /// everything else stale-while-revalidate.
  pub fn default_strategy(&self) -> Strategy {
    match self {
      Partition::Static => Strategy::CacheFirst,
      Partition::Image => Strategy::CacheFirst,
      Partition::Api => Strategy::NetworkFirst,
      Partition::Runtime => Strategy::StaleWhileRevalidate,
    }
  }
}

impl fmt::Display for Partition {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Partition {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "static" => Ok(Partition::Static),
      "runtime" => Ok(Partition::Runtime),
      "api" => Ok(Partition::Api),
      "image" => Ok(Partition::Image),
      other => Err(format!("unknown partition: {other}")),
    }
  }
}

/// How to answer one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
  /// Serve from cache when possible; fetch and fill on a miss.
  CacheFirst,
  /// Try the network; fall back to cache when it fails.
  NetworkFirst,
  /// Serve from cache immediately and refresh it in the background.
  StaleWhileRevalidate,
  /// Always fetch; never read or fill the cache.
  NetworkOnly,
  /// Only read the cache; a miss is an error.
  CacheOnly,
}

impl fmt::Display for Strategy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Strategy::CacheFirst => "cache-first",
      Strategy::NetworkFirst => "network-first",
      Strategy::StaleWhileRevalidate => "stale-while-revalidate",
      Strategy::NetworkOnly => "network-only",
      Strategy::CacheOnly => "cache-only",
    };
    f.write_str(name)
  }
}

impl FromStr for Strategy {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "cache-first" => Ok(Strategy::CacheFirst),
      "network-first" => Ok(Strategy::NetworkFirst),
      "stale-while-revalidate" | "swr" => Ok(Strategy::StaleWhileRevalidate),
      "network-only" => Ok(Strategy::NetworkOnly),
      "cache-only" => Ok(Strategy::CacheOnly),
      other => Err(format!("unknown strategy: {other}")),
    }
  }
}

/// One cached response as persisted in a partition namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
  /// Normalized request URL this entry answers.
  pub url: String,
  pub status: u16,
  pub content_type: Option<String>,
  #[serde(with = "crate::storage::payload_encoding")]
  pub body: Vec<u8>,
  pub cached_at: DateTime<Utc>,
  /// Hard serving boundary; past this instant the entry is treated as
  /// absent everywhere.
  pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
  pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
    now > self.expires_at
  }
}

/// Indicates where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from the network.
  Network,
  /// Data from cache, within its TTL, served by choice.
  CacheFresh,
  /// Data from cache while a background refresh runs (or just ran).
  CacheStale,
  /// Data from cache because the network path failed.
  OfflineFallback,
}

/// What [`RequestCache::handle`] hands back to the caller.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  pub status: u16,
  pub content_type: Option<String>,
  pub body: Vec<u8>,
  pub source: CacheSource,
  /// When the body was cached; `None` for straight-from-network answers.
  pub cached_at: Option<DateTime<Utc>>,
}

impl CachedResponse {
  pub fn from_network(fetched: FetchedResponse) -> Self {
    Self {
      status: fetched.status,
      content_type: fetched.content_type,
      body: fetched.body,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  pub fn from_cache(entry: CacheEntry, stale: bool) -> Self {
    Self {
      status: entry.status,
      content_type: entry.content_type,
      body: entry.body,
      source: if stale {
        CacheSource::CacheStale
      } else {
        CacheSource::CacheFresh
      },
      cached_at: Some(entry.cached_at),
    }
  }

  pub fn offline(entry: CacheEntry) -> Self {
    Self {
      status: entry.status,
      content_type: entry.content_type,
      body: entry.body,
      source: CacheSource::OfflineFallback,
      cached_at: Some(entry.cached_at),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_partition_round_trips_through_str() {
    for partition in Partition::ALL {
      let parsed: Partition = partition.as_str().parse().unwrap();
      assert_eq!(parsed, partition);
    }
  }

  #[test]
  fn test_strategy_parses_kebab_case() {
    let s: Strategy = "stale-while-revalidate".parse().unwrap();
    assert_eq!(s, Strategy::StaleWhileRevalidate);
    let s: Strategy = "swr".parse().unwrap();
    assert_eq!(s, Strategy::StaleWhileRevalidate);
    assert!("freshest-first".parse::<Strategy>().is_err());
  }

  #[test]
  fn test_entry_expiry_boundary() {
    let now = Utc::now();
    let entry = CacheEntry {
      url: "https://a/b".to_string(),
      status: 200,
      content_type: None,
      body: Vec::new(),
      cached_at: now - chrono::Duration::minutes(5),
      expires_at: now,
    };
    // An entry is servable through its expiry instant and unservable after
    assert!(!entry.is_expired(now));
    assert!(entry.is_expired(now + chrono::Duration::milliseconds(1)));
  }
}
