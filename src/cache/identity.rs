//! Request identity: what makes two requests "the same" for caching.

use sha2::{Digest, Sha256};
use url::Url;

/// A read-style request routed through the cache: method, URL, and the
/// headers that participate in identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDescriptor {
  /// Upper-case HTTP method.
  pub method: String,
  pub url: Url,
  /// `(name, value)` pairs that distinguish otherwise-identical requests,
  /// such as an `Accept` for content negotiation or a locale header. Names
  /// are lower-case and the list stays sorted.
  pub vary_headers: Vec<(String, String)>,
}

impl RequestDescriptor {
  pub fn new(method: &str, url: Url) -> Self {
    Self {
      method: method.to_uppercase(),
      url,
      vary_headers: Vec::new(),
    }
  }

  /// Plain GET, the overwhelmingly common case.
  pub fn get(url: Url) -> Self {
    Self::new("GET", url)
  }

  /// Add a header to the identity. Insertion order does not matter.
  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self
      .vary_headers
      .push((name.to_lowercase(), value.to_string()));
    self.vary_headers.sort();
    self
  }
}

/// Canonical form of a request URL: fragment dropped, everything else kept.
/// Fragments never reach the server, so two URLs differing only there are
/// the same request.
pub fn normalize(url: &Url) -> String {
  let mut normalized = url.clone();
  normalized.set_fragment(None);
  normalized.to_string()
}

/// Storage key for a request: hex SHA-256 over the method, the normalized
/// URL, and the sorted vary headers. Fixed length, filesystem-safe, and
/// collision-free for practical purposes.
pub fn cache_key(request: &RequestDescriptor) -> String {
  let mut hasher = Sha256::new();
  hasher.update(request.method.as_bytes());
  hasher.update(b"\n");
  hasher.update(normalize(&request.url).as_bytes());
  for (name, value) in &request.vary_headers {
    hasher.update(b"\n");
    hasher.update(name.as_bytes());
    hasher.update(b":");
    hasher.update(value.as_bytes());
  }
  hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn parsed(url: &str) -> Url {
    Url::parse(url).unwrap()
  }

  #[test]
  fn test_fragment_does_not_change_key() {
    let a = RequestDescriptor::get(parsed("https://app.example/page?tab=1#section"));
    let b = RequestDescriptor::get(parsed("https://app.example/page?tab=1"));
    assert_eq!(cache_key(&a), cache_key(&b));
  }

  #[test]
  fn test_query_changes_key() {
    let a = RequestDescriptor::get(parsed("https://app.example/api/items?page=1"));
    let b = RequestDescriptor::get(parsed("https://app.example/api/items?page=2"));
    assert_ne!(cache_key(&a), cache_key(&b));
  }

  #[test]
  fn test_method_changes_key() {
    let url = parsed("https://app.example/api/items");
    let get = RequestDescriptor::get(url.clone());
    let head = RequestDescriptor::new("head", url);
    assert_eq!(head.method, "HEAD");
    assert_ne!(cache_key(&get), cache_key(&head));
  }

  #[test]
  fn test_vary_header_changes_key() {
    let url = parsed("https://app.example/api/items");
    let json = RequestDescriptor::get(url.clone()).with_header("Accept", "application/json");
    let html = RequestDescriptor::get(url.clone()).with_header("Accept", "text/html");
    let bare = RequestDescriptor::get(url);
    assert_ne!(cache_key(&json), cache_key(&html));
    assert_ne!(cache_key(&json), cache_key(&bare));
  }

  #[test]
  fn test_header_order_is_irrelevant() {
    let url = parsed("https://app.example/api/items");
    let a = RequestDescriptor::get(url.clone())
      .with_header("Accept", "application/json")
      .with_header("Accept-Language", "de");
    let b = RequestDescriptor::get(url)
      .with_header("accept-language", "de")
      .with_header("accept", "application/json");
    assert_eq!(cache_key(&a), cache_key(&b));
  }

  #[test]
  fn test_key_is_hex_sha256() {
    let request = RequestDescriptor::get(parsed("https://app.example/"));
    let key = cache_key(&request);
    assert_eq!(key.len(), 64);
    assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
  }
}
