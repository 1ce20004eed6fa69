//! Network side of the cache: a small trait so the engine (and its tests)
//! never talk to `reqwest` directly.

use std::time::Duration;

use async_trait::async_trait;

use super::identity::RequestDescriptor;
use crate::error::FetchError;

/// A successful network response, body fully read.
#[derive(Debug, Clone)]
pub struct FetchedResponse {
  pub status: u16,
  pub content_type: Option<String>,
  pub body: Vec<u8>,
}

/// Fetches one request. Non-2xx statuses are failures here: a strategy that
/// falls back to cache on error should also fall back on a 502.
#[async_trait]
pub trait Fetcher: Send + Sync {
  async fn fetch(&self, request: &RequestDescriptor) -> Result<FetchedResponse, FetchError>;
}

/// Production fetcher over a shared `reqwest` client.
pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  pub fn new(timeout: Duration) -> Result<Self, FetchError> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()?;
    Ok(Self { client })
  }
}

#[async_trait]
impl Fetcher for HttpFetcher {
  async fn fetch(&self, request: &RequestDescriptor) -> Result<FetchedResponse, FetchError> {
    let method = reqwest::Method::from_bytes(request.method.as_bytes())
      .map_err(|e| FetchError::InvalidRequest(e.to_string()))?;
    let mut builder = self.client.request(method, request.url.clone());
    for (name, value) in &request.vary_headers {
      builder = builder.header(name, value);
    }

    let response = builder.send().await?;
    let status = response.status();
    let content_type = response
      .headers()
      .get(reqwest::header::CONTENT_TYPE)
      .and_then(|v| v.to_str().ok())
      .map(|v| v.to_string());
    let body = response.bytes().await?.to_vec();

    if !status.is_success() {
      return Err(FetchError::from_status(
        status.as_u16(),
        &String::from_utf8_lossy(&body),
      ));
    }

    Ok(FetchedResponse {
      status: status.as_u16(),
      content_type,
      body,
    })
  }
}
