//! Delivery side of the queue, behind a trait for the same reason the cache
//! fetcher is: the queue logic and its tests never build an HTTP request.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Method;
use url::Url;

use super::item::{SyncItem, SyncPayload};
use crate::error::FetchError;

/// Parse an HTTP method name ("POST", "PUT", ...). Rejected names surface as
/// invalid submissions at enqueue time, not as delivery failures later.
pub(crate) fn parse_method(name: &str) -> Result<Method, FetchError> {
  Method::from_bytes(name.as_bytes())
    .map_err(|_| FetchError::InvalidRequest(format!("invalid HTTP method {name:?}")))
}

/// Delivers one queued item. A non-2xx response is a failure; the queue
/// decides whether to retry or give up.
#[async_trait]
pub trait Transport: Send + Sync {
  async fn deliver(&self, item: &SyncItem) -> Result<(), FetchError>;
}

/// Production transport: form posts as JSON bodies, uploads as multipart.
pub struct HttpTransport {
  client: reqwest::Client,
}

impl HttpTransport {
  pub fn new(timeout: Duration) -> Result<Self, FetchError> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()?;
    Ok(Self { client })
  }
}

#[async_trait]
impl Transport for HttpTransport {
  async fn deliver(&self, item: &SyncItem) -> Result<(), FetchError> {
    let url =
      Url::parse(&item.target).map_err(|e| FetchError::InvalidRequest(e.to_string()))?;
    let method = parse_method(&item.method)?;

    let response = match &item.payload {
      SyncPayload::Form { fields } => {
        self.client.request(method, url).json(fields).send().await?
      }
      SyncPayload::Upload { files, fields } => {
        let mut form = Form::new();
        for file in files {
          let part = Part::bytes(file.bytes.clone())
            .file_name(file.filename.clone())
            .mime_str(&file.content_type)
            .map_err(|e| FetchError::InvalidRequest(e.to_string()))?;
          form = form.part("files", part);
        }
        if let Some(map) = fields.as_object() {
          for (name, value) in map {
            form = form.text(name.clone(), text_value(value));
          }
        }
        self.client.request(method, url).multipart(form).send().await?
      }
    };

    let status = response.status();
    if !status.is_success() {
      let body = response.text().await.unwrap_or_default();
      return Err(FetchError::from_status(status.as_u16(), &body));
    }
    Ok(())
  }
}

/// Multipart text fields are strings; JSON strings go in bare, everything
/// else keeps its JSON syntax.
fn text_value(value: &serde_json::Value) -> String {
  match value {
    serde_json::Value::String(s) => s.clone(),
    other => other.to_string(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_text_value_unquotes_strings_only() {
    assert_eq!(text_value(&serde_json::json!("plain")), "plain");
    assert_eq!(text_value(&serde_json::json!(42)), "42");
    assert_eq!(text_value(&serde_json::json!({"a": 1})), "{\"a\":1}");
  }

  #[test]
  fn test_parse_method_accepts_names_and_rejects_garbage() {
    assert_eq!(parse_method("PUT").unwrap(), Method::PUT);
    assert_eq!(parse_method("PATCH").unwrap(), Method::PATCH);
    assert!(parse_method("GE T").is_err());
    assert!(parse_method("").is_err());
  }
}
