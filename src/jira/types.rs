//! Request and response descriptions exchanged with the execution layer.

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use url::Url;

/// A fully-formed outbound Jira REST call.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
  pub method: Method,
  /// Logical operation name (e.g. "issues/get"), used for cache policy and
  /// telemetry, never for routing
  pub operation: String,
  pub url: Url,
  pub headers: HeaderMap,
  pub body: Option<Bytes>,
  /// Overrides the client's default request timeout
  pub timeout: Option<Duration>,
}

impl OutboundRequest {
  pub fn new(method: Method, operation: impl Into<String>, url: Url) -> Self {
    Self {
      method,
      operation: operation.into(),
      url,
      headers: HeaderMap::new(),
      body: None,
      timeout: None,
    }
  }

  pub fn get(operation: impl Into<String>, url: Url) -> Self {
    Self::new(Method::GET, operation, url)
  }

  pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
    self.headers.insert(name, value);
    self
  }

  pub fn with_query(mut self, name: &str, value: &str) -> Self {
    self.url.query_pairs_mut().append_pair(name, value);
    self
  }

  pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
    self.body = Some(body.into());
    self
  }

  /// Attach a JSON body and the matching content type.
  pub fn with_json(self, body: &serde_json::Value) -> serde_json::Result<Self> {
    let bytes = serde_json::to_vec(body)?;
    Ok(
      self
        .with_header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
        .with_body(bytes),
    )
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = Some(timeout);
    self
  }

  /// Anything but GET/HEAD/OPTIONS/TRACE may change server state.
  pub fn is_mutating(&self) -> bool {
    !self.method.is_safe()
  }
}

/// A response as seen by callers. Fresh and cache-served responses are
/// indistinguishable.
#[derive(Debug, Clone)]
pub struct ApiResponse {
  pub status: StatusCode,
  pub headers: HeaderMap,
  pub body: Bytes,
}

impl ApiResponse {
  pub fn new(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
    Self {
      status,
      headers,
      body: body.into(),
    }
  }

  pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
    serde_json::from_slice(&self.body)
  }

  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }

  pub fn header_str(&self, name: &HeaderName) -> Option<&str> {
    self.headers.get(name).and_then(|v| v.to_str().ok())
  }
}
