use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT};
use reqwest::Method;
use url::Url;

use crate::config::Config;

use super::types::{ApiResponse, OutboundRequest};

/// Failure to obtain any response from upstream.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
  #[error("deadline exceeded before a response was received")]
  Timeout,
  #[error("operation canceled")]
  Canceled,
  #[error("connection error: {0}")]
  Connect(String),
  #[error("network error reading response body: {0}")]
  Body(String),
  #[error("request error: {0}")]
  Request(String),
}

impl From<reqwest::Error> for TransportError {
  fn from(e: reqwest::Error) -> Self {
    if e.is_timeout() {
      TransportError::Timeout
    } else if e.is_connect() {
      TransportError::Connect(e.to_string())
    } else if e.is_body() || e.is_decode() {
      TransportError::Body(e.to_string())
    } else {
      TransportError::Request(e.to_string())
    }
  }
}

/// Sends a request and returns whatever status upstream answered with.
///
/// Error statuses are responses, not transport errors.
#[async_trait]
pub trait Transport: Send + Sync {
  async fn send(&self, request: &OutboundRequest) -> Result<ApiResponse, TransportError>;
}

/// Jira API client over reqwest.
#[derive(Clone)]
pub struct JiraClient {
  http: reqwest::Client,
  base_url: Url,
  authorization: Option<HeaderValue>,
}

impl JiraClient {
  pub fn new(config: &Config) -> Result<Self> {
    let token = Config::get_api_token()?;
    let authorization = config.authorization(&token)?;

    let base_url = Url::parse(&config.jira.url)
      .map_err(|e| eyre!("Invalid Jira URL {}: {}", config.jira.url, e))?;

    let http = reqwest::Client::builder()
      .timeout(config.jira.request_timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self::with_client(http, base_url, Some(authorization)))
  }

  pub fn with_client(http: reqwest::Client, base_url: Url, authorization: Option<HeaderValue>) -> Self {
    Self {
      http,
      base_url,
      authorization,
    }
  }

  /// Resolve an API path against the instance URL, keeping any context
  /// path (e.g. `https://host/jira`).
  pub fn url(&self, path: &str) -> Result<Url> {
    let mut base = self.base_url.clone();
    if !base.path().ends_with('/') {
      let with_slash = format!("{}/", base.path());
      base.set_path(&with_slash);
    }
    base
      .join(path.trim_start_matches('/'))
      .map_err(|e| eyre!("Invalid API path {}: {}", path, e))
  }

  /// Start a request with the standard JSON and credential headers.
  pub fn request(&self, method: Method, operation: &str, path: &str) -> Result<OutboundRequest> {
    let mut request = OutboundRequest::new(method, operation, self.url(path)?);
    request
      .headers
      .insert(ACCEPT, HeaderValue::from_static("application/json"));
    if let Some(auth) = &self.authorization {
      request.headers.insert(AUTHORIZATION, auth.clone());
    }
    Ok(request)
  }
}

#[async_trait]
impl Transport for JiraClient {
  async fn send(&self, request: &OutboundRequest) -> Result<ApiResponse, TransportError> {
    let mut headers: HeaderMap = request.headers.clone();
    headers
      .entry(USER_AGENT)
      .or_insert(HeaderValue::from_static(concat!("jira-conduit/", env!("CARGO_PKG_VERSION"))));

    let mut builder = self
      .http
      .request(request.method.clone(), request.url.clone())
      .headers(headers);
    if let Some(timeout) = request.timeout {
      builder = builder.timeout(timeout);
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder.send().await?;
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.bytes().await?;

    Ok(ApiResponse {
      status,
      headers,
      body,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn client(base: &str) -> JiraClient {
    JiraClient::with_client(
      reqwest::Client::new(),
      Url::parse(base).unwrap(),
      Some(HeaderValue::from_static("Bearer t")),
    )
  }

  #[test]
  fn test_url_keeps_context_path() {
    let c = client("https://jira.example.com/jira");
    assert_eq!(
      c.url("/rest/api/2/issue/PROJ-1").unwrap().as_str(),
      "https://jira.example.com/jira/rest/api/2/issue/PROJ-1"
    );

    let c = client("https://acme.atlassian.net");
    assert_eq!(
      c.url("rest/api/3/serverInfo").unwrap().as_str(),
      "https://acme.atlassian.net/rest/api/3/serverInfo"
    );
  }

  #[test]
  fn test_request_carries_standard_headers() {
    let req = client("https://acme.atlassian.net")
      .request(Method::GET, "issues/get", "/rest/api/3/issue/PROJ-1")
      .unwrap();
    assert_eq!(req.headers.get(ACCEPT).unwrap(), "application/json");
    assert_eq!(req.headers.get(AUTHORIZATION).unwrap(), "Bearer t");
    assert!(!req.is_mutating());
  }
}
