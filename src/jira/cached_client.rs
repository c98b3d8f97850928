//! Cache-aware execution of Jira calls.
//!
//! Every call goes through [`CachedJiraClient::execute`]:
//! - cacheable reads holding a live entry are sent conditionally
//!   (`If-None-Match` / `If-Modified-Since`); reads that already carry
//!   their own conditions skip the cache entirely
//! - a `304 Not Modified` is answered from the entry as a normal success
//! - fresh successful reads replace the entry
//! - mutations invalidate the resource they touched
//! - error statuses and transport failures are classified, never cached

use chrono::Utc;
use reqwest::header::{
  HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, CACHE_CONTROL, CONTENT_TYPE, ETAG,
  IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED, RETRY_AFTER,
};
use reqwest::StatusCode;
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn, Instrument};

use crate::cache::{CacheEntry, CacheKey, CacheManager, CacheSource, Validators};
use crate::config::Config;
use crate::observability::{
  ClassifiedError, ErrorKind, Failure, Metrics, MetricsSink, ObservabilityRecorder,
};

use super::api_types::ApiErrorBody;
use super::cache::{cache_key, canonical_path, resource_prefix};
use super::client::{Transport, TransportError};
use super::types::{ApiResponse, OutboundRequest};

/// Response headers that describe the connection or a single exchange
/// rather than the representation.
const UNREPLAYABLE_HEADERS: &[&str] = &[
  "connection",
  "keep-alive",
  "transfer-encoding",
  "content-length",
  "content-encoding",
  "set-cookie",
  "date",
  "age",
];

/// A failed call: the classified error plus the upstream response, when
/// one was received.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct CallError {
  #[source]
  pub error: ClassifiedError,
  pub response: Option<ApiResponse>,
}

impl CallError {
  pub fn kind(&self) -> ErrorKind {
    self.error.kind
  }

  pub fn is_recoverable(&self) -> bool {
    self.error.recoverable
  }

  pub fn http_status(&self) -> Option<u16> {
    self.error.http_status
  }
}

/// Jira client with transparent conditional caching.
pub struct CachedJiraClient {
  transport: Arc<dyn Transport>,
  cache: Arc<CacheManager>,
  recorder: Arc<ObservabilityRecorder>,
  vary_headers: Vec<HeaderName>,
  enable_etags: bool,
  default_timeout: Option<Duration>,
}

impl CachedJiraClient {
  pub fn new(
    transport: Arc<dyn Transport>,
    cache: Arc<CacheManager>,
    recorder: Arc<ObservabilityRecorder>,
  ) -> Self {
    Self {
      transport,
      cache,
      recorder,
      vary_headers: vec![AUTHORIZATION, ACCEPT],
      enable_etags: true,
      default_timeout: None,
    }
  }

  /// Wire cache, recorder and metrics from configuration around a transport.
  pub fn from_config(
    config: &Config,
    transport: Arc<dyn Transport>,
    sink: Arc<dyn MetricsSink>,
  ) -> color_eyre::Result<Self> {
    let cache = CacheManager::from_config(&config.cache)
      .map_err(|e| color_eyre::eyre::eyre!("Failed to open response cache: {}", e))?;

    let metrics = Metrics::new(sink, config.observability.metrics_namespace.clone());
    let recorder = ObservabilityRecorder::new(config.observability.clone(), metrics);

    let vary = config
      .cache
      .vary_headers
      .iter()
      .map(|h| {
        HeaderName::from_bytes(h.as_bytes())
          .map_err(|e| color_eyre::eyre::eyre!("Invalid vary header {:?}: {}", h, e))
      })
      .collect::<color_eyre::Result<Vec<_>>>()?;

    Ok(
      Self::new(transport, Arc::new(cache), Arc::new(recorder))
        .with_vary_headers(vary)
        .with_etags(config.cache.enable_etags)
        .with_default_timeout(config.jira.request_timeout),
    )
  }

  /// Request headers folded into the cache key.
  pub fn with_vary_headers(mut self, headers: Vec<HeaderName>) -> Self {
    self.vary_headers = headers;
    self
  }

  pub fn with_etags(mut self, enabled: bool) -> Self {
    self.enable_etags = enabled;
    self
  }

  pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
    self.default_timeout = Some(timeout);
    self
  }

  pub fn cache(&self) -> &CacheManager {
    &self.cache
  }

  pub fn recorder(&self) -> &ObservabilityRecorder {
    &self.recorder
  }

  /// Execute a request. Callers cannot tell a cache-served response from
  /// a fresh one.
  pub async fn execute(&self, request: OutboundRequest) -> Result<ApiResponse, CallError> {
    let guard = self.recorder.start_operation(&request.operation);
    let span = guard.span().clone();

    let result = self.run(&request).instrument(span).await;
    match &result {
      Ok(_) => guard.finish(None),
      Err(e) => guard.finish(Some(&e.error)),
    };
    result
  }

  async fn run(&self, request: &OutboundRequest) -> Result<ApiResponse, CallError> {
    let started = Instant::now();
    let operation = request.operation.as_str();

    // a 304 to the caller's own validators says nothing about the entry
    let cacheable = self.cache.policy().is_cacheable(&request.method, operation)
      && !has_conditions(&request.headers);
    let key = cacheable.then(|| cache_key(request, &self.vary_headers));
    let cached = key.as_ref().and_then(|k| self.lookup(k, operation));

    let outbound = match cached.as_ref() {
      Some(entry) if self.enable_etags && !entry.validators.is_empty() => {
        Cow::Owned(with_conditional_headers(request.clone(), &entry.validators))
      }
      _ => Cow::Borrowed(request),
    };

    let response = match self.send(&outbound).await {
      Ok(response) => response,
      Err(e) => {
        // the mutation may have landed
        if request.is_mutating() {
          self.invalidate(request);
        }
        let error = self
          .recorder
          .classifier()
          .classify(e, operation, started.elapsed())
          .with_detail("method", request.method.as_str())
          .with_detail("path", canonical_path(&request.url));
        return Err(CallError {
          error,
          response: None,
        });
      }
    };

    let status = response.status;
    self.recorder.record_http(
      request.method.as_str(),
      operation,
      status.as_u16(),
      started.elapsed(),
    );

    if status == StatusCode::NOT_MODIFIED {
      return Ok(match cached {
        Some(entry) => {
          debug!(cache = %CacheSource::Revalidated, cache_key = %entry.key, "not modified, serving cached body");
          self.revalidated(entry, &response.headers)
        }
        // the caller's own conditional request
        None => response,
      });
    }

    if status.is_client_error() || status.is_server_error() {
      if request.is_mutating() && status.is_server_error() {
        self.invalidate(request);
      }
      return Err(self.upstream_failure(request, response, started.elapsed()));
    }

    if request.is_mutating() {
      self.invalidate(request);
    } else if let Some(key) = key {
      if status.is_success() {
        let source = if cached.is_some() {
          CacheSource::Replaced
        } else {
          CacheSource::Network
        };
        debug!(cache = %source, cache_key = %key, status = status.as_u16(), "storing response");
        self.remember(key, request, &response);
      }
    }

    Ok(response)
  }

  async fn send(&self, request: &OutboundRequest) -> Result<ApiResponse, TransportError> {
    match request.timeout.or(self.default_timeout) {
      Some(limit) => tokio::time::timeout(limit, self.transport.send(request))
        .await
        .unwrap_or(Err(TransportError::Timeout)),
      None => self.transport.send(request).await,
    }
  }

  fn lookup(&self, key: &CacheKey, operation: &str) -> Option<CacheEntry> {
    let entry = self.cache.lookup(key);
    let result = if entry.is_some() { "hit" } else { "miss" };
    self.recorder.metrics().counter(
      "cache_lookups_total",
      &[
        ("operation", operation.to_string()),
        ("result", result.to_string()),
      ],
    );
    entry
  }

  /// Restart the entry's TTL and answer from it.
  fn revalidated(&self, entry: CacheEntry, not_modified: &HeaderMap) -> ApiResponse {
    let ttl = self.cache.policy().ttl_for(&entry.operation);
    let refreshed = entry.refreshed(ttl, validators_of(not_modified));

    let mut headers = header_map(&refreshed.headers);
    for (name, value) in replayable(not_modified) {
      if let (Ok(name), Ok(value)) = (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(&value),
      ) {
        headers.insert(name, value);
      }
    }
    headers
      .entry(CONTENT_TYPE)
      .or_insert(HeaderValue::from_static("application/json"));

    let response = ApiResponse {
      status: StatusCode::from_u16(refreshed.status).unwrap_or(StatusCode::OK),
      headers,
      body: refreshed.body.clone(),
    };

    if let Err(e) = self.cache.store(refreshed) {
      warn!(error = %e, "failed to refresh cache entry");
    }
    response
  }

  fn remember(&self, key: CacheKey, request: &OutboundRequest, response: &ApiResponse) {
    let no_store = response
      .header_str(&CACHE_CONTROL)
      .is_some_and(|v| v.to_ascii_lowercase().contains("no-store"));
    if no_store {
      return;
    }

    let entry = CacheEntry {
      key,
      operation: request.operation.clone(),
      path: canonical_path(&request.url),
      status: response.status.as_u16(),
      headers: replayable(&response.headers),
      body: response.body.clone(),
      validators: if self.enable_etags {
        validators_of(&response.headers)
      } else {
        Validators::default()
      },
      stored_at: Utc::now(),
      ttl: self.cache.policy().ttl_for(&request.operation),
    };

    if let Err(e) = self.cache.store(entry) {
      warn!(operation = %request.operation, error = %e, "failed to cache response");
    }
  }

  fn invalidate(&self, request: &OutboundRequest) {
    let prefix = resource_prefix(&request.url);
    let removed = self
      .cache
      .invalidate_for_mutation(&request.operation, &prefix);
    self.recorder.metrics().counter(
      "cache_invalidations_total",
      &[
        ("operation", request.operation.clone()),
        ("removed", removed.to_string()),
      ],
    );
  }

  fn upstream_failure(
    &self,
    request: &OutboundRequest,
    response: ApiResponse,
    elapsed: Duration,
  ) -> CallError {
    let reason = response
      .status
      .canonical_reason()
      .unwrap_or("upstream error")
      .to_lowercase();
    let parsed = ApiErrorBody::parse(&response.body);
    let summary = parsed.as_ref().map(ApiErrorBody::summary).unwrap_or_default();
    let message = if summary.is_empty() {
      reason
    } else {
      format!("{}: {}", reason, summary)
    };

    let mut details = Map::new();
    details.insert("method".into(), request.method.as_str().into());
    details.insert("path".into(), canonical_path(&request.url).into());
    if let Some(retry_after) = response.header_str(&RETRY_AFTER) {
      details.insert("retry_after".into(), retry_after.into());
    }
    if let Some(body) = &parsed {
      if !body.errors.is_empty() {
        let fields: Map<String, Value> = body
          .errors
          .iter()
          .map(|(k, v)| (k.clone(), Value::from(v.as_str())))
          .collect();
        details.insert("field_errors".into(), Value::Object(fields));
      }
    }

    let failure = Failure::Status {
      status: response.status.as_u16(),
      message,
      code: parsed.and_then(|b| b.error_code),
      details,
    };
    let error = self
      .recorder
      .classifier()
      .classify(failure, &request.operation, elapsed);

    CallError {
      error,
      response: Some(response),
    }
  }
}

fn has_conditions(headers: &HeaderMap) -> bool {
  headers.contains_key(IF_NONE_MATCH) || headers.contains_key(IF_MODIFIED_SINCE)
}

/// Attach the entry's validators as request conditions.
fn with_conditional_headers(mut request: OutboundRequest, validators: &Validators) -> OutboundRequest {
  let pairs = [
    (IF_NONE_MATCH, validators.etag.as_deref()),
    (IF_MODIFIED_SINCE, validators.last_modified.as_deref()),
  ];
  for (name, value) in pairs {
    if let Some(value) = value.and_then(|v| HeaderValue::from_str(v).ok()) {
      request.headers.insert(name, value);
    }
  }
  request
}

fn validators_of(headers: &HeaderMap) -> Validators {
  let get = |name: &HeaderName| {
    headers
      .get(name)
      .and_then(|v| v.to_str().ok())
      .map(str::to_string)
  };
  Validators {
    etag: get(&ETAG),
    last_modified: get(&LAST_MODIFIED),
  }
}

fn replayable(headers: &HeaderMap) -> Vec<(String, String)> {
  headers
    .iter()
    .filter(|(name, _)| !UNREPLAYABLE_HEADERS.contains(&name.as_str()))
    .filter_map(|(name, value)| {
      value
        .to_str()
        .ok()
        .map(|v| (name.as_str().to_string(), v.to_string()))
    })
    .collect()
}

fn header_map(pairs: &[(String, String)]) -> HeaderMap {
  let mut headers = HeaderMap::new();
  for (name, value) in pairs {
    if let (Ok(name), Ok(value)) = (
      HeaderName::from_bytes(name.as_bytes()),
      HeaderValue::from_str(value),
    ) {
      headers.append(name, value);
    }
  }
  headers
}
