//! Error taxonomy shared by every call path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Category of a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
  Authentication,
  Authorization,
  Network,
  RateLimit,
  Validation,
  NotFound,
  ServerError,
  Timeout,
  Configuration,
  QuotaExceeded,
  Unknown,
}

impl ErrorKind {
  pub const ALL: [ErrorKind; 11] = [
    ErrorKind::Authentication,
    ErrorKind::Authorization,
    ErrorKind::Network,
    ErrorKind::RateLimit,
    ErrorKind::Validation,
    ErrorKind::NotFound,
    ErrorKind::ServerError,
    ErrorKind::Timeout,
    ErrorKind::Configuration,
    ErrorKind::QuotaExceeded,
    ErrorKind::Unknown,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      ErrorKind::Authentication => "authentication",
      ErrorKind::Authorization => "authorization",
      ErrorKind::Network => "network",
      ErrorKind::RateLimit => "rate_limit",
      ErrorKind::Validation => "validation",
      ErrorKind::NotFound => "not_found",
      ErrorKind::ServerError => "server_error",
      ErrorKind::Timeout => "timeout",
      ErrorKind::Configuration => "configuration",
      ErrorKind::QuotaExceeded => "quota_exceeded",
      ErrorKind::Unknown => "unknown",
    }
  }

  /// Whether an outer retry policy may try again. Unknown fails closed.
  pub fn is_recoverable(&self) -> bool {
    matches!(
      self,
      ErrorKind::Timeout
        | ErrorKind::RateLimit
        | ErrorKind::ServerError
        | ErrorKind::Network
        | ErrorKind::QuotaExceeded
    )
  }

  /// Status reported when the evidence carried no HTTP status of its own.
  pub fn nominal_status(&self) -> Option<u16> {
    match self {
      ErrorKind::Authentication => Some(401),
      ErrorKind::Authorization => Some(403),
      ErrorKind::NotFound => Some(404),
      ErrorKind::RateLimit => Some(429),
      ErrorKind::Validation => Some(400),
      ErrorKind::ServerError => Some(500),
      _ => None,
    }
  }
}

impl fmt::Display for ErrorKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// The only error type that leaves the execution layer.
#[derive(Debug, Clone, Serialize)]
pub struct ClassifiedError {
  pub kind: ErrorKind,
  /// Upstream error code, when one was reported
  pub code: Option<String>,
  pub message: String,
  pub details: Map<String, Value>,
  pub http_status: Option<u16>,
  /// Always `kind.is_recoverable()`
  pub recoverable: bool,
  pub operation: Option<String>,
  pub duration: Option<Duration>,
  pub timestamp: DateTime<Utc>,
  #[serde(skip)]
  source: Option<Arc<dyn StdError + Send + Sync>>,
}

impl ClassifiedError {
  pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
    Self {
      kind,
      code: None,
      message: message.into(),
      details: Map::new(),
      http_status: None,
      recoverable: kind.is_recoverable(),
      operation: None,
      duration: None,
      timestamp: Utc::now(),
      source: None,
    }
  }

  pub fn with_code(mut self, code: impl Into<String>) -> Self {
    self.code = Some(code.into());
    self
  }

  pub fn with_status(mut self, status: u16) -> Self {
    self.http_status = Some(status);
    self
  }

  pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
    self.details.insert(key.into(), value.into());
    self
  }

  pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
    self.operation = Some(operation.into());
    self
  }

  pub fn with_duration(mut self, duration: Duration) -> Self {
    self.duration = Some(duration);
    self
  }

  pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
    self.source = Some(Arc::new(source));
    self
  }

  pub(crate) fn with_shared_source(mut self, source: Arc<dyn StdError + Send + Sync>) -> Self {
    self.source = Some(source);
    self
  }

  /// Fill operation and duration only where still unset.
  pub fn fill_gaps(mut self, operation: &str, duration: Duration) -> Self {
    if self.operation.as_deref().map_or(true, str::is_empty) {
      self.operation = Some(operation.to_string());
    }
    if self.duration.map_or(true, |d| d.is_zero()) {
      self.duration = Some(duration);
    }
    self
  }
}

impl fmt::Display for ClassifiedError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.code {
      Some(code) => write!(f, "{} ({}): {}", self.kind, code, self.message),
      None => write!(f, "{}: {}", self.kind, self.message),
    }
  }
}

impl StdError for ClassifiedError {
  fn source(&self) -> Option<&(dyn StdError + 'static)> {
    self
      .source
      .as_deref()
      .map(|e| e as &(dyn StdError + 'static))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_recoverability_by_kind() {
    let recoverable: Vec<_> = ErrorKind::ALL
      .iter()
      .filter(|k| k.is_recoverable())
      .map(|k| k.as_str())
      .collect();
    assert_eq!(
      recoverable,
      vec!["network", "rate_limit", "server_error", "timeout", "quota_exceeded"]
    );
    assert!(!ErrorKind::Unknown.is_recoverable());
  }

  #[test]
  fn test_new_derives_recoverable() {
    for kind in ErrorKind::ALL {
      assert_eq!(ClassifiedError::new(kind, "x").recoverable, kind.is_recoverable());
    }
  }

  #[test]
  fn test_display() {
    let plain = ClassifiedError::new(ErrorKind::NotFound, "issue PROJ-1 not found");
    assert_eq!(plain.to_string(), "not_found: issue PROJ-1 not found");

    let coded = plain.with_code("ISSUE_MISSING");
    assert_eq!(
      coded.to_string(),
      "not_found (ISSUE_MISSING): issue PROJ-1 not found"
    );
  }

  #[test]
  fn test_fill_gaps_keeps_existing_values() {
    let err = ClassifiedError::new(ErrorKind::Timeout, "slow")
      .with_operation("issues/get")
      .fill_gaps("other", Duration::from_millis(5));
    assert_eq!(err.operation.as_deref(), Some("issues/get"));
    assert_eq!(err.duration, Some(Duration::from_millis(5)));
  }

  #[test]
  fn test_source_is_preserved() {
    let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
    let err = ClassifiedError::new(ErrorKind::Network, "wrapped").with_source(io);
    assert_eq!(err.source().map(|s| s.to_string()).as_deref(), Some("boom"));
  }

  #[test]
  fn test_kind_serializes_snake_case() {
    let json = serde_json::to_string(&ErrorKind::QuotaExceeded).unwrap();
    assert_eq!(json, "\"quota_exceeded\"");
  }
}
