//! Maps raw failures onto the error taxonomy.
//!
//! Evidence is matched against a priority-ordered rule table, first by HTTP
//! status (when one was observed) and then by message text. Cancellation
//! and elapsed deadlines short-circuit to [`ErrorKind::Timeout`].

use serde_json::{Map, Value};
use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::error::{ClassifiedError, ErrorKind};
use super::metrics::Metrics;
use crate::jira::TransportError;

/// A failure awaiting classification.
#[derive(Debug, Clone)]
pub enum Failure {
  /// Already classified; only gaps are filled
  Classified(ClassifiedError),
  Transport(TransportError),
  /// Upstream answered with an error status
  Status {
    status: u16,
    message: String,
    code: Option<String>,
    details: Map<String, Value>,
  },
  Message(String),
  Other(Arc<dyn StdError + Send + Sync>),
}

impl Failure {
  pub fn status(status: u16, message: impl Into<String>) -> Self {
    Failure::Status {
      status,
      message: message.into(),
      code: None,
      details: Map::new(),
    }
  }

  pub fn other(err: impl StdError + Send + Sync + 'static) -> Self {
    Failure::Other(Arc::new(err))
  }
}

impl From<ClassifiedError> for Failure {
  fn from(e: ClassifiedError) -> Self {
    Failure::Classified(e)
  }
}

impl From<TransportError> for Failure {
  fn from(e: TransportError) -> Self {
    Failure::Transport(e)
  }
}

impl From<tokio::time::error::Elapsed> for Failure {
  fn from(_: tokio::time::error::Elapsed) -> Self {
    Failure::Transport(TransportError::Timeout)
  }
}

impl From<String> for Failure {
  fn from(m: String) -> Self {
    Failure::Message(m)
  }
}

impl From<&str> for Failure {
  fn from(m: &str) -> Self {
    Failure::Message(m.to_string())
  }
}

/// Normalized facts a rule can match on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Evidence {
  pub status: Option<u16>,
  /// Lower-cased message text
  pub message: String,
  /// The caller's deadline elapsed or the call was canceled
  pub canceled: bool,
}

impl Evidence {
  pub fn message(message: &str) -> Self {
    Self {
      message: message.to_lowercase(),
      ..Default::default()
    }
  }

  pub fn with_status(mut self, status: u16) -> Self {
    self.status = Some(status);
    self
  }

  pub fn canceled() -> Self {
    Self {
      canceled: true,
      ..Default::default()
    }
  }
}

/// One row of the classification table.
#[derive(Debug, Clone, Copy)]
pub struct Rule {
  pub kind: ErrorKind,
  /// Inclusive status ranges
  pub statuses: &'static [(u16, u16)],
  pub needles: &'static [&'static str],
}

impl Rule {
  fn matches_status(&self, status: u16) -> bool {
    self
      .statuses
      .iter()
      .any(|(lo, hi)| (*lo..=*hi).contains(&status))
  }

  fn matches_message(&self, message: &str) -> bool {
    self.needles.iter().any(|n| contains_needle(message, n))
  }
}

/// Priority order matters: earlier rows win.
pub const DEFAULT_RULES: &[Rule] = &[
  Rule {
    kind: ErrorKind::Timeout,
    statuses: &[(408, 408)],
    needles: &["deadline exceeded", "context canceled", "operation canceled"],
  },
  Rule {
    kind: ErrorKind::Authentication,
    statuses: &[(401, 401)],
    needles: &["401", "unauthorized", "authentication"],
  },
  Rule {
    kind: ErrorKind::Authorization,
    statuses: &[(403, 403)],
    needles: &["403", "forbidden", "access denied"],
  },
  Rule {
    kind: ErrorKind::NotFound,
    statuses: &[(404, 404), (410, 410)],
    needles: &["404", "not found"],
  },
  Rule {
    kind: ErrorKind::RateLimit,
    statuses: &[(429, 429)],
    needles: &["429", "rate limit", "too many requests"],
  },
  Rule {
    kind: ErrorKind::Validation,
    statuses: &[(400, 400), (409, 409), (412, 412), (415, 415), (422, 422)],
    needles: &["400", "bad request", "validation", "invalid"],
  },
  Rule {
    kind: ErrorKind::ServerError,
    statuses: &[(500, 599)],
    needles: &["500", "502", "503", "504", "server error", "internal error"],
  },
  Rule {
    kind: ErrorKind::Network,
    statuses: &[],
    needles: &["network", "connection", "dns", "timeout", "timed out"],
  },
  Rule {
    kind: ErrorKind::QuotaExceeded,
    statuses: &[],
    needles: &["quota", "exceeded", "limit reached"],
  },
  Rule {
    kind: ErrorKind::Configuration,
    statuses: &[],
    needles: &["configuration", "config", "setting"],
  },
];

/// Substring match; numeric needles must not be part of a longer number.
fn contains_needle(haystack: &str, needle: &str) -> bool {
  if !needle.bytes().all(|b| b.is_ascii_digit()) {
    return haystack.contains(needle);
  }
  let bytes = haystack.as_bytes();
  haystack.match_indices(needle).any(|(at, _)| {
    let before = at.checked_sub(1).map(|i| bytes[i]);
    let after = bytes.get(at + needle.len()).copied();
    !before.is_some_and(|b| b.is_ascii_digit()) && !after.is_some_and(|b| b.is_ascii_digit())
  })
}

/// Classifies failures and counts them.
pub struct ErrorClassifier {
  rules: &'static [Rule],
  metrics: Metrics,
  track_errors: bool,
}

impl ErrorClassifier {
  pub fn new(metrics: Metrics) -> Self {
    Self {
      rules: DEFAULT_RULES,
      metrics,
      track_errors: true,
    }
  }

  /// Toggle the `errors_total` counter.
  pub fn with_error_tracking(mut self, enabled: bool) -> Self {
    self.track_errors = enabled;
    self
  }

  /// Kind for a piece of evidence. Pure.
  pub fn kind_for(&self, evidence: &Evidence) -> ErrorKind {
    if evidence.canceled {
      return ErrorKind::Timeout;
    }
    if let Some(status) = evidence.status {
      if let Some(rule) = self.rules.iter().find(|r| r.matches_status(status)) {
        return rule.kind;
      }
    }
    self
      .rules
      .iter()
      .find(|r| r.matches_message(&evidence.message))
      .map_or(ErrorKind::Unknown, |r| r.kind)
  }

  /// Classify a failure observed for `operation` after `duration`.
  ///
  /// An already-classified error keeps its kind; only a missing operation
  /// or duration is filled in.
  pub fn classify(
    &self,
    failure: impl Into<Failure>,
    operation: &str,
    duration: Duration,
  ) -> ClassifiedError {
    let classified = match failure.into() {
      Failure::Classified(e) => return e.fill_gaps(operation, duration),
      Failure::Other(err) => match find_classified(err.as_ref()) {
        Some(e) => return e.fill_gaps(operation, duration),
        None => self.from_source(err),
      },
      Failure::Transport(e) => self.from_transport(e),
      Failure::Status {
        status,
        message,
        code,
        details,
      } => {
        let evidence = Evidence::message(&format!("{} {}", status, message)).with_status(status);
        let mut err = ClassifiedError::new(self.kind_for(&evidence), message).with_status(status);
        err.code = code;
        err.details = details;
        err
      }
      Failure::Message(message) => {
        let kind = self.kind_for(&Evidence::message(&message));
        with_nominal_status(ClassifiedError::new(kind, message))
      }
    }
    .with_operation(operation)
    .with_duration(duration);

    self.count(&classified);
    debug!(
      operation,
      error_kind = %classified.kind,
      recoverable = classified.recoverable,
      http_status = ?classified.http_status,
      "classified failure"
    );
    classified
  }

  fn from_transport(&self, e: TransportError) -> ClassifiedError {
    let evidence = match &e {
      TransportError::Timeout | TransportError::Canceled => Evidence::canceled(),
      other => Evidence::message(&other.to_string()),
    };
    let kind = self.kind_for(&evidence);
    ClassifiedError::new(kind, e.to_string()).with_source(e)
  }

  fn from_source(&self, source: Arc<dyn StdError + Send + Sync>) -> ClassifiedError {
    let mut chain = Vec::new();
    let mut canceled = false;
    let mut cur: Option<&(dyn StdError + 'static)> = Some(source.as_ref());
    while let Some(e) = cur {
      if e.is::<tokio::time::error::Elapsed>()
        || matches!(
          e.downcast_ref::<TransportError>(),
          Some(TransportError::Timeout | TransportError::Canceled)
        )
      {
        canceled = true;
      }
      chain.push(e.to_string());
      cur = e.source();
    }

    let message = chain.join(": ");
    let evidence = Evidence {
      canceled,
      ..Evidence::message(&message)
    };
    let kind = self.kind_for(&evidence);
    with_nominal_status(ClassifiedError::new(kind, message)).with_shared_source(source)
  }

  fn count(&self, err: &ClassifiedError) {
    if !self.track_errors {
      return;
    }
    self.metrics.counter(
      "errors_total",
      &[
        ("operation", err.operation.clone().unwrap_or_default()),
        ("error_type", err.kind.to_string()),
        ("recoverable", err.recoverable.to_string()),
        (
          "http_status",
          err
            .http_status
            .map_or_else(|| "none".to_string(), |s| s.to_string()),
        ),
      ],
    );
  }
}

fn with_nominal_status(err: ClassifiedError) -> ClassifiedError {
  match err.kind.nominal_status() {
    Some(status) => err.with_status(status),
    None => err,
  }
}

fn find_classified(err: &(dyn StdError + 'static)) -> Option<ClassifiedError> {
  let mut cur = Some(err);
  while let Some(e) = cur {
    if let Some(c) = e.downcast_ref::<ClassifiedError>() {
      return Some(c.clone());
    }
    cur = e.source();
  }
  None
}
