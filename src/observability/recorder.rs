//! Per-operation telemetry and health checks.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{Map, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, field, info, info_span, warn, Span};

use super::classify::{ErrorClassifier, Failure};
use super::error::ClassifiedError;
use super::metrics::Metrics;
use crate::config::ObservabilityConfig;

/// Last known health of the upstream service.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
  pub healthy: bool,
  pub last_checked: Option<DateTime<Utc>>,
  pub response_time: Duration,
  pub errors: Vec<String>,
  pub details: Map<String, Value>,
}

impl Default for HealthStatus {
  /// Unhealthy until a probe has succeeded.
  fn default() -> Self {
    Self {
      healthy: false,
      last_checked: None,
      response_time: Duration::ZERO,
      errors: Vec::new(),
      details: Map::new(),
    }
  }
}

/// Owns the telemetry state for one client instance.
pub struct ObservabilityRecorder {
  config: ObservabilityConfig,
  metrics: Metrics,
  classifier: Arc<ErrorClassifier>,
  health: RwLock<HealthStatus>,
}

impl ObservabilityRecorder {
  pub fn new(config: ObservabilityConfig, metrics: Metrics) -> Self {
    let metrics = metrics.with_enabled(config.enable_metrics);
    let classifier =
      ErrorClassifier::new(metrics.clone()).with_error_tracking(config.enable_error_tracking);

    Self {
      config,
      metrics,
      classifier: Arc::new(classifier),
      health: RwLock::new(HealthStatus::default()),
    }
  }

  pub fn classifier(&self) -> &ErrorClassifier {
    &self.classifier
  }

  pub fn metrics(&self) -> &Metrics {
    &self.metrics
  }

  /// Begin an operation. The returned guard must be finished; dropping it
  /// unfinished (panic, cancellation) records the operation as abandoned.
  pub fn start_operation(&self, operation: &str) -> OperationGuard {
    let span = info_span!(
      "jira.operation",
      operation,
      otel.status_code = field::Empty,
      error.kind = field::Empty,
      duration_ms = field::Empty,
    );

    if self.config.debug_mode {
      debug!(parent: &span, operation, "operation started");
    }
    self.metrics.counter(
      "operations_started_total",
      &[("operation", operation.to_string())],
    );

    OperationGuard {
      operation: operation.to_string(),
      span,
      started: Instant::now(),
      metrics: self.metrics.clone(),
      finished: false,
    }
  }

  /// Record one upstream HTTP exchange.
  pub fn record_http(&self, method: &str, endpoint: &str, status: u16, duration: Duration) {
    let labels = [
      ("method", method.to_string()),
      ("endpoint", endpoint.to_string()),
      ("status", status.to_string()),
    ];
    self.metrics.counter("http_requests_total", &labels);
    self.metrics.duration("http_request_duration", duration, &labels);
    if status >= 400 {
      self.metrics.counter("http_errors_total", &labels);
    }

    if self.config.debug_mode {
      debug!(method, endpoint, status, duration_ms = duration.as_millis() as u64, "http exchange");
    }
  }

  /// Run `probe` under the configured timeout and publish the result.
  pub async fn perform_health_check<F, Fut>(&self, probe: F) -> HealthStatus
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<(), Failure>>,
  {
    let started = Instant::now();
    let outcome = match tokio::time::timeout(self.config.health_check_timeout, probe()).await {
      Ok(result) => result,
      Err(elapsed) => Err(Failure::from(elapsed)),
    };
    let elapsed = started.elapsed();

    let mut status = HealthStatus {
      healthy: outcome.is_ok(),
      last_checked: Some(Utc::now()),
      response_time: elapsed,
      ..Default::default()
    };

    if let Err(failure) = outcome {
      let err = self.classifier.classify(failure, "health_check", elapsed);
      status.errors.push(err.to_string());
      status
        .details
        .insert("error_kind".into(), err.kind.as_str().into());
      status
        .details
        .insert("recoverable".into(), err.recoverable.into());
      warn!(error_kind = %err.kind, error = %err, "health check failed");
    } else {
      debug!(response_time_ms = elapsed.as_millis() as u64, "health check passed");
    }

    let healthy = status.healthy.to_string();
    self
      .metrics
      .counter("health_checks_total", &[("healthy", healthy.clone())]);
    self
      .metrics
      .duration("health_check_duration", elapsed, &[("healthy", healthy)]);
    self
      .metrics
      .gauge("health_status", if status.healthy { 1.0 } else { 0.0 }, &[]);

    *self.health.write() = status.clone();
    status
  }

  /// Snapshot of the last health check.
  pub fn health_status(&self) -> HealthStatus {
    self.health.read().clone()
  }
}

/// Scoped handle for one in-flight operation.
pub struct OperationGuard {
  operation: String,
  span: Span,
  started: Instant,
  metrics: Metrics,
  finished: bool,
}

impl OperationGuard {
  pub fn span(&self) -> &Span {
    &self.span
  }

  /// Close the operation, returning its duration.
  pub fn finish(mut self, err: Option<&ClassifiedError>) -> Duration {
    self.complete(match err {
      Some(e) => Outcome::Failed(e),
      None => Outcome::Succeeded,
    })
  }

  fn complete(&mut self, outcome: Outcome<'_>) -> Duration {
    self.finished = true;
    let elapsed = self.started.elapsed();
    let duration_ms = elapsed.as_millis() as u64;
    let operation = self.operation.as_str();

    self.span.record("duration_ms", duration_ms);
    let success = matches!(outcome, Outcome::Succeeded);
    self
      .span
      .record("otel.status_code", if success { "OK" } else { "ERROR" });

    let _entered = self.span.enter();
    match outcome {
      Outcome::Succeeded => {
        info!(operation, duration_ms, "operation completed");
      }
      Outcome::Failed(e) => {
        self.span.record("error.kind", e.kind.as_str());
        if e.recoverable {
          warn!(
            operation,
            duration_ms,
            error_kind = %e.kind,
            error_code = e.code.as_deref(),
            http_status = e.http_status,
            recoverable = true,
            error = %e.message,
            "operation failed"
          );
        } else {
          error!(
            operation,
            duration_ms,
            error_kind = %e.kind,
            error_code = e.code.as_deref(),
            http_status = e.http_status,
            recoverable = false,
            error = %e.message,
            "operation failed"
          );
        }
      }
      Outcome::Abandoned => {
        self.span.record("error.kind", "abandoned");
        error!(operation, duration_ms, "operation ended without completing");
      }
    }

    let labels = [
      ("operation", operation.to_string()),
      ("success", success.to_string()),
    ];
    self.metrics.counter("operations_completed_total", &labels);
    self.metrics.duration("operation_duration", elapsed, &labels);
    elapsed
  }
}

impl Drop for OperationGuard {
  fn drop(&mut self) {
    if !self.finished {
      self.complete(Outcome::Abandoned);
    }
  }
}

enum Outcome<'a> {
  Succeeded,
  Failed(&'a ClassifiedError),
  Abandoned,
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::jira::TransportError;
  use crate::observability::error::ErrorKind;
  use crate::observability::metrics::RecordingMetrics;

  fn recorder(timeout: Duration) -> (ObservabilityRecorder, Arc<RecordingMetrics>) {
    let sink = Arc::new(RecordingMetrics::new());
    let config = ObservabilityConfig {
      health_check_timeout: timeout,
      ..Default::default()
    };
    let recorder = ObservabilityRecorder::new(config, Metrics::new(sink.clone(), "jira"));
    (recorder, sink)
  }

  #[test]
  fn test_finish_success_emits_metrics() {
    let (recorder, sink) = recorder(Duration::from_secs(1));
    let guard = recorder.start_operation("issues/get");
    guard.finish(None);

    assert_eq!(sink.counter("jira_operations_started_total"), 1);
    assert_eq!(sink.counter("jira_operations_completed_total"), 1);
    let completed = sink
      .samples()
      .into_iter()
      .find(|s| s.name() == "jira_operations_completed_total")
      .unwrap();
    assert_eq!(completed.label("success"), Some("true"));
    assert!(sink
      .samples()
      .iter()
      .any(|s| s.name() == "jira_operation_duration"));
  }

  #[test]
  fn test_finish_failure_marks_unsuccessful() {
    let (recorder, sink) = recorder(Duration::from_secs(1));
    let err = ClassifiedError::new(ErrorKind::RateLimit, "slow down").with_status(429);
    recorder.start_operation("issues/search").finish(Some(&err));

    let completed = sink
      .samples()
      .into_iter()
      .find(|s| s.name() == "jira_operations_completed_total")
      .unwrap();
    assert_eq!(completed.label("success"), Some("false"));
  }

  #[test]
  fn test_dropped_guard_still_finishes_once() {
    let (recorder, sink) = recorder(Duration::from_secs(1));
    {
      let _guard = recorder.start_operation("issues/get");
    }
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
      let _guard = recorder.start_operation("issues/update");
      panic!("tool panicked");
    }));
    assert!(result.is_err());

    assert_eq!(sink.counter("jira_operations_completed_total"), 2);
    assert!(sink
      .samples()
      .iter()
      .filter(|s| s.name() == "jira_operations_completed_total")
      .all(|s| s.label("success") == Some("false")));
  }

  #[test]
  fn test_record_http_counts_errors() {
    let (recorder, sink) = recorder(Duration::from_secs(1));
    recorder.record_http("GET", "issues/get", 200, Duration::from_millis(4));
    recorder.record_http("GET", "issues/get", 503, Duration::from_millis(4));
    assert_eq!(sink.counter("jira_http_requests_total"), 2);
    assert_eq!(sink.counter("jira_http_errors_total"), 1);
  }

  #[test]
  fn test_initial_health_is_unhealthy() {
    let (recorder, _) = recorder(Duration::from_secs(1));
    let status = recorder.health_status();
    assert!(!status.healthy);
    assert!(status.last_checked.is_none());
  }

  #[tokio::test]
  async fn test_health_check_success() {
    let (recorder, sink) = recorder(Duration::from_secs(1));
    let status = recorder.perform_health_check(|| async { Ok(()) }).await;

    assert!(status.healthy);
    assert!(status.errors.is_empty());
    assert!(recorder.health_status().healthy);
    assert_eq!(sink.gauge("jira_health_status"), Some(1.0));
    assert_eq!(sink.counter("jira_health_checks_total"), 1);
  }

  #[tokio::test]
  async fn test_health_check_failure() {
    let (recorder, sink) = recorder(Duration::from_secs(1));
    let status = recorder
      .perform_health_check(|| async { Err(Failure::status(401, "unauthorized")) })
      .await;

    assert!(!status.healthy);
    assert_eq!(status.details["error_kind"], "authentication");
    assert_eq!(status.details["recoverable"], false);
    assert_eq!(status.errors.len(), 1);
    assert_eq!(sink.gauge("jira_health_status"), Some(0.0));
  }

  #[tokio::test]
  async fn test_health_check_timeout() {
    let (recorder, _) = recorder(Duration::from_millis(50));
    let status = recorder
      .perform_health_check(|| async {
        tokio::time::sleep(Duration::from_millis(500)).await;
        Ok(())
      })
      .await;

    assert!(!status.healthy);
    assert_eq!(status.details["error_kind"], "timeout");
    assert_eq!(status.details["recoverable"], true);
    assert!(status.response_time < Duration::from_millis(500));
  }

  #[tokio::test]
  async fn test_health_check_transport_failure() {
    let (recorder, _) = recorder(Duration::from_secs(1));
    let status = recorder
      .perform_health_check(|| async {
        Err(Failure::from(TransportError::Connect(
          "dns error: no such host".into(),
        )))
      })
      .await;
    assert_eq!(status.details["error_kind"], "network");
  }

  #[tokio::test]
  async fn test_metrics_disabled_by_config() {
    let sink = Arc::new(RecordingMetrics::new());
    let config = ObservabilityConfig {
      enable_metrics: false,
      ..Default::default()
    };
    let recorder = ObservabilityRecorder::new(config, Metrics::new(sink.clone(), "jira"));
    recorder.start_operation("x").finish(None);
    recorder.perform_health_check(|| async { Ok(()) }).await;
    assert!(sink.samples().is_empty());
  }
}
