//! Metrics capability injected into the classifier and recorder.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Label set attached to a sample.
pub type Labels<'a> = &'a [(&'a str, String)];

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
  #[error("metrics sink unavailable: {0}")]
  Unavailable(String),
  #[error("metric rejected: {0}")]
  Rejected(String),
}

/// Destination for metric samples. Implementations may fail; callers in
/// this crate never let that failure reach an operation's result.
pub trait MetricsSink: Send + Sync {
  fn increment_counter(&self, name: &str, labels: Labels<'_>) -> Result<(), MetricsError>;

  fn record_duration(
    &self,
    name: &str,
    value: Duration,
    labels: Labels<'_>,
  ) -> Result<(), MetricsError>;

  fn set_gauge(&self, name: &str, value: f64, labels: Labels<'_>) -> Result<(), MetricsError>;
}

/// Discards every sample.
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
  fn increment_counter(&self, _name: &str, _labels: Labels<'_>) -> Result<(), MetricsError> {
    Ok(())
  }

  fn record_duration(&self, _: &str, _: Duration, _: Labels<'_>) -> Result<(), MetricsError> {
    Ok(())
  }

  fn set_gauge(&self, _name: &str, _value: f64, _labels: Labels<'_>) -> Result<(), MetricsError> {
    Ok(())
  }
}

/// Emits samples as `tracing` events on the `metrics` target, for
/// collection by whatever subscriber is installed.
pub struct TracingMetrics;

fn render(labels: Labels<'_>) -> String {
  labels
    .iter()
    .map(|(k, v)| format!("{}={}", k, v))
    .collect::<Vec<_>>()
    .join(",")
}

impl MetricsSink for TracingMetrics {
  fn increment_counter(&self, name: &str, labels: Labels<'_>) -> Result<(), MetricsError> {
    tracing::trace!(target: "metrics", kind = "counter", metric = name, labels = %render(labels), value = 1);
    Ok(())
  }

  fn record_duration(
    &self,
    name: &str,
    value: Duration,
    labels: Labels<'_>,
  ) -> Result<(), MetricsError> {
    tracing::trace!(
      target: "metrics",
      kind = "duration",
      metric = name,
      labels = %render(labels),
      value_ms = value.as_secs_f64() * 1000.0
    );
    Ok(())
  }

  fn set_gauge(&self, name: &str, value: f64, labels: Labels<'_>) -> Result<(), MetricsError> {
    tracing::trace!(target: "metrics", kind = "gauge", metric = name, labels = %render(labels), value);
    Ok(())
  }
}

/// A captured sample.
#[derive(Debug, Clone, PartialEq)]
pub enum Sample {
  Counter {
    name: String,
    labels: Vec<(String, String)>,
  },
  Duration {
    name: String,
    value: Duration,
    labels: Vec<(String, String)>,
  },
  Gauge {
    name: String,
    value: f64,
    labels: Vec<(String, String)>,
  },
}

impl Sample {
  pub fn name(&self) -> &str {
    match self {
      Sample::Counter { name, .. } | Sample::Duration { name, .. } | Sample::Gauge { name, .. } => {
        name
      }
    }
  }

  pub fn label(&self, key: &str) -> Option<&str> {
    let labels = match self {
      Sample::Counter { labels, .. }
      | Sample::Duration { labels, .. }
      | Sample::Gauge { labels, .. } => labels,
    };
    labels
      .iter()
      .find(|(k, _)| k == key)
      .map(|(_, v)| v.as_str())
  }
}

/// Keeps every sample in memory, for embedders and tests.
#[derive(Default)]
pub struct RecordingMetrics {
  samples: Mutex<Vec<Sample>>,
}

fn owned(labels: Labels<'_>) -> Vec<(String, String)> {
  labels
    .iter()
    .map(|(k, v)| (k.to_string(), v.clone()))
    .collect()
}

impl RecordingMetrics {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn samples(&self) -> Vec<Sample> {
    self.samples.lock().clone()
  }

  /// Number of increments recorded for a counter.
  pub fn counter(&self, name: &str) -> usize {
    self
      .samples
      .lock()
      .iter()
      .filter(|s| matches!(s, Sample::Counter { .. }) && s.name() == name)
      .count()
  }

  /// Last value set on a gauge.
  pub fn gauge(&self, name: &str) -> Option<f64> {
    self.samples.lock().iter().rev().find_map(|s| match s {
      Sample::Gauge { name: n, value, .. } if n == name => Some(*value),
      _ => None,
    })
  }
}

impl MetricsSink for RecordingMetrics {
  fn increment_counter(&self, name: &str, labels: Labels<'_>) -> Result<(), MetricsError> {
    self.samples.lock().push(Sample::Counter {
      name: name.to_string(),
      labels: owned(labels),
    });
    Ok(())
  }

  fn record_duration(
    &self,
    name: &str,
    value: Duration,
    labels: Labels<'_>,
  ) -> Result<(), MetricsError> {
    self.samples.lock().push(Sample::Duration {
      name: name.to_string(),
      value,
      labels: owned(labels),
    });
    Ok(())
  }

  fn set_gauge(&self, name: &str, value: f64, labels: Labels<'_>) -> Result<(), MetricsError> {
    self.samples.lock().push(Sample::Gauge {
      name: name.to_string(),
      value,
      labels: owned(labels),
    });
    Ok(())
  }
}

/// Cloneable handle over a sink: applies the namespace prefix, honours the
/// enabled flag and swallows sink failures.
#[derive(Clone)]
pub struct Metrics {
  sink: Arc<dyn MetricsSink>,
  namespace: String,
  enabled: bool,
}

impl Metrics {
  pub fn new(sink: Arc<dyn MetricsSink>, namespace: impl Into<String>) -> Self {
    Self {
      sink,
      namespace: namespace.into(),
      enabled: true,
    }
  }

  pub fn disabled() -> Self {
    Self {
      sink: Arc::new(NoopMetrics),
      namespace: String::new(),
      enabled: false,
    }
  }

  pub fn with_enabled(mut self, enabled: bool) -> Self {
    self.enabled = enabled;
    self
  }

  fn name(&self, metric: &str) -> String {
    if self.namespace.is_empty() {
      metric.to_string()
    } else {
      format!("{}_{}", self.namespace, metric)
    }
  }

  fn swallow(&self, metric: &str, result: Result<(), MetricsError>) {
    if let Err(e) = result {
      debug!(metric, error = %e, "dropping metric sample");
    }
  }

  pub fn counter(&self, metric: &str, labels: Labels<'_>) {
    if self.enabled {
      let name = self.name(metric);
      self.swallow(&name, self.sink.increment_counter(&name, labels));
    }
  }

  pub fn duration(&self, metric: &str, value: Duration, labels: Labels<'_>) {
    if self.enabled {
      let name = self.name(metric);
      self.swallow(&name, self.sink.record_duration(&name, value, labels));
    }
  }

  pub fn gauge(&self, metric: &str, value: f64, labels: Labels<'_>) {
    if self.enabled {
      let name = self.name(metric);
      self.swallow(&name, self.sink.set_gauge(&name, value, labels));
    }
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;

  /// Sink that rejects everything.
  pub(crate) struct FailingMetrics;

  impl MetricsSink for FailingMetrics {
    fn increment_counter(&self, _: &str, _: Labels<'_>) -> Result<(), MetricsError> {
      Err(MetricsError::Unavailable("collector down".into()))
    }
    fn record_duration(&self, _: &str, _: Duration, _: Labels<'_>) -> Result<(), MetricsError> {
      Err(MetricsError::Unavailable("collector down".into()))
    }
    fn set_gauge(&self, _: &str, _: f64, _: Labels<'_>) -> Result<(), MetricsError> {
      Err(MetricsError::Unavailable("collector down".into()))
    }
  }

  #[test]
  fn test_namespace_prefix() {
    let sink = Arc::new(RecordingMetrics::new());
    let metrics = Metrics::new(sink.clone(), "jira");
    metrics.counter("errors_total", &[("operation", "issues/get".to_string())]);
    metrics.gauge("health_status", 1.0, &[]);

    assert_eq!(sink.counter("jira_errors_total"), 1);
    assert_eq!(sink.gauge("jira_health_status"), Some(1.0));
    assert_eq!(sink.samples()[0].label("operation"), Some("issues/get"));
  }

  #[test]
  fn test_disabled_handle_records_nothing() {
    let sink = Arc::new(RecordingMetrics::new());
    let metrics = Metrics::new(sink.clone(), "jira").with_enabled(false);
    metrics.counter("errors_total", &[]);
    assert!(sink.samples().is_empty());
  }

  #[test]
  fn test_sink_failures_are_swallowed() {
    let metrics = Metrics::new(Arc::new(FailingMetrics), "jira");
    metrics.counter("errors_total", &[]);
    metrics.duration("operation_duration", Duration::from_millis(3), &[]);
    metrics.gauge("health_status", 0.0, &[]);
  }
}
