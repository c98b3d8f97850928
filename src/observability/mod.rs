//! Error taxonomy, metrics and per-operation telemetry.

mod classify;
mod error;
mod metrics;
mod recorder;

pub use classify::{ErrorClassifier, Evidence, Failure, Rule, DEFAULT_RULES};
pub use error::{ClassifiedError, ErrorKind};
pub use metrics::{
  Labels, Metrics, MetricsError, MetricsSink, NoopMetrics, RecordingMetrics, Sample,
  TracingMetrics,
};
pub use recorder::{HealthStatus, ObservabilityRecorder, OperationGuard};
