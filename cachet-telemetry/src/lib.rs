//! CACHET Telemetry - Observability Infrastructure
//!
//! Tracing subscriber setup and Prometheus-backed implementations of the
//! cache, repository and manager observer traits from `cachet-core`.

pub mod error;
pub mod metrics;
pub mod observers;
pub mod tracer;

pub use error::{TelemetryError, TelemetryResult};
pub use metrics::{gather_metrics, metrics, CachetMetrics, METRICS};
pub use observers::{
    PrometheusCacheObserver, PrometheusManagerObserver, PrometheusRepositoryObserver,
};
pub use tracer::{init_tracing, TelemetryConfig};
