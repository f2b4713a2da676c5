//! Observability: runtime telemetry (metrics) and sink abstractions.
//!
//! Query and commit logic never touches metrics state directly; every
//! counter update flows through `sink::record`.

pub(crate) mod metrics;
pub(crate) mod sink;

// re-exports
pub use metrics::{EventOps, EventReport, ModelCounters, ModelSummary};
pub use sink::{MetricsEvent, MetricsSink, QueryPath, metrics_report, metrics_reset_all};
