//! Metrics sink boundary.
//!
//! Core DB logic MUST NOT depend on obs::metrics directly.
//! All instrumentation flows through MetricsEvent and MetricsSink.
//!
//! This module is the only allowed bridge between execution logic
//! and the global metrics state.
use crate::obs::metrics;
use std::{cell::RefCell, sync::Arc};

thread_local! {
    static SINK_OVERRIDE: RefCell<Option<Arc<dyn MetricsSink>>> = const { RefCell::new(None) };
}

///
/// QueryPath
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum QueryPath {
    /// Literal ids resolved without set algebra.
    Simple,
    /// Set algebra into a result key.
    Keyed,
    /// Re-bound to a live memoized result key.
    Memoized,
}

///
/// MetricsEvent
///

#[derive(Clone, Copy, Debug)]
pub enum MetricsEvent<'a> {
    QueryCompiled {
        model: &'a str,
        path: QueryPath,
    },
    TempKeys {
        model: &'a str,
        count: u64,
    },
    RowsLoaded {
        model: &'a str,
        rows: u64,
        missing: u64,
    },
    IndexDelta {
        model: &'a str,
        inserts: u64,
        removes: u64,
    },
    CommitStart,
    CommitFinish {
        writes: u64,
    },
}

///
/// MetricsSink
///

pub trait MetricsSink: Send + Sync {
    fn record(&self, event: MetricsEvent<'_>);
}

/// GlobalMetricsSink
/// Default process-local sink that writes into global metrics state.
/// Acts as the concrete sink when no scoped override is installed.

pub(crate) struct GlobalMetricsSink;

impl MetricsSink for GlobalMetricsSink {
    fn record(&self, event: MetricsEvent<'_>) {
        match event {
            MetricsEvent::QueryCompiled { model, path } => {
                metrics::with_state_mut(|m| {
                    match path {
                        QueryPath::Simple => {
                            m.ops.queries_simple = m.ops.queries_simple.saturating_add(1);
                        }
                        QueryPath::Keyed => {
                            m.ops.queries_keyed = m.ops.queries_keyed.saturating_add(1);
                        }
                        QueryPath::Memoized => {
                            m.ops.queries_memoized = m.ops.queries_memoized.saturating_add(1);
                        }
                    }
                    let entry = m.models.entry(model.to_string()).or_default();
                    entry.queries = entry.queries.saturating_add(1);
                });
            }

            MetricsEvent::TempKeys { model, count } => {
                metrics::with_state_mut(|m| {
                    m.ops.temp_keys = m.ops.temp_keys.saturating_add(count);
                    let entry = m.models.entry(model.to_string()).or_default();
                    entry.temp_keys = entry.temp_keys.saturating_add(count);
                });
            }

            MetricsEvent::RowsLoaded {
                model,
                rows,
                missing,
            } => {
                metrics::with_state_mut(|m| {
                    m.ops.rows_loaded = m.ops.rows_loaded.saturating_add(rows);
                    m.ops.rows_missing = m.ops.rows_missing.saturating_add(missing);
                    let entry = m.models.entry(model.to_string()).or_default();
                    entry.rows_loaded = entry.rows_loaded.saturating_add(rows);
                    entry.rows_missing = entry.rows_missing.saturating_add(missing);
                });
            }

            MetricsEvent::IndexDelta {
                model,
                inserts,
                removes,
            } => {
                metrics::with_state_mut(|m| {
                    m.ops.index_inserts = m.ops.index_inserts.saturating_add(inserts);
                    m.ops.index_removes = m.ops.index_removes.saturating_add(removes);
                    let entry = m.models.entry(model.to_string()).or_default();
                    entry.index_inserts = entry.index_inserts.saturating_add(inserts);
                    entry.index_removes = entry.index_removes.saturating_add(removes);
                });
            }

            MetricsEvent::CommitStart => {
                metrics::with_state_mut(|m| {
                    m.ops.commits = m.ops.commits.saturating_add(1);
                });
            }

            MetricsEvent::CommitFinish { writes } => {
                metrics::with_state_mut(|m| {
                    m.ops.commit_writes = m.ops.commit_writes.saturating_add(writes);
                });
            }
        }
    }
}

pub(crate) const GLOBAL_METRICS_SINK: GlobalMetricsSink = GlobalMetricsSink;

pub(crate) fn record(event: MetricsEvent<'_>) {
    let sink = SINK_OVERRIDE.with(|cell| cell.borrow().clone());
    match sink {
        Some(sink) => sink.record(event),
        None => GLOBAL_METRICS_SINK.record(event),
    }
}

/// Snapshot the current metrics state for test and reporting plumbing.
#[must_use]
pub fn metrics_report() -> metrics::EventReport {
    metrics::report()
}

/// Reset all metrics state.
pub fn metrics_reset_all() {
    metrics::reset_all();
}

/// Run a closure with a temporary metrics sink override.
/// `None` leaves the current routing in place.
pub(crate) fn with_metrics_sink<T>(
    sink: Option<Arc<dyn MetricsSink>>,
    f: impl FnOnce() -> T,
) -> T {
    struct Guard(Option<Arc<dyn MetricsSink>>);

    impl Drop for Guard {
        fn drop(&mut self) {
            let prev = self.0.take();
            SINK_OVERRIDE.with(|cell| {
                *cell.borrow_mut() = prev;
            });
        }
    }

    let Some(sink) = sink else {
        return f();
    };

    let prev = SINK_OVERRIDE.with(|cell| cell.borrow_mut().replace(sink));
    let _guard = Guard(prev);

    f()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CaptureSink {
        commits: Mutex<u64>,
    }

    impl MetricsSink for CaptureSink {
        fn record(&self, event: MetricsEvent<'_>) {
            if matches!(event, MetricsEvent::CommitStart)
                && let Ok(mut commits) = self.commits.lock()
            {
                *commits += 1;
            }
        }
    }

    #[test]
    fn override_captures_events_and_is_restored() {
        metrics_reset_all();
        let capture = Arc::new(CaptureSink::default());

        let sink: Arc<dyn MetricsSink> = capture.clone();
        with_metrics_sink(Some(sink), || record(MetricsEvent::CommitStart));
        record(MetricsEvent::CommitStart);

        assert_eq!(*capture.commits.lock().expect("lock"), 1);
        assert_eq!(metrics_report().counters.ops.commits, 1);
    }

    #[test]
    fn global_sink_accumulates_per_model_counters() {
        metrics_reset_all();
        record(MetricsEvent::QueryCompiled {
            model: "item",
            path: QueryPath::Simple,
        });
        record(MetricsEvent::RowsLoaded {
            model: "item",
            rows: 3,
            missing: 1,
        });

        let report = metrics_report();
        assert_eq!(report.counters.ops.queries_simple, 1);
        let item = report
            .models
            .iter()
            .find(|summary| summary.model == "item")
            .expect("item summary should exist");
        assert_eq!(item.rows_loaded, 3);
        assert_eq!(item.rows_missing, 1);
    }
}
