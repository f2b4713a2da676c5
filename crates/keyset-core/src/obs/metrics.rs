use serde::{Deserialize, Serialize};
use std::{cell::RefCell, collections::BTreeMap};

///
/// EventState
/// Ephemeral, in-memory counters for queries, loads, and commits.
///

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct EventState {
    pub ops: EventOps,
    pub models: BTreeMap<String, ModelCounters>,
}

///
/// EventOps
///

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct EventOps {
    // Query compilation paths
    pub queries_simple: u64,
    pub queries_keyed: u64,
    pub queries_memoized: u64,
    pub temp_keys: u64,

    // Materialization
    pub rows_loaded: u64,
    pub rows_missing: u64,

    // Commit protocol
    pub commits: u64,
    pub commit_writes: u64,

    // Index maintenance
    pub index_inserts: u64,
    pub index_removes: u64,
}

///
/// ModelCounters
///

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct ModelCounters {
    pub queries: u64,
    pub temp_keys: u64,
    pub rows_loaded: u64,
    pub rows_missing: u64,
    pub index_inserts: u64,
    pub index_removes: u64,
}

thread_local! {
    static EVENT_STATE: RefCell<EventState> = RefCell::new(EventState::default());
}

/// Borrow metrics immutably.
pub(crate) fn with_state<R>(f: impl FnOnce(&EventState) -> R) -> R {
    EVENT_STATE.with(|m| f(&m.borrow()))
}

/// Borrow metrics mutably.
pub(crate) fn with_state_mut<R>(f: impl FnOnce(&mut EventState) -> R) -> R {
    EVENT_STATE.with(|m| f(&mut m.borrow_mut()))
}

/// Reset all counters.
pub fn reset_all() {
    with_state_mut(|m| *m = EventState::default());
}

///
/// EventReport
///

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct EventReport {
    pub counters: EventState,
    /// Per-model counters with derived ratios.
    pub models: Vec<ModelSummary>,
}

///
/// ModelSummary
///

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct ModelSummary {
    pub model: String,
    pub queries: u64,
    pub temp_keys: u64,
    pub rows_loaded: u64,
    pub rows_missing: u64,
    pub avg_rows_per_query: f64,
    pub index_inserts: u64,
    pub index_removes: u64,
}

/// Build a report from in-memory counters, busiest models first.
#[must_use]
#[expect(clippy::cast_precision_loss)]
pub fn report() -> EventReport {
    let snap = with_state(Clone::clone);

    let mut models: Vec<ModelSummary> = snap
        .models
        .iter()
        .map(|(model, counters)| ModelSummary {
            model: model.clone(),
            queries: counters.queries,
            temp_keys: counters.temp_keys,
            rows_loaded: counters.rows_loaded,
            rows_missing: counters.rows_missing,
            avg_rows_per_query: if counters.queries > 0 {
                counters.rows_loaded as f64 / counters.queries as f64
            } else {
                0.0
            },
            index_inserts: counters.index_inserts,
            index_removes: counters.index_removes,
        })
        .collect();
    models.sort_by(|a, b| {
        b.rows_loaded
            .cmp(&a.rows_loaded)
            .then_with(|| a.model.cmp(&b.model))
    });

    EventReport {
        counters: snap,
        models,
    }
}
