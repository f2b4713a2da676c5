//! Module: db::session
//! Responsibility: the unit of work. Tracks instances per model in an
//! identity map, runs queries through it, and commits pending changes as
//! one atomic pipeline.
//! Does not own: key layout (key), index maintenance (index), or query
//! compilation (query).
//! Invariants: an identity appears in at most one partition; no write
//! reaches the store before `commit`.

mod instance;
mod listener;
mod model;
mod transaction;

#[cfg(test)]
mod tests;

pub use instance::{Iid, Instance, InstanceState};
pub use listener::{CommitEvent, CommitListener};
pub use model::{Partition, SessionModel};
pub use transaction::{
    CommitAction, CommitReport, ModelCommitResult, Transaction, TransactionError,
    TransactionStatus,
};

use crate::{
    config::EngineConfig,
    db::{
        backend::{Backend, Command, Reply},
        key::KeyNamespace,
        query::{Query, QueryExecutor, compile},
    },
    error::{ErrorClass, ErrorOrigin, InternalError},
    model::ModelMeta,
    obs::sink::{MetricsSink, with_metrics_sink},
    types::Id,
    value::Value,
};
use indexmap::IndexMap;
use std::sync::Arc;
use thiserror::Error as ThisError;
use transaction::CommitContext;

///
/// SessionError
///

#[derive(Debug, ThisError)]
pub enum SessionError {
    #[error("{model} instance {iid} is marked for deletion")]
    DeletedInstance { model: String, iid: Iid },

    #[error("{model} instance {iid} is not tracked by this session")]
    NotTracked { model: String, iid: Iid },

    #[error("{model} id changed from {from} to {to} during reconciliation")]
    IdChanged { model: String, from: Id, to: Id },

    #[error("{model} lookup matched {count} objects")]
    MultipleObjects { model: String, count: usize },
}

impl SessionError {
    const fn class(&self) -> ErrorClass {
        match self {
            Self::DeletedInstance { .. } => ErrorClass::InvalidState,
            Self::NotTracked { .. } => ErrorClass::NotFound,
            Self::IdChanged { .. } | Self::MultipleObjects { .. } => ErrorClass::Conflict,
        }
    }
}

impl From<SessionError> for InternalError {
    fn from(err: SessionError) -> Self {
        Self::classified(err.class(), ErrorOrigin::Session, err.to_string())
    }
}

///
/// Session
///
/// Owns one `SessionModel` per model touched and at most one open
/// transaction. All store access goes through the shared backend handle.
///

pub struct Session<B: Backend + ?Sized> {
    backend: Arc<B>,
    config: EngineConfig,
    keys: KeyNamespace,
    models: IndexMap<String, SessionModel>,
    transaction: Option<Transaction>,
    listeners: Vec<Arc<dyn CommitListener>>,
    metrics: Option<Arc<dyn MetricsSink>>,
}

impl<B: Backend + ?Sized> Session<B> {
    #[must_use]
    pub fn new(backend: Arc<B>, config: EngineConfig) -> Self {
        let keys = config.key_namespace();
        Self {
            backend,
            config,
            keys,
            models: IndexMap::new(),
            transaction: None,
            listeners: Vec::new(),
            metrics: None,
        }
    }

    /// Route this session's metrics to `sink` instead of the global state.
    #[must_use]
    pub fn metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(sink);
        self
    }

    #[must_use]
    pub const fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub const fn keys(&self) -> &KeyNamespace {
        &self.keys
    }

    /// Register a listener invoked after every successful commit.
    pub fn subscribe(&mut self, listener: Arc<dyn CommitListener>) {
        self.listeners.push(listener);
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    pub fn begin(&mut self) -> Result<&Transaction, InternalError> {
        if let Some(open) = &self.transaction {
            return Err(TransactionError::AlreadyOpen { id: open.id() }.into());
        }

        let transaction = self.transaction.insert(Transaction::new());
        tracing::debug!(transaction = %transaction.id(), "transaction begun");

        Ok(transaction)
    }

    #[must_use]
    pub const fn transaction(&self) -> Option<&Transaction> {
        self.transaction.as_ref()
    }

    /// Commit every pending change, beginning a transaction if none is open.
    /// The transaction is closed whatever the outcome; on failure pending
    /// state is left as it was and the commit may be retried.
    pub fn commit(&mut self) -> Result<CommitReport, InternalError> {
        let mut transaction = self.transaction.take().unwrap_or_default();

        let context = CommitContext {
            backend: &*self.backend,
            keys: &self.keys,
            config: &self.config,
        };
        let models = &mut self.models;
        let result = with_metrics_sink(self.metrics.clone(), || {
            context.commit(models, &transaction)
        });

        let status = if result.is_ok() {
            TransactionStatus::Committed
        } else {
            TransactionStatus::Failed
        };
        transaction.close(status)?;

        let report = result?;
        self.notify(&report);

        Ok(report)
    }

    /// Close the open transaction. Nothing was sent, so the store is
    /// untouched; pending instances stay tracked.
    pub fn rollback(&mut self) -> Result<(), InternalError> {
        let mut transaction = self.transaction.take().ok_or(TransactionError::NotOpen)?;
        transaction.close(TransactionStatus::RolledBack)?;

        Ok(())
    }

    fn notify(&self, report: &CommitReport) {
        if self.listeners.is_empty() {
            return;
        }
        for result in &report.results {
            let event = match result.action {
                CommitAction::Saved => CommitEvent::Saved {
                    model: result.model.clone(),
                    ids: result.ids.clone(),
                    transaction: report.transaction,
                },
                CommitAction::Deleted => CommitEvent::Deleted {
                    model: result.model.clone(),
                    ids: result.ids.clone(),
                    transaction: report.transaction,
                },
            };
            for listener in &self.listeners {
                listener.on_commit(&event);
            }
        }
    }

    // ------------------------------------------------------------------
    // Identity map
    // ------------------------------------------------------------------

    fn model_mut(&mut self, meta: &Arc<ModelMeta>) -> &mut SessionModel {
        self.models
            .entry(meta.name().to_string())
            .or_insert_with(|| SessionModel::new(Arc::clone(meta)))
    }

    #[must_use]
    pub fn model(&self, meta: &ModelMeta) -> Option<&SessionModel> {
        self.models.get(meta.name())
    }

    /// Track `instance` as new or modified.
    pub fn add(&mut self, instance: Instance) -> Result<Iid, InternalError> {
        let meta = Arc::clone(instance.meta());
        Ok(self.model_mut(&meta).add(instance, true)?)
    }

    /// Track a persistent instance as clean.
    pub fn add_loaded(&mut self, instance: Instance) -> Result<Iid, InternalError> {
        let meta = Arc::clone(instance.meta());
        Ok(self.model_mut(&meta).add(instance, false)?)
    }

    #[must_use]
    pub fn instance(&self, meta: &ModelMeta, iid: &Iid) -> Option<&Instance> {
        self.model(meta).and_then(|model| model.get(iid))
    }

    /// Identity-map lookup by store id; never touches the store.
    #[must_use]
    pub fn get(&self, meta: &ModelMeta, id: &Id) -> Option<&Instance> {
        self.instance(meta, &Iid::Persistent(id.clone()))
    }

    #[must_use]
    pub fn contains_instance(&self, meta: &ModelMeta, iid: &Iid) -> bool {
        self.model(meta)
            .is_some_and(|model| model.partition_of(iid).is_some())
    }

    /// Mutate a tracked instance; loaded instances become modified.
    pub fn update<T>(
        &mut self,
        meta: &Arc<ModelMeta>,
        iid: &Iid,
        f: impl FnOnce(&mut Instance) -> T,
    ) -> Result<T, InternalError> {
        Ok(self.model_mut(meta).update(iid, f)?)
    }

    /// Mark a tracked identity for deletion. Returns whether it was tracked.
    pub fn delete(&mut self, meta: &Arc<ModelMeta>, iid: &Iid) -> bool {
        self.model_mut(meta).delete(iid)
    }

    /// Track `instance` if needed, then mark it for deletion.
    pub fn delete_instance(&mut self, instance: Instance) -> Result<bool, InternalError> {
        let meta = Arc::clone(instance.meta());
        let iid = instance.iid().clone();
        let model = self.model_mut(&meta);
        if model.partition_of(&iid).is_none() {
            model.add(instance, false)?;
        }

        Ok(model.delete(&iid))
    }

    /// Delete every object `query` matches at commit time.
    pub fn delete_query(&mut self, query: Query) -> Result<(), InternalError> {
        compile::validate(&query)?;
        let meta = Arc::clone(query.meta());
        self.model_mut(&meta).add_delete_query(query);

        Ok(())
    }

    pub fn expunge(&mut self, meta: &ModelMeta, iid: &Iid) -> Option<Instance> {
        self.models
            .get_mut(meta.name())
            .and_then(|model| model.expunge(iid))
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    #[must_use]
    pub fn query(&self, meta: &Arc<ModelMeta>) -> Query {
        Query::new(Arc::clone(meta))
    }

    fn executor(&self) -> QueryExecutor<'_, B> {
        QueryExecutor::new(&*self.backend, &self.keys, &self.config)
    }

    /// Load matching instances through the identity map. Instances with
    /// pending local edits are returned as the session holds them.
    pub fn load(&mut self, query: &Query) -> Result<Vec<Instance>, InternalError> {
        let rows = with_metrics_sink(self.metrics.clone(), || self.executor().load(query))?;
        let model = self.model_mut(query.meta());

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            match model.partition_of(row.iid()) {
                Some(Partition::New | Partition::Modified) => {
                    if let Some(held) = model.get(row.iid()) {
                        out.push(held.clone());
                    }
                }
                Some(Partition::Deleted) => out.push(row),
                Some(Partition::Loaded) | None => {
                    model.insert_loaded(row.clone());
                    out.push(row);
                }
            }
        }

        Ok(out)
    }

    pub fn load_ids(&self, query: &Query) -> Result<Vec<Id>, InternalError> {
        with_metrics_sink(self.metrics.clone(), || self.executor().load_ids(query))
    }

    pub fn count(&self, query: &Query) -> Result<u64, InternalError> {
        with_metrics_sink(self.metrics.clone(), || self.executor().count(query))
    }

    pub fn contains(&self, query: &Query, id: &Id) -> Result<bool, InternalError> {
        with_metrics_sink(self.metrics.clone(), || self.executor().contains(query, id))
    }

    pub fn first(&mut self, query: &Query) -> Result<Option<Instance>, InternalError> {
        Ok(self.load(&query.first_row())?.into_iter().next())
    }

    /// Fetch the single object matching every `(field, value)` pair, or
    /// track a new instance built from them. Returns the identity and
    /// whether it was created.
    pub fn get_or_create(
        &mut self,
        meta: &Arc<ModelMeta>,
        lookup: &[(&str, Value)],
    ) -> Result<(Iid, bool), InternalError> {
        let query = lookup
            .iter()
            .fold(self.query(meta), |query, (field, value)| {
                query.filter(field, value.clone())
            });

        let mut found = self.load(&query)?;
        match found.len() {
            0 => {
                let mut instance = match lookup.iter().find(|(field, _)| Query::is_primary_key(field)) {
                    Some((_, value)) => Instance::with_id(Arc::clone(meta), value.index_token()),
                    None => Instance::new(Arc::clone(meta)),
                };
                for (field, value) in lookup {
                    if !Query::is_primary_key(field) {
                        instance.set(field, value.clone())?;
                    }
                }
                Ok((self.add(instance)?, true))
            }
            1 => {
                let instance = found.swap_remove(0);
                Ok((instance.iid().clone(), false))
            }
            count => Err(SessionError::MultipleObjects {
                model: meta.name().to_string(),
                count,
            }
            .into()),
        }
    }

    // ------------------------------------------------------------------
    // Store maintenance
    // ------------------------------------------------------------------

    /// Remove every key of `meta`. Returns the number of keys removed.
    pub fn flush_model(&mut self, meta: &ModelMeta) -> Result<i64, InternalError> {
        let removed = self
            .backend
            .execute(Command::DelPattern {
                pattern: self.keys.model_pattern(meta),
            })?
            .into_int()?;
        self.models.shift_remove(meta.name());
        tracing::debug!(model = meta.name(), removed, "model flushed");

        Ok(removed)
    }

    /// Remove leftover temporary result keys of `meta`.
    pub fn clean_model(&self, meta: &ModelMeta) -> Result<i64, InternalError> {
        let removed = self
            .backend
            .execute(Command::DelPattern {
                pattern: self.keys.temp_pattern(meta),
            })?
            .into_int()?;

        Ok(removed)
    }

    /// Every live key of `meta`, sorted.
    pub fn model_keys(&self, meta: &ModelMeta) -> Result<Vec<String>, InternalError> {
        let mut keys = self
            .backend
            .execute(Command::Keys {
                pattern: self.keys.model_pattern(meta),
            })
            .and_then(Reply::into_strings)?;
        keys.sort();

        Ok(keys)
    }
}
