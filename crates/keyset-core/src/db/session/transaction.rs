//! Module: db::session::transaction
//! Responsibility: the pipelined unit of work. Stages every pending write of
//! a session into one atomic pipeline and reconciles the outcome.
//! Invariants: no partition is cleared until the pipeline succeeds; a
//! failed commit leaves the session exactly as it was before `commit`.

use crate::{
    PRIMARY_KEY,
    config::EngineConfig,
    db::{
        backend::{Backend, Command, Pipeline, PipelineMode, Reply, run_pipeline},
        index::{IndexWriter, ObjectWrite, WriteBatch},
        key::KeyNamespace,
        query::{Query, QueryExecutor},
        session::{Iid, Instance, SessionModel},
    },
    error::{ErrorClass, ErrorOrigin, InternalError},
    model::ModelMeta,
    obs::sink::{self, MetricsEvent},
    types::Id,
    value::Value,
};
use indexmap::IndexMap;
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};
use thiserror::Error as ThisError;
use ulid::Ulid;

///
/// TransactionError
///

#[derive(Debug, ThisError)]
pub enum TransactionError {
    #[error("transaction {id} is already closed")]
    Closed { id: Ulid },

    #[error("no transaction is open: transaction already closed")]
    NotOpen,

    #[error("transaction {id} is already open")]
    AlreadyOpen { id: Ulid },
}

impl From<TransactionError> for InternalError {
    fn from(err: TransactionError) -> Self {
        Self::classified(
            ErrorClass::InvalidState,
            ErrorOrigin::Transaction,
            err.to_string(),
        )
    }
}

///
/// TransactionStatus
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransactionStatus {
    Open,
    Committed,
    RolledBack,
    Failed,
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Open => "open",
            Self::Committed => "committed",
            Self::RolledBack => "rolled_back",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

///
/// Transaction
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Transaction {
    id: Ulid,
    status: TransactionStatus,
}

impl Transaction {
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: Ulid::new(),
            status: TransactionStatus::Open,
        }
    }

    #[must_use]
    pub const fn id(&self) -> Ulid {
        self.id
    }

    #[must_use]
    pub const fn status(&self) -> TransactionStatus {
        self.status
    }

    #[must_use]
    pub const fn is_open(&self) -> bool {
        matches!(self.status, TransactionStatus::Open)
    }

    pub const fn ensure_open(&self) -> Result<(), TransactionError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(TransactionError::Closed { id: self.id })
        }
    }

    /// Move to a terminal status. Closing twice is an error.
    pub fn close(&mut self, status: TransactionStatus) -> Result<(), TransactionError> {
        self.ensure_open()?;
        self.status = status;
        tracing::debug!(transaction = %self.id, %status, "transaction closed");
        Ok(())
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

///
/// CommitAction
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CommitAction {
    Saved,
    Deleted,
}

///
/// ModelCommitResult
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ModelCommitResult {
    pub model: String,
    pub action: CommitAction,
    /// Ids in staging order.
    pub ids: Vec<Id>,
}

///
/// CommitReport
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommitReport {
    pub transaction: Ulid,
    pub results: Vec<ModelCommitResult>,
    /// Write commands dispatched in the commit pipeline.
    pub writes: u64,
}

impl CommitReport {
    /// Ids saved for `model`, in staging order.
    #[must_use]
    pub fn saved(&self, model: &str) -> &[Id] {
        self.ids(model, CommitAction::Saved)
    }

    #[must_use]
    pub fn deleted(&self, model: &str) -> &[Id] {
        self.ids(model, CommitAction::Deleted)
    }

    fn ids(&self, model: &str, action: CommitAction) -> &[Id] {
        self.results
            .iter()
            .find(|r| r.model == model && r.action == action)
            .map_or(&[], |r| r.ids.as_slice())
    }
}

// ----------------------------------------------------------------------
// Commit protocol
// ----------------------------------------------------------------------

/// Drained deletions of one model.
struct Drained {
    model: String,
    instances: Vec<Instance>,
    queries: Vec<Query>,
}

/// Staged outcome of one model.
struct ModelPlan {
    model: String,
    saved: Vec<(Iid, Id, BTreeMap<String, Value>)>,
    deleted: Vec<Id>,
}

/// One staged object read and the fields it asked for after `id`.
struct Read {
    index: usize,
    fields: Vec<String>,
}

pub(crate) struct CommitContext<'a, B: Backend + ?Sized> {
    pub backend: &'a B,
    pub keys: &'a KeyNamespace,
    pub config: &'a EngineConfig,
}

impl<B: Backend + ?Sized> CommitContext<'_, B> {
    /// Run the commit protocol for every model of the session.
    pub(crate) fn commit(
        self,
        models: &mut IndexMap<String, SessionModel>,
        transaction: &Transaction,
    ) -> Result<CommitReport, InternalError> {
        transaction.ensure_open()?;
        sink::record(MetricsEvent::CommitStart);

        let drained: Vec<Drained> = models
            .values_mut()
            .filter(|model| model.has_pending())
            .map(|model| {
                let (instances, queries) = model.pre_commit();
                Drained {
                    model: model.meta().name().to_string(),
                    instances,
                    queries,
                }
            })
            .collect();

        let outcome = self.stage(models, &drained).and_then(|(pipeline, plans)| {
            let writes = pipeline.write_count() as u64;
            tracing::debug!(
                transaction = %transaction.id(),
                commands = pipeline.len(),
                writes,
                "dispatching commit pipeline"
            );
            run_pipeline(self.backend, pipeline, PipelineMode::Transaction)?;
            Ok((plans, writes))
        });

        let (plans, writes) = match outcome {
            Ok(outcome) => outcome,
            Err(err) => {
                for drained in drained {
                    if let Some(model) = models.get_mut(&drained.model) {
                        model.restore(drained.instances, drained.queries);
                    }
                }
                tracing::warn!(transaction = %transaction.id(), error = %err, "commit failed");
                return Err(err);
            }
        };

        let report = reconcile(models, plans, transaction.id(), writes)?;
        sink::record(MetricsEvent::CommitFinish { writes });

        Ok(report)
    }

    fn stage(
        &self,
        models: &IndexMap<String, SessionModel>,
        drained: &[Drained],
    ) -> Result<(Pipeline, Vec<ModelPlan>), InternalError> {
        // ids to delete per model
        let mut delete_ids: BTreeMap<&str, Vec<Id>> = BTreeMap::new();
        let executor = QueryExecutor::new(self.backend, self.keys, self.config);
        for entry in drained {
            let mut ids: Vec<Id> = entry.instances.iter().filter_map(|i| i.id().cloned()).collect();
            for query in &entry.queries {
                ids.extend(executor.load_ids(query)?);
            }
            let mut seen = BTreeSet::new();
            ids.retain(|id| seen.insert(id.clone()));
            delete_ids.insert(entry.model.as_str(), ids);
        }

        // one batched read: old values, id reservations, prefetches
        let mut reads = Pipeline::new();
        let mut delete_reads: BTreeMap<(&str, Id), Read> = BTreeMap::new();
        let mut prefetch_reads: BTreeMap<(&str, Iid), Read> = BTreeMap::new();
        let mut reservations: BTreeMap<&str, (usize, i64)> = BTreeMap::new();

        for (name, model) in models {
            let meta = model.meta();
            let tracked = meta.tracked_fields();

            for id in delete_ids.get(name.as_str()).into_iter().flatten() {
                let read = self.stage_read(&mut reads, meta, id, &tracked);
                delete_reads.insert((name.as_str(), id.clone()), read);
            }

            let auto = model.new_instances().filter(|i| i.id().is_none()).count();
            if auto > 0 {
                let delta = i64::try_from(auto)
                    .map_err(|_| InternalError::session_invariant("too many new instances"))?;
                let index = reads.push(Command::IncrBy {
                    key: self.keys.sequence_key(meta),
                    delta,
                });
                reservations.insert(name.as_str(), (index, delta));
            }

            for instance in model.new_instances().chain(model.modified_instances()) {
                let Some(id) = instance.id() else {
                    continue;
                };
                let unknown = instance.unknown_fields(&tracked);
                // explicit ids on new instances always check for an existing object
                if unknown.is_empty() && instance.is_persistent() {
                    continue;
                }
                let read = self.stage_read(&mut reads, meta, id, &unknown);
                prefetch_reads.insert((name.as_str(), instance.iid().clone()), read);
            }
        }

        let mut replies = run_pipeline(self.backend, reads, PipelineMode::Batch)?;
        let mut take = |index: usize| std::mem::replace(&mut replies[index], Reply::Nil);

        // writes: every removal lands ahead of every addition
        let mut batch = WriteBatch::new();
        let mut plans = Vec::new();

        for (name, model) in models {
            let meta = model.meta();
            let writer = IndexWriter::new(self.keys, meta);
            let mut plan = ModelPlan {
                model: name.clone(),
                saved: Vec::new(),
                deleted: Vec::new(),
            };

            let mut reserved = match reservations.get(name.as_str()) {
                Some(&(index, delta)) => {
                    let last = take(index).into_int()?;
                    (last - delta + 1..=last).map(Id::from).collect::<Vec<_>>()
                }
                None => Vec::new(),
            }
            .into_iter();

            for instance in model.new_instances().chain(model.modified_instances()) {
                let prefetched = match prefetch_reads.get(&(name.as_str(), instance.iid().clone())) {
                    Some(read) => decode_read(meta, &read.fields, take(read.index))?,
                    None => None,
                };
                let (id, newly_created) = match instance.id() {
                    Some(id) if instance.is_persistent() => (id.clone(), false),
                    Some(id) => (id.clone(), prefetched.is_none()),
                    None => {
                        let id = reserved.next().ok_or_else(|| {
                            InternalError::session_invariant("id reservation exhausted")
                        })?;
                        (id, true)
                    }
                };

                let mut old = instance.snapshot().clone();
                let mut new = BTreeMap::new();
                if let Some(prefetched) = prefetched {
                    for (field, value) in prefetched {
                        if !instance.covers(&field) {
                            new.insert(field.clone(), value.clone());
                        }
                        old.insert(field, value);
                    }
                }
                new.extend(instance.values().iter().map(|(k, v)| (k.clone(), v.clone())));

                writer.apply(
                    &mut batch,
                    &ObjectWrite {
                        id: &id,
                        newly_created,
                        values: &new,
                        old_values: &old,
                    },
                );
                plan.saved.push((instance.iid().clone(), id, new));
            }

            for id in delete_ids.get(name.as_str()).into_iter().flatten() {
                let Some(read) = delete_reads.get(&(name.as_str(), id.clone())) else {
                    continue;
                };
                // already gone: nothing to unindex
                let Some(old) = decode_read(meta, &read.fields, take(read.index))? else {
                    continue;
                };
                writer.remove(&mut batch, id, &old);
                plan.deleted.push(id.clone());
            }

            plans.push(plan);
        }

        Ok((batch.into_pipeline(), plans))
    }

    fn stage_read(&self, reads: &mut Pipeline, meta: &ModelMeta, id: &Id, fields: &[&str]) -> Read {
        let fields: Vec<String> = fields.iter().map(ToString::to_string).collect();
        let index = reads.push(Command::HMGet {
            key: self.keys.object_key(meta, id),
            fields: std::iter::once(PRIMARY_KEY.to_string())
                .chain(fields.iter().cloned())
                .collect(),
        });
        Read { index, fields }
    }
}

/// Decode an `[id, fields...]` read; `None` when the object does not exist.
fn decode_read(
    meta: &ModelMeta,
    fields: &[String],
    reply: Reply,
) -> Result<Option<BTreeMap<String, Value>>, InternalError> {
    let mut values = reply.into_opt_strings()?.into_iter();
    if values.next().flatten().is_none() {
        return Ok(None);
    }

    let mut decoded = BTreeMap::new();
    for (field, raw) in fields.iter().zip(values) {
        let (Some(raw), Some(model)) = (raw, meta.field(field)) else {
            continue;
        };
        decoded.insert(field.clone(), Value::from_store(model.kind(), &raw)?);
    }

    Ok(Some(decoded))
}

/// Move confirmed instances to `loaded`, evict deleted ids, build the report.
fn reconcile(
    models: &mut IndexMap<String, SessionModel>,
    plans: Vec<ModelPlan>,
    transaction: Ulid,
    writes: u64,
) -> Result<CommitReport, InternalError> {
    let mut report = CommitReport {
        transaction,
        results: Vec::new(),
        writes,
    };
    let mut conflict = None;

    for plan in plans {
        let Some(model) = models.get_mut(&plan.model) else {
            continue;
        };

        let mut saved = Vec::with_capacity(plan.saved.len());
        for (iid, id, written) in plan.saved {
            let Some(mut instance) = model.take_pending(&iid) else {
                continue;
            };
            match instance.mark_persisted(id.clone(), written) {
                Ok(()) => {
                    model.insert_loaded(instance);
                    saved.push(id);
                }
                Err(err) => {
                    tracing::warn!(model = %plan.model, error = %err, "reconciliation rejected");
                    // keep local state untouched for the caller to inspect
                    model.insert_modified(instance);
                    conflict.get_or_insert(err);
                }
            }
        }
        model.evict(&plan.deleted);

        tracing::debug!(
            model = %plan.model,
            saved = saved.len(),
            deleted = plan.deleted.len(),
            "commit reconciled"
        );
        if !saved.is_empty() {
            report.results.push(ModelCommitResult {
                model: plan.model.clone(),
                action: CommitAction::Saved,
                ids: saved,
            });
        }
        if !plan.deleted.is_empty() {
            report.results.push(ModelCommitResult {
                model: plan.model,
                action: CommitAction::Deleted,
                ids: plan.deleted,
            });
        }
    }

    match conflict {
        Some(err) => Err(InternalError::from(err)),
        None => Ok(report),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db::session::Partition, test_fixtures::item_meta};

    fn persisted(id: u64) -> Instance {
        Instance::from_store(item_meta(), Id::from(id), vec![("rank".into(), "1".into())], None)
            .expect("stored item should decode")
    }

    #[test]
    fn rejected_reconciliation_keeps_the_instance_modified() {
        let mut model = SessionModel::new(item_meta());
        let stale = model.add(persisted(5), true).expect("stale copy should add");
        let fresh = model.add(persisted(7), true).expect("fresh copy should add");
        let mut models = IndexMap::new();
        models.insert("item".to_string(), model);

        let plans = vec![ModelPlan {
            model: "item".to_string(),
            saved: vec![
                (stale.clone(), Id::from(6_u64), BTreeMap::new()),
                (fresh.clone(), Id::from(7_u64), BTreeMap::new()),
            ],
            deleted: Vec::new(),
        }];

        let err = reconcile(&mut models, plans, Ulid::new(), 4)
            .expect_err("changed id should surface as a conflict");
        assert_eq!(err.class, ErrorClass::Conflict);

        let model = &models["item"];
        assert_eq!(model.partition_of(&stale), Some(Partition::Modified));
        assert_eq!(model.partition_of(&fresh), Some(Partition::Loaded));
    }
}
