//! Module: db::index
//! Responsibility: stage the exact writes that keep object hashes, the
//! ids container, unique lookups, and index containers consistent.
//! Invariants: every removal is a no-op when the old mapping is already
//! absent, so re-applying a partially applied commit is safe. Within one
//! batch every removal runs before any addition, so a unique value handed
//! from one object to another survives the commit.


use crate::{
    PRIMARY_KEY,
    db::{
        backend::{Command, Pipeline},
        key::KeyNamespace,
    },
    model::{FieldModel, ModelMeta},
    obs::sink::{self, MetricsEvent},
    types::Id,
    value::Value,
};
use std::collections::BTreeMap;

static NULL: Value = Value::Null;

///
/// IndexEntry
/// One changed indexed field of a dirty instance.
///

#[derive(Clone, Debug, PartialEq)]
pub struct IndexEntry {
    pub field: String,
    pub old: Value,
    pub new: Value,
}

///
/// IndexDelta
///

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct IndexDelta {
    pub inserts: u64,
    pub removes: u64,
}

impl IndexDelta {
    const fn insert(&mut self) {
        self.inserts = self.inserts.saturating_add(1);
    }

    const fn remove(&mut self) {
        self.removes = self.removes.saturating_add(1);
    }
}

///
/// ObjectWrite
///
/// New state of one instance plus the server-confirmed values it replaces.
/// Fields missing from `old_values` are treated as null.
///

#[derive(Clone, Copy, Debug)]
pub struct ObjectWrite<'a> {
    pub id: &'a Id,
    pub newly_created: bool,
    pub values: &'a BTreeMap<String, Value>,
    pub old_values: &'a BTreeMap<String, Value>,
}

///
/// WriteBatch
///
/// Staged writes of one commit, kept in two phases. Removals of old
/// mappings all precede additions of new ones in the final pipeline.
///

#[derive(Clone, Debug, Default)]
pub struct WriteBatch {
    removals: Pipeline,
    additions: Pipeline,
}

impl WriteBatch {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            removals: Pipeline::new(),
            additions: Pipeline::new(),
        }
    }

    /// Every removal, then every addition.
    #[must_use]
    pub fn into_pipeline(self) -> Pipeline {
        let mut pipeline = self.removals;
        pipeline.extend(self.additions.into_commands());
        pipeline
    }
}

///
/// IndexWriter
///

#[derive(Clone, Copy, Debug)]
pub struct IndexWriter<'a> {
    keys: &'a KeyNamespace,
    meta: &'a ModelMeta,
}

impl<'a> IndexWriter<'a> {
    #[must_use]
    pub const fn new(keys: &'a KeyNamespace, meta: &'a ModelMeta) -> Self {
        Self { keys, meta }
    }

    /// Indexed fields whose value differs between old and new state.
    #[must_use]
    pub fn entries(&self, write: &ObjectWrite<'_>) -> Vec<IndexEntry> {
        self.meta
            .indexed_fields()
            .filter_map(|field| {
                let old = old_value(write, field.name());
                let new = write.values.get(field.name()).unwrap_or(&NULL);
                (write.newly_created || old != new).then(|| IndexEntry {
                    field: field.name().to_string(),
                    old: old.clone(),
                    new: new.clone(),
                })
            })
            .collect()
    }

    /// Stage the object hash and every index change for `write`.
    pub fn apply(&self, batch: &mut WriteBatch, write: &ObjectWrite<'_>) -> IndexDelta {
        let meta = self.meta;
        let keys = self.keys;
        let id = write.id.as_str();
        let object_key = keys.object_key(meta, write.id);
        let mut delta = IndexDelta::default();

        // object hash
        let mut pairs = vec![(PRIMARY_KEY.to_string(), id.to_string())];
        let mut cleared = Vec::new();
        for field in meta.fields() {
            match write.values.get(field.name()).and_then(Value::to_store) {
                Some(raw) => pairs.push((field.name().to_string(), raw)),
                None if !write.newly_created && !old_value(write, field.name()).is_null() => {
                    cleared.push(field.name().to_string());
                }
                None => {}
            }
        }
        batch.additions.push(Command::HSet {
            key: object_key.clone(),
            pairs,
        });
        if !cleared.is_empty() {
            batch.additions.push(Command::HDel {
                key: object_key,
                fields: cleared,
            });
        }

        // ids container
        let score = meta.score(write.values);
        let rescored = meta.is_ordered() && score != meta.score(write.old_values);
        if write.newly_created || rescored {
            batch.additions.push(self.add_member(keys.ids_key(meta), id, score));
        }

        // unique lookups and index containers
        for entry in self.entries(write) {
            let Some(field) = meta.field(&entry.field) else {
                continue;
            };
            if field.is_unique() {
                self.stage_unique(batch, field, &entry, write, &mut delta);
            } else {
                if !write.newly_created {
                    batch.removals.push(self.remove_member(
                        keys.index_key(meta, field.name(), &entry.old),
                        id,
                    ));
                    delta.remove();
                }
                batch.additions.push(self.add_member(
                    keys.index_key(meta, field.name(), &entry.new),
                    id,
                    score,
                ));
                delta.insert();
            }
        }

        // unchanged index memberships still carry the old score
        if rescored && !write.newly_created {
            for field in meta.indexed_fields().filter(|f| !f.is_unique()) {
                let value = write.values.get(field.name()).unwrap_or(&NULL);
                if old_value(write, field.name()) == value {
                    batch.additions.push(self.add_member(
                        keys.index_key(meta, field.name(), value),
                        id,
                        score,
                    ));
                }
            }
        }

        self.record(delta);
        delta
    }

    /// Stage removal of an object and every index entry derived from `old_values`.
    pub fn remove(
        &self,
        batch: &mut WriteBatch,
        id: &Id,
        old_values: &BTreeMap<String, Value>,
    ) -> IndexDelta {
        let meta = self.meta;
        let keys = self.keys;
        let mut delta = IndexDelta::default();

        let pipeline = &mut batch.removals;
        pipeline.push(Command::Del {
            keys: vec![keys.object_key(meta, id)],
        });
        pipeline.push(self.remove_member(keys.ids_key(meta), id.as_str()));

        for field in meta.indexed_fields() {
            let old = old_values.get(field.name()).unwrap_or(&NULL);
            if field.is_unique() {
                if old.is_null() {
                    continue;
                }
                pipeline.push(Command::HDel {
                    key: keys.unique_key(meta, field.name()),
                    fields: vec![old.index_token()],
                });
            } else {
                pipeline.push(self.remove_member(
                    keys.index_key(meta, field.name(), old),
                    id.as_str(),
                ));
            }
            delta.remove();
        }

        self.record(delta);
        delta
    }

    fn stage_unique(
        &self,
        batch: &mut WriteBatch,
        field: &FieldModel,
        entry: &IndexEntry,
        write: &ObjectWrite<'_>,
        delta: &mut IndexDelta,
    ) {
        let key = self.keys.unique_key(self.meta, field.name());

        if !write.newly_created && !entry.old.is_null() {
            batch.removals.push(Command::HDel {
                key: key.clone(),
                fields: vec![entry.old.index_token()],
            });
            delta.remove();
        }
        if !entry.new.is_null() {
            batch.additions.push(Command::HSet {
                key,
                pairs: vec![(entry.new.index_token(), write.id.to_string())],
            });
            delta.insert();
        }
    }

    fn add_member(&self, key: String, member: &str, score: f64) -> Command {
        if self.meta.is_ordered() {
            Command::ZAdd {
                key,
                entries: vec![(score, member.to_string())],
            }
        } else {
            Command::SAdd {
                key,
                members: vec![member.to_string()],
            }
        }
    }

    fn remove_member(&self, key: String, member: &str) -> Command {
        let members = vec![member.to_string()];
        if self.meta.is_ordered() {
            Command::ZRem { key, members }
        } else {
            Command::SRem { key, members }
        }
    }

    fn record(&self, delta: IndexDelta) {
        if delta != IndexDelta::default() {
            sink::record(MetricsEvent::IndexDelta {
                model: self.meta.name(),
                inserts: delta.inserts,
                removes: delta.removes,
            });
        }
    }
}

fn old_value<'v>(write: &ObjectWrite<'v>, field: &str) -> &'v Value {
    if write.newly_created {
        return &NULL;
    }
    write.old_values.get(field).unwrap_or(&NULL)
}
