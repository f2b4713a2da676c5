//! Per-model identity map.
//!
//! Every identity token lives in at most one of the four partitions. Moves
//! between partitions always remove before they insert.

use crate::{
    db::{
        query::Query,
        session::{Iid, Instance, SessionError},
    },
    model::ModelMeta,
    types::Id,
};
use indexmap::IndexMap;
use std::sync::Arc;

///
/// Partition
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Partition {
    New,
    Modified,
    Loaded,
    Deleted,
}

///
/// SessionModel
///

#[derive(Debug)]
pub struct SessionModel {
    meta: Arc<ModelMeta>,
    new: IndexMap<Iid, Instance>,
    modified: IndexMap<Iid, Instance>,
    loaded: IndexMap<Iid, Instance>,
    deleted: IndexMap<Iid, Instance>,
    delete_queries: Vec<Query>,
}

impl SessionModel {
    #[must_use]
    pub fn new(meta: Arc<ModelMeta>) -> Self {
        Self {
            meta,
            new: IndexMap::new(),
            modified: IndexMap::new(),
            loaded: IndexMap::new(),
            deleted: IndexMap::new(),
            delete_queries: Vec::new(),
        }
    }

    #[must_use]
    pub const fn meta(&self) -> &Arc<ModelMeta> {
        &self.meta
    }

    /// Pending instances: new, modified, and deleted.
    #[must_use]
    pub fn len(&self) -> usize {
        self.new.len() + self.modified.len() + self.deleted.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether commit has anything to stage for this model.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.is_empty() || !self.delete_queries.is_empty()
    }

    #[must_use]
    pub fn partition_of(&self, iid: &Iid) -> Option<Partition> {
        if self.new.contains_key(iid) {
            Some(Partition::New)
        } else if self.modified.contains_key(iid) {
            Some(Partition::Modified)
        } else if self.loaded.contains_key(iid) {
            Some(Partition::Loaded)
        } else if self.deleted.contains_key(iid) {
            Some(Partition::Deleted)
        } else {
            None
        }
    }

    #[must_use]
    pub fn get(&self, iid: &Iid) -> Option<&Instance> {
        self.new
            .get(iid)
            .or_else(|| self.modified.get(iid))
            .or_else(|| self.loaded.get(iid))
            .or_else(|| self.deleted.get(iid))
    }

    pub fn new_instances(&self) -> impl Iterator<Item = &Instance> {
        self.new.values()
    }

    pub fn modified_instances(&self) -> impl Iterator<Item = &Instance> {
        self.modified.values()
    }

    pub fn loaded_instances(&self) -> impl Iterator<Item = &Instance> {
        self.loaded.values()
    }

    pub fn deleted_instances(&self) -> impl Iterator<Item = &Instance> {
        self.deleted.values()
    }

    // ------------------------------------------------------------------
    // Bookkeeping
    // ------------------------------------------------------------------

    /// Track `instance`; persistent instances go to `modified` or `loaded`.
    pub fn add(&mut self, instance: Instance, modified: bool) -> Result<Iid, SessionError> {
        let iid = instance.iid().clone();
        if instance.state().deleted || self.deleted.contains_key(&iid) {
            return Err(SessionError::DeletedInstance {
                model: self.meta.name().to_string(),
                iid,
            });
        }

        if !instance.is_persistent() {
            self.expunge(&iid);
            self.new.insert(iid.clone(), instance);
        } else if modified {
            self.expunge(&iid);
            self.modified.insert(iid.clone(), instance);
        } else if self.modified.contains_key(&iid) {
            // a clean copy never replaces pending edits
        } else {
            self.expunge(&iid);
            self.loaded.insert(iid.clone(), instance);
        }

        Ok(iid)
    }

    /// Mutate a held instance; loaded instances become modified.
    pub fn update<T>(
        &mut self,
        iid: &Iid,
        f: impl FnOnce(&mut Instance) -> T,
    ) -> Result<T, SessionError> {
        if self.deleted.contains_key(iid) {
            return Err(SessionError::DeletedInstance {
                model: self.meta.name().to_string(),
                iid: iid.clone(),
            });
        }
        if let Some(instance) = self.loaded.shift_remove(iid) {
            self.modified.insert(iid.clone(), instance);
        }

        let instance = self
            .new
            .get_mut(iid)
            .or_else(|| self.modified.get_mut(iid))
            .ok_or_else(|| SessionError::NotTracked {
                model: self.meta.name().to_string(),
                iid: iid.clone(),
            })?;

        Ok(f(instance))
    }

    /// Mark for deletion. Never-persisted instances are dropped outright.
    /// Returns whether the identity was tracked.
    pub fn delete(&mut self, iid: &Iid) -> bool {
        let Some(mut instance) = self.expunge(iid) else {
            return false;
        };
        if instance.is_persistent() {
            instance.mark_deleted();
            self.deleted.insert(iid.clone(), instance);
        }
        true
    }

    /// Remove `iid` from whichever partition holds it.
    pub fn expunge(&mut self, iid: &Iid) -> Option<Instance> {
        self.new
            .shift_remove(iid)
            .or_else(|| self.modified.shift_remove(iid))
            .or_else(|| self.loaded.shift_remove(iid))
            .or_else(|| self.deleted.shift_remove(iid))
    }

    pub fn add_delete_query(&mut self, query: Query) {
        self.delete_queries.push(query);
    }

    // ------------------------------------------------------------------
    // Commit protocol
    // ------------------------------------------------------------------

    /// Drain deleted instances and delete queries for staging.
    pub(crate) fn pre_commit(&mut self) -> (Vec<Instance>, Vec<Query>) {
        let deleted = self.deleted.drain(..).map(|(_, instance)| instance).collect();
        let queries = std::mem::take(&mut self.delete_queries);
        (deleted, queries)
    }

    /// Put back what `pre_commit` drained after a failed commit.
    pub(crate) fn restore(&mut self, deleted: Vec<Instance>, queries: Vec<Query>) {
        for instance in deleted {
            self.deleted.insert(instance.iid().clone(), instance);
        }
        let mut queries = queries;
        queries.append(&mut self.delete_queries);
        self.delete_queries = queries;
    }

    /// Take a pending instance out for reconciliation.
    pub(crate) fn take_pending(&mut self, iid: &Iid) -> Option<Instance> {
        self.new
            .shift_remove(iid)
            .or_else(|| self.modified.shift_remove(iid))
    }

    /// Insert a reconciled instance as loaded.
    pub(crate) fn insert_loaded(&mut self, instance: Instance) {
        let iid = instance.iid().clone();
        self.expunge(&iid);
        self.loaded.insert(iid, instance);
    }

    /// Put back a pending instance whose reconciliation was rejected.
    pub(crate) fn insert_modified(&mut self, instance: Instance) {
        let iid = instance.iid().clone();
        self.expunge(&iid);
        self.modified.insert(iid, instance);
    }

    /// Drop every identity for ids the store deleted.
    pub(crate) fn evict(&mut self, ids: &[Id]) {
        for id in ids {
            self.expunge(&Iid::Persistent(id.clone()));
        }
    }
}
