//! Module: db::query::algebra
//! Responsibility: stage set algebra over store keys into bounded-lifetime
//! temporary keys, and answer membership/cardinality reads.
//! Invariants: every temp key is followed by its expiry in the same
//! pipeline; scored intersections take scores from the leading key only.

use crate::{
    db::{
        backend::{
            Aggregate, Backend, Command, Pipeline, Reply, SetFamily, SetOp, SortBy, SortCommand,
            SortStore, StoreCommand,
        },
        key::KeyNamespace,
    },
    error::InternalError,
    model::ModelMeta,
    types::Id,
};

///
/// SetAlgebraEngine
///
/// One engine per compiled query. Records every temp key it names so the
/// caller can report and inspect them.
///

#[derive(Debug)]
pub struct SetAlgebraEngine<'a> {
    keys: &'a KeyNamespace,
    meta: &'a ModelMeta,
    family: SetFamily,
    ttl_secs: u64,
    temp_keys: Vec<String>,
}

impl<'a> SetAlgebraEngine<'a> {
    #[must_use]
    pub const fn new(keys: &'a KeyNamespace, meta: &'a ModelMeta, ttl_secs: u64) -> Self {
        let family = if meta.is_ordered() {
            SetFamily::Scored
        } else {
            SetFamily::Plain
        };

        Self {
            keys,
            meta,
            family,
            ttl_secs,
            temp_keys: Vec::new(),
        }
    }

    #[must_use]
    pub const fn family(&self) -> SetFamily {
        self.family
    }

    #[must_use]
    pub fn temp_keys(&self) -> &[String] {
        &self.temp_keys
    }

    #[must_use]
    pub fn into_temp_keys(self) -> Vec<String> {
        self.temp_keys
    }

    // ------------------------------------------------------------------
    // Staged algebra
    // ------------------------------------------------------------------

    /// Intersect `keys` into a fresh temp key. Scores come from `keys[0]`.
    pub fn intersect(&mut self, pipeline: &mut Pipeline, keys: Vec<String>) -> String {
        let weights = (self.family == SetFamily::Scored).then(|| {
            let mut weights = vec![0.0; keys.len()];
            if let Some(first) = weights.first_mut() {
                *first = 1.0;
            }
            weights
        });

        self.store(pipeline, SetOp::Inter, keys, weights, Aggregate::Sum)
    }

    pub fn union(&mut self, pipeline: &mut Pipeline, keys: Vec<String>) -> String {
        self.store(pipeline, SetOp::Union, keys, None, Aggregate::Max)
    }

    /// Members of `key` absent from `minus`.
    pub fn diff(&mut self, pipeline: &mut Pipeline, key: String, minus: String) -> String {
        self.store(pipeline, SetOp::Diff, vec![key, minus], None, Aggregate::Sum)
    }

    /// Literal ids as a temp plain set.
    pub fn load_ids(&mut self, pipeline: &mut Pipeline, ids: &[Id]) -> String {
        let dest = self.keys.temp_key(self.meta);
        pipeline.push(Command::SAdd {
            key: dest.clone(),
            members: ids.iter().map(ToString::to_string).collect(),
        });
        self.expire(pipeline, dest)
    }

    /// Dereference `pattern` for every member of `source` into a temp plain set.
    /// Members whose pattern resolves to nothing are dropped.
    pub fn project(&mut self, pipeline: &mut Pipeline, source: String, pattern: String) -> String {
        let dest = self.keys.temp_key(self.meta);
        pipeline.push(Command::Sort(SortCommand {
            by: SortBy::NoSort,
            get: Some(pattern),
            store: Some(SortStore {
                key: dest.clone(),
                as_set: true,
            }),
            ..SortCommand::new(source)
        }));
        self.expire(pipeline, dest)
    }

    /// Sort `source` into a temp list, by `pattern` or by member.
    pub fn sort_by(
        &mut self,
        pipeline: &mut Pipeline,
        source: String,
        pattern: Option<String>,
        descending: bool,
        alpha: bool,
    ) -> String {
        let dest = self.keys.temp_key(self.meta);
        pipeline.push(Command::Sort(SortCommand {
            by: pattern.map_or(SortBy::Member, SortBy::Pattern),
            descending,
            alpha,
            store: Some(SortStore {
                key: dest.clone(),
                as_set: false,
            }),
            ..SortCommand::new(source)
        }));
        self.expire(pipeline, dest)
    }

    /// Copy `source` into `dest` with a bounded lifetime.
    pub fn copy_into(&mut self, pipeline: &mut Pipeline, source: String, dest: String) -> String {
        pipeline.push(Command::Store(StoreCommand {
            op: SetOp::Union,
            family: self.family,
            dest: dest.clone(),
            keys: vec![source],
            weights: None,
            aggregate: Aggregate::Sum,
        }));
        self.expire(pipeline, dest)
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub fn card<B: Backend + ?Sized>(&self, backend: &B, key: &str) -> Result<u64, InternalError> {
        let key = key.to_string();
        let command = match self.family {
            SetFamily::Plain => Command::SCard { key },
            SetFamily::Scored => Command::ZCard { key },
        };
        let card = backend.execute(command)?.into_int()?;

        Ok(card.unsigned_abs())
    }

    pub fn is_member<B: Backend + ?Sized>(
        &self,
        backend: &B,
        key: &str,
        id: &Id,
    ) -> Result<bool, InternalError> {
        let key = key.to_string();
        let member = id.to_string();
        let found = match self.family {
            SetFamily::Plain => backend
                .execute(Command::SIsMember { key, member })?
                .into_bool()?,
            SetFamily::Scored => backend
                .execute(Command::ZScore { key, member })?
                .into_opt_float()?
                .is_some(),
        };

        Ok(found)
    }

    /// Read the members of a result key in store order.
    pub fn members<B: Backend + ?Sized>(
        &self,
        backend: &B,
        key: &str,
    ) -> Result<Vec<Id>, InternalError> {
        let key = key.to_string();
        let command = match self.family {
            SetFamily::Plain => Command::SMembers { key },
            SetFamily::Scored => Command::ZRange {
                key,
                start: 0,
                stop: -1,
                reverse: false,
            },
        };
        let members = backend.execute(command).and_then(Reply::into_strings)?;

        Ok(members.into_iter().map(Id::from).collect())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn store(
        &mut self,
        pipeline: &mut Pipeline,
        op: SetOp,
        keys: Vec<String>,
        weights: Option<Vec<f64>>,
        aggregate: Aggregate,
    ) -> String {
        let dest = self.keys.temp_key(self.meta);
        pipeline.push(Command::Store(StoreCommand {
            op,
            family: self.family,
            dest: dest.clone(),
            keys,
            weights,
            aggregate,
        }));
        self.expire(pipeline, dest)
    }

    fn expire(&mut self, pipeline: &mut Pipeline, key: String) -> String {
        pipeline.push(Command::Expire {
            key: key.clone(),
            seconds: self.ttl_secs,
        });
        self.temp_keys.push(key.clone());
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::{item_meta, run, tag_meta};
    use crate::db::backend::MemoryBackend;

    #[test]
    fn every_staged_key_is_followed_by_its_expiry() {
        let keys = KeyNamespace::default();
        let meta = item_meta();
        let mut engine = SetAlgebraEngine::new(&keys, &meta, 7);
        let mut pipeline = Pipeline::new();

        let loaded = engine.load_ids(&mut pipeline, &[Id::from(1_u64)]);
        let inter = engine.intersect(&mut pipeline, vec![keys.ids_key(&meta), loaded]);
        engine.union(&mut pipeline, vec![inter]);

        let commands = pipeline.commands();
        assert_eq!(commands.len(), 6);
        for (pair, key) in commands.chunks(2).zip(engine.temp_keys()) {
            assert_eq!(
                pair[1],
                Command::Expire {
                    key: key.clone(),
                    seconds: 7,
                }
            );
        }
    }

    #[test]
    fn scored_intersection_keeps_leading_scores() {
        let backend = MemoryBackend::new();
        let keys = KeyNamespace::default();
        let meta = item_meta();

        let mut seed = Pipeline::new();
        seed.push(Command::ZAdd {
            key: keys.ids_key(&meta),
            entries: vec![(3.0, "1".into()), (1.0, "2".into()), (2.0, "3".into())],
        });
        run(&backend, seed);

        let mut engine = SetAlgebraEngine::new(&keys, &meta, 10);
        let mut pipeline = Pipeline::new();
        let loaded = engine.load_ids(&mut pipeline, &[Id::from(1_u64), Id::from(2_u64)]);
        let result = engine.intersect(&mut pipeline, vec![keys.ids_key(&meta), loaded]);
        run(&backend, pipeline);

        let members = engine
            .members(&backend, &result)
            .expect("members should read");
        assert_eq!(members, vec![Id::from(2_u64), Id::from(1_u64)]);
        assert_eq!(engine.card(&backend, &result).expect("card should read"), 2);
        assert!(
            engine
                .is_member(&backend, &result, &Id::from(1_u64))
                .expect("membership should read")
        );
    }

    #[test]
    fn plain_family_projects_through_object_fields() {
        let backend = MemoryBackend::new();
        let keys = KeyNamespace::default();
        let meta = tag_meta();

        let mut seed = Pipeline::new();
        seed.push(Command::HSet {
            key: "tag:obj:1".into(),
            pairs: vec![("item".into(), "9".into())],
        });
        seed.push(Command::HSet {
            key: "tag:obj:2".into(),
            pairs: vec![("label".into(), "x".into())],
        });
        run(&backend, seed);

        let mut engine = SetAlgebraEngine::new(&keys, &meta, 10);
        assert_eq!(engine.family(), SetFamily::Plain);
        let mut pipeline = Pipeline::new();
        let ids = engine.load_ids(&mut pipeline, &[Id::from(1_u64), Id::from(2_u64)]);
        let projected = engine.project(&mut pipeline, ids, keys.object_pattern(&meta, "item"));
        run(&backend, pipeline);

        let members = engine
            .members(&backend, &projected)
            .expect("members should read");
        assert_eq!(members, vec![Id::from(9_u64)]);
    }
}
