//! Module: db::query::compile
//! Responsibility: turn a validated predicate tree into one id set, either a
//! literal id list (simple path) or a store key (keyed path).
//! Invariants: validation of the whole tree, sub-queries included, runs
//! before any store access; excludes are subtracted with a single diff.

use crate::{
    config::EngineConfig,
    db::{
        backend::{Backend, Command, Pipeline, PipelineMode, Reply, run_pipeline},
        key::KeyNamespace,
        query::{
            JoinPredicate, Predicate, PredicateValues, Query, QueryError, QuerySignature,
            SetAlgebraEngine,
        },
    },
    error::InternalError,
    model::ModelMeta,
    obs::sink::{self, MetricsEvent, QueryPath},
    types::Id,
    value::Value,
};
use std::sync::Arc;

///
/// QuerySet
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum QuerySet {
    /// Ids resolved without set algebra, in predicate value order.
    Ids(Vec<Id>),
    /// Store key holding the matching ids.
    Key(String),
}

///
/// CompiledQuery
///

#[derive(Clone, Debug)]
pub struct CompiledQuery {
    pub meta: Arc<ModelMeta>,
    pub set: QuerySet,
    pub signature: QuerySignature,
    pub path: QueryPath,
    /// Temp keys created while compiling, sub-queries included.
    pub temp_keys: Vec<String>,
}

///
/// QueryCompiler
///

#[derive(Debug)]
pub struct QueryCompiler<'a, B: Backend + ?Sized> {
    backend: &'a B,
    keys: &'a KeyNamespace,
    config: &'a EngineConfig,
}

impl<'a, B: Backend + ?Sized> QueryCompiler<'a, B> {
    #[must_use]
    pub const fn new(backend: &'a B, keys: &'a KeyNamespace, config: &'a EngineConfig) -> Self {
        Self {
            backend,
            keys,
            config,
        }
    }

    pub fn compile(&self, query: &Query) -> Result<CompiledQuery, InternalError> {
        validate(query)?;
        self.compile_validated(query)
    }

    fn compile_validated(&self, query: &Query) -> Result<CompiledQuery, InternalError> {
        let meta = query.meta();
        let signature = QuerySignature::of(query);

        if let Some(ids) = self.try_simple(query)? {
            tracing::debug!(model = meta.name(), ids = ids.len(), "query resolved on simple path");
            record_compiled(meta, QueryPath::Simple, 0);
            return Ok(CompiledQuery {
                meta: Arc::clone(meta),
                set: QuerySet::Ids(ids),
                signature,
                path: QueryPath::Simple,
                temp_keys: Vec::new(),
            });
        }

        let memo_key = query
            .is_memoized()
            .then(|| self.keys.signature_key(meta, &signature.to_hex()));
        if let Some(key) = &memo_key
            && self
                .backend
                .execute(Command::Exists { key: key.clone() })?
                .into_bool()?
        {
            tracing::debug!(model = meta.name(), %signature, "query re-bound to live result");
            record_compiled(meta, QueryPath::Memoized, 0);
            return Ok(CompiledQuery {
                meta: Arc::clone(meta),
                set: QuerySet::Key(key.clone()),
                signature,
                path: QueryPath::Memoized,
                temp_keys: Vec::new(),
            });
        }

        let mut engine = SetAlgebraEngine::new(self.keys, meta, self.config.temp_key_ttl_secs);
        let mut pipeline = Pipeline::new();
        let mut nested = Vec::new();

        // include side
        let mut include = vec![self.keys.ids_key(meta)];
        for predicate in query.filters() {
            include.push(self.resolve(&mut engine, &mut pipeline, &mut nested, meta, predicate)?);
        }
        for join in query.joins() {
            include.push(self.resolve_join(&mut engine, &mut pipeline, &mut nested, join)?);
        }
        let mut result = if include.len() == 1 {
            include.swap_remove(0)
        } else {
            engine.intersect(&mut pipeline, include)
        };

        // exclude side
        if !query.excludes().is_empty() {
            let mut excluded = Vec::with_capacity(query.excludes().len());
            for predicate in query.excludes() {
                excluded.push(self.resolve(&mut engine, &mut pipeline, &mut nested, meta, predicate)?);
            }
            let minus = if excluded.len() == 1 {
                excluded.swap_remove(0)
            } else {
                engine.union(&mut pipeline, excluded)
            };
            result = engine.diff(&mut pipeline, result, minus);
        }

        if let Some(key) = memo_key {
            result = engine.copy_into(&mut pipeline, result, key);
        }

        run_pipeline(self.backend, pipeline, PipelineMode::Transaction)?;

        let mut temp_keys = engine.into_temp_keys();
        temp_keys.extend(nested);
        tracing::debug!(
            model = meta.name(),
            %signature,
            temp_keys = temp_keys.len(),
            "query compiled to {result}"
        );
        record_compiled(meta, QueryPath::Keyed, temp_keys.len());

        Ok(CompiledQuery {
            meta: Arc::clone(meta),
            set: QuerySet::Key(result),
            signature,
            path: QueryPath::Keyed,
            temp_keys,
        })
    }

    // ------------------------------------------------------------------
    // Simple path
    // ------------------------------------------------------------------

    /// Resolve primary-key and unique lookups with one batched read.
    /// `None` when the query needs the set engine.
    fn try_simple(&self, query: &Query) -> Result<Option<Vec<Id>>, InternalError> {
        if query.filters().is_empty()
            || !query.excludes().is_empty()
            || !query.joins().is_empty()
            || query.order().is_some()
            || query.is_memoized()
        {
            return Ok(None);
        }

        let mut total = 0usize;
        for predicate in query.filters() {
            let Some(count) = predicate.values.literal_count() else {
                return Ok(None);
            };
            if !(predicate.unique || Query::is_primary_key(&predicate.field)) {
                return Ok(None);
            }
            total = total.saturating_add(count);
        }
        if !self.config.allows_simple_lookup(total) {
            return Ok(None);
        }

        let meta = query.meta();
        let ids_key = self.keys.ids_key(meta);
        let mut pipeline = Pipeline::new();
        let mut plans = Vec::with_capacity(query.filters().len());

        for predicate in query.filters() {
            let tokens = literal_tokens(&predicate.values);
            let first = pipeline.len();
            if Query::is_primary_key(&predicate.field) {
                for token in &tokens {
                    pipeline.push(membership(meta, ids_key.clone(), token.clone()));
                }
            } else if !tokens.is_empty() {
                pipeline.push(Command::HMGet {
                    key: self.keys.unique_key(meta, &predicate.field),
                    fields: tokens.clone(),
                });
            }
            plans.push((Query::is_primary_key(&predicate.field), tokens, first));
        }

        let mut replies = run_pipeline(self.backend, pipeline, PipelineMode::Batch)?;
        let mut resolved: Option<Vec<Id>> = None;

        for (primary, tokens, first) in plans {
            let mut ids = Vec::new();
            if primary {
                for (offset, token) in tokens.into_iter().enumerate() {
                    let reply = std::mem::replace(&mut replies[first + offset], Reply::Nil);
                    if is_member_reply(meta, reply)? {
                        ids.push(Id::from(token));
                    }
                }
            } else if !tokens.is_empty() {
                let reply = std::mem::replace(&mut replies[first], Reply::Nil);
                ids.extend(reply.into_opt_strings()?.into_iter().flatten().map(Id::from));
            }
            dedup_in_order(&mut ids);

            resolved = Some(match resolved {
                None => ids,
                Some(prev) => prev.into_iter().filter(|id| ids.contains(id)).collect(),
            });
        }

        Ok(resolved)
    }

    // ------------------------------------------------------------------
    // Keyed path
    // ------------------------------------------------------------------

    fn resolve(
        &self,
        engine: &mut SetAlgebraEngine<'_>,
        pipeline: &mut Pipeline,
        nested: &mut Vec<String>,
        meta: &ModelMeta,
        predicate: &Predicate,
    ) -> Result<String, InternalError> {
        let values = match &predicate.values {
            PredicateValues::Values(values) => values.clone(),
            PredicateValues::Query(sub) => self
                .subquery_ids(sub, nested)?
                .into_iter()
                .map(|id| Value::Text(id.into_string()))
                .collect(),
        };

        if Query::is_primary_key(&predicate.field) {
            let ids: Vec<Id> = values
                .iter()
                .filter(|v| !v.is_null())
                .map(|v| Id::from(v.index_token()))
                .collect();
            return Ok(self.literal_key(engine, pipeline, meta, &ids));
        }

        if predicate.unique {
            let tokens = literal_tokens(&PredicateValues::Values(values));
            if tokens.is_empty() {
                return Ok(self.keys.temp_key(meta));
            }
            let ids: Vec<Id> = self
                .backend
                .execute(Command::HMGet {
                    key: self.keys.unique_key(meta, &predicate.field),
                    fields: tokens,
                })?
                .into_opt_strings()?
                .into_iter()
                .flatten()
                .map(Id::from)
                .collect();
            return Ok(self.literal_key(engine, pipeline, meta, &ids));
        }

        let mut index_keys: Vec<String> = Vec::with_capacity(values.len());
        for value in &values {
            let key = self.keys.index_key(meta, &predicate.field, value);
            if !index_keys.contains(&key) {
                index_keys.push(key);
            }
        }

        Ok(match index_keys.len() {
            0 => self.keys.temp_key(meta),
            1 => index_keys.swap_remove(0),
            _ => engine.union(pipeline, index_keys),
        })
    }

    /// Project the joined query's `field` back onto this model's ids.
    fn resolve_join(
        &self,
        engine: &mut SetAlgebraEngine<'_>,
        pipeline: &mut Pipeline,
        nested: &mut Vec<String>,
        join: &JoinPredicate,
    ) -> Result<String, InternalError> {
        let compiled = self.compile_validated(&join.query)?;
        nested.extend(compiled.temp_keys);
        let other = join.query.meta();

        let source = match compiled.set {
            QuerySet::Key(key) => key,
            QuerySet::Ids(ids) if ids.is_empty() => return Ok(self.keys.temp_key(other)),
            QuerySet::Ids(ids) => engine.load_ids(pipeline, &ids),
        };

        Ok(engine.project(pipeline, source, self.keys.object_pattern(other, &join.field)))
    }

    fn subquery_ids(&self, sub: &Query, nested: &mut Vec<String>) -> Result<Vec<Id>, InternalError> {
        let compiled = self.compile_validated(sub)?;
        nested.extend(compiled.temp_keys);

        match compiled.set {
            QuerySet::Ids(ids) => Ok(ids),
            QuerySet::Key(key) => {
                let engine =
                    SetAlgebraEngine::new(self.keys, sub.meta(), self.config.temp_key_ttl_secs);
                engine.members(self.backend, &key)
            }
        }
    }

    /// Stage literal ids, or name a never-written key for an empty list.
    fn literal_key(
        &self,
        engine: &mut SetAlgebraEngine<'_>,
        pipeline: &mut Pipeline,
        meta: &ModelMeta,
        ids: &[Id],
    ) -> String {
        if ids.is_empty() {
            self.keys.temp_key(meta)
        } else {
            engine.load_ids(pipeline, ids)
        }
    }
}

// ----------------------------------------------------------------------
// Validation
// ----------------------------------------------------------------------

/// Reject unsupported structure anywhere in the tree.
pub(crate) fn validate(query: &Query) -> Result<(), QueryError> {
    let meta = query.meta();

    for predicate in query.filters().iter().chain(query.excludes()) {
        let field = meta.field(&predicate.field).ok_or_else(|| unknown(meta, &predicate.field))?;
        if !Query::is_primary_key(&predicate.field) && !field.is_indexed() {
            return Err(QueryError::NotIndexed {
                model: meta.name().to_string(),
                field: predicate.field.clone(),
            });
        }
        if !predicate.lookup.is_supported() {
            return Err(QueryError::UnsupportedLookup {
                model: meta.name().to_string(),
                field: predicate.field.clone(),
                lookup: predicate.lookup,
            });
        }

        if let PredicateValues::Query(sub) = &predicate.values {
            same_partition(meta, sub.meta())?;
            let expected = if Query::is_primary_key(&predicate.field) {
                Some(meta.name())
            } else {
                field.kind().related_model()
            };
            if let Some(expected) = expected
                && expected != sub.meta().name()
            {
                return Err(QueryError::InvalidJoin {
                    model: meta.name().to_string(),
                    field: predicate.field.clone(),
                    reason: format!(
                        "sub-query selects '{}' but the field holds '{expected}' ids",
                        sub.meta().name()
                    ),
                });
            }
            validate(sub)?;
        }
    }

    for join in query.joins() {
        let other = join.query.meta();
        same_partition(meta, other)?;
        let field = other.field(&join.field).ok_or_else(|| unknown(other, &join.field))?;
        if field.kind().related_model() != Some(meta.name()) {
            return Err(QueryError::InvalidJoin {
                model: other.name().to_string(),
                field: join.field.clone(),
                reason: format!("field does not reference '{}'", meta.name()),
            });
        }
        validate(&join.query)?;
    }

    if let Some(order) = query.order()
        && meta.field(&order.field).is_none()
    {
        return Err(unknown(meta, &order.field));
    }

    if let Some(slice) = query.window()
        && let Some(stop) = slice.stop
        && stop < slice.start
    {
        return Err(QueryError::InvalidSlice {
            start: slice.start,
            stop,
        });
    }

    for field in query.loaded_fields().unwrap_or_default() {
        if meta.field(field).is_none() {
            return Err(unknown(meta, field));
        }
    }

    for related in query.related() {
        let field = meta.field(&related.field).ok_or_else(|| unknown(meta, &related.field))?;
        if field.kind().related_model() != Some(related.meta.name()) {
            return Err(QueryError::InvalidJoin {
                model: meta.name().to_string(),
                field: related.field.clone(),
                reason: format!("field does not reference '{}'", related.meta.name()),
            });
        }
    }

    Ok(())
}

fn same_partition(meta: &ModelMeta, other: &ModelMeta) -> Result<(), QueryError> {
    if meta.partition() == other.partition() {
        return Ok(());
    }

    Err(QueryError::CrossPartition {
        model: meta.name().to_string(),
        partition: meta.partition().to_string(),
        other: other.name().to_string(),
        other_partition: other.partition().to_string(),
    })
}

fn unknown(meta: &ModelMeta, field: &str) -> QueryError {
    QueryError::UnknownField {
        model: meta.name().to_string(),
        field: field.to_string(),
    }
}

// ----------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------

fn literal_tokens(values: &PredicateValues) -> Vec<String> {
    let PredicateValues::Values(values) = values else {
        return Vec::new();
    };
    let mut tokens: Vec<String> = Vec::with_capacity(values.len());
    for token in values.iter().filter_map(Value::to_store) {
        if !tokens.contains(&token) {
            tokens.push(token);
        }
    }
    tokens
}

fn membership(meta: &ModelMeta, key: String, member: String) -> Command {
    if meta.is_ordered() {
        Command::ZScore { key, member }
    } else {
        Command::SIsMember { key, member }
    }
}

fn is_member_reply(meta: &ModelMeta, reply: Reply) -> Result<bool, InternalError> {
    let found = if meta.is_ordered() {
        reply.into_opt_float()?.is_some()
    } else {
        reply.into_bool()?
    };
    Ok(found)
}

fn dedup_in_order(ids: &mut Vec<Id>) {
    let mut seen = Vec::with_capacity(ids.len());
    ids.retain(|id| {
        if seen.contains(id) {
            false
        } else {
            seen.push(id.clone());
            true
        }
    });
}

fn record_compiled(meta: &ModelMeta, path: QueryPath, temp_keys: usize) {
    sink::record(MetricsEvent::QueryCompiled {
        model: meta.name(),
        path,
    });
    if temp_keys > 0 {
        sink::record(MetricsEvent::TempKeys {
            model: meta.name(),
            count: temp_keys as u64,
        });
    }
}
