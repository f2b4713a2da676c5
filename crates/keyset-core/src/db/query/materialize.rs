//! Module: db::query::materialize
//! Responsibility: order and window a compiled id set, then resolve object
//! state for those ids with one batched read.
//! Invariants: the decoder runs exactly once per present id; ids without
//! an object hash are skipped, not reported as errors.

use crate::{
    MIN_SCORE, PRIMARY_KEY,
    config::EngineConfig,
    db::{
        backend::{Backend, Command, Pipeline, PipelineMode, Reply, run_pipeline},
        key::KeyNamespace,
        query::{CompiledQuery, Query, QuerySet, SetAlgebraEngine, Slice},
        session::Instance,
    },
    error::InternalError,
    model::ModelMeta,
    obs::sink::{self, MetricsEvent},
    types::Id,
    value::Value,
};
use std::{collections::BTreeMap, sync::Arc};

const FULL_WINDOW: Slice = Slice {
    start: 0,
    stop: None,
};

///
/// ResultMaterializer
///

#[derive(Debug)]
pub struct ResultMaterializer<'a, B: Backend + ?Sized> {
    backend: &'a B,
    keys: &'a KeyNamespace,
    config: &'a EngineConfig,
}

impl<'a, B: Backend + ?Sized> ResultMaterializer<'a, B> {
    #[must_use]
    pub const fn new(backend: &'a B, keys: &'a KeyNamespace, config: &'a EngineConfig) -> Self {
        Self {
            backend,
            keys,
            config,
        }
    }

    /// Ordered, windowed ids of a compiled query.
    pub fn ordered_ids(
        &self,
        compiled: &CompiledQuery,
        query: &Query,
    ) -> Result<Vec<Id>, InternalError> {
        let meta = &compiled.meta;
        let window = query.window().unwrap_or(FULL_WINDOW);

        let key = match &compiled.set {
            QuerySet::Ids(ids) => {
                let ids = if meta.is_ordered() {
                    self.sort_literal(meta, ids.clone())?
                } else {
                    ids.clone()
                };
                return Ok(window.apply(ids));
            }
            QuerySet::Key(key) => key.clone(),
        };
        let Some((start, stop)) = window.range_bounds() else {
            return Ok(Vec::new());
        };

        // explicit order on anything but the scored field: sort out-of-band
        if let Some(order) = query.order()
            && meta.ordering().is_none_or(|ordering| ordering.field != order.field)
        {
            return self.sort_external(meta, key, &order.field, order.descending, (start, stop));
        }

        let reverse = match (query.order(), meta.ordering()) {
            (Some(order), _) => order.descending,
            (None, Some(ordering)) => ordering.descending,
            (None, None) => {
                let members = self
                    .backend
                    .execute(Command::SMembers { key })
                    .and_then(Reply::into_strings)?;
                return Ok(window.apply(members.into_iter().map(Id::from).collect()));
            }
        };

        let members = self
            .backend
            .execute(Command::ZRange {
                key,
                start,
                stop,
                reverse,
            })
            .and_then(Reply::into_strings)?;

        Ok(members.into_iter().map(Id::from).collect())
    }

    /// Resolve object state for `ids` in one batched read.
    ///
    /// `fields` restricts the read to those fields; the decoder receives the
    /// raw `(field, value)` pairs present in each object hash.
    pub fn fetch<T>(
        &self,
        meta: &ModelMeta,
        ids: &[Id],
        fields: Option<&[String]>,
        mut decode: impl FnMut(Id, Vec<(String, String)>) -> Result<T, InternalError>,
    ) -> Result<Vec<T>, InternalError> {
        let mut pipeline = Pipeline::new();
        for id in ids {
            let key = self.keys.object_key(meta, id);
            pipeline.push(match fields {
                None => Command::HGetAll { key },
                Some(fields) => Command::HMGet {
                    key,
                    fields: std::iter::once(PRIMARY_KEY.to_string())
                        .chain(fields.iter().cloned())
                        .collect(),
                },
            });
        }

        let replies = run_pipeline(self.backend, pipeline, PipelineMode::Batch)?;
        let mut rows = Vec::with_capacity(ids.len());
        let mut missing = 0u64;

        for (id, reply) in ids.iter().zip(replies) {
            // a hash without its id field does not exist
            let pairs = match fields {
                None => Some(reply.into_pairs()?).filter(|pairs| !pairs.is_empty()),
                Some(fields) => {
                    let mut values = reply.into_opt_strings()?.into_iter();
                    values.next().flatten().map(|_| {
                        fields
                            .iter()
                            .zip(values)
                            .filter_map(|(field, value)| value.map(|v| (field.clone(), v)))
                            .collect()
                    })
                }
            };

            let Some(pairs) = pairs else {
                missing += 1;
                continue;
            };
            rows.push(decode(id.clone(), pairs)?);
        }

        sink::record(MetricsEvent::RowsLoaded {
            model: meta.name(),
            rows: rows.len() as u64,
            missing,
        });

        Ok(rows)
    }

    /// Load and attach the related objects named by the query's related loads.
    pub fn attach_related(
        &self,
        query: &Query,
        instances: &mut [Instance],
    ) -> Result<(), InternalError> {
        for related in query.related() {
            let mut ids: Vec<Id> = Vec::new();
            for instance in instances.iter() {
                if let Some(raw) = instance.get(&related.field).and_then(Value::to_store) {
                    let id = Id::from(raw);
                    if !ids.contains(&id) {
                        ids.push(id);
                    }
                }
            }
            if ids.is_empty() {
                continue;
            }

            let meta = &related.meta;
            let loaded: BTreeMap<Id, Instance> = self
                .fetch(meta, &ids, None, |id, pairs| {
                    Instance::from_store(Arc::clone(meta), id.clone(), pairs, None)
                        .map(|instance| (id, instance))
                })?
                .into_iter()
                .collect();

            for instance in instances.iter_mut() {
                let target = instance
                    .get(&related.field)
                    .and_then(Value::to_store)
                    .and_then(|raw| loaded.get(&Id::from(raw)));
                if let Some(target) = target {
                    instance.attach(&related.field, target.clone());
                }
            }
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Ordering
    // ------------------------------------------------------------------

    /// Order literal ids by their stored score; ties keep literal order.
    fn sort_literal(&self, meta: &ModelMeta, ids: Vec<Id>) -> Result<Vec<Id>, InternalError> {
        let ids_key = self.keys.ids_key(meta);
        let mut pipeline = Pipeline::new();
        for id in &ids {
            pipeline.push(Command::ZScore {
                key: ids_key.clone(),
                member: id.to_string(),
            });
        }

        let replies = run_pipeline(self.backend, pipeline, PipelineMode::Batch)?;
        let mut scored = Vec::with_capacity(ids.len());
        for (id, reply) in ids.into_iter().zip(replies) {
            scored.push((reply.into_opt_float()?.unwrap_or(MIN_SCORE), id));
        }

        let descending = meta.ordering().is_some_and(|ordering| ordering.descending);
        scored.sort_by(|(a, _), (b, _)| {
            let ord = a.total_cmp(b);
            if descending { ord.reverse() } else { ord }
        });

        Ok(scored.into_iter().map(|(_, id)| id).collect())
    }

    /// Sort `key` by an object field into a temp list, then read the window.
    fn sort_external(
        &self,
        meta: &ModelMeta,
        key: String,
        field: &str,
        descending: bool,
        (start, stop): (i64, i64),
    ) -> Result<Vec<Id>, InternalError> {
        let (pattern, numeric) = if field == PRIMARY_KEY {
            (None, meta.primary_key().kind().is_numeric())
        } else {
            let numeric = meta.field(field).is_some_and(|f| f.kind().is_numeric());
            (Some(self.keys.object_pattern(meta, field)), numeric)
        };

        let mut engine = SetAlgebraEngine::new(self.keys, meta, self.config.temp_key_ttl_secs);
        let mut pipeline = Pipeline::new();
        let list = engine.sort_by(&mut pipeline, key, pattern, descending, !numeric);
        let read = pipeline.push(Command::LRange {
            key: list,
            start,
            stop,
        });

        let mut replies = run_pipeline(self.backend, pipeline, PipelineMode::Transaction)?;
        sink::record(MetricsEvent::TempKeys {
            model: meta.name(),
            count: engine.temp_keys().len() as u64,
        });
        let members = std::mem::replace(&mut replies[read], Reply::Nil).into_strings()?;

        Ok(members.into_iter().map(Id::from).collect())
    }
}
