//! Module: db::query
//! Responsibility: declarative query intent, its compilation into set
//! algebra over store keys, and materialization of the matching objects.
//! Does not own: identity-map bookkeeping (session) or index writes.
//! Boundary: compilation errors surface before any store mutation.

pub mod algebra;
pub mod compile;
pub mod executor;
pub mod materialize;
pub mod predicate;
pub mod signature;

#[cfg(test)]
mod tests;

pub use algebra::SetAlgebraEngine;
pub use compile::{CompiledQuery, QueryCompiler, QuerySet};
pub use executor::QueryExecutor;
pub use materialize::ResultMaterializer;
pub use predicate::{JoinPredicate, Lookup, Predicate, PredicateValues, split_lookup};
pub use signature::QuerySignature;

use crate::{
    PRIMARY_KEY,
    error::{ErrorClass, ErrorOrigin, InternalError},
    model::ModelMeta,
    value::Value,
};
use std::sync::Arc;
use thiserror::Error as ThisError;

///
/// QueryError
///

#[derive(Debug, ThisError)]
pub enum QueryError {
    #[error("unknown lookup '{lookup}'")]
    UnknownLookup { lookup: String },

    #[error("lookup '{lookup}' on {model}.{field} is not supported")]
    UnsupportedLookup {
        model: String,
        field: String,
        lookup: Lookup,
    },

    #[error("model '{model}' has no field '{field}'")]
    UnknownField { model: String, field: String },

    #[error("{model}.{field} is not indexed and cannot be filtered")]
    NotIndexed { model: String, field: String },

    #[error("cannot join '{model}' in partition '{partition}' with '{other}' in partition '{other_partition}'")]
    CrossPartition {
        model: String,
        partition: String,
        other: String,
        other_partition: String,
    },

    #[error("invalid join {model}.{field}: {reason}")]
    InvalidJoin {
        model: String,
        field: String,
        reason: String,
    },

    #[error("invalid slice [{start}, {stop})")]
    InvalidSlice { start: usize, stop: usize },
}

// every compiler rejection happens before the store is touched
impl From<QueryError> for InternalError {
    fn from(err: QueryError) -> Self {
        Self::classified(ErrorClass::Unsupported, ErrorOrigin::Query, err.to_string())
    }
}

///
/// OrderBy
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OrderBy {
    pub field: String,
    pub descending: bool,
}

///
/// Slice
/// Half-open window `[start, stop)` over the ordered result.
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Slice {
    pub start: usize,
    pub stop: Option<usize>,
}

impl Slice {
    /// Inclusive store range bounds for a range/list read.
    ///
    /// `None` for an empty window; a stop of `-1` would read to the end.
    #[must_use]
    pub(crate) fn range_bounds(self) -> Option<(i64, i64)> {
        if self.stop.is_some_and(|stop| stop <= self.start) {
            return None;
        }
        let start = i64::try_from(self.start).unwrap_or(i64::MAX);
        let stop = self
            .stop
            .map_or(-1, |stop| i64::try_from(stop).unwrap_or(i64::MAX) - 1);

        Some((start, stop))
    }

    pub(crate) fn apply<T>(self, items: Vec<T>) -> Vec<T> {
        let stop = self.stop.unwrap_or(usize::MAX);
        items
            .into_iter()
            .skip(self.start)
            .take(stop.saturating_sub(self.start))
            .collect()
    }
}

///
/// RelatedLoad
/// Foreign-key field whose target objects are attached after loading.
///

#[derive(Clone, Debug)]
pub struct RelatedLoad {
    pub field: String,
    pub meta: Arc<ModelMeta>,
}

///
/// Query
///
/// Immutable-style builder; every combinator consumes and returns the query.
///

#[derive(Clone, Debug)]
pub struct Query {
    meta: Arc<ModelMeta>,
    filters: Vec<Predicate>,
    excludes: Vec<Predicate>,
    joins: Vec<JoinPredicate>,
    order: Option<OrderBy>,
    slice: Option<Slice>,
    load_only: Option<Vec<String>>,
    related: Vec<RelatedLoad>,
    memoize: bool,
}

impl Query {
    #[must_use]
    pub const fn new(meta: Arc<ModelMeta>) -> Self {
        Self {
            meta,
            filters: Vec::new(),
            excludes: Vec::new(),
            joins: Vec::new(),
            order: None,
            slice: None,
            load_only: None,
            related: Vec::new(),
            memoize: false,
        }
    }

    // ------------------------------------------------------------------
    // Filters
    // ------------------------------------------------------------------

    #[must_use]
    pub fn filter(mut self, field: &str, value: impl Into<Value>) -> Self {
        let predicate = self.predicate(field, Lookup::Exact, vec![value.into()]);
        self.filters.push(predicate);
        self
    }

    #[must_use]
    pub fn filter_in<V: Into<Value>>(
        mut self,
        field: &str,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        let values = values.into_iter().map(Into::into).collect();
        let predicate = self.predicate(field, Lookup::In, values);
        self.filters.push(predicate);
        self
    }

    /// Filter with a `field__lookup` expression (`rank__in`, `name__exact`).
    pub fn filter_lookup(mut self, expr: &str, values: Vec<Value>) -> Result<Self, QueryError> {
        let predicate = self.parse_predicate(expr, values)?;
        self.filters.push(predicate);
        Ok(self)
    }

    /// Filter `field` by the ids another query produces.
    #[must_use]
    pub fn filter_query(mut self, field: &str, query: Self) -> Self {
        let predicate = self.subquery_predicate(field, query);
        self.filters.push(predicate);
        self
    }

    // ------------------------------------------------------------------
    // Excludes
    // ------------------------------------------------------------------

    #[must_use]
    pub fn exclude(mut self, field: &str, value: impl Into<Value>) -> Self {
        let predicate = self.predicate(field, Lookup::Exact, vec![value.into()]);
        self.excludes.push(predicate);
        self
    }

    #[must_use]
    pub fn exclude_in<V: Into<Value>>(
        mut self,
        field: &str,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        let values = values.into_iter().map(Into::into).collect();
        let predicate = self.predicate(field, Lookup::In, values);
        self.excludes.push(predicate);
        self
    }

    pub fn exclude_lookup(mut self, expr: &str, values: Vec<Value>) -> Result<Self, QueryError> {
        let predicate = self.parse_predicate(expr, values)?;
        self.excludes.push(predicate);
        Ok(self)
    }

    #[must_use]
    pub fn exclude_query(mut self, field: &str, query: Self) -> Self {
        let predicate = self.subquery_predicate(field, query);
        self.excludes.push(predicate);
        self
    }

    // ------------------------------------------------------------------
    // Joins, ordering, windowing, loading
    // ------------------------------------------------------------------

    /// Keep instances referenced through `field` by rows matching `query`.
    #[must_use]
    pub fn join(mut self, field: &str, query: Self) -> Self {
        self.joins.push(JoinPredicate {
            field: field.to_string(),
            query: Box::new(query),
        });
        self
    }

    #[must_use]
    pub fn order_by(mut self, field: &str) -> Self {
        self.order = Some(OrderBy {
            field: field.to_string(),
            descending: false,
        });
        self
    }

    #[must_use]
    pub fn order_by_desc(mut self, field: &str) -> Self {
        self.order = Some(OrderBy {
            field: field.to_string(),
            descending: true,
        });
        self
    }

    #[must_use]
    pub const fn slice(mut self, start: usize, stop: usize) -> Self {
        self.slice = Some(Slice {
            start,
            stop: Some(stop),
        });
        self
    }

    #[must_use]
    pub const fn offset(mut self, start: usize) -> Self {
        self.slice = Some(Slice { start, stop: None });
        self
    }

    #[must_use]
    pub fn load_only<S: Into<String>>(mut self, fields: impl IntoIterator<Item = S>) -> Self {
        self.load_only = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn load_related(mut self, field: &str, meta: Arc<ModelMeta>) -> Self {
        self.related.push(RelatedLoad {
            field: field.to_string(),
            meta,
        });
        self
    }

    /// Allow re-binding to a live result of an identical query.
    #[must_use]
    pub const fn memoize(mut self) -> Self {
        self.memoize = true;
        self
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    #[must_use]
    pub const fn meta(&self) -> &Arc<ModelMeta> {
        &self.meta
    }

    #[must_use]
    pub fn filters(&self) -> &[Predicate] {
        &self.filters
    }

    #[must_use]
    pub fn excludes(&self) -> &[Predicate] {
        &self.excludes
    }

    #[must_use]
    pub fn joins(&self) -> &[JoinPredicate] {
        &self.joins
    }

    #[must_use]
    pub const fn order(&self) -> Option<&OrderBy> {
        self.order.as_ref()
    }

    #[must_use]
    pub const fn window(&self) -> Option<Slice> {
        self.slice
    }

    #[must_use]
    pub fn loaded_fields(&self) -> Option<&[String]> {
        self.load_only.as_deref()
    }

    #[must_use]
    pub fn related(&self) -> &[RelatedLoad] {
        &self.related
    }

    #[must_use]
    pub const fn is_memoized(&self) -> bool {
        self.memoize
    }

    /// The same query narrowed to the first row of its window.
    #[must_use]
    pub(crate) fn first_row(&self) -> Self {
        let start = self.slice.map_or(0, |window| window.start);
        let stop = self
            .slice
            .and_then(|window| window.stop)
            .map_or(start.saturating_add(1), |stop| stop.min(start.saturating_add(1)));

        self.clone().slice(start, stop)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn is_unique(&self, field: &str) -> bool {
        self.meta.field(field).is_some_and(|f| f.is_unique())
    }

    fn predicate(&self, field: &str, lookup: Lookup, values: Vec<Value>) -> Predicate {
        // canonical variants keep index tokens stable (Int on a float field)
        let values = match self.meta.field(field) {
            Some(model) => values
                .into_iter()
                .map(|value| {
                    if value.kind_matches(model.kind()) {
                        value.coerce(model.kind())
                    } else {
                        value
                    }
                })
                .collect(),
            None => values,
        };

        Predicate {
            field: field.to_string(),
            lookup,
            values: PredicateValues::Values(values),
            unique: self.is_unique(field),
        }
    }

    fn subquery_predicate(&self, field: &str, query: Self) -> Predicate {
        Predicate {
            field: field.to_string(),
            lookup: Lookup::In,
            values: PredicateValues::Query(Box::new(query)),
            unique: self.is_unique(field),
        }
    }

    fn parse_predicate(&self, expr: &str, values: Vec<Value>) -> Result<Predicate, QueryError> {
        let (field, lookup) = split_lookup(expr);
        let lookup = match lookup {
            None => Lookup::Exact,
            Some(raw) => Lookup::parse(raw).ok_or_else(|| QueryError::UnknownLookup {
                lookup: raw.to_string(),
            })?,
        };

        Ok(self.predicate(field, lookup, values))
    }

    /// Whether `field` names the primary key.
    pub(crate) fn is_primary_key(field: &str) -> bool {
        field == PRIMARY_KEY
    }
}
