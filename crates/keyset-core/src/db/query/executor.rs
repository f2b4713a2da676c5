use crate::{
    config::EngineConfig,
    db::{
        backend::Backend,
        key::KeyNamespace,
        query::{
            CompiledQuery, Query, QueryCompiler, QuerySet, ResultMaterializer, SetAlgebraEngine,
        },
        session::Instance,
    },
    error::InternalError,
    types::Id,
};
use std::sync::Arc;

///
/// QueryExecutor
///
/// Compile-then-materialize entry points. Stateless beyond its borrows;
/// identity-map handling belongs to the session.
///

#[derive(Debug)]
pub struct QueryExecutor<'a, B: Backend + ?Sized> {
    backend: &'a B,
    keys: &'a KeyNamespace,
    config: &'a EngineConfig,
}

impl<'a, B: Backend + ?Sized> QueryExecutor<'a, B> {
    #[must_use]
    pub const fn new(backend: &'a B, keys: &'a KeyNamespace, config: &'a EngineConfig) -> Self {
        Self {
            backend,
            keys,
            config,
        }
    }

    pub fn compile(&self, query: &Query) -> Result<CompiledQuery, InternalError> {
        QueryCompiler::new(self.backend, self.keys, self.config).compile(query)
    }

    /// Matching ids, ordered and windowed.
    pub fn load_ids(&self, query: &Query) -> Result<Vec<Id>, InternalError> {
        let compiled = self.compile(query)?;
        self.materializer().ordered_ids(&compiled, query)
    }

    pub fn load(&self, query: &Query) -> Result<Vec<Instance>, InternalError> {
        let ids = self.load_ids(query)?;
        let meta = query.meta();
        let fields = query.loaded_fields();
        let materializer = self.materializer();

        let mut rows = materializer.fetch(meta, &ids, fields, |id, pairs| {
            Instance::from_store(Arc::clone(meta), id, pairs, fields)
        })?;
        if rows.len() < ids.len() {
            tracing::warn!(
                model = meta.name(),
                expected = ids.len(),
                found = rows.len(),
                "index references objects that no longer exist"
            );
        }
        materializer.attach_related(query, &mut rows)?;

        Ok(rows)
    }

    /// Number of matching ids; a window counts only the ids inside it.
    pub fn count(&self, query: &Query) -> Result<u64, InternalError> {
        if query.window().is_some() {
            return Ok(self.load_ids(query)?.len() as u64);
        }

        match self.compile(query)?.set {
            QuerySet::Ids(ids) => Ok(ids.len() as u64),
            QuerySet::Key(key) => self.engine(query).card(self.backend, &key),
        }
    }

    /// Whether `id` is in the matching set, ignoring any window.
    pub fn contains(&self, query: &Query, id: &Id) -> Result<bool, InternalError> {
        match self.compile(query)?.set {
            QuerySet::Ids(ids) => Ok(ids.contains(id)),
            QuerySet::Key(key) => self.engine(query).is_member(self.backend, &key, id),
        }
    }

    fn materializer(&self) -> ResultMaterializer<'a, B> {
        ResultMaterializer::new(self.backend, self.keys, self.config)
    }

    fn engine<'q>(&self, query: &'q Query) -> SetAlgebraEngine<'q>
    where
        'a: 'q,
    {
        SetAlgebraEngine::new(self.keys, query.meta(), self.config.temp_key_ttl_secs)
    }
}
