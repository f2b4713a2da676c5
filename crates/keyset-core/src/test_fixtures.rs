use crate::{
    config::EngineConfig,
    db::{
        backend::{Backend, Command, MemoryBackend, Pipeline, PipelineMode, Reply},
        session::Session,
    },
    model::{FieldModel, ModelMeta},
};
use std::{collections::BTreeMap, sync::Arc};

/// `Item{name unique, group indexed, rank ordered}`.
pub(crate) fn item_meta() -> Arc<ModelMeta> {
    ModelMeta::builder("item")
        .field(FieldModel::text("name").unique())
        .field(FieldModel::text("group").indexed())
        .field(FieldModel::int("rank"))
        .field(FieldModel::text("note"))
        .ordering("rank", false)
        .build()
        .expect("item model should validate")
}

/// Unordered model with a foreign key to `item`.
pub(crate) fn tag_meta() -> Arc<ModelMeta> {
    ModelMeta::builder("tag")
        .field(FieldModel::text("label").indexed())
        .field(FieldModel::foreign_key("item", "item").indexed())
        .build()
        .expect("tag model should validate")
}

/// Model placed in a separate partition.
pub(crate) fn archive_meta() -> Arc<ModelMeta> {
    ModelMeta::builder("archive")
        .field(FieldModel::foreign_key("item", "item").indexed())
        .partition("cold")
        .build()
        .expect("archive model should validate")
}

pub(crate) fn test_config() -> EngineConfig {
    EngineConfig {
        namespace: "test.".to_string(),
        ..EngineConfig::default()
    }
}

pub(crate) fn memory_session() -> (Arc<MemoryBackend>, Session<MemoryBackend>) {
    let backend = Arc::new(MemoryBackend::new());
    let session = Session::new(Arc::clone(&backend), test_config());

    (backend, session)
}

/// Apply `pipeline` atomically.
pub(crate) fn run(backend: &MemoryBackend, pipeline: Pipeline) -> Vec<Reply> {
    backend
        .execute_pipeline(pipeline, PipelineMode::Transaction)
        .expect("pipeline should apply")
}

/// Every live key with its contents, for whole-keyspace comparisons.
pub(crate) fn dump(backend: &MemoryBackend) -> BTreeMap<String, Reply> {
    let keys = backend
        .execute(Command::Keys {
            pattern: "*".to_string(),
        })
        .and_then(Reply::into_strings)
        .expect("keys should list");

    keys.into_iter()
        .map(|key| {
            let reads = [
                Command::ZRange {
                    key: key.clone(),
                    start: 0,
                    stop: -1,
                    reverse: false,
                },
                Command::SMembers { key: key.clone() },
                Command::HGetAll { key: key.clone() },
                Command::LRange {
                    key: key.clone(),
                    start: 0,
                    stop: -1,
                },
                Command::Get { key: key.clone() },
            ];
            let reply = reads
                .into_iter()
                .find_map(|read| backend.execute(read).ok())
                .unwrap_or(Reply::Nil);
            (key, reply)
        })
        .collect()
}
