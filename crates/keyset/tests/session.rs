use keyset::{
    core::{
        db::{
            backend::{Command, Reply},
            session::Partition,
        },
        error::ErrorClass,
    },
    prelude::*,
};
use proptest::prelude::*;
use std::sync::{Arc, Once};

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn item_meta() -> Arc<ModelMeta> {
    ModelMeta::builder("item")
        .field(FieldModel::text("name").unique())
        .field(FieldModel::text("group").indexed())
        .field(FieldModel::int("rank"))
        .ordering("rank", false)
        .build()
        .expect("item model should validate")
}

fn session() -> (Arc<MemoryBackend>, Session<MemoryBackend>) {
    init_tracing();
    let backend = Arc::new(MemoryBackend::new());
    let config = EngineConfig {
        namespace: "it.".to_string(),
        ..EngineConfig::default()
    };

    (Arc::clone(&backend), Session::new(backend, config))
}

fn item(meta: &Arc<ModelMeta>, name: &str, group: &str, rank: i64) -> Instance {
    Instance::new(Arc::clone(meta))
        .with("name", name)
        .and_then(|i| i.with("group", group))
        .and_then(|i| i.with("rank", rank))
        .expect("item fields should accept their kinds")
}

fn names(rows: &[Instance]) -> Vec<String> {
    rows.iter()
        .filter_map(|row| row.get("name").and_then(Value::as_text).map(ToString::to_string))
        .collect()
}

#[test]
fn filter_order_delete_scenario() {
    let (backend, mut session) = session();
    let meta = item_meta();

    session.add(item(&meta, "a", "g", 1)).expect("a should add");
    session.add(item(&meta, "b", "g", 2)).expect("b should add");
    session.commit().expect("insert should commit");

    let in_group = Query::new(Arc::clone(&meta)).filter("group", "g").order_by("rank");
    let rows = session.load(&in_group).expect("group query should load");
    assert_eq!(names(&rows), vec!["a".to_string(), "b".to_string()]);

    let a = rows[0].iid().clone();
    assert!(session.delete(&meta, &a));
    session.commit().expect("delete should commit");

    let rows = session.load(&in_group).expect("group query should load");
    assert_eq!(names(&rows), vec!["b".to_string()]);

    let unique = backend
        .execute(Command::HGet {
            key: session.keys().unique_key(&meta, "name"),
            field: "a".to_string(),
        })
        .and_then(Reply::into_opt_string)
        .expect("unique index should read");
    assert_eq!(unique, None);

    let by_name = Query::new(Arc::clone(&meta)).filter("name", "a");
    assert_eq!(session.count(&by_name).expect("count should succeed"), 0);
}

#[test]
fn server_ids_are_assigned_in_staging_order() {
    let (backend, mut session) = session();
    let meta = item_meta();
    backend
        .execute(Command::Set {
            key: "it.item:seq".to_string(),
            value: "100".to_string(),
        })
        .expect("sequence should seed");

    let first = session.add(item(&meta, "a", "g", 1)).expect("a should add");
    let second = session.add(item(&meta, "b", "g", 2)).expect("b should add");
    let model = session.model(&meta).expect("model should be tracked");
    assert_eq!(model.partition_of(&first), Some(Partition::New));
    assert_eq!(model.partition_of(&second), Some(Partition::New));

    let report = session.commit().expect("commit should succeed");
    assert_eq!(report.saved("item"), &[Id::from(101_u64), Id::from(102_u64)]);

    let model = session.model(&meta).expect("model should be tracked");
    assert_eq!(model.new_instances().count(), 0);
    let loaded: Vec<(Option<Id>, Option<Value>)> = model
        .loaded_instances()
        .map(|i| (i.id().cloned(), i.get("name").cloned()))
        .collect();
    assert_eq!(
        loaded,
        vec![
            (Some(Id::from(101_u64)), Some(Value::from("a"))),
            (Some(Id::from(102_u64)), Some(Value::from("b"))),
        ]
    );
}

#[test]
fn empty_commit_sends_no_writes() {
    let (backend, mut session) = session();
    backend.reset_stats().expect("stats should reset");

    let report = session.commit().expect("empty commit should succeed");

    assert_eq!(report.writes, 0);
    assert_eq!(backend.stats().expect("stats should read").writes, 0);
}

#[test]
fn backend_failure_is_surfaced_and_retryable() {
    let (backend, mut session) = session();
    let meta = item_meta();
    let iid = session.add(item(&meta, "a", "g", 1)).expect("a should add");

    backend
        .fail_next_transaction("READONLY replica")
        .expect("failure should arm");
    let err = session.commit().expect_err("commit should fail");
    assert_eq!(err.class, ErrorClass::Backend);
    assert!(err.message.contains("READONLY replica"));
    assert!(session.contains_instance(&meta, &iid));

    let report = session.commit().expect("retry should succeed");
    assert_eq!(report.saved("item").len(), 1);
    assert_eq!(
        session
            .count(&Query::new(Arc::clone(&meta)))
            .expect("count should succeed"),
        1
    );
}

#[test]
fn version_is_exported() {
    assert!(!keyset::VERSION.is_empty());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn ordered_load_returns_every_row_by_rank(ranks in proptest::collection::vec(-50i64..50, 0..12)) {
        let (_backend, mut session) = session();
        let meta = item_meta();
        for (i, rank) in ranks.iter().enumerate() {
            session
                .add(item(&meta, &format!("n{i}"), "g", *rank))
                .expect("item should add");
        }
        session.commit().expect("insert should commit");

        let rows = session
            .load(&Query::new(Arc::clone(&meta)).order_by("rank"))
            .expect("ordered query should load");
        let loaded: Vec<i64> = rows
            .iter()
            .filter_map(|row| row.get("rank").and_then(Value::as_int))
            .collect();

        let mut expected = ranks.clone();
        expected.sort_unstable();
        prop_assert_eq!(loaded, expected);
    }
}
