use super::*;
use crate::{
    db::backend::{Backend, BackendError, Command, MemoryBackend},
    error::ErrorClass,
    obs::sink::{MetricsEvent, QueryPath},
    test_fixtures::{item_meta, memory_session, tag_meta},
};
use std::{collections::BTreeMap, sync::Mutex};

fn item(name: &str, group: &str, rank: i64) -> Instance {
    Instance::new(item_meta())
        .with("name", name)
        .and_then(|i| i.with("group", group))
        .and_then(|i| i.with("rank", rank))
        .expect("item fields should accept their kinds")
}

fn ids(values: &[u64]) -> Vec<Id> {
    values.iter().copied().map(Id::from).collect()
}

fn zmembers(backend: &MemoryBackend, key: String) -> Vec<String> {
    backend
        .execute(Command::ZRange {
            key,
            start: 0,
            stop: -1,
            reverse: false,
        })
        .and_then(Reply::into_strings)
        .expect("scored set should read")
}

fn seed_sequence(backend: &MemoryBackend, last: &str) {
    backend
        .execute(Command::Set {
            key: "test.item:seq".to_string(),
            value: last.to_string(),
        })
        .expect("sequence should seed");
}

fn group_key<B: Backend + ?Sized>(session: &Session<B>, group: &str) -> String {
    session
        .keys()
        .index_key(&item_meta(), "group", &Value::from(group))
}

#[test]
fn new_instances_receive_counter_ids_in_staging_order() {
    let (backend, mut session) = memory_session();
    seed_sequence(&backend, "100");

    let a = session.add(item("a", "g", 2)).expect("add should succeed");
    let b = session.add(item("b", "g", 1)).expect("add should succeed");

    let report = session.commit().expect("commit should succeed");
    assert_eq!(report.saved("item"), ids(&[101, 102]).as_slice());
    assert!(report.writes > 0);

    // local identities are replaced by persistent ones
    let meta = item_meta();
    assert!(!session.contains_instance(&meta, &a));
    assert!(!session.contains_instance(&meta, &b));
    let first = session
        .get(&meta, &Id::from(101_u64))
        .expect("committed instance should be tracked");
    assert!(first.is_persistent());
    assert!(!first.is_dirty());
    assert_eq!(
        session.model(&meta).and_then(|m| m.partition_of(first.iid())),
        Some(Partition::Loaded)
    );

    // ids are ordered by rank
    let all = zmembers(&backend, session.keys().ids_key(&meta));
    assert_eq!(all, vec!["102".to_string(), "101".to_string()]);
    assert!(session.transaction().is_none());
}

#[test]
fn modifying_a_loaded_instance_moves_its_index_entry() {
    let (backend, mut session) = memory_session();
    session.add(item("a", "red", 1)).expect("add should succeed");
    let report = session.commit().expect("commit should succeed");
    let id = report.saved("item")[0].clone();

    let meta = item_meta();
    let iid = Iid::Persistent(id.clone());
    session
        .update(&meta, &iid, |i| i.set("group", "blue"))
        .expect("loaded instance should update")
        .expect("group should accept text");
    assert_eq!(
        session.model(&meta).and_then(|m| m.partition_of(&iid)),
        Some(Partition::Modified)
    );

    session.commit().expect("second commit should succeed");

    assert!(zmembers(&backend, group_key(&session, "red")).is_empty());
    assert_eq!(
        zmembers(&backend, group_key(&session, "blue")),
        vec![id.to_string()]
    );
}

#[test]
fn deleting_removes_every_trace_and_evicts_the_identity() {
    let (backend, mut session) = memory_session();
    session.add(item("a", "red", 1)).expect("add should succeed");
    let report = session.commit().expect("commit should succeed");
    let id = report.saved("item")[0].clone();

    let meta = item_meta();
    let iid = Iid::Persistent(id.clone());
    assert!(session.delete(&meta, &iid));

    let report = session.commit().expect("delete commit should succeed");
    assert_eq!(report.deleted("item"), std::slice::from_ref(&id));
    assert!(!session.contains_instance(&meta, &iid));

    let keys = session.model_keys(&meta).expect("keys should list");
    assert_eq!(keys, vec!["test.item:seq".to_string()]);
    assert!(zmembers(&backend, session.keys().ids_key(&meta)).is_empty());
}

#[test]
fn delete_queries_remove_matching_objects_at_commit() {
    let (backend, mut session) = memory_session();
    session.add(item("a", "red", 1)).expect("add should succeed");
    session.add(item("b", "blue", 2)).expect("add should succeed");
    session.add(item("c", "red", 3)).expect("add should succeed");
    session.commit().expect("commit should succeed");

    let meta = item_meta();
    session
        .delete_query(Query::new(item_meta()).filter("group", "red"))
        .expect("delete query should validate");
    let report = session.commit().expect("delete commit should succeed");

    assert_eq!(report.deleted("item"), ids(&[1, 3]).as_slice());
    assert_eq!(
        zmembers(&backend, session.keys().ids_key(&meta)),
        vec!["2".to_string()]
    );
    assert!(session.get(&meta, &Id::from(1_u64)).is_none());
}

#[test]
fn invalid_delete_queries_are_rejected_immediately() {
    let (_backend, mut session) = memory_session();

    let err = session
        .delete_query(Query::new(item_meta()).filter("note", "x"))
        .expect_err("non-indexed filter should be rejected");
    assert_eq!(err.class, ErrorClass::Unsupported);
    assert!(!session.model(&item_meta()).is_some_and(SessionModel::has_pending));
}

#[test]
fn empty_commit_performs_no_writes() {
    let (backend, mut session) = memory_session();
    backend.reset_stats().expect("stats should reset");

    let report = session.commit().expect("empty commit should succeed");
    assert_eq!(report.writes, 0);
    assert!(report.results.is_empty());
    assert_eq!(backend.stats().expect("stats should read").writes, 0);
}

#[test]
fn failed_commit_keeps_pending_state_and_can_be_retried() {
    let (backend, mut session) = memory_session();
    session.add(item("a", "red", 1)).expect("add should succeed");
    session.commit().expect("seed commit should succeed");

    let meta = item_meta();
    let loaded = Iid::Persistent(Id::from(1_u64));
    assert!(session.delete(&meta, &loaded));
    let fresh = session.add(item("b", "red", 2)).expect("add should succeed");

    backend
        .fail_next_transaction("connection reset")
        .expect("failure should arm");
    let err = session.commit().expect_err("commit should fail");
    assert_eq!(err.class, ErrorClass::Backend);
    assert!(matches!(
        err.backend_error(),
        Some(BackendError::Aborted { .. })
    ));

    let model = session.model(&meta).expect("model should be tracked");
    assert_eq!(model.partition_of(&loaded), Some(Partition::Deleted));
    assert_eq!(model.partition_of(&fresh), Some(Partition::New));
    assert!(session.transaction().is_none());

    // the reserved id 2 is burned
    let report = session.commit().expect("retry should succeed");
    assert_eq!(report.saved("item"), ids(&[3]).as_slice());
    assert_eq!(report.deleted("item"), ids(&[1]).as_slice());
    assert_eq!(
        zmembers(&backend, session.keys().ids_key(&meta)),
        vec!["3".to_string()]
    );
}

#[test]
fn transaction_state_errors() {
    let (_backend, mut session) = memory_session();

    session.begin().expect("first begin should succeed");
    let err = session.begin().expect_err("second begin should fail");
    assert_eq!(err.class, ErrorClass::InvalidState);

    session.rollback().expect("rollback should close the transaction");
    let err = session.rollback().expect_err("nothing left to roll back");
    assert_eq!(err.class, ErrorClass::InvalidState);
    assert!(err.message.contains("already closed"));

    let mut transaction = Transaction::new();
    transaction
        .close(TransactionStatus::Committed)
        .expect("open transaction should close");
    let err = transaction
        .close(TransactionStatus::Committed)
        .expect_err("closed transaction should reject reuse");
    assert!(matches!(err, TransactionError::Closed { .. }));
}

#[test]
fn rollback_sends_nothing_and_keeps_pending_instances() {
    let (backend, mut session) = memory_session();
    session.begin().expect("begin should succeed");
    let iid = session.add(item("a", "red", 1)).expect("add should succeed");
    backend.reset_stats().expect("stats should reset");

    session.rollback().expect("rollback should succeed");

    assert_eq!(backend.stats().expect("stats should read").round_trips, 0);
    assert!(session.contains_instance(&item_meta(), &iid));
}

#[test]
fn deleted_identities_cannot_be_re_added() {
    let (_backend, mut session) = memory_session();
    session.add(item("a", "red", 1)).expect("add should succeed");
    session.commit().expect("commit should succeed");

    let meta = item_meta();
    let id = Id::from(1_u64);
    let copy = session
        .get(&meta, &id)
        .cloned()
        .expect("committed instance should be tracked");
    session.delete(&meta, copy.iid());

    let err = session.add(copy).expect_err("deleted identity should be rejected");
    assert_eq!(err.class, ErrorClass::InvalidState);
}

#[test]
fn partial_loads_fetch_unknown_old_values_before_staging() {
    let (backend, mut session) = memory_session();
    session.add(item("a", "red", 1)).expect("add should succeed");
    session.commit().expect("commit should succeed");

    let mut fresh = Session::new(Arc::clone(&backend), session.config().clone());
    let meta = item_meta();
    let rows = fresh
        .load(&Query::new(item_meta()).load_only(["note"]))
        .expect("partial load should succeed");
    assert_eq!(rows.len(), 1);
    assert!(rows[0].get("group").is_none());

    let iid = rows[0].iid().clone();
    fresh
        .update(&meta, &iid, |i| i.set("rank", 7))
        .expect("update should find instance")
        .expect("rank should accept int");
    fresh.commit().expect("partial commit should succeed");

    // untouched fields and their index entries survive
    let stored = backend
        .execute(Command::HGet {
            key: fresh.keys().object_key(&meta, &Id::from(1_u64)),
            field: "group".to_string(),
        })
        .and_then(Reply::into_opt_string)
        .expect("hash should read");
    assert_eq!(stored.as_deref(), Some("red"));
    assert_eq!(zmembers(&backend, group_key(&fresh, "red")), vec!["1".to_string()]);
}

#[test]
fn explicit_id_overwrites_existing_object_and_its_indexes() {
    let (backend, mut session) = memory_session();
    session
        .add(Instance::with_id(item_meta(), "k1").with("group", "red").expect("group"))
        .expect("add should succeed");
    session.commit().expect("commit should succeed");

    let mut other = Session::new(Arc::clone(&backend), session.config().clone());
    other
        .add(Instance::with_id(item_meta(), "k1").with("group", "blue").expect("group"))
        .expect("add should succeed");
    other.commit().expect("overwrite should succeed");

    assert!(zmembers(&backend, group_key(&other, "red")).is_empty());
    assert_eq!(zmembers(&backend, group_key(&other, "blue")), vec!["k1".to_string()]);
    assert_eq!(
        zmembers(&backend, other.keys().ids_key(&item_meta())),
        vec!["k1".to_string()]
    );
}

#[test]
fn unique_value_handed_over_within_one_commit_stays_indexed() {
    let (_backend, mut session) = memory_session();
    session.add(item("x", "red", 1)).expect("add should succeed");
    session.add(item("z", "red", 2)).expect("add should succeed");
    session.commit().expect("commit should succeed");

    let meta = item_meta();
    session
        .update(&meta, &Iid::Persistent(Id::from(1_u64)), |i| i.set("name", "y"))
        .expect("update should find instance")
        .expect("name should accept text");
    assert!(session.delete(&meta, &Iid::Persistent(Id::from(2_u64))));
    session.add(item("x", "blue", 3)).expect("add should succeed");
    session.add(item("z", "blue", 4)).expect("add should succeed");

    let report = session.commit().expect("handover should commit");
    assert_eq!(report.saved("item"), ids(&[3, 4, 1]).as_slice());

    let by_name = |session: &Session<MemoryBackend>, name: &str| {
        session
            .load_ids(&Query::new(item_meta()).filter("name", name))
            .expect("unique lookup should succeed")
    };
    assert_eq!(by_name(&session, "x"), ids(&[3]));
    assert_eq!(by_name(&session, "y"), ids(&[1]));
    assert_eq!(by_name(&session, "z"), ids(&[4]));
}

#[test]
fn load_returns_pending_local_edits() {
    let (_backend, mut session) = memory_session();
    session.add(item("a", "red", 1)).expect("add should succeed");
    session.commit().expect("commit should succeed");

    let meta = item_meta();
    let iid = Iid::Persistent(Id::from(1_u64));
    session
        .update(&meta, &iid, |i| i.set("note", "local"))
        .expect("update should find instance")
        .expect("note should accept text");

    let rows = session
        .load(&Query::new(item_meta()).filter("group", "red"))
        .expect("load should succeed");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("note"), Some(&Value::from("local")));
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<CommitEvent>>,
}

impl CommitListener for Recorder {
    fn on_commit(&self, event: &CommitEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

#[test]
fn listeners_receive_one_event_per_model_and_action() {
    let (_backend, mut session) = memory_session();
    let recorder = Arc::new(Recorder::default());
    session.subscribe(Arc::clone(&recorder) as Arc<dyn CommitListener>);

    session.add(item("a", "red", 1)).expect("add should succeed");
    session.add(item("b", "red", 2)).expect("add should succeed");
    let tag = Instance::new(tag_meta()).with("label", "x").expect("label");
    session.add(tag).expect("add should succeed");
    let report = session.commit().expect("commit should succeed");

    let events = recorder.events.lock().expect("events should lock").clone();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].model(), "item");
    assert_eq!(events[0].ids(), ids(&[1, 2]).as_slice());
    assert_eq!(events[1].model(), "tag");
    assert!(matches!(
        &events[1],
        CommitEvent::Saved { transaction, .. } if *transaction == report.transaction
    ));
}

#[test]
fn get_or_create_finds_or_tracks() {
    let (_backend, mut session) = memory_session();
    let meta = item_meta();

    let (iid, created) = session
        .get_or_create(&meta, &[("name", Value::from("a"))])
        .expect("lookup should succeed");
    assert!(created);
    assert_eq!(
        session.model(&meta).and_then(|m| m.partition_of(&iid)),
        Some(Partition::New)
    );
    session.commit().expect("commit should succeed");

    let (iid, created) = session
        .get_or_create(&meta, &[("name", Value::from("a"))])
        .expect("lookup should succeed");
    assert!(!created);
    assert_eq!(iid, Iid::Persistent(Id::from(1_u64)));

    session.add(item("b", "g", 1)).expect("add should succeed");
    session.add(item("c", "g", 2)).expect("add should succeed");
    session.commit().expect("commit should succeed");
    let err = session
        .get_or_create(&meta, &[("group", Value::from("g"))])
        .expect_err("two matches should conflict");
    assert_eq!(err.class, ErrorClass::Conflict);
}

#[test]
fn flush_model_removes_every_model_key() {
    let (backend, mut session) = memory_session();
    session.add(item("a", "red", 1)).expect("add should succeed");
    let tag = Instance::new(tag_meta()).with("label", "x").expect("label");
    session.add(tag).expect("add should succeed");
    session.commit().expect("commit should succeed");

    let meta = item_meta();
    assert!(!session.model_keys(&meta).expect("keys should list").is_empty());

    let removed = session.flush_model(&meta).expect("flush should succeed");
    assert!(removed > 0);
    assert!(session.model_keys(&meta).expect("keys should list").is_empty());
    assert!(session.model(&meta).is_none());
    assert!(
        !session
            .model_keys(&tag_meta())
            .expect("keys should list")
            .is_empty()
    );
    assert!(backend.key_count().expect("keys should count") > 0);
}

#[test]
fn reconciliation_rejects_a_changed_id() {
    let mut instance = Instance::from_store(item_meta(), Id::from(5_u64), Vec::new(), None)
        .expect("empty hash should decode");

    let err = instance
        .mark_persisted(Id::from(6_u64), BTreeMap::new())
        .expect_err("changed id should be rejected");
    assert!(matches!(err, SessionError::IdChanged { .. }));
    assert_eq!(instance.id(), Some(&Id::from(5_u64)));
    assert_eq!(InternalError::from(err).class, ErrorClass::Conflict);
}

#[derive(Default)]
struct PathSink {
    paths: Mutex<Vec<QueryPath>>,
    writes: Mutex<u64>,
}

impl MetricsSink for PathSink {
    fn record(&self, event: MetricsEvent<'_>) {
        match event {
            MetricsEvent::QueryCompiled { path, .. } => {
                if let Ok(mut paths) = self.paths.lock() {
                    paths.push(path);
                }
            }
            MetricsEvent::CommitFinish { writes } => {
                if let Ok(mut total) = self.writes.lock() {
                    *total += writes;
                }
            }
            _ => {}
        }
    }
}

#[test]
fn session_metrics_route_to_the_configured_sink() {
    let (backend, _session) = memory_session();
    let sink = Arc::new(PathSink::default());
    let mut session = Session::new(backend, crate::test_fixtures::test_config())
        .metrics_sink(Arc::clone(&sink) as Arc<dyn MetricsSink>);

    session.add(item("a", "red", 1)).expect("add should succeed");
    let report = session.commit().expect("commit should succeed");
    session
        .load_ids(&Query::new(item_meta()).filter("name", "a"))
        .expect("unique lookup should load");
    session
        .load_ids(&Query::new(item_meta()).filter("group", "red"))
        .expect("index lookup should load");

    assert_eq!(*sink.writes.lock().expect("writes should lock"), report.writes);
    assert_eq!(
        *sink.paths.lock().expect("paths should lock"),
        vec![QueryPath::Simple, QueryPath::Keyed]
    );
}
