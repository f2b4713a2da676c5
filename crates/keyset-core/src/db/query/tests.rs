use super::*;
use crate::{
    config::EngineConfig,
    db::{
        backend::{Backend, Command, MemoryBackend, Reply},
        session::{Instance, Session},
    },
    error::ErrorClass,
    obs::sink::QueryPath,
    test_fixtures::{archive_meta, item_meta, memory_session, tag_meta, test_config},
    types::Id,
};
use proptest::prelude::*;
use std::{collections::BTreeSet, sync::Arc, time::Duration};

///
/// Catalog
///
/// items: 1 a red r3, 2 b blue r1, 3 c red r2, 4 d green r4
/// tags:  1 x -> item 1, 2 y -> item 3, 3 x -> item 4
///

fn catalog() -> (Arc<MemoryBackend>, Session<MemoryBackend>) {
    let (backend, mut session) = memory_session();
    for (name, group, rank) in [("a", "red", 3), ("b", "blue", 1), ("c", "red", 2), ("d", "green", 4)] {
        let item = Instance::new(item_meta())
            .with("name", name)
            .and_then(|i| i.with("group", group))
            .and_then(|i| i.with("rank", rank))
            .expect("item fields should accept their kinds");
        session.add(item).expect("item should add");
    }
    for (label, item) in [("x", "1"), ("y", "3"), ("x", "4")] {
        let tag = Instance::new(tag_meta())
            .with("label", label)
            .and_then(|t| t.with("item", item))
            .expect("tag fields should accept their kinds");
        session.add(tag).expect("tag should add");
    }
    session.commit().expect("catalog should commit");

    (backend, session)
}

fn ids(values: &[u64]) -> Vec<Id> {
    values.iter().copied().map(Id::from).collect()
}

fn items() -> Query {
    Query::new(item_meta())
}

fn compiler<'a>(
    backend: &'a MemoryBackend,
    session: &'a Session<MemoryBackend>,
) -> QueryCompiler<'a, MemoryBackend> {
    QueryCompiler::new(backend, session.keys(), session.config())
}

#[test]
fn unfiltered_query_returns_every_id_by_score() {
    let (_backend, session) = catalog();

    let all = session.load_ids(&items()).expect("load should succeed");
    assert_eq!(all, ids(&[2, 3, 1, 4]));
    assert_eq!(session.count(&items()).expect("count should succeed"), 4);
}

#[test]
fn filters_intersect_and_excludes_subtract() {
    let (_backend, session) = catalog();

    let red = items().filter("group", "red");
    assert_eq!(session.load_ids(&red).expect("load should succeed"), ids(&[3, 1]));

    let red_not_a = items().filter("group", "red").exclude("name", "a");
    assert_eq!(session.load_ids(&red_not_a).expect("load should succeed"), ids(&[3]));

    let not_red_or_blue = items().exclude_in("group", ["red", "blue"]);
    assert_eq!(
        session.load_ids(&not_red_or_blue).expect("load should succeed"),
        ids(&[4])
    );

    let none = items().filter("group", "purple");
    assert!(session.load_ids(&none).expect("load should succeed").is_empty());
    assert_eq!(session.count(&none).expect("count should succeed"), 0);
}

#[test]
fn simple_and_keyed_paths_agree() {
    let (backend, session) = catalog();
    let keyed = Session::new(
        Arc::clone(&backend),
        EngineConfig {
            simple_lookup_limit: 0,
            ..test_config()
        },
    );

    let by_id = items().filter_in("id", ["3", "1", "99"]);
    let by_name = items().filter_in("name", ["d", "a", "zz"]);
    let both = items().filter_in("id", ["1", "2"]).filter("name", "a");

    for (query, expected) in [(by_id, ids(&[3, 1])), (by_name, ids(&[1, 4])), (both, ids(&[1]))] {
        let simple_path = compiler(&backend, &session)
            .compile(&query)
            .expect("simple compile should succeed");
        assert_eq!(simple_path.path, QueryPath::Simple);

        let keyed_path = compiler(&backend, &keyed)
            .compile(&query)
            .expect("keyed compile should succeed");
        assert_eq!(keyed_path.path, QueryPath::Keyed);

        assert_eq!(session.load_ids(&query).expect("simple load"), expected);
        assert_eq!(keyed.load_ids(&query).expect("keyed load"), expected);
        assert_eq!(
            session.count(&query).expect("simple count"),
            keyed.count(&query).expect("keyed count")
        );
    }
}

#[test]
fn simple_path_is_a_single_round_trip() {
    let (backend, session) = catalog();
    backend.reset_stats().expect("stats should reset");

    compiler(&backend, &session)
        .compile(&items().filter_in("name", ["a", "b"]))
        .expect("compile should succeed");

    let stats = backend.stats().expect("stats should read");
    assert_eq!(stats.round_trips, 1);
    assert_eq!(stats.writes, 0);
}

#[test]
fn temp_keys_expire_within_the_configured_bound() {
    let (backend, session) = catalog();

    let compiled = compiler(&backend, &session)
        .compile(&items().filter("group", "red").exclude("name", "a"))
        .expect("compile should succeed");
    assert!(!compiled.temp_keys.is_empty());

    for key in &compiled.temp_keys {
        let ttl = backend
            .execute(Command::Ttl { key: key.clone() })
            .and_then(Reply::into_int)
            .expect("ttl should read");
        assert!(
            (1..=10).contains(&ttl),
            "temp key {key} should expire within the bound, ttl {ttl}"
        );
    }

    backend
        .advance(Duration::from_secs(11))
        .expect("clock should advance");
    for key in &compiled.temp_keys {
        let live = backend
            .execute(Command::Exists { key: key.clone() })
            .and_then(Reply::into_bool)
            .expect("exists should read");
        assert!(!live, "temp key {key} should have expired");
    }
    assert!(
        session
            .model_keys(&item_meta())
            .expect("keys should list")
            .iter()
            .all(|key| !key.contains(":tmp:"))
    );
}

#[test]
fn compiler_errors_surface_before_any_store_access() {
    let (backend, session) = catalog();
    backend.reset_stats().expect("stats should reset");

    let range = items()
        .filter_lookup("rank__gt", vec![1.into()])
        .expect("range lookups should parse");
    let err = session.load_ids(&range).expect_err("range lookup should be rejected");
    assert_eq!(err.class, ErrorClass::Unsupported);

    let cross = items().join("item", Query::new(archive_meta()));
    let err = session.load_ids(&cross).expect_err("cross-partition join should be rejected");
    assert_eq!(err.class, ErrorClass::Unsupported);
    assert!(err.message.contains("partition"));

    let nested = Query::new(tag_meta()).filter_query("item", items().filter("note", "x"));
    let err = session.count(&nested).expect_err("nested rejection should surface");
    assert_eq!(err.class, ErrorClass::Unsupported);

    assert_eq!(backend.stats().expect("stats should read").round_trips, 0);

    let err = items()
        .filter_lookup("rank__between", vec![1.into()])
        .expect_err("unknown lookups should not parse");
    assert!(matches!(err, QueryError::UnknownLookup { .. }));
}

#[test]
fn memoized_queries_rebind_while_the_result_lives() {
    let (backend, session) = catalog();
    let query = items().filter("group", "red").memoize();

    let first = compiler(&backend, &session)
        .compile(&query)
        .expect("first compile should succeed");
    assert_eq!(first.path, QueryPath::Keyed);

    let second = compiler(&backend, &session)
        .compile(&query)
        .expect("second compile should succeed");
    assert_eq!(second.path, QueryPath::Memoized);
    assert_eq!(first.set, second.set);
    assert_eq!(session.load_ids(&query).expect("load should succeed"), ids(&[3, 1]));

    backend
        .advance(Duration::from_secs(11))
        .expect("clock should advance");
    let third = compiler(&backend, &session)
        .compile(&query)
        .expect("third compile should succeed");
    assert_eq!(third.path, QueryPath::Keyed);

    // without memoize the same query never re-binds
    let plain = items().filter("group", "red");
    for _ in 0..2 {
        let compiled = compiler(&backend, &session)
            .compile(&plain)
            .expect("compile should succeed");
        assert_eq!(compiled.path, QueryPath::Keyed);
    }
}

#[test]
fn joins_and_subqueries_follow_foreign_keys() {
    let (_backend, session) = catalog();

    let tagged_x = items().join("item", Query::new(tag_meta()).filter("label", "x"));
    assert_eq!(session.load_ids(&tagged_x).expect("join should load"), ids(&[1, 4]));

    let red_tags = Query::new(tag_meta()).filter_query("item", items().filter("group", "red"));
    let found: BTreeSet<Id> = session
        .load_ids(&red_tags)
        .expect("sub-query should load")
        .into_iter()
        .collect();
    assert_eq!(found, ids(&[1, 2]).into_iter().collect());

    let err = session
        .load_ids(&items().join("label", Query::new(tag_meta())))
        .expect_err("join on a non-reference field should be rejected");
    assert_eq!(err.class, ErrorClass::Unsupported);
}

#[test]
fn empty_windows_select_nothing_on_every_read_path() {
    let (_backend, mut session) = catalog();

    let cases = [
        ("scored", items().slice(0, 0)),
        ("scored offset", items().order_by_desc("rank").slice(2, 2)),
        ("sorted", items().order_by("name").slice(0, 0)),
        ("literal", items().filter_in("id", ["1", "2"]).slice(1, 1)),
        ("plain set", Query::new(tag_meta()).slice(0, 0)),
    ];
    for (path, query) in cases {
        assert!(
            session.load_ids(&query).expect("load should succeed").is_empty(),
            "{path} window should be empty"
        );
        assert_eq!(session.count(&query).expect("count should succeed"), 0);
        assert!(
            session.first(&query).expect("first should succeed").is_none(),
            "{path} first should be none"
        );
    }
}

#[test]
fn ordering_and_windows() {
    let (_backend, mut session) = catalog();

    let desc = items().order_by_desc("rank");
    assert_eq!(session.load_ids(&desc).expect("load should succeed"), ids(&[4, 1, 3, 2]));

    let window = items().order_by_desc("rank").slice(1, 3);
    assert_eq!(session.load_ids(&window).expect("load should succeed"), ids(&[1, 3]));
    assert_eq!(session.count(&window).expect("count should succeed"), 2);

    let by_name = items().order_by("name");
    assert_eq!(session.load_ids(&by_name).expect("sort should succeed"), ids(&[1, 2, 3, 4]));

    let by_name_desc = items().order_by_desc("name").offset(1);
    assert_eq!(
        session.load_ids(&by_name_desc).expect("sort should succeed"),
        ids(&[3, 2, 1])
    );

    let err = session
        .load_ids(&items().slice(3, 1))
        .expect_err("inverted window should be rejected");
    assert_eq!(err.class, ErrorClass::Unsupported);

    let top = session
        .first(&items().order_by_desc("rank"))
        .expect("first should succeed")
        .expect("catalog should not be empty");
    assert_eq!(top.id(), Some(&Id::from(4_u64)));
    assert_eq!(top.get("name"), Some(&Value::from("d")));
}

#[test]
fn contains_ignores_the_window() {
    let (_backend, session) = catalog();
    let red = items().filter("group", "red").slice(0, 1);

    assert!(session.contains(&red, &Id::from(1_u64)).expect("contains should succeed"));
    assert!(!session.contains(&red, &Id::from(2_u64)).expect("contains should succeed"));
}

#[test]
fn load_only_and_related_objects() {
    let (_backend, mut session) = catalog();

    let names = session
        .load(&items().filter("group", "red").load_only(["name"]))
        .expect("partial load should succeed");
    assert_eq!(names.len(), 2);
    assert!(names.iter().all(|i| i.get("name").is_some() && i.get("rank").is_none()));

    let tags = session
        .load(&Query::new(tag_meta()).filter("label", "x").load_related("item", item_meta()))
        .expect("related load should succeed");
    let mut related: Vec<Value> = tags
        .iter()
        .filter_map(|tag| tag.related("item").and_then(|item| item.get("name").cloned()))
        .collect();
    related.sort_by_key(Value::index_token);
    assert_eq!(related, vec![Value::from("a"), Value::from("d")]);
}

#[test]
fn stale_index_entries_are_skipped_on_load() {
    let (backend, mut session) = catalog();
    backend
        .execute(Command::Del {
            keys: vec![session.keys().object_key(&item_meta(), &Id::from(1_u64))],
        })
        .expect("object should delete");

    let rows = session
        .load(&items().filter("group", "red"))
        .expect("load should succeed");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id(), Some(&Id::from(3_u64)));
}

// ----------------------------------------------------------------------
// Set laws
// ----------------------------------------------------------------------

const GROUPS: [&str; 3] = ["g0", "g1", "g2"];

fn grouped_session(groups: &[usize]) -> Session<MemoryBackend> {
    let (_backend, mut session) = memory_session();
    for (rank, group) in groups.iter().enumerate() {
        let item = Instance::new(item_meta())
            .with("group", GROUPS[*group])
            .and_then(|i| i.with("rank", i64::try_from(rank).unwrap_or_default()))
            .expect("item fields should accept their kinds");
        session.add(item).expect("item should add");
    }
    session.commit().expect("items should commit");
    session
}

fn id_set(session: &Session<MemoryBackend>, query: &Query) -> BTreeSet<Id> {
    session
        .load_ids(query)
        .expect("query should load")
        .into_iter()
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn in_lookup_equals_union_of_exact_lookups(
        groups in proptest::collection::vec(0usize..3, 0..10),
        a in 0usize..3,
        b in 0usize..3,
    ) {
        let session = grouped_session(&groups);

        let combined = id_set(&session, &items().filter_in("group", [GROUPS[a], GROUPS[b]]));
        let mut union = id_set(&session, &items().filter("group", GROUPS[a]));
        union.extend(id_set(&session, &items().filter("group", GROUPS[b])));

        prop_assert_eq!(combined, union);
    }

    #[test]
    fn filter_and_exclude_on_the_same_value_is_empty(
        groups in proptest::collection::vec(0usize..3, 0..10),
        g in 0usize..3,
    ) {
        let session = grouped_session(&groups);
        let query = items().filter("group", GROUPS[g]).exclude("group", GROUPS[g]);

        prop_assert!(id_set(&session, &query).is_empty());
        prop_assert_eq!(session.count(&query).expect("count should succeed"), 0);
    }

    #[test]
    fn unfiltered_query_matches_every_committed_id(
        groups in proptest::collection::vec(0usize..3, 0..10),
    ) {
        let session = grouped_session(&groups);
        let expected: BTreeSet<Id> = (1..=groups.len() as u64).map(Id::from).collect();

        prop_assert_eq!(id_set(&session, &items()), expected);
    }
}
