/// Optimistic versioning tests
///
/// The version attribute's lifecycle: initialized on insert, bumped and
/// guarded on update, checked on guarded removes, and skippable when
/// optimistic locking is configured off.
/// Run with: cargo test --test version_tests
use rustviewdb::{
    AttributeDef, AttributeValue, FlatValue, FlushConfig, InMemoryStore, Transaction, Value,
    ViewError, ViewManager, ViewMetamodel, ViewType, WriteOp,
};

// Note attribute indexes
const TITLE: usize = 0;
const VERSION: usize = 1;

fn metamodel() -> ViewMetamodel {
    let mut metamodel = ViewMetamodel::new();
    metamodel
        .register(
            ViewType::new("Note")
                .attribute(AttributeDef::basic("title"))
                .attribute(AttributeDef::basic("version"))
                .versioned_by("version"),
        )
        .unwrap();
    metamodel
}

fn manager() -> ViewManager {
    ViewManager::new(metamodel()).unwrap()
}

#[test]
fn test_insert_initializes_version_to_zero() {
    let manager = manager();
    let mut graph = manager.new_graph();
    let note = graph.create_with_id("Note", Value::from(1)).unwrap();
    graph.set(note, TITLE, Value::from("draft")).unwrap();

    let mut store = InMemoryStore::new();
    let mut tx = Transaction::begin();
    manager.flush(&mut graph, note, &mut store, &mut tx).unwrap();
    tx.commit(&mut graph).unwrap();

    let row = store.row("Note", &Value::from(1)).unwrap();
    assert_eq!(row.version, Some(Value::Integer(0)));
    assert_eq!(
        graph.node(note).unwrap().version(),
        Some(&Value::Integer(0))
    );
}

#[test]
fn test_update_bumps_version_and_writes_its_slot() {
    let manager = manager();
    let mut graph = manager.new_graph();
    let mut store = InMemoryStore::new();
    let note = graph.create_with_id("Note", Value::from(1)).unwrap();
    graph.set(note, TITLE, Value::from("draft")).unwrap();
    let mut tx = Transaction::begin();
    manager.flush(&mut graph, note, &mut store, &mut tx).unwrap();
    tx.commit(&mut graph).unwrap();
    store.clear_log();

    graph.set(note, TITLE, Value::from("v2")).unwrap();
    let mut tx = Transaction::begin();
    manager.flush(&mut graph, note, &mut store, &mut tx).unwrap();
    tx.commit(&mut graph).unwrap();

    // The partial set gains the version slot even though only the title
    // changed.
    match &store.write_log()[0] {
        WriteOp::Update { attributes, .. } => {
            assert_eq!(
                attributes,
                &Some(vec!["title".to_string(), "version".to_string()])
            );
        }
        other => panic!("expected an update, got {:?}", other),
    }
    let row = store.row("Note", &Value::from(1)).unwrap();
    assert_eq!(row.version, Some(Value::Integer(1)));
    assert_eq!(
        graph.node(note).unwrap().version(),
        Some(&Value::Integer(1))
    );
}

#[test]
fn test_stale_writer_gets_a_concurrency_conflict() {
    let manager = manager();
    let mut store = InMemoryStore::new();

    // Writer A persists the note and moves it to version 1.
    let mut graph_a = manager.new_graph();
    let note_a = graph_a.create_with_id("Note", Value::from(1)).unwrap();
    graph_a.set(note_a, TITLE, Value::from("draft")).unwrap();
    let mut tx = Transaction::begin();
    manager.flush(&mut graph_a, note_a, &mut store, &mut tx).unwrap();
    tx.commit(&mut graph_a).unwrap();

    // Writer B loaded the row before A's update landed.
    let mut graph_b = manager.new_graph();
    let note_b = graph_b
        .load(
            "Note",
            Value::from(1),
            Some(Value::Integer(0)),
            vec![
                AttributeValue::Basic(Value::from("draft")),
                AttributeValue::Basic(Value::Integer(0)),
            ],
        )
        .unwrap();

    graph_a.set(note_a, TITLE, Value::from("from-a")).unwrap();
    let mut tx = Transaction::begin();
    manager.flush(&mut graph_a, note_a, &mut store, &mut tx).unwrap();
    tx.commit(&mut graph_a).unwrap();

    graph_b.set(note_b, TITLE, Value::from("from-b")).unwrap();
    let mut tx = Transaction::begin();
    match manager.flush(&mut graph_b, note_b, &mut store, &mut tx) {
        Err(ViewError::ConcurrencyConflict { view_type, .. }) => {
            assert_eq!(view_type, "Note");
        }
        other => panic!("expected ConcurrencyConflict, got {:?}", other),
    }

    // B's change is still pending and its version was not advanced.
    assert!(graph_b.is_effectively_dirty(note_b).unwrap());
    assert_eq!(
        graph_b.node(note_b).unwrap().version(),
        Some(&Value::Integer(0))
    );
    let row = store.row("Note", &Value::from(1)).unwrap();
    assert_eq!(row.fields["title"], FlatValue::Basic(Value::from("from-a")));

    // A fresh load at the current version carries the change through.
    let mut graph_c = manager.new_graph();
    let note_c = graph_c
        .load(
            "Note",
            Value::from(1),
            Some(Value::Integer(1)),
            vec![
                AttributeValue::Basic(Value::from("from-a")),
                AttributeValue::Basic(Value::Integer(1)),
            ],
        )
        .unwrap();
    graph_c.set(note_c, TITLE, Value::from("from-b")).unwrap();
    let mut tx = Transaction::begin();
    manager.flush(&mut graph_c, note_c, &mut store, &mut tx).unwrap();
    tx.commit(&mut graph_c).unwrap();

    let row = store.row("Note", &Value::from(1)).unwrap();
    assert_eq!(row.version, Some(Value::Integer(2)));
}

#[test]
fn test_guarded_remove_conflicts_when_version_moved() {
    let manager = manager();
    let mut store = InMemoryStore::new();

    let mut graph_a = manager.new_graph();
    let note_a = graph_a.create_with_id("Note", Value::from(1)).unwrap();
    let mut tx = Transaction::begin();
    manager.flush(&mut graph_a, note_a, &mut store, &mut tx).unwrap();
    tx.commit(&mut graph_a).unwrap();

    let mut graph_b = manager.new_graph();
    let note_b = graph_b
        .load(
            "Note",
            Value::from(1),
            Some(Value::Integer(0)),
            vec![
                AttributeValue::Basic(Value::Null),
                AttributeValue::Basic(Value::Integer(0)),
            ],
        )
        .unwrap();

    // A moves the row to version 1; B still holds version 0.
    graph_a.set(note_a, TITLE, Value::from("from-a")).unwrap();
    let mut tx = Transaction::begin();
    manager.flush(&mut graph_a, note_a, &mut store, &mut tx).unwrap();
    tx.commit(&mut graph_a).unwrap();

    let mut tx = Transaction::begin();
    match manager.remove(&mut graph_b, note_b, &mut store, &mut tx) {
        Err(ViewError::ConcurrencyConflict { view_type, .. }) => {
            assert_eq!(view_type, "Note");
        }
        other => panic!("expected ConcurrencyConflict, got {:?}", other),
    }
    assert_eq!(store.row_count("Note"), 1);
}

#[test]
fn test_without_optimistic_locking_last_write_wins() {
    let manager = ViewManager::new(metamodel())
        .unwrap()
        .with_flush_defaults(FlushConfig::default().without_optimistic_locking());
    let mut store = InMemoryStore::new();

    let mut graph_a = manager.new_graph();
    let note_a = graph_a.create_with_id("Note", Value::from(1)).unwrap();
    let mut tx = Transaction::begin();
    manager.flush(&mut graph_a, note_a, &mut store, &mut tx).unwrap();
    tx.commit(&mut graph_a).unwrap();

    let mut graph_b = manager.new_graph();
    let note_b = graph_b
        .load(
            "Note",
            Value::from(1),
            Some(Value::Integer(0)),
            vec![
                AttributeValue::Basic(Value::Null),
                AttributeValue::Basic(Value::Integer(0)),
            ],
        )
        .unwrap();

    graph_a.set(note_a, TITLE, Value::from("from-a")).unwrap();
    let mut tx = Transaction::begin();
    manager.flush(&mut graph_a, note_a, &mut store, &mut tx).unwrap();
    tx.commit(&mut graph_a).unwrap();

    // The stale writer is not rejected without a guard.
    graph_b.set(note_b, TITLE, Value::from("from-b")).unwrap();
    let mut tx = Transaction::begin();
    manager.flush(&mut graph_b, note_b, &mut store, &mut tx).unwrap();
    tx.commit(&mut graph_b).unwrap();

    let row = store.row("Note", &Value::from(1)).unwrap();
    assert_eq!(row.fields["title"], FlatValue::Basic(Value::from("from-b")));
}
