/// Dirty tracking tests
///
/// Covers attribute marking, propagation along owning parents, effective
/// dirtiness against the initial snapshot, and change-model reporting.
/// Run with: cargo test --test dirty_tracking_tests
use rustviewdb::{
    AttributeChange, AttributeDef, AttributeValue, CollectionElement, NodeId, RelationDef,
    RelationOwnership, Value, ViewError, ViewGraph, ViewManager, ViewMetamodel, ViewType,
};

// Order attribute indexes
const NUMBER: usize = 0;
const SHIPPING: usize = 1;
const POSITIONS: usize = 2;
const CUSTOMER: usize = 3;

fn manager() -> ViewManager {
    let mut metamodel = ViewMetamodel::new();
    metamodel
        .register(
            ViewType::new("Address")
                .attribute(AttributeDef::basic("street"))
                .attribute(AttributeDef::basic("city")),
        )
        .unwrap();
    metamodel
        .register(
            ViewType::new("Position")
                .attribute(AttributeDef::basic("quantity"))
                .attribute(AttributeDef::basic("comment")),
        )
        .unwrap();
    metamodel
        .register(ViewType::new("Customer").attribute(AttributeDef::basic("name")))
        .unwrap();
    metamodel
        .register(
            ViewType::new("Order")
                .attribute(AttributeDef::basic("number"))
                .attribute(AttributeDef::reference(
                    "shipping_address",
                    RelationDef::owned("Address").with_ownership(RelationOwnership::ParentColumn),
                ))
                .attribute(AttributeDef::collection(
                    "positions",
                    RelationDef::owned("Position").orphan_removal().cascade_delete(),
                ))
                .attribute(AttributeDef::reference("customer", RelationDef::read_only("Customer"))),
        )
        .unwrap();
    metamodel
        .register(
            ViewType::new("Snapshotless")
                .attribute(AttributeDef::basic("label"))
                .without_initial_state(),
        )
        .unwrap();
    ViewManager::new(metamodel).unwrap()
}

fn load_position(graph: &mut ViewGraph, id: i64, quantity: i64) -> NodeId {
    graph
        .load(
            "Position",
            Value::from(id),
            None,
            vec![
                AttributeValue::Basic(Value::from(quantity)),
                AttributeValue::Basic(Value::Null),
            ],
        )
        .unwrap()
}

fn load_order(graph: &mut ViewGraph, positions: Vec<NodeId>) -> NodeId {
    graph
        .load(
            "Order",
            Value::from(1),
            None,
            vec![
                AttributeValue::Basic(Value::from("ORD-1")),
                AttributeValue::View(None),
                AttributeValue::ViewList(positions),
                AttributeValue::View(None),
            ],
        )
        .unwrap()
}

#[test]
fn test_loaded_node_starts_clean() {
    let manager = manager();
    let mut graph = manager.new_graph();
    let position = load_position(&mut graph, 10, 2);
    let order = load_order(&mut graph, vec![position]);

    assert!(!graph.is_effectively_dirty(order).unwrap());
    assert!(!graph.is_effectively_dirty(position).unwrap());
    assert!(!graph.node(order).unwrap().is_dirty());
}

#[test]
fn test_set_marks_attribute_and_propagates_to_root() {
    let manager = manager();
    let mut graph = manager.new_graph();
    let position = load_position(&mut graph, 10, 2);
    let order = load_order(&mut graph, vec![position]);

    graph.set(position, 0, Value::from(5)).unwrap();

    // The child's own attribute is effectively dirty.
    assert!(graph.is_attribute_dirty(position, 0).unwrap());
    assert!(graph.is_effectively_dirty(position).unwrap());

    // The traversed edge on the parent was marked, and the parent reports
    // dirty through its owned subtree.
    assert!(graph.node(order).unwrap().is_attribute_marked(POSITIONS));
    assert!(graph.is_effectively_dirty(order).unwrap());
}

#[test]
fn test_set_equal_value_is_noop() {
    let manager = manager();
    let mut graph = manager.new_graph();
    let position = load_position(&mut graph, 10, 2);
    let order = load_order(&mut graph, vec![position]);

    graph.set(order, NUMBER, Value::from("ORD-1")).unwrap();

    assert!(!graph.node(order).unwrap().is_dirty());
    assert!(!graph.is_effectively_dirty(order).unwrap());
}

#[test]
fn test_set_back_to_initial_clears_effective_dirtiness() {
    let manager = manager();
    let mut graph = manager.new_graph();
    let order = load_order(&mut graph, vec![]);

    graph.set(order, NUMBER, Value::from("ORD-2")).unwrap();
    graph.set(order, NUMBER, Value::from("ORD-1")).unwrap();

    // The raw mark is monotonic and stays, but effective dirtiness
    // compares against the snapshot and reports clean.
    assert!(graph.node(order).unwrap().is_attribute_marked(NUMBER));
    assert!(!graph.is_attribute_dirty(order, NUMBER).unwrap());
    assert!(!graph.is_effectively_dirty(order).unwrap());
}

#[test]
fn test_new_node_is_always_dirty() {
    let manager = manager();
    let mut graph = manager.new_graph();
    let order = graph.create("Order").unwrap();

    assert!(graph.is_effectively_dirty(order).unwrap());
}

#[test]
fn test_reference_node_ignores_marks() {
    let manager = manager();
    let mut graph = manager.new_graph();
    let customer = graph.create_reference("Customer", Value::from(7)).unwrap();

    graph.mark_dirty(customer, 0).unwrap();

    assert!(!graph.node(customer).unwrap().is_dirty());
    assert!(!graph.is_effectively_dirty(customer).unwrap());
}

#[test]
fn test_read_only_edge_is_never_descended() {
    let manager = manager();
    let mut graph = manager.new_graph();
    let customer = graph
        .load(
            "Customer",
            Value::from(7),
            None,
            vec![AttributeValue::Basic(Value::from("Ada"))],
        )
        .unwrap();
    let order = graph
        .load(
            "Order",
            Value::from(1),
            None,
            vec![
                AttributeValue::Basic(Value::from("ORD-1")),
                AttributeValue::View(None),
                AttributeValue::ViewList(vec![]),
                AttributeValue::View(Some(customer)),
            ],
        )
        .unwrap();

    graph.set(customer, 0, Value::from("Grace")).unwrap();

    // The target is dirty on its own, but its content never leaks
    // through the read-only edge onto the holder.
    assert!(graph.is_effectively_dirty(customer).unwrap());
    assert!(!graph.is_attribute_dirty(order, CUSTOMER).unwrap());
    assert!(!graph.is_effectively_dirty(order).unwrap());
    let change = graph.change_model(order).unwrap();
    assert!(matches!(
        change.attribute(CUSTOMER),
        Some(AttributeChange::Unchanged)
    ));
}

#[test]
fn test_sibling_root_stays_clean() {
    let manager = manager();
    let mut graph = manager.new_graph();
    let position = load_position(&mut graph, 10, 2);
    let order = load_order(&mut graph, vec![position]);
    let other = graph
        .load(
            "Order",
            Value::from(2),
            None,
            vec![
                AttributeValue::Basic(Value::from("ORD-2")),
                AttributeValue::View(None),
                AttributeValue::ViewList(vec![]),
                AttributeValue::View(None),
            ],
        )
        .unwrap();

    graph.set(position, 0, Value::from(9)).unwrap();
    assert!(graph.is_effectively_dirty(order).unwrap());
    assert!(!graph.is_effectively_dirty(other).unwrap());
}

#[test]
fn test_change_model_reports_updated_attribute() {
    let manager = manager();
    let mut graph = manager.new_graph();
    let order = load_order(&mut graph, vec![]);

    graph.set(order, NUMBER, Value::from("ORD-9")).unwrap();

    let change = graph.change_model(order).unwrap();
    assert!(change.is_changed());
    assert_eq!(change.changed_attributes(), vec![NUMBER]);
    match change.attribute(NUMBER).unwrap() {
        AttributeChange::Updated { initial, current } => {
            assert_eq!(initial, &AttributeValue::Basic(Value::from("ORD-1")));
            assert_eq!(current, &AttributeValue::Basic(Value::from("ORD-9")));
        }
        other => panic!("expected Updated, got {:?}", other),
    }
}

#[test]
fn test_change_model_diffs_collections_by_identity() {
    let manager = manager();
    let mut graph = manager.new_graph();
    let kept = load_position(&mut graph, 10, 2);
    let removed = load_position(&mut graph, 11, 3);
    let order = load_order(&mut graph, vec![kept, removed]);

    let added = graph.create("Position").unwrap();
    graph.set(added, 0, Value::from(1)).unwrap();
    graph.list_remove(order, POSITIONS, removed).unwrap();
    graph.list_add(order, POSITIONS, added).unwrap();
    graph.set(kept, 0, Value::from(8)).unwrap();

    let change = graph.change_model(order).unwrap();
    match change.attribute(POSITIONS).unwrap() {
        AttributeChange::Collection(diff) => {
            assert!(!diff.replaced);
            assert_eq!(diff.added, vec![CollectionElement::View(added)]);
            assert_eq!(diff.removed, vec![CollectionElement::View(removed)]);
            assert_eq!(diff.mutated, vec![kept]);
        }
        other => panic!("expected Collection, got {:?}", other),
    }
}

#[test]
fn test_wholesale_replacement_is_flagged() {
    let manager = manager();
    let mut graph = manager.new_graph();
    let old = load_position(&mut graph, 10, 2);
    let order = load_order(&mut graph, vec![old]);

    let fresh = graph.create("Position").unwrap();
    graph.set_view_list(order, POSITIONS, vec![fresh]).unwrap();

    let change = graph.change_model(order).unwrap();
    match change.attribute(POSITIONS).unwrap() {
        AttributeChange::Collection(diff) => {
            assert!(diff.replaced);
            assert_eq!(diff.added, vec![CollectionElement::View(fresh)]);
            assert_eq!(diff.removed, vec![CollectionElement::View(old)]);
        }
        other => panic!("expected Collection, got {:?}", other),
    }
}

#[test]
fn test_change_model_requires_initial_state() {
    let manager = manager();
    let mut graph = manager.new_graph();
    let node = graph.create("Snapshotless").unwrap();
    graph.set(node, 0, Value::from("x")).unwrap();

    match graph.change_model(node) {
        Err(ViewError::StructuralViolation(msg)) => {
            assert!(msg.contains("does not track initial state"));
        }
        other => panic!("expected StructuralViolation, got {:?}", other),
    }
}

#[test]
fn test_immutable_attribute_rejects_writes() {
    let mut metamodel = ViewMetamodel::new();
    metamodel
        .register(
            ViewType::new("Fixed")
                .attribute(AttributeDef::immutable("code"))
                .attribute(AttributeDef::basic("label")),
        )
        .unwrap();
    let manager = ViewManager::new(metamodel).unwrap();
    let mut graph = manager.new_graph();
    let node = graph.create("Fixed").unwrap();

    match graph.set(node, 0, Value::from("nope")) {
        Err(ViewError::StructuralViolation(msg)) => assert!(msg.contains("not mutable")),
        other => panic!("expected StructuralViolation, got {:?}", other),
    }
    graph.set(node, 1, Value::from("fine")).unwrap();
}

#[test]
fn test_replace_attribute_swaps_only_when_expectation_holds() {
    let manager = manager();
    let mut graph = manager.new_graph();
    let position = load_position(&mut graph, 1, 5);

    let swapped = graph
        .replace_attribute(
            position,
            0,
            &AttributeValue::Basic(Value::from(5)),
            AttributeValue::Basic(Value::from(9)),
        )
        .unwrap();
    assert!(swapped);
    assert_eq!(graph.get(position, 0).unwrap(), &AttributeValue::Basic(Value::from(9)));
    assert!(graph.is_attribute_dirty(position, 0).unwrap());

    // Stale expectation: the value moved on, so nothing is touched.
    let swapped = graph
        .replace_attribute(
            position,
            0,
            &AttributeValue::Basic(Value::from(5)),
            AttributeValue::Basic(Value::from(7)),
        )
        .unwrap();
    assert!(!swapped);
    assert_eq!(graph.get(position, 0).unwrap(), &AttributeValue::Basic(Value::from(9)));
}
