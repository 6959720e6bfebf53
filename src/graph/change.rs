use std::collections::{HashMap, HashSet};

use crate::core::{AttributeIndex, Result, Value, ViewError};

use super::graph::{ElementKey, ViewGraph};
use super::node::{AttributeValue, NodeId};

/// What happened to one attribute since load, derived from the initial and
/// current snapshots. Computed on demand; never stored on the node.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeChange {
    Unchanged,
    /// Singular attribute whose value differs from the snapshot, or whose
    /// referenced view changed somewhere in its owned subtree.
    Updated {
        initial: AttributeValue,
        current: AttributeValue,
    },
    Collection(CollectionChange),
}

/// Element of a plural diff.
#[derive(Debug, Clone, PartialEq)]
pub enum CollectionElement {
    Basic(Value),
    View(NodeId),
}

/// Element-level diff of a plural attribute. Elements are matched by
/// persisted identity, so a re-loaded element with different field values
/// shows up under `mutated`, not as a remove plus an add.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CollectionChange {
    /// The collection instance was assigned wholesale since load.
    pub replaced: bool,
    pub added: Vec<CollectionElement>,
    pub removed: Vec<CollectionElement>,
    /// Elements present on both sides whose owned subtree is dirty.
    pub mutated: Vec<NodeId>,
}

impl CollectionChange {
    pub fn is_empty(&self) -> bool {
        !self.replaced && self.added.is_empty() && self.removed.is_empty() && self.mutated.is_empty()
    }
}

/// Per-node change report.
#[derive(Debug, Clone)]
pub struct ChangeModel {
    view_type_name: String,
    changes: Vec<AttributeChange>,
}

impl ChangeModel {
    pub fn view_type_name(&self) -> &str {
        &self.view_type_name
    }

    pub fn attribute(&self, attr: AttributeIndex) -> Option<&AttributeChange> {
        self.changes.get(attr)
    }

    pub fn is_changed(&self) -> bool {
        self.changes
            .iter()
            .any(|change| !matches!(change, AttributeChange::Unchanged))
    }

    pub fn changed_attributes(&self) -> Vec<AttributeIndex> {
        self.changes
            .iter()
            .enumerate()
            .filter(|(_, change)| !matches!(change, AttributeChange::Unchanged))
            .map(|(attr, _)| attr)
            .collect()
    }
}

pub(crate) fn compute(graph: &ViewGraph, node: NodeId) -> Result<ChangeModel> {
    let n = graph.node(node)?;
    let view_type_name = n.view_type().name.clone();
    let attr_count = n.view_type().attr_count();

    if n.is_reference() {
        return Ok(ChangeModel {
            view_type_name,
            changes: vec![AttributeChange::Unchanged; attr_count],
        });
    }
    if !n.tracks_changes() {
        return Err(ViewError::StructuralViolation(format!(
            "view type '{}' does not track initial state, change reporting is unavailable",
            view_type_name
        )));
    }

    let mut changes = Vec::with_capacity(attr_count);
    for attr in 0..attr_count {
        let current = n.value(attr).cloned().unwrap_or(AttributeValue::Basic(Value::Null));
        let initial = n
            .initial_value(attr)
            .cloned()
            .unwrap_or(AttributeValue::Basic(Value::Null));
        let owned_edge = n
            .view_type()
            .attr(attr)
            .and_then(|def| def.relation())
            .map(|relation| relation.owned)
            .unwrap_or(false);
        changes.push(diff_attribute(graph, node, attr, initial, current, owned_edge));
    }

    Ok(ChangeModel {
        view_type_name,
        changes,
    })
}

fn diff_attribute(
    graph: &ViewGraph,
    node: NodeId,
    attr: AttributeIndex,
    initial: AttributeValue,
    current: AttributeValue,
    owned_edge: bool,
) -> AttributeChange {
    match (&initial, &current) {
        (AttributeValue::Basic(init), AttributeValue::Basic(cur)) => {
            if init == cur {
                AttributeChange::Unchanged
            } else {
                AttributeChange::Updated { initial, current }
            }
        }
        (AttributeValue::View(init), AttributeValue::View(cur)) => {
            diff_singular_view(graph, *init, *cur, initial.clone(), current.clone(), owned_edge)
        }
        (AttributeValue::BasicList(init), AttributeValue::BasicList(cur)) => {
            let replaced = graph
                .node(node)
                .map(|n| n.was_collection_replaced(attr))
                .unwrap_or(false);
            diff_basic_list(init, cur, replaced)
        }
        (AttributeValue::ViewList(init), AttributeValue::ViewList(cur)) => {
            let replaced = graph
                .node(node)
                .map(|n| n.was_collection_replaced(attr))
                .unwrap_or(false);
            diff_view_list(graph, init, cur, replaced, owned_edge)
        }
        // Kind changed underneath us; only reachable through snapshot
        // restoration bugs, report it as an update.
        _ => AttributeChange::Updated { initial, current },
    }
}

fn diff_singular_view(
    graph: &ViewGraph,
    init: Option<NodeId>,
    cur: Option<NodeId>,
    initial: AttributeValue,
    current: AttributeValue,
    owned_edge: bool,
) -> AttributeChange {
    let link_changed = match (init, cur) {
        (None, None) => false,
        (Some(a), Some(b)) => graph.identity_key(a) != graph.identity_key(b),
        _ => true,
    };
    if link_changed {
        return AttributeChange::Updated { initial, current };
    }
    if owned_edge {
        if let Some(child) = cur {
            let mut visited = HashSet::new();
            if graph.subtree_dirty(child, &mut visited) {
                return AttributeChange::Updated { initial, current };
            }
        }
    }
    AttributeChange::Unchanged
}

fn diff_basic_list(init: &[Value], cur: &[Value], replaced: bool) -> AttributeChange {
    let mut counts: HashMap<&Value, i64> = HashMap::new();
    for value in cur {
        *counts.entry(value).or_default() += 1;
    }
    for value in init {
        *counts.entry(value).or_default() -= 1;
    }

    let mut change = CollectionChange {
        replaced,
        ..Default::default()
    };
    for (value, count) in counts {
        for _ in 0..count.max(0) {
            change.added.push(CollectionElement::Basic(value.clone()));
        }
        for _ in 0..(-count).max(0) {
            change.removed.push(CollectionElement::Basic(value.clone()));
        }
    }
    if change.is_empty() {
        AttributeChange::Unchanged
    } else {
        AttributeChange::Collection(change)
    }
}

fn diff_view_list(
    graph: &ViewGraph,
    init: &[NodeId],
    cur: &[NodeId],
    replaced: bool,
    owned_edge: bool,
) -> AttributeChange {
    let mut init_by_key: HashMap<ElementKey, Vec<NodeId>> = HashMap::new();
    for element in init {
        init_by_key
            .entry(graph.identity_key(*element))
            .or_default()
            .push(*element);
    }

    let mut change = CollectionChange {
        replaced,
        ..Default::default()
    };
    let mut visited = HashSet::new();
    for element in cur {
        let key = graph.identity_key(*element);
        match init_by_key.get_mut(&key) {
            Some(slots) if !slots.is_empty() => {
                slots.remove(0);
                if owned_edge && graph.subtree_dirty(*element, &mut visited) {
                    change.mutated.push(*element);
                }
            }
            _ => change.added.push(CollectionElement::View(*element)),
        }
    }
    for slots in init_by_key.values() {
        for element in slots {
            change.removed.push(CollectionElement::View(*element));
        }
    }

    if change.is_empty() {
        AttributeChange::Unchanged
    } else {
        AttributeChange::Collection(change)
    }
}
