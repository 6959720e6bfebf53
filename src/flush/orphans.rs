use std::collections::HashSet;

use tracing::{Level, event};

use crate::core::Result;
use crate::graph::{AttributeValue, ElementKey, NodeId, ViewGraph, WalkOutcome};
use crate::metamodel::RelationOwnership;

/// One node scheduled for deletion.
#[derive(Debug, Clone, PartialEq)]
pub struct Removal {
    pub node: NodeId,
    /// Depth relative to the flush root; deletes run deepest first.
    pub depth: usize,
    /// The removal this one cascaded from, if any.
    pub via: Option<NodeId>,
}

/// What the collection pass found: rows to delete, and rows that keep
/// living but lost their owner.
#[derive(Debug, Default)]
pub struct CollectOutcome {
    pub removals: Vec<Removal>,
    /// Persisted children dropped from a child-side owned relation without
    /// orphan removal. Their rows stay; the flush clears the owner
    /// reference each one still carries.
    pub detached: Vec<NodeId>,
}

/// Finds owned children that were present at load time but are gone from
/// the current state of their relation. Orphan-removal relations schedule
/// the child for deletion together with its cascade closure; plain owned
/// relations only sever the stored link.
///
/// Candidates are only finalized after the whole walk: a child that moved
/// to another owner in the same graph is re-parented, not orphaned.
pub struct OrphanCollector;

impl OrphanCollector {
    pub fn new() -> Self {
        Self
    }

    pub fn collect(&self, graph: &ViewGraph, walk: &WalkOutcome) -> Result<CollectOutcome> {
        let mut candidates: Vec<(NodeId, usize)> = Vec::new();
        let mut drop_candidates: Vec<NodeId> = Vec::new();

        for parent in &walk.owned {
            let parent = *parent;
            let n = graph.node(parent)?;
            let parent_depth = walk.depth.get(&parent).copied().unwrap_or(0);

            for attr in 0..n.view_type().attr_count() {
                let Some(relation) = n.view_type().attr(attr).and_then(|def| def.relation())
                else {
                    continue;
                };
                if !relation.owned {
                    continue;
                }
                // Parent-column links live on the parent row; dropping one
                // without orphan removal is the parent row's update alone.
                if !relation.orphan_removal && relation.ownership == RelationOwnership::ParentColumn
                {
                    continue;
                }

                let initial_children = match n.initial_value(attr) {
                    Some(AttributeValue::View(Some(child))) => vec![*child],
                    Some(AttributeValue::ViewList(children)) => children.clone(),
                    _ => Vec::new(),
                };
                if initial_children.is_empty() {
                    continue;
                }
                let current_keys: HashSet<ElementKey> = match n.value(attr) {
                    Some(value) => value
                        .referenced_nodes()
                        .into_iter()
                        .map(|child| graph.identity_key(child))
                        .collect(),
                    None => HashSet::new(),
                };

                for child in initial_children {
                    if current_keys.contains(&graph.identity_key(child)) {
                        continue;
                    }
                    if relation.orphan_removal {
                        candidates.push((child, parent_depth + 1));
                    } else {
                        drop_candidates.push(child);
                    }
                }
            }
        }

        // Finalize: rescue anything that found a new owner, skip anything
        // that never had a row.
        let mut removals = Vec::new();
        let mut visited: HashSet<NodeId> = HashSet::new();
        for (orphan, depth) in candidates {
            let n = graph.node(orphan)?;
            if n.parent().is_some() {
                event!(Level::DEBUG, node = %orphan, "orphan candidate was re-parented, rescued");
                continue;
            }
            if n.is_new() || n.id().is_none() {
                continue;
            }
            if !visited.insert(orphan) {
                continue;
            }
            event!(Level::DEBUG, node = %orphan, view_type = %n.view_type().name,
                "orphan scheduled for removal");
            removals.push(Removal {
                node: orphan,
                depth,
                via: None,
            });
            self.cascade(graph, orphan, depth, &mut visited, &mut removals)?;
        }

        // Same rescue rules for the severed links. A child both deleted
        // and dropped needs no owner write; the delete wins.
        let mut detached = Vec::new();
        let mut seen: HashSet<NodeId> = HashSet::new();
        for child in drop_candidates {
            let n = graph.node(child)?;
            if n.parent().is_some() {
                event!(Level::DEBUG, node = %child, "dropped child was re-parented, owner moves instead");
                continue;
            }
            if n.is_new() || n.id().is_none() || visited.contains(&child) {
                continue;
            }
            if !seen.insert(child) {
                continue;
            }
            event!(Level::DEBUG, node = %child, view_type = %n.view_type().name,
                "dropped child scheduled for owner clear");
            detached.push(child);
        }

        Ok(CollectOutcome { removals, detached })
    }

    /// Removal closure for an explicitly removed root.
    pub fn removal_closure(&self, graph: &ViewGraph, root: NodeId) -> Result<Vec<Removal>> {
        let mut removals = vec![Removal {
            node: root,
            depth: 0,
            via: None,
        }];
        let mut visited: HashSet<NodeId> = [root].into_iter().collect();
        self.cascade(graph, root, 0, &mut visited, &mut removals)?;
        Ok(removals)
    }

    /// Descend `cascade_delete` edges of a node being deleted. New nodes
    /// have no row and are traversed through without being scheduled.
    fn cascade(
        &self,
        graph: &ViewGraph,
        from: NodeId,
        depth: usize,
        visited: &mut HashSet<NodeId>,
        out: &mut Vec<Removal>,
    ) -> Result<()> {
        let n = graph.node(from)?;
        for attr in 0..n.view_type().attr_count() {
            let Some(relation) = n.view_type().attr(attr).and_then(|def| def.relation()) else {
                continue;
            };
            if !relation.owned || !relation.cascade_delete {
                continue;
            }
            let children = match n.value(attr) {
                Some(value) => value.referenced_nodes(),
                None => Vec::new(),
            };
            for child in children {
                if !visited.insert(child) {
                    continue;
                }
                let c = graph.node(child)?;
                if !c.is_new() && c.id().is_some() {
                    out.push(Removal {
                        node: child,
                        depth: depth + 1,
                        via: Some(from),
                    });
                }
                self.cascade(graph, child, depth + 1, visited, out)?;
            }
        }
        Ok(())
    }
}

impl Default for OrphanCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::core::Value;
    use crate::graph::GraphWalker;
    use crate::metamodel::{AttributeDef, RelationDef, ViewMetamodel, ViewType};

    fn metamodel() -> Arc<ViewMetamodel> {
        let mut mm = ViewMetamodel::new();
        mm.register(
            ViewType::new("Order").attribute(AttributeDef::collection(
                "positions",
                RelationDef::owned("Position").orphan_removal().cascade_delete(),
            )),
        )
        .unwrap();
        mm.register(ViewType::new("Position").attribute(AttributeDef::basic("name")))
            .unwrap();
        mm.validate().unwrap();
        Arc::new(mm)
    }

    /// Owned edges without orphan removal: a plural and a singular one on
    /// the child side, and a singular one on the parent side.
    fn plain_metamodel() -> Arc<ViewMetamodel> {
        let mut mm = ViewMetamodel::new();
        mm.register(
            ViewType::new("Order")
                .attribute(AttributeDef::collection("positions", RelationDef::owned("Position")))
                .attribute(AttributeDef::reference("invoice", RelationDef::owned("Invoice")))
                .attribute(AttributeDef::reference(
                    "shipping_address",
                    RelationDef::owned("Address")
                        .with_ownership(RelationOwnership::ParentColumn),
                )),
        )
        .unwrap();
        mm.register(ViewType::new("Position").attribute(AttributeDef::basic("name")))
            .unwrap();
        mm.register(ViewType::new("Invoice").attribute(AttributeDef::basic("total")))
            .unwrap();
        mm.register(ViewType::new("Address").attribute(AttributeDef::basic("street")))
            .unwrap();
        mm.validate().unwrap();
        Arc::new(mm)
    }

    fn load_plain_order(
        graph: &mut ViewGraph,
        id: i64,
        positions: Vec<NodeId>,
        invoice: Option<NodeId>,
    ) -> NodeId {
        graph
            .load(
                "Order",
                Value::Integer(id),
                None,
                vec![
                    AttributeValue::ViewList(positions),
                    AttributeValue::View(invoice),
                    AttributeValue::View(None),
                ],
            )
            .unwrap()
    }

    #[test]
    fn test_removed_child_becomes_orphan() {
        let mm = metamodel();
        let mut graph = ViewGraph::new(mm);
        let position = graph
            .load(
                "Position",
                Value::Integer(10),
                None,
                vec![AttributeValue::Basic(Value::Text("a".into()))],
            )
            .unwrap();
        let order = graph
            .load(
                "Order",
                Value::Integer(1),
                None,
                vec![AttributeValue::ViewList(vec![position])],
            )
            .unwrap();

        let positions = graph.attr_index(order, "positions").unwrap();
        graph.list_remove(order, positions, position).unwrap();

        let walk = GraphWalker::new().walk(&graph, order).unwrap();
        let outcome = OrphanCollector::new().collect(&graph, &walk).unwrap();
        assert_eq!(
            outcome.removals,
            vec![Removal {
                node: position,
                depth: 1,
                via: None
            }]
        );
        assert!(outcome.detached.is_empty());
    }

    #[test]
    fn test_reparented_child_is_rescued() {
        let mm = metamodel();
        let mut graph = ViewGraph::new(mm);
        let position = graph
            .load(
                "Position",
                Value::Integer(10),
                None,
                vec![AttributeValue::Basic(Value::Text("a".into()))],
            )
            .unwrap();
        let first = graph
            .load(
                "Order",
                Value::Integer(1),
                None,
                vec![AttributeValue::ViewList(vec![position])],
            )
            .unwrap();
        let second = graph
            .load("Order", Value::Integer(2), None, vec![AttributeValue::ViewList(vec![])])
            .unwrap();

        let positions = graph.attr_index(first, "positions").unwrap();
        graph.list_remove(first, positions, position).unwrap();
        graph.list_add(second, positions, position).unwrap();

        // Walk from the first order only; the child's new owner still
        // rescues it.
        let walk = GraphWalker::new().walk(&graph, first).unwrap();
        let outcome = OrphanCollector::new().collect(&graph, &walk).unwrap();
        assert!(outcome.removals.is_empty());
        assert!(outcome.detached.is_empty());
    }

    #[test]
    fn test_dropped_child_of_plain_owned_edge_is_detached() {
        let mm = plain_metamodel();
        let mut graph = ViewGraph::new(mm);
        let position = graph
            .load(
                "Position",
                Value::Integer(10),
                None,
                vec![AttributeValue::Basic(Value::Text("a".into()))],
            )
            .unwrap();
        let order = load_plain_order(&mut graph, 1, vec![position], None);

        let positions = graph.attr_index(order, "positions").unwrap();
        graph.list_remove(order, positions, position).unwrap();

        let walk = GraphWalker::new().walk(&graph, order).unwrap();
        let outcome = OrphanCollector::new().collect(&graph, &walk).unwrap();
        assert!(outcome.removals.is_empty());
        assert_eq!(outcome.detached, vec![position]);
    }

    #[test]
    fn test_cleared_singular_link_is_detached() {
        let mm = plain_metamodel();
        let mut graph = ViewGraph::new(mm);
        let invoice = graph
            .load(
                "Invoice",
                Value::Integer(77),
                None,
                vec![AttributeValue::Basic(Value::Integer(900))],
            )
            .unwrap();
        let order = load_plain_order(&mut graph, 1, vec![], Some(invoice));

        let slot = graph.attr_index(order, "invoice").unwrap();
        graph.set_view(order, slot, None).unwrap();

        let walk = GraphWalker::new().walk(&graph, order).unwrap();
        let outcome = OrphanCollector::new().collect(&graph, &walk).unwrap();
        assert!(outcome.removals.is_empty());
        assert_eq!(outcome.detached, vec![invoice]);
    }

    #[test]
    fn test_moved_child_is_not_detached() {
        let mm = plain_metamodel();
        let mut graph = ViewGraph::new(mm);
        let position = graph
            .load(
                "Position",
                Value::Integer(10),
                None,
                vec![AttributeValue::Basic(Value::Text("a".into()))],
            )
            .unwrap();
        let first = load_plain_order(&mut graph, 1, vec![position], None);
        let second = load_plain_order(&mut graph, 2, vec![], None);

        let positions = graph.attr_index(first, "positions").unwrap();
        graph.list_remove(first, positions, position).unwrap();
        graph.list_add(second, positions, position).unwrap();

        let walk = GraphWalker::new().walk(&graph, first).unwrap();
        let outcome = OrphanCollector::new().collect(&graph, &walk).unwrap();
        assert!(outcome.removals.is_empty());
        assert!(outcome.detached.is_empty());
    }

    #[test]
    fn test_cleared_parent_side_reference_is_not_detached() {
        let mm = plain_metamodel();
        let mut graph = ViewGraph::new(mm);
        let address = graph
            .load(
                "Address",
                Value::Integer(30),
                None,
                vec![AttributeValue::Basic(Value::Text("Pier 4".into()))],
            )
            .unwrap();
        let order = graph
            .load(
                "Order",
                Value::Integer(1),
                None,
                vec![
                    AttributeValue::ViewList(vec![]),
                    AttributeValue::View(None),
                    AttributeValue::View(Some(address)),
                ],
            )
            .unwrap();

        let slot = graph.attr_index(order, "shipping_address").unwrap();
        graph.set_view(order, slot, None).unwrap();

        // The link lives on the order row; the address row carries nothing
        // to clear and keeps existing on its own.
        let walk = GraphWalker::new().walk(&graph, order).unwrap();
        let outcome = OrphanCollector::new().collect(&graph, &walk).unwrap();
        assert!(outcome.removals.is_empty());
        assert!(outcome.detached.is_empty());
    }
}
