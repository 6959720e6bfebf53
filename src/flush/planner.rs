use std::collections::{BinaryHeap, HashMap, HashSet};

use tracing::{Level, event};

use crate::core::{AttributeIndex, Result, ViewError};
use crate::graph::{NodeId, ViewGraph, WalkOutcome};
use crate::metamodel::RelationOwnership;

use super::orphans::{CollectOutcome, Removal};
use super::{FlushConfig, FlushMode, FlushOptions};

/// Write operation decided for one node.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteKind {
    Insert,
    /// `attributes: None` rewrites the full row.
    Update { attributes: Option<Vec<AttributeIndex>> },
    /// Clear the owning back-reference of a row dropped from its relation
    /// but kept alive. Touches no other columns.
    Detach,
}

#[derive(Debug, Clone)]
pub struct PlannedWrite {
    pub node: NodeId,
    pub kind: WriteKind,
    /// Carry the optimistic version guard on this write.
    pub guarded: bool,
}

#[derive(Debug, Clone)]
pub struct PlannedDelete {
    pub node: NodeId,
    pub depth: usize,
    /// Delete entry this one cascaded from; vetoing that entry also drops
    /// this one.
    pub via: Option<NodeId>,
    pub guarded: bool,
}

/// Ordered write plan for one flush: row writes first, in foreign-key
/// dependency order, then deletes, deepest first.
#[derive(Debug, Default)]
pub struct FlushPlan {
    pub writes: Vec<PlannedWrite>,
    pub deletes: Vec<PlannedDelete>,
}

impl FlushPlan {
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.deletes.is_empty()
    }
}

/// Decides, per visited node, whether to insert, update, delete or skip,
/// then orders the operations so every foreign-key dependency is written
/// before its dependent.
pub struct FlushPlanner {
    defaults: FlushConfig,
}

impl FlushPlanner {
    pub fn new(defaults: FlushConfig) -> Self {
        Self { defaults }
    }

    pub fn plan(
        &self,
        graph: &ViewGraph,
        walk: &WalkOutcome,
        collected: &CollectOutcome,
        options: FlushOptions,
    ) -> Result<FlushPlan> {
        let removal_nodes: HashSet<NodeId> =
            collected.removals.iter().map(|r| r.node).collect();
        let mut writes: HashMap<NodeId, PlannedWrite> = HashMap::new();

        for node in &walk.owned {
            let node = *node;
            if removal_nodes.contains(&node) {
                continue;
            }
            let n = graph.node(node)?;
            let view_type = n.view_type().clone();

            if n.is_reference() {
                // Marking references is a no-op, so a set bit here means the
                // graph was corrupted. Never clear it silently.
                if n.is_dirty() {
                    return Err(ViewError::StructuralViolation(format!(
                        "reference {} of type '{}' carries dirty state",
                        node, view_type.name
                    )));
                }
                continue;
            }

            let config = view_type.flush.unwrap_or(self.defaults);

            if n.is_new() {
                event!(Level::DEBUG, node = %node, view_type = %view_type.name, "planned insert");
                writes.insert(
                    node,
                    PlannedWrite {
                        node,
                        kind: WriteKind::Insert,
                        guarded: false,
                    },
                );
                continue;
            }

            let row_dirty = graph.row_dirty_attrs(node)?;
            if row_dirty.is_empty() && !n.owner_changed() {
                continue;
            }

            let full = options.force_full
                || config.mode == FlushMode::Full
                || !view_type.tracks_initial_state;
            let attributes = if full { None } else { Some(row_dirty) };
            let guarded = config.optimistic_locking
                && view_type.is_versioned()
                && n.version().is_some();
            event!(Level::DEBUG, node = %node, view_type = %view_type.name,
                full = full, guarded = guarded, "planned update");
            writes.insert(
                node,
                PlannedWrite {
                    node,
                    kind: WriteKind::Update { attributes },
                    guarded,
                },
            );
        }

        // Dropped-but-kept children sit outside the walk, so they never
        // collide with the write decisions above. No constraint edge can
        // reach them either; ordering places them after the walked writes.
        for node in &collected.detached {
            let node = *node;
            let n = graph.node(node)?;
            let view_type = n.view_type();
            let config = view_type.flush.unwrap_or(self.defaults);
            let guarded = config.optimistic_locking
                && view_type.is_versioned()
                && n.version().is_some();
            event!(Level::DEBUG, node = %node, view_type = %view_type.name,
                guarded = guarded, "planned detach");
            writes.insert(
                node,
                PlannedWrite {
                    node,
                    kind: WriteKind::Detach,
                    guarded,
                },
            );
        }

        let ordered = self.order_writes(graph, walk, writes)?;
        let deletes = self.order_deletes(graph, &collected.removals)?;

        Ok(FlushPlan {
            writes: ordered,
            deletes,
        })
    }

    /// Deletes-only plan for an explicit removal. No write decisions run.
    pub fn plan_removal(&self, graph: &ViewGraph, removals: &[Removal]) -> Result<FlushPlan> {
        Ok(FlushPlan {
            writes: Vec::new(),
            deletes: self.order_deletes(graph, removals)?,
        })
    }

    /// Kahn's algorithm over the planned writes. Constraint edges come
    /// from the relation's physical side: a parent-column link needs the
    /// child row first, a child-column or join-table link needs the parent
    /// row first. Ties resolve to traversal order, so the result is
    /// deterministic.
    fn order_writes(
        &self,
        graph: &ViewGraph,
        walk: &WalkOutcome,
        mut writes: HashMap<NodeId, PlannedWrite>,
    ) -> Result<Vec<PlannedWrite>> {
        let position: HashMap<NodeId, usize> = walk
            .owned
            .iter()
            .enumerate()
            .map(|(i, node)| (*node, i))
            .collect();

        let mut successors: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        let mut in_degree: HashMap<NodeId, usize> =
            writes.keys().map(|node| (*node, 0)).collect();

        for parent in &walk.owned {
            let parent = *parent;
            let n = graph.node(parent)?;
            for attr in 0..n.view_type().attr_count() {
                let Some(relation) = n
                    .view_type()
                    .attr(attr)
                    .and_then(|def| def.relation())
                    .filter(|relation| relation.owned)
                    .cloned()
                else {
                    continue;
                };
                let children = match n.value(attr) {
                    Some(value) => value.referenced_nodes(),
                    None => Vec::new(),
                };
                for child in children {
                    let (before, after) = match relation.ownership {
                        RelationOwnership::ParentColumn => (child, parent),
                        RelationOwnership::ChildColumn | RelationOwnership::JoinTable => {
                            (parent, child)
                        }
                    };
                    if writes.contains_key(&before) && writes.contains_key(&after) {
                        successors.entry(before).or_default().push(after);
                        *in_degree.entry(after).or_default() += 1;
                    }
                }
            }
        }

        // Min-heap on traversal position keeps unconstrained ops stable.
        let mut ready: BinaryHeap<std::cmp::Reverse<(usize, NodeId)>> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(node, _)| std::cmp::Reverse((position.get(node).copied().unwrap_or(usize::MAX), *node)))
            .collect();

        let mut ordered = Vec::with_capacity(writes.len());
        while let Some(std::cmp::Reverse((_, node))) = ready.pop() {
            if let Some(write) = writes.remove(&node) {
                ordered.push(write);
            }
            if let Some(next) = successors.remove(&node) {
                for successor in next {
                    let degree = in_degree
                        .get_mut(&successor)
                        .ok_or_else(|| ViewError::NodeDetached(successor.to_string()))?;
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(std::cmp::Reverse((
                            position.get(&successor).copied().unwrap_or(usize::MAX),
                            successor,
                        )));
                    }
                }
            }
        }

        if !writes.is_empty() {
            let mut stuck: Vec<String> = writes.keys().map(|node| node.to_string()).collect();
            stuck.sort();
            return Err(ViewError::StructuralViolation(format!(
                "no valid write order for {}",
                stuck.join(", ")
            )));
        }
        Ok(ordered)
    }

    /// Deletes run after every insert and update, deepest first so child
    /// rows go before the rows they reference.
    fn order_deletes(&self, graph: &ViewGraph, removals: &[Removal]) -> Result<Vec<PlannedDelete>> {
        let mut seen = HashSet::new();
        let mut deletes = Vec::new();
        for removal in removals {
            if !seen.insert(removal.node) {
                continue;
            }
            let n = graph.node(removal.node)?;
            let view_type = n.view_type();
            let config = view_type.flush.unwrap_or(self.defaults);
            let guarded = config.optimistic_locking
                && view_type.is_versioned()
                && n.version().is_some();
            event!(Level::DEBUG, node = %removal.node, view_type = %view_type.name,
                depth = removal.depth, "planned delete");
            deletes.push(PlannedDelete {
                node: removal.node,
                depth: removal.depth,
                via: removal.via,
                guarded,
            });
        }
        deletes.sort_by(|a, b| b.depth.cmp(&a.depth));
        Ok(deletes)
    }
}
