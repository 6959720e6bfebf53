use std::collections::{HashMap, HashSet};

use crate::core::Result;

use super::graph::ViewGraph;
use super::node::NodeId;

/// Result of one traversal: the owned nodes in visit order (root first),
/// the depth each was first seen at, and the targets of read-only edges.
#[derive(Debug, Default)]
pub struct WalkOutcome {
    pub owned: Vec<NodeId>,
    pub depth: HashMap<NodeId, usize>,
    pub read_only: HashSet<NodeId>,
}

impl WalkOutcome {
    pub fn contains(&self, node: NodeId) -> bool {
        self.depth.contains_key(&node)
    }
}

/// Pre-order traversal over owned edges with an identity visited set.
///
/// Every reachable owned node is visited exactly once; an edge back onto an
/// already-seen node (a cycle, or a second path to a shared child) stops
/// descent there without error. Read-only edges record their target and are
/// never descended.
pub struct GraphWalker;

impl GraphWalker {
    pub fn new() -> Self {
        Self
    }

    pub fn walk(&self, graph: &ViewGraph, root: NodeId) -> Result<WalkOutcome> {
        graph.node(root)?;

        let mut outcome = WalkOutcome::default();
        let mut visited: HashSet<NodeId> = HashSet::new();
        let mut stack: Vec<(NodeId, usize)> = vec![(root, 0)];

        while let Some((node, depth)) = stack.pop() {
            if !visited.insert(node) {
                continue;
            }
            outcome.owned.push(node);
            outcome.depth.insert(node, depth);

            let n = graph.node(node)?;
            // Reverse attribute order so popping restores declaration order.
            for attr in (0..n.view_type().attr_count()).rev() {
                let Some(def) = n.view_type().attr(attr) else {
                    continue;
                };
                let Some(relation) = def.relation() else {
                    continue;
                };
                let children = match n.value(attr) {
                    Some(value) => value.referenced_nodes(),
                    None => Vec::new(),
                };
                if relation.owned {
                    for child in children.into_iter().rev() {
                        if !visited.contains(&child) {
                            stack.push((child, depth + 1));
                        }
                    }
                } else {
                    for child in children {
                        outcome.read_only.insert(child);
                    }
                }
            }
        }

        Ok(outcome)
    }
}

impl Default for GraphWalker {
    fn default() -> Self {
        Self::new()
    }
}
