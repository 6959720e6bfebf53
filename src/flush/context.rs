use tracing::{Level, event};

use crate::core::{Result, Value};
use crate::graph::{AttributeValue, DirtyBits, NodeId, ViewGraph};

use super::listeners::{CompletionListener, ViewTransition};

/// Pre-flush state of one node, captured right before its write. Restoring
/// the log puts dirty bits, identity, version, newness and the baseline
/// snapshot back so a retried flush reproduces the identical plan.
#[derive(Debug)]
pub(crate) struct UndoEntry {
    node: NodeId,
    bits: DirtyBits,
    replaced: DirtyBits,
    owner_changed: bool,
    prior_id: Option<Value>,
    prior_version: Option<Value>,
    prior_is_new: bool,
    prior_initial: Option<Vec<AttributeValue>>,
}

#[derive(Debug, Default)]
pub(crate) struct UndoLog {
    entries: Vec<UndoEntry>,
}

impl UndoLog {
    /// Capture `node`'s pre-write state. `bits`, `replaced` and
    /// `owner_changed` are the dirty markers just taken from it.
    pub fn record(
        &mut self,
        graph: &ViewGraph,
        node: NodeId,
        bits: DirtyBits,
        replaced: DirtyBits,
        owner_changed: bool,
    ) -> Result<()> {
        let n = graph.node(node)?;
        self.entries.push(UndoEntry {
            node,
            bits,
            replaced,
            owner_changed,
            prior_id: n.identity.id.clone(),
            prior_version: n.identity.version.clone(),
            prior_is_new: n.is_new,
            prior_initial: n.initial.clone(),
        });
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Unwind in reverse record order. Taken bits are merged back in, so
    /// marks that landed while the flush ran are kept.
    pub fn restore(self, graph: &mut ViewGraph) {
        event!(Level::DEBUG, entries = self.entries.len(), "restoring pre-flush state");
        for entry in self.entries.into_iter().rev() {
            graph.restore_dirty(entry.node, &entry.bits, &entry.replaced);
            graph.restore_owner_changed(entry.node, entry.owner_changed);
            graph.restore_identity(entry.node, entry.prior_id, entry.prior_version);
            graph.set_is_new(entry.node, entry.prior_is_new);
            graph.restore_initial(entry.node, entry.prior_initial);
        }
    }
}

/// Completion listeners queued for one written node, dispatched once the
/// surrounding transaction actually completes.
pub(crate) struct QueuedCompletion {
    pub node: NodeId,
    pub transition: ViewTransition,
    pub on_commit: Vec<CompletionListener>,
    pub on_rollback: Vec<CompletionListener>,
}
