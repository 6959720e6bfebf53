use std::collections::{BTreeSet, HashMap, HashSet};

use tracing::{Level, event, info_span};

use crate::core::{AttributeIndex, Result, Value, ViewError};
use crate::graph::{AttributeValue, DirtyBits, GraphWalker, NodeId, ViewGraph, ViewNode, WalkOutcome};
use crate::metamodel::RelationOwnership;
use crate::provider::{AttributeSlot, EntityStore, FlatValue, NodeState, OwnerRef, OwnerWrite};
use crate::transaction::{Transaction, TransactionStatus};

use super::context::{QueuedCompletion, UndoLog};
use super::listeners::{ListenerDispatcher, ListenerPhase, ListenerRegistry, ViewTransition};
use super::orphans::OrphanCollector;
use super::planner::{FlushPlan, FlushPlanner, PlannedDelete, PlannedWrite, WriteKind};
use super::{FlushConfig, FlushOptions};

/// What one flush actually did against the provider.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Planned deletes a pre-remove listener cancelled, cascades included.
    pub vetoed: usize,
}

impl FlushReport {
    pub fn is_empty(&self) -> bool {
        self.inserted == 0 && self.updated == 0 && self.deleted == 0 && self.vetoed == 0
    }
}

/// Drives one flush end to end: walk, collect orphans, plan, then apply
/// the plan against the provider with listener callbacks woven in. On
/// failure the graph's pre-flush bookkeeping is restored before the error
/// surfaces; on success the restore work is parked on the transaction so
/// a later rollback can still unwind it.
pub struct FlushExecutor<'a> {
    registry: &'a ListenerRegistry,
    defaults: FlushConfig,
}

impl<'a> FlushExecutor<'a> {
    pub fn new(registry: &'a ListenerRegistry, defaults: FlushConfig) -> Self {
        Self { registry, defaults }
    }

    /// Flush every pending change reachable from `root`.
    pub fn flush(
        &self,
        graph: &mut ViewGraph,
        root: NodeId,
        store: &mut dyn EntityStore,
        tx: &mut Transaction,
        options: FlushOptions,
    ) -> Result<FlushReport> {
        if !tx.is_active() {
            return Err(ViewError::TransactionCompleted(tx.id().to_string()));
        }
        let span = info_span!("flush.apply", root = %root, txn = %tx.id());
        let _enter = span.enter();

        let walk = GraphWalker::new().walk(graph, root)?;
        let collected = OrphanCollector::new().collect(graph, &walk)?;
        let plan = FlushPlanner::new(self.defaults).plan(graph, &walk, &collected, options)?;
        // An empty plan still runs the apply step: marks on nodes whose
        // values went back to their baseline get cleared and parked for
        // rollback like any other flush.
        if plan.is_empty() {
            event!(Level::DEBUG, root = %root, "no provider writes needed");
        }

        let dispatcher = ListenerDispatcher::new(self.registry);
        let mut undo = UndoLog::default();
        let mut completions = Vec::new();
        let mut report = FlushReport::default();

        if let Err(err) = self.apply(
            graph,
            store,
            &dispatcher,
            &plan,
            &walk,
            &mut undo,
            &mut completions,
            &mut report,
        ) {
            event!(Level::ERROR, error = %err, "flush failed, restoring graph state");
            undo.restore(graph);
            return Err(err);
        }

        // Current state becomes the baseline. Nodes a listener re-marked
        // during the flush keep theirs so the next flush still sees them.
        for &node in &walk.owned {
            let n = graph.node(node)?;
            if n.is_reference() || n.is_dirty() {
                continue;
            }
            graph.rebaseline(node)?;
        }

        self.park_on_transaction(tx, completions, undo)?;
        event!(
            Level::DEBUG,
            inserted = report.inserted,
            updated = report.updated,
            deleted = report.deleted,
            vetoed = report.vetoed,
            "flush applied"
        );
        Ok(report)
    }

    /// Delete a persisted, unowned view together with its cascade closure.
    pub fn remove(
        &self,
        graph: &mut ViewGraph,
        root: NodeId,
        store: &mut dyn EntityStore,
        tx: &mut Transaction,
    ) -> Result<FlushReport> {
        if !tx.is_active() {
            return Err(ViewError::TransactionCompleted(tx.id().to_string()));
        }
        let span = info_span!("flush.remove", root = %root, txn = %tx.id());
        let _enter = span.enter();

        {
            let n = graph.node(root)?;
            if n.is_new() || n.id().is_none() {
                return Err(ViewError::StructuralViolation(format!(
                    "{} of type '{}' was never persisted and cannot be removed",
                    root,
                    n.view_type().name
                )));
            }
            if n.parent().is_some() {
                return Err(ViewError::StructuralViolation(format!(
                    "{} of type '{}' is owned by a parent view; detach it there instead",
                    root,
                    n.view_type().name
                )));
            }
        }

        let removals = OrphanCollector::new().removal_closure(graph, root)?;
        let plan = FlushPlanner::new(self.defaults).plan_removal(graph, &removals)?;

        let dispatcher = ListenerDispatcher::new(self.registry);
        let mut completions = Vec::new();
        let mut report = FlushReport::default();
        self.apply_deletes(graph, store, &dispatcher, &plan.deletes, &mut completions, &mut report)?;

        self.park_on_transaction(tx, completions, UndoLog::default())?;
        event!(Level::DEBUG, deleted = report.deleted, vetoed = report.vetoed, "removal applied");
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    fn apply(
        &self,
        graph: &mut ViewGraph,
        store: &mut dyn EntityStore,
        dispatcher: &ListenerDispatcher<'_>,
        plan: &FlushPlan,
        walk: &WalkOutcome,
        undo: &mut UndoLog,
        completions: &mut Vec<QueuedCompletion>,
        report: &mut FlushReport,
    ) -> Result<()> {
        // Leftover marks on nodes that need no write (a value was set back
        // to its baseline, say) are cleared too, so a successful flush
        // leaves the whole subtree clean.
        let planned: HashSet<NodeId> = plan.writes.iter().map(|write| write.node).collect();
        for &node in &walk.owned {
            if planned.contains(&node) {
                continue;
            }
            let n = graph.node(node)?;
            if n.is_reference() || !n.is_dirty() {
                continue;
            }
            let (bits, replaced) = graph.take_dirty(node)?;
            let owner_changed = graph.take_owner_changed(node)?;
            undo.record(graph, node, bits, replaced, owner_changed)?;
        }

        for write in &plan.writes {
            match &write.kind {
                WriteKind::Insert => {
                    self.apply_insert(graph, store, dispatcher, write, undo, completions, report)?
                }
                WriteKind::Update { attributes } => self.apply_update(
                    graph,
                    store,
                    dispatcher,
                    write,
                    attributes.as_deref(),
                    undo,
                    completions,
                    report,
                )?,
                WriteKind::Detach => {
                    self.apply_detach(graph, store, dispatcher, write, undo, completions, report)?
                }
            }
        }

        self.apply_deletes(graph, store, dispatcher, &plan.deletes, completions, report)
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_insert(
        &self,
        graph: &mut ViewGraph,
        store: &mut dyn EntityStore,
        dispatcher: &ListenerDispatcher<'_>,
        write: &PlannedWrite,
        undo: &mut UndoLog,
        completions: &mut Vec<QueuedCompletion>,
        report: &mut FlushReport,
    ) -> Result<()> {
        let node = write.node;
        dispatcher.invoke(ListenerPhase::PrePersist, graph, node)?;

        let (bits, replaced) = graph.take_dirty(node)?;
        let owner_changed = graph.take_owner_changed(node)?;
        undo.record(graph, node, bits, replaced, owner_changed)?;

        // Versioned rows start counting at zero unless one was staged.
        let version = {
            let n = graph.node(node)?;
            if n.view_type().is_versioned() {
                Some(n.version().cloned().unwrap_or(Value::Integer(0)))
            } else {
                None
            }
        };
        if let Some(version) = &version {
            graph.assign_version(node, Some(version.clone()))?;
        }

        let owner = self.owner_write(graph, node)?;
        let state = self.node_state(graph, node, version, None, owner)?;
        let id = store.insert(&state).map_err(ViewError::from)?;
        graph.assign_identity(node, id)?;
        graph.set_persisted(node)?;
        event!(Level::DEBUG, node = %node, view_type = %state.view_type, "inserted");

        dispatcher.invoke(ListenerPhase::PostPersist, graph, node)?;
        self.queue_completions(graph, node, ViewTransition::Persist, completions)?;
        report.inserted += 1;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_update(
        &self,
        graph: &mut ViewGraph,
        store: &mut dyn EntityStore,
        dispatcher: &ListenerDispatcher<'_>,
        write: &PlannedWrite,
        planned_attrs: Option<&[AttributeIndex]>,
        undo: &mut UndoLog,
        completions: &mut Vec<QueuedCompletion>,
        report: &mut FlushReport,
    ) -> Result<()> {
        let node = write.node;
        dispatcher.invoke(ListenerPhase::PreUpdate, graph, node)?;

        // Listeners may widen the change set; re-read it before the bits
        // are taken.
        let widened: Option<BTreeSet<AttributeIndex>> = match planned_attrs {
            None => None,
            Some(base) => {
                let mut set: BTreeSet<AttributeIndex> = base.iter().copied().collect();
                set.extend(graph.row_dirty_attrs(node)?);
                Some(set)
            }
        };

        let (bits, replaced) = graph.take_dirty(node)?;
        let owner_changed = graph.take_owner_changed(node)?;
        undo.record(graph, node, bits, replaced, owner_changed)?;

        let (guard, next_version, slot_version, version_index) =
            version_state(graph.node(node)?, write.guarded);

        // A bumped version has to reach the row even on a partial write.
        let attributes: Option<Vec<AttributeIndex>> = widened.map(|mut set| {
            if next_version.is_some() {
                if let Some(index) = version_index {
                    set.insert(index);
                }
            }
            set.into_iter().collect()
        });

        let owner = self.owner_write(graph, node)?;
        let state = self.node_state(graph, node, slot_version, guard, owner)?;
        store.update(&state, attributes.as_deref()).map_err(ViewError::from)?;
        if let Some(next) = next_version {
            graph.assign_version(node, Some(next))?;
        }
        event!(Level::DEBUG, node = %node, view_type = %state.view_type,
            partial = attributes.is_some(), "updated");

        dispatcher.invoke(ListenerPhase::PostUpdate, graph, node)?;
        self.queue_completions(graph, node, ViewTransition::Update, completions)?;
        report.updated += 1;
        Ok(())
    }

    /// Owner-clearing update for a child dropped from an owned relation
    /// that keeps its row. No columns are touched beyond the version.
    #[allow(clippy::too_many_arguments)]
    fn apply_detach(
        &self,
        graph: &mut ViewGraph,
        store: &mut dyn EntityStore,
        dispatcher: &ListenerDispatcher<'_>,
        write: &PlannedWrite,
        undo: &mut UndoLog,
        completions: &mut Vec<QueuedCompletion>,
        report: &mut FlushReport,
    ) -> Result<()> {
        let node = write.node;
        dispatcher.invoke(ListenerPhase::PreUpdate, graph, node)?;

        // Attribute marks stay for the flush that visits this node itself;
        // only the owner mark is consumed.
        let attr_count = graph.node(node)?.view_type().attr_count();
        let owner_changed = graph.take_owner_changed(node)?;
        undo.record(
            graph,
            node,
            DirtyBits::new(attr_count),
            DirtyBits::new(attr_count),
            owner_changed,
        )?;

        let (guard, next_version, slot_version, version_index) =
            version_state(graph.node(node)?, write.guarded);
        let mut attributes: Vec<AttributeIndex> = Vec::new();
        if next_version.is_some() {
            if let Some(index) = version_index {
                attributes.push(index);
            }
        }

        let state = self.node_state(graph, node, slot_version, guard, OwnerWrite::Clear)?;
        store.update(&state, Some(&attributes)).map_err(ViewError::from)?;
        if let Some(next) = next_version {
            graph.assign_version(node, Some(next))?;
        }
        event!(Level::DEBUG, node = %node, view_type = %state.view_type, "owner cleared");

        dispatcher.invoke(ListenerPhase::PostUpdate, graph, node)?;
        self.queue_completions(graph, node, ViewTransition::Update, completions)?;
        report.updated += 1;
        Ok(())
    }

    fn apply_deletes(
        &self,
        graph: &mut ViewGraph,
        store: &mut dyn EntityStore,
        dispatcher: &ListenerDispatcher<'_>,
        deletes: &[PlannedDelete],
        completions: &mut Vec<QueuedCompletion>,
        report: &mut FlushReport,
    ) -> Result<()> {
        if deletes.is_empty() {
            return Ok(());
        }
        let via: HashMap<NodeId, Option<NodeId>> =
            deletes.iter().map(|delete| (delete.node, delete.via)).collect();
        let mut vetoed: HashSet<NodeId> = HashSet::new();

        // Veto phase runs shallowest first: a spared entry keeps its whole
        // cascade out before any of those listeners fire.
        let mut by_depth: Vec<&PlannedDelete> = deletes.iter().collect();
        by_depth.sort_by_key(|delete| delete.depth);
        for delete in by_depth {
            if chain_vetoed(delete.node, &via, &vetoed) {
                continue;
            }
            if !dispatcher.invoke_pre_remove(graph, delete.node)? {
                vetoed.insert(delete.node);
            }
        }

        // Provider calls keep the planner's deepest-first order.
        for delete in deletes {
            if chain_vetoed(delete.node, &via, &vetoed) {
                report.vetoed += 1;
                continue;
            }
            let (view_type, id, guard) = {
                let n = graph.node(delete.node)?;
                let id = n.id().cloned().ok_or_else(|| {
                    ViewError::StructuralViolation(format!(
                        "{} of type '{}' has no identity to delete",
                        delete.node,
                        n.view_type().name
                    ))
                })?;
                let guard = if delete.guarded { n.version().cloned() } else { None };
                (n.view_type().name.clone(), id, guard)
            };
            store
                .remove(&view_type, &id, guard.as_ref())
                .map_err(ViewError::from)?;
            event!(Level::DEBUG, node = %delete.node, view_type = %view_type, "removed");

            dispatcher.invoke(ListenerPhase::PostRemove, graph, delete.node)?;
            self.queue_completions(graph, delete.node, ViewTransition::Remove, completions)?;
            report.deleted += 1;
        }
        Ok(())
    }

    /// Flatten one node into the provider's write shape. `slot_version`
    /// replaces the version attribute's slot value when set.
    fn node_state(
        &self,
        graph: &ViewGraph,
        node: NodeId,
        slot_version: Option<Value>,
        version_guard: Option<Value>,
        owner: OwnerWrite,
    ) -> Result<NodeState> {
        let n = graph.node(node)?;
        let view_type = n.view_type();

        let mut attributes = Vec::with_capacity(view_type.attr_count());
        for index in 0..view_type.attr_count() {
            let def = view_type
                .attr(index)
                .ok_or_else(|| ViewError::AttributeOutOfRange {
                    view_type: view_type.name.clone(),
                    index,
                })?;
            let value = match n.value(index) {
                Some(AttributeValue::Basic(value)) => {
                    if view_type.version_attribute() == Some(index) {
                        match &slot_version {
                            Some(version) => FlatValue::Basic(version.clone()),
                            None => FlatValue::Basic(value.clone()),
                        }
                    } else {
                        FlatValue::Basic(value.clone())
                    }
                }
                Some(AttributeValue::BasicList(values)) => FlatValue::BasicList(values.clone()),
                Some(AttributeValue::View(child)) => FlatValue::Ref(match child {
                    Some(child) => child_id(graph, *child)?,
                    None => None,
                }),
                Some(AttributeValue::ViewList(children)) => {
                    let mut ids = Vec::with_capacity(children.len());
                    for child in children {
                        ids.push(child_id(graph, *child)?);
                    }
                    FlatValue::RefList(ids)
                }
                None => {
                    return Err(ViewError::AttributeOutOfRange {
                        view_type: view_type.name.clone(),
                        index,
                    });
                }
            };
            attributes.push(AttributeSlot {
                name: def.name.clone(),
                value,
            });
        }

        Ok(NodeState {
            view_type: view_type.name.clone(),
            id: n.id().cloned(),
            version_guard,
            version_attribute: view_type
                .version_attribute()
                .and_then(|index| view_type.attr(index))
                .map(|def| def.name.clone()),
            attributes,
            owner,
        })
    }

    /// When the physical link lives on the child side, the child write
    /// carries its owner so the provider can maintain the foreign key or
    /// join row. Parent-column links change nothing here; the parent row
    /// carries them.
    fn owner_write(&self, graph: &ViewGraph, node: NodeId) -> Result<OwnerWrite> {
        let n = graph.node(node)?;
        let Some((parent, attr)) = n.parent() else {
            return Ok(OwnerWrite::Unchanged);
        };
        let p = graph.node(parent)?;
        let Some(def) = p.view_type().attr(attr) else {
            return Ok(OwnerWrite::Unchanged);
        };
        let Some(relation) = def.owned_relation() else {
            return Ok(OwnerWrite::Unchanged);
        };
        if relation.ownership == RelationOwnership::ParentColumn {
            return Ok(OwnerWrite::Unchanged);
        }
        // An unpersisted owner outside this flush leaves the link dangling
        // until its own flush writes it.
        let Some(id) = p.id().cloned() else {
            return Ok(OwnerWrite::Unchanged);
        };
        Ok(OwnerWrite::Assign(OwnerRef {
            view_type: p.view_type().name.clone(),
            id,
            attribute: def.name.clone(),
            ownership: relation.ownership,
        }))
    }

    fn queue_completions(
        &self,
        graph: &ViewGraph,
        node: NodeId,
        transition: ViewTransition,
        out: &mut Vec<QueuedCompletion>,
    ) -> Result<()> {
        let view_type = graph.node(node)?.view_type().name.clone();
        let on_commit = self
            .registry
            .completions(ListenerPhase::PostCommit, &view_type, transition);
        let on_rollback = self
            .registry
            .completions(ListenerPhase::PostRollback, &view_type, transition);
        if on_commit.is_empty() && on_rollback.is_empty() {
            return Ok(());
        }
        out.push(QueuedCompletion {
            node,
            transition,
            on_commit,
            on_rollback,
        });
        Ok(())
    }

    /// Queue the completion dispatch and the rollback restorer on the
    /// transaction. The restorer registers second: completion runs the
    /// callbacks in reverse on rollback, so listeners observe the graph
    /// only after it was restored.
    fn park_on_transaction(
        &self,
        tx: &mut Transaction,
        completions: Vec<QueuedCompletion>,
        undo: UndoLog,
    ) -> Result<()> {
        if !completions.is_empty() {
            tx.on_after_completion(move |graph, status| {
                let phase = match status {
                    TransactionStatus::Committed => ListenerPhase::PostCommit,
                    TransactionStatus::RolledBack => ListenerPhase::PostRollback,
                    TransactionStatus::Active => return Ok(()),
                };
                for queued in &completions {
                    let listeners = match status {
                        TransactionStatus::Committed => &queued.on_commit,
                        _ => &queued.on_rollback,
                    };
                    for listener in listeners {
                        listener(graph, queued.node, queued.transition).map_err(|err| {
                            ViewError::ListenerFailure {
                                phase: phase.to_string(),
                                source: Box::new(err),
                            }
                        })?;
                    }
                }
                Ok(())
            })?;
        }
        if !undo.is_empty() {
            tx.on_after_completion(move |graph, status| {
                if status == TransactionStatus::RolledBack {
                    undo.restore(graph);
                }
                Ok(())
            })?;
        }
        Ok(())
    }
}

fn advance_version(version: Option<&Value>) -> Option<Value> {
    match version {
        Some(Value::Integer(n)) => Some(Value::Integer(n + 1)),
        // Non-integer versions are the adapter's to advance.
        _ => None,
    }
}

/// Optimistic-locking fields for one row write: the guard to send, the
/// bumped version, the value the version slot should carry and the slot's
/// index.
fn version_state(
    n: &ViewNode,
    guarded: bool,
) -> (Option<Value>, Option<Value>, Option<Value>, Option<AttributeIndex>) {
    let guard = if guarded { n.version().cloned() } else { None };
    let next = if n.view_type().is_versioned() {
        advance_version(n.version())
    } else {
        None
    };
    let slot = if n.view_type().is_versioned() {
        next.clone().or_else(|| n.version().cloned())
    } else {
        None
    };
    (guard, next, slot, n.view_type().version_attribute())
}

fn child_id(graph: &ViewGraph, child: NodeId) -> Result<Option<Value>> {
    Ok(graph.node(child)?.id().cloned())
}

/// A delete is skipped when itself or anything on its cascade chain was
/// vetoed.
fn chain_vetoed(
    node: NodeId,
    via: &HashMap<NodeId, Option<NodeId>>,
    vetoed: &HashSet<NodeId>,
) -> bool {
    let mut current = Some(node);
    while let Some(link) = current {
        if vetoed.contains(&link) {
            return true;
        }
        current = via.get(&link).copied().flatten();
    }
    false
}
