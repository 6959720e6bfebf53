use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use tracing::{Level, event};

use crate::core::{Result, ViewError};
use crate::graph::{NodeId, ViewGraph};

/// Lifecycle points a listener can attach to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerPhase {
    PrePersist,
    PostPersist,
    PreUpdate,
    PostUpdate,
    PreRemove,
    PostRemove,
    PostCommit,
    PostRollback,
}

impl fmt::Display for ListenerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PrePersist => write!(f, "pre-persist"),
            Self::PostPersist => write!(f, "post-persist"),
            Self::PreUpdate => write!(f, "pre-update"),
            Self::PostUpdate => write!(f, "post-update"),
            Self::PreRemove => write!(f, "pre-remove"),
            Self::PostRemove => write!(f, "post-remove"),
            Self::PostCommit => write!(f, "post-commit"),
            Self::PostRollback => write!(f, "post-rollback"),
        }
    }
}

/// Which operation a completion listener observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewTransition {
    Persist,
    Update,
    Remove,
}

impl fmt::Display for ViewTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Persist => write!(f, "persist"),
            Self::Update => write!(f, "update"),
            Self::Remove => write!(f, "remove"),
        }
    }
}

/// Plain lifecycle listener. Gets mutable graph access; changes it makes
/// to the node before the write are included in the written state.
pub type ViewListener = Arc<dyn Fn(&mut ViewGraph, NodeId) -> Result<()> + Send + Sync>;

/// Pre-remove listener; returning `Ok(false)` vetoes the removal of the
/// node (and of the deletes cascaded from it) without failing the flush.
pub type RemoveListener = Arc<dyn Fn(&mut ViewGraph, NodeId) -> Result<bool> + Send + Sync>;

/// Post-commit / post-rollback listener; receives the operation the node
/// underwent.
pub type CompletionListener =
    Arc<dyn Fn(&mut ViewGraph, NodeId, ViewTransition) -> Result<()> + Send + Sync>;

type TransitionEntry = (HashSet<ViewTransition>, CompletionListener);

/// Listener registrations, keyed by view-type name. Populated once at
/// configuration time; invocation order is registration order.
#[derive(Default)]
pub struct ListenerRegistry {
    pre_persist: HashMap<String, Vec<ViewListener>>,
    post_persist: HashMap<String, Vec<ViewListener>>,
    pre_update: HashMap<String, Vec<ViewListener>>,
    post_update: HashMap<String, Vec<ViewListener>>,
    pre_remove: HashMap<String, Vec<RemoveListener>>,
    post_remove: HashMap<String, Vec<ViewListener>>,
    post_commit: HashMap<String, Vec<TransitionEntry>>,
    post_rollback: HashMap<String, Vec<TransitionEntry>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_pre_persist(
        &mut self,
        view_type: &str,
        listener: impl Fn(&mut ViewGraph, NodeId) -> Result<()> + Send + Sync + 'static,
    ) {
        self.pre_persist
            .entry(view_type.to_string())
            .or_default()
            .push(Arc::new(listener));
    }

    pub fn on_post_persist(
        &mut self,
        view_type: &str,
        listener: impl Fn(&mut ViewGraph, NodeId) -> Result<()> + Send + Sync + 'static,
    ) {
        self.post_persist
            .entry(view_type.to_string())
            .or_default()
            .push(Arc::new(listener));
    }

    pub fn on_pre_update(
        &mut self,
        view_type: &str,
        listener: impl Fn(&mut ViewGraph, NodeId) -> Result<()> + Send + Sync + 'static,
    ) {
        self.pre_update
            .entry(view_type.to_string())
            .or_default()
            .push(Arc::new(listener));
    }

    pub fn on_post_update(
        &mut self,
        view_type: &str,
        listener: impl Fn(&mut ViewGraph, NodeId) -> Result<()> + Send + Sync + 'static,
    ) {
        self.post_update
            .entry(view_type.to_string())
            .or_default()
            .push(Arc::new(listener));
    }

    pub fn on_pre_remove(
        &mut self,
        view_type: &str,
        listener: impl Fn(&mut ViewGraph, NodeId) -> Result<bool> + Send + Sync + 'static,
    ) {
        self.pre_remove
            .entry(view_type.to_string())
            .or_default()
            .push(Arc::new(listener));
    }

    pub fn on_post_remove(
        &mut self,
        view_type: &str,
        listener: impl Fn(&mut ViewGraph, NodeId) -> Result<()> + Send + Sync + 'static,
    ) {
        self.post_remove
            .entry(view_type.to_string())
            .or_default()
            .push(Arc::new(listener));
    }

    pub fn on_post_commit(
        &mut self,
        view_type: &str,
        transitions: &[ViewTransition],
        listener: impl Fn(&mut ViewGraph, NodeId, ViewTransition) -> Result<()> + Send + Sync + 'static,
    ) {
        self.post_commit
            .entry(view_type.to_string())
            .or_default()
            .push((transitions.iter().copied().collect(), Arc::new(listener)));
    }

    pub fn on_post_rollback(
        &mut self,
        view_type: &str,
        transitions: &[ViewTransition],
        listener: impl Fn(&mut ViewGraph, NodeId, ViewTransition) -> Result<()> + Send + Sync + 'static,
    ) {
        self.post_rollback
            .entry(view_type.to_string())
            .or_default()
            .push((transitions.iter().copied().collect(), Arc::new(listener)));
    }

    pub fn has_remove_listeners(&self, view_type: &str) -> bool {
        self.pre_remove.contains_key(view_type) || self.post_remove.contains_key(view_type)
    }

    /// Remove listeners that may veto, meaning the removal outcome is not
    /// known until they ran.
    pub fn has_cancelling_remove_listeners(&self, view_type: &str) -> bool {
        self.pre_remove
            .get(view_type)
            .is_some_and(|listeners| !listeners.is_empty())
    }

    fn plain(&self, phase: ListenerPhase, view_type: &str) -> &[ViewListener] {
        let map = match phase {
            ListenerPhase::PrePersist => &self.pre_persist,
            ListenerPhase::PostPersist => &self.post_persist,
            ListenerPhase::PreUpdate => &self.pre_update,
            ListenerPhase::PostUpdate => &self.post_update,
            ListenerPhase::PostRemove => &self.post_remove,
            _ => return &[],
        };
        map.get(view_type).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Completion listeners of `phase` that subscribed to `transition`,
    /// cloned out so they can outlive the registry borrow (they are queued
    /// against the transaction).
    pub(crate) fn completions(
        &self,
        phase: ListenerPhase,
        view_type: &str,
        transition: ViewTransition,
    ) -> Vec<CompletionListener> {
        let map = match phase {
            ListenerPhase::PostCommit => &self.post_commit,
            ListenerPhase::PostRollback => &self.post_rollback,
            _ => return Vec::new(),
        };
        map.get(view_type)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|(transitions, _)| transitions.contains(&transition))
                    .map(|(_, listener)| Arc::clone(listener))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Invokes registered listeners around provider calls, wrapping their
/// failures so the flush aborts with the phase on record.
pub struct ListenerDispatcher<'a> {
    registry: &'a ListenerRegistry,
}

impl<'a> ListenerDispatcher<'a> {
    pub fn new(registry: &'a ListenerRegistry) -> Self {
        Self { registry }
    }

    pub fn invoke(
        &self,
        phase: ListenerPhase,
        graph: &mut ViewGraph,
        node: NodeId,
    ) -> Result<()> {
        let view_type = graph.node(node)?.view_type().name.clone();
        for listener in self.registry.plain(phase, &view_type) {
            listener(graph, node).map_err(|err| ViewError::ListenerFailure {
                phase: phase.to_string(),
                source: Box::new(err),
            })?;
        }
        Ok(())
    }

    /// Pre-remove listeners in registration order. The first `Ok(false)`
    /// short-circuits and vetoes the removal.
    pub fn invoke_pre_remove(&self, graph: &mut ViewGraph, node: NodeId) -> Result<bool> {
        let view_type = graph.node(node)?.view_type().name.clone();
        let listeners: Vec<RemoveListener> = self
            .registry
            .pre_remove
            .get(&view_type)
            .map(|l| l.iter().map(Arc::clone).collect())
            .unwrap_or_default();
        for listener in listeners {
            let keep = listener(graph, node).map_err(|err| ViewError::ListenerFailure {
                phase: ListenerPhase::PreRemove.to_string(),
                source: Box::new(err),
            })?;
            if !keep {
                event!(Level::DEBUG, node = %node, view_type = %view_type,
                    "pre-remove listener vetoed removal");
                return Ok(false);
            }
        }
        Ok(true)
    }
}
