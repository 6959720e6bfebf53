use std::sync::Arc;

use crate::core::Result;
use crate::flush::{
    FlushConfig, FlushExecutor, FlushOptions, FlushReport, ListenerRegistry,
};
use crate::graph::{NodeId, ViewGraph};
use crate::metamodel::ViewMetamodel;
use crate::provider::EntityStore;
use crate::transaction::Transaction;

/// Entry point that ties a validated metamodel, the listener registry and
/// the flush defaults together. One manager serves any number of graphs;
/// graphs are cheap and single-threaded, the manager is the long-lived
/// piece.
///
/// # Examples
///
/// ```
/// use rustviewdb::{
///     AttributeDef, InMemoryStore, Transaction, Value, ViewManager, ViewMetamodel, ViewType,
/// };
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let mut metamodel = ViewMetamodel::new();
/// metamodel.register(
///     ViewType::new("Customer")
///         .attribute(AttributeDef::basic("name"))
///         .attribute(AttributeDef::basic("email")),
/// )?;
/// let manager = ViewManager::new(metamodel)?;
///
/// let mut graph = manager.new_graph();
/// let customer = graph.create("Customer")?;
/// graph.set(customer, 0, Value::from("Ada"))?;
/// graph.set(customer, 1, Value::from("ada@example.com"))?;
///
/// let mut store = InMemoryStore::new();
/// let mut tx = Transaction::begin();
/// let report = manager.flush(&mut graph, customer, &mut store, &mut tx)?;
/// tx.commit(&mut graph)?;
///
/// assert_eq!(report.inserted, 1);
/// assert!(!graph.is_effectively_dirty(customer)?);
/// # Ok(())
/// # }
/// ```
pub struct ViewManager {
    metamodel: Arc<ViewMetamodel>,
    listeners: ListenerRegistry,
    defaults: FlushConfig,
}

impl ViewManager {
    /// Build a manager over `metamodel`. Cross-type rules are checked
    /// here, so a manager that constructs is safe to flush with.
    pub fn new(metamodel: ViewMetamodel) -> Result<Self> {
        metamodel.validate()?;
        Ok(Self {
            metamodel: Arc::new(metamodel),
            listeners: ListenerRegistry::new(),
            defaults: FlushConfig::default(),
        })
    }

    /// Replace the manager-wide flush defaults. Per-type configuration
    /// still wins where declared.
    pub fn with_flush_defaults(mut self, defaults: FlushConfig) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn metamodel(&self) -> &Arc<ViewMetamodel> {
        &self.metamodel
    }

    pub fn flush_defaults(&self) -> FlushConfig {
        self.defaults
    }

    /// Register lifecycle and transaction listeners here before flushing.
    pub fn listeners_mut(&mut self) -> &mut ListenerRegistry {
        &mut self.listeners
    }

    /// A fresh, empty graph bound to this manager's metamodel.
    pub fn new_graph(&self) -> ViewGraph {
        ViewGraph::new(self.metamodel.clone())
    }

    /// Flush every pending change reachable from `root` into `store`,
    /// inside the caller's transaction.
    pub fn flush(
        &self,
        graph: &mut ViewGraph,
        root: NodeId,
        store: &mut dyn EntityStore,
        tx: &mut Transaction,
    ) -> Result<FlushReport> {
        self.flush_with(graph, root, store, tx, FlushOptions::default())
    }

    pub fn flush_with(
        &self,
        graph: &mut ViewGraph,
        root: NodeId,
        store: &mut dyn EntityStore,
        tx: &mut Transaction,
        options: FlushOptions,
    ) -> Result<FlushReport> {
        FlushExecutor::new(&self.listeners, self.defaults).flush(graph, root, store, tx, options)
    }

    /// Delete a persisted, unowned view and everything its cascade-delete
    /// relations reach.
    pub fn remove(
        &self,
        graph: &mut ViewGraph,
        root: NodeId,
        store: &mut dyn EntityStore,
        tx: &mut Transaction,
    ) -> Result<FlushReport> {
        FlushExecutor::new(&self.listeners, self.defaults).remove(graph, root, store, tx)
    }
}
