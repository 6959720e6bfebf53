// ============================================================================
// RustViewDB Library
// ============================================================================

pub mod core;
pub mod facade;
pub mod flush;
pub mod graph;
pub mod metamodel;
pub mod provider;
pub mod transaction;

// Re-export main types for convenience
pub use crate::core::{Result, Value, ViewError};
pub use crate::facade::ViewManager;
pub use crate::flush::{
    FlushConfig, FlushMode, FlushOptions, FlushReport, FlushStrategy, ListenerRegistry,
    ViewTransition,
};
pub use crate::graph::{
    AttributeChange, AttributeValue, ChangeModel, CollectionChange, CollectionElement, NodeId,
    ViewGraph,
};
pub use crate::metamodel::{
    AttributeDef, RelationDef, RelationOwnership, ViewMetamodel, ViewType,
};
pub use crate::provider::{
    AttributeSlot, EntityStore, FlatValue, InMemoryStore, NodeState, OwnerRef, OwnerWrite,
    StoreError, StoredRow, WriteOp,
};
pub use crate::transaction::{Transaction, TransactionStatus};
