pub mod change;
pub mod dirty;
pub mod graph;
pub mod node;
pub mod walker;

pub use change::{AttributeChange, ChangeModel, CollectionChange, CollectionElement};
pub use dirty::DirtyBits;
pub use graph::{ElementKey, ViewGraph};
pub use node::{AttributeValue, Identity, NodeId, ViewNode};
pub use walker::{GraphWalker, WalkOutcome};
