pub mod memory;

use serde::Serialize;
use thiserror::Error;

use crate::core::{AttributeIndex, Value, ViewError};
use crate::metamodel::RelationOwnership;

pub use memory::{InMemoryStore, StoredRow, WriteOp};

/// Errors a persistence provider can surface. `VersionConflict` has a
/// dedicated mapping because the engine treats it as an optimistic-locking
/// failure; everything else is opaque.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Version conflict on '{view_type}' with id {id}")]
    VersionConflict { view_type: String, id: String },

    #[error("Record '{1}' of '{0}' not found")]
    NotFound(String, String),

    #[error("Write rejected: {0}")]
    Rejected(String),

    #[error("Store I/O error: {0}")]
    Io(String),
}

impl From<StoreError> for ViewError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::VersionConflict { view_type, id } => {
                ViewError::ConcurrencyConflict { view_type, id }
            }
            other => ViewError::ProviderWriteFailure(other.to_string()),
        }
    }
}

/// Flattened value of one attribute as the provider sees it: child views
/// reduced to their identities. `None` inside a reference means the child
/// has no identity yet; its own write carries the link instead (see
/// [`OwnerRef`]).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum FlatValue {
    Basic(Value),
    BasicList(Vec<Value>),
    Ref(Option<Value>),
    RefList(Vec<Option<Value>>),
}

/// One attribute slot of a [`NodeState`].
#[derive(Debug, Clone, Serialize)]
pub struct AttributeSlot {
    pub name: String,
    pub value: FlatValue,
}

/// Back-reference a child write carries when the physical link lives on
/// the child row or in a join table.
#[derive(Debug, Clone, Serialize)]
pub struct OwnerRef {
    pub view_type: String,
    pub id: Value,
    pub attribute: String,
    pub ownership: RelationOwnership,
}

/// What a write does to the row's owning back-reference. `Unchanged`
/// leaves whatever the store holds; `Clear` severs the link of a row
/// dropped from its owning relation without being deleted.
#[derive(Debug, Clone, Serialize)]
pub enum OwnerWrite {
    Unchanged,
    Assign(OwnerRef),
    Clear,
}

/// Everything the provider needs to write one node: type, identity,
/// optional optimistic guard, flattened attributes, and the effect on the
/// owning back-reference.
#[derive(Debug, Clone, Serialize)]
pub struct NodeState {
    pub view_type: String,
    pub id: Option<Value>,
    /// Last-known version; updates and removes use it as a write guard.
    pub version_guard: Option<Value>,
    /// Name of the optimistic version attribute, when the type has one.
    /// Its slot already carries the value to store.
    pub version_attribute: Option<String>,
    pub attributes: Vec<AttributeSlot>,
    pub owner: OwnerWrite,
}

impl NodeState {
    pub fn attribute(&self, name: &str) -> Option<&FlatValue> {
        self.attributes
            .iter()
            .find(|slot| slot.name == name)
            .map(|slot| &slot.value)
    }
}

/// The persistence-provider boundary. Calls are synchronous and happen
/// inside the caller's transaction; the engine orders them so foreign-key
/// dependencies are already satisfied when each call arrives.
pub trait EntityStore {
    /// Persist a new record. When `state.id` is `None` the store generates
    /// the identity and returns it; otherwise it returns the given one.
    fn insert(&mut self, state: &NodeState) -> std::result::Result<Value, StoreError>;

    /// Update an existing record. `dirty` selects the attribute slots to
    /// write (indexes into `state.attributes`); `None` rewrites all of
    /// them. `state.owner` applies even when `dirty` is empty: an
    /// `Assign` or `Clear` write may carry no columns at all. A
    /// `version_guard` mismatch must surface as
    /// [`StoreError::VersionConflict`]. For versioned types the new
    /// version value is already in the attribute slots; the engine adopts
    /// it after the call succeeds.
    fn update(
        &mut self,
        state: &NodeState,
        dirty: Option<&[AttributeIndex]>,
    ) -> std::result::Result<(), StoreError>;

    /// Delete a record. An unguarded remove of a missing record is a
    /// no-op; a guarded one is a version conflict.
    fn remove(
        &mut self,
        view_type: &str,
        id: &Value,
        guard: Option<&Value>,
    ) -> std::result::Result<(), StoreError>;
}
