use std::fmt;
use std::sync::Arc;

use crate::core::{AttributeIndex, Value};
use crate::metamodel::ViewType;

use super::dirty::DirtyBits;

/// Arena handle of a node inside one [`ViewGraph`](super::ViewGraph).
/// Handles are only meaningful for the graph that issued them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl NodeId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node_{}", self.0)
    }
}

/// Persisted identity of a node: the store id plus, for versioned types,
/// the last version observed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Identity {
    pub id: Option<Value>,
    pub version: Option<Value>,
}

/// Current payload of one attribute slot.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    Basic(Value),
    BasicList(Vec<Value>),
    View(Option<NodeId>),
    ViewList(Vec<NodeId>),
}

impl AttributeValue {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Basic(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_view(&self) -> Option<NodeId> {
        match self {
            Self::View(child) => *child,
            _ => None,
        }
    }

    pub fn as_view_list(&self) -> Option<&[NodeId]> {
        match self {
            Self::ViewList(children) => Some(children),
            _ => None,
        }
    }

    pub fn as_basic_list(&self) -> Option<&[Value]> {
        match self {
            Self::BasicList(values) => Some(values),
            _ => None,
        }
    }

    /// Node ids referenced from this slot, in slot order.
    pub(crate) fn referenced_nodes(&self) -> Vec<NodeId> {
        match self {
            Self::View(Some(child)) => vec![*child],
            Self::ViewList(children) => children.clone(),
            _ => Vec::new(),
        }
    }
}

/// One view instance inside the arena: declared shape, persisted identity,
/// current and initial attribute state, dirty bits, and the back-pointers
/// the flush engine navigates.
#[derive(Debug, Clone)]
pub struct ViewNode {
    pub(crate) view_type: Arc<ViewType>,
    pub(crate) identity: Identity,
    pub(crate) is_new: bool,
    pub(crate) is_reference: bool,
    pub(crate) dirty: DirtyBits,
    /// Plural slots assigned wholesale since load, as opposed to mutated
    /// element by element.
    pub(crate) replaced_collections: DirtyBits,
    pub(crate) values: Vec<AttributeValue>,
    pub(crate) initial: Option<Vec<AttributeValue>>,
    /// Sole owning parent: (parent node, attribute the node sits under).
    pub(crate) parent: Option<(NodeId, AttributeIndex)>,
    pub(crate) read_only_parents: Vec<(NodeId, AttributeIndex)>,
    /// Moved under a child-side owner since load; the next write must
    /// carry the owner reference even if no column is dirty.
    pub(crate) owner_changed: bool,
}

impl ViewNode {
    pub(crate) fn new(
        view_type: Arc<ViewType>,
        identity: Identity,
        is_new: bool,
        is_reference: bool,
        values: Vec<AttributeValue>,
    ) -> Self {
        let attr_count = view_type.attr_count();
        let initial = if view_type.tracks_initial_state && !is_reference {
            Some(values.clone())
        } else {
            None
        };
        Self {
            view_type,
            identity,
            is_new,
            is_reference,
            dirty: DirtyBits::new(attr_count),
            replaced_collections: DirtyBits::new(attr_count),
            values,
            initial,
            parent: None,
            read_only_parents: Vec::new(),
            owner_changed: false,
        }
    }

    pub fn view_type(&self) -> &Arc<ViewType> {
        &self.view_type
    }

    pub fn id(&self) -> Option<&Value> {
        self.identity.id.as_ref()
    }

    pub fn version(&self) -> Option<&Value> {
        self.identity.version.as_ref()
    }

    pub fn is_new(&self) -> bool {
        self.is_new
    }

    pub fn is_reference(&self) -> bool {
        self.is_reference
    }

    /// Raw aggregate dirtiness: at least one bit was marked since the last
    /// successful flush. See `ViewGraph::is_effectively_dirty` for the
    /// snapshot-aware variant.
    pub fn is_dirty(&self) -> bool {
        self.dirty.is_dirty()
    }

    pub fn is_attribute_marked(&self, attr: AttributeIndex) -> bool {
        self.dirty.is_bit_set(attr)
    }

    pub fn parent(&self) -> Option<(NodeId, AttributeIndex)> {
        self.parent
    }

    pub fn read_only_parents(&self) -> &[(NodeId, AttributeIndex)] {
        &self.read_only_parents
    }

    pub fn value(&self, attr: AttributeIndex) -> Option<&AttributeValue> {
        self.values.get(attr)
    }

    pub fn initial_value(&self, attr: AttributeIndex) -> Option<&AttributeValue> {
        self.initial.as_ref().and_then(|snapshot| snapshot.get(attr))
    }

    pub(crate) fn was_collection_replaced(&self, attr: AttributeIndex) -> bool {
        self.replaced_collections.is_bit_set(attr)
    }

    pub(crate) fn owner_changed(&self) -> bool {
        self.owner_changed
    }

    pub(crate) fn tracks_changes(&self) -> bool {
        self.initial.is_some()
    }
}
