use serde::{Deserialize, Serialize};

use crate::core::ViewTypeName;

/// Which side of a view relation physically carries the link.
///
/// The flush engine orders writes from this: a parent row holding the
/// foreign key can only be written once the child row exists, and the
/// other way around.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelationOwnership {
    /// The parent row holds the foreign key column.
    ParentColumn,
    /// The child row holds the foreign key column.
    ChildColumn,
    /// A separate join table holds the link.
    JoinTable,
}

impl std::fmt::Display for RelationOwnership {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ParentColumn => write!(f, "parent-column"),
            Self::ChildColumn => write!(f, "child-column"),
            Self::JoinTable => write!(f, "join-table"),
        }
    }
}

/// Declared shape of a view-to-view edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationDef {
    pub target: ViewTypeName,
    /// Owned edges are cascaded into; read-only edges only reference.
    pub owned: bool,
    pub ownership: RelationOwnership,
    /// Delete a child that disappeared from this relation.
    pub orphan_removal: bool,
    /// Delete the children of this relation when the parent is deleted.
    pub cascade_delete: bool,
}

impl RelationDef {
    /// Owned edge, foreign key on the child row (the common collection shape).
    pub fn owned(target: &str) -> Self {
        Self {
            target: target.to_string(),
            owned: true,
            ownership: RelationOwnership::ChildColumn,
            orphan_removal: false,
            cascade_delete: false,
        }
    }

    /// Read-only edge: the target is referenced but never written through it.
    pub fn read_only(target: &str) -> Self {
        Self {
            target: target.to_string(),
            owned: false,
            ownership: RelationOwnership::ParentColumn,
            orphan_removal: false,
            cascade_delete: false,
        }
    }

    pub fn with_ownership(mut self, ownership: RelationOwnership) -> Self {
        self.ownership = ownership;
        self
    }

    pub fn orphan_removal(mut self) -> Self {
        self.orphan_removal = true;
        self
    }

    pub fn cascade_delete(mut self) -> Self {
        self.cascade_delete = true;
        self
    }
}

/// Kind of a declared attribute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AttributeKind {
    Basic { mutable: bool },
    BasicList { mutable: bool },
    Reference { relation: RelationDef },
    Collection { relation: RelationDef },
}

/// One declared attribute of a view type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributeDef {
    pub name: String,
    pub kind: AttributeKind,
}

impl AttributeDef {
    /// Mutable singular basic attribute.
    pub fn basic(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: AttributeKind::Basic { mutable: true },
        }
    }

    /// Immutable singular basic attribute. Setters reject it.
    pub fn immutable(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: AttributeKind::Basic { mutable: false },
        }
    }

    /// Mutable collection of basic values.
    pub fn basic_list(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: AttributeKind::BasicList { mutable: true },
        }
    }

    /// Singular view-to-view edge.
    pub fn reference(name: &str, relation: RelationDef) -> Self {
        Self {
            name: name.to_string(),
            kind: AttributeKind::Reference { relation },
        }
    }

    /// Plural view-to-view edge.
    pub fn collection(name: &str, relation: RelationDef) -> Self {
        Self {
            name: name.to_string(),
            kind: AttributeKind::Collection { relation },
        }
    }

    pub fn is_mutable(&self) -> bool {
        match &self.kind {
            AttributeKind::Basic { mutable } | AttributeKind::BasicList { mutable } => *mutable,
            // View edges are mutable through adoption/release, not assignment checks
            AttributeKind::Reference { .. } | AttributeKind::Collection { .. } => true,
        }
    }

    pub fn is_plural(&self) -> bool {
        matches!(
            self.kind,
            AttributeKind::BasicList { .. } | AttributeKind::Collection { .. }
        )
    }

    pub fn relation(&self) -> Option<&RelationDef> {
        match &self.kind {
            AttributeKind::Reference { relation } | AttributeKind::Collection { relation } => {
                Some(relation)
            }
            _ => None,
        }
    }

    /// Relation of this attribute when it is an owned view edge.
    pub fn owned_relation(&self) -> Option<&RelationDef> {
        self.relation().filter(|r| r.owned)
    }

    pub fn is_view_edge(&self) -> bool {
        self.relation().is_some()
    }
}
