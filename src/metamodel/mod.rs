pub mod attribute;
pub mod registry;
pub mod view_type;

pub use attribute::{AttributeDef, AttributeKind, RelationDef, RelationOwnership};
pub use registry::ViewMetamodel;
pub use view_type::ViewType;
