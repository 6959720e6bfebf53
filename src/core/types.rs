/// Position of an attribute inside its view type's declared attribute list.
///
/// Dirty bits, snapshots and provider payloads all address attributes by
/// this index, never by name.
pub type AttributeIndex = usize;

/// Name under which a view type is registered in the metamodel.
pub type ViewTypeName = String;
