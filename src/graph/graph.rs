use std::collections::HashSet;
use std::sync::Arc;

use crate::core::{AttributeIndex, Result, Value, ViewError};
use crate::metamodel::{AttributeKind, RelationDef, RelationOwnership, ViewMetamodel, ViewType};

use super::change::{self, ChangeModel};
use super::dirty::DirtyBits;
use super::node::{AttributeValue, Identity, NodeId, ViewNode};

/// Arena of view instances. All node handles (`NodeId`) are indexes into
/// this arena; inter-node edges are handles, never owning references, so
/// cyclic and shared shapes need no special casing.
///
/// A graph is single-writer: one flush at a time, mutations and flushes
/// from one thread.
pub struct ViewGraph {
    metamodel: Arc<ViewMetamodel>,
    nodes: Vec<ViewNode>,
}

impl ViewGraph {
    pub fn new(metamodel: Arc<ViewMetamodel>) -> Self {
        Self {
            metamodel,
            nodes: Vec::new(),
        }
    }

    pub fn metamodel(&self) -> &Arc<ViewMetamodel> {
        &self.metamodel
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    // ========================================
    // Node lifecycle
    // ========================================

    /// Materialize a loaded instance: `values` become both the current
    /// state and the initial snapshot, dirty bits start clear. Owned
    /// children referenced from `values` are adopted here.
    pub fn load(
        &mut self,
        type_name: &str,
        id: Value,
        version: Option<Value>,
        values: Vec<AttributeValue>,
    ) -> Result<NodeId> {
        let view_type = self.metamodel.get(type_name)?;
        self.check_shape(&view_type, &values)?;
        let identity = Identity {
            id: Some(id),
            version,
        };
        let node = self.push_node(ViewNode::new(view_type, identity, false, false, values));
        self.link_children_of(node)?;
        Ok(node)
    }

    /// Create a fresh instance with default values. It flushes as an
    /// insert.
    pub fn create(&mut self, type_name: &str) -> Result<NodeId> {
        let view_type = self.metamodel.get(type_name)?;
        let values = Self::default_values(&view_type);
        Ok(self.push_node(ViewNode::new(
            view_type,
            Identity::default(),
            true,
            false,
            values,
        )))
    }

    /// Create a fresh instance that already carries its identity. It still
    /// flushes as an insert; providers that upsert may treat it as
    /// idempotent.
    pub fn create_with_id(&mut self, type_name: &str, id: Value) -> Result<NodeId> {
        let node = self.create(type_name)?;
        self.nodes[node.index()].identity.id = Some(id);
        Ok(node)
    }

    /// Identity-only placeholder for an existing record. Reference nodes
    /// are never written; marking them dirty is a no-op.
    pub fn create_reference(&mut self, type_name: &str, id: Value) -> Result<NodeId> {
        let view_type = self.metamodel.get(type_name)?;
        let values = Self::default_values(&view_type);
        let identity = Identity {
            id: Some(id),
            version: None,
        };
        Ok(self.push_node(ViewNode::new(view_type, identity, false, true, values)))
    }

    pub fn node(&self, id: NodeId) -> Result<&ViewNode> {
        self.nodes
            .get(id.index())
            .ok_or_else(|| ViewError::NodeDetached(id.to_string()))
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> Result<&mut ViewNode> {
        self.nodes
            .get_mut(id.index())
            .ok_or_else(|| ViewError::NodeDetached(id.to_string()))
    }

    pub fn attr_index(&self, node: NodeId, name: &str) -> Result<AttributeIndex> {
        let n = self.node(node)?;
        n.view_type.index_of(name).ok_or_else(|| {
            ViewError::AttributeNotFound(name.to_string(), n.view_type.name.clone())
        })
    }

    pub fn get(&self, node: NodeId, attr: AttributeIndex) -> Result<&AttributeValue> {
        let n = self.node(node)?;
        n.values
            .get(attr)
            .ok_or_else(|| Self::out_of_range(&n.view_type, attr))
    }

    // ========================================
    // Setters
    // ========================================

    /// Assign a singular basic attribute. A no-op when the new value
    /// compares equal to the current one.
    pub fn set(&mut self, node: NodeId, attr: AttributeIndex, value: Value) -> Result<()> {
        let n = self.node(node)?;
        let def = Self::attr_def(&n.view_type, attr)?;
        match def.kind {
            AttributeKind::Basic { mutable } => {
                if !mutable {
                    return Err(ViewError::StructuralViolation(format!(
                        "attribute '{}' of '{}' is not mutable",
                        def.name, n.view_type.name
                    )));
                }
            }
            _ => {
                return Err(ViewError::TypeMismatch(format!(
                    "attribute '{}' of '{}' is not a singular basic attribute",
                    def.name, n.view_type.name
                )));
            }
        }
        if matches!(&n.values[attr], AttributeValue::Basic(current) if *current == value) {
            return Ok(());
        }
        self.nodes[node.index()].values[attr] = AttributeValue::Basic(value);
        self.mark_and_propagate(node, attr);
        Ok(())
    }

    /// Assign a singular view edge. Releases the previous child, adopts the
    /// new one.
    pub fn set_view(
        &mut self,
        node: NodeId,
        attr: AttributeIndex,
        child: Option<NodeId>,
    ) -> Result<()> {
        let relation = self.edge_relation(node, attr, false)?;
        let current = match &self.node(node)?.values[attr] {
            AttributeValue::View(c) => *c,
            _ => unreachable!("edge_relation checked the kind"),
        };
        if current == child {
            return Ok(());
        }
        if let Some(c) = child {
            self.check_adoptable(node, attr, c, &relation)?;
        }
        if let Some(old) = current {
            self.release(node, attr, old, relation.owned);
        }
        if let Some(c) = child {
            self.adopt(node, attr, c, &relation, true);
        }
        self.nodes[node.index()].values[attr] = AttributeValue::View(child);
        self.mark_and_propagate(node, attr);
        Ok(())
    }

    /// Replace a view collection wholesale. Element-level add/remove is
    /// tracked incrementally by [`list_add`](Self::list_add) and
    /// [`list_remove`](Self::list_remove); this records a full
    /// replacement, which forces a complete diff at flush time.
    pub fn set_view_list(
        &mut self,
        node: NodeId,
        attr: AttributeIndex,
        children: Vec<NodeId>,
    ) -> Result<()> {
        let relation = self.edge_relation(node, attr, true)?;
        let current = match &self.node(node)?.values[attr] {
            AttributeValue::ViewList(c) => c.clone(),
            _ => unreachable!("edge_relation checked the kind"),
        };

        let mut seen = HashSet::new();
        for child in &children {
            if !seen.insert(*child) {
                return Err(ViewError::StructuralViolation(format!(
                    "{} appears twice in the assigned collection",
                    child
                )));
            }
            // Children already under this slot are released below before
            // re-adoption, so they pass the check.
            if !current.contains(child) {
                self.check_adoptable(node, attr, *child, &relation)?;
            } else {
                self.check_target_type(*child, &relation)?;
            }
        }

        for old in &current {
            self.release(node, attr, *old, relation.owned);
        }
        for child in &children {
            self.adopt(node, attr, *child, &relation, true);
        }
        self.nodes[node.index()].values[attr] = AttributeValue::ViewList(children);
        self.nodes[node.index()].replaced_collections.mark(attr);
        self.mark_and_propagate(node, attr);
        Ok(())
    }

    /// Replace a basic collection wholesale.
    pub fn set_basic_list(
        &mut self,
        node: NodeId,
        attr: AttributeIndex,
        values: Vec<Value>,
    ) -> Result<()> {
        let n = self.node(node)?;
        let def = Self::attr_def(&n.view_type, attr)?;
        match def.kind {
            AttributeKind::BasicList { mutable } => {
                if !mutable {
                    return Err(ViewError::StructuralViolation(format!(
                        "attribute '{}' of '{}' is not mutable",
                        def.name, n.view_type.name
                    )));
                }
            }
            _ => {
                return Err(ViewError::TypeMismatch(format!(
                    "attribute '{}' of '{}' is not a basic collection",
                    def.name, n.view_type.name
                )));
            }
        }
        if matches!(&n.values[attr], AttributeValue::BasicList(current) if *current == values) {
            return Ok(());
        }
        self.nodes[node.index()].values[attr] = AttributeValue::BasicList(values);
        self.nodes[node.index()].replaced_collections.mark(attr);
        self.mark_and_propagate(node, attr);
        Ok(())
    }

    /// Append one element to a view collection.
    pub fn list_add(&mut self, node: NodeId, attr: AttributeIndex, child: NodeId) -> Result<()> {
        let relation = self.edge_relation(node, attr, true)?;
        self.check_adoptable(node, attr, child, &relation)?;
        self.adopt(node, attr, child, &relation, true);
        match &mut self.nodes[node.index()].values[attr] {
            AttributeValue::ViewList(children) => children.push(child),
            _ => unreachable!("edge_relation checked the kind"),
        }
        self.mark_and_propagate(node, attr);
        Ok(())
    }

    /// Remove one element from a view collection. Returns whether the
    /// element was present. The removed child loses its owning parent and
    /// becomes an orphan candidate for the next flush.
    pub fn list_remove(
        &mut self,
        node: NodeId,
        attr: AttributeIndex,
        child: NodeId,
    ) -> Result<bool> {
        let relation = self.edge_relation(node, attr, true)?;
        let position = match &self.node(node)?.values[attr] {
            AttributeValue::ViewList(children) => children.iter().position(|c| *c == child),
            _ => unreachable!("edge_relation checked the kind"),
        };
        let Some(position) = position else {
            return Ok(false);
        };
        match &mut self.nodes[node.index()].values[attr] {
            AttributeValue::ViewList(children) => {
                children.remove(position);
            }
            _ => unreachable!(),
        }
        self.release(node, attr, child, relation.owned);
        self.mark_and_propagate(node, attr);
        Ok(true)
    }

    pub fn basic_list_add(&mut self, node: NodeId, attr: AttributeIndex, value: Value) -> Result<()> {
        let n = self.node(node)?;
        let def = Self::attr_def(&n.view_type, attr)?;
        if !matches!(def.kind, AttributeKind::BasicList { mutable: true }) {
            return Err(ViewError::TypeMismatch(format!(
                "attribute '{}' of '{}' is not a mutable basic collection",
                def.name, n.view_type.name
            )));
        }
        match &mut self.nodes[node.index()].values[attr] {
            AttributeValue::BasicList(values) => values.push(value),
            _ => unreachable!("kind checked above"),
        }
        self.mark_and_propagate(node, attr);
        Ok(())
    }

    pub fn basic_list_remove(
        &mut self,
        node: NodeId,
        attr: AttributeIndex,
        value: &Value,
    ) -> Result<bool> {
        let n = self.node(node)?;
        let def = Self::attr_def(&n.view_type, attr)?;
        if !matches!(def.kind, AttributeKind::BasicList { mutable: true }) {
            return Err(ViewError::TypeMismatch(format!(
                "attribute '{}' of '{}' is not a mutable basic collection",
                def.name, n.view_type.name
            )));
        }
        let removed = match &mut self.nodes[node.index()].values[attr] {
            AttributeValue::BasicList(values) => {
                if let Some(position) = values.iter().position(|v| v == value) {
                    values.remove(position);
                    true
                } else {
                    false
                }
            }
            _ => unreachable!("kind checked above"),
        };
        if removed {
            self.mark_and_propagate(node, attr);
        }
        Ok(removed)
    }

    // ========================================
    // Dirty marking and queries
    // ========================================

    /// Mark one attribute dirty by hand. Out-of-range indexes are ignored,
    /// and the call is a no-op on reference nodes.
    pub fn mark_dirty(&mut self, node: NodeId, attr: AttributeIndex) -> Result<()> {
        let n = self.node_mut(node)?;
        if n.is_reference {
            return Ok(());
        }
        let in_range = attr < n.dirty.len();
        n.dirty.mark(attr);
        if in_range {
            self.propagate_dirty(node);
        }
        Ok(())
    }

    /// Mark the whole instance possibly dirty.
    pub fn mark_all_dirty(&mut self, node: NodeId) -> Result<()> {
        let n = self.node_mut(node)?;
        if n.is_reference {
            return Ok(());
        }
        n.dirty.mark_all();
        self.propagate_dirty(node);
        Ok(())
    }

    /// Substitute an attribute value without going through a setter check,
    /// but only when the current value still equals `expected`. Marks
    /// dirty exactly as the corresponding setter would. Returns whether
    /// the substitution happened.
    pub fn replace_attribute(
        &mut self,
        node: NodeId,
        attr: AttributeIndex,
        expected: &AttributeValue,
        new: AttributeValue,
    ) -> Result<bool> {
        let n = self.node(node)?;
        let current = n
            .values
            .get(attr)
            .ok_or_else(|| Self::out_of_range(&n.view_type, attr))?;
        if current != expected {
            return Ok(false);
        }
        match new {
            AttributeValue::Basic(value) => self.set(node, attr, value)?,
            AttributeValue::View(child) => self.set_view(node, attr, child)?,
            AttributeValue::ViewList(children) => self.set_view_list(node, attr, children)?,
            AttributeValue::BasicList(values) => self.set_basic_list(node, attr, values)?,
        }
        Ok(true)
    }

    /// Effective per-attribute dirtiness: the bit must be set, and when an
    /// initial snapshot exists the current value must actually differ from
    /// it (directly, or somewhere in the owned subtree for view edges).
    pub fn is_attribute_dirty(&self, node: NodeId, attr: AttributeIndex) -> Result<bool> {
        let n = self.node(node)?;
        if n.values.get(attr).is_none() {
            return Err(Self::out_of_range(&n.view_type, attr));
        }
        let mut visited = HashSet::new();
        Ok(self.effective_attr_dirty(node, attr, &mut visited))
    }

    /// Effective whole-instance dirtiness. New nodes count as dirty,
    /// references never do. A pending owner move counts too, since the
    /// next flush will write it.
    pub fn is_effectively_dirty(&self, node: NodeId) -> Result<bool> {
        let n = self.node(node)?;
        if n.is_reference {
            return Ok(false);
        }
        if n.is_new || n.owner_changed {
            return Ok(true);
        }
        let mut visited = HashSet::new();
        Ok((0..n.values.len()).any(|attr| self.effective_attr_dirty(node, attr, &mut visited)))
    }

    /// Change report for one node, computed on demand from the initial and
    /// current snapshots.
    pub fn change_model(&self, node: NodeId) -> Result<ChangeModel> {
        change::compute(self, node)
    }

    // ========================================
    // Flush-engine support (crate-internal)
    // ========================================

    /// Attributes whose change must land on this node's own row: basic
    /// attributes that differ, and view edges whose link lives on the
    /// parent row and whose membership changed. Child-content changes are
    /// excluded; they flush through the children.
    pub(crate) fn row_dirty_attrs(&self, node: NodeId) -> Result<Vec<AttributeIndex>> {
        let n = self.node(node)?;
        let mut dirty = Vec::new();
        for attr in 0..n.values.len() {
            if !n.dirty.is_bit_set(attr) {
                continue;
            }
            if !Self::is_row_attr(&n.view_type, attr) {
                continue;
            }
            let changed = match n.initial.as_ref().map(|snapshot| &snapshot[attr]) {
                None => true,
                Some(initial) => self.edge_or_value_changed(n, attr, initial),
            };
            if changed {
                dirty.push(attr);
            }
        }
        Ok(dirty)
    }

    pub(crate) fn take_dirty(&mut self, node: NodeId) -> Result<(DirtyBits, DirtyBits)> {
        let n = self.node_mut(node)?;
        Ok((n.dirty.take(), n.replaced_collections.take()))
    }

    pub(crate) fn restore_dirty(&mut self, node: NodeId, bits: &DirtyBits, replaced: &DirtyBits) {
        if let Some(n) = self.nodes.get_mut(node.index()) {
            n.dirty.union(bits);
            n.replaced_collections.union(replaced);
        }
    }

    pub(crate) fn take_owner_changed(&mut self, node: NodeId) -> Result<bool> {
        let n = self.node_mut(node)?;
        Ok(std::mem::take(&mut n.owner_changed))
    }

    pub(crate) fn restore_owner_changed(&mut self, node: NodeId, owner_changed: bool) {
        if let Some(n) = self.nodes.get_mut(node.index()) {
            n.owner_changed = n.owner_changed || owner_changed;
        }
    }

    pub(crate) fn assign_identity(&mut self, node: NodeId, id: Value) -> Result<()> {
        self.node_mut(node)?.identity.id = Some(id);
        Ok(())
    }

    pub(crate) fn assign_version(&mut self, node: NodeId, version: Option<Value>) -> Result<()> {
        self.node_mut(node)?.identity.version = version;
        Ok(())
    }

    pub(crate) fn restore_identity(&mut self, node: NodeId, id: Option<Value>, version: Option<Value>) {
        if let Some(n) = self.nodes.get_mut(node.index()) {
            n.identity.id = id;
            n.identity.version = version;
        }
    }

    pub(crate) fn set_persisted(&mut self, node: NodeId) -> Result<()> {
        self.node_mut(node)?.is_new = false;
        Ok(())
    }

    pub(crate) fn set_is_new(&mut self, node: NodeId, is_new: bool) {
        if let Some(n) = self.nodes.get_mut(node.index()) {
            n.is_new = is_new;
        }
    }

    /// Make the current state the new baseline after a successful flush.
    pub(crate) fn rebaseline(&mut self, node: NodeId) -> Result<()> {
        let n = self.node_mut(node)?;
        if n.view_type.tracks_initial_state && !n.is_reference {
            n.initial = Some(n.values.clone());
        }
        Ok(())
    }

    pub(crate) fn restore_initial(&mut self, node: NodeId, initial: Option<Vec<AttributeValue>>) {
        if let Some(n) = self.nodes.get_mut(node.index()) {
            n.initial = initial;
        }
    }

    pub(crate) fn identity_key(&self, node: NodeId) -> ElementKey {
        match self.nodes[node.index()].identity.id.clone() {
            Some(id) => ElementKey::Persisted(self.nodes[node.index()].view_type.name.clone(), id),
            None => ElementKey::Unpersisted(node),
        }
    }

    /// Effective dirtiness of an owned subtree rooted at `node`.
    pub(crate) fn subtree_dirty(&self, node: NodeId, visited: &mut HashSet<NodeId>) -> bool {
        if !visited.insert(node) {
            return false;
        }
        let n = &self.nodes[node.index()];
        if n.is_reference {
            return false;
        }
        if n.is_new {
            return true;
        }
        (0..n.values.len()).any(|attr| self.effective_attr_dirty(node, attr, visited))
    }

    // ========================================
    // Internal helpers
    // ========================================

    fn push_node(&mut self, node: ViewNode) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    fn default_values(view_type: &ViewType) -> Vec<AttributeValue> {
        view_type
            .attributes
            .iter()
            .map(|attr| match &attr.kind {
                AttributeKind::Basic { .. } => AttributeValue::Basic(Value::Null),
                AttributeKind::BasicList { .. } => AttributeValue::BasicList(Vec::new()),
                AttributeKind::Reference { .. } => AttributeValue::View(None),
                AttributeKind::Collection { .. } => AttributeValue::ViewList(Vec::new()),
            })
            .collect()
    }

    fn check_shape(&self, view_type: &ViewType, values: &[AttributeValue]) -> Result<()> {
        if values.len() != view_type.attr_count() {
            return Err(ViewError::TypeMismatch(format!(
                "view type '{}' declares {} attributes, got {} values",
                view_type.name,
                view_type.attr_count(),
                values.len()
            )));
        }
        for (attr, value) in values.iter().enumerate() {
            let def = &view_type.attributes[attr];
            let matches = matches!(
                (&def.kind, value),
                (AttributeKind::Basic { .. }, AttributeValue::Basic(_))
                    | (AttributeKind::BasicList { .. }, AttributeValue::BasicList(_))
                    | (AttributeKind::Reference { .. }, AttributeValue::View(_))
                    | (AttributeKind::Collection { .. }, AttributeValue::ViewList(_))
            );
            if !matches {
                return Err(ViewError::TypeMismatch(format!(
                    "value for attribute '{}' of '{}' does not match its declared kind",
                    def.name, view_type.name
                )));
            }
        }
        Ok(())
    }

    /// Adopt children referenced by a freshly loaded node.
    fn link_children_of(&mut self, node: NodeId) -> Result<()> {
        let attr_count = self.nodes[node.index()].values.len();
        for attr in 0..attr_count {
            let n = &self.nodes[node.index()];
            let Some(relation) = n.view_type.attributes[attr].relation().cloned() else {
                continue;
            };
            let children = n.values[attr].referenced_nodes();
            for child in children {
                self.check_adoptable(node, attr, child, &relation)?;
                // Load-time linking never flags owners; the linkage is the
                // persisted state.
                self.adopt(node, attr, child, &relation, false);
            }
        }
        Ok(())
    }

    fn check_target_type(&self, child: NodeId, relation: &RelationDef) -> Result<()> {
        let c = self.node(child)?;
        if c.view_type.name != relation.target {
            return Err(ViewError::TypeMismatch(format!(
                "expected a '{}' view, got '{}'",
                relation.target, c.view_type.name
            )));
        }
        Ok(())
    }

    fn check_adoptable(
        &self,
        parent: NodeId,
        attr: AttributeIndex,
        child: NodeId,
        relation: &RelationDef,
    ) -> Result<()> {
        self.check_target_type(child, relation)?;
        if relation.owned {
            let c = self.node(child)?;
            if let Some(existing) = c.parent {
                if existing != (parent, attr) {
                    return Err(ViewError::StructuralViolation(format!(
                        "{} already has an owning parent",
                        child
                    )));
                }
            }
        }
        Ok(())
    }

    fn adopt(
        &mut self,
        parent: NodeId,
        attr: AttributeIndex,
        child: NodeId,
        relation: &RelationDef,
        flag_owner: bool,
    ) {
        let c = &mut self.nodes[child.index()];
        if relation.owned {
            let moved = c.parent != Some((parent, attr));
            c.parent = Some((parent, attr));
            // A persisted child moved under a child-side link must carry
            // its new owner to the provider even when none of its own
            // columns are dirty.
            if flag_owner
                && moved
                && !c.is_new
                && relation.ownership != RelationOwnership::ParentColumn
            {
                c.owner_changed = true;
            }
        } else {
            c.read_only_parents.push((parent, attr));
        }
    }

    fn release(&mut self, parent: NodeId, attr: AttributeIndex, child: NodeId, owned: bool) {
        let c = &mut self.nodes[child.index()];
        if owned {
            if c.parent == Some((parent, attr)) {
                c.parent = None;
            }
        } else if let Some(position) = c
            .read_only_parents
            .iter()
            .position(|entry| *entry == (parent, attr))
        {
            c.read_only_parents.remove(position);
        }
    }

    fn edge_relation(
        &self,
        node: NodeId,
        attr: AttributeIndex,
        plural: bool,
    ) -> Result<RelationDef> {
        let n = self.node(node)?;
        let def = Self::attr_def(&n.view_type, attr)?;
        match (&def.kind, plural) {
            (AttributeKind::Reference { relation }, false)
            | (AttributeKind::Collection { relation }, true) => Ok(relation.clone()),
            _ => Err(ViewError::TypeMismatch(format!(
                "attribute '{}' of '{}' is not a {} view edge",
                def.name,
                n.view_type.name,
                if plural { "plural" } else { "singular" }
            ))),
        }
    }

    fn attr_def<'a>(
        view_type: &'a Arc<ViewType>,
        attr: AttributeIndex,
    ) -> Result<&'a crate::metamodel::AttributeDef> {
        view_type
            .attr(attr)
            .ok_or_else(|| Self::out_of_range(view_type, attr))
    }

    fn out_of_range(view_type: &Arc<ViewType>, attr: AttributeIndex) -> ViewError {
        ViewError::AttributeOutOfRange {
            view_type: view_type.name.clone(),
            index: attr,
        }
    }

    fn mark_and_propagate(&mut self, node: NodeId, attr: AttributeIndex) {
        let n = &mut self.nodes[node.index()];
        if n.is_reference {
            return;
        }
        n.dirty.mark(attr);
        self.propagate_dirty(node);
    }

    /// Climb the owning parent chain marking the traversed attribute bit,
    /// stopping once an ancestor already has it. Read-only parents are
    /// never climbed. Reference ancestors are climbed through without
    /// marking.
    fn propagate_dirty(&mut self, from: NodeId) {
        let mut visited = vec![from];
        let mut current = from;
        while let Some((parent, attr)) = self.nodes[current.index()].parent {
            if visited.contains(&parent) {
                break;
            }
            visited.push(parent);
            let p = &mut self.nodes[parent.index()];
            if !p.is_reference {
                if p.dirty.is_bit_set(attr) {
                    break;
                }
                p.dirty.mark(attr);
            }
            current = parent;
        }
    }

    /// Does this attribute belong on the node's own row? Basic attributes
    /// always do; view edges only when the parent row carries the link.
    pub(crate) fn is_row_attr(view_type: &Arc<ViewType>, attr: AttributeIndex) -> bool {
        match view_type.attr(attr).map(|def| def.relation()) {
            Some(None) => true,
            Some(Some(relation)) => {
                relation.ownership == crate::metamodel::RelationOwnership::ParentColumn
            }
            None => false,
        }
    }

    /// Has the attribute's own slot changed relative to `initial`?
    /// For view edges this compares membership by persisted identity, not
    /// element content.
    fn edge_or_value_changed(
        &self,
        n: &ViewNode,
        attr: AttributeIndex,
        initial: &AttributeValue,
    ) -> bool {
        match (&n.values[attr], initial) {
            (AttributeValue::Basic(current), AttributeValue::Basic(init)) => current != init,
            (AttributeValue::BasicList(current), AttributeValue::BasicList(init)) => {
                current != init
            }
            (AttributeValue::View(current), AttributeValue::View(init)) => {
                self.singular_keys_differ(*current, *init)
            }
            (AttributeValue::ViewList(current), AttributeValue::ViewList(init)) => {
                self.list_keys_differ(current, init)
            }
            _ => true,
        }
    }

    fn singular_keys_differ(&self, current: Option<NodeId>, initial: Option<NodeId>) -> bool {
        match (current, initial) {
            (None, None) => false,
            (Some(c), Some(i)) => self.identity_key(c) != self.identity_key(i),
            _ => true,
        }
    }

    fn list_keys_differ(&self, current: &[NodeId], initial: &[NodeId]) -> bool {
        if current.len() != initial.len() {
            return true;
        }
        current
            .iter()
            .zip(initial)
            .any(|(c, i)| self.identity_key(*c) != self.identity_key(*i))
    }

    fn effective_attr_dirty(
        &self,
        node: NodeId,
        attr: AttributeIndex,
        visited: &mut HashSet<NodeId>,
    ) -> bool {
        let n = &self.nodes[node.index()];
        if n.is_reference || !n.dirty.is_bit_set(attr) {
            return false;
        }
        let Some(snapshot) = n.initial.as_ref() else {
            // No baseline to compare against: the raw bit decides.
            return true;
        };
        let initial = &snapshot[attr];
        if self.edge_or_value_changed(n, attr, initial) {
            return true;
        }
        // Membership unchanged; an owned view edge is still effectively
        // dirty when an element's subtree is. Read-only edges are never
        // descended.
        let owned = n
            .view_type
            .attr(attr)
            .and_then(|def| def.relation())
            .map(|relation| relation.owned)
            .unwrap_or(false);
        if !owned {
            return false;
        }
        match &n.values[attr] {
            AttributeValue::View(Some(child)) => self.subtree_dirty(*child, visited),
            AttributeValue::ViewList(children) => children
                .iter()
                .any(|child| self.subtree_dirty(*child, visited)),
            _ => false,
        }
    }
}

/// Diff key for collection elements: persisted identity when the element
/// has one, arena handle otherwise. Keying by persisted identity makes
/// "same record, different field values" a mutation rather than a
/// remove-plus-add.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ElementKey {
    Persisted(String, Value),
    Unpersisted(NodeId),
}
