use std::collections::HashMap;
use std::sync::Arc;

use crate::core::{Result, ViewError};

use super::attribute::RelationOwnership;
use super::view_type::ViewType;

/// Registered view shapes, consumed read-only by graphs and the flush
/// engine. Registration is cheap; [`validate`](Self::validate) runs the
/// cross-type checks and must pass before the metamodel is used.
#[derive(Debug, Default)]
pub struct ViewMetamodel {
    types: HashMap<String, Arc<ViewType>>,
}

impl ViewMetamodel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, mut view_type: ViewType) -> Result<()> {
        if self.types.contains_key(&view_type.name) {
            return Err(ViewError::StructuralViolation(format!(
                "view type '{}' is already registered",
                view_type.name
            )));
        }
        view_type.seal()?;
        self.types
            .insert(view_type.name.clone(), Arc::new(view_type));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<ViewType>> {
        self.types
            .get(name)
            .cloned()
            .ok_or_else(|| ViewError::UnknownViewType(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    pub fn type_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.types.keys().cloned().collect();
        names.sort();
        names
    }

    /// Cross-type checks: every relation target registered, orphan removal
    /// only on owned edges, and no ownership cycle in which every edge keeps
    /// its foreign key on the parent row. Such a cycle admits no write
    /// order, so it is rejected up front instead of failing mid-flush.
    pub fn validate(&self) -> Result<()> {
        for view_type in self.types.values() {
            for attr in &view_type.attributes {
                let Some(relation) = attr.relation() else {
                    continue;
                };
                if !self.types.contains_key(&relation.target) {
                    return Err(ViewError::StructuralViolation(format!(
                        "attribute '{}' of '{}' targets unregistered view type '{}'",
                        attr.name, view_type.name, relation.target
                    )));
                }
                if !relation.owned && relation.orphan_removal {
                    return Err(ViewError::StructuralViolation(format!(
                        "attribute '{}' of '{}' declares orphan removal on a read-only relation",
                        attr.name, view_type.name
                    )));
                }
            }
        }

        self.check_ownership_cycles()
    }

    fn check_ownership_cycles(&self) -> Result<()> {
        // Edges where the parent row carries the foreign key. A cycle made
        // solely of these forces every row to be written before the other.
        let mut edges: HashMap<&str, Vec<&str>> = HashMap::new();
        for view_type in self.types.values() {
            for attr in &view_type.attributes {
                if let Some(relation) = attr.owned_relation() {
                    if relation.ownership == RelationOwnership::ParentColumn {
                        edges
                            .entry(view_type.name.as_str())
                            .or_default()
                            .push(relation.target.as_str());
                    }
                }
            }
        }

        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            OnPath,
            Done,
        }

        let mut marks: HashMap<&str, Mark> = HashMap::new();
        let mut names: Vec<&str> = self.types.keys().map(String::as_str).collect();
        names.sort();

        for start in names {
            if marks.get(start).copied().unwrap_or(Mark::Unvisited) != Mark::Unvisited {
                continue;
            }
            // Iterative DFS; the second stack entry form pops the mark.
            let mut stack: Vec<(&str, bool)> = vec![(start, false)];
            while let Some((name, leaving)) = stack.pop() {
                if leaving {
                    marks.insert(name, Mark::Done);
                    continue;
                }
                match marks.get(name).copied().unwrap_or(Mark::Unvisited) {
                    Mark::OnPath => {
                        return Err(ViewError::StructuralViolation(format!(
                            "ownership cycle through '{}' holds every foreign key on the parent side",
                            name
                        )));
                    }
                    Mark::Done => continue,
                    Mark::Unvisited => {}
                }
                marks.insert(name, Mark::OnPath);
                stack.push((name, true));
                if let Some(targets) = edges.get(name) {
                    for target in targets {
                        match marks.get(target).copied().unwrap_or(Mark::Unvisited) {
                            Mark::OnPath => {
                                return Err(ViewError::StructuralViolation(format!(
                                    "ownership cycle through '{}' holds every foreign key on the parent side",
                                    target
                                )));
                            }
                            Mark::Done => {}
                            Mark::Unvisited => stack.push((target, false)),
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metamodel::attribute::{AttributeDef, RelationDef};

    fn simple_type(name: &str) -> ViewType {
        ViewType::new(name).attribute(AttributeDef::basic("label"))
    }

    #[test]
    fn test_register_and_get() {
        let mut mm = ViewMetamodel::new();
        mm.register(simple_type("Order")).unwrap();
        assert!(mm.contains("Order"));
        assert_eq!(mm.get("Order").unwrap().name, "Order");
        assert!(mm.get("Missing").is_err());
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut mm = ViewMetamodel::new();
        mm.register(simple_type("Order")).unwrap();
        assert!(mm.register(simple_type("Order")).is_err());
    }

    #[test]
    fn test_unknown_relation_target_rejected() {
        let mut mm = ViewMetamodel::new();
        mm.register(
            ViewType::new("Order")
                .attribute(AttributeDef::collection("items", RelationDef::owned("Item"))),
        )
        .unwrap();
        let err = mm.validate().unwrap_err();
        assert!(matches!(err, ViewError::StructuralViolation(_)));
    }

    #[test]
    fn test_parent_owned_cycle_rejected() {
        use crate::metamodel::attribute::RelationOwnership;

        let mut mm = ViewMetamodel::new();
        mm.register(ViewType::new("A").attribute(AttributeDef::reference(
            "b",
            RelationDef::owned("B").with_ownership(RelationOwnership::ParentColumn),
        )))
        .unwrap();
        mm.register(ViewType::new("B").attribute(AttributeDef::reference(
            "a",
            RelationDef::owned("A").with_ownership(RelationOwnership::ParentColumn),
        )))
        .unwrap();
        assert!(mm.validate().is_err());
    }

    #[test]
    fn test_cycle_broken_by_child_owned_edge_accepted() {
        use crate::metamodel::attribute::RelationOwnership;

        let mut mm = ViewMetamodel::new();
        mm.register(ViewType::new("A").attribute(AttributeDef::reference(
            "b",
            RelationDef::owned("B").with_ownership(RelationOwnership::ParentColumn),
        )))
        .unwrap();
        mm.register(ViewType::new("B").attribute(AttributeDef::reference(
            "a",
            RelationDef::owned("A").with_ownership(RelationOwnership::ChildColumn),
        )))
        .unwrap();
        mm.validate().unwrap();
    }
}
