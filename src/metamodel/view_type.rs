use serde::{Deserialize, Serialize};

use crate::core::{AttributeIndex, Result, ViewError, ViewTypeName};
use crate::flush::FlushConfig;

use super::attribute::{AttributeDef, AttributeKind};

/// Declared shape of one view: its ordered attributes plus per-type flush
/// settings. Built with chained methods, then handed to
/// [`ViewMetamodel::register`](super::ViewMetamodel::register), which
/// resolves and checks it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewType {
    pub name: ViewTypeName,
    pub attributes: Vec<AttributeDef>,
    /// Attribute name designated as the optimistic version, resolved to an
    /// index during registration.
    version_attr: Option<String>,
    version_attribute: Option<AttributeIndex>,
    /// When false the type keeps no load-time snapshot: change reporting is
    /// unavailable and updates always rewrite the full row.
    pub tracks_initial_state: bool,
    /// Per-type override of the manager-wide flush configuration.
    pub flush: Option<FlushConfig>,
}

impl ViewType {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            attributes: Vec::new(),
            version_attr: None,
            version_attribute: None,
            tracks_initial_state: true,
            flush: None,
        }
    }

    pub fn attribute(mut self, def: AttributeDef) -> Self {
        self.attributes.push(def);
        self
    }

    /// Designate `attr_name` as the optimistic version attribute.
    pub fn versioned_by(mut self, attr_name: &str) -> Self {
        self.version_attr = Some(attr_name.to_string());
        self
    }

    pub fn without_initial_state(mut self) -> Self {
        self.tracks_initial_state = false;
        self
    }

    pub fn with_flush(mut self, config: FlushConfig) -> Self {
        self.flush = Some(config);
        self
    }

    pub fn attr_count(&self) -> usize {
        self.attributes.len()
    }

    pub fn attr(&self, index: AttributeIndex) -> Option<&AttributeDef> {
        self.attributes.get(index)
    }

    pub fn index_of(&self, name: &str) -> Option<AttributeIndex> {
        self.attributes.iter().position(|a| a.name == name)
    }

    pub fn version_attribute(&self) -> Option<AttributeIndex> {
        self.version_attribute
    }

    pub fn is_versioned(&self) -> bool {
        self.version_attribute.is_some()
    }

    /// Resolve the declared version attribute and check type-local rules.
    /// Called by the registry; not useful on its own.
    pub(super) fn seal(&mut self) -> Result<()> {
        for (i, attr) in self.attributes.iter().enumerate() {
            if self.attributes[..i].iter().any(|a| a.name == attr.name) {
                return Err(ViewError::StructuralViolation(format!(
                    "view type '{}' declares attribute '{}' twice",
                    self.name, attr.name
                )));
            }
        }

        if let Some(name) = &self.version_attr {
            let index = self.index_of(name).ok_or_else(|| {
                ViewError::StructuralViolation(format!(
                    "view type '{}' has no attribute '{}' to use as version",
                    self.name, name
                ))
            })?;
            let attr = &self.attributes[index];
            if !matches!(attr.kind, AttributeKind::Basic { .. }) {
                return Err(ViewError::StructuralViolation(format!(
                    "version attribute '{}' of '{}' must be a singular basic attribute",
                    name, self.name
                )));
            }
            self.version_attribute = Some(index);
        }

        Ok(())
    }
}
