use std::collections::HashMap;

use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use crate::core::{AttributeIndex, Value};

use super::{EntityStore, FlatValue, NodeState, OwnerRef, OwnerWrite, StoreError};

/// Stored form of one record.
#[derive(Debug, Clone, Serialize)]
pub struct StoredRow {
    pub id: Value,
    pub version: Option<Value>,
    pub fields: HashMap<String, FlatValue>,
    pub owner: Option<OwnerRef>,
}

/// One provider call, as observed by the store. The log keeps calls in
/// arrival order, which is what write-ordering assertions care about.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Insert {
        view_type: String,
        id: Value,
    },
    Update {
        view_type: String,
        id: Value,
        /// Names of the written attributes; `None` means the full row.
        attributes: Option<Vec<String>>,
    },
    Remove {
        view_type: String,
        id: Value,
    },
}

/// Table-per-view-type reference store. Not transactional: rows mutate as
/// calls arrive, and undoing them on rollback is the surrounding
/// transaction's concern, not this store's. Serves the test suite and
/// documents the adapter contract.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: HashMap<String, HashMap<Value, StoredRow>>,
    log: Vec<WriteOp>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn row(&self, view_type: &str, id: &Value) -> Option<&StoredRow> {
        self.tables.get(view_type).and_then(|table| table.get(id))
    }

    /// Rows of one table, sorted by id for deterministic assertions.
    pub fn rows(&self, view_type: &str) -> Vec<&StoredRow> {
        let mut rows: Vec<&StoredRow> = self
            .tables
            .get(view_type)
            .map(|table| table.values().collect())
            .unwrap_or_default();
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        rows
    }

    pub fn row_count(&self, view_type: &str) -> usize {
        self.tables.get(view_type).map(|table| table.len()).unwrap_or(0)
    }

    pub fn write_log(&self) -> &[WriteOp] {
        &self.log
    }

    pub fn clear_log(&mut self) {
        self.log.clear();
    }

    /// Whole-store snapshot for diagnostics.
    pub fn export_json(&self) -> serde_json::Value {
        let mut tables = serde_json::Map::new();
        let mut names: Vec<&String> = self.tables.keys().collect();
        names.sort();
        for name in names {
            let rows: Vec<serde_json::Value> = self
                .rows(name)
                .into_iter()
                .map(|row| json!(row))
                .collect();
            tables.insert(name.clone(), serde_json::Value::Array(rows));
        }
        serde_json::Value::Object(tables)
    }

    fn version_of(state: &NodeState) -> Option<Value> {
        let name = state.version_attribute.as_deref()?;
        match state.attribute(name) {
            Some(FlatValue::Basic(value)) => Some(value.clone()),
            _ => None,
        }
    }
}

impl EntityStore for InMemoryStore {
    fn insert(&mut self, state: &NodeState) -> std::result::Result<Value, StoreError> {
        let id = state
            .id
            .clone()
            .unwrap_or_else(|| Value::Uuid(Uuid::new_v4()));
        let table = self.tables.entry(state.view_type.clone()).or_default();
        if table.contains_key(&id) {
            return Err(StoreError::Rejected(format!(
                "duplicate id {} in '{}'",
                id, state.view_type
            )));
        }

        let mut fields = HashMap::new();
        for slot in &state.attributes {
            fields.insert(slot.name.clone(), slot.value.clone());
        }
        table.insert(
            id.clone(),
            StoredRow {
                id: id.clone(),
                version: Self::version_of(state),
                fields,
                owner: match &state.owner {
                    OwnerWrite::Assign(owner) => Some(owner.clone()),
                    _ => None,
                },
            },
        );
        self.log.push(WriteOp::Insert {
            view_type: state.view_type.clone(),
            id: id.clone(),
        });
        Ok(id)
    }

    fn update(
        &mut self,
        state: &NodeState,
        dirty: Option<&[AttributeIndex]>,
    ) -> std::result::Result<(), StoreError> {
        let id = state.id.clone().ok_or_else(|| {
            StoreError::Rejected(format!("update of '{}' without an id", state.view_type))
        })?;
        let row = self
            .tables
            .get_mut(&state.view_type)
            .and_then(|table| table.get_mut(&id));

        let Some(row) = row else {
            // A guarded update of a vanished row is a stale-version case.
            return match &state.version_guard {
                Some(_) => Err(StoreError::VersionConflict {
                    view_type: state.view_type.clone(),
                    id: id.to_string(),
                }),
                None => Err(StoreError::NotFound(state.view_type.clone(), id.to_string())),
            };
        };

        if let Some(guard) = &state.version_guard {
            if row.version.as_ref() != Some(guard) {
                return Err(StoreError::VersionConflict {
                    view_type: state.view_type.clone(),
                    id: id.to_string(),
                });
            }
        }

        let written: Vec<&super::AttributeSlot> = match dirty {
            Some(indexes) => indexes
                .iter()
                .filter_map(|i| state.attributes.get(*i))
                .collect(),
            None => state.attributes.iter().collect(),
        };
        for slot in &written {
            row.fields.insert(slot.name.clone(), slot.value.clone());
        }
        match &state.owner {
            OwnerWrite::Unchanged => {}
            OwnerWrite::Assign(owner) => row.owner = Some(owner.clone()),
            OwnerWrite::Clear => row.owner = None,
        }
        if let Some(version) = Self::version_of(state) {
            // Only adopt the new version when its slot was written.
            let version_written = state.version_attribute.as_deref().is_some_and(|name| {
                written.iter().any(|slot| slot.name == name)
            });
            if version_written {
                row.version = Some(version);
            }
        }

        self.log.push(WriteOp::Update {
            view_type: state.view_type.clone(),
            id,
            attributes: dirty
                .map(|indexes| {
                    indexes
                        .iter()
                        .filter_map(|i| state.attributes.get(*i))
                        .map(|slot| slot.name.clone())
                        .collect()
                }),
        });
        Ok(())
    }

    fn remove(
        &mut self,
        view_type: &str,
        id: &Value,
        guard: Option<&Value>,
    ) -> std::result::Result<(), StoreError> {
        let row = self
            .tables
            .get_mut(view_type)
            .and_then(|table| table.get(id).cloned());

        match (row, guard) {
            (None, None) => {
                // The call still happened; keep it in the log.
                self.log.push(WriteOp::Remove {
                    view_type: view_type.to_string(),
                    id: id.clone(),
                });
                return Ok(());
            }
            (None, Some(_)) => {
                return Err(StoreError::VersionConflict {
                    view_type: view_type.to_string(),
                    id: id.to_string(),
                });
            }
            (Some(row), Some(guard)) if row.version.as_ref() != Some(guard) => {
                return Err(StoreError::VersionConflict {
                    view_type: view_type.to_string(),
                    id: id.to_string(),
                });
            }
            _ => {}
        }

        if let Some(table) = self.tables.get_mut(view_type) {
            table.remove(id);
        }
        self.log.push(WriteOp::Remove {
            view_type: view_type.to_string(),
            id: id.clone(),
        });
        Ok(())
    }
}
