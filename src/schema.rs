use std::collections::BTreeMap;

use crate::error::SyncError;
use crate::value::ColumnType;

/// The documented bound on parameters-per-statement the embedded engine
/// imposes; tables with more declared columns are rejected at define time.
pub const MAX_COLUMNS: usize = 999;

/// A table definition as passed to `defineTable`: name plus column -> type.
#[derive(Debug, Clone)]
pub struct TableDefinition {
    pub name: String,
    pub columns: BTreeMap<String, ColumnType>,
}

impl TableDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        TableDefinition {
            name: name.into(),
            columns: BTreeMap::new(),
        }
    }

    pub fn with_column(mut self, name: impl Into<String>, column_type: ColumnType) -> Self {
        self.columns.insert(name.into(), column_type);
        self
    }

    pub(crate) fn validate(&self) -> Result<(), SyncError> {
        if self.name.is_empty() {
            return Err(SyncError::validation("table name must not be empty"));
        }
        match self.columns.get("id") {
            None => {
                return Err(SyncError::validation("table definition must declare an 'id' column"))
            }
            Some(ColumnType::String) | Some(ColumnType::Integer) => {}
            Some(other) => {
                return Err(SyncError::validation(format!(
                    "id column must be string or integer, got {other:?}"
                )))
            }
        }
        if self.columns.len() > MAX_COLUMNS {
            return Err(SyncError::validation(format!(
                "table '{}' declares {} columns, exceeding the {} column limit",
                self.name,
                self.columns.len(),
                MAX_COLUMNS
            )));
        }
        Ok(())
    }

    pub fn column_type(&self, column: &str) -> Option<ColumnType> {
        self.columns.get(column).copied()
    }

    pub fn id_type(&self) -> ColumnType {
        self.columns
            .get("id")
            .copied()
            .expect("validated table definitions always declare id")
    }
}

/// In-memory schema of every defined table. The authoritative source of
/// column types used to serialize writes and deserialize reads; the
/// underlying store is never consulted for typing information.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    tables: BTreeMap<String, TableDefinition>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        SchemaRegistry::default()
    }

    /// Merge `def` into the registry: new columns are added, existing
    /// columns are left untouched (schemas are additive-only).
    pub(crate) fn merge(&mut self, def: TableDefinition) -> &TableDefinition {
        let entry = self
            .tables
            .entry(def.name.clone())
            .or_insert_with(|| TableDefinition::new(def.name.clone()));
        for (col, ty) in def.columns {
            entry.columns.entry(col).or_insert(ty);
        }
        entry
    }

    pub fn get(&self, table: &str) -> Option<&TableDefinition> {
        self.tables.get(table)
    }

    pub fn require(&self, table: &str) -> Result<&TableDefinition, SyncError> {
        self.get(table)
            .ok_or_else(|| SyncError::validation(format!("unknown table '{table}'")))
    }

    pub fn contains(&self, table: &str) -> bool {
        self.tables.contains_key(table)
    }
}
