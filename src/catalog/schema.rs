use crate::catalog::types::{ColumnType, Row, Value};
use crate::error::ProxyError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub col_type: ColumnType,
    pub nullable: bool,
    #[serde(default)]
    pub default: Option<Value>,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, col_type: ColumnType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            col_type,
            nullable,
            default: None,
        }
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableSchema {
    pub library: String,
    pub table_name: String,
    #[serde(default)]
    pub owner_id: Option<String>,
    pub columns: Vec<ColumnDef>,
    pub primary_key: Vec<String>,
}

impl TableSchema {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn primary_key_indices(&self) -> Vec<usize> {
        self.primary_key
            .iter()
            .filter_map(|pk| self.column_index(pk))
            .collect()
    }

    pub fn key_of(&self, row: &Row) -> Row {
        Row::from_values(
            self.primary_key_indices()
                .into_iter()
                .map(|idx| row.get(idx).cloned().unwrap_or(Value::Null))
                .collect(),
        )
    }

    /// Checks types and nullability of every column, or only of `column`.
    pub fn check_row(&self, row: &Row, column: Option<&str>) -> Result<(), ProxyError> {
        self.check_shape(row)?;
        for idx in self.target_columns(column)? {
            let def = &self.columns[idx];
            let value = &row.values[idx];
            if value.is_null() {
                if !def.nullable {
                    return Err(ProxyError::NotNullViolation {
                        table: self.table_name.clone(),
                        column: def.name.clone(),
                    });
                }
                continue;
            }
            if !def.col_type.accepts(value) {
                return Err(ProxyError::TypeMismatch {
                    table: self.table_name.clone(),
                    column: def.name.clone(),
                    expected: def.col_type.to_string(),
                    actual: value.type_name().to_string(),
                });
            }
        }
        Ok(())
    }

    /// Replaces nulls with column defaults. Returns whether anything changed.
    pub fn fill_defaults(&self, row: &mut Row, column: Option<&str>) -> Result<bool, ProxyError> {
        self.check_shape(row)?;
        let mut changed = false;
        for idx in self.target_columns(column)? {
            if let Some(default) = &self.columns[idx].default
                && row.values[idx].is_null()
            {
                row.values[idx] = default.clone();
                changed = true;
            }
        }
        Ok(changed)
    }

    /// A row with every column null.
    pub fn empty_row(&self) -> Row {
        Row::from_values(vec![Value::Null; self.columns.len()])
    }

    fn check_shape(&self, row: &Row) -> Result<(), ProxyError> {
        if row.len() != self.columns.len() {
            return Err(ProxyError::Validation(format!(
                "row for {} has {} values, expected {}",
                self.table_name,
                row.len(),
                self.columns.len()
            )));
        }
        Ok(())
    }

    fn target_columns(&self, column: Option<&str>) -> Result<Vec<usize>, ProxyError> {
        match column {
            None => Ok((0..self.columns.len()).collect()),
            Some(name) => self
                .column_index(name)
                .map(|idx| vec![idx])
                .ok_or_else(|| ProxyError::UnknownColumn {
                    table: self.table_name.clone(),
                    column: name.to_string(),
                }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LibraryMeta {
    pub name: String,
    #[serde(default)]
    pub owner_id: Option<String>,
    pub created_at_micros: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserMeta {
    pub user_id: String,
    pub display_name: String,
    #[serde(default)]
    pub is_system: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum TableAlteration {
    AddColumn(ColumnDef),
    DropColumn { name: String },
    SetDefault { column: String, value: Option<Value> },
}

/// A named catalog object as held by a mirror or described by the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum CatalogObject {
    Library(LibraryMeta),
    Table(TableSchema),
    User(UserMeta),
}

impl CatalogObject {
    pub fn name(&self) -> &str {
        match self {
            CatalogObject::Library(lib) => &lib.name,
            CatalogObject::Table(table) => &table.table_name,
            CatalogObject::User(user) => &user.user_id,
        }
    }
}
