pub mod delta;
pub mod resolver;
pub mod schema;
pub mod types;

use crate::catalog::schema::{
    CatalogObject, ColumnDef, LibraryMeta, TableAlteration, TableSchema, UserMeta,
};
use crate::error::{ProxyError, ResourceType};
use im::HashMap;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

pub const SYSTEM_LIBRARY: &str = "System";
pub const SYSTEM_USER_ID: &str = "System";
pub const ADMIN_USER_ID: &str = "Admin";

fn default_true() -> bool {
    true
}

/// Embedded catalog repository. On the client it only holds mirrored schema
/// objects; the loopback engine uses the same type as its authoritative copy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Catalog {
    pub libraries: HashMap<String, LibraryMeta>,
    pub tables: HashMap<String, TableSchema>,
    pub users: HashMap<String, UserMeta>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum DdlOperation {
    CreateLibrary {
        name: String,
        #[serde(default)]
        owner_id: Option<String>,
        #[serde(default = "default_true")]
        if_not_exists: bool,
    },
    DropLibrary {
        name: String,
        #[serde(default = "default_true")]
        if_exists: bool,
    },
    CreateTable {
        library: String,
        table_name: String,
        #[serde(default)]
        owner_id: Option<String>,
        #[serde(default)]
        if_not_exists: bool,
        columns: Vec<ColumnDef>,
        primary_key: Vec<String>,
    },
    AlterTable {
        table_name: String,
        alteration: TableAlteration,
    },
    DropTable {
        table_name: String,
        #[serde(default = "default_true")]
        if_exists: bool,
    },
    CreateUser {
        user_id: String,
        display_name: String,
        #[serde(default = "default_true")]
        if_not_exists: bool,
    },
    DropUser {
        user_id: String,
        #[serde(default = "default_true")]
        if_exists: bool,
    },
}

impl Default for Catalog {
    fn default() -> Self {
        Self::baseline()
    }
}

impl Catalog {
    /// Fixed objects every catalog starts with and a wipe re-seeds.
    pub fn baseline() -> Self {
        let mut libraries = HashMap::new();
        libraries.insert(
            SYSTEM_LIBRARY.to_string(),
            LibraryMeta {
                name: SYSTEM_LIBRARY.to_string(),
                owner_id: Some(SYSTEM_USER_ID.to_string()),
                created_at_micros: 0,
            },
        );
        let mut users = HashMap::new();
        for (user_id, display_name) in [(SYSTEM_USER_ID, "System User"), (ADMIN_USER_ID, "Admin")]
        {
            users.insert(
                user_id.to_string(),
                UserMeta {
                    user_id: user_id.to_string(),
                    display_name: display_name.to_string(),
                    is_system: true,
                },
            );
        }
        Self {
            libraries,
            tables: HashMap::new(),
            users,
        }
    }

    pub fn snapshot(&self) -> Self {
        self.clone()
    }

    pub fn is_baseline(&self) -> bool {
        *self == Self::baseline()
    }

    /// Number of objects beyond the baseline.
    pub fn mirrored_object_count(&self) -> usize {
        let baseline = Self::baseline();
        self.libraries.len() + self.tables.len() + self.users.len()
            - baseline.libraries.len()
            - baseline.users.len()
    }

    pub fn table(&self, table_name: &str) -> Option<&TableSchema> {
        self.tables.get(table_name)
    }

    pub fn user(&self, user_id: &str) -> Option<&UserMeta> {
        self.users.get(user_id)
    }

    pub fn object(&self, name: &str) -> Option<CatalogObject> {
        if let Some(table) = self.tables.get(name) {
            return Some(CatalogObject::Table(table.clone()));
        }
        if let Some(lib) = self.libraries.get(name) {
            return Some(CatalogObject::Library(lib.clone()));
        }
        self.users.get(name).cloned().map(CatalogObject::User)
    }

    /// DDL that recreates `table_name` (and its library) on an empty mirror.
    pub fn definition_ops(&self, table_name: &str) -> Result<Vec<DdlOperation>, ProxyError> {
        let Some(table) = self.tables.get(table_name) else {
            return Err(ProxyError::NotFound {
                resource_type: ResourceType::Table,
                resource_id: table_name.to_string(),
            });
        };
        let mut ops = Vec::with_capacity(2);
        if table.library != SYSTEM_LIBRARY {
            let owner_id = self
                .libraries
                .get(&table.library)
                .and_then(|lib| lib.owner_id.clone());
            ops.push(DdlOperation::CreateLibrary {
                name: table.library.clone(),
                owner_id,
                if_not_exists: true,
            });
        }
        ops.push(DdlOperation::CreateTable {
            library: table.library.clone(),
            table_name: table.table_name.clone(),
            owner_id: table.owner_id.clone(),
            if_not_exists: true,
            columns: table.columns.clone(),
            primary_key: table.primary_key.clone(),
        });
        Ok(ops)
    }

    pub fn apply_ddl(&mut self, op: DdlOperation) -> Result<(), ProxyError> {
        match op {
            DdlOperation::CreateLibrary {
                name,
                owner_id,
                if_not_exists,
            } => self.create_library(&name, owner_id, if_not_exists),
            DdlOperation::DropLibrary { name, if_exists } => self.drop_library(&name, if_exists),
            DdlOperation::CreateTable {
                library,
                table_name,
                owner_id,
                if_not_exists,
                columns,
                primary_key,
            } => self.create_table(
                &library,
                &table_name,
                owner_id,
                if_not_exists,
                columns,
                primary_key,
            ),
            DdlOperation::AlterTable {
                table_name,
                alteration,
            } => self.alter_table(&table_name, alteration),
            DdlOperation::DropTable {
                table_name,
                if_exists,
            } => self.drop_table(&table_name, if_exists),
            DdlOperation::CreateUser {
                user_id,
                display_name,
                if_not_exists,
            } => self.create_user(&user_id, &display_name, if_not_exists),
            DdlOperation::DropUser { user_id, if_exists } => self.drop_user(&user_id, if_exists),
        }
    }

    pub fn create_library(
        &mut self,
        name: &str,
        owner_id: Option<String>,
        if_not_exists: bool,
    ) -> Result<(), ProxyError> {
        validate_identifier(name, "library")?;
        if self.libraries.contains_key(name) {
            if if_not_exists {
                return Ok(());
            }
            return Err(ProxyError::AlreadyExists {
                resource_type: ResourceType::Library,
                resource_id: name.to_string(),
            });
        }
        self.libraries.insert(
            name.to_string(),
            LibraryMeta {
                name: name.to_string(),
                owner_id,
                created_at_micros: now_micros(),
            },
        );
        Ok(())
    }

    pub fn drop_library(&mut self, name: &str, if_exists: bool) -> Result<(), ProxyError> {
        if name == SYSTEM_LIBRARY {
            return Err(ProxyError::Validation(format!(
                "library {SYSTEM_LIBRARY} cannot be dropped"
            )));
        }
        if self.libraries.remove(name).is_none() {
            if if_exists {
                return Ok(());
            }
            return Err(ProxyError::NotFound {
                resource_type: ResourceType::Library,
                resource_id: name.to_string(),
            });
        }
        let owned: Vec<String> = self
            .tables
            .values()
            .filter(|t| t.library == name)
            .map(|t| t.table_name.clone())
            .collect();
        for table_name in owned {
            self.tables.remove(&table_name);
        }
        Ok(())
    }

    pub fn create_table(
        &mut self,
        library: &str,
        table_name: &str,
        owner_id: Option<String>,
        if_not_exists: bool,
        columns: Vec<ColumnDef>,
        primary_key: Vec<String>,
    ) -> Result<(), ProxyError> {
        validate_identifier(table_name, "table_name")?;
        if !self.libraries.contains_key(library) {
            return Err(ProxyError::NotFound {
                resource_type: ResourceType::Library,
                resource_id: library.to_string(),
            });
        }
        if self.tables.contains_key(table_name) {
            if if_not_exists {
                return Ok(());
            }
            return Err(ProxyError::AlreadyExists {
                resource_type: ResourceType::Table,
                resource_id: table_name.to_string(),
            });
        }
        if columns.is_empty() {
            return Err(ProxyError::Validation(
                "table needs at least one column".into(),
            ));
        }
        if primary_key.is_empty() {
            return Err(ProxyError::Validation("primary key required".into()));
        }
        for pk in &primary_key {
            if !columns.iter().any(|c| c.name == *pk) {
                return Err(ProxyError::Validation(format!(
                    "primary key column missing: {pk}"
                )));
            }
        }
        for column in &columns {
            if let Some(default) = &column.default
                && !column.col_type.accepts(default)
            {
                return Err(ProxyError::TypeMismatch {
                    table: table_name.to_string(),
                    column: column.name.clone(),
                    expected: column.col_type.to_string(),
                    actual: default.type_name().to_string(),
                });
            }
        }
        self.tables.insert(
            table_name.to_string(),
            TableSchema {
                library: library.to_string(),
                table_name: table_name.to_string(),
                owner_id,
                columns,
                primary_key,
            },
        );
        Ok(())
    }

    pub fn alter_table(
        &mut self,
        table_name: &str,
        alteration: TableAlteration,
    ) -> Result<(), ProxyError> {
        let Some(existing) = self.tables.get(table_name) else {
            return Err(ProxyError::NotFound {
                resource_type: ResourceType::Table,
                resource_id: table_name.to_string(),
            });
        };
        let mut table = existing.clone();
        match alteration {
            TableAlteration::AddColumn(column) => {
                validate_identifier(&column.name, "column")?;
                if table.column(&column.name).is_some() {
                    return Err(ProxyError::Validation(format!(
                        "column already exists: {}",
                        column.name
                    )));
                }
                table.columns.push(column);
            }
            TableAlteration::DropColumn { name } => {
                if table.primary_key.contains(&name) {
                    return Err(ProxyError::Validation(
                        "cannot drop primary key column".into(),
                    ));
                }
                let Some(idx) = table.column_index(&name) else {
                    return Err(ProxyError::UnknownColumn {
                        table: table_name.to_string(),
                        column: name,
                    });
                };
                table.columns.remove(idx);
            }
            TableAlteration::SetDefault { column, value } => {
                let Some(def) = table.columns.iter_mut().find(|c| c.name == column) else {
                    return Err(ProxyError::UnknownColumn {
                        table: table_name.to_string(),
                        column,
                    });
                };
                if let Some(v) = &value
                    && !def.col_type.accepts(v)
                {
                    return Err(ProxyError::TypeMismatch {
                        table: table_name.to_string(),
                        column,
                        expected: def.col_type.to_string(),
                        actual: v.type_name().to_string(),
                    });
                }
                def.default = value;
            }
        }
        self.tables.insert(table_name.to_string(), table);
        Ok(())
    }

    pub fn drop_table(&mut self, table_name: &str, if_exists: bool) -> Result<(), ProxyError> {
        if self.tables.remove(table_name).is_none() && !if_exists {
            return Err(ProxyError::NotFound {
                resource_type: ResourceType::Table,
                resource_id: table_name.to_string(),
            });
        }
        Ok(())
    }

    pub fn create_user(
        &mut self,
        user_id: &str,
        display_name: &str,
        if_not_exists: bool,
    ) -> Result<(), ProxyError> {
        validate_identifier(user_id, "user_id")?;
        if self.users.contains_key(user_id) {
            if if_not_exists {
                return Ok(());
            }
            return Err(ProxyError::AlreadyExists {
                resource_type: ResourceType::User,
                resource_id: user_id.to_string(),
            });
        }
        self.users.insert(
            user_id.to_string(),
            UserMeta {
                user_id: user_id.to_string(),
                display_name: display_name.to_string(),
                is_system: false,
            },
        );
        Ok(())
    }

    pub fn drop_user(&mut self, user_id: &str, if_exists: bool) -> Result<(), ProxyError> {
        if self.users.get(user_id).is_some_and(|u| u.is_system) {
            return Err(ProxyError::Validation(format!(
                "system user {user_id} cannot be dropped"
            )));
        }
        if self.users.remove(user_id).is_none() && !if_exists {
            return Err(ProxyError::NotFound {
                resource_type: ResourceType::User,
                resource_id: user_id.to_string(),
            });
        }
        Ok(())
    }
}

pub(crate) fn validate_identifier(value: &str, field: &str) -> Result<(), ProxyError> {
    if value.is_empty() || value.len() > 128 {
        return Err(ProxyError::Validation(format!(
            "{field} must be 1..=128 characters"
        )));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
    {
        return Err(ProxyError::Validation(format!(
            "{field} contains invalid characters: {value}"
        )));
    }
    Ok(())
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::{ADMIN_USER_ID, Catalog, DdlOperation, SYSTEM_LIBRARY};
    use crate::catalog::schema::{ColumnDef, TableAlteration};
    use crate::catalog::types::{ColumnType, Value};
    use crate::error::ProxyErrorCode;

    fn create_orders() -> DdlOperation {
        DdlOperation::CreateTable {
            library: "Sales".into(),
            table_name: "Orders".into(),
            owner_id: None,
            if_not_exists: false,
            columns: vec![
                ColumnDef::new("id", ColumnType::Integer, false),
                ColumnDef::new("status", ColumnType::Text, false)
                    .with_default(Value::from("open")),
            ],
            primary_key: vec!["id".into()],
        }
    }

    #[test]
    fn baseline_has_system_library_and_identities() {
        let catalog = Catalog::baseline();
        assert!(catalog.libraries.contains_key(SYSTEM_LIBRARY));
        assert!(catalog.user(ADMIN_USER_ID).is_some_and(|u| u.is_system));
        assert_eq!(catalog.mirrored_object_count(), 0);
        assert!(catalog.is_baseline());
    }

    #[test]
    fn table_requires_existing_library() {
        let mut catalog = Catalog::baseline();
        let err = catalog.apply_ddl(create_orders()).expect_err("no library");
        assert_eq!(err.code(), ProxyErrorCode::LibraryNotFound);

        catalog
            .apply_ddl(DdlOperation::CreateLibrary {
                name: "Sales".into(),
                owner_id: None,
                if_not_exists: false,
            })
            .expect("library");
        catalog.apply_ddl(create_orders()).expect("table");
        assert_eq!(catalog.mirrored_object_count(), 2);
    }

    #[test]
    fn definition_ops_recreate_table_on_empty_catalog() {
        let mut source = Catalog::baseline();
        source.create_library("Sales", None, false).expect("lib");
        source.apply_ddl(create_orders()).expect("table");

        let mut mirror = Catalog::baseline();
        for op in source.definition_ops("Orders").expect("ops") {
            mirror.apply_ddl(op).expect("apply");
        }
        assert_eq!(mirror.table("Orders"), source.table("Orders"));
    }

    #[test]
    fn set_default_rejects_mismatched_type() {
        let mut catalog = Catalog::baseline();
        catalog.create_library("Sales", None, false).expect("lib");
        catalog.apply_ddl(create_orders()).expect("table");
        let err = catalog
            .alter_table(
                "Orders",
                TableAlteration::SetDefault {
                    column: "id".into(),
                    value: Some(Value::from("x")),
                },
            )
            .expect_err("mismatch");
        assert_eq!(err.code(), ProxyErrorCode::TypeMismatch);
    }

    #[test]
    fn baseline_objects_cannot_be_dropped() {
        let mut catalog = Catalog::baseline();
        assert!(catalog.drop_library(SYSTEM_LIBRARY, true).is_err());
        assert!(catalog.drop_user(ADMIN_USER_ID, true).is_err());
        assert!(catalog.is_baseline());
    }
}
