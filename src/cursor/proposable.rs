//! Proposable calls answered from the mirrored table definition.

use crate::catalog::schema::TableSchema;
use crate::catalog::types::Row;
use crate::error::ProxyError;
use crate::remote::ProposableResult;

pub(crate) fn default_row(
    schema: &TableSchema,
    row: &Row,
    column: Option<&str>,
) -> Result<ProposableResult, ProxyError> {
    let mut row = row.clone();
    let changed = schema.fill_defaults(&mut row, column)?;
    Ok(ProposableResult { changed, row })
}

/// No column of a mirrored table has change handlers, so a local change
/// never alters the row.
pub(crate) fn change(
    schema: &TableSchema,
    new_row: &Row,
    column: Option<&str>,
) -> Result<ProposableResult, ProxyError> {
    if let Some(column) = column
        && schema.column_index(column).is_none()
    {
        return Err(ProxyError::UnknownColumn {
            table: schema.table_name.clone(),
            column: column.to_string(),
        });
    }
    Ok(ProposableResult {
        changed: false,
        row: new_row.clone(),
    })
}

pub(crate) fn validate(
    schema: &TableSchema,
    new_row: &Row,
    column: Option<&str>,
) -> Result<ProposableResult, ProxyError> {
    schema.check_row(new_row, column)?;
    Ok(ProposableResult {
        changed: false,
        row: new_row.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::{change, default_row, validate};
    use crate::catalog::schema::{ColumnDef, TableSchema};
    use crate::catalog::types::{ColumnType, Row, Value};
    use crate::error::ProxyErrorCode;

    fn schema() -> TableSchema {
        TableSchema {
            library: "Sales".into(),
            table_name: "Orders".into(),
            owner_id: None,
            columns: vec![
                ColumnDef::new("id", ColumnType::Integer, false),
                ColumnDef::new("status", ColumnType::Text, false)
                    .with_default(Value::from("open")),
            ],
            primary_key: vec!["id".into()],
        }
    }

    #[test]
    fn default_fills_requested_column_only() {
        let schema = schema();
        let row = schema.empty_row();
        let result = default_row(&schema, &row, Some("id")).expect("default");
        assert!(!result.changed);
        let result = default_row(&schema, &row, Some("status")).expect("default");
        assert!(result.changed);
        assert_eq!(result.row.values[1], Value::from("open"));
    }

    #[test]
    fn validate_and_change_leave_row_alone() {
        let schema = schema();
        let row = Row::from_values(vec![Value::from(1), Value::from("open")]);
        assert!(!validate(&schema, &row, None).expect("valid").changed);
        assert!(!change(&schema, &row, Some("status")).expect("change").changed);
        let err = change(&schema, &row, Some("nope")).expect_err("unknown");
        assert_eq!(err.code(), ProxyErrorCode::UnknownColumn);
    }
}
