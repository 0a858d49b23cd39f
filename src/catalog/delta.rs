//! Catalog deltas as shipped by the server: one JSON-encoded [`DdlOperation`]
//! per line. Blank lines are ignored so an empty script is a no-op.

use crate::catalog::{Catalog, DdlOperation};
use crate::error::ProxyError;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaScript(String);

impl DeltaScript {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn empty() -> Self {
        Self(String::new())
    }

    pub fn from_ops(ops: &[DdlOperation]) -> Result<Self, ProxyError> {
        let mut text = String::new();
        for op in ops {
            let line = serde_json::to_string(op).map_err(|e| ProxyError::Encode(e.to_string()))?;
            text.push_str(&line);
            text.push('\n');
        }
        Ok(Self(text))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }

    pub fn parse(&self) -> Result<Vec<DdlOperation>, ProxyError> {
        self.0
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(idx, line)| {
                serde_json::from_str(line)
                    .map_err(|e| ProxyError::Decode(format!("delta line {}: {e}", idx + 1)))
            })
            .collect()
    }

    /// Applies every operation or none: the catalog is only replaced once the
    /// whole script succeeded against a scratch copy.
    pub fn apply_to(&self, catalog: &mut Catalog) -> Result<usize, ProxyError> {
        if self.is_empty() {
            return Ok(0);
        }
        let ops = self.parse()?;
        let applied = ops.len();
        let mut scratch = catalog.snapshot();
        for op in ops {
            scratch.apply_ddl(op)?;
        }
        *catalog = scratch;
        Ok(applied)
    }
}

impl fmt::Display for DeltaScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::DeltaScript;
    use crate::catalog::schema::ColumnDef;
    use crate::catalog::types::ColumnType;
    use crate::catalog::{Catalog, DdlOperation};
    use crate::error::ProxyErrorCode;

    fn library(name: &str) -> DdlOperation {
        DdlOperation::CreateLibrary {
            name: name.into(),
            owner_id: None,
            if_not_exists: false,
        }
    }

    #[test]
    fn empty_script_is_noop() {
        let mut catalog = Catalog::baseline();
        assert_eq!(DeltaScript::empty().apply_to(&mut catalog).expect("noop"), 0);
        assert_eq!(
            DeltaScript::new("\n  \n").apply_to(&mut catalog).expect("noop"),
            0
        );
        assert!(catalog.is_baseline());
    }

    #[test]
    fn script_applies_in_line_order() {
        let script = DeltaScript::from_ops(&[
            library("Sales"),
            DdlOperation::CreateTable {
                library: "Sales".into(),
                table_name: "Orders".into(),
                owner_id: None,
                if_not_exists: false,
                columns: vec![ColumnDef::new("id", ColumnType::Integer, false)],
                primary_key: vec!["id".into()],
            },
        ])
        .expect("encode");
        let mut catalog = Catalog::baseline();
        assert_eq!(script.apply_to(&mut catalog).expect("apply"), 2);
        assert!(catalog.table("Orders").is_some());
    }

    #[test]
    fn failing_script_leaves_catalog_untouched() {
        let script =
            DeltaScript::from_ops(&[library("Sales"), library("Sales")]).expect("encode");
        let mut catalog = Catalog::baseline();
        let err = script.apply_to(&mut catalog).expect_err("duplicate");
        assert_eq!(err.code(), ProxyErrorCode::LibraryAlreadyExists);
        assert!(catalog.is_baseline());
    }

    #[test]
    fn malformed_line_reports_its_position() {
        let script = DeltaScript::new("{\"DropTable\":{\"table_name\":\"t\"}}\nnot json\n");
        let err = script.parse().expect_err("bad line");
        assert!(err.to_string().contains("delta line 2"), "{err}");
    }
}
