//! Session state visible to a build
//!
//! The builder works on an immutable snapshot of the session's temporary
//! tables. `CREATE TABLE #t` and `DROP TABLE #t` produce new snapshots that
//! later statements of the same script see; the caller's snapshot is never
//! modified.

use crate::physical::ScanColumn;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Definition of a temporary table
#[derive(Debug, Clone, PartialEq)]
pub struct TempTable {
    pub name: String,
    pub columns: Vec<ScanColumn>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSnapshot {
    /// Lowercase name -> definition
    temp_tables: Arc<BTreeMap<String, TempTable>>,
}

impl SessionSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn temp_table(&self, name: &str) -> Option<&TempTable> {
        self.temp_tables.get(&name.to_lowercase())
    }

    pub fn temp_table_names(&self) -> Vec<String> {
        self.temp_tables.values().map(|t| t.name.clone()).collect()
    }

    pub fn with_temp_table(&self, table: TempTable) -> Self {
        let mut tables = (*self.temp_tables).clone();
        tables.insert(table.name.to_lowercase(), table);
        Self {
            temp_tables: Arc::new(tables),
        }
    }

    pub fn without_temp_table(&self, name: &str) -> Self {
        let mut tables = (*self.temp_tables).clone();
        tables.remove(&name.to_lowercase());
        Self {
            temp_tables: Arc::new(tables),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::datatypes::DataType;

    fn table(name: &str) -> TempTable {
        TempTable {
            name: name.to_string(),
            columns: vec![ScanColumn {
                name: "id".into(),
                data_type: DataType::Int32,
                nullable: true,
                collation: None,
            }],
        }
    }

    #[test]
    fn test_snapshots_are_independent() {
        let base = SessionSnapshot::new();
        let with = base.with_temp_table(table("#Work"));
        assert!(base.temp_table("#work").is_none());
        assert!(with.temp_table("#WORK").is_some());

        let without = with.without_temp_table("#work");
        assert!(without.temp_table("#work").is_none());
        assert!(with.temp_table("#work").is_some());
    }
}
