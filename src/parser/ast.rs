//! AST wrapper types
//!
//! Re-exports sqlparser types with convenience methods

pub use sqlparser::ast::{
    BinaryOperator, DataType as SqlDataType, Expr as SqlExpr, FunctionArg, FunctionArgExpr,
    GroupByExpr, Ident, JoinConstraint, JoinOperator, ObjectName, OrderByExpr, Query, Select,
    SelectItem, SetExpr, Statement, TableAlias, TableFactor, TableWithJoins, UnaryOperator, Value,
};

/// Extension trait for ObjectName
pub trait ObjectNameExt {
    /// Dotted name as written, without quoting
    fn table_name(&self) -> String;

    /// Last part of the name
    fn base_name(&self) -> String;

    /// Schema part of a two-part name
    fn schema_name(&self) -> Option<String>;
}

impl ObjectNameExt for ObjectName {
    fn table_name(&self) -> String {
        self.0.iter().map(|i| i.value.clone()).collect::<Vec<_>>().join(".")
    }

    fn base_name(&self) -> String {
        self.0.last().map(|i| i.value.clone()).unwrap_or_default()
    }

    fn schema_name(&self) -> Option<String> {
        match self.0.len() {
            n if n >= 2 => Some(self.0[n - 2].value.clone()),
            _ => None,
        }
    }
}

/// Column names listed in `AS alias (c1, c2)`
pub fn alias_column_names(alias: &TableAlias) -> Vec<String> {
    alias
        .columns
        .iter()
        .map(|c| unquote(&c.to_string()))
        .collect()
}

/// Strip T-SQL bracket or double-quote delimiters from an identifier
pub fn unquote(name: &str) -> String {
    let trimmed = name.trim();
    let inner = trimmed
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .or_else(|| trimmed.strip_prefix('"').and_then(|s| s.strip_suffix('"')));
    inner.unwrap_or(trimmed).to_string()
}

/// Temporary tables are named with a leading `#`
pub fn is_temp_table_name(name: &str) -> bool {
    name.starts_with('#')
}

/// Text used to key the expression rewrite map
pub fn expr_key(expr: &SqlExpr) -> String {
    expr.to_string().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unquote() {
        assert_eq!(unquote("[my col]"), "my col");
        assert_eq!(unquote("\"x\""), "x");
        assert_eq!(unquote("plain"), "plain");
    }

    #[test]
    fn test_object_name_parts() {
        let name = ObjectName(vec![Ident::new("bin"), Ident::new("account")]);
        assert_eq!(name.table_name(), "bin.account");
        assert_eq!(name.base_name(), "account");
        assert_eq!(name.schema_name().as_deref(), Some("bin"));
    }
}
