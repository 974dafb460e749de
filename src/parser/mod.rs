//! SQL Parser module
//!
//! Wraps sqlparser-rs (T-SQL dialect) and adds the batch-level control flow
//! statements sqlparser does not understand

mod ast;
mod script;

pub use ast::*;
pub use script::*;

use crate::error::{QueryError, Result};
use sqlparser::dialect::MsSqlDialect;
use sqlparser::parser::Parser;

/// Parse a single SQL statement into a Statement AST
pub fn parse_sql(sql: &str) -> Result<Statement> {
    let dialect = MsSqlDialect {};
    let mut statements = Parser::parse_sql(&dialect, sql)?;

    if statements.is_empty() {
        return Err(QueryError::Parse("Empty SQL statement".to_string()));
    }

    if statements.len() > 1 {
        return Err(QueryError::Parse(
            "Multiple statements not supported".to_string(),
        ));
    }

    Ok(statements.remove(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_select() {
        let stmt = parse_sql("SELECT TOP 10 name FROM account").unwrap();
        assert!(matches!(stmt, Statement::Query(_)));
    }

    #[test]
    fn test_parse_cross_apply() {
        let sql = "SELECT a.name, c.fullname FROM account a CROSS APPLY (SELECT TOP 1 * FROM contact c WHERE c.parentcustomerid = a.accountid) c";
        assert!(matches!(parse_sql(sql).unwrap(), Statement::Query(_)));
    }

    #[test]
    fn test_parse_error() {
        assert!(parse_sql("SELEC a FROM b").is_err());
    }
}
