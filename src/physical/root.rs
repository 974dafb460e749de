//! Statement-level plan roots
//!
//! A build produces one `PlanRoot` per top-level statement. Control flow is
//! flattened into labels and jumps so a host can execute the roots as a
//! linear program.

use crate::physical::{PlanOperator, ScanColumn};
use crate::planner::{Column, PlanSchema};
use arrow::datatypes::{DataType as ArrowDataType, Field, Schema as ArrowSchema};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Position of a statement in the script text (1-based)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct SourceSpan {
    pub line: u64,
    pub column: u64,
}

impl SourceSpan {
    pub fn new(line: u64, column: u64) -> Self {
        Self { line, column }
    }
}

/// A named output column of a query
#[derive(Debug, Clone, PartialEq)]
pub struct OutputColumn {
    pub name: String,
    pub source: Column,
}

/// An operator tree plus the columns it returns, in order
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
    pub root: Arc<PlanOperator>,
    pub columns: Vec<OutputColumn>,
}

impl QueryPlan {
    pub fn new(root: Arc<PlanOperator>, columns: Vec<OutputColumn>) -> Self {
        Self { root, columns }
    }

    pub fn schema(&self) -> PlanSchema {
        self.root.schema()
    }

    /// Arrow schema of the returned columns, using output names
    pub fn output_schema(&self) -> ArrowSchema {
        let schema = self.root.schema();
        let fields: Vec<Field> = self
            .columns
            .iter()
            .map(|c| match schema.resolve_column(&c.source) {
                Ok((_, f)) => Field::new(c.name.clone(), f.data_type.clone(), f.nullable),
                Err(_) => Field::new(c.name.clone(), ArrowDataType::Null, true),
            })
            .collect();
        ArrowSchema::new(fields)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RootNode {
    /// Return rows to the client
    Select(QueryPlan),
    /// Create one record per source row
    Insert {
        entity: String,
        columns: Vec<String>,
        source: QueryPlan,
    },
    /// Source rows hold the primary key followed by one value per column
    Update {
        entity: String,
        primary_key: String,
        columns: Vec<String>,
        source: QueryPlan,
    },
    /// Source rows hold the primary key of each record to delete
    Delete {
        entity: String,
        primary_key: String,
        source: QueryPlan,
    },
    DeclareVariable {
        name: String,
        data_type: ArrowDataType,
        initial: Option<QueryPlan>,
    },
    AssignVariable {
        name: String,
        value: QueryPlan,
    },
    Print(QueryPlan),
    /// Raise an error built from (number, message, state)
    Throw(QueryPlan),
    /// Re-raise the error being handled by the enclosing CATCH block
    Rethrow,
    /// Jump when the condition evaluates to `jump_if`, NULL counting as false
    ConditionalGoto {
        condition: QueryPlan,
        label: String,
        jump_if: bool,
    },
    Goto(String),
    Label(String),
    BeginTry,
    EndTry,
    BeginCatch,
    EndCatch,
    Return,
    CreateTempTable {
        name: String,
        columns: Vec<ScanColumn>,
    },
    DropTempTable {
        name: String,
    },
}

impl RootNode {
    pub fn name(&self) -> &'static str {
        match self {
            RootNode::Select(_) => "SELECT",
            RootNode::Insert { .. } => "INSERT",
            RootNode::Update { .. } => "UPDATE",
            RootNode::Delete { .. } => "DELETE",
            RootNode::DeclareVariable { .. } => "DECLARE",
            RootNode::AssignVariable { .. } => "SET",
            RootNode::Print(_) => "PRINT",
            RootNode::Throw(_) => "THROW",
            RootNode::Rethrow => "RETHROW",
            RootNode::ConditionalGoto { .. } => "CONDITIONAL GOTO",
            RootNode::Goto(_) => "GOTO",
            RootNode::Label(_) => "LABEL",
            RootNode::BeginTry => "BEGIN TRY",
            RootNode::EndTry => "END TRY",
            RootNode::BeginCatch => "BEGIN CATCH",
            RootNode::EndCatch => "END CATCH",
            RootNode::Return => "RETURN",
            RootNode::CreateTempTable { .. } => "CREATE TABLE",
            RootNode::DropTempTable { .. } => "DROP TABLE",
        }
    }

    /// Query plans evaluated by this root
    pub fn plans(&self) -> Vec<&QueryPlan> {
        match self {
            RootNode::Select(plan) | RootNode::Print(plan) | RootNode::Throw(plan) => vec![plan],
            RootNode::Insert { source, .. }
            | RootNode::Update { source, .. }
            | RootNode::Delete { source, .. } => vec![source],
            RootNode::DeclareVariable { initial, .. } => initial.iter().collect(),
            RootNode::AssignVariable { value, .. } => vec![value],
            RootNode::ConditionalGoto { condition, .. } => vec![condition],
            _ => vec![],
        }
    }
}

/// One executable unit of a script
#[derive(Debug, Clone, PartialEq)]
pub struct PlanRoot {
    pub node: RootNode,
    pub span: SourceSpan,
    /// Variables and parameters read or written
    pub variables: BTreeSet<String>,
}

impl PlanRoot {
    pub fn new(node: RootNode, span: SourceSpan) -> Self {
        let mut variables: BTreeSet<String> = node
            .plans()
            .into_iter()
            .flat_map(|p| p.root.variables())
            .collect();
        match &node {
            RootNode::DeclareVariable { name, .. } | RootNode::AssignVariable { name, .. } => {
                variables.insert(name.clone());
            }
            _ => {}
        }
        Self {
            node,
            span,
            variables,
        }
    }

    pub fn plan(&self) -> Option<&QueryPlan> {
        self.node.plans().into_iter().next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physical::{ComputeScalarNode, ConstantRowNode, DefinedValue};
    use crate::planner::Expr;

    fn scalar_plan(expr: Expr) -> QueryPlan {
        let root = PlanOperator::ComputeScalar(ComputeScalarNode {
            input: Arc::new(PlanOperator::ConstantRow(ConstantRowNode {
                columns: vec![],
                rows: vec![vec![]],
            })),
            values: vec![DefinedValue::new("Expr1", expr, ArrowDataType::Int32)],
        });
        QueryPlan::new(
            Arc::new(root),
            vec![OutputColumn {
                name: "Expr1".into(),
                source: Column::new("Expr1"),
            }],
        )
    }

    #[test]
    fn test_root_collects_variables() {
        let value = scalar_plan(Expr::Variable {
            name: "@y".into(),
            data_type: ArrowDataType::Int32,
        });
        let root = PlanRoot::new(
            RootNode::AssignVariable {
                name: "@x".into(),
                value,
            },
            SourceSpan::new(1, 1),
        );
        let vars: Vec<&str> = root.variables.iter().map(|s| s.as_str()).collect();
        assert_eq!(vars, vec!["@x", "@y"]);
    }

    #[test]
    fn test_output_schema_uses_output_names() {
        let plan = scalar_plan(Expr::int(1));
        let schema = plan.output_schema();
        assert_eq!(schema.field(0).name(), "Expr1");
        assert_eq!(schema.field(0).data_type(), &ArrowDataType::Int32);
    }
}
