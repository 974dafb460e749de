//! Plan builder
//!
//! Walks parsed T-SQL and produces one plan root per top-level statement.
//! Each query is bound bottom-up: FROM sources are lowered to leaf
//! operators and joined, subqueries are decorrelated into joins that define
//! stand-in columns, aggregates and window functions are lowered to their
//! operator pipelines, and finally the output columns are computed. The
//! syntax tree is never modified; expressions replaced by a lowering step are
//! recorded in the scope's rewrite map and picked up when binding.

mod aggregate;
mod cte;
mod expr;
mod from;
mod join;
mod query;
mod scope;
mod statement;
mod subquery;
mod window;

use crate::config::{BuildOptions, QueryHints};
use crate::error::{QueryError, Result};
use crate::metastore::MetadataCatalog;
use crate::optimizer::RowEstimator;
use crate::parser::parse_script;
use crate::physical::{PlanRoot, SpoolId};
use crate::planner::Expr;
use crate::session::SessionSnapshot;
use arrow::datatypes::DataType as ArrowDataType;
use std::collections::HashMap;
use std::rc::Rc;
use tracing::debug;

pub(crate) use cte::{CteDefinition, RecursiveReference};

/// Builds executable plans for T-SQL batches
pub struct PlanBuilder<'a> {
    catalog: &'a dyn MetadataCatalog,
    session: SessionSnapshot,
    options: BuildOptions,
}

impl<'a> PlanBuilder<'a> {
    pub fn new(catalog: &'a dyn MetadataCatalog, session: &SessionSnapshot) -> Self {
        Self {
            catalog,
            session: session.clone(),
            options: BuildOptions::default(),
        }
    }

    pub fn with_options(mut self, options: BuildOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &BuildOptions {
        &self.options
    }

    /// Build plan roots for every statement of `sql`
    ///
    /// `parameters` maps `@name` to the type of each value the host will
    /// supply. All errors found across independent statements and clauses
    /// are returned together.
    pub fn build(
        &self,
        sql: &str,
        parameters: &HashMap<String, ArrowDataType>,
    ) -> std::result::Result<Vec<PlanRoot>, Vec<QueryError>> {
        self.options.validate().map_err(|e| e.into_errors())?;
        let script = parse_script(sql).map_err(|e| e.into_errors())?;
        debug!(statements = script.len(), "building script");

        let mut ctx = BuildContext::new(self.catalog, &self.options, self.session.clone());
        for (name, data_type) in parameters {
            ctx.declare_variable(name, data_type.clone())
                .map_err(|e| e.into_errors())?;
        }
        ctx.assemble(&script)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Variable {
    pub name: String,
    pub data_type: ArrowDataType,
}

/// State shared by every statement of one build
pub(crate) struct BuildContext<'a> {
    catalog: &'a dyn MetadataCatalog,
    options: &'a BuildOptions,
    estimator: RowEstimator,
    session: SessionSnapshot,
    /// Lowercase name -> variable
    variables: HashMap<String, Variable>,
    /// Visible CTE definitions, innermost last
    ctes: Vec<Rc<CteDefinition>>,
    /// Recursive CTEs whose recursive members are being bound
    recursive_refs: Vec<RecursiveReference>,
    /// Hints of the statement being built
    hints: QueryHints,
    next_expr: usize,
    next_segment: usize,
    next_spool: SpoolId,
    next_label: usize,
    /// Nesting level of the query being bound, 1 for a statement's own query
    query_depth: usize,
}

impl<'a> BuildContext<'a> {
    fn new(
        catalog: &'a dyn MetadataCatalog,
        options: &'a BuildOptions,
        session: SessionSnapshot,
    ) -> Self {
        Self {
            catalog,
            options,
            estimator: RowEstimator::from_options(options),
            session,
            variables: HashMap::new(),
            ctes: vec![],
            recursive_refs: vec![],
            hints: QueryHints::default(),
            next_expr: 0,
            next_segment: 0,
            next_spool: 0,
            next_label: 0,
            query_depth: 0,
        }
    }

    /// Fresh name for a computed column
    pub(crate) fn next_expr_name(&mut self) -> String {
        self.next_expr += 1;
        format!("Expr{}", self.next_expr)
    }

    /// Fresh outer-reference parameter
    pub(crate) fn next_param(&mut self) -> String {
        format!("@{}", self.next_expr_name())
    }

    pub(crate) fn next_segment_name(&mut self) -> String {
        self.next_segment += 1;
        format!("Segment{}", self.next_segment)
    }

    pub(crate) fn next_spool_id(&mut self) -> SpoolId {
        self.next_spool += 1;
        self.next_spool
    }

    pub(crate) fn next_label_id(&mut self) -> usize {
        self.next_label += 1;
        self.next_label
    }

    pub(crate) fn declare_variable(&mut self, name: &str, data_type: ArrowDataType) -> Result<()> {
        let key = name.to_lowercase();
        if self.variables.contains_key(&key) {
            return Err(QueryError::Duplicate {
                kind: "variable",
                name: name.to_string(),
            });
        }
        self.variables.insert(
            key,
            Variable {
                name: name.to_string(),
                data_type,
            },
        );
        Ok(())
    }

    pub(crate) fn variable(&self, name: &str) -> Result<&Variable> {
        self.variables
            .get(&name.to_lowercase())
            .ok_or_else(|| QueryError::UndeclaredVariable(name.to_string()))
    }

    pub(crate) fn variable_expr(&self, name: &str) -> Result<Expr> {
        let var = self.variable(name)?;
        Ok(Expr::Variable {
            name: var.name.clone(),
            data_type: var.data_type.clone(),
        })
    }
}
