//! Common table expressions
//!
//! A CTE is bound afresh at every reference, against the CTEs visible where
//! it was defined. A recursive CTE expands to a stack spool over the
//! concatenation of its anchor and recursive members; the recursive step
//! reads the rows pushed so far through a spool consumer and re-runs the
//! recursive members once per row, with that row's columns bound as
//! parameters.

use super::query::BoundQuery;
use super::BuildContext;
use crate::error::{QueryError, Result};
use crate::parser::{alias_column_names, ObjectNameExt, Query, SetExpr, TableFactor, TableWithJoins};
use crate::physical::{
    AssertNode, ComputeScalarNode, ConcatColumn, ConcatenateNode, ConstantColumn, ConstantRowNode,
    DefinedValue, JoinNode, JoinOutput, JoinStrategy, JoinType, OuterReferenceBinding,
    OutputColumn, PlanOperator, QueryPlan, SpoolConsumerNode, SpoolKind, SpoolMode, SpoolNode,
};
use crate::planner::{sql_type_name, Column, Expr, PlanSchema, SchemaField};
use arrow::datatypes::DataType as ArrowDataType;
use sqlparser::ast::{SetOperator, SetQuantifier, With};
use std::collections::HashSet;
use std::rc::Rc;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug)]
pub(crate) struct CteDefinition {
    pub name: String,
    /// Explicit column names, empty to use the query's own
    pub columns: Vec<String>,
    pub query: Box<Query>,
    /// CTEs in scope at the definition
    pub visible: Vec<Rc<CteDefinition>>,
}

#[derive(Debug, Clone)]
pub(crate) struct RecursiveColumn {
    pub name: String,
    pub data_type: ArrowDataType,
    pub nullable: bool,
    pub param: String,
}

/// A recursive CTE read from inside its own recursive members
#[derive(Debug, Clone)]
pub(crate) struct RecursiveReference {
    pub name: String,
    pub columns: Vec<RecursiveColumn>,
}

fn factor_references(factor: &TableFactor, name: &str) -> bool {
    match factor {
        TableFactor::Table { name: table, .. } => {
            table.0.len() == 1 && table.base_name().eq_ignore_ascii_case(name)
        }
        TableFactor::Derived { subquery, .. } => query_references(subquery, name),
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => from_references(std::slice::from_ref(table_with_joins.as_ref()), name),
        _ => false,
    }
}

fn from_references(from: &[TableWithJoins], name: &str) -> bool {
    from.iter().any(|t| {
        factor_references(&t.relation, name) || t.joins.iter().any(|j| factor_references(&j.relation, name))
    })
}

fn set_expr_references(body: &SetExpr, name: &str) -> bool {
    match body {
        SetExpr::Select(select) => from_references(&select.from, name),
        SetExpr::Query(query) => query_references(query, name),
        SetExpr::SetOperation { left, right, .. } => {
            set_expr_references(left, name) || set_expr_references(right, name)
        }
        _ => false,
    }
}

fn query_references(query: &Query, name: &str) -> bool {
    set_expr_references(&query.body, name)
}

/// Members of a UNION chain with the quantifier joining each to the previous one
pub(crate) fn flatten_union<'q>(body: &'q SetExpr, out: &mut Vec<(&'q SetExpr, Option<SetQuantifier>)>) {
    match body {
        SetExpr::SetOperation {
            op: SetOperator::Union,
            set_quantifier,
            left,
            right,
        } => {
            flatten_union(left, out);
            let start = out.len();
            flatten_union(right, out);
            if let Some(first) = out.get_mut(start) {
                first.1 = Some(*set_quantifier);
            }
        }
        other => out.push((other, None)),
    }
}

pub(crate) fn is_union_all(quantifier: Option<SetQuantifier>) -> bool {
    matches!(quantifier, Some(SetQuantifier::All))
}

fn concat_schema(columns: &[ConcatColumn]) -> PlanSchema {
    PlanSchema::new(
        columns
            .iter()
            .map(|c| {
                SchemaField::new(c.name.clone(), c.data_type.clone())
                    .with_nullable(c.nullable)
                    .with_calculated(true)
                    .with_visible(c.visible)
            })
            .collect(),
    )
}

impl BuildContext<'_> {
    /// Make the CTEs of a WITH clause visible to the rest of the query
    pub(crate) fn register_ctes(&mut self, with: &With) -> Result<()> {
        let mut names = HashSet::new();
        for cte in &with.cte_tables {
            let name = cte.alias.name.value.clone();
            if !names.insert(name.to_lowercase()) {
                return Err(QueryError::Duplicate { kind: "CTE", name });
            }
            let columns = alias_column_names(&cte.alias);
            let mut seen = HashSet::new();
            for column in &columns {
                if !seen.insert(column.to_lowercase()) {
                    return Err(QueryError::Semantic(format!(
                        "The column '{}' was specified multiple times for '{}'",
                        column, name
                    )));
                }
            }
            let definition = CteDefinition {
                name,
                columns,
                query: cte.query.clone(),
                visible: self.ctes.clone(),
            };
            self.ctes.push(Rc::new(definition));
        }
        Ok(())
    }

    pub(crate) fn find_cte(&self, name: &str) -> Option<Rc<CteDefinition>> {
        self.ctes
            .iter()
            .rev()
            .find(|c| c.name.eq_ignore_ascii_case(name))
            .cloned()
    }

    pub(crate) fn recursive_reference(&self, name: &str) -> Option<RecursiveReference> {
        self.recursive_refs
            .iter()
            .rev()
            .find(|r| r.name.eq_ignore_ascii_case(name))
            .cloned()
    }

    /// The current row of a recursive CTE, as a single row of parameters
    pub(crate) fn bind_recursive_reference(&self, reference: &RecursiveReference) -> QueryPlan {
        let node = ConstantRowNode {
            columns: reference
                .columns
                .iter()
                .map(|c| ConstantColumn {
                    name: c.name.clone(),
                    data_type: c.data_type.clone(),
                    nullable: c.nullable,
                })
                .collect(),
            rows: vec![reference
                .columns
                .iter()
                .map(|c| Expr::OuterReference {
                    param: c.param.clone(),
                    data_type: c.data_type.clone(),
                })
                .collect()],
        };
        let columns = reference
            .columns
            .iter()
            .map(|c| OutputColumn {
                name: c.name.clone(),
                source: Column::new(c.name.clone()),
            })
            .collect();
        QueryPlan::new(Arc::new(PlanOperator::ConstantRow(node)), columns)
    }

    /// Bind a CTE reference against the CTEs visible at its definition
    pub(crate) fn bind_cte(&mut self, definition: &Rc<CteDefinition>) -> Result<QueryPlan> {
        let saved = std::mem::replace(&mut self.ctes, definition.visible.clone());
        let result = if query_references(&definition.query, &definition.name) {
            self.bind_recursive_cte(definition)
        } else {
            self.bind_query(&definition.query, None).map(|b| b.plan)
        };
        self.ctes = saved;
        result
    }

    fn bind_recursive_cte(&mut self, definition: &CteDefinition) -> Result<QueryPlan> {
        let name = &definition.name;
        let query = &definition.query;
        if query.with.is_some() || query.order_by.is_some() || query.offset.is_some() || query.fetch.is_some() {
            return Err(QueryError::not_supported(format!(
                "WITH, ORDER BY or OFFSET in recursive common table expression '{}'",
                name
            )));
        }

        let mut members = vec![];
        flatten_union(&query.body, &mut members);
        let mut anchors = vec![];
        let mut recursive = vec![];
        for (member, quantifier) in &members {
            if set_expr_references(member, name) {
                if !is_union_all(*quantifier) {
                    return Err(QueryError::Semantic(format!(
                        "Recursive common table expression '{}' does not contain a top-level UNION ALL operator.",
                        name
                    )));
                }
                recursive.push(*member);
            } else if !recursive.is_empty() {
                return Err(QueryError::Semantic(format!(
                    "The anchor members of recursive common table expression '{}' must come before its recursive members.",
                    name
                )));
            } else {
                anchors.push((*member, *quantifier));
            }
        }
        if anchors.is_empty() {
            return Err(QueryError::Semantic(format!(
                "No anchor member was specified for recursive query '{}'.",
                name
            )));
        }

        let distinct_anchors = anchors.iter().skip(1).any(|(_, q)| !is_union_all(*q));
        let mut anchor_plans = Vec::with_capacity(anchors.len());
        for (member, _) in &anchors {
            anchor_plans.push(self.bind_set_expr(member, None)?.plan);
        }
        let anchor = if anchor_plans.len() == 1 {
            anchor_plans.remove(0)
        } else {
            self.combine_union(anchor_plans, distinct_anchors)?
        };

        let column_names: Vec<String> = if definition.columns.is_empty() {
            anchor.columns.iter().map(|c| c.name.clone()).collect()
        } else {
            if definition.columns.len() != anchor.columns.len() {
                return Err(QueryError::Semantic(format!(
                    "'{}' has {} columns than were specified in the column list",
                    name,
                    if definition.columns.len() > anchor.columns.len() {
                        "fewer"
                    } else {
                        "more"
                    }
                )));
            }
            definition.columns.clone()
        };
        let anchor_schema = anchor.schema();
        let mut columns = Vec::with_capacity(column_names.len());
        for (i, (column, output)) in column_names.iter().zip(&anchor.columns).enumerate() {
            if column.is_empty() {
                return Err(QueryError::Semantic(format!(
                    "No column name was specified for column {} of '{}'",
                    i + 1,
                    name
                )));
            }
            let (_, field) = anchor_schema.resolve_column(&output.source)?;
            columns.push(RecursiveColumn {
                name: column.clone(),
                data_type: field.data_type.clone(),
                nullable: field.nullable,
                param: self.next_param(),
            });
        }

        let depth_param = self.next_param();
        let reference = RecursiveReference {
            name: name.clone(),
            columns: columns.clone(),
        };
        self.recursive_refs.push(reference);
        let bound: Result<Vec<BoundQuery>> = recursive
            .iter()
            .map(|member| self.bind_set_expr(member, None))
            .collect();
        self.recursive_refs.pop();
        let mut step_plans: Vec<QueryPlan> = bound?.into_iter().map(|b| b.plan).collect();

        for plan in &step_plans {
            if plan.columns.len() != columns.len() {
                return Err(QueryError::Semantic(
                    "All queries combined using a UNION, INTERSECT or EXCEPT operator must have an equal number of expressions in their target lists."
                        .to_string(),
                ));
            }
            let schema = plan.schema();
            for (column, output) in columns.iter().zip(&plan.columns) {
                let (_, field) = schema.resolve_column(&output.source)?;
                if field.data_type != column.data_type && field.data_type != ArrowDataType::Null {
                    return Err(QueryError::TypeMismatch(format!(
                        "Types don't match between the anchor and the recursive part in column \"{}\" of recursive query \"{}\" ({} and {}).",
                        column.name,
                        name,
                        sql_type_name(&column.data_type),
                        sql_type_name(&field.data_type)
                    )));
                }
            }
        }
        let step = if step_plans.len() == 1 {
            step_plans.remove(0)
        } else {
            self.combine_union(step_plans, false)?
        };

        // Depth counts recursion levels so MAXRECURSION can stop runaway queries
        let depth_start = self.next_expr_name();
        let depth_next = self.next_expr_name();
        let depth = self.next_expr_name();
        let anchor_root = Arc::new(PlanOperator::ComputeScalar(ComputeScalarNode {
            input: anchor.root.clone(),
            values: vec![DefinedValue::new(depth_start.clone(), Expr::int(0), ArrowDataType::Int32)
                .with_nullable(false)],
        }));
        let step_root = Arc::new(PlanOperator::ComputeScalar(ComputeScalarNode {
            input: step.root.clone(),
            values: vec![DefinedValue::new(
                depth_next.clone(),
                Expr::OuterReference {
                    param: depth_param.clone(),
                    data_type: ArrowDataType::Int32,
                }
                .add(Expr::int(1)),
                ArrowDataType::Int32,
            )
            .with_nullable(false)],
        }));

        let step_schema = step.schema();
        let mut concat_columns = Vec::with_capacity(columns.len() + 1);
        for ((column, anchor_output), step_output) in columns.iter().zip(&anchor.columns).zip(&step.columns) {
            let step_nullable = step_schema
                .resolve_column(&step_output.source)
                .map(|(_, f)| f.nullable)
                .unwrap_or(true);
            concat_columns.push(ConcatColumn {
                name: column.name.clone(),
                data_type: column.data_type.clone(),
                nullable: column.nullable || step_nullable,
                visible: true,
                sources: vec![anchor_output.source.clone(), step_output.source.clone()],
            });
        }
        concat_columns.push(ConcatColumn {
            name: depth.clone(),
            data_type: ArrowDataType::Int32,
            nullable: false,
            visible: false,
            sources: vec![Column::new(depth_start), Column::new(depth_next.clone())],
        });

        let spool_id = self.next_spool_id();
        let mut outer_references: Vec<OuterReferenceBinding> = columns
            .iter()
            .map(|c| OuterReferenceBinding {
                column: Column::new(c.name.clone()),
                param: c.param.clone(),
            })
            .collect();
        outer_references.push(OuterReferenceBinding {
            column: Column::new(depth),
            param: depth_param,
        });
        let mut recursion = Arc::new(PlanOperator::Join(JoinNode {
            left: Arc::new(PlanOperator::SpoolConsumer(SpoolConsumerNode {
                producer: spool_id,
                schema: concat_schema(&concat_columns),
            })),
            right: step_root,
            join_type: JoinType::Inner,
            strategy: JoinStrategy::NestedLoop { outer_references },
            output: JoinOutput::Right,
            anti_join: false,
            condition: None,
            defined_values: vec![],
        }));

        let max_recursion = self
            .hints
            .max_recursion
            .unwrap_or(self.options.default_max_recursion);
        if max_recursion > 0 {
            recursion = Arc::new(PlanOperator::Assert(AssertNode {
                input: recursion,
                predicate: Expr::column(depth_next).lt_eq(Expr::int(max_recursion as i32)),
                message: format!(
                    "The statement terminated. The maximum recursion {} has been exhausted before statement completion.",
                    max_recursion
                ),
            }));
        }
        debug!(cte = %name, spool = spool_id, max_recursion, "recursive CTE expanded");

        let spool = PlanOperator::Spool(SpoolNode {
            id: spool_id,
            input: Arc::new(PlanOperator::Concatenate(ConcatenateNode {
                inputs: vec![anchor_root, recursion],
                columns: concat_columns,
            })),
            kind: SpoolKind::Lazy,
            mode: SpoolMode::Stack,
        });
        let outputs = columns
            .iter()
            .map(|c| OutputColumn {
                name: c.name.clone(),
                source: Column::new(c.name.clone()),
            })
            .collect();
        Ok(QueryPlan::new(Arc::new(spool), outputs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{parse_sql, Statement};

    fn cte_query(sql: &str) -> Box<Query> {
        let Statement::Query(query) = parse_sql(sql).unwrap() else {
            panic!("expected query");
        };
        query
            .with
            .as_ref()
            .map(|w| w.cte_tables[0].query.clone())
            .unwrap()
    }

    #[test]
    fn test_detects_self_reference() {
        let q = cte_query(
            "WITH t (n) AS (SELECT 1 UNION ALL SELECT n + 1 FROM t WHERE n < 5) SELECT n FROM t",
        );
        assert!(query_references(&q, "T"));
        let q = cte_query("WITH t AS (SELECT name FROM account) SELECT * FROM t");
        assert!(!query_references(&q, "t"));
    }

    #[test]
    fn test_flatten_union_records_quantifiers() {
        let q = cte_query(
            "WITH t (n) AS (SELECT 1 UNION SELECT 2 UNION ALL SELECT n + 1 FROM t) SELECT n FROM t",
        );
        let mut members = vec![];
        flatten_union(&q.body, &mut members);
        assert_eq!(members.len(), 3);
        assert_eq!(members[0].1, None);
        assert!(!is_union_all(members[1].1));
        assert!(is_union_all(members[2].1));
    }
}
