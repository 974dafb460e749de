//! Subquery decorrelation
//!
//! Every `EXISTS`, `IN (subquery)` and scalar subquery is lowered to a left
//! outer semi-join against the plan built so far. The join defines a
//! stand-in column and the subquery expression is rewritten to a predicate
//! or reference over it, so subqueries keep working under `OR`, `CASE` and
//! arbitrary nesting.
//!
//! Correlated subqueries become nested loops that bind each captured outer
//! column to a parameter. Uncorrelated ones are evaluated once: their inner
//! side is spooled, or joined by hash/merge when there is an equality key.

use super::expr::walk_sql_expr;
use super::join::sort_by;
use super::query::BoundQuery;
use super::scope::{CapturedReference, Scope};
use super::BuildContext;
use crate::error::{QueryError, Result};
use crate::parser::{expr_key, Query, SqlExpr};
use crate::physical::{
    AggregateNode, AggregateStrategy, AggregateValue, AssertNode, DefinedValue, DistinctNode,
    JoinNode, JoinOutput, JoinStrategy, JoinType, PlanOperator, TopNode,
};
use crate::planner::{check_comparable, is_string, AggregateType, Column, Expr};
use arrow::datatypes::DataType as ArrowDataType;
use std::sync::Arc;
use tracing::debug;

const MULTIPLE_VALUES: &str = "Subquery returned more than 1 value. This is not permitted when the subquery follows =, !=, <, <= , >, >= or when the subquery is used as an expression.";

const SINGLE_COLUMN: &str = "Only one expression can be specified in the select list when the subquery is not introduced with EXISTS.";

/// A bound subquery ready to be joined
struct Inner {
    root: Arc<PlanOperator>,
    column: Option<Column>,
    captured: Vec<CapturedReference>,
    correlated: bool,
}

impl Inner {
    fn new(bound: BoundQuery) -> Self {
        let correlated = !bound.captured.is_empty() || bound.plan.root.is_correlated();
        Self {
            column: bound.plan.columns.first().map(|c| c.source.clone()),
            root: bound.plan.root,
            captured: bound.captured,
            correlated,
        }
    }

    fn single_column(bound: BoundQuery) -> Result<Self> {
        if bound.plan.columns.len() != 1 {
            return Err(QueryError::Semantic(SINGLE_COLUMN.to_string()));
        }
        Ok(Self::new(bound))
    }

    fn value_column(&self) -> Result<Column> {
        self.column
            .clone()
            .ok_or_else(|| QueryError::Internal("subquery without output column".into()))
    }
}

impl BuildContext<'_> {
    /// Lower the subqueries of `exprs` onto `plan` and record their rewrites in `scope`
    pub(crate) fn plan_subqueries(
        &mut self,
        exprs: &[&SqlExpr],
        mut plan: Arc<PlanOperator>,
        scope: &mut Scope,
    ) -> Result<Arc<PlanOperator>> {
        let mut found: Vec<SqlExpr> = vec![];
        for expr in exprs {
            walk_sql_expr(expr, &mut |e| match e {
                SqlExpr::Subquery(_) | SqlExpr::Exists { .. } | SqlExpr::InSubquery { .. } => {
                    found.push(e.clone());
                    false
                }
                _ => true,
            });
        }

        for expr in found {
            let key = expr_key(&expr);
            if scope.rewrites.contains_key(&key) {
                continue;
            }
            let (lowered, replacement) = match &expr {
                SqlExpr::Exists { subquery, negated } => {
                    self.plan_exists(subquery, *negated, plan, scope)?
                }
                SqlExpr::InSubquery {
                    expr: outer,
                    subquery,
                    negated,
                } => self.plan_in(outer, subquery, *negated, plan, scope)?,
                SqlExpr::Subquery(subquery) => self.plan_scalar(subquery, plan, scope)?,
                _ => continue,
            };
            plan = lowered;
            scope.schema = plan.schema();
            scope.rewrites.insert(key, replacement);
        }
        Ok(plan)
    }

    /// Left outer semi-join: one output row per `left` row carrying `defined`
    fn semi_join(
        &mut self,
        left: Arc<PlanOperator>,
        inner: Inner,
        condition: Option<Expr>,
        defined_values: Vec<DefinedValue>,
    ) -> Arc<PlanOperator> {
        let (right, outer_references) = if inner.correlated {
            (
                inner.root,
                inner.captured.into_iter().map(|c| c.binding).collect(),
            )
        } else {
            (self.eager_spool(inner.root), vec![])
        };
        Arc::new(PlanOperator::Join(JoinNode {
            left,
            right,
            join_type: JoinType::LeftOuter,
            strategy: JoinStrategy::NestedLoop { outer_references },
            output: JoinOutput::Left,
            anti_join: false,
            condition,
            defined_values,
        }))
    }

    fn plan_exists(
        &mut self,
        subquery: &Query,
        negated: bool,
        plan: Arc<PlanOperator>,
        scope: &Scope,
    ) -> Result<(Arc<PlanOperator>, Expr)> {
        let mut inner = Inner::new(self.bind_query(subquery, Some(scope))?);
        inner.root = Arc::new(PlanOperator::Top(TopNode {
            input: inner.root,
            count: Expr::int(1),
            percent: false,
            with_ties: false,
        }));
        debug!(correlated = inner.correlated, negated, "EXISTS lowered to semi-join");

        let flag = self.next_expr_name();
        let defined = DefinedValue::new(flag.clone(), Expr::int(1), ArrowDataType::Int32);
        let plan = self.semi_join(plan, inner, None, vec![defined]);
        let flag = Expr::column(flag);
        Ok((plan, if negated { flag.is_null() } else { flag.is_not_null() }))
    }

    fn plan_in(
        &mut self,
        outer: &SqlExpr,
        subquery: &Query,
        negated: bool,
        plan: Arc<PlanOperator>,
        scope: &Scope,
    ) -> Result<(Arc<PlanOperator>, Expr)> {
        let outer_expr = self.bind_checked(outer, scope)?;
        let inner = Inner::single_column(self.bind_query(subquery, Some(scope))?)?;
        let inner_column = inner.value_column()?;

        let outer_schema = plan.schema();
        let inner_schema = inner.root.schema();
        let outer_type = outer_expr.data_type(&outer_schema)?;
        let (_, inner_field) = inner_schema.resolve_column(&inner_column)?;
        let inner_type = inner_field.data_type.clone();
        let inner_nullable = inner_field.nullable;
        check_comparable(&outer_type, &inner_type)?;
        if is_string(&outer_type) && is_string(&inner_type) {
            let default = &self.options.default_collation;
            outer_expr
                .collation_label(&outer_schema, default)?
                .resolve_comparison(&Expr::Column(inner_column.clone()).collation_label(&inner_schema, default)?)?;
        }
        let outer_nullable = outer_expr.nullable(&outer_schema);

        let (plan, outer_column) = self.hoist_key(plan, outer_expr)?;
        let flag = self.next_expr_name();
        let defined = vec![DefinedValue::new(flag.clone(), Expr::int(1), ArrowDataType::Int32)];

        let plan = if inner.correlated {
            debug!(negated, "IN lowered to correlated nested loop");
            let condition = Expr::Column(outer_column.clone()).eq(Expr::Column(inner_column));
            self.semi_join(plan, inner, Some(condition), defined)
        } else {
            let unique = inner_schema.is_primary_key(&inner_column);
            let (strategy, left, right) = if unique {
                (
                    JoinStrategy::Merge {
                        left_key: outer_column.clone(),
                        right_key: inner_column.clone(),
                    },
                    sort_by(plan, &outer_column),
                    sort_by(inner.root, &inner_column),
                )
            } else {
                let distinct = Arc::new(PlanOperator::Distinct(DistinctNode {
                    input: inner.root,
                    columns: vec![inner_column.clone()],
                }));
                (
                    JoinStrategy::Hash {
                        left_key: outer_column.clone(),
                        right_key: inner_column.clone(),
                    },
                    plan,
                    distinct,
                )
            };
            debug!(strategy = strategy.name(), negated, "IN lowered to semi-join");
            Arc::new(PlanOperator::Join(JoinNode {
                left,
                right,
                join_type: JoinType::LeftOuter,
                strategy,
                output: JoinOutput::Left,
                anti_join: false,
                condition: None,
                defined_values: defined,
            }))
        };

        let flag = Expr::column(flag);
        if !negated {
            return Ok((plan, flag.is_not_null()));
        }
        if !inner_nullable && !outer_nullable {
            return Ok((plan, flag.is_null()));
        }

        // NOT IN is unknown when the outer value or any inner value is NULL
        let probe = Inner::new(self.bind_query(subquery, Some(scope))?);
        let probe_column = probe.value_column()?;
        let rows = self.next_expr_name();
        let non_null = self.next_expr_name();
        let counts = Arc::new(PlanOperator::Aggregate(AggregateNode {
            input: probe.root.clone(),
            strategy: AggregateStrategy::Stream,
            group_by: vec![],
            aggregates: vec![
                AggregateValue {
                    name: rows.clone(),
                    func: AggregateType::CountStar,
                    args: vec![],
                    distinct: false,
                    within_group: vec![],
                    data_type: AggregateType::CountStar.result_type(None),
                },
                AggregateValue {
                    name: non_null.clone(),
                    func: AggregateType::Count,
                    args: vec![Expr::Column(probe_column)],
                    distinct: false,
                    within_group: vec![],
                    data_type: AggregateType::Count.result_type(None),
                },
            ],
        }));
        let probe = Inner {
            root: counts,
            ..probe
        };
        let rows_out = self.next_expr_name();
        let non_null_out = self.next_expr_name();
        let plan = self.semi_join(
            plan,
            probe,
            None,
            vec![
                DefinedValue::new(rows_out.clone(), Expr::column(rows), ArrowDataType::Int32),
                DefinedValue::new(non_null_out.clone(), Expr::column(non_null), ArrowDataType::Int32),
            ],
        );

        let rows = Expr::column(rows_out);
        let no_rows = rows.clone().eq(Expr::int(0));
        let no_nulls = Expr::column(non_null_out)
            .eq(rows)
            .and(Expr::Column(outer_column).is_not_null());
        Ok((plan, flag.is_null().and(no_rows.or(no_nulls))))
    }

    fn plan_scalar(
        &mut self,
        subquery: &Query,
        plan: Arc<PlanOperator>,
        scope: &Scope,
    ) -> Result<(Arc<PlanOperator>, Expr)> {
        let mut inner = Inner::single_column(self.bind_query(subquery, Some(scope))?)?;
        let column = inner.value_column()?;
        let (_, field) = inner.root.schema().resolve_column(&column).map(|(i, f)| (i, f.clone()))?;

        let at_most_one = self
            .estimator
            .max_rows(&inner.root)
            .is_some_and(|rows| rows <= 1);
        let value = if at_most_one {
            column
        } else {
            let first = self.next_expr_name();
            let count = self.next_expr_name();
            let limited = Arc::new(PlanOperator::Top(TopNode {
                input: inner.root,
                count: Expr::int(2),
                percent: false,
                with_ties: false,
            }));
            let aggregate = Arc::new(PlanOperator::Aggregate(AggregateNode {
                input: limited,
                strategy: AggregateStrategy::Stream,
                group_by: vec![],
                aggregates: vec![
                    AggregateValue {
                        name: first.clone(),
                        func: AggregateType::First,
                        args: vec![Expr::Column(column)],
                        distinct: false,
                        within_group: vec![],
                        data_type: field.data_type.clone(),
                    },
                    AggregateValue {
                        name: count.clone(),
                        func: AggregateType::CountStar,
                        args: vec![],
                        distinct: false,
                        within_group: vec![],
                        data_type: AggregateType::CountStar.result_type(None),
                    },
                ],
            }));
            inner.root = Arc::new(PlanOperator::Assert(AssertNode {
                input: aggregate,
                predicate: Expr::column(count).lt_eq(Expr::int(1)),
                message: MULTIPLE_VALUES.to_string(),
            }));
            Column::new(first)
        };
        debug!(correlated = inner.correlated, checked = !at_most_one, "scalar subquery lowered");

        let name = self.next_expr_name();
        let defined = DefinedValue::new(name.clone(), Expr::Column(value), field.data_type.clone());
        let plan = self.semi_join(plan, inner, None, vec![defined]);
        Ok((plan, Expr::column(name)))
    }
}
