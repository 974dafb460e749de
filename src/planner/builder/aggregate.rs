//! GROUP BY and aggregate lowering

use super::expr::{
    contains_subquery, function_arg_exprs, function_name, is_distinct_call, is_wildcard_call,
    sort_direction, walk_sql_expr,
};
use super::scope::Scope;
use super::BuildContext;
use crate::error::{QueryError, Result};
use crate::parser::{expr_key, GroupByExpr, OrderByExpr, Select, SelectItem, SqlExpr};
use crate::physical::{
    AggregateNode, AggregateStrategy, AggregateValue, ComputeScalarNode, PlanOperator, SortNode,
};
use crate::planner::{is_numeric, sql_type_name, AggregateType, Column, Expr, SortKey};
use arrow::datatypes::DataType as ArrowDataType;
use sqlparser::ast;
use std::sync::Arc;
use tracing::debug;

const NESTED_AGGREGATE: &str =
    "Cannot perform an aggregate function on an expression containing an aggregate or a subquery.";

/// Aggregate calls of `expr`, skipping windowed calls but not their arguments
pub(crate) fn collect_aggregates(expr: &SqlExpr, out: &mut Vec<ast::Function>) {
    walk_sql_expr(expr, &mut |e| match e {
        SqlExpr::Function(func)
            if func.over.is_none() && AggregateType::from_name(&function_name(func)).is_some() =>
        {
            let key = expr_key(e);
            if !out
                .iter()
                .any(|f| expr_key(&SqlExpr::Function(f.clone())) == key)
            {
                out.push(func.clone());
            }
            false
        }
        _ => true,
    });
}

fn group_by_exprs(group_by: &GroupByExpr) -> Result<&[SqlExpr]> {
    match group_by {
        GroupByExpr::All(_) => Err(QueryError::not_supported("GROUP BY ALL")),
        GroupByExpr::Expressions(exprs, modifiers) => {
            if let Some(modifier) = modifiers.first() {
                return Err(QueryError::not_supported(format!("GROUP BY {}", modifier)));
            }
            Ok(exprs)
        }
    }
}

fn select_item_expr(item: &SelectItem) -> Option<&SqlExpr> {
    match item {
        SelectItem::UnnamedExpr(e) | SelectItem::ExprWithAlias { expr: e, .. } => Some(e),
        _ => None,
    }
}

/// Does the query block aggregate its rows
pub(crate) fn needs_aggregate(select: &Select, order_by: &[OrderByExpr]) -> Result<bool> {
    if !group_by_exprs(&select.group_by)?.is_empty() || select.having.is_some() {
        return Ok(true);
    }
    let mut calls = vec![];
    for expr in select.projection.iter().filter_map(select_item_expr) {
        collect_aggregates(expr, &mut calls);
    }
    for item in order_by {
        collect_aggregates(&item.expr, &mut calls);
    }
    Ok(!calls.is_empty())
}

impl BuildContext<'_> {
    /// Lower GROUP BY and aggregate calls of the projection, HAVING and ORDER BY
    pub(crate) fn bind_aggregate(
        &mut self,
        select: &Select,
        order_by: &[OrderByExpr],
        plan: Arc<PlanOperator>,
        scope: &mut Scope,
    ) -> Result<Arc<PlanOperator>> {
        let input_schema = plan.schema();
        let mut hoisted = vec![];
        let mut rewrites = vec![];

        let mut group_by: Vec<Column> = vec![];
        for expr in group_by_exprs(&select.group_by)? {
            if matches!(
                expr,
                SqlExpr::Rollup(_) | SqlExpr::Cube(_) | SqlExpr::GroupingSets(_)
            ) {
                return Err(QueryError::not_supported(format!("GROUP BY {}", expr)));
            }
            let mut nested = vec![];
            collect_aggregates(expr, &mut nested);
            if !nested.is_empty() || contains_subquery(expr) {
                return Err(QueryError::Semantic(
                    "Cannot use an aggregate or a subquery in an expression used for the group by list of a GROUP BY clause."
                        .to_string(),
                ));
            }
            let bound = self.bind_checked(expr, scope)?;
            let (column, defined) = self.column_or_hoist(bound, &input_schema)?;
            if let Some(value) = defined {
                hoisted.push(value);
                rewrites.push((expr_key(expr), Expr::Column(column.clone())));
            }
            if !group_by.contains(&column) {
                group_by.push(column);
            }
        }

        let mut calls = vec![];
        for expr in select.projection.iter().filter_map(select_item_expr) {
            collect_aggregates(expr, &mut calls);
        }
        if let Some(having) = &select.having {
            collect_aggregates(having, &mut calls);
        }
        for item in order_by {
            collect_aggregates(&item.expr, &mut calls);
        }

        let mut aggregates = Vec::with_capacity(calls.len());
        let mut within_group: Option<(String, Vec<SortKey>)> = None;
        for call in &calls {
            let value = self.bind_aggregate_call(call, scope, &mut hoisted, &mut within_group)?;
            rewrites.push((
                expr_key(&SqlExpr::Function(call.clone())),
                Expr::Column(Column::new(value.name.clone())),
            ));
            aggregates.push(value);
        }

        let mut input = plan;
        if !hoisted.is_empty() {
            input = Arc::new(PlanOperator::ComputeScalar(ComputeScalarNode {
                input,
                values: hoisted,
            }));
        }

        let group_keys: Vec<SortKey> = group_by.iter().cloned().map(SortKey::asc).collect();
        let strategy = match within_group {
            Some((_, keys)) if !keys.is_empty() => {
                let mut sort_keys = group_keys;
                sort_keys.extend(keys);
                if !input.schema().is_sorted_by(&sort_keys) {
                    input = Arc::new(PlanOperator::Sort(SortNode {
                        input,
                        keys: sort_keys,
                    }));
                }
                AggregateStrategy::Stream
            }
            _ if group_by.is_empty() => AggregateStrategy::Stream,
            _ if input.schema().is_sorted_by(&group_keys) => AggregateStrategy::Stream,
            _ => AggregateStrategy::Hash,
        };
        debug!(
            ?strategy,
            groups = group_by.len(),
            aggregates = aggregates.len(),
            "aggregate lowered"
        );

        let plan = Arc::new(PlanOperator::Aggregate(AggregateNode {
            input,
            strategy,
            group_by,
            aggregates,
        }));
        scope.pre_aggregate = Some(std::mem::replace(&mut scope.schema, plan.schema()));
        scope.rewrites.extend(rewrites);
        Ok(plan)
    }

    fn bind_aggregate_call(
        &mut self,
        call: &ast::Function,
        scope: &Scope,
        hoisted: &mut Vec<crate::physical::DefinedValue>,
        within_group: &mut Option<(String, Vec<SortKey>)>,
    ) -> Result<AggregateValue> {
        let name = function_name(call);
        let func = match AggregateType::from_name(&name) {
            Some(AggregateType::Count) if is_wildcard_call(call) => AggregateType::CountStar,
            Some(func) => func,
            None => return Err(QueryError::not_supported(format!("aggregate {}", name))),
        };

        let args = function_arg_exprs(call);
        for arg in &args {
            let mut nested = vec![];
            collect_aggregates(arg, &mut nested);
            if !nested.is_empty() || contains_subquery(arg) {
                return Err(QueryError::Semantic(NESTED_AGGREGATE.to_string()));
            }
        }
        let expected = match func {
            AggregateType::CountStar => 0,
            AggregateType::StringAgg => 2,
            _ => 1,
        };
        if args.len() != expected {
            return Err(QueryError::Semantic(format!(
                "The {} function requires {} argument(s)",
                name,
                expected.max(1)
            )));
        }

        let schema = &scope.schema;
        let bound = args
            .iter()
            .map(|a| self.bind_checked(a, scope))
            .collect::<Result<Vec<_>>>()?;
        let arg_type = bound.first().map(|e| e.data_type(schema)).transpose()?;

        if let (AggregateType::Sum | AggregateType::Avg, Some(t)) = (func, &arg_type) {
            if !is_numeric(t) && *t != ArrowDataType::Null {
                return Err(QueryError::TypeMismatch(format!(
                    "Operand data type {} is invalid for {} operator.",
                    sql_type_name(t),
                    name.to_lowercase()
                )));
            }
        }

        let mut order = vec![];
        if !call.within_group.is_empty() {
            if func != AggregateType::StringAgg {
                return Err(QueryError::Semantic(format!(
                    "The function '{}' may not have a WITHIN GROUP clause.",
                    name
                )));
            }
            let text = call
                .within_group
                .iter()
                .map(|o| o.to_string().to_lowercase())
                .collect::<Vec<_>>()
                .join(", ");
            for item in &call.within_group {
                let expr = self.bind_checked(&item.expr, scope)?;
                let (column, defined) = self.column_or_hoist(expr, schema)?;
                hoisted.extend(defined);
                order.push(SortKey {
                    column,
                    direction: sort_direction(item),
                });
            }
            match within_group {
                Some((existing, _)) if *existing != text => {
                    return Err(QueryError::Semantic(
                        "Multiple ordered aggregate functions in the same scope have mutually incompatible orderings."
                            .to_string(),
                    ))
                }
                Some(_) => {}
                None => *within_group = Some((text, order)),
            }
        }

        let within_keys = match (func, within_group.as_ref()) {
            (AggregateType::StringAgg, Some((_, keys))) => keys.clone(),
            _ => vec![],
        };
        Ok(AggregateValue {
            name: self.next_expr_name(),
            func,
            args: bound,
            distinct: is_distinct_call(call),
            within_group: within_keys,
            data_type: func.result_type(arg_type.as_ref()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{parse_sql, SetExpr, Statement};

    fn select(sql: &str) -> (Select, Vec<OrderByExpr>) {
        let Statement::Query(query) = parse_sql(sql).unwrap() else {
            panic!("expected query");
        };
        let order_by = query.order_by.map(|o| o.exprs).unwrap_or_default();
        let SetExpr::Select(select) = *query.body else {
            panic!("expected select");
        };
        (*select, order_by)
    }

    #[test]
    fn test_collects_each_distinct_call_once() {
        let (s, _) = select("SELECT COUNT(*), SUM(x) + SUM(x), MAX(y) FROM t");
        let mut calls = vec![];
        for expr in s.projection.iter().filter_map(select_item_expr) {
            collect_aggregates(expr, &mut calls);
        }
        assert_eq!(calls.len(), 3);
    }

    #[test]
    fn test_windowed_call_is_not_an_aggregate() {
        let (s, order_by) = select("SELECT ROW_NUMBER() OVER (ORDER BY x) FROM t");
        assert!(!needs_aggregate(&s, &order_by).unwrap());
        let (s, order_by) = select("SELECT x FROM t ORDER BY COUNT(*)");
        assert!(needs_aggregate(&s, &order_by).unwrap());
    }
}
