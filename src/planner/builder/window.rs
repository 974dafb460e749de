//! Window function lowering
//!
//! Each windowed call gets its own operator pipeline over the plan built so
//! far:
//!
//! - ranking functions number rows with Sort, Segment and Sequence Project
//! - aggregates with a ROWS frame replay each row's frame through a window
//!   spool and aggregate it
//! - aggregates over a whole partition buffer the partition in a segment
//!   spool, aggregate it once and join the result back to its rows

use super::expr::{function_arg_exprs, function_name, is_distinct_call, is_wildcard_call, sort_direction, walk_sql_expr};
use super::scope::Scope;
use super::BuildContext;
use crate::error::{QueryError, Result};
use crate::parser::{expr_key, SqlExpr};
use crate::physical::{
    AggregateNode, AggregateStrategy, AggregateValue, ComputeScalarNode, DefinedValue, FrameValue,
    JoinNode, JoinOutput, JoinStrategy, JoinType, PlanOperator, SegmentNode, SequenceProjectNode,
    SequenceValue, SortNode, SpoolConsumerNode, SpoolKind, SpoolMode, SpoolNode,
};
use crate::planner::{AggregateType, Column, Expr, ScalarValue, SortKey};
use arrow::datatypes::DataType as ArrowDataType;
use sqlparser::ast::{self, WindowFrameBound, WindowFrameUnits, WindowType};
use std::sync::Arc;
use tracing::debug;

/// Windowed calls of `expr`, each once
pub(crate) fn collect_windows(expr: &SqlExpr, out: &mut Vec<ast::Function>) {
    walk_sql_expr(expr, &mut |e| match e {
        SqlExpr::Function(func) if func.over.is_some() => {
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

/// Frame of an ordered window aggregate, in rows relative to the current row
struct RowsFrame {
    /// `None` for UNBOUNDED PRECEDING
    start: Option<i64>,
    end: i64,
}

fn frame_offset(bound: &WindowFrameBound, what: &str) -> Result<Option<i64>> {
    let literal = |e: &SqlExpr| -> Result<i64> {
        match e {
            SqlExpr::Value(ast::Value::Number(n, _)) => n
                .parse::<i64>()
                .map_err(|_| QueryError::Semantic(format!("Invalid window frame offset {}", n))),
            other => Err(QueryError::not_supported(format!(
                "window frame offset {}",
                other
            ))),
        }
    };
    match bound {
        WindowFrameBound::CurrentRow => Ok(Some(0)),
        WindowFrameBound::Preceding(None) => Ok(None),
        WindowFrameBound::Preceding(Some(e)) => Ok(Some(-literal(e)?)),
        WindowFrameBound::Following(Some(e)) => Ok(Some(literal(e)?)),
        WindowFrameBound::Following(None) => Err(QueryError::not_supported_with(
            format!("UNBOUNDED FOLLOWING as {} of a window frame", what),
            "Reverse the ORDER BY and use UNBOUNDED PRECEDING",
        )),
    }
}

fn rows_frame(frame: Option<&ast::WindowFrame>) -> Result<RowsFrame> {
    let Some(frame) = frame else {
        return Err(QueryError::not_supported_with(
            "window aggregate with ORDER BY and the default RANGE frame",
            "Specify ROWS BETWEEN UNBOUNDED PRECEDING AND CURRENT ROW",
        ));
    };
    if frame.units != WindowFrameUnits::Rows {
        return Err(QueryError::not_supported_with(
            format!("{} window frame", frame.units),
            "Use a ROWS frame",
        ));
    }
    let start = frame_offset(&frame.start_bound, "start")?;
    let end = match &frame.end_bound {
        Some(WindowFrameBound::Preceding(None)) => {
            return Err(QueryError::Semantic(
                "UNBOUNDED PRECEDING cannot end a window frame".to_string(),
            ))
        }
        Some(bound) => frame_offset(bound, "end")?.unwrap_or(0),
        None => 0,
    };
    if start.is_some_and(|s| s > end) {
        return Err(QueryError::Semantic(
            "The window frame starts after it ends".to_string(),
        ));
    }
    Ok(RowsFrame { start, end })
}

/// Sort unless the input already has this order
fn sorted(plan: Arc<PlanOperator>, keys: Vec<SortKey>) -> Arc<PlanOperator> {
    if keys.is_empty() || plan.schema().is_sorted_by(&keys) {
        plan
    } else {
        Arc::new(PlanOperator::Sort(SortNode { input: plan, keys }))
    }
}

impl BuildContext<'_> {
    /// Lower the window functions of `exprs` onto `plan`
    pub(crate) fn bind_windows(
        &mut self,
        exprs: &[&SqlExpr],
        mut plan: Arc<PlanOperator>,
        scope: &mut Scope,
    ) -> Result<Arc<PlanOperator>> {
        let mut calls = vec![];
        for expr in exprs {
            collect_windows(expr, &mut calls);
        }
        for call in &calls {
            let (lowered, value) = self.bind_window(call, plan, scope)?;
            plan = lowered;
            scope.schema = plan.schema();
            scope
                .rewrites
                .insert(expr_key(&SqlExpr::Function(call.clone())), Expr::column(value));
        }
        Ok(plan)
    }

    fn bind_window(
        &mut self,
        call: &ast::Function,
        plan: Arc<PlanOperator>,
        scope: &Scope,
    ) -> Result<(Arc<PlanOperator>, String)> {
        let name = function_name(call);
        let spec = match &call.over {
            Some(WindowType::WindowSpec(spec)) if spec.window_name.is_none() => spec,
            _ => {
                return Err(QueryError::not_supported_with(
                    format!("named window in {}", call),
                    "Write the window specification in the OVER clause",
                ))
            }
        };
        let func = match name.as_str() {
            "ROW_NUMBER" => AggregateType::RowNumber,
            "RANK" => AggregateType::Rank,
            "DENSE_RANK" => AggregateType::DenseRank,
            "COUNT" if is_wildcard_call(call) => AggregateType::CountStar,
            other => AggregateType::from_name(other).ok_or_else(|| {
                QueryError::not_supported(format!("window function {}", name))
            })?,
        };
        if is_distinct_call(call) {
            return Err(QueryError::not_supported(format!(
                "DISTINCT in windowed {}",
                name
            )));
        }
        if func == AggregateType::StringAgg {
            return Err(QueryError::not_supported("windowed STRING_AGG"));
        }

        // Partition, order and argument expressions become columns of the input
        let schema = plan.schema();
        let mut hoisted = vec![];
        let mut partition_by = vec![];
        for expr in &spec.partition_by {
            let bound = self.bind_checked(expr, scope)?;
            let (column, defined) = self.column_or_hoist(bound, &schema)?;
            hoisted.extend(defined);
            partition_by.push(column);
        }
        let mut order_by = vec![];
        for item in &spec.order_by {
            let bound = self.bind_checked(&item.expr, scope)?;
            let (column, defined) = self.column_or_hoist(bound, &schema)?;
            hoisted.extend(defined);
            order_by.push(SortKey {
                column,
                direction: sort_direction(item),
            });
        }
        let mut args = vec![];
        for arg in function_arg_exprs(call) {
            let bound = self.bind_checked(arg, scope)?;
            let (column, defined) = self.column_or_hoist(bound, &schema)?;
            hoisted.extend(defined);
            args.push(column);
        }
        let input = if hoisted.is_empty() {
            plan
        } else {
            Arc::new(PlanOperator::ComputeScalar(ComputeScalarNode {
                input: plan,
                values: hoisted,
            }))
        };

        if func.is_ranking() {
            if !args.is_empty() {
                return Err(QueryError::Semantic(format!(
                    "The function '{}' takes no arguments",
                    name
                )));
            }
            if order_by.is_empty() {
                return Err(QueryError::Semantic(format!(
                    "The function '{}' must have an OVER clause with ORDER BY.",
                    name
                )));
            }
            return Ok(self.lower_ranking(func, input, partition_by, order_by));
        }

        let expected = usize::from(func != AggregateType::CountStar);
        if args.len() != expected {
            return Err(QueryError::Semantic(format!(
                "The {} function requires 1 argument(s)",
                name
            )));
        }
        let input_schema = input.schema();
        let arg_type = args
            .first()
            .map(|c| input_schema.resolve_column(c).map(|(_, f)| f.data_type.clone()))
            .transpose()?;

        if order_by.is_empty() {
            if spec.window_frame.is_some() {
                return Err(QueryError::Semantic(format!(
                    "The window frame of '{}' requires an ORDER BY in its OVER clause.",
                    name
                )));
            }
            return Ok(self.lower_partition_aggregate(func, args, arg_type, input, partition_by));
        }
        let frame = rows_frame(spec.window_frame.as_ref())?;
        Ok(self.lower_framed_aggregate(func, args, arg_type, input, partition_by, order_by, frame))
    }

    fn sort_and_segment(
        &mut self,
        input: Arc<PlanOperator>,
        partition_by: &[Column],
        order_by: &[SortKey],
    ) -> (Arc<PlanOperator>, Column) {
        let mut keys: Vec<SortKey> = partition_by.iter().cloned().map(SortKey::asc).collect();
        keys.extend(order_by.iter().cloned());
        let segment = self.next_segment_name();
        let plan = Arc::new(PlanOperator::Segment(SegmentNode {
            input: sorted(input, keys),
            partition_by: partition_by.to_vec(),
            segment: segment.clone(),
        }));
        (plan, Column::new(segment))
    }

    fn lower_ranking(
        &mut self,
        func: AggregateType,
        input: Arc<PlanOperator>,
        partition_by: Vec<Column>,
        order_by: Vec<SortKey>,
    ) -> (Arc<PlanOperator>, String) {
        let (mut plan, segment) = self.sort_and_segment(input, &partition_by, &order_by);
        let rank_segment = if func == AggregateType::RowNumber {
            None
        } else {
            let name = self.next_segment_name();
            let mut peers = partition_by;
            peers.extend(order_by.iter().map(|k| k.column.clone()));
            plan = Arc::new(PlanOperator::Segment(SegmentNode {
                input: plan,
                partition_by: peers,
                segment: name.clone(),
            }));
            Some(Column::new(name))
        };
        let name = self.next_expr_name();
        debug!(%func, value = %name, "ranking function lowered");
        let plan = Arc::new(PlanOperator::SequenceProject(SequenceProjectNode {
            input: plan,
            values: vec![SequenceValue {
                name: name.clone(),
                func,
                segment,
                rank_segment,
            }],
        }));
        (plan, name)
    }

    /// Aggregate over the rows of each partition, repeated on every row
    fn lower_partition_aggregate(
        &mut self,
        func: AggregateType,
        args: Vec<Column>,
        arg_type: Option<ArrowDataType>,
        input: Arc<PlanOperator>,
        partition_by: Vec<Column>,
    ) -> (Arc<PlanOperator>, String) {
        let (segmented, segment) = self.sort_and_segment(input, &partition_by, &[]);
        let id = self.next_spool_id();
        let spool = Arc::new(PlanOperator::Spool(SpoolNode {
            id,
            input: segmented,
            kind: SpoolKind::Lazy,
            mode: SpoolMode::Segment {
                segment: Some(segment),
            },
        }));
        let consumer = || {
            Arc::new(PlanOperator::SpoolConsumer(SpoolConsumerNode {
                producer: id,
                schema: spool.schema(),
            }))
        };

        let name = self.next_expr_name();
        let aggregate = Arc::new(PlanOperator::Aggregate(AggregateNode {
            input: consumer(),
            strategy: AggregateStrategy::Stream,
            group_by: vec![],
            aggregates: vec![AggregateValue {
                name: name.clone(),
                func,
                args: args.into_iter().map(Expr::Column).collect(),
                distinct: false,
                within_group: vec![],
                data_type: func.result_type(arg_type.as_ref()),
            }],
        }));
        let replay = Arc::new(PlanOperator::Join(JoinNode {
            left: aggregate,
            right: consumer(),
            join_type: JoinType::Inner,
            strategy: JoinStrategy::NestedLoop {
                outer_references: vec![],
            },
            output: JoinOutput::Both,
            anti_join: false,
            condition: None,
            defined_values: vec![],
        }));
        debug!(%func, value = %name, spool = id, "partition aggregate lowered");
        let plan = Arc::new(PlanOperator::Join(JoinNode {
            left: spool,
            right: replay,
            join_type: JoinType::Inner,
            strategy: JoinStrategy::NestedLoop {
                outer_references: vec![],
            },
            output: JoinOutput::Right,
            anti_join: false,
            condition: None,
            defined_values: vec![],
        }));
        (plan, name)
    }

    /// Aggregate over a ROWS frame around each row
    #[allow(clippy::too_many_arguments)]
    fn lower_framed_aggregate(
        &mut self,
        func: AggregateType,
        args: Vec<Column>,
        arg_type: Option<ArrowDataType>,
        input: Arc<PlanOperator>,
        partition_by: Vec<Column>,
        order_by: Vec<SortKey>,
        frame: RowsFrame,
    ) -> (Arc<PlanOperator>, String) {
        let (segmented, segment) = self.sort_and_segment(input, &partition_by, &order_by);
        let row_number = self.next_expr_name();
        let numbered = Arc::new(PlanOperator::SequenceProject(SequenceProjectNode {
            input: segmented,
            values: vec![SequenceValue {
                name: row_number.clone(),
                func: AggregateType::RowNumber,
                segment: segment.clone(),
                rank_segment: None,
            }],
        }));

        let rn = Expr::column(row_number.clone());
        let offset = |n: i64| Expr::Literal(ScalarValue::Int64(n));
        let frame_start = self.next_expr_name();
        let frame_end = self.next_expr_name();
        let start_expr = match frame.start {
            None => offset(1),
            Some(0) => rn.clone(),
            Some(n) => rn.clone().add(offset(n)),
        };
        let end_expr = match frame.end {
            0 => rn.clone(),
            n => rn.clone().add(offset(n)),
        };
        let bounded = Arc::new(PlanOperator::ComputeScalar(ComputeScalarNode {
            input: numbered,
            values: vec![
                DefinedValue::new(frame_start.clone(), start_expr, ArrowDataType::Int64)
                    .with_nullable(false),
                DefinedValue::new(frame_end.clone(), end_expr, ArrowDataType::Int64)
                    .with_nullable(false),
            ],
        }));

        // Rows of the current row group the aggregate; frame rows feed its argument
        let group_by: Vec<Column> = bounded.schema().fields().iter().map(|f| f.column()).collect();
        let frame_values: Vec<FrameValue> = args
            .iter()
            .map(|source| FrameValue {
                source: source.clone(),
                name: self.next_expr_name(),
            })
            .collect();
        let frame_args = frame_values
            .iter()
            .map(|f| Expr::column(f.name.clone()))
            .collect();
        let spool = Arc::new(PlanOperator::Spool(SpoolNode {
            id: self.next_spool_id(),
            input: bounded,
            kind: SpoolKind::Lazy,
            mode: SpoolMode::Window {
                segment: Some(segment),
                row_number: Column::new(row_number),
                frame_start: Column::new(frame_start),
                frame_end: Column::new(frame_end),
                frame_values,
            },
        }));

        let name = self.next_expr_name();
        debug!(%func, value = %name, start = ?frame.start, end = frame.end, "framed aggregate lowered");
        let plan = Arc::new(PlanOperator::Aggregate(AggregateNode {
            input: spool,
            strategy: AggregateStrategy::Stream,
            group_by,
            aggregates: vec![AggregateValue {
                name: name.clone(),
                func,
                args: frame_args,
                distinct: false,
                within_group: vec![],
                data_type: func.result_type(arg_type.as_ref()),
            }],
        }));
        (plan, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{parse_sql, SelectItem, SetExpr, Statement};

    fn window_call(sql: &str) -> ast::Function {
        let Statement::Query(query) = parse_sql(sql).unwrap() else {
            panic!("expected query");
        };
        let SetExpr::Select(select) = *query.body else {
            panic!("expected select");
        };
        let SelectItem::UnnamedExpr(expr) = &select.projection[0] else {
            panic!("expected expression");
        };
        let mut calls = vec![];
        collect_windows(expr, &mut calls);
        calls.remove(0)
    }

    fn frame_of(call: &ast::Function) -> Option<&ast::WindowFrame> {
        match &call.over {
            Some(WindowType::WindowSpec(spec)) => spec.window_frame.as_ref(),
            _ => None,
        }
    }

    #[test]
    fn test_rows_frame_offsets() {
        let call = window_call(
            "SELECT SUM(x) OVER (ORDER BY y ROWS BETWEEN 2 PRECEDING AND 1 FOLLOWING) FROM t",
        );
        let frame = rows_frame(frame_of(&call)).unwrap();
        assert_eq!(frame.start, Some(-2));
        assert_eq!(frame.end, 1);

        let call = window_call("SELECT SUM(x) OVER (ORDER BY y ROWS UNBOUNDED PRECEDING) FROM t");
        let frame = rows_frame(frame_of(&call)).unwrap();
        assert_eq!(frame.start, None);
        assert_eq!(frame.end, 0);
    }

    #[test]
    fn test_unsupported_frames() {
        let call = window_call("SELECT SUM(x) OVER (ORDER BY y) FROM t");
        assert!(matches!(
            rows_frame(frame_of(&call)),
            Err(QueryError::NotSupported { .. })
        ));
        let call = window_call(
            "SELECT SUM(x) OVER (ORDER BY y RANGE BETWEEN UNBOUNDED PRECEDING AND CURRENT ROW) FROM t",
        );
        assert!(matches!(
            rows_frame(frame_of(&call)),
            Err(QueryError::NotSupported { .. })
        ));
        let call = window_call(
            "SELECT SUM(x) OVER (ORDER BY y ROWS BETWEEN CURRENT ROW AND UNBOUNDED FOLLOWING) FROM t",
        );
        assert!(matches!(
            rows_frame(frame_of(&call)),
            Err(QueryError::NotSupported { .. })
        ));
    }
}
