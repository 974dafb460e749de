//! Query blocks and set operations
//!
//! A query block is bound clause by clause in evaluation order: FROM, WHERE,
//! GROUP BY/HAVING, subqueries and windows of the output, the output columns
//! themselves, then DISTINCT, ORDER BY and TOP or OFFSET/FETCH. Clauses that
//! do not depend on each other report their errors together.

use super::aggregate::{collect_aggregates, needs_aggregate};
use super::cte::{flatten_union, is_union_all};
use super::window::collect_windows;
use super::expr::{contains_subquery, sort_direction};
use super::scope::{CapturedReference, Scope};
use super::BuildContext;
use crate::error::{ErrorCollector, QueryError, Result};
use crate::parser::{ObjectNameExt, OrderByExpr, Query, Select, SelectItem, SetExpr, SqlExpr, Value};
use crate::physical::{
    ComputeScalarNode, ConcatColumn, ConcatenateNode, ConstantColumn, ConstantRowNode,
    DefinedValue, DistinctNode, FilterNode, JoinNode, JoinOutput, JoinStrategy, JoinType,
    OffsetFetchNode, OutputColumn, PlanOperator, QueryPlan, SortNode, TopNode,
};
use crate::planner::{
    check_comparable, common_type, is_numeric, Column, Expr, PlanSchema, ScalarValue, SortKey,
};
use arrow::datatypes::DataType as ArrowDataType;
use sqlparser::ast::{self, SetOperator, SetQuantifier};
use std::sync::Arc;
use tracing::{debug, trace};

const COLUMN_COUNT_MISMATCH: &str = "All queries combined using a UNION, INTERSECT or EXCEPT operator must have an equal number of expressions in their target lists.";
const ORDER_BY_IN_SUBQUERY: &str = "The ORDER BY clause is invalid in views, inline functions, derived tables, subqueries, and common table expressions, unless TOP, OFFSET or FOR XML is also specified.";
const DISTINCT_ORDER_BY: &str =
    "ORDER BY items must appear in the select list if SELECT DISTINCT is specified.";
const SET_ORDER_BY: &str = "ORDER BY items must appear in the select list if the statement contains a UNION, INTERSECT or EXCEPT operator.";

/// A bound query and the outer references it captured from enclosing scopes
pub(crate) struct BoundQuery {
    pub plan: QueryPlan,
    pub captured: Vec<CapturedReference>,
}

/// Clauses of a query that apply after its body
#[derive(Default, Clone, Copy)]
struct QueryTail<'q> {
    order_by: &'q [OrderByExpr],
    offset: Option<&'q ast::Offset>,
    fetch: Option<&'q ast::Fetch>,
}

impl<'q> QueryTail<'q> {
    fn of(query: &'q Query) -> Self {
        Self {
            order_by: query.order_by.as_ref().map(|o| o.exprs.as_slice()).unwrap_or(&[]),
            offset: query.offset.as_ref(),
            fetch: query.fetch.as_ref(),
        }
    }

    fn has_offset(&self) -> bool {
        self.offset.is_some() || self.fetch.is_some()
    }
}

/// Run a clause that extends `plan`. On failure the error is recorded and the
/// plan and scope are left as they were before the clause.
fn extend_clause<'s>(
    errors: &mut ErrorCollector,
    plan: &mut Arc<PlanOperator>,
    scope: &mut Scope<'s>,
    clause: impl FnOnce(Arc<PlanOperator>, &mut Scope<'s>) -> Result<Arc<PlanOperator>>,
) -> bool {
    let rewrites = scope.rewrites.clone();
    let pre_aggregate = scope.pre_aggregate.clone();
    match clause(plan.clone(), scope) {
        Ok(extended) => {
            *plan = extended;
            scope.schema = plan.schema();
            true
        }
        Err(e) => {
            errors.push(e);
            scope.schema = plan.schema();
            scope.rewrites = rewrites;
            scope.pre_aggregate = pre_aggregate;
            false
        }
    }
}

/// Output column named by a bare identifier in ORDER BY
fn output_by_name<'o>(expr: &SqlExpr, outputs: &'o [OutputColumn]) -> Result<Option<&'o OutputColumn>> {
    let SqlExpr::Identifier(ident) = expr else {
        return Ok(None);
    };
    let mut matches = outputs
        .iter()
        .filter(|o| o.name.eq_ignore_ascii_case(&ident.value));
    let Some(first) = matches.next() else {
        return Ok(None);
    };
    if matches.any(|o| o.source != first.source) {
        return Err(QueryError::AmbiguousColumn(ident.value.clone()));
    }
    Ok(Some(first))
}

/// Output column named by a position in ORDER BY
fn output_by_ordinal<'o>(expr: &SqlExpr, outputs: &'o [OutputColumn]) -> Result<Option<&'o OutputColumn>> {
    let SqlExpr::Value(Value::Number(text, _)) = expr else {
        return Ok(None);
    };
    let out_of_range = || {
        QueryError::Semantic(format!(
            "The ORDER BY position number {} is out of range of the number of items in the select list.",
            text
        ))
    };
    let position: usize = text.parse().map_err(|_| out_of_range())?;
    match position.checked_sub(1).and_then(|i| outputs.get(i)) {
        Some(output) => Ok(Some(output)),
        None => Err(out_of_range()),
    }
}

fn output_name(expr: &SqlExpr) -> String {
    match expr {
        SqlExpr::Identifier(ident) => ident.value.clone(),
        SqlExpr::CompoundIdentifier(parts) => {
            parts.last().map(|i| i.value.clone()).unwrap_or_default()
        }
        _ => String::new(),
    }
}

fn check_select_clauses(select: &Select) -> Result<()> {
    if select.into.is_some() {
        return Err(QueryError::not_supported_with(
            "SELECT INTO",
            "Use CREATE TABLE #name followed by INSERT INTO #name SELECT ...",
        ));
    }
    if let Some(ast::Distinct::On(_)) = &select.distinct {
        return Err(QueryError::not_supported("DISTINCT ON"));
    }
    if !select.named_window.is_empty() {
        return Err(QueryError::not_supported_with(
            "WINDOW clause",
            "Define the window inline in OVER (...)",
        ));
    }
    if !select.lateral_views.is_empty() {
        return Err(QueryError::not_supported("LATERAL VIEW"));
    }
    if let Some(qualify) = &select.qualify {
        return Err(QueryError::not_supported(format!("QUALIFY {}", qualify)));
    }
    if let Some(prewhere) = &select.prewhere {
        return Err(QueryError::not_supported(format!("PREWHERE {}", prewhere)));
    }
    Ok(())
}

impl BuildContext<'_> {
    /// Bind a complete query, including its WITH clause and ORDER BY / OFFSET
    pub(crate) fn bind_query(&mut self, query: &Query, outer: Option<&Scope>) -> Result<BoundQuery> {
        if query.limit.is_some() || !query.limit_by.is_empty() {
            return Err(QueryError::not_supported_with(
                "LIMIT",
                "Use TOP or OFFSET ... FETCH",
            ));
        }
        if let Some(clause) = &query.for_clause {
            return Err(QueryError::not_supported(clause.to_string()));
        }

        let visible_ctes = self.ctes.len();
        self.query_depth += 1;
        let result = self.bind_query_body(query, outer);
        self.query_depth -= 1;
        self.ctes.truncate(visible_ctes);
        result
    }

    fn bind_query_body(&mut self, query: &Query, outer: Option<&Scope>) -> Result<BoundQuery> {
        if let Some(with) = &query.with {
            self.register_ctes(with)?;
        }
        let tail = QueryTail::of(query);
        match query.body.as_ref() {
            SetExpr::Select(select) => self.bind_select(select, tail, outer),
            body => {
                let bound = self.bind_set_expr(body, outer)?;
                self.apply_set_tail(bound, tail)
            }
        }
    }

    fn check_order_by_placement(&self, has_top: bool, tail: QueryTail) -> Result<()> {
        if self.query_depth > 1 && !tail.order_by.is_empty() && !has_top && !tail.has_offset() {
            return Err(QueryError::Semantic(ORDER_BY_IN_SUBQUERY.to_string()));
        }
        Ok(())
    }

    /// Bind the body of a query without its ORDER BY / OFFSET
    pub(crate) fn bind_set_expr(&mut self, body: &SetExpr, outer: Option<&Scope>) -> Result<BoundQuery> {
        match body {
            SetExpr::Select(select) => self.bind_select(select, QueryTail::default(), outer),
            SetExpr::Query(query) => self.bind_query(query, outer),
            SetExpr::Values(values) => self.bind_values(values, outer),
            SetExpr::SetOperation {
                op: SetOperator::Union,
                ..
            } => {
                let mut members = vec![];
                flatten_union(body, &mut members);
                let mut captured = vec![];
                let mut pending: Vec<QueryPlan> = vec![];
                for (member, quantifier) in members {
                    let bound = self.bind_set_expr(member, outer)?;
                    captured.extend(bound.captured);
                    pending.push(bound.plan);
                    // `a UNION ALL b UNION c` removes duplicates from all three
                    if quantifier.is_some() && !is_union_all(quantifier) {
                        let combined = self.combine_union(std::mem::take(&mut pending), true)?;
                        pending.push(combined);
                    }
                }
                let plan = match pending.len() {
                    1 => pending.remove(0),
                    _ => self.combine_union(pending, false)?,
                };
                Ok(BoundQuery { plan, captured })
            }
            SetExpr::SetOperation {
                op,
                set_quantifier,
                left,
                right,
            } => self.bind_intersect_except(*op, *set_quantifier, left, right, outer),
            other => Err(QueryError::not_supported(other.to_string())),
        }
    }

    /// Concatenate branches with matching column counts, optionally removing duplicates
    pub(crate) fn combine_union(&mut self, plans: Vec<QueryPlan>, distinct: bool) -> Result<QueryPlan> {
        let Some(first) = plans.first() else {
            return Err(QueryError::Internal("UNION without inputs".into()));
        };
        let width = first.columns.len();
        if plans.iter().any(|p| p.columns.len() != width) {
            return Err(QueryError::Semantic(COLUMN_COUNT_MISMATCH.to_string()));
        }

        let schemas: Vec<PlanSchema> = plans.iter().map(|p| p.schema()).collect();
        let mut columns = Vec::with_capacity(width);
        for i in 0..width {
            let mut data_type = ArrowDataType::Null;
            let mut nullable = false;
            let mut sources = Vec::with_capacity(plans.len());
            for (plan, schema) in plans.iter().zip(&schemas) {
                let source = &plan.columns[i].source;
                let (_, field) = schema.resolve_column(source)?;
                data_type = common_type(&data_type, &field.data_type)?;
                nullable |= field.nullable;
                sources.push(source.clone());
            }
            columns.push(ConcatColumn {
                name: self.next_expr_name(),
                data_type,
                nullable,
                visible: true,
                sources,
            });
        }

        let outputs: Vec<OutputColumn> = first
            .columns
            .iter()
            .zip(&columns)
            .map(|(output, column)| OutputColumn {
                name: output.name.clone(),
                source: Column::new(column.name.clone()),
            })
            .collect();
        let distinct_columns: Vec<Column> = outputs.iter().map(|o| o.source.clone()).collect();
        debug!(inputs = plans.len(), distinct, "UNION lowered to concatenate");

        let mut root = Arc::new(PlanOperator::Concatenate(ConcatenateNode {
            inputs: plans.into_iter().map(|p| p.root).collect(),
            columns,
        }));
        if distinct {
            root = Arc::new(PlanOperator::Distinct(DistinctNode {
                input: root,
                columns: distinct_columns,
            }));
        }
        Ok(QueryPlan::new(root, outputs))
    }

    /// INTERSECT keeps distinct left rows with a match on the right, EXCEPT those without
    fn bind_intersect_except(
        &mut self,
        op: SetOperator,
        quantifier: SetQuantifier,
        left: &SetExpr,
        right: &SetExpr,
        outer: Option<&Scope>,
    ) -> Result<BoundQuery> {
        let except = match op {
            SetOperator::Intersect => false,
            SetOperator::Except => true,
            other => return Err(QueryError::not_supported(other.to_string())),
        };
        if matches!(quantifier, SetQuantifier::All) {
            return Err(QueryError::not_supported(format!("{} ALL", op)));
        }

        let left = self.bind_set_expr(left, outer)?;
        let right = self.bind_set_expr(right, outer)?;
        if left.plan.columns.len() != right.plan.columns.len() {
            return Err(QueryError::Semantic(COLUMN_COUNT_MISMATCH.to_string()));
        }

        let alias = self.next_expr_name();
        let names: Vec<String> = (0..right.plan.columns.len())
            .map(|_| self.next_expr_name())
            .collect();
        let right_source = self.alias_plan(right.plan, &alias, &names)?;
        let left_schema = left.plan.schema();
        let right_schema = right_source.plan.schema();

        let mut conditions = Vec::with_capacity(names.len());
        for (output, name) in left.plan.columns.iter().zip(&names) {
            let l = Expr::Column(output.source.clone());
            let r = Expr::qualified_column(alias.clone(), name.clone());
            check_comparable(&l.data_type(&left_schema)?, &r.data_type(&right_schema)?)?;
            // NULLs compare equal for set operations
            conditions.push(
                l.clone()
                    .eq(r.clone())
                    .or(l.is_null().and(r.is_null())),
            );
        }

        let distinct = Arc::new(PlanOperator::Distinct(DistinctNode {
            input: left.plan.root,
            columns: left.plan.columns.iter().map(|o| o.source.clone()).collect(),
        }));
        let join = JoinNode {
            left: distinct,
            right: self.eager_spool(right_source.plan),
            join_type: if except {
                JoinType::LeftOuter
            } else {
                JoinType::Inner
            },
            strategy: JoinStrategy::NestedLoop {
                outer_references: vec![],
            },
            output: JoinOutput::Left,
            anti_join: except,
            condition: Expr::conjunction(conditions),
            defined_values: vec![],
        };
        debug!(%op, "set operation lowered to semi-join");

        let mut captured = left.captured;
        captured.extend(right.captured);
        Ok(BoundQuery {
            plan: QueryPlan::new(Arc::new(PlanOperator::Join(join)), left.plan.columns),
            captured,
        })
    }

    /// `VALUES (...), (...)` as a constant table with unnamed columns
    fn bind_values(&mut self, values: &ast::Values, outer: Option<&Scope>) -> Result<BoundQuery> {
        let scope = Scope::new(PlanSchema::empty(), outer);
        let width = values.rows.first().map(|r| r.len()).unwrap_or(0);
        let mut rows = Vec::with_capacity(values.rows.len());
        let mut types = vec![ArrowDataType::Null; width];
        let mut nullable = vec![false; width];
        for row in &values.rows {
            if row.len() != width {
                return Err(QueryError::Semantic(
                    "Each row of a table value constructor must have the same number of values"
                        .to_string(),
                ));
            }
            let mut bound_row = Vec::with_capacity(width);
            for (i, expr) in row.iter().enumerate() {
                if contains_subquery(expr) {
                    return Err(QueryError::not_supported_with(
                        "subquery in VALUES",
                        "Use SELECT ... UNION ALL SELECT ... instead",
                    ));
                }
                let bound = self.bind_checked(expr, &scope)?;
                types[i] = common_type(&types[i], &bound.data_type(&scope.schema)?)?;
                nullable[i] |= bound.nullable(&scope.schema);
                bound_row.push(bound);
            }
            rows.push(bound_row);
        }

        let columns: Vec<ConstantColumn> = types
            .into_iter()
            .zip(nullable)
            .map(|(data_type, nullable)| ConstantColumn {
                name: self.next_expr_name(),
                data_type,
                nullable,
            })
            .collect();
        let outputs = columns
            .iter()
            .map(|c| OutputColumn {
                name: String::new(),
                source: Column::new(c.name.clone()),
            })
            .collect();
        let root = Arc::new(PlanOperator::ConstantRow(ConstantRowNode { columns, rows }));
        Ok(BoundQuery {
            plan: QueryPlan::new(root, outputs),
            captured: scope.captured(),
        })
    }

    /// ORDER BY / OFFSET of a set operation: only output names and positions
    fn apply_set_tail(&mut self, mut bound: BoundQuery, tail: QueryTail) -> Result<BoundQuery> {
        self.check_order_by_placement(false, tail)?;
        if tail.order_by.is_empty() && !tail.has_offset() {
            return Ok(bound);
        }

        let mut keys = Vec::with_capacity(tail.order_by.len());
        for item in tail.order_by {
            let output = match output_by_name(&item.expr, &bound.plan.columns)? {
                Some(output) => output,
                None => output_by_ordinal(&item.expr, &bound.plan.columns)?
                    .ok_or_else(|| QueryError::Semantic(SET_ORDER_BY.to_string()))?,
            };
            keys.push(SortKey {
                column: output.source.clone(),
                direction: sort_direction(item),
            });
        }

        let mut root = bound.plan.root;
        if !keys.is_empty() && !root.schema().is_sorted_by(&keys) {
            root = Arc::new(PlanOperator::Sort(SortNode { input: root, keys }));
        }
        bound.plan.root = self.apply_offset_fetch(root, tail)?;
        Ok(bound)
    }

    fn bind_select(&mut self, select: &Select, tail: QueryTail, outer: Option<&Scope>) -> Result<BoundQuery> {
        check_select_clauses(select)?;
        self.check_order_by_placement(select.top.is_some(), tail)?;

        let mut scope = Scope::new(PlanSchema::empty(), outer);
        let source = self.bind_from(&select.from, &scope)?;
        let mut plan = source.plan;
        scope.schema = plan.schema();
        scope.tables = source.tables;
        let mut errors = ErrorCollector::new();

        if let Some(selection) = &select.selection {
            extend_clause(&mut errors, &mut plan, &mut scope, |p, s| {
                self.bind_where(selection, p, s)
            });
        }

        if needs_aggregate(select, tail.order_by)? {
            let aggregated = extend_clause(&mut errors, &mut plan, &mut scope, |p, s| {
                self.bind_aggregate(select, tail.order_by, p, s)
            });
            if !aggregated {
                // The select list and ORDER BY read the aggregate output
                extend_clause(&mut errors, &mut plan, &mut scope, |p, _| {
                    self.bind_row_limits(select, tail, p)
                });
                return Err(errors.into_error());
            }
            if let Some(having) = &select.having {
                extend_clause(&mut errors, &mut plan, &mut scope, |p, s| {
                    self.bind_having(having, p, s)
                });
            }
        }

        let mut exprs: Vec<&SqlExpr> = select
            .projection
            .iter()
            .filter_map(|item| match item {
                SelectItem::UnnamedExpr(e) | SelectItem::ExprWithAlias { expr: e, .. } => Some(e),
                _ => None,
            })
            .collect();
        exprs.extend(tail.order_by.iter().map(|o| &o.expr));
        extend_clause(&mut errors, &mut plan, &mut scope, |p, s| {
            self.plan_subqueries(&exprs, p, s)
        });
        extend_clause(&mut errors, &mut plan, &mut scope, |p, s| {
            self.bind_windows(&exprs, p, s)
        });

        let outputs = match self.bind_projection(select, &scope) {
            Ok((values, outputs)) => {
                if !values.is_empty() {
                    plan = Arc::new(PlanOperator::ComputeScalar(ComputeScalarNode {
                        input: plan,
                        values,
                    }));
                    scope.schema = plan.schema();
                }
                outputs
            }
            Err(e) => {
                errors.push(e);
                if let Err(e) = self.check_order_by(select, tail.order_by, &scope) {
                    errors.push(e);
                }
                extend_clause(&mut errors, &mut plan, &mut scope, |p, _| {
                    self.bind_row_limits(select, tail, p)
                });
                return Err(errors.into_error());
            }
        };

        let distinct = matches!(select.distinct, Some(ast::Distinct::Distinct));
        if distinct {
            let mut columns: Vec<Column> = vec![];
            for output in &outputs {
                if !columns.contains(&output.source) {
                    columns.push(output.source.clone());
                }
            }
            plan = Arc::new(PlanOperator::Distinct(DistinctNode {
                input: plan,
                columns,
            }));
            scope.schema = plan.schema();
        }

        if !tail.order_by.is_empty() {
            extend_clause(&mut errors, &mut plan, &mut scope, |p, s| {
                self.bind_order_by(tail.order_by, &outputs, distinct, p, s)
            });
        }

        extend_clause(&mut errors, &mut plan, &mut scope, |p, _| {
            self.bind_row_limits(select, tail, p)
        });

        errors.finish()?;
        trace!(columns = outputs.len(), "query block bound");
        Ok(BoundQuery {
            plan: QueryPlan::new(plan, outputs),
            captured: scope.captured(),
        })
    }

    /// TOP, or OFFSET/FETCH, over the ordered result
    fn bind_row_limits(
        &mut self,
        select: &Select,
        tail: QueryTail,
        plan: Arc<PlanOperator>,
    ) -> Result<Arc<PlanOperator>> {
        let has_order = !tail.order_by.is_empty();
        if let Some(top) = &select.top {
            return self.bind_top(top, tail, has_order, plan);
        }
        if tail.has_offset() && !has_order {
            return Err(QueryError::Semantic(
                "OFFSET and FETCH require an ORDER BY clause".to_string(),
            ));
        }
        self.apply_offset_fetch(plan, tail)
    }

    /// Resolve ORDER BY items against the FROM scope when the select list
    /// failed to bind. Aliases and positions of the select list are skipped.
    fn check_order_by(&mut self, select: &Select, order_by: &[OrderByExpr], scope: &Scope) -> Result<()> {
        let aliases: Vec<String> = select
            .projection
            .iter()
            .filter_map(|item| match item {
                SelectItem::ExprWithAlias { alias, .. } => Some(alias.value.clone()),
                SelectItem::UnnamedExpr(e) => Some(output_name(e)),
                _ => None,
            })
            .collect();
        for item in order_by {
            match &item.expr {
                SqlExpr::Value(Value::Number(..)) => continue,
                SqlExpr::Identifier(ident)
                    if aliases.iter().any(|a| a.eq_ignore_ascii_case(&ident.value)) =>
                {
                    continue
                }
                _ => {}
            }
            // Subqueries and windows were already checked with the select list
            let mut windows = vec![];
            collect_windows(&item.expr, &mut windows);
            if windows.is_empty() && !contains_subquery(&item.expr) {
                self.bind_checked(&item.expr, scope)?;
            }
        }
        Ok(())
    }

    fn bind_where(
        &mut self,
        selection: &SqlExpr,
        plan: Arc<PlanOperator>,
        scope: &mut Scope,
    ) -> Result<Arc<PlanOperator>> {
        let mut aggregates = vec![];
        collect_aggregates(selection, &mut aggregates);
        if !aggregates.is_empty() {
            return Err(QueryError::Semantic(
                "An aggregate may not appear in the WHERE clause unless it is in a subquery contained in a HAVING clause or a select list, and the column being aggregated is an outer reference."
                    .to_string(),
            ));
        }
        let plan = self.plan_subqueries(&[selection], plan, scope)?;
        let predicate = self.bind_predicate(selection, scope)?;
        Ok(Arc::new(PlanOperator::Filter(FilterNode {
            input: plan,
            predicate,
        })))
    }

    fn bind_having(
        &mut self,
        having: &SqlExpr,
        plan: Arc<PlanOperator>,
        scope: &mut Scope,
    ) -> Result<Arc<PlanOperator>> {
        let plan = self.plan_subqueries(&[having], plan, scope)?;
        let predicate = self.bind_predicate(having, scope)?;
        Ok(Arc::new(PlanOperator::Filter(FilterNode {
            input: plan,
            predicate,
        })))
    }

    /// Output columns plus the computed values they need
    fn bind_projection(
        &mut self,
        select: &Select,
        scope: &Scope,
    ) -> Result<(Vec<DefinedValue>, Vec<OutputColumn>)> {
        let mut values = vec![];
        let mut outputs = vec![];
        for item in &select.projection {
            match item {
                SelectItem::Wildcard(options) => {
                    self.check_wildcard_options(options)?;
                    if scope.tables.is_empty() {
                        return Err(QueryError::Semantic(
                            "Must specify table to select from.".to_string(),
                        ));
                    }
                    for table in &scope.tables {
                        outputs.extend(self.expand_wildcard(table, scope)?);
                    }
                }
                SelectItem::QualifiedWildcard(name, options) => {
                    self.check_wildcard_options(options)?;
                    let relation = name.base_name();
                    let star_schema = scope.pre_aggregate.as_ref().unwrap_or(&scope.schema);
                    if !star_schema.has_relation(&relation) {
                        return Err(QueryError::Semantic(format!(
                            "The column prefix '{}' does not match with a table name or alias name used in the query.",
                            name
                        )));
                    }
                    outputs.extend(self.expand_wildcard(&relation, scope)?);
                }
                SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => {
                    let name = match item {
                        SelectItem::ExprWithAlias { alias, .. } => alias.value.clone(),
                        _ => output_name(expr),
                    };
                    let bound = self.bind_checked(expr, scope)?;
                    let (source, defined) = self.column_or_hoist(bound, &scope.schema)?;
                    values.extend(defined);
                    outputs.push(OutputColumn { name, source });
                }
            }
        }
        Ok((values, outputs))
    }

    fn check_wildcard_options(&self, options: &ast::WildcardAdditionalOptions) -> Result<()> {
        if options.opt_exclude.is_some()
            || options.opt_except.is_some()
            || options.opt_replace.is_some()
            || options.opt_rename.is_some()
        {
            return Err(QueryError::not_supported(format!("*{}", options)));
        }
        Ok(())
    }

    /// Visible columns of one source; after GROUP BY each must be grouped
    fn expand_wildcard(&mut self, relation: &str, scope: &Scope) -> Result<Vec<OutputColumn>> {
        let star_schema = scope.pre_aggregate.as_ref().unwrap_or(&scope.schema);
        let mut outputs = vec![];
        for field in star_schema.visible_fields(Some(relation)) {
            let column = Column::new_qualified(relation, field.name.clone());
            let source = match scope.resolve(&column, &mut || self.next_param())? {
                Expr::Column(c) => c,
                other => {
                    return Err(QueryError::Internal(format!(
                        "wildcard column {} resolved to {:?}",
                        column, other
                    )))
                }
            };
            outputs.push(OutputColumn {
                name: field.name.clone(),
                source,
            });
        }
        Ok(outputs)
    }

    /// Sort by output aliases, positions, or any expression over the input
    fn bind_order_by(
        &mut self,
        order_by: &[OrderByExpr],
        outputs: &[OutputColumn],
        distinct: bool,
        plan: Arc<PlanOperator>,
        scope: &mut Scope,
    ) -> Result<Arc<PlanOperator>> {
        let mut keys = Vec::with_capacity(order_by.len());
        let mut hoisted = vec![];
        for item in order_by {
            let direction = sort_direction(item);
            if let Some(output) = output_by_name(&item.expr, outputs)? {
                keys.push(SortKey {
                    column: output.source.clone(),
                    direction,
                });
                continue;
            }
            if let Some(output) = output_by_ordinal(&item.expr, outputs)? {
                keys.push(SortKey {
                    column: output.source.clone(),
                    direction,
                });
                continue;
            }

            let bound = self.bind_checked(&item.expr, scope).map_err(|e| {
                if distinct {
                    QueryError::Semantic(DISTINCT_ORDER_BY.to_string())
                } else {
                    e
                }
            })?;
            let (column, defined) = self.column_or_hoist(bound, &scope.schema)?;
            if distinct && (defined.is_some() || !outputs.iter().any(|o| o.source == column)) {
                return Err(QueryError::Semantic(DISTINCT_ORDER_BY.to_string()));
            }
            hoisted.extend(defined);
            keys.push(SortKey { column, direction });
        }

        let mut plan = plan;
        if !hoisted.is_empty() {
            plan = Arc::new(PlanOperator::ComputeScalar(ComputeScalarNode {
                input: plan,
                values: hoisted,
            }));
        }
        if plan.schema().is_sorted_by(&keys) {
            return Ok(plan);
        }
        Ok(Arc::new(PlanOperator::Sort(SortNode { input: plan, keys })))
    }

    fn bind_top(
        &mut self,
        top: &ast::Top,
        tail: QueryTail,
        has_order: bool,
        plan: Arc<PlanOperator>,
    ) -> Result<Arc<PlanOperator>> {
        if tail.has_offset() {
            return Err(QueryError::Semantic(
                "A TOP can not be used in the same query or sub-query as a OFFSET.".to_string(),
            ));
        }
        if top.with_ties && !has_order {
            return Err(QueryError::Semantic(
                "The TOP N WITH TIES clause is not allowed without a corresponding ORDER BY clause."
                    .to_string(),
            ));
        }
        let count = match &top.quantity {
            Some(ast::TopQuantity::Expr(expr)) => self.bind_row_count(expr, "TOP")?,
            Some(ast::TopQuantity::Constant(n)) => {
                let n = i64::try_from(*n).map_err(|_| {
                    QueryError::Semantic(format!("TOP {} is out of range", n))
                })?;
                Expr::Literal(ScalarValue::Int64(n))
            }
            None => return Err(QueryError::Semantic("TOP requires a row count".to_string())),
        };
        Ok(Arc::new(PlanOperator::Top(TopNode {
            input: plan,
            count,
            percent: top.percent,
            with_ties: top.with_ties,
        })))
    }

    fn apply_offset_fetch(&mut self, plan: Arc<PlanOperator>, tail: QueryTail) -> Result<Arc<PlanOperator>> {
        if !tail.has_offset() {
            return Ok(plan);
        }
        let Some(offset) = tail.offset else {
            return Err(QueryError::not_supported_with(
                "FETCH without OFFSET",
                "Add OFFSET 0 ROWS before FETCH",
            ));
        };
        let offset = self.bind_row_count(&offset.value, "OFFSET")?;
        let fetch = match tail.fetch {
            Some(fetch) if fetch.percent || fetch.with_ties => {
                return Err(QueryError::not_supported(fetch.to_string()))
            }
            Some(fetch) => match &fetch.quantity {
                Some(quantity) => Some(self.bind_row_count(quantity, "FETCH")?),
                None => None,
            },
            None => None,
        };
        Ok(Arc::new(PlanOperator::OffsetFetch(OffsetFetchNode {
            input: plan,
            offset,
            fetch,
        })))
    }

    /// Row count of TOP, OFFSET or FETCH: constants and variables only
    fn bind_row_count(&mut self, expr: &SqlExpr, clause: &str) -> Result<Expr> {
        let scope = Scope::new(PlanSchema::empty(), None);
        let bound = self.bind_checked(expr, &scope)?;
        let data_type = bound.data_type(&scope.schema)?;
        if !is_numeric(&data_type) {
            return Err(QueryError::TypeMismatch(format!(
                "The number of rows provided for a {} clause must be an integer.",
                clause
            )));
        }
        Ok(bound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Ident;

    fn outputs() -> Vec<OutputColumn> {
        vec![
            OutputColumn {
                name: "name".into(),
                source: Column::new_qualified("a", "name"),
            },
            OutputColumn {
                name: "total".into(),
                source: Column::new("Expr3"),
            },
        ]
    }

    #[test]
    fn test_order_by_output_alias_and_position() {
        let outputs = outputs();
        let by_name = output_by_name(&SqlExpr::Identifier(Ident::new("TOTAL")), &outputs).unwrap();
        assert_eq!(by_name.unwrap().source, Column::new("Expr3"));

        let number = SqlExpr::Value(Value::Number("1".into(), false));
        let by_position = output_by_ordinal(&number, &outputs).unwrap();
        assert_eq!(by_position.unwrap().name, "name");
    }

    #[test]
    fn test_order_by_position_out_of_range() {
        let outputs = outputs();
        for text in ["0", "3"] {
            let number = SqlExpr::Value(Value::Number(text.into(), false));
            let err = output_by_ordinal(&number, &outputs).unwrap_err();
            assert!(err.to_string().contains("out of range"));
        }
    }
}
