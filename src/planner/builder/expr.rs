//! Expression binding

use super::scope::Scope;
use super::BuildContext;
use crate::error::{QueryError, Result};
use crate::parser::{expr_key, SqlDataType, SqlExpr};
use crate::planner::{
    datetime_type, is_string, AggregateType, BinaryOp, Collation, Column, Expr, PlanSchema,
    ScalarFunction, ScalarValue, SortDirection, UnaryOp, GUID_TYPE,
};
use arrow::datatypes::DataType as ArrowDataType;
use ordered_float::OrderedFloat;
use rust_decimal::Decimal;
use sqlparser::ast::{self, FunctionArg, FunctionArgExpr, FunctionArguments, WindowType};
use std::str::FromStr;

/// Visit `expr` and its sub-expressions, descending while `f` returns true.
/// Subquery bodies are not entered.
pub(crate) fn walk_sql_expr(expr: &SqlExpr, f: &mut dyn FnMut(&SqlExpr) -> bool) {
    if !f(expr) {
        return;
    }
    match expr {
        SqlExpr::BinaryOp { left, right, .. } => {
            walk_sql_expr(left, f);
            walk_sql_expr(right, f);
        }
        SqlExpr::UnaryOp { expr, .. }
        | SqlExpr::Nested(expr)
        | SqlExpr::IsNull(expr)
        | SqlExpr::IsNotNull(expr)
        | SqlExpr::Cast { expr, .. }
        | SqlExpr::Collate { expr, .. }
        | SqlExpr::Ceil { expr, .. }
        | SqlExpr::Floor { expr, .. }
        | SqlExpr::Trim { expr, .. }
        | SqlExpr::InSubquery { expr, .. } => walk_sql_expr(expr, f),
        SqlExpr::Convert { expr, .. } => walk_sql_expr(expr, f),
        SqlExpr::InList { expr, list, .. } => {
            walk_sql_expr(expr, f);
            list.iter().for_each(|e| walk_sql_expr(e, f));
        }
        SqlExpr::Between {
            expr, low, high, ..
        } => {
            walk_sql_expr(expr, f);
            walk_sql_expr(low, f);
            walk_sql_expr(high, f);
        }
        SqlExpr::Like { expr, pattern, .. } | SqlExpr::ILike { expr, pattern, .. } => {
            walk_sql_expr(expr, f);
            walk_sql_expr(pattern, f);
        }
        SqlExpr::Case {
            operand,
            conditions,
            results,
            else_result,
        } => {
            if let Some(op) = operand {
                walk_sql_expr(op, f);
            }
            conditions.iter().for_each(|e| walk_sql_expr(e, f));
            results.iter().for_each(|e| walk_sql_expr(e, f));
            if let Some(e) = else_result {
                walk_sql_expr(e, f);
            }
        }
        SqlExpr::Substring {
            expr,
            substring_from,
            substring_for,
            ..
        } => {
            walk_sql_expr(expr, f);
            if let Some(e) = substring_from {
                walk_sql_expr(e, f);
            }
            if let Some(e) = substring_for {
                walk_sql_expr(e, f);
            }
        }
        SqlExpr::Function(func) => {
            for arg in function_arg_exprs(func) {
                walk_sql_expr(arg, f);
            }
            for o in &func.within_group {
                walk_sql_expr(&o.expr, f);
            }
            if let Some(WindowType::WindowSpec(spec)) = &func.over {
                spec.partition_by.iter().for_each(|e| walk_sql_expr(e, f));
                spec.order_by.iter().for_each(|o| walk_sql_expr(&o.expr, f));
            }
        }
        _ => {}
    }
}

/// Expression arguments of a function call, skipping `*`
pub(crate) fn function_arg_exprs(func: &ast::Function) -> Vec<&SqlExpr> {
    match &func.args {
        FunctionArguments::List(list) => list
            .args
            .iter()
            .filter_map(|arg| match arg {
                FunctionArg::Unnamed(FunctionArgExpr::Expr(e))
                | FunctionArg::Named {
                    arg: FunctionArgExpr::Expr(e),
                    ..
                } => Some(e),
                _ => None,
            })
            .collect(),
        _ => vec![],
    }
}

pub(crate) fn is_wildcard_call(func: &ast::Function) -> bool {
    match &func.args {
        FunctionArguments::List(list) => list
            .args
            .iter()
            .any(|a| matches!(a, FunctionArg::Unnamed(FunctionArgExpr::Wildcard))),
        _ => false,
    }
}

pub(crate) fn is_distinct_call(func: &ast::Function) -> bool {
    matches!(
        &func.args,
        FunctionArguments::List(list)
            if matches!(list.duplicate_treatment, Some(ast::DuplicateTreatment::Distinct))
    )
}

pub(crate) fn function_name(func: &ast::Function) -> String {
    func.name
        .0
        .last()
        .map(|i| i.value.to_ascii_uppercase())
        .unwrap_or_default()
}

/// Does the expression contain a subquery outside nested subqueries
pub(crate) fn contains_subquery(expr: &SqlExpr) -> bool {
    let mut found = false;
    walk_sql_expr(expr, &mut |e| {
        if matches!(
            e,
            SqlExpr::Subquery(_) | SqlExpr::Exists { .. } | SqlExpr::InSubquery { .. }
        ) {
            found = true;
        }
        !found
    });
    found
}

/// Direction of an ORDER BY item, ascending unless DESC is given
pub(crate) fn sort_direction(item: &ast::OrderByExpr) -> SortDirection {
    match item.asc {
        Some(false) => SortDirection::Desc,
        _ => SortDirection::Asc,
    }
}

/// Map a T-SQL type name to the arrow type used for its values
pub(crate) fn sql_type_to_arrow(data_type: &SqlDataType) -> Result<ArrowDataType> {
    let text = data_type.to_string().to_ascii_uppercase();
    let (base, args) = match text.find('(') {
        Some(i) => (text[..i].trim().to_string(), text[i + 1..].trim_end_matches(')').to_string()),
        None => (text.trim().to_string(), String::new()),
    };
    let numbers: Vec<u8> = args
        .split(',')
        .filter_map(|a| a.trim().parse::<u8>().ok())
        .collect();

    let arrow_type = match base.as_str() {
        "INT" | "INTEGER" => ArrowDataType::Int32,
        "BIGINT" => ArrowDataType::Int64,
        "SMALLINT" => ArrowDataType::Int16,
        "TINYINT" => ArrowDataType::UInt8,
        "BIT" | "BOOLEAN" => ArrowDataType::Boolean,
        "DECIMAL" | "NUMERIC" | "DEC" => {
            let precision = numbers.first().copied().unwrap_or(18);
            let scale = numbers.get(1).copied().unwrap_or(0);
            ArrowDataType::Decimal128(precision, scale as i8)
        }
        "MONEY" => ArrowDataType::Decimal128(19, 4),
        "SMALLMONEY" => ArrowDataType::Decimal128(10, 4),
        "FLOAT" | "REAL" | "DOUBLE" | "DOUBLE PRECISION" => ArrowDataType::Float64,
        "VARCHAR" | "NVARCHAR" | "CHAR" | "NCHAR" | "TEXT" | "NTEXT" | "STRING"
        | "CHARACTER VARYING" | "CHARACTER" => ArrowDataType::Utf8,
        "DATE" => ArrowDataType::Date32,
        "DATETIME" | "DATETIME2" | "SMALLDATETIME" | "DATETIMEOFFSET" | "TIMESTAMP" => {
            datetime_type()
        }
        "UNIQUEIDENTIFIER" => GUID_TYPE,
        _ => return Err(QueryError::not_supported(format!("data type {}", text))),
    };
    Ok(arrow_type)
}

fn bind_value(value: &ast::Value) -> Result<Expr> {
    match value {
        ast::Value::Number(n, _) => {
            if let Ok(i) = n.parse::<i32>() {
                return Ok(Expr::Literal(ScalarValue::Int32(i)));
            }
            if let Ok(i) = n.parse::<i64>() {
                return Ok(Expr::Literal(ScalarValue::Int64(i)));
            }
            if let Ok(d) = Decimal::from_str(n) {
                return Ok(Expr::Literal(ScalarValue::Decimal(d)));
            }
            n.parse::<f64>()
                .map(|f| Expr::Literal(ScalarValue::Float64(OrderedFloat(f))))
                .map_err(|_| QueryError::Parse(format!("Invalid number: {}", n)))
        }
        ast::Value::SingleQuotedString(s)
        | ast::Value::NationalStringLiteral(s)
        | ast::Value::DoubleQuotedString(s) => Ok(Expr::Literal(ScalarValue::Utf8(s.clone()))),
        ast::Value::Boolean(b) => Ok(Expr::Literal(ScalarValue::Boolean(*b))),
        ast::Value::Null => Ok(Expr::Literal(ScalarValue::Null)),
        other => Err(QueryError::not_supported(format!("literal {}", other))),
    }
}

fn convert_binary_op(op: &ast::BinaryOperator) -> Result<BinaryOp> {
    use ast::BinaryOperator as B;
    Ok(match op {
        B::Plus | B::StringConcat => BinaryOp::Add,
        B::Minus => BinaryOp::Subtract,
        B::Multiply => BinaryOp::Multiply,
        B::Divide => BinaryOp::Divide,
        B::Modulo => BinaryOp::Modulo,
        B::Eq => BinaryOp::Eq,
        B::NotEq => BinaryOp::NotEq,
        B::Lt => BinaryOp::Lt,
        B::LtEq => BinaryOp::LtEq,
        B::Gt => BinaryOp::Gt,
        B::GtEq => BinaryOp::GtEq,
        B::And => BinaryOp::And,
        B::Or => BinaryOp::Or,
        other => return Err(QueryError::not_supported(format!("operator {}", other))),
    })
}

/// Check that string comparisons resolve to a single collation
pub(crate) fn check_collations(expr: &Expr, schema: &PlanSchema, default: &Collation) -> Result<()> {
    let mut result = Ok(());
    expr.apply(&mut |e| {
        if result.is_err() {
            return;
        }
        if let Expr::BinaryExpr { left, op, right } = e {
            if op.is_comparison() {
                let both_strings = matches!(
                    (left.data_type(schema), right.data_type(schema)),
                    (Ok(l), Ok(r)) if is_string(&l) && is_string(&r)
                );
                if both_strings {
                    result = left
                        .collation_label(schema, default)
                        .and_then(|l| l.resolve_comparison(&right.collation_label(schema, default)?))
                        .map(|_| ());
                }
            }
        }
    });
    result
}

impl BuildContext<'_> {
    /// Bind an expression and check its types against the scope schema
    pub(crate) fn bind_checked(&mut self, expr: &SqlExpr, scope: &Scope) -> Result<Expr> {
        let bound = self.bind_expr(expr, scope)?;
        bound.data_type(&scope.schema)?;
        check_collations(&bound, &scope.schema, &self.options.default_collation)?;
        Ok(bound)
    }

    /// Bind a search condition, which must be boolean
    pub(crate) fn bind_predicate(&mut self, expr: &SqlExpr, scope: &Scope) -> Result<Expr> {
        let bound = self.bind_checked(expr, scope)?;
        match bound.data_type(&scope.schema)? {
            ArrowDataType::Boolean | ArrowDataType::Null => Ok(bound),
            _ => Err(QueryError::TypeMismatch(format!(
                "An expression of non-boolean type specified in a context where a condition is expected, near '{}'",
                expr
            ))),
        }
    }

    pub(crate) fn bind_expr(&mut self, expr: &SqlExpr, scope: &Scope) -> Result<Expr> {
        if let Some(rewritten) = scope.rewrites.get(&expr_key(expr)) {
            return Ok(rewritten.clone());
        }

        match expr {
            SqlExpr::Identifier(ident) => {
                if ident.quote_style.is_none() && ident.value.starts_with("@@") {
                    return Err(QueryError::not_supported(ident.value.clone()));
                }
                if ident.quote_style.is_none() && ident.value.starts_with('@') {
                    return self.variable_expr(&ident.value);
                }
                scope.resolve(&Column::new(ident.value.clone()), &mut || self.next_param())
            }
            SqlExpr::CompoundIdentifier(idents) => {
                let n = idents.len();
                if n < 2 {
                    return Err(QueryError::Parse(format!("Invalid identifier {}", expr)));
                }
                let col = Column::new_qualified(idents[n - 2].value.clone(), idents[n - 1].value.clone());
                if !scope.is_known_relation(&idents[n - 2].value) {
                    return Err(QueryError::Semantic(format!(
                        "The multi-part identifier \"{}\" could not be bound",
                        expr
                    )));
                }
                scope.resolve(&col, &mut || self.next_param())
            }
            SqlExpr::Value(value) => bind_value(value),
            SqlExpr::TypedString { data_type, value } => {
                if matches!(data_type, SqlDataType::Date) {
                    if let Ok(date) = chrono::NaiveDate::parse_from_str(value, "%Y-%m-%d") {
                        let days = date.signed_duration_since(chrono::NaiveDate::default()).num_days();
                        return Ok(Expr::Literal(ScalarValue::Date32(days as i32)));
                    }
                }
                Ok(Expr::Literal(ScalarValue::Utf8(value.clone())))
            }
            SqlExpr::BinaryOp { left, op, right } => {
                let left_expr = self.bind_expr(left, scope)?;
                let right_expr = self.bind_expr(right, scope)?;
                Ok(Expr::BinaryExpr {
                    left: Box::new(left_expr),
                    op: convert_binary_op(op)?,
                    right: Box::new(right_expr),
                })
            }
            SqlExpr::UnaryOp { op, expr } => {
                let bound = self.bind_expr(expr, scope)?;
                let op = match op {
                    ast::UnaryOperator::Not => UnaryOp::Not,
                    ast::UnaryOperator::Minus => UnaryOp::Negate,
                    ast::UnaryOperator::Plus => return Ok(bound),
                    other => return Err(QueryError::not_supported(format!("operator {}", other))),
                };
                Ok(Expr::UnaryExpr {
                    op,
                    expr: Box::new(bound),
                })
            }
            SqlExpr::Nested(inner) => self.bind_expr(inner, scope),
            SqlExpr::IsNull(inner) => Ok(self.bind_expr(inner, scope)?.is_null()),
            SqlExpr::IsNotNull(inner) => Ok(self.bind_expr(inner, scope)?.is_not_null()),
            SqlExpr::Between {
                expr,
                negated,
                low,
                high,
            } => Ok(Expr::Between {
                expr: Box::new(self.bind_expr(expr, scope)?),
                low: Box::new(self.bind_expr(low, scope)?),
                high: Box::new(self.bind_expr(high, scope)?),
                negated: *negated,
            }),
            SqlExpr::InList {
                expr,
                list,
                negated,
            } => {
                let bound = self.bind_expr(expr, scope)?;
                let list = list
                    .iter()
                    .map(|e| self.bind_expr(e, scope))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Expr::InList {
                    expr: Box::new(bound),
                    list,
                    negated: *negated,
                })
            }
            SqlExpr::Like {
                negated,
                expr,
                pattern,
                ..
            } => {
                let left = self.bind_expr(expr, scope)?;
                let right = self.bind_expr(pattern, scope)?;
                Ok(Expr::BinaryExpr {
                    left: Box::new(left),
                    op: if *negated {
                        BinaryOp::NotLike
                    } else {
                        BinaryOp::Like
                    },
                    right: Box::new(right),
                })
            }
            SqlExpr::Case {
                operand,
                conditions,
                results,
                else_result,
            } => {
                let operand = operand
                    .as_ref()
                    .map(|e| self.bind_expr(e, scope))
                    .transpose()?
                    .map(Box::new);
                let mut when_then = Vec::with_capacity(conditions.len());
                for (when, then) in conditions.iter().zip(results) {
                    when_then.push((self.bind_expr(when, scope)?, self.bind_expr(then, scope)?));
                }
                let else_expr = else_result
                    .as_ref()
                    .map(|e| self.bind_expr(e, scope))
                    .transpose()?
                    .map(Box::new);
                Ok(Expr::Case {
                    operand,
                    when_then,
                    else_expr,
                })
            }
            SqlExpr::Cast {
                expr, data_type, ..
            } => Ok(Expr::Cast {
                expr: Box::new(self.bind_expr(expr, scope)?),
                data_type: sql_type_to_arrow(data_type)?,
            }),
            SqlExpr::Convert {
                expr,
                data_type: Some(data_type),
                ..
            } => Ok(Expr::Cast {
                expr: Box::new(self.bind_expr(expr, scope)?),
                data_type: sql_type_to_arrow(data_type)?,
            }),
            SqlExpr::Collate { expr, collation } => Ok(Expr::Collate {
                expr: Box::new(self.bind_expr(expr, scope)?),
                collation: Collation::new(collation.to_string()),
            }),
            SqlExpr::Substring {
                expr,
                substring_from,
                substring_for,
                ..
            } => {
                let mut args = vec![self.bind_expr(expr, scope)?];
                args.push(match substring_from {
                    Some(e) => self.bind_expr(e, scope)?,
                    None => Expr::int(1),
                });
                args.push(match substring_for {
                    Some(e) => self.bind_expr(e, scope)?,
                    None => Expr::int(i32::MAX),
                });
                Ok(Expr::ScalarFunc {
                    func: ScalarFunction::Substring,
                    args,
                })
            }
            SqlExpr::Ceil { expr, .. } => Ok(Expr::ScalarFunc {
                func: ScalarFunction::Ceiling,
                args: vec![self.bind_expr(expr, scope)?],
            }),
            SqlExpr::Floor { expr, .. } => Ok(Expr::ScalarFunc {
                func: ScalarFunction::Floor,
                args: vec![self.bind_expr(expr, scope)?],
            }),
            SqlExpr::Trim {
                expr, trim_where, ..
            } => {
                let func = match trim_where {
                    Some(ast::TrimWhereField::Leading) => ScalarFunction::Ltrim,
                    Some(ast::TrimWhereField::Trailing) => ScalarFunction::Rtrim,
                    _ => ScalarFunction::Trim,
                };
                Ok(Expr::ScalarFunc {
                    func,
                    args: vec![self.bind_expr(expr, scope)?],
                })
            }
            SqlExpr::Function(func) => self.bind_function(func, scope),
            SqlExpr::Subquery(_) | SqlExpr::Exists { .. } | SqlExpr::InSubquery { .. } => {
                Err(QueryError::not_supported_with(
                    format!("subquery in {}", expr),
                    "Subqueries are supported in WHERE, HAVING and the select list",
                ))
            }
            other => Err(QueryError::not_supported(other.to_string())),
        }
    }

    fn bind_function(&mut self, func: &ast::Function, scope: &Scope) -> Result<Expr> {
        let name = function_name(func);

        if func.over.is_some() {
            return Err(QueryError::Semantic(format!(
                "Windowed functions can only appear in the SELECT or ORDER BY clauses ({})",
                name
            )));
        }
        if AggregateType::from_name(&name).is_some() {
            return Err(QueryError::Semantic(format!(
                "An aggregate may not appear in this clause unless it is in a subquery contained in a HAVING clause or a select list ({})",
                name
            )));
        }

        let scalar = ScalarFunction::from_name(&name)
            .ok_or_else(|| QueryError::not_supported(format!("function {}", name)))?;
        let args = function_arg_exprs(func);
        let (min, max) = scalar.arity();
        if args.len() < min || max.is_some_and(|m| args.len() > m) {
            return Err(QueryError::Semantic(format!(
                "The {} function requires {} argument(s), {} given",
                name,
                match max {
                    Some(m) if m == min => min.to_string(),
                    Some(m) => format!("{} to {}", min, m),
                    None => format!("at least {}", min),
                },
                args.len()
            )));
        }

        let mut bound = Vec::with_capacity(args.len());
        for (i, arg) in args.into_iter().enumerate() {
            if i == 0 && scalar.takes_datepart() {
                let part = match arg {
                    SqlExpr::Identifier(ident) => ident.value.to_lowercase(),
                    SqlExpr::Value(ast::Value::SingleQuotedString(s)) => s.to_lowercase(),
                    other => {
                        return Err(QueryError::Semantic(format!(
                            "Invalid parameter 1 specified for {}: {}",
                            name, other
                        )))
                    }
                };
                bound.push(Expr::Literal(ScalarValue::Utf8(part)));
            } else {
                bound.push(self.bind_expr(arg, scope)?);
            }
        }
        Ok(Expr::ScalarFunc {
            func: scalar,
            args: bound,
        })
    }

    /// Bind an expression, hoisting it into a computed column unless it already is one.
    /// Returns the column and, when hoisted, its definition.
    pub(crate) fn column_or_hoist(
        &mut self,
        expr: Expr,
        schema: &PlanSchema,
    ) -> Result<(Column, Option<crate::physical::DefinedValue>)> {
        if let Expr::Column(c) = &expr {
            return Ok((c.clone(), None));
        }
        let data_type = expr.data_type(schema)?;
        let nullable = expr.nullable(schema);
        let name = self.next_expr_name();
        Ok((
            Column::new(name.clone()),
            Some(crate::physical::DefinedValue::new(name, expr, data_type).with_nullable(nullable)),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sql_type_mapping() {
        assert_eq!(sql_type_to_arrow(&SqlDataType::Int(None)).unwrap(), ArrowDataType::Int32);
        assert_eq!(
            sql_type_to_arrow(&SqlDataType::Custom(
                ast::ObjectName(vec![ast::Ident::new("UNIQUEIDENTIFIER")]),
                vec![]
            ))
            .unwrap(),
            GUID_TYPE
        );
        assert!(matches!(
            sql_type_to_arrow(&SqlDataType::Custom(
                ast::ObjectName(vec![ast::Ident::new("GEOGRAPHY")]),
                vec![]
            )),
            Err(QueryError::NotSupported { .. })
        ));
    }

    #[test]
    fn test_number_literals() {
        assert_eq!(
            bind_value(&ast::Value::Number("42".into(), false)).unwrap(),
            Expr::int(42)
        );
        assert!(matches!(
            bind_value(&ast::Value::Number("3000000000".into(), false)).unwrap(),
            Expr::Literal(ScalarValue::Int64(_))
        ));
        assert!(matches!(
            bind_value(&ast::Value::Number("1.5".into(), false)).unwrap(),
            Expr::Literal(ScalarValue::Decimal(_))
        ));
    }
}
