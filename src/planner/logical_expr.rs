//! Bound expression types
//!
//! Expressions here are already resolved against an input schema: subqueries
//! have been replaced by references to join-defined columns and aggregates
//! by references to aggregate outputs, so an `Expr` only ever reads the row
//! of the operator that owns it plus variables and outer references.

use crate::error::{QueryError, Result};
use crate::planner::collation::{Collation, CollationLabel};
use crate::planner::schema::{Column, PlanSchema};
use arrow::datatypes::{DataType as ArrowDataType, TimeUnit};
use ordered_float::OrderedFloat;
use rust_decimal::Decimal;
use std::collections::BTreeSet;
use std::fmt;

/// Backend type used for unique identifiers
pub const GUID_TYPE: ArrowDataType = ArrowDataType::FixedSizeBinary(16);

pub fn datetime_type() -> ArrowDataType {
    ArrowDataType::Timestamp(TimeUnit::Millisecond, None)
}

/// Scalar value for literals
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ScalarValue {
    Null,
    Boolean(bool),
    Int32(i32),
    Int64(i64),
    Float64(OrderedFloat<f64>),
    Decimal(Decimal),
    Utf8(String),
    /// Days since 1970-01-01
    Date32(i32),
    /// Milliseconds since 1970-01-01
    Timestamp(i64),
}

impl ScalarValue {
    pub fn data_type(&self) -> ArrowDataType {
        match self {
            ScalarValue::Null => ArrowDataType::Null,
            ScalarValue::Boolean(_) => ArrowDataType::Boolean,
            ScalarValue::Int32(_) => ArrowDataType::Int32,
            ScalarValue::Int64(_) => ArrowDataType::Int64,
            ScalarValue::Float64(_) => ArrowDataType::Float64,
            ScalarValue::Decimal(d) => ArrowDataType::Decimal128(38, d.scale() as i8),
            ScalarValue::Utf8(_) => ArrowDataType::Utf8,
            ScalarValue::Date32(_) => ArrowDataType::Date32,
            ScalarValue::Timestamp(_) => datetime_type(),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ScalarValue::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ScalarValue::Int32(v) => Some(*v as i64),
            ScalarValue::Int64(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::Null => write!(f, "NULL"),
            ScalarValue::Boolean(v) => write!(f, "{}", if *v { 1 } else { 0 }),
            ScalarValue::Int32(v) => write!(f, "{}", v),
            ScalarValue::Int64(v) => write!(f, "{}", v),
            ScalarValue::Float64(v) => write!(f, "{}", v),
            ScalarValue::Decimal(v) => write!(f, "{}", v),
            ScalarValue::Utf8(v) => write!(f, "'{}'", v.replace('\'', "''")),
            ScalarValue::Date32(v) => write!(f, "DATE({})", v),
            ScalarValue::Timestamp(v) => write!(f, "DATETIME({})", v),
        }
    }
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
    Like,
    NotLike,
}

impl BinaryOp {
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOp::Eq
                | BinaryOp::NotEq
                | BinaryOp::Lt
                | BinaryOp::LtEq
                | BinaryOp::Gt
                | BinaryOp::GtEq
                | BinaryOp::Like
                | BinaryOp::NotLike
        )
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BinaryOp::Add => write!(f, "+"),
            BinaryOp::Subtract => write!(f, "-"),
            BinaryOp::Multiply => write!(f, "*"),
            BinaryOp::Divide => write!(f, "/"),
            BinaryOp::Modulo => write!(f, "%"),
            BinaryOp::Eq => write!(f, "="),
            BinaryOp::NotEq => write!(f, "<>"),
            BinaryOp::Lt => write!(f, "<"),
            BinaryOp::LtEq => write!(f, "<="),
            BinaryOp::Gt => write!(f, ">"),
            BinaryOp::GtEq => write!(f, ">="),
            BinaryOp::And => write!(f, "AND"),
            BinaryOp::Or => write!(f, "OR"),
            BinaryOp::Like => write!(f, "LIKE"),
            BinaryOp::NotLike => write!(f, "NOT LIKE"),
        }
    }
}

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Not,
    Negate,
    IsNull,
    IsNotNull,
}

impl fmt::Display for UnaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnaryOp::Not => write!(f, "NOT"),
            UnaryOp::Negate => write!(f, "-"),
            UnaryOp::IsNull => write!(f, "IS NULL"),
            UnaryOp::IsNotNull => write!(f, "IS NOT NULL"),
        }
    }
}

/// Functions computed by aggregate and sequence operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregateType {
    Count,
    CountStar,
    Sum,
    Avg,
    Min,
    Max,
    StringAgg,
    /// Value of the first row in the group, NULL included
    First,
    RowNumber,
    Rank,
    DenseRank,
}

impl AggregateType {
    /// Map a SQL function name to an aggregate usable with GROUP BY
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "COUNT" => Some(AggregateType::Count),
            "SUM" => Some(AggregateType::Sum),
            "AVG" => Some(AggregateType::Avg),
            "MIN" => Some(AggregateType::Min),
            "MAX" => Some(AggregateType::Max),
            "STRING_AGG" => Some(AggregateType::StringAgg),
            _ => None,
        }
    }

    pub fn is_ranking(&self) -> bool {
        matches!(
            self,
            AggregateType::RowNumber | AggregateType::Rank | AggregateType::DenseRank
        )
    }

    pub fn result_type(&self, arg_type: Option<&ArrowDataType>) -> ArrowDataType {
        match self {
            AggregateType::Count | AggregateType::CountStar => ArrowDataType::Int32,
            AggregateType::RowNumber | AggregateType::Rank | AggregateType::DenseRank => {
                ArrowDataType::Int64
            }
            AggregateType::Sum => arg_type.map(promote_sum_type).unwrap_or(ArrowDataType::Int32),
            AggregateType::Avg => match arg_type {
                Some(ArrowDataType::Decimal128(p, s)) => ArrowDataType::Decimal128(*p, *s),
                Some(t) if is_integer(t) => t.clone(),
                _ => ArrowDataType::Float64,
            },
            AggregateType::Min | AggregateType::Max | AggregateType::First => {
                arg_type.cloned().unwrap_or(ArrowDataType::Null)
            }
            AggregateType::StringAgg => ArrowDataType::Utf8,
        }
    }
}

impl fmt::Display for AggregateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AggregateType::Count => "COUNT",
            AggregateType::CountStar => "COUNT(*)",
            AggregateType::Sum => "SUM",
            AggregateType::Avg => "AVG",
            AggregateType::Min => "MIN",
            AggregateType::Max => "MAX",
            AggregateType::StringAgg => "STRING_AGG",
            AggregateType::First => "FIRST",
            AggregateType::RowNumber => "ROW_NUMBER",
            AggregateType::Rank => "RANK",
            AggregateType::DenseRank => "DENSE_RANK",
        };
        write!(f, "{}", name)
    }
}

/// Scalar functions evaluated row by row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarFunction {
    Abs,
    Ceiling,
    Floor,
    Round,
    Power,
    Sqrt,
    Upper,
    Lower,
    Trim,
    Ltrim,
    Rtrim,
    Len,
    Left,
    Right,
    Substring,
    Concat,
    Replace,
    Charindex,
    Year,
    Month,
    Day,
    DateAdd,
    DateDiff,
    DatePart,
    GetDate,
    GetUtcDate,
    Coalesce,
    IsNull,
    NullIf,
    Iif,
    NewId,
}

impl ScalarFunction {
    pub fn from_name(name: &str) -> Option<Self> {
        use ScalarFunction::*;
        let func = match name.to_ascii_uppercase().as_str() {
            "ABS" => Abs,
            "CEILING" => Ceiling,
            "FLOOR" => Floor,
            "ROUND" => Round,
            "POWER" => Power,
            "SQRT" => Sqrt,
            "UPPER" => Upper,
            "LOWER" => Lower,
            "TRIM" => Trim,
            "LTRIM" => Ltrim,
            "RTRIM" => Rtrim,
            "LEN" => Len,
            "LEFT" => Left,
            "RIGHT" => Right,
            "SUBSTRING" => Substring,
            "CONCAT" => Concat,
            "REPLACE" => Replace,
            "CHARINDEX" => Charindex,
            "YEAR" => Year,
            "MONTH" => Month,
            "DAY" => Day,
            "DATEADD" => DateAdd,
            "DATEDIFF" => DateDiff,
            "DATEPART" => DatePart,
            "GETDATE" => GetDate,
            "GETUTCDATE" => GetUtcDate,
            "COALESCE" => Coalesce,
            "ISNULL" => IsNull,
            "NULLIF" => NullIf,
            "IIF" => Iif,
            "NEWID" => NewId,
            _ => return None,
        };
        Some(func)
    }

    /// Accepted argument counts, `None` meaning unbounded
    pub fn arity(&self) -> (usize, Option<usize>) {
        use ScalarFunction::*;
        match self {
            GetDate | GetUtcDate | NewId => (0, Some(0)),
            Abs | Ceiling | Floor | Sqrt | Upper | Lower | Trim | Ltrim | Rtrim | Len | Year
            | Month | Day => (1, Some(1)),
            Power | Left | Right | IsNull | NullIf | DatePart => (2, Some(2)),
            Round | Charindex => (2, Some(3)),
            Substring | Replace | DateAdd | DateDiff | Iif => (3, Some(3)),
            Concat => (2, None),
            Coalesce => (1, None),
        }
    }

    /// Datepart functions take a bare keyword as their first argument
    pub fn takes_datepart(&self) -> bool {
        matches!(
            self,
            ScalarFunction::DateAdd | ScalarFunction::DateDiff | ScalarFunction::DatePart
        )
    }
}

impl fmt::Display for ScalarFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = format!("{:?}", self).to_ascii_uppercase();
        write!(f, "{}", name)
    }
}

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl fmt::Display for SortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortDirection::Asc => write!(f, "ASC"),
            SortDirection::Desc => write!(f, "DESC"),
        }
    }
}

/// Bound expression
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Column(Column),
    Literal(ScalarValue),
    /// Script variable or build parameter
    Variable {
        name: String,
        data_type: ArrowDataType,
    },
    /// Value captured from an outer row by a nested loop
    OuterReference {
        param: String,
        data_type: ArrowDataType,
    },
    BinaryExpr {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
    },
    UnaryExpr {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    ScalarFunc {
        func: ScalarFunction,
        args: Vec<Expr>,
    },
    Cast {
        expr: Box<Expr>,
        data_type: ArrowDataType,
    },
    Case {
        operand: Option<Box<Expr>>,
        when_then: Vec<(Expr, Expr)>,
        else_expr: Option<Box<Expr>>,
    },
    InList {
        expr: Box<Expr>,
        list: Vec<Expr>,
        negated: bool,
    },
    Between {
        expr: Box<Expr>,
        low: Box<Expr>,
        high: Box<Expr>,
        negated: bool,
    },
    Collate {
        expr: Box<Expr>,
        collation: Collation,
    },
}

impl Expr {
    pub fn column(name: impl Into<String>) -> Self {
        Expr::Column(Column::new(name))
    }

    pub fn qualified_column(relation: impl Into<String>, name: impl Into<String>) -> Self {
        Expr::Column(Column::new_qualified(relation, name))
    }

    pub fn literal(value: ScalarValue) -> Self {
        Expr::Literal(value)
    }

    pub fn int(value: i32) -> Self {
        Expr::Literal(ScalarValue::Int32(value))
    }

    fn binary(self, op: BinaryOp, other: Expr) -> Self {
        Expr::BinaryExpr {
            left: Box::new(self),
            op,
            right: Box::new(other),
        }
    }

    pub fn eq(self, other: Expr) -> Self {
        self.binary(BinaryOp::Eq, other)
    }

    pub fn lt_eq(self, other: Expr) -> Self {
        self.binary(BinaryOp::LtEq, other)
    }

    pub fn gt_eq(self, other: Expr) -> Self {
        self.binary(BinaryOp::GtEq, other)
    }

    pub fn add(self, other: Expr) -> Self {
        self.binary(BinaryOp::Add, other)
    }

    pub fn subtract(self, other: Expr) -> Self {
        self.binary(BinaryOp::Subtract, other)
    }

    pub fn and(self, other: Expr) -> Self {
        self.binary(BinaryOp::And, other)
    }

    pub fn or(self, other: Expr) -> Self {
        self.binary(BinaryOp::Or, other)
    }

    pub fn is_null(self) -> Self {
        Expr::UnaryExpr {
            op: UnaryOp::IsNull,
            expr: Box::new(self),
        }
    }

    pub fn is_not_null(self) -> Self {
        Expr::UnaryExpr {
            op: UnaryOp::IsNotNull,
            expr: Box::new(self),
        }
    }

    pub fn as_column(&self) -> Option<&Column> {
        match self {
            Expr::Column(c) => Some(c),
            _ => None,
        }
    }

    /// Visit this expression and every sub-expression, parents first
    pub fn apply(&self, f: &mut dyn FnMut(&Expr)) {
        f(self);
        match self {
            Expr::Column(_)
            | Expr::Literal(_)
            | Expr::Variable { .. }
            | Expr::OuterReference { .. } => {}
            Expr::BinaryExpr { left, right, .. } => {
                left.apply(f);
                right.apply(f);
            }
            Expr::UnaryExpr { expr, .. } | Expr::Cast { expr, .. } | Expr::Collate { expr, .. } => {
                expr.apply(f)
            }
            Expr::ScalarFunc { args, .. } => args.iter().for_each(|a| a.apply(f)),
            Expr::Case {
                operand,
                when_then,
                else_expr,
            } => {
                if let Some(op) = operand {
                    op.apply(f);
                }
                for (w, t) in when_then {
                    w.apply(f);
                    t.apply(f);
                }
                if let Some(e) = else_expr {
                    e.apply(f);
                }
            }
            Expr::InList { expr, list, .. } => {
                expr.apply(f);
                list.iter().for_each(|e| e.apply(f));
            }
            Expr::Between {
                expr, low, high, ..
            } => {
                expr.apply(f);
                low.apply(f);
                high.apply(f);
            }
        }
    }

    pub fn column_refs(&self) -> Vec<Column> {
        let mut columns = vec![];
        self.apply(&mut |e| {
            if let Expr::Column(c) = e {
                columns.push(c.clone());
            }
        });
        columns
    }

    pub fn variables(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        self.apply(&mut |e| {
            if let Expr::Variable { name, .. } = e {
                names.insert(name.clone());
            }
        });
        names
    }

    pub fn outer_references(&self) -> BTreeSet<String> {
        let mut params = BTreeSet::new();
        self.apply(&mut |e| {
            if let Expr::OuterReference { param, .. } = e {
                params.insert(param.clone());
            }
        });
        params
    }

    /// Split `a AND b AND c` into its conjuncts
    pub fn split_conjunction(&self) -> Vec<&Expr> {
        match self {
            Expr::BinaryExpr {
                left,
                op: BinaryOp::And,
                right,
            } => {
                let mut parts = left.split_conjunction();
                parts.extend(right.split_conjunction());
                parts
            }
            other => vec![other],
        }
    }

    pub fn conjunction(exprs: Vec<Expr>) -> Option<Expr> {
        exprs.into_iter().reduce(|acc, e| acc.and(e))
    }

    /// Infer the data type of this expression given an input schema
    pub fn data_type(&self, schema: &PlanSchema) -> Result<ArrowDataType> {
        match self {
            Expr::Column(col) => schema
                .resolve_column(col)
                .map(|(_, field)| field.data_type.clone()),
            Expr::Literal(v) => Ok(v.data_type()),
            Expr::Variable { data_type, .. } | Expr::OuterReference { data_type, .. } => {
                Ok(data_type.clone())
            }
            Expr::BinaryExpr { left, op, right } => {
                let left_type = left.data_type(schema)?;
                let right_type = right.data_type(schema)?;
                match op {
                    BinaryOp::And | BinaryOp::Or => Ok(ArrowDataType::Boolean),
                    op if op.is_comparison() => {
                        check_comparable(&left_type, &right_type)?;
                        Ok(ArrowDataType::Boolean)
                    }
                    BinaryOp::Add if is_string(&left_type) && is_string(&right_type) => {
                        Ok(ArrowDataType::Utf8)
                    }
                    BinaryOp::Add | BinaryOp::Subtract
                        if is_temporal(&left_type) && is_numeric(&right_type) =>
                    {
                        Ok(left_type)
                    }
                    _ => arithmetic_type(*op, &left_type, &right_type),
                }
            }
            Expr::UnaryExpr { op, expr } => match op {
                UnaryOp::Not | UnaryOp::IsNull | UnaryOp::IsNotNull => Ok(ArrowDataType::Boolean),
                UnaryOp::Negate => expr.data_type(schema),
            },
            Expr::ScalarFunc { func, args } => scalar_function_type(*func, args, schema),
            Expr::Cast { data_type, .. } => Ok(data_type.clone()),
            Expr::Case {
                operand,
                when_then,
                else_expr,
            } => {
                if let Some(operand) = operand {
                    let operand_type = operand.data_type(schema)?;
                    for (when, _) in when_then {
                        check_comparable(&operand_type, &when.data_type(schema)?)?;
                    }
                }
                let mut result = ArrowDataType::Null;
                for (_, then) in when_then {
                    result = common_type(&result, &then.data_type(schema)?)?;
                }
                if let Some(e) = else_expr {
                    result = common_type(&result, &e.data_type(schema)?)?;
                }
                Ok(result)
            }
            Expr::InList { expr, list, .. } => {
                let expr_type = expr.data_type(schema)?;
                for item in list {
                    check_comparable(&expr_type, &item.data_type(schema)?)?;
                }
                Ok(ArrowDataType::Boolean)
            }
            Expr::Between {
                expr, low, high, ..
            } => {
                let expr_type = expr.data_type(schema)?;
                check_comparable(&expr_type, &low.data_type(schema)?)?;
                check_comparable(&expr_type, &high.data_type(schema)?)?;
                Ok(ArrowDataType::Boolean)
            }
            Expr::Collate { expr, .. } => {
                let t = expr.data_type(schema)?;
                if !is_string(&t) && t != ArrowDataType::Null {
                    return Err(QueryError::TypeMismatch(format!(
                        "Expression type {} is invalid for COLLATE clause",
                        sql_type_name(&t)
                    )));
                }
                Ok(t)
            }
        }
    }

    pub fn nullable(&self, schema: &PlanSchema) -> bool {
        match self {
            Expr::Column(col) => schema
                .resolve_column(col)
                .map(|(_, f)| f.nullable)
                .unwrap_or(true),
            Expr::Literal(v) => v.is_null(),
            Expr::UnaryExpr {
                op: UnaryOp::IsNull | UnaryOp::IsNotNull,
                ..
            } => false,
            Expr::UnaryExpr { expr, .. } | Expr::Cast { expr, .. } | Expr::Collate { expr, .. } => {
                expr.nullable(schema)
            }
            Expr::BinaryExpr { left, right, .. } => left.nullable(schema) || right.nullable(schema),
            Expr::ScalarFunc {
                func: ScalarFunction::GetDate | ScalarFunction::GetUtcDate | ScalarFunction::NewId,
                ..
            } => false,
            Expr::ScalarFunc {
                func: ScalarFunction::IsNull | ScalarFunction::Coalesce,
                args,
            } => args.iter().all(|a| a.nullable(schema)),
            _ => true,
        }
    }

    /// Collation label of a string expression
    pub fn collation_label(&self, schema: &PlanSchema, default: &Collation) -> Result<CollationLabel> {
        match self {
            Expr::Column(col) => {
                let (_, field) = schema.resolve_column(col)?;
                Ok(CollationLabel::Implicit(
                    field.collation.clone().unwrap_or_else(|| default.clone()),
                ))
            }
            Expr::Collate { collation, .. } => Ok(CollationLabel::Explicit(collation.clone())),
            Expr::BinaryExpr {
                left,
                op: BinaryOp::Add,
                right,
            } => left
                .collation_label(schema, default)?
                .combine(&right.collation_label(schema, default)?),
            Expr::ScalarFunc { args, func } if !func.takes_datepart() => {
                let mut label = CollationLabel::CoercibleDefault(default.clone());
                for arg in args {
                    if is_string(&arg.data_type(schema)?) {
                        label = label.combine(&arg.collation_label(schema, default)?)?;
                    }
                }
                Ok(label)
            }
            Expr::Case {
                when_then,
                else_expr,
                ..
            } => {
                let mut label = CollationLabel::CoercibleDefault(default.clone());
                for (_, then) in when_then {
                    label = label.combine(&then.collation_label(schema, default)?)?;
                }
                if let Some(e) = else_expr {
                    label = label.combine(&e.collation_label(schema, default)?)?;
                }
                Ok(label)
            }
            Expr::Cast { expr, .. } => expr.collation_label(schema, default),
            _ => Ok(CollationLabel::CoercibleDefault(default.clone())),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Column(col) => write!(f, "{}", col),
            Expr::Literal(v) => write!(f, "{}", v),
            Expr::Variable { name, .. } => write!(f, "{}", name),
            Expr::OuterReference { param, .. } => write!(f, "{}", param),
            Expr::BinaryExpr { left, op, right } => write!(f, "({} {} {})", left, op, right),
            Expr::UnaryExpr {
                op: op @ (UnaryOp::IsNull | UnaryOp::IsNotNull),
                expr,
            } => write!(f, "({} {})", expr, op),
            Expr::UnaryExpr { op, expr } => write!(f, "({} {})", op, expr),
            Expr::ScalarFunc { func, args } => {
                let args_str: Vec<String> = args.iter().map(|a| a.to_string()).collect();
                write!(f, "{}({})", func, args_str.join(", "))
            }
            Expr::Cast { expr, data_type } => {
                write!(f, "CAST({} AS {})", expr, sql_type_name(data_type))
            }
            Expr::Case {
                operand,
                when_then,
                else_expr,
            } => {
                write!(f, "CASE ")?;
                if let Some(op) = operand {
                    write!(f, "{} ", op)?;
                }
                for (when, then) in when_then {
                    write!(f, "WHEN {} THEN {} ", when, then)?;
                }
                if let Some(else_e) = else_expr {
                    write!(f, "ELSE {} ", else_e)?;
                }
                write!(f, "END")
            }
            Expr::InList {
                expr,
                list,
                negated,
            } => {
                let not_str = if *negated { "NOT " } else { "" };
                let list_str: Vec<String> = list.iter().map(|e| e.to_string()).collect();
                write!(f, "{} {}IN ({})", expr, not_str, list_str.join(", "))
            }
            Expr::Between {
                expr,
                low,
                high,
                negated,
            } => {
                let not_str = if *negated { "NOT " } else { "" };
                write!(f, "{} {}BETWEEN {} AND {}", expr, not_str, low, high)
            }
            Expr::Collate { expr, collation } => write!(f, "{} COLLATE {}", expr, collation),
        }
    }
}

/// Broad type classes used for implicit conversion rules
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeFamily {
    Null,
    Boolean,
    Numeric,
    String,
    Temporal,
    Guid,
    Other,
}

pub fn type_family(data_type: &ArrowDataType) -> TypeFamily {
    use ArrowDataType::*;
    match data_type {
        Null => TypeFamily::Null,
        Boolean => TypeFamily::Boolean,
        Int8 | Int16 | Int32 | Int64 | UInt8 | UInt16 | UInt32 | UInt64 | Float32 | Float64
        | Decimal128(_, _) => TypeFamily::Numeric,
        Utf8 | LargeUtf8 => TypeFamily::String,
        Date32 | Date64 | Timestamp(_, _) | Time32(_) | Time64(_) => TypeFamily::Temporal,
        FixedSizeBinary(16) => TypeFamily::Guid,
        _ => TypeFamily::Other,
    }
}

pub fn is_string(t: &ArrowDataType) -> bool {
    type_family(t) == TypeFamily::String
}

pub fn is_numeric(t: &ArrowDataType) -> bool {
    type_family(t) == TypeFamily::Numeric
}

pub fn is_temporal(t: &ArrowDataType) -> bool {
    type_family(t) == TypeFamily::Temporal
}

fn is_integer(t: &ArrowDataType) -> bool {
    use ArrowDataType::*;
    matches!(t, Int8 | Int16 | Int32 | Int64 | UInt8 | UInt16 | UInt32 | UInt64)
}

/// Name of a type as it appears in T-SQL error messages
pub fn sql_type_name(data_type: &ArrowDataType) -> String {
    use ArrowDataType::*;
    match data_type {
        Null => "NULL".into(),
        Boolean => "bit".into(),
        Int8 | UInt8 => "tinyint".into(),
        Int16 => "smallint".into(),
        Int32 => "int".into(),
        Int64 => "bigint".into(),
        Float32 => "real".into(),
        Float64 => "float".into(),
        Decimal128(p, s) => format!("decimal({},{})", p, s),
        Utf8 | LargeUtf8 => "nvarchar".into(),
        Date32 | Date64 => "date".into(),
        Timestamp(_, _) => "datetime".into(),
        FixedSizeBinary(16) => "uniqueidentifier".into(),
        other => format!("{:?}", other).to_lowercase(),
    }
}

fn clash(left: &ArrowDataType, right: &ArrowDataType) -> QueryError {
    QueryError::TypeMismatch(format!(
        "Operand type clash: {} is incompatible with {}",
        sql_type_name(left),
        sql_type_name(right)
    ))
}

/// Check that values of two types can be compared after implicit conversion
pub fn check_comparable(left: &ArrowDataType, right: &ArrowDataType) -> Result<()> {
    use TypeFamily::*;
    match (type_family(left), type_family(right)) {
        (Null, _) | (_, Null) => Ok(()),
        (a, b) if a == b => Ok(()),
        (String, _) | (_, String) => Ok(()),
        (Guid, _) | (_, Guid) => Err(clash(left, right)),
        (Temporal, Boolean) | (Boolean, Temporal) => Err(clash(left, right)),
        (Boolean, Numeric) | (Numeric, Boolean) => Ok(()),
        (Temporal, Numeric) | (Numeric, Temporal) => Ok(()),
        _ => Err(clash(left, right)),
    }
}

/// Type of a value combining both inputs (CASE branches, set operations)
pub fn common_type(left: &ArrowDataType, right: &ArrowDataType) -> Result<ArrowDataType> {
    use TypeFamily::*;
    check_comparable(left, right)?;
    Ok(match (type_family(left), type_family(right)) {
        (Null, _) => right.clone(),
        (_, Null) => left.clone(),
        (Numeric, Numeric) => coerce_numeric_types(left, right),
        (Numeric, Boolean) | (String, Numeric | Boolean) => right.clone(),
        (Boolean, Numeric) | (Numeric | Boolean, String) => left.clone(),
        (Temporal, _) => left.clone(),
        (_, Temporal) => right.clone(),
        (String, Guid) => right.clone(),
        _ => left.clone(),
    })
}

fn arithmetic_type(op: BinaryOp, left: &ArrowDataType, right: &ArrowDataType) -> Result<ArrowDataType> {
    let ok = |t: &ArrowDataType| {
        matches!(type_family(t), TypeFamily::Numeric | TypeFamily::Null | TypeFamily::Boolean)
    };
    if !ok(left) || !ok(right) {
        return Err(QueryError::TypeMismatch(format!(
            "The data types {} and {} are incompatible in the {} operator",
            sql_type_name(left),
            sql_type_name(right),
            op
        )));
    }
    Ok(match (left, right) {
        (ArrowDataType::Null, t) | (t, ArrowDataType::Null) => t.clone(),
        _ => coerce_numeric_types(left, right),
    })
}

/// Wider of two numeric types
pub fn coerce_numeric_types(left: &ArrowDataType, right: &ArrowDataType) -> ArrowDataType {
    use ArrowDataType::*;

    match (left, right) {
        (Float64, _) | (_, Float64) | (Float32, _) | (_, Float32) => Float64,
        (Decimal128(p1, s1), Decimal128(p2, s2)) => Decimal128(*p1.max(p2), *s1.max(s2)),
        (Decimal128(p, s), _) | (_, Decimal128(p, s)) => Decimal128(*p, *s),
        (Int64, _) | (_, Int64) => Int64,
        (Int32, _) | (_, Int32) => Int32,
        (Int16, _) | (_, Int16) => Int16,
        _ => Int32,
    }
}

fn promote_sum_type(input: &ArrowDataType) -> ArrowDataType {
    use ArrowDataType::*;

    match input {
        Int8 | Int16 | Int32 | UInt8 | UInt16 | Boolean => Int32,
        Int64 | UInt32 | UInt64 => Int64,
        Decimal128(_, s) => Decimal128(38, *s),
        _ => Float64,
    }
}

fn scalar_function_type(
    func: ScalarFunction,
    args: &[Expr],
    schema: &PlanSchema,
) -> Result<ArrowDataType> {
    use ScalarFunction::*;

    let arg_type = |i: usize| -> Result<ArrowDataType> {
        args.get(i)
            .map(|a| a.data_type(schema))
            .unwrap_or(Ok(ArrowDataType::Null))
    };

    match func {
        Len | Charindex | Year | Month | Day | DatePart | DateDiff => Ok(ArrowDataType::Int32),
        Upper | Lower | Trim | Ltrim | Rtrim | Left | Right | Substring | Concat | Replace => {
            Ok(ArrowDataType::Utf8)
        }
        Abs | Ceiling | Floor | Round => {
            let t = arg_type(0)?;
            if !is_numeric(&t) && t != ArrowDataType::Null {
                return Err(QueryError::TypeMismatch(format!(
                    "Argument data type {} is invalid for argument 1 of {} function",
                    sql_type_name(&t),
                    func
                )));
            }
            Ok(t)
        }
        Power | Sqrt => Ok(ArrowDataType::Float64),
        GetDate | GetUtcDate => Ok(datetime_type()),
        DateAdd => {
            let t = arg_type(2)?;
            Ok(if is_temporal(&t) { t } else { datetime_type() })
        }
        NewId => Ok(GUID_TYPE),
        Coalesce | IsNull => {
            let mut result = ArrowDataType::Null;
            for i in 0..args.len() {
                result = common_type(&result, &arg_type(i)?)?;
            }
            Ok(result)
        }
        NullIf => {
            let t = arg_type(0)?;
            check_comparable(&t, &arg_type(1)?)?;
            Ok(t)
        }
        Iif => common_type(&arg_type(1)?, &arg_type(2)?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::schema::SchemaField;

    fn sample_schema() -> PlanSchema {
        PlanSchema::new(vec![
            SchemaField::new("id", GUID_TYPE).with_relation(Some("a".into())),
            SchemaField::new("name", ArrowDataType::Utf8).with_relation(Some("a".into())),
            SchemaField::new("revenue", ArrowDataType::Decimal128(19, 4))
                .with_relation(Some("a".into())),
            SchemaField::new("createdon", datetime_type()).with_relation(Some("a".into())),
        ])
    }

    #[test]
    fn test_expr_display() {
        let expr = Expr::column("a").add(Expr::column("b"));
        assert_eq!(format!("{}", expr), "(a + b)");
        assert_eq!(Expr::column("x").is_null().to_string(), "(x IS NULL)");
    }

    #[test]
    fn test_guid_clashes_with_int() {
        let schema = sample_schema();
        let expr = Expr::column("id").eq(Expr::int(1));
        let err = expr.data_type(&schema).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Type error: Operand type clash: uniqueidentifier is incompatible with int"
        );
    }

    #[test]
    fn test_guid_compares_with_string() {
        let schema = sample_schema();
        let expr = Expr::column("id").eq(Expr::literal(ScalarValue::Utf8(
            "00000000-0000-0000-0000-000000000000".into(),
        )));
        assert_eq!(expr.data_type(&schema).unwrap(), ArrowDataType::Boolean);
    }

    #[test]
    fn test_datetime_clashes_with_bit() {
        let schema = sample_schema();
        let expr = Expr::column("createdon").eq(Expr::literal(ScalarValue::Boolean(true)));
        assert!(expr.data_type(&schema).is_err());
    }

    #[test]
    fn test_arithmetic_widening() {
        let schema = sample_schema();
        let expr = Expr::column("revenue").add(Expr::int(1));
        assert_eq!(
            expr.data_type(&schema).unwrap(),
            ArrowDataType::Decimal128(19, 4)
        );
        let bad = Expr::column("name").subtract(Expr::int(1));
        assert!(bad.data_type(&schema).is_err());
    }

    #[test]
    fn test_conjunction_roundtrip() {
        let parts = vec![Expr::column("a"), Expr::column("b"), Expr::column("c")];
        let conj = Expr::conjunction(parts).unwrap();
        assert_eq!(conj.split_conjunction().len(), 3);
    }

    #[test]
    fn test_collation_of_concatenation() {
        let schema = sample_schema();
        let default = Collation::default();
        let expr = Expr::column("name").add(Expr::literal(ScalarValue::Utf8("x".into())));
        assert_eq!(
            expr.collation_label(&schema, &default).unwrap(),
            CollationLabel::Implicit(default.clone())
        );
    }

    #[test]
    fn test_outer_references_collected() {
        let expr = Expr::OuterReference {
            param: "@Expr1".into(),
            data_type: ArrowDataType::Int32,
        }
        .eq(Expr::column("x"));
        assert!(expr.outer_references().contains("@Expr1"));
        assert_eq!(expr.column_refs(), vec![Column::new("x")]);
    }
}
