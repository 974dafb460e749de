//! Physical plan operators
//!
//! `PlanOperator` is a closed set of operator kinds. Every kind derives its
//! output schema structurally from its inputs in [`PlanOperator::schema`],
//! and exposes its children generically so tree walkers (display, spool
//! insertion, validation) need no kind-specific knowledge.

use crate::error::{QueryError, Result};
use crate::planner::{Collation, Column, Expr, PlanSchema, SchemaField, SortKey};
use crate::planner::AggregateType;
use arrow::datatypes::DataType as ArrowDataType;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Identifies a spool producer so consumers can refer back to it
pub type SpoolId = usize;

/// A column introduced by an operator
#[derive(Debug, Clone, PartialEq)]
pub struct DefinedValue {
    pub name: String,
    pub expr: Expr,
    pub data_type: ArrowDataType,
    pub nullable: bool,
}

impl DefinedValue {
    pub fn new(name: impl Into<String>, expr: Expr, data_type: ArrowDataType) -> Self {
        Self {
            name: name.into(),
            expr,
            data_type,
            nullable: true,
        }
    }

    pub fn with_nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    pub fn column(&self) -> Column {
        Column::new(self.name.clone())
    }

    fn field(&self) -> SchemaField {
        SchemaField::new(self.name.clone(), self.data_type.clone())
            .with_nullable(self.nullable)
            .with_calculated(true)
            .with_visible(false)
    }
}

/// Where a scan reads its rows from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanSource {
    Entity,
    RecycleBin,
    Archive,
    TempTable,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScanColumn {
    pub name: String,
    pub data_type: ArrowDataType,
    pub nullable: bool,
    pub collation: Option<Collation>,
}

/// Read all rows of a backend entity or temp table
#[derive(Debug, Clone, PartialEq)]
pub struct ScanNode {
    pub entity: String,
    pub alias: String,
    pub source: ScanSource,
    pub columns: Vec<ScanColumn>,
    pub primary_key: Option<String>,
    pub estimated_rows: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilterNode {
    pub input: Arc<PlanOperator>,
    pub predicate: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComputeScalarNode {
    pub input: Arc<PlanOperator>,
    pub values: Vec<DefinedValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JoinType {
    Inner,
    LeftOuter,
    RightOuter,
    FullOuter,
}

/// An outer column captured into a parameter for each outer row
#[derive(Debug, Clone, PartialEq)]
pub struct OuterReferenceBinding {
    pub column: Column,
    pub param: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JoinStrategy {
    Merge { left_key: Column, right_key: Column },
    Hash { left_key: Column, right_key: Column },
    NestedLoop { outer_references: Vec<OuterReferenceBinding> },
}

impl JoinStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            JoinStrategy::Merge { .. } => "Merge",
            JoinStrategy::Hash { .. } => "Hash",
            JoinStrategy::NestedLoop { .. } => "Nested Loop",
        }
    }

    pub fn outer_references(&self) -> &[OuterReferenceBinding] {
        match self {
            JoinStrategy::NestedLoop { outer_references } => outer_references,
            _ => &[],
        }
    }
}

/// Which inputs contribute columns to the join output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutput {
    Both,
    /// Semi-join: one row per left row, right columns suppressed
    Left,
    Right,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinNode {
    pub left: Arc<PlanOperator>,
    pub right: Arc<PlanOperator>,
    pub join_type: JoinType,
    pub strategy: JoinStrategy,
    pub output: JoinOutput,
    /// Emit left rows that have no match
    pub anti_join: bool,
    pub condition: Option<Expr>,
    /// Values computed from the matched right row, NULL when unmatched
    pub defined_values: Vec<DefinedValue>,
}

impl JoinNode {
    pub fn is_semi_join(&self) -> bool {
        self.output == JoinOutput::Left
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateStrategy {
    Hash,
    Stream,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateValue {
    pub name: String,
    pub func: AggregateType,
    pub args: Vec<Expr>,
    pub distinct: bool,
    pub within_group: Vec<SortKey>,
    pub data_type: ArrowDataType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateNode {
    pub input: Arc<PlanOperator>,
    pub strategy: AggregateStrategy,
    pub group_by: Vec<Column>,
    pub aggregates: Vec<AggregateValue>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SortNode {
    pub input: Arc<PlanOperator>,
    pub keys: Vec<SortKey>,
}

/// Flags the first row of each run of equal partition values
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentNode {
    pub input: Arc<PlanOperator>,
    pub partition_by: Vec<Column>,
    pub segment: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SequenceValue {
    pub name: String,
    pub func: AggregateType,
    /// Restarts numbering
    pub segment: Column,
    /// Marks a change of ORDER BY values, used by RANK and DENSE_RANK
    pub rank_segment: Option<Column>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SequenceProjectNode {
    pub input: Arc<PlanOperator>,
    pub values: Vec<SequenceValue>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DistinctNode {
    pub input: Arc<PlanOperator>,
    pub columns: Vec<Column>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TopNode {
    pub input: Arc<PlanOperator>,
    pub count: Expr,
    pub percent: bool,
    pub with_ties: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OffsetFetchNode {
    pub input: Arc<PlanOperator>,
    pub offset: Expr,
    pub fetch: Option<Expr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpoolKind {
    /// Materialized in full before the first row is returned
    Eager,
    /// Materialized on first read and reused afterwards
    Lazy,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrameValue {
    pub source: Column,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SpoolMode {
    Table,
    /// Push/pop access, rows produced while reading are fed back in
    Stack,
    /// Buffers one segment and replays it to consumers once per segment
    Segment { segment: Option<Column> },
    /// Replays, for each row, the rows of its segment in its frame
    Window {
        segment: Option<Column>,
        row_number: Column,
        frame_start: Column,
        frame_end: Column,
        frame_values: Vec<FrameValue>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpoolNode {
    pub id: SpoolId,
    pub input: Arc<PlanOperator>,
    pub kind: SpoolKind,
    pub mode: SpoolMode,
}

/// Reads the rows buffered by a spool producer
#[derive(Debug, Clone, PartialEq)]
pub struct SpoolConsumerNode {
    pub producer: SpoolId,
    pub schema: PlanSchema,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConcatColumn {
    pub name: String,
    pub data_type: ArrowDataType,
    pub nullable: bool,
    pub visible: bool,
    /// One source column per input
    pub sources: Vec<Column>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConcatenateNode {
    pub inputs: Vec<Arc<PlanOperator>>,
    pub columns: Vec<ConcatColumn>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AliasColumn {
    pub source: Column,
    pub name: String,
    pub visible: bool,
}

/// Re-qualifies (and optionally renames) the columns of its input
#[derive(Debug, Clone, PartialEq)]
pub struct AliasNode {
    pub input: Arc<PlanOperator>,
    pub alias: String,
    pub columns: Vec<AliasColumn>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConstantColumn {
    pub name: String,
    pub data_type: ArrowDataType,
    pub nullable: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConstantRowNode {
    pub columns: Vec<ConstantColumn>,
    pub rows: Vec<Vec<Expr>>,
}

/// Fails execution when a row does not satisfy the predicate
#[derive(Debug, Clone, PartialEq)]
pub struct AssertNode {
    pub input: Arc<PlanOperator>,
    pub predicate: Expr,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableFunctionKind {
    StringSplit,
    GenerateSeries,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableFunctionNode {
    pub function: TableFunctionKind,
    pub args: Vec<Expr>,
    pub alias: String,
    pub columns: Vec<ScanColumn>,
}

/// Physical plan operator
#[derive(Debug, Clone, PartialEq)]
pub enum PlanOperator {
    Scan(ScanNode),
    Filter(FilterNode),
    ComputeScalar(ComputeScalarNode),
    Join(JoinNode),
    Aggregate(AggregateNode),
    Sort(SortNode),
    Segment(SegmentNode),
    SequenceProject(SequenceProjectNode),
    Distinct(DistinctNode),
    Top(TopNode),
    OffsetFetch(OffsetFetchNode),
    Spool(SpoolNode),
    SpoolConsumer(SpoolConsumerNode),
    Concatenate(ConcatenateNode),
    Alias(AliasNode),
    ConstantRow(ConstantRowNode),
    Assert(AssertNode),
    TableFunction(TableFunctionNode),
}

impl PlanOperator {
    pub fn name(&self) -> &'static str {
        match self {
            PlanOperator::Scan(_) => "Scan",
            PlanOperator::Filter(_) => "Filter",
            PlanOperator::ComputeScalar(_) => "Compute Scalar",
            PlanOperator::Join(_) => "Join",
            PlanOperator::Aggregate(_) => "Aggregate",
            PlanOperator::Sort(_) => "Sort",
            PlanOperator::Segment(_) => "Segment",
            PlanOperator::SequenceProject(_) => "Sequence Project",
            PlanOperator::Distinct(_) => "Distinct",
            PlanOperator::Top(_) => "Top",
            PlanOperator::OffsetFetch(_) => "Offset Fetch",
            PlanOperator::Spool(_) => "Spool",
            PlanOperator::SpoolConsumer(_) => "Spool Consumer",
            PlanOperator::Concatenate(_) => "Concatenate",
            PlanOperator::Alias(_) => "Alias",
            PlanOperator::ConstantRow(_) => "Constant Row",
            PlanOperator::Assert(_) => "Assert",
            PlanOperator::TableFunction(_) => "Table Function",
        }
    }

    /// Get the output schema of this operator
    pub fn schema(&self) -> PlanSchema {
        match self {
            PlanOperator::Scan(node) => {
                let fields = node
                    .columns
                    .iter()
                    .map(|c| {
                        SchemaField::new(c.name.clone(), c.data_type.clone())
                            .with_nullable(c.nullable)
                            .with_relation(Some(node.alias.clone()))
                            .with_collation(c.collation.clone())
                    })
                    .collect();
                let pk = node
                    .primary_key
                    .as_ref()
                    .map(|pk| Column::new_qualified(node.alias.clone(), pk.clone()));
                PlanSchema::new(fields).with_primary_key(pk)
            }
            PlanOperator::Filter(node) => node.input.schema(),
            PlanOperator::Top(node) => node.input.schema(),
            PlanOperator::OffsetFetch(node) => node.input.schema(),
            PlanOperator::Assert(node) => node.input.schema(),
            PlanOperator::ComputeScalar(node) => {
                extend_schema(node.input.schema(), node.values.iter().map(|v| v.field()))
            }
            PlanOperator::Join(node) => join_schema(node),
            PlanOperator::Aggregate(node) => {
                let input = node.input.schema();
                let mut fields: Vec<SchemaField> = node
                    .group_by
                    .iter()
                    .filter_map(|c| input.resolve_column(c).ok().map(|(_, f)| f.clone()))
                    .collect();
                fields.extend(node.aggregates.iter().map(|a| {
                    SchemaField::new(a.name.clone(), a.data_type.clone())
                        .with_nullable(!matches!(
                            a.func,
                            AggregateType::Count | AggregateType::CountStar
                        ))
                        .with_calculated(true)
                        .with_visible(false)
                }));
                let pk = input
                    .primary_key()
                    .filter(|pk| node.group_by.iter().any(|g| g.matches(pk)))
                    .cloned();
                PlanSchema::new(fields).with_primary_key(pk)
            }
            PlanOperator::Sort(node) => node.input.schema().with_sort_order(node.keys.clone()),
            PlanOperator::Segment(node) => extend_schema(
                node.input.schema(),
                std::iter::once(
                    SchemaField::new(node.segment.clone(), ArrowDataType::Boolean)
                        .with_nullable(false)
                        .with_calculated(true)
                        .with_visible(false),
                ),
            ),
            PlanOperator::SequenceProject(node) => extend_schema(
                node.input.schema(),
                node.values.iter().map(|v| {
                    SchemaField::new(v.name.clone(), ArrowDataType::Int64)
                        .with_nullable(false)
                        .with_calculated(true)
                        .with_visible(false)
                }),
            ),
            PlanOperator::Distinct(node) => {
                let input = node.input.schema();
                let fields = node
                    .columns
                    .iter()
                    .filter_map(|c| input.resolve_column(c).ok().map(|(_, f)| f.clone()))
                    .collect();
                PlanSchema::new(fields)
            }
            PlanOperator::Spool(node) => {
                let input = node.input.schema();
                let pk = input.primary_key().cloned();
                let mut fields = input.fields().to_vec();
                if let SpoolMode::Window { frame_values, .. } = &node.mode {
                    for fv in frame_values {
                        if let Ok((_, f)) = input.resolve_column(&fv.source) {
                            fields.push(
                                SchemaField::new(fv.name.clone(), f.data_type.clone())
                                    .with_calculated(true)
                                    .with_visible(false),
                            );
                        }
                    }
                }
                PlanSchema::new(fields).with_primary_key(pk)
            }
            PlanOperator::SpoolConsumer(node) => node.schema.clone(),
            PlanOperator::Concatenate(node) => PlanSchema::new(
                node.columns
                    .iter()
                    .map(|c| {
                        SchemaField::new(c.name.clone(), c.data_type.clone())
                            .with_nullable(c.nullable)
                            .with_calculated(true)
                            .with_visible(c.visible)
                    })
                    .collect(),
            ),
            PlanOperator::Alias(node) => alias_schema(node),
            PlanOperator::ConstantRow(node) => PlanSchema::new(
                node.columns
                    .iter()
                    .map(|c| {
                        SchemaField::new(c.name.clone(), c.data_type.clone())
                            .with_nullable(c.nullable)
                            .with_calculated(true)
                    })
                    .collect(),
            ),
            PlanOperator::TableFunction(node) => PlanSchema::new(
                node.columns
                    .iter()
                    .map(|c| {
                        SchemaField::new(c.name.clone(), c.data_type.clone())
                            .with_nullable(c.nullable)
                            .with_relation(Some(node.alias.clone()))
                            .with_calculated(true)
                    })
                    .collect(),
            ),
        }
    }

    /// Get child operators
    pub fn children(&self) -> Vec<&PlanOperator> {
        match self {
            PlanOperator::Scan(_)
            | PlanOperator::SpoolConsumer(_)
            | PlanOperator::ConstantRow(_)
            | PlanOperator::TableFunction(_) => vec![],
            PlanOperator::Filter(node) => vec![&node.input],
            PlanOperator::ComputeScalar(node) => vec![&node.input],
            PlanOperator::Join(node) => vec![&node.left, &node.right],
            PlanOperator::Aggregate(node) => vec![&node.input],
            PlanOperator::Sort(node) => vec![&node.input],
            PlanOperator::Segment(node) => vec![&node.input],
            PlanOperator::SequenceProject(node) => vec![&node.input],
            PlanOperator::Distinct(node) => vec![&node.input],
            PlanOperator::Top(node) => vec![&node.input],
            PlanOperator::OffsetFetch(node) => vec![&node.input],
            PlanOperator::Spool(node) => vec![&node.input],
            PlanOperator::Concatenate(node) => node.inputs.iter().map(|x| x.as_ref()).collect(),
            PlanOperator::Alias(node) => vec![&node.input],
            PlanOperator::Assert(node) => vec![&node.input],
        }
    }

    /// Create a new operator with children replaced
    pub fn with_new_children(&self, children: Vec<Arc<PlanOperator>>) -> Result<Self> {
        let expected = self.children().len();
        if children.len() != expected {
            return Err(QueryError::Internal(format!(
                "{} expects {} children, got {}",
                self.name(),
                expected,
                children.len()
            )));
        }
        let mut iter = children.into_iter();
        let mut next = || {
            iter.next()
                .ok_or_else(|| QueryError::Internal("missing child operator".into()))
        };

        Ok(match self {
            PlanOperator::Scan(_)
            | PlanOperator::SpoolConsumer(_)
            | PlanOperator::ConstantRow(_)
            | PlanOperator::TableFunction(_) => self.clone(),
            PlanOperator::Filter(node) => PlanOperator::Filter(FilterNode {
                input: next()?,
                predicate: node.predicate.clone(),
            }),
            PlanOperator::ComputeScalar(node) => PlanOperator::ComputeScalar(ComputeScalarNode {
                input: next()?,
                values: node.values.clone(),
            }),
            PlanOperator::Join(node) => PlanOperator::Join(JoinNode {
                left: next()?,
                right: next()?,
                ..node.clone()
            }),
            PlanOperator::Aggregate(node) => PlanOperator::Aggregate(AggregateNode {
                input: next()?,
                ..node.clone()
            }),
            PlanOperator::Sort(node) => PlanOperator::Sort(SortNode {
                input: next()?,
                keys: node.keys.clone(),
            }),
            PlanOperator::Segment(node) => PlanOperator::Segment(SegmentNode {
                input: next()?,
                ..node.clone()
            }),
            PlanOperator::SequenceProject(node) => {
                PlanOperator::SequenceProject(SequenceProjectNode {
                    input: next()?,
                    values: node.values.clone(),
                })
            }
            PlanOperator::Distinct(node) => PlanOperator::Distinct(DistinctNode {
                input: next()?,
                columns: node.columns.clone(),
            }),
            PlanOperator::Top(node) => PlanOperator::Top(TopNode {
                input: next()?,
                ..node.clone()
            }),
            PlanOperator::OffsetFetch(node) => PlanOperator::OffsetFetch(OffsetFetchNode {
                input: next()?,
                ..node.clone()
            }),
            PlanOperator::Spool(node) => PlanOperator::Spool(SpoolNode {
                input: next()?,
                ..node.clone()
            }),
            PlanOperator::Concatenate(node) => PlanOperator::Concatenate(ConcatenateNode {
                inputs: iter.by_ref().collect(),
                columns: node.columns.clone(),
            }),
            PlanOperator::Alias(node) => PlanOperator::Alias(AliasNode {
                input: next()?,
                ..node.clone()
            }),
            PlanOperator::Assert(node) => PlanOperator::Assert(AssertNode {
                input: next()?,
                ..node.clone()
            }),
        })
    }

    /// Names of the columns this operator introduces
    pub fn defined_values(&self) -> Vec<String> {
        match self {
            PlanOperator::ComputeScalar(node) => node.values.iter().map(|v| v.name.clone()).collect(),
            PlanOperator::Join(node) => node.defined_values.iter().map(|v| v.name.clone()).collect(),
            PlanOperator::Aggregate(node) => node.aggregates.iter().map(|a| a.name.clone()).collect(),
            PlanOperator::Segment(node) => vec![node.segment.clone()],
            PlanOperator::SequenceProject(node) => node.values.iter().map(|v| v.name.clone()).collect(),
            PlanOperator::Concatenate(node) => node.columns.iter().map(|c| c.name.clone()).collect(),
            PlanOperator::Spool(SpoolNode {
                mode: SpoolMode::Window { frame_values, .. },
                ..
            }) => frame_values.iter().map(|f| f.name.clone()).collect(),
            _ => vec![],
        }
    }

    /// Expressions evaluated by this operator
    pub fn expressions(&self) -> Vec<&Expr> {
        match self {
            PlanOperator::Filter(node) => vec![&node.predicate],
            PlanOperator::ComputeScalar(node) => node.values.iter().map(|v| &v.expr).collect(),
            PlanOperator::Join(node) => node
                .condition
                .iter()
                .chain(node.defined_values.iter().map(|v| &v.expr))
                .collect(),
            PlanOperator::Aggregate(node) => {
                node.aggregates.iter().flat_map(|a| a.args.iter()).collect()
            }
            PlanOperator::Top(node) => vec![&node.count],
            PlanOperator::OffsetFetch(node) => {
                std::iter::once(&node.offset).chain(node.fetch.iter()).collect()
            }
            PlanOperator::ConstantRow(node) => node.rows.iter().flatten().collect(),
            PlanOperator::Assert(node) => vec![&node.predicate],
            PlanOperator::TableFunction(node) => node.args.iter().collect(),
            _ => vec![],
        }
    }

    /// Outer-reference parameters read by this subtree and not bound inside it
    pub fn outer_references_used(&self) -> BTreeSet<String> {
        let mut used: BTreeSet<String> = self
            .expressions()
            .iter()
            .flat_map(|e| e.outer_references())
            .collect();
        match self {
            PlanOperator::Join(node) => {
                used.extend(node.left.outer_references_used());
                let bound: BTreeSet<&str> = node
                    .strategy
                    .outer_references()
                    .iter()
                    .map(|b| b.param.as_str())
                    .collect();
                used.extend(
                    node.right
                        .outer_references_used()
                        .into_iter()
                        .filter(|p| !bound.contains(p.as_str())),
                );
            }
            _ => {
                for child in self.children() {
                    used.extend(child.outer_references_used());
                }
            }
        }
        used
    }

    pub fn is_correlated(&self) -> bool {
        !self.outer_references_used().is_empty()
    }

    /// Script variables and parameters read anywhere in this subtree
    pub fn variables(&self) -> BTreeSet<String> {
        let mut names: BTreeSet<String> =
            self.expressions().iter().flat_map(|e| e.variables()).collect();
        for child in self.children() {
            names.extend(child.variables());
        }
        names
    }

    /// Visit this operator and all of its descendants, parents first
    pub fn apply(&self, f: &mut dyn FnMut(&PlanOperator)) {
        f(self);
        for child in self.children() {
            child.apply(f);
        }
    }
}

fn extend_schema(input: PlanSchema, extra: impl Iterator<Item = SchemaField>) -> PlanSchema {
    let pk = input.primary_key().cloned();
    let sort = input.sort_order().to_vec();
    let mut fields = input.fields().to_vec();
    fields.extend(extra);
    PlanSchema::new(fields)
        .with_primary_key(pk)
        .with_sort_order(sort)
}

fn with_nullable(fields: &[SchemaField], nullable: bool) -> Vec<SchemaField> {
    fields
        .iter()
        .cloned()
        .map(|f| {
            let n = f.nullable || nullable;
            f.with_nullable(n)
        })
        .collect()
}

fn join_schema(node: &JoinNode) -> PlanSchema {
    let left = node.left.schema();
    let right = node.right.schema();
    let left_nullable = node.join_type == JoinType::FullOuter;
    let right_nullable = matches!(node.join_type, JoinType::LeftOuter | JoinType::FullOuter);

    let mut fields = match node.output {
        JoinOutput::Both => {
            let mut f = with_nullable(left.fields(), left_nullable);
            f.extend(with_nullable(right.fields(), right_nullable));
            f
        }
        JoinOutput::Left => left.fields().to_vec(),
        JoinOutput::Right => right.fields().to_vec(),
    };
    fields.extend(node.defined_values.iter().map(|v| v.field()));

    // Left rows stay unique when each matches at most one right row
    let right_unique = match &node.strategy {
        JoinStrategy::Merge { right_key, .. } => right.is_primary_key(right_key),
        _ => false,
    };
    let (pk, sort) = match node.output {
        JoinOutput::Left => (left.primary_key().cloned(), left.sort_order().to_vec()),
        JoinOutput::Right => (right.primary_key().cloned(), vec![]),
        JoinOutput::Both => {
            let pk = if right_unique && node.join_type != JoinType::FullOuter {
                left.primary_key().cloned()
            } else {
                None
            };
            let sort = match (&node.strategy, node.join_type) {
                (JoinStrategy::Hash { .. }, _) | (_, JoinType::FullOuter) => vec![],
                _ => left.sort_order().to_vec(),
            };
            (pk, sort)
        }
    };
    PlanSchema::new(fields)
        .with_primary_key(pk)
        .with_sort_order(sort)
}

fn alias_schema(node: &AliasNode) -> PlanSchema {
    let input = node.input.schema();
    let mut pk = None;
    let mut fields = Vec::with_capacity(node.columns.len());
    for col in &node.columns {
        let Ok((_, source)) = input.resolve_column(&col.source) else {
            continue;
        };
        let renamed = Column::new_qualified(node.alias.clone(), col.name.clone());
        if input.is_primary_key(&col.source) {
            pk = Some(renamed);
        }
        fields.push(SchemaField {
            name: col.name.clone(),
            relation: Some(node.alias.clone()),
            visible: col.visible,
            ..source.clone()
        });
    }
    let index_of = |col: &Column| input.try_resolve(col).ok().flatten().map(|(i, _)| i);
    let sort = input
        .sort_order()
        .iter()
        .map_while(|key| {
            let target = index_of(&key.column)?;
            node.columns
                .iter()
                .find(|c| index_of(&c.source) == Some(target))
                .map(|c| SortKey {
                    column: Column::new_qualified(node.alias.clone(), c.name.clone()),
                    direction: key.direction,
                })
        })
        .collect();
    PlanSchema::new(fields)
        .with_primary_key(pk)
        .with_sort_order(sort)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::SortDirection;

    fn scan(alias: &str, pk: &str) -> Arc<PlanOperator> {
        Arc::new(PlanOperator::Scan(ScanNode {
            entity: alias.to_string(),
            alias: alias.to_string(),
            source: ScanSource::Entity,
            columns: vec![
                ScanColumn {
                    name: pk.to_string(),
                    data_type: ArrowDataType::Int32,
                    nullable: false,
                    collation: None,
                },
                ScanColumn {
                    name: "name".to_string(),
                    data_type: ArrowDataType::Utf8,
                    nullable: true,
                    collation: None,
                },
            ],
            primary_key: Some(pk.to_string()),
            estimated_rows: None,
        }))
    }

    #[test]
    fn test_scan_schema_has_primary_key() {
        let schema = scan("a", "aid").schema();
        assert_eq!(schema.len(), 2);
        assert_eq!(
            schema.primary_key(),
            Some(&Column::new_qualified("a", "aid"))
        );
    }

    #[test]
    fn test_compute_scalar_preserves_key_and_order() {
        let sorted = Arc::new(PlanOperator::Sort(SortNode {
            input: scan("a", "aid"),
            keys: vec![SortKey::asc(Column::new_qualified("a", "name"))],
        }));
        let plan = PlanOperator::ComputeScalar(ComputeScalarNode {
            input: sorted,
            values: vec![DefinedValue::new("Expr1", Expr::int(1), ArrowDataType::Int32)],
        });
        let schema = plan.schema();
        assert!(schema.primary_key().is_some());
        assert_eq!(schema.sort_order().len(), 1);
        assert!(!schema.resolve_column(&Column::new("Expr1")).unwrap().1.visible);
    }

    #[test]
    fn test_semi_join_hides_right_columns() {
        let plan = PlanOperator::Join(JoinNode {
            left: scan("a", "aid"),
            right: scan("b", "bid"),
            join_type: JoinType::LeftOuter,
            strategy: JoinStrategy::Hash {
                left_key: Column::new_qualified("a", "name"),
                right_key: Column::new_qualified("b", "name"),
            },
            output: JoinOutput::Left,
            anti_join: false,
            condition: None,
            defined_values: vec![DefinedValue::new(
                "Expr2",
                Expr::qualified_column("b", "bid"),
                ArrowDataType::Int32,
            )],
        });
        let schema = plan.schema();
        assert_eq!(schema.len(), 3);
        assert!(!schema.has_relation("b"));
        assert_eq!(schema.primary_key(), Some(&Column::new_qualified("a", "aid")));
    }

    #[test]
    fn test_merge_join_on_right_key_keeps_left_key() {
        let plan = PlanOperator::Join(JoinNode {
            left: scan("a", "aid"),
            right: scan("b", "bid"),
            join_type: JoinType::Inner,
            strategy: JoinStrategy::Merge {
                left_key: Column::new_qualified("a", "name"),
                right_key: Column::new_qualified("b", "bid"),
            },
            output: JoinOutput::Both,
            anti_join: false,
            condition: None,
            defined_values: vec![],
        });
        assert_eq!(
            plan.schema().primary_key(),
            Some(&Column::new_qualified("a", "aid"))
        );
    }

    #[test]
    fn test_hash_join_clears_key_and_order() {
        let plan = PlanOperator::Join(JoinNode {
            left: scan("a", "aid"),
            right: scan("b", "bid"),
            join_type: JoinType::Inner,
            strategy: JoinStrategy::Hash {
                left_key: Column::new_qualified("a", "name"),
                right_key: Column::new_qualified("b", "name"),
            },
            output: JoinOutput::Both,
            anti_join: false,
            condition: None,
            defined_values: vec![],
        });
        let schema = plan.schema();
        assert!(schema.primary_key().is_none());
        assert!(schema.sort_order().is_empty());
    }

    #[test]
    fn test_alias_renames_and_maps_key() {
        let plan = PlanOperator::Alias(AliasNode {
            input: Arc::new(PlanOperator::Sort(SortNode {
                input: scan("a", "aid"),
                keys: vec![SortKey {
                    column: Column::new_qualified("a", "aid"),
                    direction: SortDirection::Desc,
                }],
            })),
            alias: "d".to_string(),
            columns: vec![AliasColumn {
                source: Column::new_qualified("a", "aid"),
                name: "id".to_string(),
                visible: true,
            }],
        });
        let schema = plan.schema();
        assert_eq!(schema.primary_key(), Some(&Column::new_qualified("d", "id")));
        assert_eq!(schema.sort_order()[0].direction, SortDirection::Desc);
    }

    #[test]
    fn test_outer_references_bound_by_nested_loop() {
        let inner = Arc::new(PlanOperator::Filter(FilterNode {
            input: scan("b", "bid"),
            predicate: Expr::qualified_column("b", "name").eq(Expr::OuterReference {
                param: "@Expr1".into(),
                data_type: ArrowDataType::Utf8,
            }),
        }));
        assert!(inner.is_correlated());
        let join = PlanOperator::Join(JoinNode {
            left: scan("a", "aid"),
            right: inner,
            join_type: JoinType::Inner,
            strategy: JoinStrategy::NestedLoop {
                outer_references: vec![OuterReferenceBinding {
                    column: Column::new_qualified("a", "name"),
                    param: "@Expr1".into(),
                }],
            },
            output: JoinOutput::Both,
            anti_join: false,
            condition: None,
            defined_values: vec![],
        });
        assert!(!join.is_correlated());
    }

    #[test]
    fn test_with_new_children_checks_count() {
        let plan = PlanOperator::Filter(FilterNode {
            input: scan("a", "aid"),
            predicate: Expr::int(1).eq(Expr::int(1)),
        });
        assert!(plan.with_new_children(vec![]).is_err());
        let rebuilt = plan.with_new_children(vec![scan("b", "bid")]).unwrap();
        assert!(rebuilt.schema().has_relation("b"));
    }
}
