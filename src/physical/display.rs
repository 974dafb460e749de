//! Indented text rendering of plans

use crate::physical::{
    AggregateStrategy, JoinOutput, JoinStrategy, JoinType, PlanOperator, PlanRoot, QueryPlan,
    RootNode, ScanSource, SpoolKind, SpoolMode, TableFunctionKind,
};
use std::fmt;

fn join_list<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl fmt::Display for JoinType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinType::Inner => write!(f, "Inner"),
            JoinType::LeftOuter => write!(f, "Left Outer"),
            JoinType::RightOuter => write!(f, "Right Outer"),
            JoinType::FullOuter => write!(f, "Full Outer"),
        }
    }
}

impl fmt::Display for PlanOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_indent(f, 0)
    }
}

impl PlanOperator {
    fn fmt_indent(&self, f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
        let prefix = "  ".repeat(indent);

        match self {
            PlanOperator::Scan(node) => {
                let source = match node.source {
                    ScanSource::Entity => "",
                    ScanSource::RecycleBin => "bin.",
                    ScanSource::Archive => "archive.",
                    ScanSource::TempTable => "",
                };
                let cols: Vec<&str> = node.columns.iter().map(|c| c.name.as_str()).collect();
                writeln!(
                    f,
                    "{}Scan: {}{} AS {} [{}]",
                    prefix,
                    source,
                    node.entity,
                    node.alias,
                    cols.join(", ")
                )?;
            }
            PlanOperator::Filter(node) => {
                writeln!(f, "{}Filter: {}", prefix, node.predicate)?;
            }
            PlanOperator::ComputeScalar(node) => {
                let values: Vec<String> = node
                    .values
                    .iter()
                    .map(|v| format!("{} = {}", v.name, v.expr))
                    .collect();
                writeln!(f, "{}Compute Scalar: [{}]", prefix, values.join(", "))?;
            }
            PlanOperator::Join(node) => {
                let semi = match node.output {
                    JoinOutput::Both => "",
                    JoinOutput::Left if node.anti_join => ", anti semi",
                    JoinOutput::Left => ", semi",
                    JoinOutput::Right => ", right columns",
                };
                write!(
                    f,
                    "{}{} Join ({}{})",
                    prefix,
                    node.strategy.name(),
                    node.join_type,
                    semi
                )?;
                match &node.strategy {
                    JoinStrategy::Merge {
                        left_key,
                        right_key,
                    }
                    | JoinStrategy::Hash {
                        left_key,
                        right_key,
                    } => write!(f, " on {} = {}", left_key, right_key)?,
                    JoinStrategy::NestedLoop { outer_references } if !outer_references.is_empty() => {
                        let refs: Vec<String> = outer_references
                            .iter()
                            .map(|r| format!("{} = {}", r.param, r.column))
                            .collect();
                        write!(f, " outer references: [{}]", refs.join(", "))?;
                    }
                    JoinStrategy::NestedLoop { .. } => {}
                }
                writeln!(f)?;
                if let Some(cond) = &node.condition {
                    writeln!(f, "{}  condition: {}", prefix, cond)?;
                }
                if !node.defined_values.is_empty() {
                    let values: Vec<String> = node
                        .defined_values
                        .iter()
                        .map(|v| format!("{} = {}", v.name, v.expr))
                        .collect();
                    writeln!(f, "{}  defines: [{}]", prefix, values.join(", "))?;
                }
            }
            PlanOperator::Aggregate(node) => {
                let strategy = match node.strategy {
                    AggregateStrategy::Hash => "Hash",
                    AggregateStrategy::Stream => "Stream",
                };
                let aggs: Vec<String> = node
                    .aggregates
                    .iter()
                    .map(|a| {
                        let distinct = if a.distinct { "DISTINCT " } else { "" };
                        let args = join_list(&a.args);
                        let mut s = match a.func {
                            crate::planner::AggregateType::CountStar => {
                                format!("{} = COUNT(*)", a.name)
                            }
                            func => format!("{} = {}({}{})", a.name, func, distinct, args),
                        };
                        if !a.within_group.is_empty() {
                            s.push_str(&format!(
                                " WITHIN GROUP (ORDER BY {})",
                                join_list(&a.within_group)
                            ));
                        }
                        s
                    })
                    .collect();
                writeln!(
                    f,
                    "{}{} Aggregate: group_by=[{}], aggs=[{}]",
                    prefix,
                    strategy,
                    join_list(&node.group_by),
                    aggs.join(", ")
                )?;
            }
            PlanOperator::Sort(node) => {
                writeln!(f, "{}Sort: [{}]", prefix, join_list(&node.keys))?;
            }
            PlanOperator::Segment(node) => {
                writeln!(
                    f,
                    "{}Segment: {} by [{}]",
                    prefix,
                    node.segment,
                    join_list(&node.partition_by)
                )?;
            }
            PlanOperator::SequenceProject(node) => {
                let values: Vec<String> = node
                    .values
                    .iter()
                    .map(|v| format!("{} = {}()", v.name, v.func))
                    .collect();
                writeln!(f, "{}Sequence Project: [{}]", prefix, values.join(", "))?;
            }
            PlanOperator::Distinct(node) => {
                writeln!(f, "{}Distinct: [{}]", prefix, join_list(&node.columns))?;
            }
            PlanOperator::Top(node) => {
                let percent = if node.percent { " PERCENT" } else { "" };
                let ties = if node.with_ties { " WITH TIES" } else { "" };
                writeln!(f, "{}Top: {}{}{}", prefix, node.count, percent, ties)?;
            }
            PlanOperator::OffsetFetch(node) => match &node.fetch {
                Some(fetch) => writeln!(
                    f,
                    "{}Offset Fetch: offset={}, fetch={}",
                    prefix, node.offset, fetch
                )?,
                None => writeln!(f, "{}Offset Fetch: offset={}", prefix, node.offset)?,
            },
            PlanOperator::Spool(node) => {
                let kind = match node.kind {
                    SpoolKind::Eager => "Eager",
                    SpoolKind::Lazy => "Lazy",
                };
                let mode = match &node.mode {
                    SpoolMode::Table => "Table".to_string(),
                    SpoolMode::Stack => "Stack".to_string(),
                    SpoolMode::Segment { segment } => match segment {
                        Some(s) => format!("Segment on {}", s),
                        None => "Segment".to_string(),
                    },
                    SpoolMode::Window {
                        row_number,
                        frame_start,
                        frame_end,
                        frame_values,
                        ..
                    } => {
                        let values: Vec<String> = frame_values
                            .iter()
                            .map(|v| format!("{} = {}", v.name, v.source))
                            .collect();
                        format!(
                            "Window rows {}..{} of {} [{}]",
                            frame_start,
                            frame_end,
                            row_number,
                            values.join(", ")
                        )
                    }
                };
                writeln!(f, "{}{} {} Spool #{}", prefix, kind, mode, node.id)?;
            }
            PlanOperator::SpoolConsumer(node) => {
                writeln!(f, "{}Spool Consumer: #{}", prefix, node.producer)?;
            }
            PlanOperator::Concatenate(node) => {
                let cols: Vec<&str> = node.columns.iter().map(|c| c.name.as_str()).collect();
                writeln!(f, "{}Concatenate: [{}]", prefix, cols.join(", "))?;
            }
            PlanOperator::Alias(node) => {
                let cols: Vec<String> = node
                    .columns
                    .iter()
                    .map(|c| format!("{} AS {}", c.source, c.name))
                    .collect();
                writeln!(f, "{}Alias: {} [{}]", prefix, node.alias, cols.join(", "))?;
            }
            PlanOperator::ConstantRow(node) => {
                let cols: Vec<&str> = node.columns.iter().map(|c| c.name.as_str()).collect();
                writeln!(
                    f,
                    "{}Constant Row: {} rows [{}]",
                    prefix,
                    node.rows.len(),
                    cols.join(", ")
                )?;
            }
            PlanOperator::Assert(node) => {
                writeln!(f, "{}Assert: {}", prefix, node.predicate)?;
            }
            PlanOperator::TableFunction(node) => {
                let name = match node.function {
                    TableFunctionKind::StringSplit => "STRING_SPLIT",
                    TableFunctionKind::GenerateSeries => "GENERATE_SERIES",
                };
                writeln!(
                    f,
                    "{}Table Function: {}({}) AS {}",
                    prefix,
                    name,
                    join_list(&node.args),
                    node.alias
                )?;
            }
        }

        for child in self.children() {
            child.fmt_indent(f, indent + 1)?;
        }
        Ok(())
    }
}

impl fmt::Display for QueryPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cols: Vec<String> = self
            .columns
            .iter()
            .map(|c| {
                if c.source.name == c.name {
                    c.source.to_string()
                } else {
                    format!("{} AS {}", c.source, c.name)
                }
            })
            .collect();
        writeln!(f, "Output: [{}]", cols.join(", "))?;
        self.root.fmt_indent(f, 1)
    }
}

impl fmt::Display for PlanRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.node.name())?;
        match &self.node {
            RootNode::Insert { entity, .. }
            | RootNode::Update { entity, .. }
            | RootNode::Delete { entity, .. } => write!(f, " {}", entity)?,
            RootNode::DeclareVariable { name, .. } | RootNode::AssignVariable { name, .. } => {
                write!(f, " {}", name)?
            }
            RootNode::ConditionalGoto { label, jump_if, .. } => {
                write!(f, " {} when {}", label, if *jump_if { "true" } else { "not true" })?
            }
            RootNode::Goto(label) | RootNode::Label(label) => write!(f, " {}", label)?,
            RootNode::CreateTempTable { name, .. } | RootNode::DropTempTable { name } => {
                write!(f, " {}", name)?
            }
            _ => {}
        }
        writeln!(f, " (line {}, column {})", self.span.line, self.span.column)?;
        for plan in self.node.plans() {
            write!(f, "{}", plan)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physical::{FilterNode, JoinNode, ScanColumn, ScanNode};
    use crate::planner::{Expr, ScalarValue};
    use arrow::datatypes::DataType;
    use std::sync::Arc;

    fn scan(entity: &str, alias: &str) -> Arc<PlanOperator> {
        Arc::new(PlanOperator::Scan(ScanNode {
            entity: entity.into(),
            alias: alias.into(),
            source: ScanSource::Entity,
            columns: vec![ScanColumn {
                name: "name".into(),
                data_type: DataType::Utf8,
                nullable: true,
                collation: None,
            }],
            primary_key: None,
            estimated_rows: None,
        }))
    }

    fn join_header(output: JoinOutput, anti_join: bool) -> String {
        let plan = PlanOperator::Join(JoinNode {
            left: scan("account", "a"),
            right: scan("contact", "c"),
            join_type: JoinType::Inner,
            strategy: JoinStrategy::NestedLoop {
                outer_references: vec![],
            },
            output,
            anti_join,
            condition: None,
            defined_values: vec![],
        });
        plan.to_string().lines().next().unwrap_or_default().to_string()
    }

    #[test]
    fn test_join_output_labels() {
        assert_eq!(join_header(JoinOutput::Both, false), "Nested Loop Join (Inner)");
        assert_eq!(join_header(JoinOutput::Left, false), "Nested Loop Join (Inner, semi)");
        assert_eq!(
            join_header(JoinOutput::Left, true),
            "Nested Loop Join (Inner, anti semi)"
        );
        assert_eq!(
            join_header(JoinOutput::Right, false),
            "Nested Loop Join (Inner, right columns)"
        );
    }

    #[test]
    fn test_display_indents_children() {
        let scan = scan("account", "a");
        let plan = PlanOperator::Filter(FilterNode {
            input: scan,
            predicate: Expr::qualified_column("a", "name")
                .eq(Expr::literal(ScalarValue::Utf8("x".into()))),
        });
        let text = plan.to_string();
        assert_eq!(
            text,
            "Filter: (a.name = 'x')\n  Scan: account AS a [name]\n"
        );
    }
}
