//! Row estimation for plan operators

use crate::config::BuildOptions;
use crate::physical::{JoinStrategy, PlanOperator};
use crate::planner::{BinaryOp, Expr};

/// Estimates operator output cardinality
#[derive(Debug, Clone)]
pub struct RowEstimator {
    /// Row count for entities without statistics
    pub default_row_count: u64,
    /// Fraction of rows passing a filter
    pub filter_selectivity: f64,
    /// Fraction of input rows forming distinct groups
    pub group_ratio: f64,
}

impl Default for RowEstimator {
    fn default() -> Self {
        Self {
            default_row_count: 1000,
            filter_selectivity: 0.3,
            group_ratio: 0.1,
        }
    }
}

impl RowEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_options(options: &BuildOptions) -> Self {
        Self {
            default_row_count: options.default_row_estimate,
            filter_selectivity: options.filter_selectivity,
            ..Self::default()
        }
    }

    /// Estimated number of rows produced by `plan`
    pub fn estimate(&self, plan: &PlanOperator) -> f64 {
        if let Some(max) = self.max_rows(plan) {
            return max as f64;
        }
        match plan {
            PlanOperator::Scan(node) => {
                node.estimated_rows.unwrap_or(self.default_row_count) as f64
            }
            PlanOperator::TableFunction(_) => self.default_row_count as f64,
            PlanOperator::Filter(node) => self.estimate(&node.input) * self.filter_selectivity,
            PlanOperator::Join(node) => {
                let left = self.estimate(&node.left);
                let right = self.estimate(&node.right);
                if node.is_semi_join() {
                    return left;
                }
                match node.strategy {
                    JoinStrategy::Merge { .. } | JoinStrategy::Hash { .. } => left.max(right),
                    JoinStrategy::NestedLoop { .. } if node.condition.is_some() => {
                        (left * right * self.filter_selectivity).max(left)
                    }
                    JoinStrategy::NestedLoop { .. } => left * right,
                }
            }
            PlanOperator::Aggregate(node) => {
                (self.estimate(&node.input) * self.group_ratio).max(1.0)
            }
            PlanOperator::Distinct(node) => (self.estimate(&node.input) * 0.8).max(1.0),
            PlanOperator::Top(node) => self.estimate(&node.input),
            PlanOperator::OffsetFetch(node) => self.estimate(&node.input),
            PlanOperator::Concatenate(node) => {
                node.inputs.iter().map(|i| self.estimate(i)).sum()
            }
            PlanOperator::ConstantRow(node) => node.rows.len() as f64,
            PlanOperator::SpoolConsumer(_) => self.default_row_count as f64,
            other => other
                .children()
                .first()
                .map(|c| self.estimate(c))
                .unwrap_or(self.default_row_count as f64),
        }
    }

    /// Upper bound on the rows produced by `plan` when one can be proven
    pub fn max_rows(&self, plan: &PlanOperator) -> Option<u64> {
        match plan {
            PlanOperator::ConstantRow(node) => Some(node.rows.len() as u64),
            PlanOperator::Aggregate(node) if node.group_by.is_empty() => Some(1),
            PlanOperator::Aggregate(node) => self.max_rows(&node.input),
            PlanOperator::Top(node) if !node.percent && !node.with_ties => literal_count(&node.count)
                .map(|n| self.max_rows(&node.input).map_or(n, |m| m.min(n))),
            PlanOperator::OffsetFetch(node) => node
                .fetch
                .as_ref()
                .and_then(literal_count)
                .or_else(|| self.max_rows(&node.input)),
            PlanOperator::Filter(node) => {
                let schema = node.input.schema();
                let unique = node.predicate.split_conjunction().into_iter().any(|c| {
                    match c {
                        Expr::BinaryExpr {
                            left,
                            op: BinaryOp::Eq,
                            right,
                        } => {
                            let pins = |key: &Expr, value: &Expr| {
                                key.as_column().is_some_and(|col| schema.is_primary_key(col))
                                    && value.column_refs().is_empty()
                            };
                            pins(left, right) || pins(right, left)
                        }
                        _ => false,
                    }
                });
                if unique {
                    Some(1)
                } else {
                    self.max_rows(&node.input)
                }
            }
            PlanOperator::Join(node) if node.is_semi_join() => self.max_rows(&node.left),
            PlanOperator::Join(_) => None,
            PlanOperator::Concatenate(node) => node
                .inputs
                .iter()
                .map(|i| self.max_rows(i))
                .sum::<Option<u64>>(),
            PlanOperator::ComputeScalar(node) => self.max_rows(&node.input),
            PlanOperator::Sort(node) => self.max_rows(&node.input),
            PlanOperator::Alias(node) => self.max_rows(&node.input),
            PlanOperator::Distinct(node) => self.max_rows(&node.input),
            PlanOperator::Assert(node) => self.max_rows(&node.input),
            PlanOperator::Segment(node) => self.max_rows(&node.input),
            PlanOperator::SequenceProject(node) => self.max_rows(&node.input),
            PlanOperator::Top(_)
            | PlanOperator::Scan(_)
            | PlanOperator::Spool(_)
            | PlanOperator::SpoolConsumer(_)
            | PlanOperator::TableFunction(_) => None,
        }
    }
}

fn literal_count(expr: &Expr) -> Option<u64> {
    match expr {
        Expr::Literal(v) => v.as_i64().and_then(|n| u64::try_from(n).ok()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physical::{ConstantRowNode, FilterNode, ScanColumn, ScanNode, ScanSource, TopNode};
    use crate::planner::GUID_TYPE;
    use std::sync::Arc;

    fn scan(rows: Option<u64>) -> Arc<PlanOperator> {
        Arc::new(PlanOperator::Scan(ScanNode {
            entity: "account".into(),
            alias: "a".into(),
            source: ScanSource::Entity,
            columns: vec![ScanColumn {
                name: "accountid".into(),
                data_type: GUID_TYPE,
                nullable: false,
                collation: None,
            }],
            primary_key: Some("accountid".into()),
            estimated_rows: rows,
        }))
    }

    #[test]
    fn test_scan_uses_statistics_or_default() {
        let est = RowEstimator::new();
        assert_eq!(est.estimate(&scan(Some(42))), 42.0);
        assert_eq!(est.estimate(&scan(None)), 1000.0);
    }

    #[test]
    fn test_filter_selectivity() {
        let est = RowEstimator::new();
        let plan = PlanOperator::Filter(FilterNode {
            input: scan(None),
            predicate: Expr::qualified_column("a", "accountid").is_not_null(),
        });
        assert!((est.estimate(&plan) - 300.0).abs() < f64::EPSILON);
        assert_eq!(est.max_rows(&plan), None);
    }

    #[test]
    fn test_primary_key_filter_is_single_row() {
        let est = RowEstimator::new();
        let plan = PlanOperator::Filter(FilterNode {
            input: scan(None),
            predicate: Expr::qualified_column("a", "accountid").eq(Expr::Variable {
                name: "@id".into(),
                data_type: GUID_TYPE,
            }),
        });
        assert_eq!(est.max_rows(&plan), Some(1));
    }

    #[test]
    fn test_top_bounds_rows() {
        let est = RowEstimator::new();
        let plan = PlanOperator::Top(TopNode {
            input: scan(None),
            count: Expr::int(5),
            percent: false,
            with_ties: false,
        });
        assert_eq!(est.max_rows(&plan), Some(5));
        let constant = PlanOperator::ConstantRow(ConstantRowNode {
            columns: vec![],
            rows: vec![vec![]],
        });
        assert_eq!(est.max_rows(&constant), Some(1));
    }
}
