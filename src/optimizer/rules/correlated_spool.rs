//! Spool insertion below correlated nested loops
//!
//! A nested loop with outer references re-executes its inner side once per
//! outer row. Parts of the inner side that read no outer reference return the
//! same rows every time, so they are wrapped in a lazy spool that fetches them
//! once and replays the cached rows afterwards.

use crate::config::BuildOptions;
use crate::error::Result;
use crate::optimizer::{OptimizerRule, RowEstimator};
use crate::physical::{
    JoinNode, JoinStrategy, PlanOperator, SpoolId, SpoolKind, SpoolMode, SpoolNode,
};
use std::sync::Arc;
use tracing::debug;

/// Caches uncorrelated subtrees of correlated joins
pub struct CorrelatedSpoolInsertion {
    estimator: RowEstimator,
    outer_row_threshold: u64,
    inner_row_threshold: u64,
}

impl CorrelatedSpoolInsertion {
    pub fn new(options: &BuildOptions) -> Self {
        Self {
            estimator: RowEstimator::from_options(options),
            outer_row_threshold: options.spool_outer_row_threshold,
            inner_row_threshold: options.spool_inner_row_threshold,
        }
    }
}

impl OptimizerRule for CorrelatedSpoolInsertion {
    fn name(&self) -> &str {
        "CorrelatedSpoolInsertion"
    }

    fn optimize(&self, plan: Arc<PlanOperator>) -> Result<Arc<PlanOperator>> {
        let mut next_id = max_spool_id(&plan);
        self.optimize_plan(plan, &mut next_id)
    }
}

fn max_spool_id(plan: &PlanOperator) -> SpoolId {
    let mut max = 0;
    plan.apply(&mut |op| match op {
        PlanOperator::Spool(node) => max = max.max(node.id),
        PlanOperator::SpoolConsumer(node) => max = max.max(node.producer),
        _ => {}
    });
    max
}

fn reads_spool(plan: &PlanOperator) -> bool {
    let mut found = false;
    plan.apply(&mut |op| found |= matches!(op, PlanOperator::SpoolConsumer(_)));
    found
}

impl CorrelatedSpoolInsertion {
    fn optimize_plan(
        &self,
        plan: Arc<PlanOperator>,
        next_id: &mut SpoolId,
    ) -> Result<Arc<PlanOperator>> {
        let children = plan
            .children()
            .into_iter()
            .map(|child| self.optimize_plan(Arc::new(child.clone()), next_id))
            .collect::<Result<Vec<_>>>()?;
        let plan = if children.is_empty() {
            plan
        } else {
            Arc::new(plan.with_new_children(children)?)
        };

        let PlanOperator::Join(node) = plan.as_ref() else {
            return Ok(plan);
        };
        if !matches!(&node.strategy, JoinStrategy::NestedLoop { outer_references } if !outer_references.is_empty())
        {
            return Ok(plan);
        }

        let outer_rows = self.estimator.estimate(&node.left);
        let right = self.cache_uncorrelated(node.right.clone(), outer_rows, next_id)?;
        if Arc::ptr_eq(&right, &node.right) {
            return Ok(plan);
        }
        Ok(Arc::new(PlanOperator::Join(JoinNode {
            right,
            ..node.clone()
        })))
    }

    /// Wrap each maximal uncorrelated subtree of `plan` in a lazy spool when worthwhile
    fn cache_uncorrelated(
        &self,
        plan: Arc<PlanOperator>,
        outer_rows: f64,
        next_id: &mut SpoolId,
    ) -> Result<Arc<PlanOperator>> {
        if matches!(
            plan.as_ref(),
            PlanOperator::ConstantRow(_) | PlanOperator::SpoolConsumer(_) | PlanOperator::Spool(_)
        ) {
            return Ok(plan);
        }

        if !plan.is_correlated() && !reads_spool(&plan) {
            let inner_rows = self.estimator.estimate(&plan);
            if outer_rows >= self.outer_row_threshold as f64
                || inner_rows <= self.inner_row_threshold as f64
            {
                *next_id += 1;
                debug!(
                    spool = *next_id,
                    operator = plan.name(),
                    outer_rows,
                    inner_rows,
                    "caching uncorrelated subtree"
                );
                return Ok(Arc::new(PlanOperator::Spool(SpoolNode {
                    id: *next_id,
                    input: plan,
                    kind: SpoolKind::Lazy,
                    mode: SpoolMode::Table,
                })));
            }
            return Ok(plan);
        }

        let children = plan.children();
        if children.is_empty() {
            return Ok(plan);
        }
        let mut changed = false;
        let mut rewritten = Vec::with_capacity(children.len());
        for child in children {
            let child = Arc::new(child.clone());
            let new_child = self.cache_uncorrelated(child.clone(), outer_rows, next_id)?;
            changed |= !Arc::ptr_eq(&child, &new_child);
            rewritten.push(new_child);
        }
        if !changed {
            return Ok(plan);
        }
        Ok(Arc::new(plan.with_new_children(rewritten)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physical::{
        FilterNode, JoinOutput, JoinType, OuterReferenceBinding, ScanColumn, ScanNode, ScanSource,
    };
    use crate::planner::{Column, Expr};
    use arrow::datatypes::DataType as ArrowDataType;

    fn scan(alias: &str, rows: u64) -> Arc<PlanOperator> {
        Arc::new(PlanOperator::Scan(ScanNode {
            entity: alias.into(),
            alias: alias.into(),
            source: ScanSource::Entity,
            columns: vec![ScanColumn {
                name: "id".into(),
                data_type: ArrowDataType::Int32,
                nullable: false,
                collation: None,
            }],
            primary_key: Some("id".into()),
            estimated_rows: Some(rows),
        }))
    }

    fn correlated_join(outer_rows: u64, inner_rows: u64) -> Arc<PlanOperator> {
        let param = Expr::OuterReference {
            param: "@Expr1".into(),
            data_type: ArrowDataType::Int32,
        };
        // Filter reads the outer reference, its input does not
        let inner = Arc::new(PlanOperator::Filter(FilterNode {
            input: scan("b", inner_rows),
            predicate: Expr::qualified_column("b", "id").eq(param),
        }));
        Arc::new(PlanOperator::Join(JoinNode {
            left: scan("a", outer_rows),
            right: inner,
            join_type: JoinType::LeftOuter,
            strategy: JoinStrategy::NestedLoop {
                outer_references: vec![OuterReferenceBinding {
                    column: Column::new_qualified("a", "id"),
                    param: "@Expr1".into(),
                }],
            },
            output: JoinOutput::Left,
            anti_join: false,
            condition: None,
            defined_values: vec![],
        }))
    }

    fn spool_count(plan: &PlanOperator) -> usize {
        let mut n = 0;
        plan.apply(&mut |op| {
            if matches!(op, PlanOperator::Spool(_)) {
                n += 1
            }
        });
        n
    }

    #[test]
    fn test_spool_inserted_for_many_outer_rows() {
        let rule = CorrelatedSpoolInsertion::new(&BuildOptions::default());
        let plan = rule.optimize(correlated_join(500, 100_000)).unwrap();
        assert_eq!(spool_count(&plan), 1);
        let PlanOperator::Join(join) = plan.as_ref() else {
            panic!("expected join");
        };
        let PlanOperator::Filter(filter) = join.right.as_ref() else {
            panic!("expected filter");
        };
        assert!(matches!(filter.input.as_ref(), PlanOperator::Spool(s) if s.kind == SpoolKind::Lazy));
    }

    #[test]
    fn test_spool_inserted_for_small_inner() {
        let rule = CorrelatedSpoolInsertion::new(&BuildOptions::default());
        let plan = rule.optimize(correlated_join(10, 50)).unwrap();
        assert_eq!(spool_count(&plan), 1);
    }

    #[test]
    fn test_no_spool_for_few_outer_rows_and_large_inner() {
        let rule = CorrelatedSpoolInsertion::new(&BuildOptions::default());
        let plan = rule.optimize(correlated_join(10, 100_000)).unwrap();
        assert_eq!(spool_count(&plan), 0);
    }
}
