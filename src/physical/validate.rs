//! Spool scheduling checks
//!
//! A spool consumer may only read a producer that has already been
//! scheduled: it must sit inside the producer's own subtree (the recursive
//! step of a stack spool), or on the inner side of a nested loop whose outer
//! side contains the producer.

use crate::error::{QueryError, Result};
use crate::physical::{JoinStrategy, PlanOperator, SpoolId};
use std::collections::HashSet;

/// Check that every spool consumer reads a producer scheduled before it
pub fn validate_spools(plan: &PlanOperator) -> Result<()> {
    let mut seen = HashSet::new();
    collect_producers(plan, &mut seen)?;
    check(plan, &HashSet::new())
}

fn collect_producers(plan: &PlanOperator, seen: &mut HashSet<SpoolId>) -> Result<()> {
    if let PlanOperator::Spool(node) = plan {
        if !seen.insert(node.id) {
            return Err(QueryError::Internal(format!(
                "spool #{} is produced more than once",
                node.id
            )));
        }
    }
    for child in plan.children() {
        collect_producers(child, seen)?;
    }
    Ok(())
}

fn producers_in(plan: &PlanOperator) -> HashSet<SpoolId> {
    let mut ids = HashSet::new();
    plan.apply(&mut |op| {
        if let PlanOperator::Spool(node) = op {
            ids.insert(node.id);
        }
    });
    ids
}

fn check(plan: &PlanOperator, available: &HashSet<SpoolId>) -> Result<()> {
    match plan {
        PlanOperator::SpoolConsumer(node) => {
            if available.contains(&node.producer) {
                Ok(())
            } else {
                Err(QueryError::Internal(format!(
                    "spool consumer reads spool #{} before it is produced",
                    node.producer
                )))
            }
        }
        PlanOperator::Spool(node) => {
            let mut inner = available.clone();
            inner.insert(node.id);
            check(&node.input, &inner)
        }
        PlanOperator::Join(node) if matches!(node.strategy, JoinStrategy::NestedLoop { .. }) => {
            check(&node.left, available)?;
            let mut inner = available.clone();
            inner.extend(producers_in(&node.left));
            check(&node.right, &inner)
        }
        _ => {
            for child in plan.children() {
                check(child, available)?;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physical::{
        JoinNode, JoinOutput, JoinType, SpoolConsumerNode, SpoolKind, SpoolMode, SpoolNode,
        ConstantRowNode,
    };
    use crate::planner::PlanSchema;
    use std::sync::Arc;

    fn constant() -> Arc<PlanOperator> {
        Arc::new(PlanOperator::ConstantRow(ConstantRowNode {
            columns: vec![],
            rows: vec![vec![]],
        }))
    }

    fn consumer(id: SpoolId) -> Arc<PlanOperator> {
        Arc::new(PlanOperator::SpoolConsumer(SpoolConsumerNode {
            producer: id,
            schema: PlanSchema::empty(),
        }))
    }

    fn spool(id: SpoolId, input: Arc<PlanOperator>) -> Arc<PlanOperator> {
        Arc::new(PlanOperator::Spool(SpoolNode {
            id,
            input,
            kind: SpoolKind::Lazy,
            mode: SpoolMode::Segment { segment: None },
        }))
    }

    fn nested_loop(left: Arc<PlanOperator>, right: Arc<PlanOperator>) -> PlanOperator {
        PlanOperator::Join(JoinNode {
            left,
            right,
            join_type: JoinType::Inner,
            strategy: JoinStrategy::NestedLoop {
                outer_references: vec![],
            },
            output: JoinOutput::Right,
            anti_join: false,
            condition: None,
            defined_values: vec![],
        })
    }

    #[test]
    fn test_consumer_after_producer_on_outer_side() {
        let plan = nested_loop(spool(1, constant()), consumer(1));
        assert!(validate_spools(&plan).is_ok());
    }

    #[test]
    fn test_consumer_before_producer_rejected() {
        let plan = nested_loop(consumer(1), spool(1, constant()));
        assert!(validate_spools(&plan).is_err());
    }

    #[test]
    fn test_consumer_inside_producer() {
        let plan = spool(2, Arc::new(nested_loop(constant(), consumer(2))));
        assert!(validate_spools(&plan).is_ok());
    }

    #[test]
    fn test_duplicate_producer_rejected() {
        let plan = nested_loop(spool(1, constant()), spool(1, constant()));
        assert!(validate_spools(&plan).is_err());
    }
}
