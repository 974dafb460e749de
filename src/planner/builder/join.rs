//! Join assembly
//!
//! Two inputs are combined with the cheapest strategy their keys allow:
//!
//! - Merge: an equality whose key is the primary key of its side; both
//!   inputs are sorted on the key unless already ordered.
//! - Hash: any other equality between a column of each side.
//! - Nested loop: no usable equality; the inner side is wrapped in an eager
//!   spool so the backend is queried once.
//!
//! The remaining conjuncts become a filter above inner hash/merge joins and
//! stay in the join condition otherwise.

use super::expr::contains_subquery;
use super::from::BoundSource;
use super::scope::Scope;
use super::BuildContext;
use crate::error::{QueryError, Result};
use crate::parser::{JoinConstraint, JoinOperator, TableFactor};
use crate::physical::{
    ComputeScalarNode, FilterNode, JoinNode, JoinOutput, JoinStrategy, JoinType, PlanOperator,
    ScanSource, SortNode, SpoolKind, SpoolMode, SpoolNode,
};
use crate::planner::{check_comparable, is_string, BinaryOp, Column, Expr, PlanSchema, SortKey};
use sqlparser::ast::Join;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Left,
    Right,
}

fn side_of(expr: &Expr, left: &PlanSchema, right: &PlanSchema) -> Option<Side> {
    let refs = expr.column_refs();
    if refs.is_empty() {
        None
    } else if refs.iter().all(|c| left.contains(c)) {
        Some(Side::Left)
    } else if refs.iter().all(|c| right.contains(c)) {
        Some(Side::Right)
    } else {
        None
    }
}

/// First equality comparing an expression of each side, oriented left/right,
/// and the remaining conjuncts
fn split_equi_key(
    conjuncts: Vec<Expr>,
    left: &PlanSchema,
    right: &PlanSchema,
) -> (Option<(Expr, Expr)>, Vec<Expr>) {
    let mut key = None;
    let mut residue = vec![];
    for conjunct in conjuncts {
        if key.is_none() {
            if let Expr::BinaryExpr {
                left: l,
                op: BinaryOp::Eq,
                right: r,
            } = &conjunct
            {
                match (side_of(l, left, right), side_of(r, left, right)) {
                    (Some(Side::Left), Some(Side::Right)) => {
                        key = Some((l.as_ref().clone(), r.as_ref().clone()));
                        continue;
                    }
                    (Some(Side::Right), Some(Side::Left)) => {
                        key = Some((r.as_ref().clone(), l.as_ref().clone()));
                        continue;
                    }
                    _ => {}
                }
            }
        }
        residue.push(conjunct);
    }
    (key, residue)
}

/// Sort `plan` ascending on `key` unless it is already ordered that way
pub(crate) fn sort_by(plan: Arc<PlanOperator>, key: &Column) -> Arc<PlanOperator> {
    let keys = vec![SortKey::asc(key.clone())];
    if plan.schema().is_sorted_by(&keys) {
        return plan;
    }
    Arc::new(PlanOperator::Sort(SortNode { input: plan, keys }))
}

fn scan_entity(plan: &PlanOperator, relation: &str) -> Option<String> {
    let mut found = None;
    plan.apply(&mut |op| {
        if let PlanOperator::Scan(scan) = op {
            if scan.source != ScanSource::TempTable && scan.alias.eq_ignore_ascii_case(relation) {
                found = Some(scan.entity.clone());
            }
        }
    });
    found
}

impl BuildContext<'_> {
    pub(crate) fn bind_join(&mut self, left: BoundSource, join: &Join, scope: &Scope) -> Result<BoundSource> {
        let (join_type, constraint) = match &join.join_operator {
            JoinOperator::Inner(c) => (JoinType::Inner, c),
            JoinOperator::LeftOuter(c) => (JoinType::LeftOuter, c),
            JoinOperator::RightOuter(c) => (JoinType::RightOuter, c),
            JoinOperator::FullOuter(c) => (JoinType::FullOuter, c),
            JoinOperator::CrossJoin => {
                let right = self.bind_table_factor(&join.relation, scope)?;
                return Ok(self.cross_join(left, right));
            }
            JoinOperator::CrossApply => {
                return self.bind_apply(left, &join.relation, JoinType::Inner, scope)
            }
            JoinOperator::OuterApply => {
                return self.bind_apply(left, &join.relation, JoinType::LeftOuter, scope)
            }
            other => return Err(QueryError::not_supported(format!("{:?} join", other))),
        };

        let on = match constraint {
            JoinConstraint::On(expr) => Some(expr),
            JoinConstraint::None => None,
            _ => {
                return Err(QueryError::not_supported_with(
                    "USING or NATURAL join",
                    "Use an ON clause",
                ))
            }
        };
        if let Some(expr) = on {
            if contains_subquery(expr) {
                return Err(QueryError::not_supported_with(
                    format!("subquery in ON clause: {}", expr),
                    "Move the subquery to the WHERE clause",
                ));
            }
        }

        let right = self.bind_table_factor(&join.relation, scope)?;
        let mut tables = left.tables;
        tables.extend(right.tables);

        let (outer, inner, join_type) = if join_type == JoinType::RightOuter {
            (right.plan, left.plan, JoinType::LeftOuter)
        } else {
            (left.plan, right.plan, join_type)
        };

        let condition = match on {
            Some(expr) => {
                let join_scope = Scope::new(outer.schema().merge(&inner.schema()), Some(scope));
                let condition = self.bind_predicate(expr, &join_scope)?;
                scope.absorb(join_scope.captured());
                Some(condition)
            }
            None => None,
        };

        let plan = self.assemble_join(outer, inner, join_type, condition)?;
        Ok(BoundSource { plan, tables })
    }

    /// Cartesian product of two sources
    pub(crate) fn cross_join(&mut self, left: BoundSource, right: BoundSource) -> BoundSource {
        let mut tables = left.tables;
        tables.extend(right.tables);
        let inner = self.eager_spool(right.plan);
        let join = JoinNode {
            left: left.plan,
            right: inner,
            join_type: JoinType::Inner,
            strategy: JoinStrategy::NestedLoop {
                outer_references: vec![],
            },
            output: JoinOutput::Both,
            anti_join: false,
            condition: None,
            defined_values: vec![],
        };
        BoundSource {
            plan: Arc::new(PlanOperator::Join(join)),
            tables,
        }
    }

    /// Buffer `plan` so repeated reads do not go back to the backend
    pub(crate) fn eager_spool(&mut self, plan: Arc<PlanOperator>) -> Arc<PlanOperator> {
        if matches!(
            plan.as_ref(),
            PlanOperator::ConstantRow(_) | PlanOperator::Spool(_)
        ) {
            return plan;
        }
        Arc::new(PlanOperator::Spool(SpoolNode {
            id: self.next_spool_id(),
            input: plan,
            kind: SpoolKind::Eager,
            mode: SpoolMode::Table,
        }))
    }

    /// `CROSS APPLY` / `OUTER APPLY`: the right side is re-evaluated per left row
    fn bind_apply(
        &mut self,
        left: BoundSource,
        relation: &TableFactor,
        join_type: JoinType,
        scope: &Scope,
    ) -> Result<BoundSource> {
        let apply_scope = Scope::new(left.plan.schema(), Some(scope));
        let right = self.bind_table_factor(relation, &apply_scope)?;
        let captured = apply_scope.captured();

        let mut tables = left.tables;
        tables.extend(right.tables);

        let (inner, outer_references) = if captured.is_empty() && !right.plan.is_correlated() {
            (self.eager_spool(right.plan), vec![])
        } else {
            (
                right.plan,
                captured.into_iter().map(|c| c.binding).collect::<Vec<_>>(),
            )
        };
        debug!(
            ?join_type,
            outer_references = outer_references.len(),
            "apply lowered to nested loop"
        );

        let join = JoinNode {
            left: left.plan,
            right: inner,
            join_type,
            strategy: JoinStrategy::NestedLoop { outer_references },
            output: JoinOutput::Both,
            anti_join: false,
            condition: None,
            defined_values: vec![],
        };
        Ok(BoundSource {
            plan: Arc::new(PlanOperator::Join(join)),
            tables,
        })
    }

    /// Replace a non-column key expression by a computed column of `plan`
    pub(crate) fn hoist_key(&mut self, plan: Arc<PlanOperator>, expr: Expr) -> Result<(Arc<PlanOperator>, Column)> {
        let schema = plan.schema();
        let (column, defined) = self.column_or_hoist(expr, &schema)?;
        let plan = match defined {
            Some(value) => Arc::new(PlanOperator::ComputeScalar(ComputeScalarNode {
                input: plan,
                values: vec![value],
            })),
            None => plan,
        };
        Ok((plan, column))
    }

    fn check_join_key(
        &self,
        left: &Expr,
        left_schema: &PlanSchema,
        right: &Expr,
        right_schema: &PlanSchema,
    ) -> Result<()> {
        let left_type = left.data_type(left_schema)?;
        let right_type = right.data_type(right_schema)?;
        check_comparable(&left_type, &right_type)?;
        if is_string(&left_type) && is_string(&right_type) {
            let default = &self.options.default_collation;
            left.collation_label(left_schema, default)?
                .resolve_comparison(&right.collation_label(right_schema, default)?)?;
        }
        Ok(())
    }

    fn relationship_between(
        &self,
        left: &PlanOperator,
        left_key: &Column,
        right: &PlanOperator,
        right_key: &Column,
    ) -> Option<String> {
        let left_entity = scan_entity(left, left_key.relation.as_deref()?)?;
        let right_entity = scan_entity(right, right_key.relation.as_deref()?)?;
        let left_meta = self.catalog.lookup(&left_entity).ok()?;
        if let Some(r) = left_meta.find_relationship(&left_key.name, &right_entity, &right_key.name) {
            return Some(r.name.clone());
        }
        let right_meta = self.catalog.lookup(&right_entity).ok()?;
        right_meta
            .find_relationship(&right_key.name, &left_entity, &left_key.name)
            .map(|r| r.name.clone())
    }

    /// Combine two inputs under `condition`, choosing the join strategy
    pub(crate) fn assemble_join(
        &mut self,
        left: Arc<PlanOperator>,
        right: Arc<PlanOperator>,
        join_type: JoinType,
        condition: Option<Expr>,
    ) -> Result<Arc<PlanOperator>> {
        let left_schema = left.schema();
        let right_schema = right.schema();
        let conjuncts = condition
            .map(|c| c.split_conjunction().into_iter().cloned().collect())
            .unwrap_or_default();
        let (key, residue) = split_equi_key(conjuncts, &left_schema, &right_schema);

        let Some((left_expr, right_expr)) = key else {
            if join_type == JoinType::FullOuter {
                return Err(QueryError::not_supported_with(
                    "FULL OUTER JOIN without an equality condition",
                    "Add an equality between a column of each side",
                ));
            }
            debug!(strategy = "Nested Loop", ?join_type, "join strategy chosen");
            let inner = self.eager_spool(right);
            return Ok(Arc::new(PlanOperator::Join(JoinNode {
                left,
                right: inner,
                join_type,
                strategy: JoinStrategy::NestedLoop {
                    outer_references: vec![],
                },
                output: JoinOutput::Both,
                anti_join: false,
                condition: Expr::conjunction(residue),
                defined_values: vec![],
            })));
        };

        self.check_join_key(&left_expr, &left_schema, &right_expr, &right_schema)?;
        let (left, left_key) = self.hoist_key(left, left_expr)?;
        let (right, right_key) = self.hoist_key(right, right_expr)?;

        let merge = left.schema().is_primary_key(&left_key) || right.schema().is_primary_key(&right_key);
        let (strategy, left, right) = if merge {
            (
                JoinStrategy::Merge {
                    left_key: left_key.clone(),
                    right_key: right_key.clone(),
                },
                sort_by(left, &left_key),
                sort_by(right, &right_key),
            )
        } else {
            (
                JoinStrategy::Hash {
                    left_key: left_key.clone(),
                    right_key: right_key.clone(),
                },
                left,
                right,
            )
        };

        let relationship = self.relationship_between(&left, &left_key, &right, &right_key);
        debug!(
            strategy = strategy.name(),
            ?join_type,
            left_key = %left_key,
            right_key = %right_key,
            relationship = relationship.as_deref().unwrap_or("none"),
            "join strategy chosen"
        );

        let residual = Expr::conjunction(residue);
        let (condition, filter) = if join_type == JoinType::Inner {
            (None, residual)
        } else {
            (residual, None)
        };
        let join = Arc::new(PlanOperator::Join(JoinNode {
            left,
            right,
            join_type,
            strategy,
            output: JoinOutput::Both,
            anti_join: false,
            condition,
            defined_values: vec![],
        }));
        Ok(match filter {
            Some(predicate) => Arc::new(PlanOperator::Filter(FilterNode {
                input: join,
                predicate,
            })),
            None => join,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::SchemaField;
    use arrow::datatypes::DataType as ArrowDataType;

    fn schema(relation: &str) -> PlanSchema {
        PlanSchema::new(vec![
            SchemaField::new("id", ArrowDataType::Int32).with_relation(Some(relation.into())),
            SchemaField::new("v", ArrowDataType::Int32).with_relation(Some(relation.into())),
        ])
    }

    #[test]
    fn test_equality_oriented_left_to_right() {
        let l = schema("a");
        let r = schema("b");
        let cond = Expr::qualified_column("b", "id")
            .eq(Expr::qualified_column("a", "v"))
            .and(Expr::qualified_column("a", "id").lt_eq(Expr::qualified_column("b", "v")));
        let conjuncts = cond.split_conjunction().into_iter().cloned().collect();
        let (key, residue) = split_equi_key(conjuncts, &l, &r);
        let (lk, rk) = key.unwrap();
        assert_eq!(lk, Expr::qualified_column("a", "v"));
        assert_eq!(rk, Expr::qualified_column("b", "id"));
        assert_eq!(residue.len(), 1);
    }

    #[test]
    fn test_same_side_equality_is_residue() {
        let l = schema("a");
        let r = schema("b");
        let cond = Expr::qualified_column("a", "id").eq(Expr::qualified_column("a", "v"));
        let (key, residue) = split_equi_key(vec![cond], &l, &r);
        assert!(key.is_none());
        assert_eq!(residue.len(), 1);
    }
}
