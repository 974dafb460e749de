//! Name resolution scopes
//!
//! A scope wraps the schema a clause is bound against. Scopes chain to the
//! scope of the enclosing query; a column that only resolves further out
//! becomes an outer reference. The parameter is registered on the scope
//! directly below the one that owns the column, since that is where the
//! nested loop binding it gets built.

use crate::error::{QueryError, Result};
use crate::physical::OuterReferenceBinding;
use crate::planner::{Column, Expr, PlanSchema};
use arrow::datatypes::DataType as ArrowDataType;
use std::cell::RefCell;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub(crate) struct CapturedReference {
    pub binding: OuterReferenceBinding,
    pub data_type: ArrowDataType,
}

pub(crate) struct Scope<'s> {
    pub schema: PlanSchema,
    /// Source aliases in FROM order, used to expand `*`
    pub tables: Vec<String>,
    /// Replacements keyed by the lowercase text of the original expression
    pub rewrites: HashMap<String, Expr>,
    /// Schema below the aggregate, used to explain ungrouped column errors
    pub pre_aggregate: Option<PlanSchema>,
    outer: Option<&'s Scope<'s>>,
    captured: RefCell<Vec<CapturedReference>>,
}

impl<'s> Scope<'s> {
    pub fn new(schema: PlanSchema, outer: Option<&'s Scope<'s>>) -> Self {
        Self {
            schema,
            tables: vec![],
            rewrites: HashMap::new(),
            pre_aggregate: None,
            outer,
            captured: RefCell::new(vec![]),
        }
    }

    pub fn with_tables(mut self, tables: Vec<String>) -> Self {
        self.tables = tables;
        self
    }

    pub fn captured(&self) -> Vec<CapturedReference> {
        self.captured.borrow().clone()
    }

    /// Record references captured by a nested binding that belong to this scope
    pub fn absorb(&self, references: Vec<CapturedReference>) {
        let mut captured = self.captured.borrow_mut();
        for r in references {
            if !captured.iter().any(|c| c.binding.param == r.binding.param) {
                captured.push(r);
            }
        }
    }

    fn capture(
        &self,
        column: Column,
        data_type: ArrowDataType,
        next_param: &mut dyn FnMut() -> String,
    ) -> Expr {
        let mut captured = self.captured.borrow_mut();
        if let Some(existing) = captured.iter().find(|c| c.binding.column == column) {
            return Expr::OuterReference {
                param: existing.binding.param.clone(),
                data_type: existing.data_type.clone(),
            };
        }
        let param = next_param();
        captured.push(CapturedReference {
            binding: OuterReferenceBinding {
                column,
                param: param.clone(),
            },
            data_type: data_type.clone(),
        });
        Expr::OuterReference { param, data_type }
    }

    /// Resolve a column here or in an enclosing scope
    pub fn resolve(&self, col: &Column, next_param: &mut dyn FnMut() -> String) -> Result<Expr> {
        if let Some((_, field)) = self.schema.try_resolve(col)? {
            return Ok(Expr::Column(field.column()));
        }

        let mut child = self;
        while let Some(parent) = child.outer {
            if let Some((_, field)) = parent.schema.try_resolve(col)? {
                return Ok(child.capture(field.column(), field.data_type.clone(), next_param));
            }
            child = parent;
        }

        if let Some(pre) = &self.pre_aggregate {
            if pre.contains(col) {
                return Err(QueryError::Semantic(format!(
                    "Column '{}' is invalid in the select list because it is not contained in either an aggregate function or the GROUP BY clause",
                    col.qualified_name()
                )));
            }
        }
        Err(QueryError::ColumnNotFound(col.qualified_name()))
    }

    /// Does any enclosing scope see a source with this alias
    pub fn is_known_relation(&self, relation: &str) -> bool {
        self.schema.has_relation(relation)
            || self
                .pre_aggregate
                .as_ref()
                .is_some_and(|s| s.has_relation(relation))
            || self.outer.is_some_and(|o| o.is_known_relation(relation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::SchemaField;

    fn schema(relation: &str, names: &[&str]) -> PlanSchema {
        PlanSchema::new(
            names
                .iter()
                .map(|n| {
                    SchemaField::new(*n, ArrowDataType::Int32).with_relation(Some(relation.into()))
                })
                .collect(),
        )
    }

    #[test]
    fn test_outer_reference_captured_on_child_scope() {
        let outer = Scope::new(schema("a", &["x"]), None);
        let middle = Scope::new(schema("b", &["y"]), Some(&outer));
        let inner = Scope::new(schema("c", &["z"]), Some(&middle));

        let mut n = 0;
        let mut next = || {
            n += 1;
            format!("@Expr{}", n)
        };
        let expr = inner.resolve(&Column::new("x"), &mut next).unwrap();
        assert!(matches!(expr, Expr::OuterReference { ref param, .. } if param == "@Expr1"));
        assert_eq!(middle.captured().len(), 1);
        assert!(inner.captured().is_empty());

        // Same column reuses the parameter
        let again = inner.resolve(&Column::new_qualified("a", "x"), &mut next).unwrap();
        assert_eq!(again, expr);
    }

    #[test]
    fn test_ungrouped_column_message() {
        let mut scope = Scope::new(schema("a", &["g"]), None);
        scope.pre_aggregate = Some(schema("a", &["g", "v"]));
        let err = scope
            .resolve(&Column::new("v"), &mut || "@p".to_string())
            .unwrap_err();
        assert!(err.to_string().contains("not contained in either an aggregate function"));
    }
}
