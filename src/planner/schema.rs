//! Schema types tracked through plan operators
//!
//! Column names are case-insensitive. A column may be referenced by its bare
//! name when that name is unique in the schema, or qualified by the alias of
//! the source that produced it.

use crate::error::{QueryError, Result};
use crate::planner::collation::Collation;
use crate::planner::logical_expr::SortDirection;
use arrow::datatypes::DataType as ArrowDataType;
use std::collections::HashMap;
use std::fmt;

/// A column reference, optionally qualified by the alias of its source
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Column {
    pub relation: Option<String>,
    pub name: String,
}

impl Column {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            relation: None,
            name: name.into(),
        }
    }

    pub fn new_qualified(relation: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            relation: Some(relation.into()),
            name: name.into(),
        }
    }

    pub fn qualified_name(&self) -> String {
        match &self.relation {
            Some(r) => format!("{}.{}", r, self.name),
            None => self.name.clone(),
        }
    }

    /// Case-insensitive comparison of two references to the same column
    pub fn matches(&self, other: &Column) -> bool {
        self.name.eq_ignore_ascii_case(&other.name)
            && match (&self.relation, &other.relation) {
                (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
                (None, None) => true,
                _ => false,
            }
    }
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.qualified_name())
    }
}

/// A column visible in the output of an operator
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaField {
    pub name: String,
    pub data_type: ArrowDataType,
    pub nullable: bool,
    /// Alias of the source that produced the column
    pub relation: Option<String>,
    /// Produced by an expression rather than read from a source
    pub calculated: bool,
    /// Hidden columns resolve by name but are skipped by `*`
    pub visible: bool,
    pub collation: Option<Collation>,
}

impl SchemaField {
    pub fn new(name: impl Into<String>, data_type: ArrowDataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: true,
            relation: None,
            calculated: false,
            visible: true,
            collation: None,
        }
    }

    pub fn with_nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    pub fn with_relation(mut self, relation: Option<String>) -> Self {
        self.relation = relation;
        self
    }

    pub fn with_calculated(mut self, calculated: bool) -> Self {
        self.calculated = calculated;
        self
    }

    pub fn with_visible(mut self, visible: bool) -> Self {
        self.visible = visible;
        self
    }

    pub fn with_collation(mut self, collation: Option<Collation>) -> Self {
        self.collation = collation;
        self
    }

    pub fn column(&self) -> Column {
        Column {
            relation: self.relation.clone(),
            name: self.name.clone(),
        }
    }
}

/// One key of a guaranteed sort order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub column: Column,
    pub direction: SortDirection,
}

impl SortKey {
    pub fn asc(column: Column) -> Self {
        Self {
            column,
            direction: SortDirection::Asc,
        }
    }
}

impl fmt::Display for SortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.column, self.direction)
    }
}

/// Output schema of a plan operator
#[derive(Debug, Clone)]
pub struct PlanSchema {
    fields: Vec<SchemaField>,
    /// Lowercase bare name -> field indices
    name_index: HashMap<String, Vec<usize>>,
    /// Lowercase qualified name -> field indices
    qualified_index: HashMap<String, Vec<usize>>,
    /// Column still uniquely identifying backend rows
    primary_key: Option<Column>,
    sort_order: Vec<SortKey>,
}

impl PartialEq for PlanSchema {
    fn eq(&self, other: &Self) -> bool {
        self.fields == other.fields
            && self.primary_key == other.primary_key
            && self.sort_order == other.sort_order
    }
}

impl PlanSchema {
    pub fn new(fields: Vec<SchemaField>) -> Self {
        let mut name_index: HashMap<String, Vec<usize>> = HashMap::new();
        let mut qualified_index: HashMap<String, Vec<usize>> = HashMap::new();

        for (i, field) in fields.iter().enumerate() {
            name_index
                .entry(field.name.to_lowercase())
                .or_default()
                .push(i);
            if field.relation.is_some() {
                qualified_index
                    .entry(field.column().qualified_name().to_lowercase())
                    .or_default()
                    .push(i);
            }
        }

        Self {
            fields,
            name_index,
            qualified_index,
            primary_key: None,
            sort_order: vec![],
        }
    }

    pub fn empty() -> Self {
        Self::new(vec![])
    }

    pub fn with_primary_key(mut self, primary_key: Option<Column>) -> Self {
        // A key that no longer resolves cannot identify rows
        self.primary_key = primary_key.filter(|pk| self.contains(pk));
        self
    }

    pub fn with_sort_order(mut self, sort_order: Vec<SortKey>) -> Self {
        let keep = sort_order
            .iter()
            .take_while(|k| self.contains(&k.column))
            .count();
        self.sort_order = sort_order;
        self.sort_order.truncate(keep);
        self
    }

    pub fn fields(&self) -> &[SchemaField] {
        &self.fields
    }

    pub fn field(&self, index: usize) -> Option<&SchemaField> {
        self.fields.get(index)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn primary_key(&self) -> Option<&Column> {
        self.primary_key.as_ref()
    }

    pub fn sort_order(&self) -> &[SortKey] {
        &self.sort_order
    }

    fn candidates(&self, col: &Column) -> &[usize] {
        let found = match &col.relation {
            Some(_) => self.qualified_index.get(&col.qualified_name().to_lowercase()),
            None => self.name_index.get(&col.name.to_lowercase()),
        };
        found.map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Resolve a column, returning `None` when it is absent
    pub fn try_resolve(&self, col: &Column) -> Result<Option<(usize, &SchemaField)>> {
        match self.candidates(col) {
            [] => Ok(None),
            [idx] => Ok(Some((*idx, &self.fields[*idx]))),
            _ => Err(QueryError::AmbiguousColumn(col.qualified_name())),
        }
    }

    /// Resolve a column that must exist exactly once
    pub fn resolve_column(&self, col: &Column) -> Result<(usize, &SchemaField)> {
        self.try_resolve(col)?
            .ok_or_else(|| QueryError::ColumnNotFound(col.qualified_name()))
    }

    /// True when the column resolves to exactly one field
    pub fn contains(&self, col: &Column) -> bool {
        self.candidates(col).len() == 1
    }

    pub fn has_relation(&self, relation: &str) -> bool {
        self.fields.iter().any(|f| {
            f.relation
                .as_deref()
                .is_some_and(|r| r.eq_ignore_ascii_case(relation))
        })
    }

    /// Visible fields, optionally restricted to one source alias
    pub fn visible_fields<'a>(
        &'a self,
        relation: Option<&'a str>,
    ) -> impl Iterator<Item = &'a SchemaField> + 'a {
        self.fields.iter().filter(move |f| {
            f.visible
                && match relation {
                    Some(rel) => f
                        .relation
                        .as_deref()
                        .is_some_and(|r| r.eq_ignore_ascii_case(rel)),
                    None => true,
                }
        })
    }

    pub fn is_primary_key(&self, col: &Column) -> bool {
        match (&self.primary_key, self.try_resolve(col)) {
            (Some(pk), Ok(Some((idx, _)))) => {
                matches!(self.try_resolve(pk), Ok(Some((pk_idx, _))) if pk_idx == idx)
            }
            _ => false,
        }
    }

    /// True when rows are already ordered by `keys` (as a prefix of the order)
    pub fn is_sorted_by(&self, keys: &[SortKey]) -> bool {
        keys.len() <= self.sort_order.len()
            && keys.iter().zip(&self.sort_order).all(|(want, have)| {
                want.direction == have.direction
                    && match (self.try_resolve(&want.column), self.try_resolve(&have.column)) {
                        (Ok(Some((a, _))), Ok(Some((b, _)))) => a == b,
                        _ => false,
                    }
            })
    }

    /// Concatenate two schemas (for joins), dropping key and order
    pub fn merge(&self, other: &PlanSchema) -> Self {
        let mut fields = self.fields.clone();
        fields.extend(other.fields.iter().cloned());
        Self::new(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account_schema() -> PlanSchema {
        PlanSchema::new(vec![
            SchemaField::new("accountid", ArrowDataType::FixedSizeBinary(16))
                .with_relation(Some("a".into()))
                .with_nullable(false),
            SchemaField::new("name", ArrowDataType::Utf8).with_relation(Some("a".into())),
            SchemaField::new("name", ArrowDataType::Utf8).with_relation(Some("c".into())),
        ])
        .with_primary_key(Some(Column::new_qualified("a", "accountid")))
    }

    #[test]
    fn test_resolution_is_case_insensitive() {
        let schema = account_schema();
        let (idx, _) = schema
            .resolve_column(&Column::new_qualified("A", "AccountId"))
            .unwrap();
        assert_eq!(idx, 0);
        assert!(schema.contains(&Column::new("ACCOUNTID")));
    }

    #[test]
    fn test_ambiguous_bare_name() {
        let schema = account_schema();
        let err = schema.resolve_column(&Column::new("name")).unwrap_err();
        assert!(matches!(err, QueryError::AmbiguousColumn(_)));
        assert!(schema
            .resolve_column(&Column::new_qualified("c", "name"))
            .is_ok());
    }

    #[test]
    fn test_qualified_lookup_per_relation() {
        let schema = account_schema();
        let (a_idx, _) = schema
            .resolve_column(&Column::new_qualified("a", "name"))
            .unwrap();
        let (c_idx, _) = schema
            .resolve_column(&Column::new_qualified("C", "NAME"))
            .unwrap();
        assert_eq!((a_idx, c_idx), (1, 2));
        assert!(schema
            .resolve_column(&Column::new_qualified("b", "name"))
            .is_err());
    }

    #[test]
    fn test_missing_column() {
        let schema = account_schema();
        let err = schema.resolve_column(&Column::new("revenue")).unwrap_err();
        assert!(matches!(err, QueryError::ColumnNotFound(_)));
    }

    #[test]
    fn test_primary_key_and_merge() {
        let schema = account_schema();
        assert!(schema.is_primary_key(&Column::new("accountid")));
        let merged = schema.merge(&PlanSchema::empty());
        assert!(merged.primary_key().is_none());
    }

    #[test]
    fn test_sort_order_prefix() {
        let schema = account_schema().with_sort_order(vec![
            SortKey::asc(Column::new_qualified("a", "accountid")),
            SortKey::asc(Column::new_qualified("a", "name")),
        ]);
        assert!(schema.is_sorted_by(&[SortKey::asc(Column::new("accountid"))]));
        assert!(!schema.is_sorted_by(&[SortKey::asc(Column::new_qualified("c", "name"))]));
    }

    #[test]
    fn test_hidden_fields_skip_wildcard() {
        let schema = PlanSchema::new(vec![
            SchemaField::new("x", ArrowDataType::Int32),
            SchemaField::new("Expr1", ArrowDataType::Int32).with_visible(false),
        ]);
        assert_eq!(schema.visible_fields(None).count(), 1);
        assert!(schema.contains(&Column::new("expr1")));
    }
}
