//! FROM clause lowering

use super::expr::sql_type_to_arrow;
use super::scope::Scope;
use super::BuildContext;
use crate::error::{QueryError, Result};
use crate::metastore::invalid_object_name;
use crate::parser::{
    alias_column_names, is_temp_table_name, FunctionArg, FunctionArgExpr, ObjectName,
    ObjectNameExt, TableAlias, TableFactor, TableWithJoins,
};
use crate::physical::{
    AliasColumn, AliasNode, ConstantRowNode, PlanOperator, QueryPlan, ScanColumn, ScanNode,
    ScanSource, TableFunctionKind, TableFunctionNode,
};
use crate::planner::{common_type, is_numeric, is_string, sql_type_name, PlanSchema};
use arrow::datatypes::DataType as ArrowDataType;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::trace;

/// A lowered FROM item
pub(crate) struct BoundSource {
    pub plan: Arc<PlanOperator>,
    /// Source aliases in FROM order
    pub tables: Vec<String>,
}

impl BoundSource {
    pub fn new(plan: Arc<PlanOperator>, alias: impl Into<String>) -> Self {
        Self {
            plan,
            tables: vec![alias.into()],
        }
    }
}

impl BuildContext<'_> {
    /// Lower the FROM clause; an empty clause produces a single empty row
    pub(crate) fn bind_from(&mut self, from: &[TableWithJoins], scope: &Scope) -> Result<BoundSource> {
        let mut result: Option<BoundSource> = None;
        for item in from {
            let source = self.bind_table_with_joins(item, scope)?;
            result = Some(match result {
                None => source,
                Some(left) => self.cross_join(left, source),
            });
        }
        Ok(result.unwrap_or_else(|| BoundSource {
            plan: Arc::new(PlanOperator::ConstantRow(ConstantRowNode {
                columns: vec![],
                rows: vec![vec![]],
            })),
            tables: vec![],
        }))
    }

    fn bind_table_with_joins(&mut self, item: &TableWithJoins, scope: &Scope) -> Result<BoundSource> {
        let mut left = self.bind_table_factor(&item.relation, scope)?;
        for join in &item.joins {
            left = self.bind_join(left, join, scope)?;
        }
        Ok(left)
    }

    pub(crate) fn bind_table_factor(&mut self, factor: &TableFactor, scope: &Scope) -> Result<BoundSource> {
        match factor {
            TableFactor::Table {
                name, alias, args, ..
            } => match args {
                Some(args) => self.bind_table_function(name, &args.args, alias.as_ref(), scope),
                None => self.bind_named_table(name, alias.as_ref()),
            },
            TableFactor::Derived {
                subquery, alias, ..
            } => {
                let Some(alias) = alias else {
                    return Err(QueryError::Semantic(
                        "A derived table must have an alias".to_string(),
                    ));
                };
                let bound = self.bind_query(subquery, Some(scope))?;
                scope.absorb(bound.captured);
                self.alias_plan(bound.plan, &alias.name.value, &alias_column_names(alias))
            }
            TableFactor::NestedJoin {
                table_with_joins,
                alias,
            } => {
                if alias.is_some() {
                    return Err(QueryError::not_supported("alias on a parenthesized join"));
                }
                self.bind_table_with_joins(table_with_joins, scope)
            }
            other => Err(QueryError::not_supported(other.to_string())),
        }
    }

    /// Resolve a table name: recursive CTE reference, CTE, temp table, then entity
    pub(crate) fn bind_named_table(&mut self, name: &ObjectName, alias: Option<&TableAlias>) -> Result<BoundSource> {
        let base = name.base_name();
        let alias_name = alias
            .map(|a| a.name.value.clone())
            .unwrap_or_else(|| base.clone());
        let alias_columns = alias.map(alias_column_names).unwrap_or_default();

        if name.0.len() == 1 {
            if let Some(reference) = self.recursive_reference(&base) {
                let plan = self.bind_recursive_reference(&reference);
                return self.alias_plan(plan, &alias_name, &alias_columns);
            }
            if let Some(cte) = self.find_cte(&base) {
                let plan = self.bind_cte(&cte)?;
                let names = if alias_columns.is_empty() {
                    cte.columns.clone()
                } else {
                    alias_columns
                };
                return self.alias_plan(plan, &alias_name, &names);
            }
        }

        if !alias_columns.is_empty() {
            return Err(QueryError::not_supported_with(
                format!("column aliases on table {}", name),
                "Alias the columns in the select list instead",
            ));
        }

        if is_temp_table_name(&base) {
            let table = self
                .session
                .temp_table(&base)
                .ok_or_else(|| invalid_object_name(&base, self.session.temp_table_names()))?;
            let scan = ScanNode {
                entity: table.name.clone(),
                alias: alias_name.clone(),
                source: ScanSource::TempTable,
                columns: table.columns.clone(),
                primary_key: None,
                estimated_rows: None,
            };
            return Ok(BoundSource::new(Arc::new(PlanOperator::Scan(scan)), alias_name));
        }

        let source = match name.schema_name().map(|s| s.to_lowercase()).as_deref() {
            None | Some("dbo") => ScanSource::Entity,
            Some("bin") => ScanSource::RecycleBin,
            Some("archive") => ScanSource::Archive,
            Some(_) => return Err(invalid_object_name(&name.table_name(), vec![])),
        };

        let entity = self.catalog.lookup(&base)?;
        match source {
            ScanSource::RecycleBin if !entity.recycle_bin_enabled => {
                return Err(QueryError::not_supported_with(
                    name.table_name(),
                    format!("Recycle bin is not enabled for {}", entity.logical_name),
                ))
            }
            ScanSource::Archive if !entity.archival_enabled => {
                return Err(QueryError::not_supported_with(
                    name.table_name(),
                    format!("Long term retention is not enabled for {}", entity.logical_name),
                ))
            }
            _ => {}
        }

        trace!(entity = %entity.logical_name, alias = %alias_name, ?source, "scan");
        let columns = entity
            .attributes
            .iter()
            .map(|attr| ScanColumn {
                name: attr.logical_name.clone(),
                data_type: attr.data_type(),
                nullable: attr.nullable,
                collation: attr.collation.clone(),
            })
            .collect();
        let scan = ScanNode {
            entity: entity.logical_name.clone(),
            alias: alias_name.clone(),
            source,
            columns,
            primary_key: Some(entity.primary_key.clone()),
            estimated_rows: entity.estimated_row_count,
        };
        Ok(BoundSource::new(Arc::new(PlanOperator::Scan(scan)), alias_name))
    }

    /// Expose a query's output columns under `alias`, optionally renamed
    pub(crate) fn alias_plan(&self, plan: QueryPlan, alias: &str, names: &[String]) -> Result<BoundSource> {
        if !names.is_empty() && names.len() != plan.columns.len() {
            let relation = if names.len() > plan.columns.len() {
                "fewer"
            } else {
                "more"
            };
            return Err(QueryError::Semantic(format!(
                "'{}' has {} columns than were specified in the column list",
                alias, relation
            )));
        }

        let mut seen = HashSet::new();
        let mut columns = Vec::with_capacity(plan.columns.len());
        for (i, output) in plan.columns.iter().enumerate() {
            let name = names.get(i).unwrap_or(&output.name).clone();
            if name.is_empty() {
                return Err(QueryError::Semantic(format!(
                    "No column name was specified for column {} of '{}'",
                    i + 1,
                    alias
                )));
            }
            if !seen.insert(name.to_lowercase()) {
                return Err(QueryError::Semantic(format!(
                    "The column '{}' was specified multiple times for '{}'",
                    name, alias
                )));
            }
            columns.push(AliasColumn {
                source: output.source.clone(),
                name,
                visible: true,
            });
        }

        let node = AliasNode {
            input: plan.root,
            alias: alias.to_string(),
            columns,
        };
        Ok(BoundSource::new(Arc::new(PlanOperator::Alias(node)), alias))
    }

    fn bind_table_function(
        &mut self,
        name: &ObjectName,
        args: &[FunctionArg],
        alias: Option<&TableAlias>,
        scope: &Scope,
    ) -> Result<BoundSource> {
        let function_name = name.base_name().to_ascii_uppercase();
        let function = match function_name.as_str() {
            "STRING_SPLIT" => TableFunctionKind::StringSplit,
            "GENERATE_SERIES" => TableFunctionKind::GenerateSeries,
            _ => {
                return Err(QueryError::not_supported(format!(
                    "table-valued function {}",
                    name
                )))
            }
        };

        // Arguments may read columns of sources to the left of an APPLY
        let arg_scope = Scope::new(PlanSchema::empty(), Some(scope));
        let mut bound = Vec::with_capacity(args.len());
        for arg in args {
            let FunctionArg::Unnamed(FunctionArgExpr::Expr(expr)) = arg else {
                return Err(QueryError::not_supported(format!(
                    "argument {} of {}",
                    arg, function_name
                )));
            };
            bound.push(self.bind_checked(expr, &arg_scope)?);
        }
        scope.absorb(arg_scope.captured());

        let types = bound
            .iter()
            .map(|e| e.data_type(&arg_scope.schema))
            .collect::<Result<Vec<_>>>()?;

        let value_type = match function {
            TableFunctionKind::StringSplit => {
                if bound.len() != 2 {
                    return Err(QueryError::Semantic(
                        "The STRING_SPLIT function requires 2 argument(s)".to_string(),
                    ));
                }
                for t in &types {
                    if !is_string(t) && *t != ArrowDataType::Null {
                        return Err(QueryError::TypeMismatch(format!(
                            "Argument data type {} is invalid for argument of STRING_SPLIT function",
                            sql_type_name(t)
                        )));
                    }
                }
                ArrowDataType::Utf8
            }
            TableFunctionKind::GenerateSeries => {
                if !(2..=3).contains(&bound.len()) {
                    return Err(QueryError::Semantic(
                        "The GENERATE_SERIES function requires 2 to 3 argument(s)".to_string(),
                    ));
                }
                let mut result = ArrowDataType::Null;
                for t in &types {
                    if !is_numeric(t) && *t != ArrowDataType::Null {
                        return Err(QueryError::TypeMismatch(format!(
                            "Argument data type {} is invalid for argument of GENERATE_SERIES function",
                            sql_type_name(t)
                        )));
                    }
                    result = common_type(&result, t)?;
                }
                result
            }
        };

        let alias_name = alias
            .map(|a| a.name.value.clone())
            .unwrap_or_else(|| function_name.to_lowercase());
        let node = TableFunctionNode {
            function,
            args: bound,
            alias: alias_name.clone(),
            columns: vec![ScanColumn {
                name: "value".to_string(),
                data_type: value_type,
                nullable: function == TableFunctionKind::StringSplit,
                collation: None,
            }],
        };
        Ok(BoundSource::new(
            Arc::new(PlanOperator::TableFunction(node)),
            alias_name,
        ))
    }

    /// Column definitions of `CREATE TABLE #t`
    pub(crate) fn temp_table_columns(&self, columns: &[sqlparser::ast::ColumnDef]) -> Result<Vec<ScanColumn>> {
        let mut seen = HashSet::new();
        columns
            .iter()
            .map(|def| {
                if !seen.insert(def.name.value.to_lowercase()) {
                    return Err(QueryError::Duplicate {
                        kind: "column",
                        name: def.name.value.clone(),
                    });
                }
                let not_null = def
                    .options
                    .iter()
                    .any(|o| matches!(o.option, sqlparser::ast::ColumnOption::NotNull));
                Ok(ScanColumn {
                    name: def.name.value.clone(),
                    data_type: sql_type_to_arrow(&def.data_type)?,
                    nullable: !not_null,
                    collation: def
                        .collation
                        .as_ref()
                        .map(|c| crate::planner::Collation::new(c.to_string())),
                })
            })
            .collect()
    }
}
