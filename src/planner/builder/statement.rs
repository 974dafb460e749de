//! Statement assembly
//!
//! Each top-level statement becomes one or more plan roots. Control flow is
//! flattened into labels and jumps: generated labels contain a `.` so they
//! can never clash with a label written in the script.

use super::expr::sql_type_to_arrow;
use super::scope::Scope;
use super::BuildContext;
use crate::error::{QueryError, Result};
use crate::metastore::invalid_object_name;
use crate::optimizer::Optimizer;
use crate::parser::{
    is_temp_table_name, Declaration, ObjectName, ObjectNameExt, ScriptNode, ScriptStatement,
    SqlExpr, Statement, TableFactor, TableWithJoins, ThrowArgs,
};
use crate::physical::{
    validate_spools, ComputeScalarNode, ConstantRowNode, FilterNode, OutputColumn, PlanOperator,
    PlanRoot, QueryPlan, RootNode, SourceSpan,
};
use crate::planner::{common_type, is_numeric, is_string, sql_type_name, Column, PlanSchema};
use crate::session::TempTable;
use arrow::datatypes::DataType as ArrowDataType;
use sqlparser::ast::{self, AssignmentTarget, FromTable, ObjectType};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Control-flow bookkeeping for one script
#[derive(Default)]
struct FlowState {
    /// Lowercase user label -> TRY/CATCH regions enclosing it
    labels: HashMap<String, Vec<usize>>,
    /// GOTO target, regions enclosing the GOTO, position
    gotos: Vec<(String, Vec<usize>, SourceSpan)>,
    /// (continue label, break label) of each enclosing WHILE
    loops: Vec<(String, String)>,
    regions: Vec<usize>,
    next_region: usize,
    catch_depth: usize,
}

impl FlowState {
    fn enter_region(&mut self) {
        self.next_region += 1;
        self.regions.push(self.next_region);
    }
}

/// Can `source` be stored in a `target` slot
fn check_assignable(target: &ArrowDataType, source: &ArrowDataType) -> Result<()> {
    if *source == ArrowDataType::Null || target == source {
        return Ok(());
    }
    common_type(target, source).map(|_| ()).map_err(|_| {
        QueryError::TypeMismatch(format!(
            "Operand type clash: {} is incompatible with {}",
            sql_type_name(source),
            sql_type_name(target)
        ))
    })
}

fn single_table(table: &TableWithJoins, statement: &str) -> Result<(ObjectName, Option<ast::TableAlias>)> {
    if !table.joins.is_empty() {
        return Err(QueryError::not_supported_with(
            format!("{} with joins", statement),
            "Use a subquery in the WHERE clause",
        ));
    }
    match &table.relation {
        TableFactor::Table {
            name,
            alias,
            args: None,
            ..
        } => Ok((name.clone(), alias.clone())),
        other => Err(QueryError::not_supported(format!("{} {}", statement, other))),
    }
}

fn constant_row() -> Arc<PlanOperator> {
    Arc::new(PlanOperator::ConstantRow(ConstantRowNode {
        columns: vec![],
        rows: vec![vec![]],
    }))
}

impl BuildContext<'_> {
    /// Build plan roots for a parsed script, collecting errors across statements
    pub(crate) fn assemble(
        &mut self,
        script: &[ScriptStatement],
    ) -> std::result::Result<Vec<PlanRoot>, Vec<QueryError>> {
        let mut flow = FlowState::default();
        let mut roots = vec![];
        let mut errors = vec![];
        for statement in script {
            self.assemble_statement(statement, &mut flow, &mut roots, &mut errors);
        }

        for (name, regions, span) in &flow.gotos {
            match flow.labels.get(&name.to_lowercase()) {
                None => errors.push(QueryError::Semantic(format!(
                    "A GOTO statement references the label '{}' but the label has not been declared.",
                    name
                ))),
                Some(target) if !regions.starts_with(target) || target.len() > regions.len() => {
                    debug!(label = %name, line = span.line, "jump into TRY/CATCH");
                    errors.push(QueryError::Structural(
                        "GOTO cannot be used to jump into a TRY or CATCH scope.".to_string(),
                    ))
                }
                Some(_) => {}
            }
        }

        if errors.is_empty() {
            debug!(roots = roots.len(), "script assembled");
            Ok(roots)
        } else {
            warn!(errors = errors.len(), "script failed to build");
            Err(errors)
        }
    }

    fn assemble_statement(
        &mut self,
        statement: &ScriptStatement,
        flow: &mut FlowState,
        roots: &mut Vec<PlanRoot>,
        errors: &mut Vec<QueryError>,
    ) {
        let span = statement.span;
        let mut emit = |roots: &mut Vec<PlanRoot>, result: Result<RootNode>| match result {
            Ok(node) => {
                debug!(statement = node.name(), line = span.line, "statement planned");
                roots.push(PlanRoot::new(node, span));
            }
            Err(e) => errors.extend(e.into_errors()),
        };

        match &statement.node {
            ScriptNode::Sql(sql) => {
                self.hints = statement.hints.clone();
                match self.build_sql(sql) {
                    Ok(nodes) => {
                        for node in nodes {
                            emit(roots, Ok(node));
                        }
                    }
                    Err(e) => emit(roots, Err(e)),
                }
                self.hints = Default::default();
            }
            ScriptNode::Declare(declarations) => {
                for declaration in declarations {
                    emit(roots, self.build_declare(declaration));
                }
            }
            ScriptNode::SetVariable { name, value } => {
                let result = self.variable(name).map(|v| v.data_type.clone()).and_then(|target| {
                    let value = self.scalar_plan(value, false)?;
                    check_assignable(&target, &self.plan_type(&value)?)?;
                    Ok(RootNode::AssignVariable {
                        name: name.clone(),
                        value,
                    })
                });
                emit(roots, result);
            }
            ScriptNode::Print(expr) => emit(roots, self.scalar_plan(expr, false).map(RootNode::Print)),
            ScriptNode::Return => emit(roots, Ok(RootNode::Return)),
            ScriptNode::Throw(None) => {
                let result = if flow.catch_depth == 0 {
                    Err(QueryError::Structural(
                        "The THROW statement without parameters must be inside a CATCH block."
                            .to_string(),
                    ))
                } else {
                    Ok(RootNode::Rethrow)
                };
                emit(roots, result);
            }
            ScriptNode::Throw(Some(args)) => emit(roots, self.build_throw(args)),
            ScriptNode::Block(statements) => {
                for s in statements {
                    self.assemble_statement(s, flow, roots, errors);
                }
            }
            ScriptNode::If {
                condition,
                then_branch,
                else_branch,
            } => {
                let id = self.next_label_id();
                let else_label = format!("if.{}.else", id);
                let end_label = format!("if.{}.end", id);
                let jump = self
                    .scalar_plan(condition, true)
                    .map(|condition| RootNode::ConditionalGoto {
                        condition,
                        label: else_label.clone(),
                        jump_if: false,
                    });
                emit(roots, jump);
                self.assemble_statement(then_branch, flow, roots, errors);
                if let Some(else_branch) = else_branch {
                    roots.push(PlanRoot::new(RootNode::Goto(end_label.clone()), span));
                    roots.push(PlanRoot::new(RootNode::Label(else_label), span));
                    self.assemble_statement(else_branch, flow, roots, errors);
                    roots.push(PlanRoot::new(RootNode::Label(end_label), span));
                } else {
                    roots.push(PlanRoot::new(RootNode::Label(else_label), span));
                }
            }
            ScriptNode::While { condition, body } => {
                let id = self.next_label_id();
                let start_label = format!("while.{}.start", id);
                let end_label = format!("while.{}.end", id);
                roots.push(PlanRoot::new(RootNode::Label(start_label.clone()), span));
                let jump = self
                    .scalar_plan(condition, true)
                    .map(|condition| RootNode::ConditionalGoto {
                        condition,
                        label: end_label.clone(),
                        jump_if: false,
                    });
                emit(roots, jump);
                flow.loops.push((start_label.clone(), end_label.clone()));
                self.assemble_statement(body, flow, roots, errors);
                flow.loops.pop();
                roots.push(PlanRoot::new(RootNode::Goto(start_label), span));
                roots.push(PlanRoot::new(RootNode::Label(end_label), span));
            }
            ScriptNode::Break | ScriptNode::Continue => {
                let is_break = matches!(statement.node, ScriptNode::Break);
                let result = match flow.loops.last() {
                    Some((start, end)) => Ok(RootNode::Goto(if is_break {
                        end.clone()
                    } else {
                        start.clone()
                    })),
                    None => Err(QueryError::Structural(format!(
                        "Cannot use a {} statement outside the scope of a WHILE statement.",
                        if is_break { "BREAK" } else { "CONTINUE" }
                    ))),
                };
                emit(roots, result);
            }
            ScriptNode::TryCatch {
                try_block,
                catch_block,
            } => {
                roots.push(PlanRoot::new(RootNode::BeginTry, span));
                flow.enter_region();
                for s in try_block {
                    self.assemble_statement(s, flow, roots, errors);
                }
                flow.regions.pop();
                roots.push(PlanRoot::new(RootNode::EndTry, span));

                roots.push(PlanRoot::new(RootNode::BeginCatch, span));
                flow.enter_region();
                flow.catch_depth += 1;
                for s in catch_block {
                    self.assemble_statement(s, flow, roots, errors);
                }
                flow.catch_depth -= 1;
                flow.regions.pop();
                roots.push(PlanRoot::new(RootNode::EndCatch, span));
            }
            ScriptNode::Label(name) => {
                let key = name.to_lowercase();
                if flow.labels.contains_key(&key) {
                    emit(
                        roots,
                        Err(QueryError::Duplicate {
                            kind: "label",
                            name: name.clone(),
                        }),
                    );
                } else {
                    flow.labels.insert(key, flow.regions.clone());
                    emit(roots, Ok(RootNode::Label(name.clone())));
                }
            }
            ScriptNode::Goto(name) => {
                flow.gotos.push((name.clone(), flow.regions.clone(), span));
                emit(roots, Ok(RootNode::Goto(name.clone())));
            }
        }
    }

    /// Run the optimizer over a finished plan and check its spool schedule
    fn finish_plan(&self, plan: QueryPlan) -> Result<QueryPlan> {
        let root = if self.hints.no_performance_spool {
            plan.root
        } else {
            Optimizer::new(self.options).optimize(plan.root)?
        };
        validate_spools(&root)?;
        Ok(QueryPlan::new(root, plan.columns))
    }

    fn plan_type(&self, plan: &QueryPlan) -> Result<ArrowDataType> {
        let column = plan
            .columns
            .first()
            .ok_or_else(|| QueryError::Internal("scalar plan without a column".into()))?;
        let schema = plan.schema();
        let (_, field) = schema.resolve_column(&column.source)?;
        Ok(field.data_type.clone())
    }

    /// One-row plan computing `expr`; subqueries are allowed
    fn scalar_plan(&mut self, expr: &SqlExpr, predicate: bool) -> Result<QueryPlan> {
        let mut scope = Scope::new(PlanSchema::empty(), None);
        let plan = self.plan_subqueries(&[expr], constant_row(), &mut scope)?;
        scope.schema = plan.schema();
        let bound = if predicate {
            self.bind_predicate(expr, &scope)?
        } else {
            self.bind_checked(expr, &scope)?
        };
        let (source, defined) = self.column_or_hoist(bound, &scope.schema)?;
        let root = match defined {
            Some(value) => Arc::new(PlanOperator::ComputeScalar(ComputeScalarNode {
                input: plan,
                values: vec![value],
            })),
            None => plan,
        };
        self.finish_plan(QueryPlan::new(
            root,
            vec![OutputColumn {
                name: String::new(),
                source,
            }],
        ))
    }

    fn build_declare(&mut self, declaration: &Declaration) -> Result<RootNode> {
        let data_type = sql_type_to_arrow(&declaration.data_type)?;
        // The initial value cannot read the variable being declared
        let initial = match &declaration.initial {
            Some(expr) => {
                let plan = self.scalar_plan(expr, false)?;
                check_assignable(&data_type, &self.plan_type(&plan)?)?;
                Some(plan)
            }
            None => None,
        };
        self.declare_variable(&declaration.name, data_type.clone())?;
        Ok(RootNode::DeclareVariable {
            name: declaration.name.clone(),
            data_type,
            initial,
        })
    }

    fn build_throw(&mut self, args: &ThrowArgs) -> Result<RootNode> {
        let scope = Scope::new(PlanSchema::empty(), None);
        let mut values = Vec::with_capacity(3);
        let mut outputs = Vec::with_capacity(3);
        for (name, expr, numeric) in [
            ("number", &args.number, true),
            ("message", &args.message, false),
            ("state", &args.state, true),
        ] {
            let bound = self.bind_checked(expr, &scope)?;
            let data_type = bound.data_type(&scope.schema)?;
            let valid = data_type == ArrowDataType::Null
                || if numeric {
                    is_numeric(&data_type)
                } else {
                    is_string(&data_type)
                };
            if !valid {
                return Err(QueryError::TypeMismatch(format!(
                    "The {} argument of THROW cannot be of type {}",
                    name,
                    sql_type_name(&data_type)
                )));
            }
            let (source, defined) = self.column_or_hoist(bound, &scope.schema)?;
            values.extend(defined);
            outputs.push(OutputColumn {
                name: name.to_string(),
                source,
            });
        }
        let root = Arc::new(PlanOperator::ComputeScalar(ComputeScalarNode {
            input: constant_row(),
            values,
        }));
        Ok(RootNode::Throw(QueryPlan::new(root, outputs)))
    }

    fn build_sql(&mut self, statement: &Statement) -> Result<Vec<RootNode>> {
        match statement {
            Statement::Query(query) => {
                let bound = self.bind_query(query, None)?;
                Ok(vec![RootNode::Select(self.finish_plan(bound.plan)?)])
            }
            Statement::Insert(insert) => Ok(vec![self.build_insert(insert)?]),
            Statement::Update {
                table,
                assignments,
                from,
                selection,
                returning,
                ..
            } => {
                if from.is_some() {
                    return Err(QueryError::not_supported_with(
                        "UPDATE ... FROM",
                        "Use a subquery in the WHERE clause",
                    ));
                }
                if returning.is_some() {
                    return Err(QueryError::not_supported("UPDATE ... RETURNING"));
                }
                Ok(vec![self.build_update(table, assignments, selection.as_ref())?])
            }
            Statement::Delete(delete) => Ok(vec![self.build_delete(delete)?]),
            Statement::CreateTable(create) => Ok(vec![self.build_create_table(create)?]),
            Statement::Drop {
                object_type: ObjectType::Table,
                if_exists,
                names,
                ..
            } => self.build_drop_tables(names, *if_exists),
            other => {
                let text = other.to_string();
                let fragment = text.split_whitespace().take(2).collect::<Vec<_>>().join(" ");
                Err(QueryError::not_supported(fragment))
            }
        }
    }

    fn build_insert(&mut self, insert: &ast::Insert) -> Result<RootNode> {
        let name = insert.table_name.base_name();
        let (entity, targets): (String, Vec<(String, ArrowDataType)>) = if is_temp_table_name(&name) {
            let table = self
                .session
                .temp_table(&name)
                .ok_or_else(|| invalid_object_name(&name, self.session.temp_table_names()))?;
            let columns = table
                .columns
                .iter()
                .map(|c| (c.name.clone(), c.data_type.clone()))
                .collect();
            (table.name.clone(), columns)
        } else {
            let entity = self.catalog.lookup(&name)?;
            let columns = entity
                .attributes
                .iter()
                .map(|a| (a.logical_name.clone(), a.data_type()))
                .collect();
            (entity.logical_name.clone(), columns)
        };

        let mut columns = vec![];
        let mut types = vec![];
        if insert.columns.is_empty() {
            if !is_temp_table_name(&name) {
                return Err(QueryError::not_supported_with(
                    format!("INSERT INTO {} without a column list", name),
                    "List the columns to insert",
                ));
            }
            for (column, data_type) in targets {
                columns.push(column);
                types.push(data_type);
            }
        } else {
            let mut seen = HashSet::new();
            for ident in &insert.columns {
                let Some((column, data_type)) = targets
                    .iter()
                    .find(|(c, _)| c.eq_ignore_ascii_case(&ident.value))
                else {
                    return Err(QueryError::ColumnNotFound(ident.value.clone()));
                };
                if !seen.insert(column.to_lowercase()) {
                    return Err(QueryError::Semantic(format!(
                        "The column name '{}' is specified more than once in the SET clause or column list of an INSERT.",
                        column
                    )));
                }
                columns.push(column.clone());
                types.push(data_type.clone());
            }
        }

        let Some(source) = &insert.source else {
            return Err(QueryError::not_supported("INSERT ... DEFAULT VALUES"));
        };
        let bound = self.bind_query(source, None)?;
        let values = bound.plan.columns.len();
        if values != columns.len() {
            let relation = if columns.len() > values { "more" } else { "fewer" };
            return Err(QueryError::Semantic(format!(
                "There are {} columns in the INSERT statement than values specified in the VALUES clause. The number of values in the VALUES clause must match the number of columns specified in the INSERT statement.",
                relation
            )));
        }
        let schema = bound.plan.schema();
        for (output, target) in bound.plan.columns.iter().zip(&types) {
            let (_, field) = schema.resolve_column(&output.source)?;
            check_assignable(target, &field.data_type)?;
        }

        Ok(RootNode::Insert {
            entity,
            columns,
            source: self.finish_plan(bound.plan)?,
        })
    }

    /// Scan of the target entity, filtered by the WHERE clause
    fn dml_source(
        &mut self,
        table: &TableWithJoins,
        selection: Option<&SqlExpr>,
        statement: &str,
    ) -> Result<(Arc<PlanOperator>, Scope<'static>, String, Column)> {
        let (name, alias) = single_table(table, statement)?;
        if is_temp_table_name(&name.base_name()) {
            return Err(QueryError::not_supported(format!(
                "{} of temporary table {}",
                statement, name
            )));
        }
        let source = self.bind_named_table(&name, alias.as_ref())?;
        let PlanOperator::Scan(scan) = source.plan.as_ref() else {
            return Err(QueryError::not_supported(format!("{} {}", statement, name)));
        };
        let entity = scan.entity.clone();
        let primary_key = scan
            .primary_key
            .clone()
            .ok_or_else(|| QueryError::Internal(format!("{} has no primary key", entity)))?;
        let key = Column::new_qualified(scan.alias.clone(), primary_key);

        let mut scope = Scope::new(source.plan.schema(), None).with_tables(source.tables);
        let mut plan = source.plan;
        if let Some(selection) = selection {
            plan = self.plan_subqueries(&[selection], plan, &mut scope)?;
            let predicate = self.bind_predicate(selection, &scope)?;
            plan = Arc::new(PlanOperator::Filter(FilterNode {
                input: plan,
                predicate,
            }));
            scope.schema = plan.schema();
        }
        Ok((plan, scope, entity, key))
    }

    fn build_update(
        &mut self,
        table: &TableWithJoins,
        assignments: &[ast::Assignment],
        selection: Option<&SqlExpr>,
    ) -> Result<RootNode> {
        let (plan, mut scope, entity, key) = self.dml_source(table, selection, "UPDATE")?;
        let metadata = self.catalog.lookup(&entity)?;

        let mut targets = vec![];
        let mut seen = HashSet::new();
        for assignment in assignments {
            let AssignmentTarget::ColumnName(target) = &assignment.target else {
                return Err(QueryError::not_supported(format!(
                    "UPDATE SET {}",
                    assignment.target
                )));
            };
            let column = target.base_name();
            let attribute = metadata
                .attribute(&column)
                .ok_or_else(|| QueryError::ColumnNotFound(column.clone()))?;
            if attribute.logical_name.eq_ignore_ascii_case(&metadata.primary_key) {
                return Err(QueryError::Semantic(format!(
                    "Cannot update primary key column '{}'",
                    attribute.logical_name
                )));
            }
            if !seen.insert(attribute.logical_name.to_lowercase()) {
                return Err(QueryError::Semantic(format!(
                    "The column name '{}' is specified more than once in the SET clause or column list of an UPDATE.",
                    attribute.logical_name
                )));
            }
            targets.push((attribute.logical_name.clone(), attribute.data_type()));
        }

        let exprs: Vec<&SqlExpr> = assignments.iter().map(|a| &a.value).collect();
        let plan = self.plan_subqueries(&exprs, plan, &mut scope)?;
        scope.schema = plan.schema();

        let mut values = vec![];
        let mut outputs = vec![OutputColumn {
            name: metadata.primary_key.clone(),
            source: key,
        }];
        for (assignment, (column, data_type)) in assignments.iter().zip(&targets) {
            let bound = self.bind_checked(&assignment.value, &scope)?;
            check_assignable(data_type, &bound.data_type(&scope.schema)?)?;
            let (source, defined) = self.column_or_hoist(bound, &scope.schema)?;
            values.extend(defined);
            outputs.push(OutputColumn {
                name: column.clone(),
                source,
            });
        }
        let root = if values.is_empty() {
            plan
        } else {
            Arc::new(PlanOperator::ComputeScalar(ComputeScalarNode {
                input: plan,
                values,
            }))
        };

        Ok(RootNode::Update {
            entity,
            primary_key: metadata.primary_key.clone(),
            columns: targets.into_iter().map(|(c, _)| c).collect(),
            source: self.finish_plan(QueryPlan::new(root, outputs))?,
        })
    }

    fn build_delete(&mut self, delete: &ast::Delete) -> Result<RootNode> {
        if !delete.tables.is_empty() || delete.using.is_some() {
            return Err(QueryError::not_supported_with(
                "DELETE with multiple tables",
                "Use a subquery in the WHERE clause",
            ));
        }
        let from = match &delete.from {
            FromTable::WithFromKeyword(from) | FromTable::WithoutKeyword(from) => from,
        };
        let [table] = from.as_slice() else {
            return Err(QueryError::not_supported_with(
                "DELETE from multiple tables",
                "Use a subquery in the WHERE clause",
            ));
        };
        let (plan, _, entity, key) = self.dml_source(table, delete.selection.as_ref(), "DELETE")?;
        let primary_key = key.name.clone();
        let outputs = vec![OutputColumn {
            name: primary_key.clone(),
            source: key,
        }];
        Ok(RootNode::Delete {
            entity,
            primary_key,
            source: self.finish_plan(QueryPlan::new(plan, outputs))?,
        })
    }

    fn build_create_table(&mut self, create: &ast::CreateTable) -> Result<RootNode> {
        let name = create.name.base_name();
        if !is_temp_table_name(&name) || create.name.0.len() > 1 {
            return Err(QueryError::not_supported_with(
                format!("CREATE TABLE {}", create.name),
                "Only temporary tables (#name) can be created",
            ));
        }
        if create.query.is_some() {
            return Err(QueryError::not_supported_with(
                "CREATE TABLE ... AS SELECT",
                "Create the table, then INSERT INTO ... SELECT",
            ));
        }
        if self.session.temp_table(&name).is_some() {
            return Err(QueryError::Semantic(format!(
                "There is already an object named '{}' in the database.",
                name
            )));
        }
        let columns = self.temp_table_columns(&create.columns)?;
        self.session = self.session.with_temp_table(TempTable {
            name: name.clone(),
            columns: columns.clone(),
        });
        Ok(RootNode::CreateTempTable { name, columns })
    }

    fn build_drop_tables(&mut self, names: &[ObjectName], if_exists: bool) -> Result<Vec<RootNode>> {
        let mut nodes = vec![];
        for object in names {
            let name = object.base_name();
            if !is_temp_table_name(&name) {
                return Err(QueryError::not_supported_with(
                    format!("DROP TABLE {}", object),
                    "Only temporary tables (#name) can be dropped",
                ));
            }
            let Some(table) = self.session.temp_table(&name) else {
                if if_exists {
                    continue;
                }
                return Err(invalid_object_name(&name, self.session.temp_table_names()));
            };
            let name = table.name.clone();
            self.session = self.session.without_temp_table(&name);
            nodes.push(RootNode::DropTempTable { name });
        }
        Ok(nodes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assignable_types() {
        assert!(check_assignable(&ArrowDataType::Int64, &ArrowDataType::Int32).is_ok());
        assert!(check_assignable(&ArrowDataType::Utf8, &ArrowDataType::Null).is_ok());
        let err = check_assignable(&ArrowDataType::Boolean, &ArrowDataType::Date32).unwrap_err();
        assert!(err.to_string().contains("Operand type clash"));
    }

    #[test]
    fn test_nested_regions_allow_outward_jumps() {
        let mut flow = FlowState::default();
        flow.enter_region();
        let outer = flow.regions.clone();
        flow.enter_region();
        assert!(flow.regions.starts_with(&outer));
        flow.regions.pop();
        flow.regions.pop();
        assert!(!flow.regions.starts_with(&outer));
    }
}
