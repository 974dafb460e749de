//! Shared fixtures for plan builder integration tests
#![allow(dead_code)]

use std::collections::HashMap;
use tracing_subscriber::EnvFilter;
use tsql_planner::metastore::{
    AttributeMetadata, AttributeType, RelationshipKind, RelationshipMetadata,
};
use tsql_planner::{
    BuildOptions, EntityMetadata, InMemoryMetadataCatalog, PlanBuilder, PlanOperator, PlanRoot,
    QueryError, QueryPlan, RootNode, SessionSnapshot,
};

/// Route builder logs to the test writer, honouring RUST_LOG
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Two related entities shared by every test
pub fn catalog() -> InMemoryMetadataCatalog {
    let account = EntityMetadata::new("account", "accountid")
        .with_attribute(AttributeMetadata::new("name", AttributeType::String))
        .with_attribute(AttributeMetadata::new("revenue", AttributeType::Money))
        .with_attribute(AttributeMetadata::new("employees", AttributeType::Integer))
        .with_attribute(AttributeMetadata::new("primarycontactid", AttributeType::Lookup))
        .with_attribute(AttributeMetadata::new("parentaccountid", AttributeType::Lookup))
        .with_relationship(RelationshipMetadata {
            name: "account_primary_contact".to_string(),
            kind: RelationshipKind::ManyToOne,
            attribute: "primarycontactid".to_string(),
            related_entity: "contact".to_string(),
            related_attribute: "contactid".to_string(),
            hierarchical: false,
        })
        .with_recycle_bin(true)
        .with_estimated_rows(5_000);

    let contact = EntityMetadata::new("contact", "contactid")
        .with_attribute(AttributeMetadata::new("fullname", AttributeType::String))
        .with_attribute(AttributeMetadata::new("department", AttributeType::String))
        .with_attribute(AttributeMetadata::new("annualincome", AttributeType::Money))
        .with_attribute(AttributeMetadata::new("numberofchildren", AttributeType::Integer))
        .with_attribute(AttributeMetadata::new("parentcustomerid", AttributeType::Customer))
        .with_estimated_rows(20_000);

    InMemoryMetadataCatalog::new()
        .with_entity(account)
        .with_entity(contact)
}

pub fn try_build_with(
    sql: &str,
    options: BuildOptions,
) -> Result<Vec<PlanRoot>, Vec<QueryError>> {
    init_tracing();
    let catalog = catalog();
    let session = SessionSnapshot::new();
    PlanBuilder::new(&catalog, &session)
        .with_options(options)
        .build(sql, &HashMap::new())
}

pub fn build(sql: &str) -> Vec<PlanRoot> {
    match try_build_with(sql, BuildOptions::default()) {
        Ok(roots) => roots,
        Err(errors) => panic!("failed to build {:?}: {:?}", sql, errors),
    }
}

pub fn build_errors(sql: &str) -> Vec<QueryError> {
    match try_build_with(sql, BuildOptions::default()) {
        Ok(roots) => panic!("expected {:?} to fail, got {} roots", sql, roots.len()),
        Err(errors) => errors,
    }
}

/// Plan of a batch holding a single SELECT
pub fn select_plan(sql: &str) -> QueryPlan {
    let mut roots = build(sql);
    assert_eq!(roots.len(), 1, "expected one statement");
    match roots.remove(0).node {
        RootNode::Select(plan) => plan,
        other => panic!("expected SELECT, got {}", other.name()),
    }
}

pub fn root_names(roots: &[PlanRoot]) -> Vec<&'static str> {
    roots.iter().map(|r| r.node.name()).collect()
}

/// Every operator of the tree, parents first
pub fn operators(plan: &PlanOperator) -> Vec<&PlanOperator> {
    let mut out = vec![plan];
    for child in plan.children() {
        out.extend(operators(child));
    }
    out
}

pub fn count(plan: &PlanOperator, pred: impl Fn(&PlanOperator) -> bool) -> usize {
    operators(plan).into_iter().filter(|op| pred(op)).count()
}

pub fn first_of<'a>(
    plan: &'a PlanOperator,
    pred: impl Fn(&PlanOperator) -> bool,
) -> Option<&'a PlanOperator> {
    operators(plan).into_iter().find(|op| pred(op))
}
