//! Join strategy selection

mod support;

use support::{build_errors, count, first_of, select_plan};
use tsql_planner::physical::{JoinStrategy, JoinType, ScanSource, SpoolKind};
use arrow::datatypes::DataType;
use tsql_planner::{ErrorCategory, PlanOperator};

fn join_node(plan: &PlanOperator) -> &tsql_planner::physical::JoinNode {
    match first_of(plan, |op| matches!(op, PlanOperator::Join(_))) {
        Some(PlanOperator::Join(node)) => node,
        _ => panic!("no join in\n{}", plan),
    }
}

#[test]
fn test_primary_key_equality_merges_sorted_inputs() {
    let plan = select_plan(
        "SELECT a.name, c.fullname FROM account a \
         INNER JOIN contact c ON a.primarycontactid = c.contactid",
    );
    let join = join_node(&plan.root);
    assert!(matches!(join.strategy, JoinStrategy::Merge { .. }));
    assert_eq!(join.join_type, JoinType::Inner);
    assert!(matches!(join.left.as_ref(), PlanOperator::Sort(_)));
    assert!(matches!(join.right.as_ref(), PlanOperator::Sort(_)));

    assert_eq!(plan.column_names(), vec!["name", "fullname"]);
    let schema = plan.output_schema();
    assert_eq!(schema.field(0).data_type(), &DataType::Utf8);
    assert!(schema.field(1).is_nullable());
}

#[test]
fn test_non_key_equality_hashes() {
    let plan = select_plan(
        "SELECT a.name FROM account a \
         JOIN contact c ON a.employees = c.numberofchildren AND c.fullname <> a.name",
    );
    let join = join_node(&plan.root);
    assert!(matches!(join.strategy, JoinStrategy::Hash { .. }));
    // residue of an inner join is applied above it
    assert!(matches!(plan.root.as_ref(), PlanOperator::Filter(_)));
    assert_eq!(count(&plan.root, |op| matches!(op, PlanOperator::Sort(_))), 0);
}

#[test]
fn test_join_without_equality_loops_over_eager_spool() {
    let plan = select_plan(
        "SELECT a.name FROM account a JOIN contact c ON a.employees > c.numberofchildren",
    );
    let join = join_node(&plan.root);
    match &join.strategy {
        JoinStrategy::NestedLoop { outer_references } => assert!(outer_references.is_empty()),
        other => panic!("expected nested loop, got {:?}", other),
    }
    assert!(join.condition.is_some());
    match join.right.as_ref() {
        PlanOperator::Spool(spool) => assert_eq!(spool.kind, SpoolKind::Eager),
        other => panic!("expected spool, got {}", other.name()),
    }
}

#[test]
fn test_right_join_swaps_into_left_outer() {
    let plan = select_plan(
        "SELECT c.fullname, a.name FROM account a \
         RIGHT OUTER JOIN contact c ON a.primarycontactid = c.contactid",
    );
    let join = join_node(&plan.root);
    assert_eq!(join.join_type, JoinType::LeftOuter);
    let outer_scan = first_of(&join.left, |op| matches!(op, PlanOperator::Scan(_)));
    match outer_scan {
        Some(PlanOperator::Scan(scan)) => assert_eq!(scan.entity, "contact"),
        _ => panic!("no scan on the outer side"),
    }
}

#[test]
fn test_full_outer_join_needs_an_equality() {
    let errors = build_errors(
        "SELECT a.name FROM account a FULL OUTER JOIN contact c ON a.employees > c.numberofchildren",
    );
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].category(), ErrorCategory::Unsupported);
}

#[test]
fn test_recycle_bin_schema_scans_deleted_records() {
    let plan = select_plan("SELECT name FROM bin.account");
    match first_of(&plan.root, |op| matches!(op, PlanOperator::Scan(_))) {
        Some(PlanOperator::Scan(scan)) => assert_eq!(scan.source, ScanSource::RecycleBin),
        _ => panic!("no scan"),
    }

    let errors = build_errors("SELECT fullname FROM bin.contact");
    assert_eq!(errors[0].category(), ErrorCategory::Unsupported);
}

#[test]
fn test_unknown_entity_suggests_close_names() {
    let errors = build_errors("SELECT * FROM acount");
    match &errors[0] {
        tsql_planner::QueryError::InvalidObjectName { name, suggestions } => {
            assert_eq!(name, "acount");
            assert!(suggestions.iter().any(|s| s == "account"));
        }
        other => panic!("unexpected error {:?}", other),
    }
}
