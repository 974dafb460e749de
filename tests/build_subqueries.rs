//! Subquery decorrelation into semi-joins

mod support;

use support::{build_errors, count, first_of, select_plan, try_build_with};
use tsql_planner::physical::{JoinNode, JoinOutput, JoinStrategy, JoinType, SpoolKind};
use tsql_planner::planner::{AggregateType, Expr};
use tsql_planner::{BuildOptions, ErrorCategory, PlanOperator, RootNode};

fn semi_joins(plan: &PlanOperator) -> Vec<&JoinNode> {
    support::operators(plan)
        .into_iter()
        .filter_map(|op| match op {
            PlanOperator::Join(node) if node.output == JoinOutput::Left => Some(node),
            _ => None,
        })
        .collect()
}

/// Predicate of the filter at the root of `plan`
fn root_predicate(plan: &PlanOperator) -> &Expr {
    match plan {
        PlanOperator::Filter(node) => &node.predicate,
        other => panic!("expected a filter at the root of\n{}", other),
    }
}

fn lazy_spools(plan: &PlanOperator) -> usize {
    count(plan, |op| {
        matches!(op, PlanOperator::Spool(s) if s.kind == SpoolKind::Lazy)
    })
}

#[test]
fn test_uncorrelated_in_hashes_against_distinct_values() {
    let plan = select_plan(
        "SELECT name FROM account WHERE accountid IN (SELECT parentcustomerid FROM contact)",
    );
    let joins = semi_joins(&plan.root);
    assert_eq!(joins.len(), 1);
    let join = joins[0];
    assert_eq!(join.join_type, JoinType::LeftOuter);
    assert!(matches!(join.strategy, JoinStrategy::Hash { .. }));
    assert!(matches!(join.right.as_ref(), PlanOperator::Distinct(_)));
    assert_eq!(join.defined_values.len(), 1);
    let flag = Expr::column(join.defined_values[0].name.clone());
    assert_eq!(root_predicate(&plan.root), &flag.is_not_null());
}

#[test]
fn test_in_against_primary_key_merges() {
    let plan = select_plan(
        "SELECT name FROM account WHERE primarycontactid IN (SELECT contactid FROM contact)",
    );
    let join = semi_joins(&plan.root)[0];
    assert!(matches!(join.strategy, JoinStrategy::Merge { .. }));
    assert!(matches!(join.left.as_ref(), PlanOperator::Sort(_)));
}

#[test]
fn test_not_in_over_nullable_values_probes_for_nulls() {
    let plan = select_plan(
        "SELECT name FROM account WHERE accountid NOT IN (SELECT parentcustomerid FROM contact)",
    );
    assert_eq!(semi_joins(&plan.root).len(), 2);
    let probe = first_of(&plan.root, |op| matches!(op, PlanOperator::Aggregate(_)));
    match probe {
        Some(PlanOperator::Aggregate(node)) => {
            assert!(node.group_by.is_empty());
            let funcs: Vec<_> = node.aggregates.iter().map(|a| a.func).collect();
            assert_eq!(funcs, vec![AggregateType::CountStar, AggregateType::Count]);
        }
        _ => panic!("no null probe in\n{}", plan.root),
    }
}

#[test]
fn test_not_in_over_keys_tests_flag_is_null() {
    let plan = select_plan(
        "SELECT name FROM account WHERE accountid NOT IN (SELECT contactid FROM contact)",
    );
    let joins = semi_joins(&plan.root);
    assert_eq!(joins.len(), 1);
    assert!(first_of(&plan.root, |op| matches!(op, PlanOperator::Aggregate(_))).is_none());
    let flag = Expr::column(joins[0].defined_values[0].name.clone());
    assert_eq!(root_predicate(&plan.root), &flag.is_null());
}

#[test]
fn test_correlated_exists_binds_outer_references() {
    let sql = "SELECT a.name FROM account a \
               WHERE EXISTS (SELECT * FROM contact c WHERE c.parentcustomerid = a.accountid)";
    let plan = select_plan(sql);
    let join = semi_joins(&plan.root)[0];
    match &join.strategy {
        JoinStrategy::NestedLoop { outer_references } => {
            assert_eq!(outer_references.len(), 1);
            assert_eq!(outer_references[0].column.name, "accountid");
        }
        other => panic!("expected nested loop, got {:?}", other),
    }
    assert!(matches!(join.right.as_ref(), PlanOperator::Top(_)));
    // the uncorrelated scan below the correlated filter is cached
    assert_eq!(lazy_spools(&plan.root), 1);

    let roots = try_build_with(
        &format!("{} OPTION (NO_PERFORMANCE_SPOOL)", sql),
        BuildOptions::default(),
    )
    .unwrap();
    let RootNode::Select(plan) = &roots[0].node else {
        panic!("expected SELECT");
    };
    assert_eq!(lazy_spools(&plan.root), 0);
}

#[test]
fn test_spool_insertion_can_be_disabled() {
    let options = BuildOptions::default().with_spool_insertion(false);
    let roots = try_build_with(
        "SELECT a.name FROM account a \
         WHERE EXISTS (SELECT * FROM contact c WHERE c.parentcustomerid = a.accountid)",
        options,
    )
    .unwrap();
    let plan = roots[0].node.plans()[0];
    assert_eq!(lazy_spools(&plan.root), 0);
}

#[test]
fn test_scalar_subquery_asserts_single_row() {
    let plan = select_plan("SELECT name, (SELECT fullname FROM contact) AS who FROM account");
    match first_of(&plan.root, |op| matches!(op, PlanOperator::Assert(_))) {
        Some(PlanOperator::Assert(node)) => {
            assert!(node.message.starts_with("Subquery returned more than 1 value"));
            assert!(matches!(node.input.as_ref(), PlanOperator::Aggregate(_)));
        }
        _ => panic!("no assert in\n{}", plan.root),
    }
    assert_eq!(plan.columns[1].name, "who");
}

#[test]
fn test_scalar_subquery_over_aggregate_needs_no_assert() {
    let plan = select_plan("SELECT name, (SELECT COUNT(*) FROM contact) FROM account");
    assert_eq!(
        count(&plan.root, |op| matches!(op, PlanOperator::Assert(_))),
        0
    );
}

#[test]
fn test_subquery_with_two_columns_is_rejected() {
    let errors = build_errors(
        "SELECT name FROM account WHERE accountid IN (SELECT contactid, fullname FROM contact)",
    );
    assert_eq!(errors[0].category(), ErrorCategory::Semantic);
    assert!(errors[0].to_string().contains("Only one expression"));
}

#[test]
fn test_order_by_inside_derived_table_needs_top() {
    let errors = build_errors("SELECT name FROM (SELECT name FROM account ORDER BY name) x");
    assert_eq!(errors[0].category(), ErrorCategory::Semantic);

    select_plan("SELECT name FROM (SELECT TOP 10 name FROM account ORDER BY name) x");
}

#[test]
fn test_spool_thresholds_skip_cheap_loops() {
    // no outer side is large enough and no inner side small enough
    let options = BuildOptions::default().with_spool_thresholds(u64::MAX, 0);
    let roots = try_build_with(
        "SELECT a.name FROM account a \
         WHERE EXISTS (SELECT * FROM contact c WHERE c.parentcustomerid = a.accountid)",
        options,
    )
    .unwrap();
    let plan = roots[0].node.plans()[0];
    assert_eq!(lazy_spools(&plan.root), 0);
}
