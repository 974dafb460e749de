//! Recursive CTEs and set operators

mod support;

use support::{build_errors, count, first_of, select_plan, try_build_with};
use tsql_planner::physical::{JoinOutput, SpoolMode};
use tsql_planner::planner::{BinaryOp, Expr};
use tsql_planner::{BuildOptions, ErrorCategory, PlanOperator, RootNode};

const CHAIN: &str = "WITH chain AS ( \
    SELECT accountid, name FROM account WHERE parentaccountid IS NULL \
    UNION ALL \
    SELECT a.accountid, a.name FROM account a INNER JOIN chain c ON a.parentaccountid = c.accountid \
) SELECT name FROM chain";

/// Limit compared against the recursion depth column
fn recursion_bound(plan: &PlanOperator) -> Option<Expr> {
    match first_of(plan, |op| matches!(op, PlanOperator::Assert(_))) {
        Some(PlanOperator::Assert(node)) => match &node.predicate {
            Expr::BinaryExpr {
                left,
                op: BinaryOp::LtEq,
                right,
            } if matches!(left.as_ref(), Expr::Column(_)) => Some(right.as_ref().clone()),
            other => panic!("unexpected recursion check {}", other),
        },
        _ => None,
    }
}

fn recursion_assert(plan: &PlanOperator) -> Option<String> {
    match first_of(plan, |op| matches!(op, PlanOperator::Assert(_))) {
        Some(PlanOperator::Assert(node)) => Some(node.message.clone()),
        _ => None,
    }
}

#[test]
fn test_recursive_cte_runs_over_stack_spool() {
    let plan = select_plan(&format!("{} OPTION (MAXRECURSION 5)", CHAIN));
    let stack_spools = count(&plan.root, |op| {
        matches!(op, PlanOperator::Spool(s) if s.mode == SpoolMode::Stack)
    });
    assert_eq!(stack_spools, 1);
    let message = recursion_assert(&plan.root).expect("recursion limit check");
    assert!(message.contains("maximum recursion 5"), "{}", message);
    assert_eq!(recursion_bound(&plan.root), Some(Expr::int(5)));
    assert_eq!(plan.columns[0].name, "name");
}

#[test]
fn test_recursion_limit_defaults_and_can_be_lifted() {
    let plan = select_plan(CHAIN);
    let message = recursion_assert(&plan.root).expect("recursion limit check");
    assert!(message.contains("maximum recursion 100"));

    let plan = select_plan(&format!("{} OPTION (MAXRECURSION 0)", CHAIN));
    assert!(recursion_assert(&plan.root).is_none());
}

#[test]
fn test_default_recursion_limit_is_configurable() {
    let options = BuildOptions::default().with_default_max_recursion(7);
    let roots = try_build_with(CHAIN, options).unwrap();
    let RootNode::Select(plan) = &roots[0].node else {
        panic!("expected SELECT");
    };
    let message = recursion_assert(&plan.root).expect("recursion limit check");
    assert!(message.contains("maximum recursion 7"));
    assert_eq!(recursion_bound(&plan.root), Some(Expr::int(7)));
}

#[test]
fn test_default_recursion_limit_above_maximum_is_rejected() {
    let options = BuildOptions::default().with_default_max_recursion(40000);
    let errors = try_build_with(CHAIN, options).unwrap_err();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].category(), ErrorCategory::Structural);

    let options = BuildOptions::default().with_default_max_recursion(32767);
    assert!(try_build_with(CHAIN, options).is_ok());
}

#[test]
fn test_recursion_limit_above_maximum_is_rejected() {
    let errors = build_errors(&format!("{} OPTION (MAXRECURSION 40000)", CHAIN));
    assert_eq!(errors[0].category(), ErrorCategory::Structural);
}

#[test]
fn test_recursive_member_types_must_match_anchor() {
    let errors = build_errors(
        "WITH r (n) AS (SELECT 1 UNION ALL SELECT n + 1.5 FROM r WHERE n < 10) SELECT n FROM r",
    );
    assert_eq!(errors[0].category(), ErrorCategory::Semantic);
    assert!(errors[0].to_string().contains("Types don't match"));

    select_plan("WITH r (n) AS (SELECT 1 UNION ALL SELECT n + 1 FROM r WHERE n < 10) SELECT n FROM r");
}

#[test]
fn test_union_removes_duplicates_over_concatenation() {
    let plan = select_plan("SELECT name FROM account UNION SELECT fullname FROM contact");
    let PlanOperator::Distinct(distinct) = plan.root.as_ref() else {
        panic!("expected distinct, got\n{}", plan.root);
    };
    assert!(matches!(distinct.input.as_ref(), PlanOperator::Concatenate(_)));
    assert_eq!(plan.columns[0].name, "name");

    let plan = select_plan("SELECT name FROM account UNION ALL SELECT fullname FROM contact");
    assert!(matches!(plan.root.as_ref(), PlanOperator::Concatenate(_)));
}

#[test]
fn test_union_branches_need_equal_column_counts() {
    let errors = build_errors(
        "SELECT name, revenue FROM account UNION ALL SELECT fullname FROM contact",
    );
    assert_eq!(errors[0].category(), ErrorCategory::Semantic);
}

#[test]
fn test_intersect_and_except_are_semi_joins() {
    let intersect = select_plan("SELECT name FROM account INTERSECT SELECT fullname FROM contact");
    let except = select_plan("SELECT name FROM account EXCEPT SELECT fullname FROM contact");
    for (plan, anti) in [(&intersect, false), (&except, true)] {
        match first_of(&plan.root, |op| matches!(op, PlanOperator::Join(_))) {
            Some(PlanOperator::Join(join)) => {
                assert_eq!(join.output, JoinOutput::Left);
                assert_eq!(join.anti_join, anti);
                assert!(matches!(join.left.as_ref(), PlanOperator::Distinct(_)));
            }
            _ => panic!("no join in\n{}", plan.root),
        }
    }

    let errors = build_errors("SELECT name FROM account INTERSECT ALL SELECT fullname FROM contact");
    assert_eq!(errors[0].category(), ErrorCategory::Unsupported);
}

#[test]
fn test_union_ordered_by_output_name() {
    let plan = select_plan(
        "SELECT name FROM account UNION ALL SELECT fullname FROM contact ORDER BY name DESC",
    );
    assert!(matches!(plan.root.as_ref(), PlanOperator::Sort(_)));
}
