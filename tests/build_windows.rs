//! Window function lowering

mod support;

use support::{build_errors, count, first_of, select_plan};
use tsql_planner::physical::SpoolMode;
use tsql_planner::planner::{AggregateType, SortDirection};
use tsql_planner::{ErrorCategory, PlanOperator};

#[test]
fn test_row_number_sorts_segments_and_numbers() {
    let plan = select_plan(
        "SELECT fullname, ROW_NUMBER() OVER (PARTITION BY department ORDER BY annualincome DESC) AS rn \
         FROM contact",
    );
    let sequence = match first_of(&plan.root, |op| matches!(op, PlanOperator::SequenceProject(_))) {
        Some(PlanOperator::SequenceProject(node)) => node,
        _ => panic!("no sequence project in\n{}", plan.root),
    };
    assert_eq!(sequence.values[0].func, AggregateType::RowNumber);
    assert!(sequence.values[0].rank_segment.is_none());

    let PlanOperator::Segment(segment) = sequence.input.as_ref() else {
        panic!("expected segment below sequence project");
    };
    let partition: Vec<_> = segment.partition_by.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(partition, vec!["department"]);

    let PlanOperator::Sort(sort) = segment.input.as_ref() else {
        panic!("expected sort below segment");
    };
    let keys: Vec<_> = sort
        .keys
        .iter()
        .map(|k| (k.column.name.as_str(), k.direction))
        .collect();
    assert_eq!(
        keys,
        vec![
            ("department", SortDirection::Asc),
            ("annualincome", SortDirection::Desc)
        ]
    );
    assert_eq!(plan.columns[1].name, "rn");
}

#[test]
fn test_rank_adds_a_peer_segment() {
    let plan = select_plan("SELECT fullname, RANK() OVER (ORDER BY annualincome) FROM contact");
    assert_eq!(count(&plan.root, |op| matches!(op, PlanOperator::Segment(_))), 2);
    match first_of(&plan.root, |op| matches!(op, PlanOperator::SequenceProject(_))) {
        Some(PlanOperator::SequenceProject(node)) => {
            assert!(node.values[0].rank_segment.is_some())
        }
        _ => panic!("no sequence project"),
    }
}

#[test]
fn test_partition_aggregate_replays_segment_spool() {
    let plan = select_plan(
        "SELECT fullname, COUNT(*) OVER (PARTITION BY department) AS colleagues FROM contact",
    );
    let segment_spools = count(&plan.root, |op| {
        matches!(op, PlanOperator::Spool(s) if matches!(s.mode, SpoolMode::Segment { .. }))
    });
    assert_eq!(segment_spools, 1);
    assert!(count(&plan.root, |op| matches!(op, PlanOperator::SpoolConsumer(_))) >= 1);
}

#[test]
fn test_rows_frame_uses_window_spool() {
    let plan = select_plan(
        "SELECT fullname, SUM(annualincome) OVER (PARTITION BY department ORDER BY annualincome \
         ROWS BETWEEN 2 PRECEDING AND CURRENT ROW) AS running FROM contact",
    );
    let window_spools = count(&plan.root, |op| {
        matches!(op, PlanOperator::Spool(s) if matches!(s.mode, SpoolMode::Window { .. }))
    });
    assert_eq!(window_spools, 1);
}

#[test]
fn test_default_range_frame_is_rejected() {
    let errors = build_errors(
        "SELECT SUM(annualincome) OVER (ORDER BY fullname) FROM contact",
    );
    assert_eq!(errors[0].category(), ErrorCategory::Unsupported);

    let errors = build_errors(
        "SELECT SUM(annualincome) OVER (ORDER BY fullname RANGE BETWEEN UNBOUNDED PRECEDING AND CURRENT ROW) FROM contact",
    );
    assert_eq!(errors[0].category(), ErrorCategory::Unsupported);
}

#[test]
fn test_ranking_requires_order_by() {
    let errors = build_errors("SELECT ROW_NUMBER() OVER (PARTITION BY department) FROM contact");
    assert_eq!(errors[0].category(), ErrorCategory::Semantic);
}
