use scoal_rs::io::newick::parse_newick;
use scoal_rs::tree::{EventKind, TreeIntervals};
use scoal_rs::ScoalError;

fn approx_eq(a: f64, b: f64, eps: f64) {
    assert!(
        (a - b).abs() <= eps,
        "expected {a} ~= {b} within eps={eps}, got diff={}",
        (a - b).abs()
    );
}

#[test]
fn parses_a_two_tip_tree() {
    let tree = parse_newick("(a_I:1,b_I:1);").expect("parse failed");
    assert_eq!(tree.n_tips, 2);
    assert_eq!(tree.n_nodes, 3);
    assert_eq!(tree.tip_names, vec!["a_I".to_string(), "b_I".to_string()]);
    approx_eq(tree.height[0], 0.0, 0.0);
    approx_eq(tree.height[1], 0.0, 0.0);
    approx_eq(tree.root_height(), 1.0, 1e-12);
}

#[test]
fn serially_sampled_tips_get_distinct_heights() {
    let tree = parse_newick("(a_I:2,b_I:1);").expect("parse failed");
    approx_eq(tree.height[0], 0.0, 1e-12);
    approx_eq(tree.height[1], 1.0, 1e-12);
    approx_eq(tree.root_height(), 2.0, 1e-12);

    let intervals = TreeIntervals::build(&tree).expect("intervals failed");
    assert_eq!(intervals.count(), 3);
    assert_eq!(intervals.event_node(0), 0);
    assert_eq!(intervals.event_node(1), 1);
    approx_eq(intervals.duration(1), 1.0, 1e-12);
    approx_eq(intervals.duration(2), 1.0, 1e-12);
}

#[test]
fn durations_sum_to_tree_height() {
    let tree = parse_newick("(((a_I:1,b_I:1):1,c_I:2):1,d_I:3);").expect("parse failed");
    let intervals = TreeIntervals::build(&tree).expect("intervals failed");
    assert_eq!(intervals.count(), 7);
    let total: f64 = (0..intervals.count()).map(|i| intervals.duration(i)).sum();
    approx_eq(total, tree.root_height(), 1e-12);
    approx_eq(intervals.total_duration(), tree.root_height(), 1e-12);
}

#[test]
fn events_sort_by_height_with_samples_before_coalescences() {
    // tip c and the (a,b) coalescence sit at the same height
    let tree = parse_newick("((a_I:1,b_I:1):1,c_I:1);").expect("parse failed");
    let intervals = TreeIntervals::build(&tree).expect("intervals failed");
    assert_eq!(intervals.count(), 5);
    assert_eq!(intervals.event_kind(0), EventKind::Sample);
    assert_eq!(intervals.event_kind(1), EventKind::Sample);
    // at height 1: sample first, then the coalescence
    assert_eq!(intervals.event_kind(2), EventKind::Sample);
    assert_eq!(intervals.event_node(2), 2);
    assert_eq!(intervals.event_kind(3), EventKind::Coalescent);
    approx_eq(intervals.time_of(2), intervals.time_of(3), 1e-12);
    assert_eq!(intervals.event_kind(4), EventKind::Coalescent);
}

#[test]
fn rejects_multifurcations() {
    let err = parse_newick("(a_I:1,b_I:1,c_I:1);").expect_err("expected parse failure");
    assert!(matches!(
        err.downcast_ref::<ScoalError>(),
        Some(ScoalError::Parse { .. })
    ));
}

#[test]
fn rejects_duplicate_tip_labels() {
    let err = parse_newick("(a_I:1,a_I:1);").expect_err("expected duplicate labels to fail");
    assert!(matches!(
        err.downcast_ref::<ScoalError>(),
        Some(ScoalError::Config(_))
    ));
}

#[test]
fn rejects_negative_branch_lengths() {
    assert!(parse_newick("(a_I:1,b_I:-1);").is_err());
}
