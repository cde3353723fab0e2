use ndarray::array;
use scoal_rs::probs::StateProbabilities;

fn approx_eq(a: f64, b: f64, eps: f64) {
    assert!(
        (a - b).abs() <= eps,
        "expected {a} ~= {b} within eps={eps}, got diff={}",
        (a - b).abs()
    );
}

#[test]
fn samples_insert_one_hot_vectors() {
    let mut sp = StateProbabilities::new(8, 3);
    sp.add_sample(0, 1, None).expect("add failed");
    assert_eq!(sp.probs(0).expect("lookup failed"), &[0.0, 1.0, 0.0]);
    assert_eq!(sp.num_extant(), 1);

    let err = sp.add_sample(1, 3, None).expect_err("state out of range");
    assert!(err.to_string().contains("out of range"));
}

#[test]
fn min_p_floors_and_renormalises() {
    let mut sp = StateProbabilities::new(8, 3);
    sp.add_sample(0, 2, Some(0.01)).expect("add failed");
    let p = sp.probs(0).expect("lookup failed");
    approx_eq(p.iter().sum::<f64>(), 1.0, 1e-12);
    assert!(p[2] > 0.9);
    for v in p {
        assert!(*v >= 0.009, "entry {v} fell below the floor");
    }
}

#[test]
fn duplicate_and_missing_lineages_are_rejected() {
    let mut sp = StateProbabilities::new(8, 2);
    sp.add_lineage(3, &[0.4, 0.6]).expect("add failed");
    assert!(sp.add_lineage(3, &[1.0, 0.0]).is_err());
    assert!(sp.remove_lineage(5).is_err());

    let p = sp.remove_lineage(3).expect("remove failed");
    assert_eq!(p, vec![0.4, 0.6]);
    assert_eq!(sp.num_extant(), 0);
    assert!(!sp.is_extant(3));
}

#[test]
fn aggregates_track_mutations() {
    let mut sp = StateProbabilities::new(8, 2);
    sp.add_lineage(0, &[1.0, 0.0]).expect("add failed");
    sp.add_lineage(1, &[0.5, 0.5]).expect("add failed");
    sp.add_lineage(2, &[0.0, 1.0]).expect("add failed");

    let a = sp.lineage_state_sum().to_vec();
    approx_eq(a[0], 1.5, 1e-12);
    approx_eq(a[1], 1.5, 1e-12);
    let s = sp.lineage_sum_squares().to_vec();
    approx_eq(s[0], 1.25, 1e-12);
    approx_eq(s[1], 1.25, 1e-12);

    // cache must not survive a removal
    sp.remove_lineage(1).expect("remove failed");
    let a = sp.lineage_state_sum().to_vec();
    approx_eq(a[0], 1.0, 1e-12);
    approx_eq(a[1], 1.0, 1e-12);
}

#[test]
fn slots_are_recycled() {
    let mut sp = StateProbabilities::new(4, 2);
    for node in 0..4 {
        sp.add_lineage(node, &[1.0, 0.0]).expect("add failed");
    }
    sp.remove_lineage(2).expect("remove failed");
    sp.add_lineage(2, &[0.0, 1.0]).expect("re-add failed");
    assert_eq!(sp.num_extant(), 4);
    assert_eq!(sp.probs(2).expect("lookup failed"), &[0.0, 1.0]);
}

#[test]
fn mul_extant_left_multiplies_by_q_transpose() {
    let mut sp = StateProbabilities::new(4, 2);
    sp.add_lineage(0, &[1.0, 0.0]).expect("add failed");
    sp.add_lineage(1, &[0.0, 1.0]).expect("add failed");
    let q = array![[0.5, 0.5], [0.25, 0.75]];
    sp.mul_extant_probabilities(&q, false).expect("mul failed");
    assert_eq!(sp.probs(0).expect("lookup failed"), &[0.5, 0.5]);
    assert_eq!(sp.probs(1).expect("lookup failed"), &[0.25, 0.75]);

    // every exposed mutation keeps the simplex invariant when asked to
    sp.mul_extant_probabilities(&q, true).expect("mul failed");
    for node in 0..2 {
        let sum: f64 = sp.probs(node).expect("lookup failed").iter().sum();
        approx_eq(sum, 1.0, 1e-9);
    }

    let bad = array![[1.0]];
    assert!(sp.mul_extant_probabilities(&bad, false).is_err());
}

#[test]
fn root_probs_needs_exactly_one_survivor() {
    let mut sp = StateProbabilities::new(4, 2);
    sp.add_lineage(0, &[0.3, 0.7]).expect("add failed");
    sp.add_lineage(1, &[1.0, 0.0]).expect("add failed");
    assert!(sp.root_probs().is_none());
    sp.remove_lineage(1).expect("remove failed");
    assert_eq!(sp.root_probs().expect("root probs"), &[0.3, 0.7]);
}

#[test]
fn ancestral_store_round_trips() {
    let mut sp = StateProbabilities::new(4, 2);
    sp.add_lineage(1, &[0.2, 0.8]).expect("add failed");
    sp.store_ancestral(1).expect("store failed");
    sp.store_ancestral_vec(3, vec![1.0, 0.0]);
    assert_eq!(sp.ancestral(1).expect("stored"), &[0.2, 0.8]);

    let taken = sp.clear_ancestral();
    assert_eq!(taken[1].as_deref().expect("taken"), &[0.2, 0.8]);
    assert_eq!(taken[3].as_deref().expect("taken"), &[1.0, 0.0]);
    assert!(sp.ancestral(1).is_none());
}
