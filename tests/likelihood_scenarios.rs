use serde_json::json;

use scoal_rs::io::config::RunConfig;
use scoal_rs::io::newick::parse_newick;
use scoal_rs::StructuredTreeLikelihood;

fn approx_eq(a: f64, b: f64, eps: f64) {
    assert!(
        (a - b).abs() <= eps,
        "expected {a} ~= {b} within eps={eps}, got diff={}",
        (a - b).abs()
    );
}

fn engine(config: serde_json::Value, newick: &str) -> StructuredTreeLikelihood {
    let config: RunConfig = serde_json::from_value(config).expect("config json invalid");
    let tree = parse_newick(newick).expect("tree parse failed");
    config.build_engine(tree).expect("engine construction failed")
}

#[test]
fn two_deme_sir_gives_a_finite_likelihood() {
    // two infectious stages plus susceptibles; both tips sampled from I0 at
    // the end of the trajectory, coalescing at height 0.5
    let config = json!({
        "model": {
            "name": "sir2",
            "definitions": "lambda0 = beta0*S*I0; lambda1 = beta1*S*I1;",
            "equations": "F(I0,I0) = lambda0; F(I1,I1) = lambda1; G(I0,I1) = b*I0; D(I0) = gamma0*I0; D(I1) = gamma1*I1; dot(S) = -lambda0 - lambda1;"
        },
        "parameters": {
            "beta0": 0.001,
            "beta1": 0.0001,
            "gamma0": 1.0,
            "gamma1": 0.1111,
            "b": 0.01
        },
        "trajectory": {
            "method": "classicrk",
            "integrationSteps": 1001,
            "t0": 0.0,
            "t1": 20.0,
            "initialValues": [
                { "name": "I0", "value": 1.0 },
                { "name": "I1", "value": 0.0 },
                { "name": "S", "value": 999.0 }
            ]
        }
    });
    let mut engine = engine(config, "(ta_I0:0.5,tb_I0:0.5);");
    let log_p = engine.calculate_log_p().expect("evaluation failed");
    assert!(log_p.is_finite(), "expected finite logP, got {log_p}");
    let root = engine.root_probs().expect("root probs missing");
    assert!(root[0] > 0.5, "root should favour I0, got {root:?}");
    approx_eq(root.iter().sum::<f64>(), 1.0, 1e-9);
}

fn two_deme_config(fs_corrections: bool) -> serde_json::Value {
    json!({
        "model": {
            "equations": "F(I0,I0) = b0*I0; F(I1,I1) = b1*I1; G(I0,I1) = g01*I0; G(I1,I0) = g10*I1; D(I0) = d0*I0; D(I1) = d1*I1;"
        },
        "parameters": {
            "b0": 0.3,
            "b1": 0.2,
            "g01": 0.05,
            "g10": 0.05,
            "d0": 0.1,
            "d1": 0.1
        },
        "trajectory": {
            "integrationSteps": 500,
            "t0": 0.0,
            "t1": 10.0,
            "initialValues": [
                { "name": "I0", "value": 20.0 },
                { "name": "I1", "value": 20.0 }
            ]
        },
        "likelihood": { "finiteSizeCorrections": fs_corrections }
    })
}

const FIVE_TIP_TREE: &str =
    "((ta_I0:1,tb_I0:1):2,((tc_I1:1.5,td_I1:1.5):0.5,te_I0:2):1);";

#[test]
fn finite_size_corrections_shift_the_likelihood_boundedly() {
    let mut plain = engine(two_deme_config(false), FIVE_TIP_TREE);
    let lp_plain = plain.calculate_log_p().expect("evaluation failed");
    let mut corrected = engine(two_deme_config(true), FIVE_TIP_TREE);
    let lp_corrected = corrected.calculate_log_p().expect("evaluation failed");

    assert!(lp_plain.is_finite());
    assert!(lp_corrected.is_finite());
    assert!(
        (lp_plain - lp_corrected).abs() < 10.0,
        "correction moved logP too far: {lp_plain} vs {lp_corrected}"
    );

    // surviving lineage stays on the simplex under both settings
    for engine in [&plain, &corrected] {
        let root = engine.root_probs().expect("root probs missing");
        approx_eq(root.iter().sum::<f64>(), 1.0, 1e-9);
        for v in root {
            assert!((0.0..=1.0 + 1e-12).contains(v), "entry {v} off the simplex");
        }
    }
}

#[test]
fn ancestral_reconstruction_concentrates_on_the_source_deme() {
    // births overwhelmingly in I0 and all tips sampled there: the
    // reconstructed interior should stay in I0
    let config = json!({
        "model": {
            "equations": "F(I0,I0) = b0*I0; F(I1,I1) = b1*I1; G(I0,I1) = g*I0; D(I0) = d*I0; D(I1) = d*I1;"
        },
        "parameters": { "b0": 1.0, "b1": 0.01, "g": 0.01, "d": 0.1 },
        "trajectory": {
            "integrationSteps": 500,
            "t0": 0.0,
            "t1": 20.0,
            "initialValues": [
                { "name": "I0", "value": 10.0 },
                { "name": "I1", "value": 10.0 }
            ]
        },
        "likelihood": { "ancestral": true }
    });
    let mut engine = engine(config, "((a_I0:1,b_I0:1):1,c_I0:2);");
    let log_p = engine.calculate_log_p().expect("evaluation failed");
    assert!(log_p.is_finite(), "expected finite logP, got {log_p}");

    let tree_nodes = engine.tree().n_nodes;
    for node in 0..tree_nodes {
        let p = engine
            .ancestral_probs(node)
            .unwrap_or_else(|| panic!("missing ancestral probs for node {node}"));
        approx_eq(p.iter().sum::<f64>(), 1.0, 1e-9);
    }
    let root = engine.tree().root;
    let p_root = engine.ancestral_probs(root).expect("root posterior");
    assert!(
        p_root[0] > 0.9,
        "root posterior should concentrate on I0, got {p_root:?}"
    );
    // tip posteriors recover the sampled deme
    let p_tip = engine.ancestral_probs(0).expect("tip posterior");
    assert!(p_tip[0] > 0.9, "tip posterior should stay in I0, got {p_tip:?}");
}
