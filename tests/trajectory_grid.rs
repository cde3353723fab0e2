use scoal_rs::model::{Parameters, PopModel};
use scoal_rs::trajectory::{integrate, Method, TrajectorySpec};
use scoal_rs::ScoalError;

fn approx_eq(a: f64, b: f64, eps: f64) {
    assert!(
        (a - b).abs() <= eps,
        "expected {a} ~= {b} within eps={eps}, got diff={}",
        (a - b).abs()
    );
}

fn decay_model(k: f64, y0: f64, method: Method, steps: usize) -> PopModel {
    let params = Parameters::new(vec![("k".to_string(), k)]);
    PopModel::new(
        "",
        "F(I,I) = 0; D(I) = k*I;",
        params,
        TrajectorySpec {
            method,
            steps,
            t0: 0.0,
            t1: 1.0,
        },
        &[("I".to_string(), y0)],
    )
    .expect("model init failed")
}

#[test]
fn rk4_exp_decay_matches_analytic() {
    // y' = -k y  =>  y(1) = y0 exp(-k)
    let model = decay_model(1.3, 2.0, Method::ClassicRk, 100);
    let ts = integrate(&model, &model.traj).expect("integration failed");
    assert_eq!(ts.len(), 101);
    assert_eq!(ts.start_time(), 0.0);
    assert_eq!(ts.end_time(), 1.0);
    let expected = 2.0 * (-1.3f64).exp();
    approx_eq(ts.frame(ts.len() - 1).y[0], expected, 1e-9);
}

#[test]
fn midpoint_and_euler_converge_more_slowly() {
    let expected = 2.0 * (-1.3f64).exp();
    let mid = decay_model(1.3, 2.0, Method::Midpoint, 100);
    let ts = integrate(&mid, &mid.traj).expect("integration failed");
    approx_eq(ts.frame(ts.len() - 1).y[0], expected, 1e-4);

    let eul = decay_model(1.3, 2.0, Method::Euler, 100);
    let ts = integrate(&eul, &eul.traj).expect("integration failed");
    approx_eq(ts.frame(ts.len() - 1).y[0], expected, 2e-2);
}

#[test]
fn demes_are_clamped_non_negative() {
    // constant drain pushes the deme through zero; the clamp holds it there
    let params = Parameters::new(vec![("r".to_string(), 2.0)]);
    let model = PopModel::new(
        "",
        "F(I,I) = 0; D(I) = r;",
        params,
        TrajectorySpec {
            method: Method::ClassicRk,
            steps: 100,
            t0: 0.0,
            t1: 1.0,
        },
        &[("I".to_string(), 1.0)],
    )
    .expect("model init failed");
    let ts = integrate(&model, &model.traj).expect("integration failed");
    for k in 0..ts.len() {
        assert!(ts.frame(k).y[0] >= 0.0, "negative deme at frame {k}");
    }
    assert_eq!(ts.frame(ts.len() - 1).y[0], 0.0);
}

#[test]
fn non_finite_rates_are_an_integration_error() {
    let params = Parameters::new(Vec::new());
    let model = PopModel::new(
        "",
        "F(I,I) = sqrt(0 - 1); D(I) = 0;",
        params,
        TrajectorySpec {
            method: Method::Euler,
            steps: 10,
            t0: 0.0,
            t1: 1.0,
        },
        &[("I".to_string(), 1.0)],
    )
    .expect("model init failed");
    let err = integrate(&model, &model.traj).expect_err("expected integration failure");
    assert!(matches!(
        err.downcast_ref::<ScoalError>(),
        Some(ScoalError::Integration(_))
    ));
}

#[test]
fn frame_lookup_scans_from_hint_in_both_directions() {
    let model = decay_model(0.5, 1.0, Method::Euler, 10);
    let ts = integrate(&model, &model.traj).expect("integration failed");
    // grid times are 0.0, 0.1, ..., 1.0
    assert_eq!(ts.frame_index_at_time(1.0, 10), 10);
    assert_eq!(ts.frame_index_at_time(0.55, 10), 5);
    assert_eq!(ts.frame_index_at_time(0.55, 0), 5);
    assert_eq!(ts.frame_index_at_time(0.0, 10), 0);
    assert_eq!(ts.frame_index_at_time(-0.5, 4), 0);
    // exact grid hit resolves to that frame
    assert_eq!(ts.frame_index_at_time(ts.time(3), 7), 3);
}
