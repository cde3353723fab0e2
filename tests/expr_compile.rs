use scoal_rs::expr::{CompiledExpr, EvalEnv, Scope};
use scoal_rs::ScoalError;

fn approx_eq(a: f64, b: f64, eps: f64) {
    assert!(
        (a - b).abs() <= eps,
        "expected {a} ~= {b} within eps={eps}, got diff={}",
        (a - b).abs()
    );
}

fn eval_params(src: &str, params: &[(&str, f64)]) -> anyhow::Result<f64> {
    let names: Vec<String> = params.iter().map(|(n, _)| n.to_string()).collect();
    let values: Vec<f64> = params.iter().map(|(_, v)| *v).collect();
    let empty: Vec<String> = Vec::new();
    let scope = Scope {
        params: &names,
        demes: &empty,
        aux: &empty,
        defs: &empty,
        defs_dynamic: &[],
    };
    let compiled = CompiledExpr::compile(src, &scope)?;
    let env = EvalEnv {
        params: &values,
        demes: &[],
        aux: &[],
        defs: &[],
        t: 0.0,
    };
    let mut stack = Vec::new();
    Ok(compiled.eval(&env, &mut stack))
}

#[test]
fn arithmetic_precedence() {
    approx_eq(eval_params("2 + 3*4", &[]).expect("eval"), 14.0, 0.0);
    approx_eq(eval_params("(2 + 3)*4", &[]).expect("eval"), 20.0, 0.0);
    approx_eq(eval_params("10 - 4 - 3", &[]).expect("eval"), 3.0, 0.0);
    approx_eq(eval_params("12/4/3", &[]).expect("eval"), 1.0, 0.0);
}

#[test]
fn power_is_right_associative() {
    approx_eq(eval_params("2^3^2", &[]).expect("eval"), 512.0, 0.0);
    approx_eq(eval_params("2^-2", &[]).expect("eval"), 0.25, 0.0);
    // unary minus binds looser than the exponent
    approx_eq(eval_params("-2^2", &[]).expect("eval"), -4.0, 0.0);
}

#[test]
fn comparisons_yield_zero_or_one() {
    approx_eq(eval_params("3 > 2", &[]).expect("eval"), 1.0, 0.0);
    approx_eq(eval_params("3 < 2", &[]).expect("eval"), 0.0, 0.0);
    approx_eq(eval_params("2 >= 2", &[]).expect("eval"), 1.0, 0.0);
    approx_eq(eval_params("2 == 2", &[]).expect("eval"), 1.0, 0.0);
    approx_eq(eval_params("2 != 2", &[]).expect("eval"), 0.0, 0.0);
}

#[test]
fn builtin_functions() {
    approx_eq(eval_params("exp(1)", &[]).expect("eval"), std::f64::consts::E, 1e-12);
    approx_eq(eval_params("log(exp(2))", &[]).expect("eval"), 2.0, 1e-12);
    approx_eq(eval_params("sqrt(16)", &[]).expect("eval"), 4.0, 0.0);
    approx_eq(eval_params("abs(0 - 3)", &[]).expect("eval"), 3.0, 0.0);
    approx_eq(eval_params("pow(2, 10)", &[]).expect("eval"), 1024.0, 0.0);
    approx_eq(eval_params("min(2, 5)", &[]).expect("eval"), 2.0, 0.0);
    approx_eq(eval_params("max(2, 5)", &[]).expect("eval"), 5.0, 0.0);
    approx_eq(eval_params("mod(7, 3)", &[]).expect("eval"), 1.0, 0.0);
    approx_eq(eval_params("if(2 > 1, 10, 20)", &[]).expect("eval"), 10.0, 0.0);
    approx_eq(eval_params("if(2 < 1, 10, 20)", &[]).expect("eval"), 20.0, 0.0);
}

#[test]
fn parameters_resolve_by_name() {
    let v = eval_params("beta*S + 1e-3", &[("beta", 0.5), ("S", 100.0)]).expect("eval");
    approx_eq(v, 50.001, 1e-12);
}

#[test]
fn parse_error_carries_position() {
    let err = eval_params("2 + * 3", &[]).expect_err("expected parse error");
    match err.downcast_ref::<ScoalError>() {
        Some(ScoalError::Parse { position, .. }) => assert_eq!(*position, 4),
        other => panic!("expected ScoalError::Parse, got {other:?}"),
    }
}

#[test]
fn unknown_identifier_is_a_name_error() {
    let err = eval_params("2*zeta", &[("beta", 1.0)]).expect_err("expected name error");
    match err.downcast_ref::<ScoalError>() {
        Some(ScoalError::Name { ident }) => assert_eq!(ident, "zeta"),
        other => panic!("expected ScoalError::Name, got {other:?}"),
    }
}

#[test]
fn unknown_function_and_arity_are_rejected() {
    assert!(eval_params("sinh(1)", &[]).is_err());
    assert!(eval_params("pow(2)", &[]).is_err());
    assert!(eval_params("if(1, 2)", &[]).is_err());
}

#[test]
fn dynamic_flag_tracks_state_and_time() {
    let params = vec!["beta".to_string()];
    let demes = vec!["I".to_string()];
    let empty: Vec<String> = Vec::new();
    let scope = Scope {
        params: &params,
        demes: &demes,
        aux: &empty,
        defs: &empty,
        defs_dynamic: &[],
    };
    assert!(CompiledExpr::compile("beta*I", &scope).expect("compile").is_dynamic());
    assert!(CompiledExpr::compile("exp(t)", &scope).expect("compile").is_dynamic());
    assert!(!CompiledExpr::compile("beta*2", &scope).expect("compile").is_dynamic());
}
