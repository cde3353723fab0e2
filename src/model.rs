use anyhow::{bail, Result};
use ndarray::Array2;

use crate::error::ScoalError;
use crate::expr::{CompiledExpr, EvalEnv, Scope};
use crate::trajectory::TrajectorySpec;

/// Named scalar parameter bindings with a dirty bit. The enclosing sampler
/// perturbs values through `set`; the likelihood engine clears the bit after
/// rebuilding the trajectory.
#[derive(Debug, Clone)]
pub struct Parameters {
    names: Vec<String>,
    values: Vec<f64>,
    dirty: bool,
}

impl Parameters {
    pub fn new(bindings: Vec<(String, f64)>) -> Self {
        let (names, values) = bindings.into_iter().unzip();
        Self {
            names,
            values,
            dirty: true,
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn value(&self, name: &str) -> Option<f64> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| self.values[i])
    }

    pub fn set(&mut self, name: &str, value: f64) -> Result<()> {
        match self.names.iter().position(|n| n == name) {
            Some(i) => {
                self.values[i] = value;
                self.dirty = true;
                Ok(())
            }
            None => bail!("unknown parameter '{name}'"),
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }
}

// ── equation block parsing ─────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
enum RawLhs {
    F(String, String),
    G(String, String),
    D(String),
    Dot(String),
}

#[derive(Debug)]
struct RawEq {
    lhs: RawLhs,
    rhs: String,
}

fn config_err(msg: impl Into<String>) -> anyhow::Error {
    ScoalError::Config(msg.into()).into()
}

fn model_err(msg: impl Into<String>) -> anyhow::Error {
    ScoalError::Model(msg.into()).into()
}

fn split_statements(block: &str) -> Vec<&str> {
    block
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

/// Parses one `F(a,b) = expr` / `G(a,b) = expr` / `D(a) = expr` /
/// `dot(X) = expr` statement. Matrix indices are deme names.
fn parse_equation(stmt: &str) -> Result<RawEq> {
    let (lhs_src, rhs) = stmt
        .split_once('=')
        .ok_or_else(|| config_err(format!("equation '{stmt}' is missing '='")))?;
    let lhs_src = lhs_src.trim();
    let rhs = rhs.trim().to_string();
    if rhs.is_empty() {
        return Err(config_err(format!(
            "equation '{stmt}' has an empty right-hand side"
        )));
    }

    let (head, rest) = lhs_src
        .split_once('(')
        .ok_or_else(|| config_err(format!("bad equation target '{lhs_src}'")))?;
    let inner = rest
        .strip_suffix(')')
        .ok_or_else(|| config_err(format!("bad equation target '{lhs_src}'")))?;
    let head = head.trim();
    let args: Vec<String> = inner.split(',').map(|a| a.trim().to_string()).collect();
    if args.iter().any(String::is_empty) {
        return Err(config_err(format!("bad equation target '{lhs_src}'")));
    }

    let lhs = match (head, args.len()) {
        ("F", 2) => RawLhs::F(args[0].clone(), args[1].clone()),
        ("G", 2) => RawLhs::G(args[0].clone(), args[1].clone()),
        ("D", 1) => RawLhs::D(args[0].clone()),
        ("dot", 1) => RawLhs::Dot(args[0].clone()),
        _ => {
            return Err(config_err(format!(
                "bad equation target '{lhs_src}': expected F(i,j), G(i,j), D(i) or dot(X)"
            )))
        }
    };
    Ok(RawEq { lhs, rhs })
}

fn parse_definition(stmt: &str) -> Result<(String, String)> {
    let (name, rhs) = stmt
        .split_once('=')
        .ok_or_else(|| config_err(format!("definition '{stmt}' is missing '='")))?;
    let name = name.trim();
    let rhs = rhs.trim();
    let name_ok = !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !name_ok || rhs.is_empty() {
        return Err(config_err(format!("bad definition '{stmt}'")));
    }
    Ok((name.to_string(), rhs.to_string()))
}

// ── population model ───────────────────────────────────────────

#[derive(Debug, Clone)]
struct MatrixEntry {
    row: usize,
    col: usize,
    expr: CompiledExpr,
}

/// Birth/migration/death matrix equations plus auxiliary ODEs, compiled
/// once. The per-deme derivatives are derived, never written by the user:
/// `dy_i = Σ_j F(j,i) + Σ_j G(j,i) − Σ_j G(i,j) − D(i)`.
#[derive(Debug, Clone)]
pub struct PopModel {
    pub params: Parameters,
    pub traj: TrajectorySpec,
    deme_names: Vec<String>,
    aux_names: Vec<String>,
    y0: Vec<f64>,
    defs: Vec<CompiledExpr>,
    f_entries: Vec<MatrixEntry>,
    g_entries: Vec<MatrixEntry>,
    d_entries: Vec<(usize, CompiledExpr)>,
    dot_entries: Vec<(usize, CompiledExpr)>,
    diag_f: bool,
    constant: bool,
}

/// Reusable evaluation buffers for one `PopModel`.
#[derive(Debug, Clone, Default)]
pub struct ModelScratch {
    defs: Vec<f64>,
    stack: Vec<f64>,
}

impl PopModel {
    pub fn new(
        definitions_block: &str,
        equations_block: &str,
        params: Parameters,
        traj: TrajectorySpec,
        initial_values: &[(String, f64)],
    ) -> Result<Self> {
        let raw_defs: Vec<(String, String)> = split_statements(definitions_block)
            .into_iter()
            .map(parse_definition)
            .collect::<Result<_>>()?;
        let raw_eqs: Vec<RawEq> = split_statements(equations_block)
            .into_iter()
            .map(parse_equation)
            .collect::<Result<_>>()?;
        if raw_eqs.is_empty() {
            return Err(config_err("model declares no matrix equations"));
        }

        // The deme set is implied by F/G/D; dot() names the aux variables.
        let mut implied_demes: Vec<String> = Vec::new();
        let mut aux_from_dot: Vec<String> = Vec::new();
        for eq in &raw_eqs {
            match &eq.lhs {
                RawLhs::F(a, b) | RawLhs::G(a, b) => {
                    push_unique(&mut implied_demes, a);
                    push_unique(&mut implied_demes, b);
                }
                RawLhs::D(a) => push_unique(&mut implied_demes, a),
                RawLhs::Dot(x) => {
                    if aux_from_dot.iter().any(|n| n == x) {
                        return Err(config_err(format!("duplicate dot({x}) equation")));
                    }
                    aux_from_dot.push(x.clone());
                }
            }
        }
        if let Some(x) = aux_from_dot.iter().find(|x| implied_demes.contains(*x)) {
            return Err(model_err(format!(
                "dot({x}) conflicts with the derived deme equation for '{x}'"
            )));
        }

        // Ordering comes from the initial-values declaration.
        let mut deme_names: Vec<String> = Vec::new();
        let mut aux_names: Vec<String> = Vec::new();
        for (name, _) in initial_values {
            if implied_demes.iter().any(|d| d == name) {
                if deme_names.iter().any(|d| d == name) {
                    return Err(config_err(format!("duplicate initial value for '{name}'")));
                }
                deme_names.push(name.clone());
            } else if aux_from_dot.iter().any(|a| a == name) {
                if aux_names.iter().any(|a| a == name) {
                    return Err(config_err(format!("duplicate initial value for '{name}'")));
                }
                aux_names.push(name.clone());
            } else {
                return Err(model_err(format!(
                    "initial value '{name}' is neither a deme nor an aux variable"
                )));
            }
        }
        if deme_names.len() != implied_demes.len() {
            let missing: Vec<&String> = implied_demes
                .iter()
                .filter(|d| !deme_names.contains(*d))
                .collect();
            return Err(model_err(format!(
                "missing initial values for demes {missing:?}"
            )));
        }
        if aux_names.len() != aux_from_dot.len() {
            let missing: Vec<&String> = aux_from_dot
                .iter()
                .filter(|a| !aux_names.contains(*a))
                .collect();
            return Err(model_err(format!(
                "missing initial values for aux variables {missing:?}"
            )));
        }
        let y0: Vec<f64> = deme_names
            .iter()
            .chain(aux_names.iter())
            .map(|n| {
                initial_values
                    .iter()
                    .find(|(name, _)| name == n)
                    .map(|(_, v)| *v)
                    .expect("coverage checked above")
            })
            .collect();
        if y0.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(config_err(
                "initial values must be finite and non-negative",
            ));
        }

        // Compile definitions in declaration order; each sees the ones
        // before it.
        let mut def_names: Vec<String> = Vec::new();
        let mut defs_dynamic: Vec<bool> = Vec::new();
        let mut defs: Vec<CompiledExpr> = Vec::new();
        for (name, rhs) in &raw_defs {
            if params.names().iter().any(|p| p == name)
                || deme_names.contains(name)
                || aux_names.contains(name)
                || def_names.contains(name)
                || name == "t"
            {
                return Err(config_err(format!(
                    "definition '{name}' collides with an existing name"
                )));
            }
            let scope = Scope {
                params: params.names(),
                demes: &deme_names,
                aux: &aux_names,
                defs: &def_names,
                defs_dynamic: &defs_dynamic,
            };
            let compiled = CompiledExpr::compile(rhs, &scope)?;
            defs_dynamic.push(compiled.is_dynamic());
            defs.push(compiled);
            def_names.push(name.clone());
        }

        let scope = Scope {
            params: params.names(),
            demes: &deme_names,
            aux: &aux_names,
            defs: &def_names,
            defs_dynamic: &defs_dynamic,
        };
        let deme_index = |name: &str| -> usize {
            deme_names
                .iter()
                .position(|d| d == name)
                .expect("implied deme")
        };

        let mut f_entries: Vec<MatrixEntry> = Vec::new();
        let mut g_entries: Vec<MatrixEntry> = Vec::new();
        let mut d_entries: Vec<(usize, CompiledExpr)> = Vec::new();
        let mut dot_entries: Vec<(usize, CompiledExpr)> = Vec::new();
        for eq in &raw_eqs {
            let expr = CompiledExpr::compile(&eq.rhs, &scope)?;
            match &eq.lhs {
                RawLhs::F(a, b) => {
                    let (row, col) = (deme_index(a), deme_index(b));
                    if f_entries.iter().any(|e| e.row == row && e.col == col) {
                        return Err(config_err(format!("duplicate equation F({a},{b})")));
                    }
                    f_entries.push(MatrixEntry { row, col, expr });
                }
                RawLhs::G(a, b) => {
                    let (row, col) = (deme_index(a), deme_index(b));
                    if row == col {
                        return Err(config_err(format!(
                            "G({a},{b}): self-migration is not meaningful"
                        )));
                    }
                    if g_entries.iter().any(|e| e.row == row && e.col == col) {
                        return Err(config_err(format!("duplicate equation G({a},{b})")));
                    }
                    g_entries.push(MatrixEntry { row, col, expr });
                }
                RawLhs::D(a) => {
                    let i = deme_index(a);
                    if d_entries.iter().any(|(j, _)| *j == i) {
                        return Err(config_err(format!("duplicate equation D({a})")));
                    }
                    d_entries.push((i, expr));
                }
                RawLhs::Dot(x) => {
                    let i = aux_names.iter().position(|a| a == x).expect("aux name");
                    dot_entries.push((i, expr));
                }
            }
        }

        let diag_f = f_entries.iter().all(|e| e.row == e.col);
        let constant = f_entries
            .iter()
            .chain(g_entries.iter())
            .map(|e| &e.expr)
            .chain(d_entries.iter().map(|(_, e)| e))
            .chain(dot_entries.iter().map(|(_, e)| e))
            .all(|e| !e.is_dynamic());

        Ok(Self {
            params,
            traj,
            deme_names,
            aux_names,
            y0,
            defs,
            f_entries,
            g_entries,
            d_entries,
            dot_entries,
            diag_f,
            constant,
        })
    }

    pub fn num_demes(&self) -> usize {
        self.deme_names.len()
    }

    pub fn num_aux(&self) -> usize {
        self.aux_names.len()
    }

    pub fn state_len(&self) -> usize {
        self.deme_names.len() + self.aux_names.len()
    }

    pub fn deme_names(&self) -> &[String] {
        &self.deme_names
    }

    pub fn aux_names(&self) -> &[String] {
        &self.aux_names
    }

    pub fn deme_index(&self, name: &str) -> Option<usize> {
        self.deme_names.iter().position(|d| d == name)
    }

    pub fn initial_state(&self) -> &[f64] {
        &self.y0
    }

    /// True when every rate expression collapses to a constant once
    /// parameters are bound.
    pub fn is_constant(&self) -> bool {
        self.constant
    }

    /// True when only diagonal `F` entries are declared.
    pub fn is_diag_f(&self) -> bool {
        self.diag_f
    }

    pub fn scratch(&self) -> ModelScratch {
        ModelScratch {
            defs: vec![0.0; self.defs.len()],
            stack: Vec::with_capacity(16),
        }
    }

    fn eval_defs(&self, t: f64, y: &[f64], scratch: &mut ModelScratch) {
        let m = self.deme_names.len();
        for i in 0..self.defs.len() {
            let v = {
                let env = EvalEnv {
                    params: self.params.values(),
                    demes: &y[..m],
                    aux: &y[m..],
                    defs: &scratch.defs[..i],
                    t,
                };
                self.defs[i].eval(&env, &mut scratch.stack)
            };
            scratch.defs[i] = v;
        }
    }

    /// Writes `dy/dt` for the concatenated state `y = [demes; aux]`.
    pub fn rhs(&self, t: f64, y: &[f64], out: &mut [f64], scratch: &mut ModelScratch) {
        let m = self.deme_names.len();
        self.eval_defs(t, y, scratch);
        out.fill(0.0);
        let env = EvalEnv {
            params: self.params.values(),
            demes: &y[..m],
            aux: &y[m..],
            defs: &scratch.defs,
            t,
        };
        for e in &self.f_entries {
            out[e.col] += e.expr.eval(&env, &mut scratch.stack);
        }
        for e in &self.g_entries {
            let v = e.expr.eval(&env, &mut scratch.stack);
            out[e.col] += v;
            out[e.row] -= v;
        }
        for (i, expr) in &self.d_entries {
            out[*i] -= expr.eval(&env, &mut scratch.stack);
        }
        for (i, expr) in &self.dot_entries {
            out[m + *i] = expr.eval(&env, &mut scratch.stack);
        }
    }

    /// Instantiates the `F` and `G` matrices at state `y`.
    pub fn frame_at(
        &self,
        t: f64,
        y: &[f64],
        f: &mut Array2<f64>,
        g: &mut Array2<f64>,
        scratch: &mut ModelScratch,
    ) {
        let m = self.deme_names.len();
        self.eval_defs(t, y, scratch);
        f.fill(0.0);
        g.fill(0.0);
        let env = EvalEnv {
            params: self.params.values(),
            demes: &y[..m],
            aux: &y[m..],
            defs: &scratch.defs,
            t,
        };
        for e in &self.f_entries {
            f[(e.row, e.col)] = e.expr.eval(&env, &mut scratch.stack);
        }
        for e in &self.g_entries {
            g[(e.row, e.col)] = e.expr.eval(&env, &mut scratch.stack);
        }
    }
}

fn push_unique(set: &mut Vec<String>, name: &str) {
    if !set.iter().any(|d| d == name) {
        set.push(name.to_string());
    }
}
