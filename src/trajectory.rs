use anyhow::Result;
use ndarray::Array2;

use crate::error::ScoalError;
use crate::model::{ModelScratch, PopModel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Euler,
    Midpoint,
    ClassicRk,
}

impl Method {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "euler" => Ok(Method::Euler),
            "midpoint" => Ok(Method::Midpoint),
            "classicrk" => Ok(Method::ClassicRk),
            other => Err(ScoalError::Config(format!(
                "unknown integration method '{other}' (expected euler, midpoint or classicrk)"
            ))
            .into()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TrajectorySpec {
    pub method: Method,
    pub steps: usize,
    pub t0: f64,
    pub t1: f64,
}

/// One grid point of the integrated trajectory: deme sizes `y`, auxiliary
/// state, and the instantiated rate matrices.
#[derive(Debug, Clone)]
pub struct Frame {
    pub t: f64,
    pub y: Vec<f64>,
    pub aux: Vec<f64>,
    pub f: Array2<f64>,
    pub g: Array2<f64>,
}

/// Immutable, forward-time-ascending sequence of frames. The likelihood
/// walk consumes it in reverse; the ancestral sweep re-reads it forward.
#[derive(Debug, Clone)]
pub struct TimeSeries {
    frames: Vec<Frame>,
}

impl TimeSeries {
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frame(&self, k: usize) -> &Frame {
        &self.frames[k]
    }

    pub fn time(&self, k: usize) -> f64 {
        self.frames[k].t
    }

    pub fn start_time(&self) -> f64 {
        self.frames[0].t
    }

    pub fn end_time(&self) -> f64 {
        self.frames[self.frames.len() - 1].t
    }

    /// Largest `k` with `t_k <= t_query`, clamped to the grid. `hint` is the
    /// index returned by the previous query; the scan walks from it in
    /// whichever direction is needed, so a monotone pass over the grid costs
    /// `O(N + E)` overall.
    pub fn frame_index_at_time(&self, t_query: f64, hint: usize) -> usize {
        let last = self.frames.len() - 1;
        let mut k = hint.min(last);
        while k > 0 && self.frames[k].t > t_query {
            k -= 1;
        }
        while k < last && self.frames[k + 1].t <= t_query {
            k += 1;
        }
        k
    }
}

fn integration_err(msg: String) -> anyhow::Error {
    ScoalError::Integration(msg).into()
}

/// Integrates the population ODE over `[spec.t0, spec.t1]` with a fixed
/// step count, producing `steps + 1` frames including both endpoints.
/// Deme entries are clamped to non-negative after each accepted step.
pub fn integrate(model: &PopModel, spec: &TrajectorySpec) -> Result<TimeSeries> {
    if spec.steps == 0 {
        return Err(integration_err("integrationSteps must be >= 1".into()));
    }
    if !(spec.t1 > spec.t0) {
        return Err(integration_err(format!(
            "bad integration window [{}, {}]",
            spec.t0, spec.t1
        )));
    }

    let m = model.num_demes();
    let n = model.state_len();
    let h = (spec.t1 - spec.t0) / spec.steps as f64;

    let mut scratch = model.scratch();
    let mut state = model.initial_state().to_vec();
    let mut k1 = vec![0.0; n];
    let mut k2 = vec![0.0; n];
    let mut k3 = vec![0.0; n];
    let mut k4 = vec![0.0; n];
    let mut tmp = vec![0.0; n];

    let mut frames = Vec::with_capacity(spec.steps + 1);
    push_frame(model, spec.t0, &state, &mut scratch, &mut frames)?;

    for step in 0..spec.steps {
        let t = spec.t0 + h * step as f64;
        match spec.method {
            Method::Euler => {
                model.rhs(t, &state, &mut k1, &mut scratch);
                for i in 0..n {
                    state[i] += h * k1[i];
                }
            }
            Method::Midpoint => {
                model.rhs(t, &state, &mut k1, &mut scratch);
                for i in 0..n {
                    tmp[i] = state[i] + 0.5 * h * k1[i];
                }
                model.rhs(t + 0.5 * h, &tmp, &mut k2, &mut scratch);
                for i in 0..n {
                    state[i] += h * k2[i];
                }
            }
            Method::ClassicRk => {
                model.rhs(t, &state, &mut k1, &mut scratch);
                for i in 0..n {
                    tmp[i] = state[i] + 0.5 * h * k1[i];
                }
                model.rhs(t + 0.5 * h, &tmp, &mut k2, &mut scratch);
                for i in 0..n {
                    tmp[i] = state[i] + 0.5 * h * k2[i];
                }
                model.rhs(t + 0.5 * h, &tmp, &mut k3, &mut scratch);
                for i in 0..n {
                    tmp[i] = state[i] + h * k3[i];
                }
                model.rhs(t + h, &tmp, &mut k4, &mut scratch);
                for i in 0..n {
                    state[i] += h / 6.0 * (k1[i] + 2.0 * k2[i] + 2.0 * k3[i] + k4[i]);
                }
            }
        }
        // post-clamp demes; aux variables are left signed
        for v in state[..m].iter_mut() {
            if *v < 0.0 {
                *v = 0.0;
            }
        }
        let t_next = if step + 1 == spec.steps {
            spec.t1
        } else {
            spec.t0 + h * (step + 1) as f64
        };
        push_frame(model, t_next, &state, &mut scratch, &mut frames)?;
    }

    Ok(TimeSeries { frames })
}

fn push_frame(
    model: &PopModel,
    t: f64,
    state: &[f64],
    scratch: &mut ModelScratch,
    frames: &mut Vec<Frame>,
) -> Result<()> {
    let m = model.num_demes();
    if state.iter().any(|v| !v.is_finite()) {
        return Err(integration_err(format!(
            "non-finite state at t = {t}: {state:?}"
        )));
    }
    let mut f = Array2::zeros((m, m));
    let mut g = Array2::zeros((m, m));
    model.frame_at(t, state, &mut f, &mut g, scratch);
    if f.iter().chain(g.iter()).any(|v| !v.is_finite()) {
        return Err(integration_err(format!("non-finite rate matrix at t = {t}")));
    }
    frames.push(Frame {
        t,
        y: state[..m].to_vec(),
        aux: state[m..].to_vec(),
        f,
        g,
    });
    Ok(())
}
