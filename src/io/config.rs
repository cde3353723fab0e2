use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::error::ScoalError;
use crate::likelihood::{IntervalMode, LikelihoodOpts, StructuredTreeLikelihood};
use crate::model::{Parameters, PopModel};
use crate::trajectory::{Method, TrajectorySpec};
use crate::tree::Tree;

/// One run's declarative input: the model's rate equations, parameter
/// bindings, the integration window, likelihood options, and tip-state
/// assignments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub model: ModelBlock,
    #[serde(default)]
    pub parameters: BTreeMap<String, f64>,
    pub trajectory: TrajectoryBlock,
    #[serde(default)]
    pub likelihood: LikelihoodBlock,
    #[serde(default, rename = "tipStates")]
    pub tip_states: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelBlock {
    #[serde(default)]
    pub name: Option<String>,
    /// Semicolon-terminated `name = expr` bindings, evaluated in order.
    #[serde(default)]
    pub definitions: String,
    /// Semicolon-terminated `F(i,j)= / G(i,j)= / D(i)= / dot(X)=` lines.
    pub equations: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Binding {
    pub name: String,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrajectoryBlock {
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(rename = "integrationSteps")]
    pub integration_steps: usize,
    pub t0: f64,
    #[serde(default)]
    pub t1: Option<f64>,
    /// Ordered: fixes the deme/aux index order.
    #[serde(rename = "initialValues")]
    pub initial_values: Vec<Binding>,
}

fn default_method() -> String {
    "classicrk".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LikelihoodBlock {
    #[serde(rename = "finiteSizeCorrections", default)]
    pub finite_size_corrections: bool,
    #[serde(rename = "approxLambda", default)]
    pub approx_lambda: bool,
    #[serde(rename = "forgiveAgtY", default = "one")]
    pub forgive_a_gt_y: f64,
    #[serde(rename = "penaltyAgtY", default = "one")]
    pub penalty_a_gt_y: f64,
    #[serde(rename = "forgiveY", default = "yes")]
    pub forgive_y: bool,
    #[serde(rename = "forgiveT0", default = "yes")]
    pub forgive_t0: bool,
    #[serde(rename = "minP", default = "default_min_p")]
    pub min_p: Option<f64>,
    /// Accepted for compatibility; a manually-managed implementation has
    /// nothing to collect.
    #[serde(default)]
    pub gc: u32,
    #[serde(rename = "isConstantLh", default)]
    pub is_constant_lh: bool,
    #[serde(default)]
    pub ancestral: bool,
    #[serde(rename = "intervalMode", default = "default_interval_mode")]
    pub interval_mode: String,
    #[serde(rename = "Ne", default)]
    pub ne: Option<f64>,
}

fn one() -> f64 {
    1.0
}

fn yes() -> bool {
    true
}

fn default_min_p() -> Option<f64> {
    Some(1e-4)
}

fn default_interval_mode() -> String {
    "events".to_string()
}

impl Default for LikelihoodBlock {
    fn default() -> Self {
        serde_json::from_str("{}").expect("all fields defaulted")
    }
}

fn config_err(msg: impl Into<String>) -> anyhow::Error {
    ScoalError::Config(msg.into()).into()
}

pub fn load_config(path: &Path) -> Result<RunConfig> {
    let file = File::open(path).with_context(|| format!("failed to open {:?}", path))?;
    let reader = BufReader::new(file);
    let config: RunConfig =
        serde_json::from_reader(reader).with_context(|| format!("failed to parse {:?}", path))?;
    Ok(config)
}

impl RunConfig {
    pub fn likelihood_opts(&self) -> Result<LikelihoodOpts> {
        let lh = &self.likelihood;
        if let Some(min_p) = lh.min_p {
            if !(min_p > 0.0 && min_p <= 0.1) {
                return Err(config_err(format!(
                    "minP must lie in (0, 0.1], got {min_p}"
                )));
            }
        }
        if !(0.0..=1.0).contains(&lh.forgive_a_gt_y) {
            return Err(config_err(format!(
                "forgiveAgtY must lie in [0, 1], got {}",
                lh.forgive_a_gt_y
            )));
        }
        if !lh.penalty_a_gt_y.is_finite() {
            return Err(config_err("penaltyAgtY must be finite"));
        }
        Ok(LikelihoodOpts {
            finite_size_corrections: lh.finite_size_corrections,
            approx_lambda: lh.approx_lambda,
            forgive_a_gt_y: lh.forgive_a_gt_y,
            penalty_a_gt_y: lh.penalty_a_gt_y,
            forgive_y: lh.forgive_y,
            forgive_t0: lh.forgive_t0,
            min_p: lh.min_p,
            is_constant_lh: lh.is_constant_lh,
            ancestral: lh.ancestral,
            interval_mode: IntervalMode::parse(&lh.interval_mode)?,
            ne: lh.ne,
        })
    }

    pub fn build_model(&self) -> Result<PopModel> {
        let traj = &self.trajectory;
        let t1 = traj
            .t1
            .ok_or_else(|| config_err("t1 must be provided in the trajectory block"))?;
        if !(t1 > traj.t0) {
            return Err(config_err(format!(
                "t1 ({t1}) must be greater than t0 ({})",
                traj.t0
            )));
        }
        if traj.integration_steps == 0 {
            return Err(config_err("integrationSteps must be >= 1"));
        }
        let spec = TrajectorySpec {
            method: Method::parse(&traj.method)?,
            steps: traj.integration_steps,
            t0: traj.t0,
            t1,
        };
        let params = Parameters::new(
            self.parameters
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
        );
        let initial_values: Vec<(String, f64)> = traj
            .initial_values
            .iter()
            .map(|b| (b.name.clone(), b.value))
            .collect();
        PopModel::new(
            &self.model.definitions,
            &self.model.equations,
            params,
            spec,
            &initial_values,
        )
    }

    pub fn build_engine(&self, tree: Tree) -> Result<StructuredTreeLikelihood> {
        let model = self.build_model()?;
        let opts = self.likelihood_opts()?;
        let node_state = resolve_tip_states(&tree, &self.tip_states, &model)?;
        StructuredTreeLikelihood::new(model, tree, opts, node_state)
    }
}

/// Maps each tip to its deme index: the explicit `tipStates` entry wins,
/// otherwise the suffix after the last `_` in the tip label is taken as the
/// deme name.
pub fn resolve_tip_states(
    tree: &Tree,
    tip_states: &BTreeMap<String, String>,
    model: &PopModel,
) -> Result<Vec<i32>> {
    let mut node_state = vec![-1i32; tree.n_nodes];
    for tip in 0..tree.n_tips {
        let label = &tree.tip_names[tip];
        let deme = match tip_states.get(label) {
            Some(d) => d.clone(),
            None => label
                .rsplit_once('_')
                .map(|(_, suffix)| suffix.to_string())
                .ok_or_else(|| {
                    config_err(format!(
                        "tip '{label}' has no tipStates entry and no '_deme' label suffix"
                    ))
                })?,
        };
        let idx = model.deme_index(&deme).ok_or_else(|| {
            config_err(format!("tip '{label}': '{deme}' is not a deme of the model"))
        })?;
        node_state[tip] = idx as i32;
    }
    Ok(node_state)
}
