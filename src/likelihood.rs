use anyhow::Result;

use crate::ancestral;
use crate::error::ScoalError;
use crate::model::PopModel;
use crate::probs::StateProbabilities;
use crate::trajectory::{self, Frame, TimeSeries};
use crate::tree::{EventKind, Tree, TreeIntervals};
use crate::vector::{matvec, VecOps};

/// Per-interval contribution policy. With `Events`, only sampling and
/// coalescence terms enter the likelihood. `Full` adds the time-integrated
/// `-λ_total·Δ` term plus mean-field diffusion of the lineage vectors
/// within each segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalMode {
    Events,
    Full,
}

impl IntervalMode {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "events" => Ok(IntervalMode::Events),
            "full" => Ok(IntervalMode::Full),
            other => Err(ScoalError::Config(format!(
                "unknown intervalMode '{other}' (expected events or full)"
            ))
            .into()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LikelihoodOpts {
    pub finite_size_corrections: bool,
    pub approx_lambda: bool,
    pub forgive_a_gt_y: f64,
    pub penalty_a_gt_y: f64,
    pub forgive_y: bool,
    pub forgive_t0: bool,
    pub min_p: Option<f64>,
    pub is_constant_lh: bool,
    pub ancestral: bool,
    pub interval_mode: IntervalMode,
    pub ne: Option<f64>,
}

impl Default for LikelihoodOpts {
    fn default() -> Self {
        Self {
            finite_size_corrections: false,
            approx_lambda: false,
            forgive_a_gt_y: 1.0,
            penalty_a_gt_y: 1.0,
            forgive_y: true,
            forgive_t0: true,
            min_p: Some(1e-4),
            is_constant_lh: false,
            ancestral: false,
            interval_mode: IntervalMode::Events,
            ne: None,
        }
    }
}

const Y_FLOOR: f64 = 1e-12;

/// Scratch vectors shared by the event and segment kernels.
#[derive(Debug, Clone, Default)]
pub struct KernelScratch {
    y: Vec<f64>,
    pu: Vec<f64>,
    pv: Vec<f64>,
    parent: Vec<f64>,
    va: Vec<f64>,
    vb: Vec<f64>,
    vc: Vec<f64>,
}

impl KernelScratch {
    fn new(m: usize) -> Self {
        Self {
            y: vec![0.0; m],
            pu: vec![0.0; m],
            pv: vec![0.0; m],
            parent: vec![0.0; m],
            va: vec![0.0; m],
            vb: vec![0.0; m],
            vc: vec![0.0; m],
        }
    }
}

/// Read-only context shared by kernel callbacks.
pub struct KernelEnv<'a> {
    pub opts: &'a LikelihoodOpts,
    pub diag_f: bool,
    pub phi_diag: Option<&'a [f64]>,
    pub node_state: &'a [i32],
}

/// The two event handlers are identical across kernels; only the treatment
/// of the time between events varies.
pub trait LikelihoodKernel {
    fn on_segment(
        &self,
        dt: f64,
        frame: &Frame,
        env: &KernelEnv,
        probs: &mut StateProbabilities,
        scratch: &mut KernelScratch,
    ) -> f64;

    fn on_sample(
        &self,
        node: usize,
        env: &KernelEnv,
        probs: &mut StateProbabilities,
    ) -> Result<()> {
        process_sample_event(node, env, probs)
    }

    fn on_coalescent(
        &self,
        node: usize,
        children: (usize, usize),
        frame: &Frame,
        env: &KernelEnv,
        probs: &mut StateProbabilities,
        scratch: &mut KernelScratch,
    ) -> Result<f64> {
        process_coal_event(node, children, frame, env, probs, scratch)
    }
}

/// Lineage vectors ride through intervals unchanged; the interval itself
/// contributes nothing.
pub struct EventsKernel;

impl LikelihoodKernel for EventsKernel {
    fn on_segment(
        &self,
        _dt: f64,
        _frame: &Frame,
        _env: &KernelEnv,
        _probs: &mut StateProbabilities,
        _scratch: &mut KernelScratch,
    ) -> f64 {
        0.0
    }
}

/// Opt-in mode: accumulates `-λ_total·Δ` per segment and transports each
/// lineage vector by one Euler step of the mean-field diffusion
/// `dp/dτ = (M − diag(λ_ℓ))·p` with `M_ij = G_ji/Y_j`.
pub struct FullKernel;

impl LikelihoodKernel for FullKernel {
    fn on_segment(
        &self,
        dt: f64,
        frame: &Frame,
        env: &KernelEnv,
        probs: &mut StateProbabilities,
        scratch: &mut KernelScratch,
    ) -> f64 {
        let lambda_total = calc_total_coal(probs, frame, env.opts, env.diag_f, scratch);
        let m = probs.num_states();
        scratch.y.copy_from_slice(&frame.y);
        scratch.y.max_assign(Y_FLOOR);
        scratch.va.copy_from_slice(probs.lineage_state_sum());

        let y = std::mem::take(&mut scratch.y);
        let a = std::mem::take(&mut scratch.va);
        let mut diff = std::mem::take(&mut scratch.vb);
        let mut lam = std::mem::take(&mut scratch.vc);
        let mut flow = std::mem::take(&mut scratch.parent);
        let min_p = env.opts.min_p;
        probs.update_extant(|_, p| {
            for i in 0..m {
                diff[i] = (a[i] - p[i]) / y[i];
            }
            matvec(&frame.f, &diff, &mut lam);
            for i in 0..m {
                lam[i] /= y[i];
            }
            for i in 0..m {
                let mut acc = 0.0;
                for j in 0..m {
                    acc += frame.g[(j, i)] * p[j] / y[j];
                }
                flow[i] = acc;
            }
            for i in 0..m {
                p[i] += dt * (flow[i] - lam[i] * p[i]);
                if p[i] < 0.0 {
                    p[i] = 0.0;
                }
            }
            if let Some(floor) = min_p {
                p.max_assign(floor);
            }
            p.normalise();
        });
        scratch.y = y;
        scratch.va = a;
        scratch.vb = diff;
        scratch.vc = lam;
        scratch.parent = flow;

        -lambda_total * dt
    }
}

fn invariant_err(msg: impl Into<String>) -> anyhow::Error {
    ScoalError::Invariant(msg.into()).into()
}

fn process_sample_event(
    node: usize,
    env: &KernelEnv,
    probs: &mut StateProbabilities,
) -> Result<()> {
    let state = *env
        .node_state
        .get(node)
        .ok_or_else(|| invariant_err(format!("node {node} out of range")))?;
    if state < 0 {
        return Err(invariant_err(format!(
            "sample event at node {node} without a deme assignment"
        )));
    }
    probs.add_sample(node, state as usize, env.opts.min_p)?;
    if env.opts.ancestral {
        probs.store_ancestral(node)?;
    }
    Ok(())
}

/// Pair-coalescence contribution at the current frame; inserts the parent
/// lineage and removes the children. Returns `log λ` (or `-inf` when the
/// pair rate vanishes).
fn process_coal_event(
    node: usize,
    children: (usize, usize),
    frame: &Frame,
    env: &KernelEnv,
    probs: &mut StateProbabilities,
    scratch: &mut KernelScratch,
) -> Result<f64> {
    let m = probs.num_states();
    probs.copy_pair(children.0, children.1, &mut scratch.pu, &mut scratch.pv)?;
    scratch.y.copy_from_slice(&frame.y);
    scratch
        .y
        .max_assign(if env.opts.forgive_y { 1.0 } else { Y_FLOOR });

    if env.diag_f {
        for i in 0..m {
            let phi = match env.phi_diag {
                Some(phi) => phi[i],
                None => frame.f[(i, i)] / scratch.y[i] / scratch.y[i],
            };
            scratch.parent[i] = 2.0 * scratch.pu[i] * scratch.pv[i] * phi;
        }
    } else {
        scratch.pu.div_assign_elem(&scratch.y);
        scratch.pv.div_assign_elem(&scratch.y);
        matvec(&frame.f, &scratch.pv, &mut scratch.va);
        matvec(&frame.f, &scratch.pu, &mut scratch.vb);
        for i in 0..m {
            scratch.parent[i] =
                scratch.pu[i] * scratch.va[i] + scratch.pv[i] * scratch.vb[i];
        }
    }

    let pair_coal = scratch.parent.vsum();
    if !(pair_coal > 0.0) || !pair_coal.is_finite() {
        return Ok(f64::NEG_INFINITY);
    }
    scratch.parent.scale_assign(1.0 / pair_coal);

    probs.add_lineage(node, &scratch.parent)?;
    if env.opts.ancestral {
        probs.store_ancestral(node)?;
    }
    probs.remove_lineage(children.0)?;
    probs.remove_lineage(children.1)?;

    if env.opts.finite_size_corrections {
        finite_size_corrections(node, &scratch.parent, probs);
    }
    Ok(pair_coal.ln())
}

/// First-order posterior adjustment of the other extant lineages after the
/// pair that produced `p_alpha` left the pool.
fn finite_size_corrections(alpha: usize, p_alpha: &[f64], probs: &mut StateProbabilities) {
    let m = probs.num_states();
    let a = probs.lineage_state_sum().to_vec();
    let mut w = vec![0.0; m];
    probs.update_extant(|node, p| {
        if node == alpha {
            return;
        }
        // lterm = (A ⊘ B)·p_alpha, w = max(lterm − p_alpha ⊘ B, 0), B = A − p
        let mut lterm = 0.0;
        for i in 0..m {
            let b = (a[i] - p[i]).max(Y_FLOOR);
            w[i] = p_alpha[i] / b;
            lterm += a[i] / b * p_alpha[i];
        }
        w.rsub_assign(lterm);
        w.max_assign(0.0);
        let s = p.vdot(&w);
        if s > 0.0 {
            p.mul_assign_elem(&w);
            p.scale_assign(1.0 / s);
        }
    });
}

/// Aggregate coalescence rate over the extant set at one frame.
fn calc_total_coal(
    probs: &mut StateProbabilities,
    frame: &Frame,
    opts: &LikelihoodOpts,
    diag_f: bool,
    scratch: &mut KernelScratch,
) -> f64 {
    let num_extant = probs.num_extant();
    if num_extant < 2 {
        return 0.0;
    }
    let m = probs.num_states();
    scratch.y.copy_from_slice(&frame.y);
    scratch.y.max_assign(Y_FLOOR);

    if opts.approx_lambda {
        // (A ⊘ Y)ᵀ F (A ⊘ Y)
        scratch.va.copy_from_slice(probs.lineage_state_sum());
        scratch.va.div_assign_elem(&scratch.y);
        matvec(&frame.f, &scratch.va, &mut scratch.vb);
        return scratch.va.vdot(&scratch.vb);
    }

    if diag_f {
        scratch.va.copy_from_slice(probs.lineage_state_sum());
        scratch.va.square_assign();
        scratch.vb.copy_from_slice(probs.lineage_sum_squares());
        scratch.va.sub_assign_elem(&scratch.vb);
        let mut total = 0.0;
        for i in 0..m {
            total += scratch.va[i] * frame.f[(i, i)] / (scratch.y[i] * scratch.y[i]);
        }
        return total;
    }

    // exact: sum the bilinear pair form over all unordered extant pairs
    let mut total = 0.0;
    let nodes = probs.extant_nodes().to_vec();
    for (idx, &u) in nodes.iter().enumerate() {
        let pu = probs.probs(u).expect("extant").to_vec();
        for &v in &nodes[idx + 1..] {
            let pv = probs.probs(v).expect("extant");
            for i in 0..m {
                scratch.pu[i] = pu[i] / scratch.y[i];
                scratch.pv[i] = pv[i] / scratch.y[i];
            }
            matvec(&frame.f, &scratch.pv, &mut scratch.va);
            matvec(&frame.f, &scratch.pu, &mut scratch.vb);
            for i in 0..m {
                total += scratch.pu[i] * scratch.va[i] + scratch.pv[i] * scratch.vb[i];
            }
        }
    }
    total
}

/// Aggregate coalescence rate at one frame with fresh scratch; the engine
/// itself goes through the buffered internal path.
pub fn total_coalescent_rate(
    probs: &mut StateProbabilities,
    frame: &Frame,
    opts: &LikelihoodOpts,
    diag_f: bool,
) -> f64 {
    let mut scratch = KernelScratch::new(probs.num_states());
    calc_total_coal(probs, frame, opts, diag_f, &mut scratch)
}

// ── backward walk ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct Cursor {
    h: f64,
    t: f64,
    ts_point: usize,
}

/// Advances the cursor by `duration`, crossing trajectory grid boundaries
/// and handing each sub-segment to the kernel. Each segment is evaluated at
/// the frame at-or-below its older endpoint.
fn process_interval(
    kernel: &dyn LikelihoodKernel,
    duration: f64,
    ts: &TimeSeries,
    cur: &mut Cursor,
    env: &KernelEnv,
    probs: &mut StateProbabilities,
    scratch: &mut KernelScratch,
) -> f64 {
    let t_end = ts.end_time();
    let h_event = cur.h + duration;
    let t_event = t_end - h_event;
    let mut lh = 0.0;
    loop {
        if cur.ts_point == 0 {
            break;
        }
        let t_here = ts.time(cur.ts_point);
        let below = if t_here < cur.t {
            t_here
        } else {
            ts.time(cur.ts_point - 1)
        };
        if below <= t_event {
            break;
        }
        if t_here >= cur.t {
            cur.ts_point -= 1;
        }
        let seg = cur.t - below;
        if seg > 0.0 {
            lh += kernel.on_segment(seg, ts.frame(cur.ts_point), env, probs, scratch);
            if lh == f64::NEG_INFINITY || lh.is_nan() {
                return lh;
            }
        }
        cur.h += seg;
        cur.t = below;
    }
    cur.ts_point = ts.frame_index_at_time(t_event, cur.ts_point);
    let seg = h_event - cur.h;
    if seg > 0.0 {
        lh += kernel.on_segment(seg, ts.frame(cur.ts_point), env, probs, scratch);
    }
    cur.h = h_event;
    cur.t = t_end - h_event;
    lh
}

struct WalkResult {
    log_p: f64,
    probs: StateProbabilities,
    completed: bool,
}

fn diagnose(interval: usize, cur: &Cursor, msg: &str) {
    eprintln!(
        "scoal: logP -> -inf at interval {interval} (t = {:.6}, h = {:.6}): {msg}",
        cur.t, cur.h
    );
}

#[allow(clippy::too_many_arguments)]
fn run_backward_walk(
    ts: &TimeSeries,
    intervals: &TreeIntervals,
    tree: &Tree,
    node_state: &[i32],
    opts: &LikelihoodOpts,
    diag_f: bool,
    constant: bool,
) -> Result<WalkResult> {
    let m = ts.frame(0).y.len();
    let mut probs = StateProbabilities::new(tree.n_nodes, m);
    let mut scratch = KernelScratch::new(m);

    // constant diagonal-F models reuse phi = F_ii / Y_i^2 from the latest
    // frame for every coalescent event
    let phi_diag: Option<Vec<f64>> = if constant && diag_f {
        let frame = ts.frame(ts.len() - 1);
        Some(
            (0..m)
                .map(|i| frame.f[(i, i)] / (frame.y[i] * frame.y[i]))
                .collect(),
        )
    } else {
        None
    };
    let env = KernelEnv {
        opts,
        diag_f,
        phi_diag: phi_diag.as_deref(),
        node_state,
    };
    let kernel: &dyn LikelihoodKernel = match opts.interval_mode {
        IntervalMode::Events => &EventsKernel,
        IntervalMode::Full => &FullKernel,
    };

    let count = intervals.count();
    let n_leaves = tree.n_tips as f64;
    let traj_duration = ts.end_time() - ts.start_time();
    let mut cur = Cursor {
        h: 0.0,
        t: ts.end_time(),
        ts_point: ts.len() - 1,
    };
    let mut log_p = 0.0;
    let mut interval = 0usize;

    while interval < count {
        let duration = intervals.duration(interval);
        if traj_duration < cur.h + duration {
            break;
        }
        let mut lh_interval =
            process_interval(kernel, duration, ts, &mut cur, &env, &mut probs, &mut scratch);
        if lh_interval.is_nan() || lh_interval == f64::NEG_INFINITY {
            diagnose(interval, &cur, "interval contribution is not finite");
            return Ok(WalkResult {
                log_p: f64::NEG_INFINITY,
                probs,
                completed: false,
            });
        }

        // A > Y guard
        let num_extant = probs.num_extant() as f64;
        let y_sum = ts.frame(cur.ts_point).y.vsum();
        let ym_a = y_sum - num_extant;
        if ym_a < 0.0 {
            if num_extant / n_leaves > opts.forgive_a_gt_y {
                diagnose(interval, &cur, "extant lineages exceed total population size");
                return Ok(WalkResult {
                    log_p: f64::NEG_INFINITY,
                    probs,
                    completed: false,
                });
            }
            lh_interval += lh_interval * ym_a.abs() * opts.penalty_a_gt_y;
        }
        log_p += lh_interval;
        if log_p == f64::NEG_INFINITY {
            diagnose(interval, &cur, "collapsed before processing the event");
            return Ok(WalkResult {
                log_p,
                probs,
                completed: false,
            });
        }

        let node = intervals.event_node(interval);
        match intervals.event_kind(interval) {
            EventKind::Sample => kernel.on_sample(node, &env, &mut probs)?,
            EventKind::Coalescent => {
                let ch = &tree.children[node];
                let contrib = kernel.on_coalescent(
                    node,
                    (ch[0], ch[1]),
                    ts.frame(cur.ts_point),
                    &env,
                    &mut probs,
                    &mut scratch,
                )?;
                log_p += contrib;
            }
        }
        if log_p.is_nan() {
            diagnose(interval, &cur, "log-likelihood became NaN after the event");
            return Ok(WalkResult {
                log_p: f64::NEG_INFINITY,
                probs,
                completed: false,
            });
        }
        if log_p == f64::NEG_INFINITY {
            diagnose(interval, &cur, "log-likelihood collapsed after the event");
            return Ok(WalkResult {
                log_p,
                probs,
                completed: false,
            });
        }
        interval += 1;
    }

    if interval < count {
        // root predates the trajectory start: finish the broken interval up
        // to t0, then price the remainder with a constant-size coalescent
        let first_part = traj_duration - cur.h;
        let lh_interval =
            process_interval(kernel, first_part, ts, &mut cur, &env, &mut probs, &mut scratch);
        if lh_interval.is_nan() || lh_interval == f64::NEG_INFINITY {
            diagnose(interval, &cur, "interval contribution is not finite");
            return Ok(WalkResult {
                log_p: f64::NEG_INFINITY,
                probs,
                completed: false,
            });
        }
        log_p += lh_interval;

        let remaining = intervals.duration(interval) - first_part;
        // the event count, not the active lineage count, sets the tail's
        // lineage number
        let n_lineages = count as f64;
        let comb = n_lineages * (n_lineages - 1.0) / 2.0;
        let mut ne = opts.ne.unwrap_or(-1.0);
        if ne <= 0.0 {
            let lambda = calc_total_coal(&mut probs, ts.frame(cur.ts_point), opts, diag_f, &mut scratch);
            ne = comb / lambda;
        }
        log_p += (1.0 / ne).ln() - comb / ne * remaining;
        interval += 1;
        while interval < count {
            let d = intervals.duration(interval);
            let coef = n_lineages * (n_lineages - 1.0) / ne;
            log_p += (1.0 / ne).ln() - coef * d;
            interval += 1;
        }
        if !log_p.is_finite() {
            eprintln!("scoal: logP -> -inf in the constant-size coalescent tail");
            return Ok(WalkResult {
                log_p: f64::NEG_INFINITY,
                probs,
                completed: false,
            });
        }
        return Ok(WalkResult {
            log_p,
            probs,
            completed: false,
        });
    }

    Ok(WalkResult {
        log_p,
        probs,
        completed: true,
    })
}

// ── engine ─────────────────────────────────────────────────────

/// Marginal likelihood of a dated tree under a structured coalescent whose
/// deme sizes follow the model's ODE trajectory. One instance serves many
/// evaluations; recomputation happens only when a dirty bit is set.
pub struct StructuredTreeLikelihood {
    model: PopModel,
    tree: Tree,
    opts: LikelihoodOpts,
    node_state: Vec<i32>,
    intervals: Option<TreeIntervals>,
    ts: Option<TimeSeries>,
    probs: Option<StateProbabilities>,
    root_probs: Option<Vec<f64>>,
    log_p: f64,
    needs_update: bool,
    tree_dirty: bool,
    integration_failed: bool,
    last_t0: f64,
}

impl StructuredTreeLikelihood {
    /// `node_state[n]` is the deme index of tip `n`, `-1` for internal
    /// nodes.
    pub fn new(
        model: PopModel,
        tree: Tree,
        opts: LikelihoodOpts,
        node_state: Vec<i32>,
    ) -> Result<Self> {
        if node_state.len() != tree.n_nodes {
            return Err(invariant_err("node_state length does not match the tree"));
        }
        let m = model.num_demes() as i32;
        for (node, &s) in node_state.iter().enumerate() {
            if tree.is_leaf(node) {
                if s < 0 || s >= m {
                    return Err(ScoalError::Config(format!(
                        "tip {node} has no valid deme assignment"
                    ))
                    .into());
                }
            } else if s >= 0 {
                return Err(invariant_err(format!(
                    "internal node {node} carries a sample state"
                )));
            }
        }
        if let Some(min_p) = opts.min_p {
            if !(min_p > 0.0 && min_p <= 0.1) {
                return Err(ScoalError::Config(
                    "minP must lie in (0, 0.1]".to_string(),
                )
                .into());
            }
        }
        Ok(Self {
            model,
            tree,
            opts,
            node_state,
            intervals: None,
            ts: None,
            probs: None,
            root_probs: None,
            log_p: f64::NEG_INFINITY,
            needs_update: true,
            tree_dirty: true,
            integration_failed: false,
            last_t0: f64::NAN,
        })
    }

    pub fn calculate_log_p(&mut self) -> Result<f64> {
        if self.needs_update || self.model.params.is_dirty() || self.tree_dirty {
            self.recompute()?;
            self.needs_update = false;
        }
        Ok(self.log_p)
    }

    pub fn set_parameter(&mut self, name: &str, value: f64) -> Result<()> {
        self.model.params.set(name, value)
    }

    pub fn mark_parameters_dirty(&mut self) {
        self.model.params.mark_dirty();
    }

    pub fn mark_tree_dirty(&mut self) {
        self.tree_dirty = true;
    }

    /// The enclosing driver may roll back state without telling us what
    /// changed; force a fresh evaluation.
    pub fn restore(&mut self) {
        self.needs_update = true;
    }

    pub fn root_probs(&self) -> Option<&[f64]> {
        self.root_probs.as_deref()
    }

    pub fn state_probabilities(&self) -> Option<&StateProbabilities> {
        self.probs.as_ref()
    }

    pub fn ancestral_probs(&self, node: usize) -> Option<&[f64]> {
        self.probs.as_ref().and_then(|p| p.ancestral(node))
    }

    /// True when the last evaluation returned `-inf` because the trajectory
    /// itself failed to integrate.
    pub fn integration_failed(&self) -> bool {
        self.integration_failed
    }

    pub fn num_demes(&self) -> usize {
        self.model.num_demes()
    }

    pub fn deme_names(&self) -> &[String] {
        self.model.deme_names()
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    fn integrate_current(&mut self, spec: &trajectory::TrajectorySpec) -> bool {
        match trajectory::integrate(&self.model, spec) {
            Ok(ts) => {
                self.ts = Some(ts);
                self.last_t0 = spec.t0;
                true
            }
            Err(e) => {
                self.integration_failed = true;
                self.ts = None;
                eprintln!("scoal: trajectory integration failed: {e}");
                false
            }
        }
    }

    fn recompute(&mut self) -> Result<()> {
        self.integration_failed = false;
        self.root_probs = None;

        if self.tree_dirty || self.intervals.is_none() {
            self.intervals = Some(TreeIntervals::build(&self.tree)?);
            self.tree_dirty = false;
        }
        let total_duration = self
            .intervals
            .as_ref()
            .expect("built above")
            .total_duration();

        // the likelihood is pinned at zero, but the trajectory is still
        // produced so downstream loggers see a consistent model state
        if self.opts.is_constant_lh {
            if self.ts.is_none() || self.model.params.is_dirty() {
                let spec = self.model.traj;
                if !self.integrate_current(&spec) {
                    self.model.params.clear_dirty();
                    self.log_p = f64::NEG_INFINITY;
                    return Ok(());
                }
            }
            self.model.params.clear_dirty();
            self.log_p = 0.0;
            return Ok(());
        }

        let mut spec = self.model.traj;
        if spec.t1 - spec.t0 < total_duration {
            if self.model.is_constant() {
                // constant models simply extend the window back to the root
                spec.t0 = spec.t1 - total_duration;
            } else if self.opts.forgive_t0 {
                eprintln!(
                    "scoal: tree root predates t0; constant-size coalescent over t[{:.4}, {:.4}]",
                    spec.t1 - total_duration,
                    spec.t0
                );
            } else {
                self.model.params.clear_dirty();
                self.log_p = f64::NEG_INFINITY;
                return Ok(());
            }
        }

        if self.ts.is_none() || self.model.params.is_dirty() || self.last_t0 != spec.t0 {
            if !self.integrate_current(&spec) {
                self.model.params.clear_dirty();
                self.log_p = f64::NEG_INFINITY;
                return Ok(());
            }
        }
        self.model.params.clear_dirty();

        let ts = self.ts.as_ref().expect("integrated above");
        let intervals = self.intervals.as_ref().expect("built above");
        let mut result = run_backward_walk(
            ts,
            intervals,
            &self.tree,
            &self.node_state,
            &self.opts,
            self.model.is_diag_f(),
            self.model.is_constant(),
        )?;

        self.root_probs = result.probs.root_probs().map(|p| p.to_vec());

        if self.opts.ancestral {
            if result.completed && result.log_p != f64::NEG_INFINITY {
                ancestral::reconstruct(ts, intervals, &self.tree, &mut result.probs)?;
            } else {
                eprintln!("scoal: skipping ancestral reconstruction: root state unknown");
            }
        }

        self.probs = Some(result.probs);
        self.log_p = if result.log_p.is_finite() {
            result.log_p
        } else {
            f64::NEG_INFINITY
        };
        Ok(())
    }
}
