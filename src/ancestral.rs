use anyhow::Result;

use crate::error::ScoalError;
use crate::probs::StateProbabilities;
use crate::trajectory::TimeSeries;
use crate::tree::{EventKind, Tree, TreeIntervals};
use crate::vector::{matvec, vecmat, VecOps};

const Y_FLOOR: f64 = 1e-12;

/// Forward sweep over the interval sequence computing posterior state
/// probabilities for every node. Requires a completed backward walk whose
/// per-node vectors sit in the ancestral store; they are taken out, and the
/// store is refilled with the posteriors.
///
/// At each coalescence (walking from the root towards the tips) the parent
/// posterior splits into two children via `½(p + normalise(p·F))`; between
/// events all forward-extant vectors ride the transposed migration operator
/// on the trajectory grid; at each event node the forward vector is
/// multiplied by the stored backward vector and renormalised.
pub fn reconstruct(
    ts: &TimeSeries,
    intervals: &TreeIntervals,
    tree: &Tree,
    probs: &mut StateProbabilities,
) -> Result<()> {
    let m = probs.num_states();
    let backward = probs.clear_ancestral();
    let count = intervals.count();
    let t_end = ts.end_time();

    let mut interval = count - 1;
    let root = intervals.event_node(interval);
    let p_root = probs.remove_lineage(root)?;
    probs.store_ancestral_vec(root, p_root.clone());

    let mut p_parent = p_root;
    let mut t1 = t_end - intervals.time_of(interval);
    let mut ts_point = 0usize;
    let mut pc = vec![0.0; m];

    while interval > 0 {
        let duration = intervals.duration(interval);
        let t0 = t1;
        t1 = t_end - intervals.time_of(interval - 1);

        ts_point = ts.frame_index_at_time(t0, ts_point);
        if intervals.event_kind(interval) == EventKind::Coalescent {
            let node = intervals.event_node(interval);
            let frame = ts.frame(ts_point);
            vecmat(&p_parent, &frame.f, &mut pc);
            pc.normalise();
            pc.add_assign_elem(&p_parent);
            pc.scale_assign(0.5);
            let ch = &tree.children[node];
            probs.add_lineage(ch[0], &pc)?;
            probs.add_lineage(ch[1], &pc)?;
        }

        if duration > 0.0 {
            transport_forward(ts, &mut ts_point, t0, t1, probs)?;
        }

        interval -= 1;
        let node = intervals.event_node(interval);
        let mut p = probs.remove_lineage(node)?;
        let back = backward[node].as_deref().ok_or_else(|| {
            anyhow::Error::from(ScoalError::Invariant(format!(
                "no backward vector stored for node {node}"
            )))
        })?;
        p.mul_assign_elem(back);
        p.normalise();
        probs.store_ancestral_vec(node, p.clone());
        p_parent = p;
    }
    Ok(())
}

/// One Euler step per trajectory grid cell of the forward ODE
/// `dp/dt = (Mᵀ − diag(λ_ℓ)) p`, `M_ij = G_ji/Y_j`, applied to each
/// forward-extant lineage separately: `λ_ℓ` excludes the lineage's own
/// mass from the aggregate, as in the backward diffusion.
fn transport_forward(
    ts: &TimeSeries,
    ts_point: &mut usize,
    t0: f64,
    t1: f64,
    probs: &mut StateProbabilities,
) -> Result<()> {
    let m = probs.num_states();
    let mut y = vec![0.0; m];
    let mut a = vec![0.0; m];
    let mut diff = vec![0.0; m];
    let mut lam = vec![0.0; m];
    let mut flow = vec![0.0; m];
    let mut t = t0;
    while t < t1 {
        let k = ts.frame_index_at_time(t, *ts_point);
        *ts_point = k;
        let t_next = if k + 1 < ts.len() {
            ts.time(k + 1).min(t1)
        } else {
            t1
        };
        let dt = t_next - t;
        if dt <= 0.0 {
            break;
        }
        let frame = ts.frame(k);
        y.copy_from_slice(&frame.y);
        y.max_assign(Y_FLOOR);
        a.copy_from_slice(probs.lineage_state_sum());
        probs.update_extant(|_, p| {
            for i in 0..m {
                diff[i] = (a[i] - p[i]) / y[i];
            }
            matvec(&frame.f, &diff, &mut lam);
            for i in 0..m {
                lam[i] /= y[i];
            }
            // (Mᵀ p)_i = Σ_j G_ij p_j / Y_i
            for i in 0..m {
                let mut acc = 0.0;
                for j in 0..m {
                    acc += frame.g[(i, j)] * p[j];
                }
                flow[i] = acc / y[i];
            }
            for i in 0..m {
                p[i] += dt * (flow[i] - lam[i] * p[i]);
                if p[i] < 0.0 {
                    p[i] = 0.0;
                }
            }
            p.normalise();
        });
        t = t_next;
    }
    Ok(())
}
