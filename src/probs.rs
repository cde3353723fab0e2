use anyhow::Result;
use ndarray::Array2;

use crate::error::ScoalError;
use crate::vector::VecOps;

fn invariant_err(msg: impl Into<String>) -> anyhow::Error {
    ScoalError::Invariant(msg.into()).into()
}

/// Per-lineage state-probability vectors for the extant set of the interval
/// walk. Vectors live in one dense `m × capacity` buffer; a free list
/// recycles slots and a `node → slot` map gives O(1) lookup. The aggregate
/// caches (`A = Σ p`, `Σ p²`) are invalidated on every mutation.
#[derive(Debug, Clone)]
pub struct StateProbabilities {
    m: usize,
    buf: Vec<f64>,
    free: Vec<usize>,
    slot_of: Vec<i32>,
    extant: Vec<usize>,
    pos_in_extant: Vec<i32>,
    sum_cache: Option<Vec<f64>>,
    sumsq_cache: Option<Vec<f64>>,
    ancestral: Vec<Option<Vec<f64>>>,
}

impl StateProbabilities {
    pub fn new(n_nodes: usize, m: usize) -> Self {
        Self {
            m,
            buf: vec![0.0; n_nodes * m],
            free: (0..n_nodes).rev().collect(),
            slot_of: vec![-1; n_nodes],
            extant: Vec::with_capacity(n_nodes),
            pos_in_extant: vec![-1; n_nodes],
            sum_cache: None,
            sumsq_cache: None,
            ancestral: vec![None; n_nodes],
        }
    }

    pub fn num_states(&self) -> usize {
        self.m
    }

    pub fn num_extant(&self) -> usize {
        self.extant.len()
    }

    pub fn extant_nodes(&self) -> &[usize] {
        &self.extant
    }

    pub fn is_extant(&self, node: usize) -> bool {
        self.slot_of.get(node).map(|s| *s >= 0).unwrap_or(false)
    }

    pub fn probs(&self, node: usize) -> Result<&[f64]> {
        let slot = self.slot(node)?;
        Ok(&self.buf[slot * self.m..(slot + 1) * self.m])
    }

    fn slot(&self, node: usize) -> Result<usize> {
        match self.slot_of.get(node) {
            Some(&s) if s >= 0 => Ok(s as usize),
            _ => Err(invariant_err(format!("lineage {node} is not extant"))),
        }
    }

    fn invalidate(&mut self) {
        self.sum_cache = None;
        self.sumsq_cache = None;
    }

    fn insert_slot(&mut self, node: usize) -> Result<usize> {
        if node >= self.slot_of.len() {
            return Err(invariant_err(format!("node id {node} out of range")));
        }
        if self.slot_of[node] >= 0 {
            return Err(invariant_err(format!("lineage {node} is already extant")));
        }
        let slot = self
            .free
            .pop()
            .ok_or_else(|| invariant_err("no free lineage slots"))?;
        self.slot_of[node] = slot as i32;
        self.pos_in_extant[node] = self.extant.len() as i32;
        self.extant.push(node);
        self.invalidate();
        Ok(slot)
    }

    /// Inserts lineage `node` as `one_hot(state)`, optionally floored at
    /// `min_p` and renormalised.
    pub fn add_sample(&mut self, node: usize, state: usize, min_p: Option<f64>) -> Result<()> {
        if state >= self.m {
            return Err(invariant_err(format!(
                "sample state {state} out of range for {} demes",
                self.m
            )));
        }
        let m = self.m;
        let slot = self.insert_slot(node)?;
        let p = &mut self.buf[slot * m..(slot + 1) * m];
        p.fill(0.0);
        p[state] = 1.0;
        if let Some(floor) = min_p {
            if floor > 0.0 {
                p.max_assign(floor);
                p.normalise();
            }
        }
        Ok(())
    }

    pub fn add_lineage(&mut self, node: usize, pvec: &[f64]) -> Result<()> {
        if pvec.len() != self.m {
            return Err(invariant_err("probability vector length mismatch"));
        }
        let m = self.m;
        let slot = self.insert_slot(node)?;
        self.buf[slot * m..(slot + 1) * m].copy_from_slice(pvec);
        Ok(())
    }

    /// Removes lineage `node` and returns its last-held vector.
    pub fn remove_lineage(&mut self, node: usize) -> Result<Vec<f64>> {
        let slot = self.slot(node)?;
        let m = self.m;
        let out = self.buf[slot * m..(slot + 1) * m].to_vec();
        self.slot_of[node] = -1;
        self.free.push(slot);
        let pos = self.pos_in_extant[node] as usize;
        self.pos_in_extant[node] = -1;
        self.extant.swap_remove(pos);
        if pos < self.extant.len() {
            self.pos_in_extant[self.extant[pos]] = pos as i32;
        }
        self.invalidate();
        Ok(out)
    }

    /// Copies the two child vectors of a coalescing pair, preserving order.
    pub fn copy_pair(&self, u: usize, v: usize, out_u: &mut [f64], out_v: &mut [f64]) -> Result<()> {
        out_u.copy_from_slice(self.probs(u)?);
        out_v.copy_from_slice(self.probs(v)?);
        Ok(())
    }

    /// `A_i = Σ_ℓ p_ℓ,i`, cached until the next mutation.
    pub fn lineage_state_sum(&mut self) -> &[f64] {
        if self.sum_cache.is_none() {
            let mut a = vec![0.0; self.m];
            for &node in &self.extant {
                let slot = self.slot_of[node] as usize;
                a.add_assign_elem(&self.buf[slot * self.m..(slot + 1) * self.m]);
            }
            self.sum_cache = Some(a);
        }
        self.sum_cache.as_deref().expect("filled above")
    }

    /// `S_i = Σ_ℓ p_ℓ,i²`, cached until the next mutation.
    pub fn lineage_sum_squares(&mut self) -> &[f64] {
        if self.sumsq_cache.is_none() {
            let mut s = vec![0.0; self.m];
            for &node in &self.extant {
                let slot = self.slot_of[node] as usize;
                let p = &self.buf[slot * self.m..(slot + 1) * self.m];
                for i in 0..self.m {
                    s[i] += p[i] * p[i];
                }
            }
            self.sumsq_cache = Some(s);
        }
        self.sumsq_cache.as_deref().expect("filled above")
    }

    /// Replaces every extant vector `p` with `p · Q` (left-multiplication by
    /// `Qᵀ`), optionally renormalising each result.
    pub fn mul_extant_probabilities(&mut self, q: &Array2<f64>, normalise: bool) -> Result<()> {
        let m = self.m;
        if q.nrows() != m || q.ncols() != m {
            return Err(invariant_err("Q matrix shape mismatch"));
        }
        let mut tmp = vec![0.0; m];
        for &node in &self.extant {
            let slot = self.slot_of[node] as usize;
            let p = &mut self.buf[slot * m..(slot + 1) * m];
            crate::vector::vecmat(p, q, &mut tmp);
            p.copy_from_slice(&tmp);
            if normalise {
                p.normalise();
            }
        }
        self.invalidate();
        Ok(())
    }

    /// Applies `f` to every extant vector in place.
    pub fn update_extant(&mut self, mut f: impl FnMut(usize, &mut [f64])) {
        let m = self.m;
        for idx in 0..self.extant.len() {
            let node = self.extant[idx];
            let slot = self.slot_of[node] as usize;
            f(node, &mut self.buf[slot * m..(slot + 1) * m]);
        }
        self.invalidate();
    }

    /// Records the current vector of `node` in the ancestral store.
    pub fn store_ancestral(&mut self, node: usize) -> Result<()> {
        let p = self.probs(node)?.to_vec();
        self.ancestral[node] = Some(p);
        Ok(())
    }

    pub fn store_ancestral_vec(&mut self, node: usize, p: Vec<f64>) {
        self.ancestral[node] = Some(p);
    }

    pub fn ancestral(&self, node: usize) -> Option<&[f64]> {
        self.ancestral.get(node).and_then(|p| p.as_deref())
    }

    /// Takes the stored vectors out, leaving the store empty.
    pub fn clear_ancestral(&mut self) -> Vec<Option<Vec<f64>>> {
        std::mem::replace(&mut self.ancestral, vec![None; self.slot_of.len()])
    }

    /// The last surviving lineage's vector, if exactly one remains.
    pub fn root_probs(&self) -> Option<&[f64]> {
        if self.extant.len() == 1 {
            self.probs(self.extant[0]).ok()
        } else {
            None
        }
    }
}
