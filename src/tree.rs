use anyhow::Result;

use crate::error::ScoalError;

/// Rooted bifurcating tree, index-based. Tips occupy node ids
/// `0..n_tips`; internal nodes follow. Heights are measured backward from
/// the youngest tip (height 0).
#[derive(Debug, Clone)]
pub struct Tree {
    pub n_tips: usize,
    pub n_nodes: usize,
    pub parent: Vec<i32>,
    pub children: Vec<Vec<usize>>,
    pub height: Vec<f64>,
    pub tip_names: Vec<String>,
    pub root: usize,
}

fn invariant_err(msg: impl Into<String>) -> anyhow::Error {
    ScoalError::Invariant(msg.into()).into()
}

impl Tree {
    pub fn from_parts(
        parent: Vec<i32>,
        height: Vec<f64>,
        n_tips: usize,
        tip_names: Vec<String>,
    ) -> Result<Self> {
        let n_nodes = parent.len();
        if height.len() != n_nodes {
            return Err(invariant_err("parent and height arrays differ in length"));
        }
        if tip_names.len() != n_tips {
            return Err(invariant_err("tip_names length does not match n_tips"));
        }
        if n_tips < 2 || n_nodes != 2 * n_tips - 1 {
            return Err(invariant_err(format!(
                "a bifurcating tree with {n_tips} tips needs {} nodes, got {n_nodes}",
                2 * n_tips.max(1) - 1
            )));
        }

        let mut children = vec![Vec::new(); n_nodes];
        let mut root = None;
        for (node, &p) in parent.iter().enumerate() {
            if p < 0 {
                if root.replace(node).is_some() {
                    return Err(invariant_err("more than one root node"));
                }
            } else {
                let p = p as usize;
                if p >= n_nodes {
                    return Err(invariant_err(format!("parent index {p} out of range")));
                }
                children[p].push(node);
            }
        }
        let root = root.ok_or_else(|| invariant_err("no root node"))?;

        for node in 0..n_nodes {
            let n_children = children[node].len();
            if node < n_tips {
                if n_children != 0 {
                    return Err(invariant_err(format!("tip {node} has children")));
                }
            } else if n_children != 2 {
                return Err(invariant_err(format!(
                    "internal node {node} has {n_children} children, expected 2"
                )));
            }
        }
        for (node, &h) in height.iter().enumerate() {
            if !h.is_finite() || h < 0.0 {
                return Err(invariant_err(format!("bad height {h} at node {node}")));
            }
            let p = parent[node];
            if p >= 0 && height[p as usize] < h {
                return Err(invariant_err(format!(
                    "node {node} is older than its parent"
                )));
            }
        }

        Ok(Self {
            n_tips,
            n_nodes,
            parent,
            children,
            height,
            tip_names,
            root,
        })
    }

    pub fn is_leaf(&self, node: usize) -> bool {
        node < self.n_tips
    }

    pub fn root_height(&self) -> f64 {
        self.height[self.root]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Sample,
    Coalescent,
}

/// The tree flattened into a height-ascending event sequence with the
/// durations between successive events. At equal height, samples sort
/// before coalescences; remaining ties break by node id.
#[derive(Debug, Clone)]
pub struct TreeIntervals {
    nodes: Vec<usize>,
    kinds: Vec<EventKind>,
    heights: Vec<f64>,
    durations: Vec<f64>,
}

impl TreeIntervals {
    pub fn build(tree: &Tree) -> Result<Self> {
        let mut order: Vec<usize> = (0..tree.n_nodes).collect();
        order.sort_by(|&a, &b| {
            tree.height[a]
                .partial_cmp(&tree.height[b])
                .expect("heights validated finite")
                .then_with(|| tree.is_leaf(b).cmp(&tree.is_leaf(a)))
                .then_with(|| a.cmp(&b))
        });

        let mut nodes = Vec::with_capacity(order.len());
        let mut kinds = Vec::with_capacity(order.len());
        let mut heights = Vec::with_capacity(order.len());
        let mut durations = Vec::with_capacity(order.len());
        let mut prev = 0.0;
        for node in order {
            let h = tree.height[node];
            nodes.push(node);
            kinds.push(if tree.is_leaf(node) {
                EventKind::Sample
            } else {
                EventKind::Coalescent
            });
            heights.push(h);
            durations.push(h - prev);
            prev = h;
        }
        Ok(Self {
            nodes,
            kinds,
            heights,
            durations,
        })
    }

    pub fn count(&self) -> usize {
        self.nodes.len()
    }

    pub fn duration(&self, i: usize) -> f64 {
        self.durations[i]
    }

    pub fn event_kind(&self, i: usize) -> EventKind {
        self.kinds[i]
    }

    pub fn event_node(&self, i: usize) -> usize {
        self.nodes[i]
    }

    /// Height of event `i` above the youngest tip.
    pub fn time_of(&self, i: usize) -> f64 {
        self.heights[i]
    }

    pub fn total_duration(&self) -> f64 {
        self.heights.last().copied().unwrap_or(0.0)
    }
}
