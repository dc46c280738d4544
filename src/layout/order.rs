//! Reading-order pointer head and vote-based sequencing.
#![allow(clippy::cast_precision_loss)]

use ndarray::{Array2, ArrayView2};

use crate::error::Result;
use crate::tensor::sigmoid;
use crate::weights::{Linear, TensorMap};

/// Mask value for disallowed (lower-triangular) pointer positions.
const ORDER_MASK: f32 = -10_000.0;

/// The global pointer projection: pairwise "i precedes j" logits.
#[derive(Debug)]
pub struct GlobalPointer {
    proj: Linear,
    head_size: usize,
}

impl GlobalPointer {
    pub fn load(weights: &mut TensorMap, prefix: &str, head_size: usize) -> Result<Self> {
        Ok(Self {
            proj: Linear::load(weights, prefix)?,
            head_size,
        })
    }

    /// Pairwise order logits for a `(Q, d_model)` query sequence.
    ///
    /// The projection yields `(Q, 2H)` split into pointer queries and keys;
    /// scores are `q . k^T / sqrt(H)` with the lower triangle (including the
    /// diagonal) replaced by a large negative sentinel.
    #[must_use = "returns the pairwise order logits"]
    pub fn logits(&self, hidden: ArrayView2<f32>) -> Array2<f32> {
        let projected = self.proj.forward(hidden);
        let n = projected.nrows();
        let h = self.head_size;
        let q = projected.slice(ndarray::s![.., ..h]);
        let k = projected.slice(ndarray::s![.., h..2 * h]);
        let mut scores = q.dot(&k.t());
        let scale = 1.0 / (h as f32).sqrt();
        scores.mapv_inplace(|s| s * scale);
        for i in 0..n {
            for j in 0..=i {
                scores[[i, j]] = ORDER_MASK;
            }
        }
        scores
    }
}

/// Derive the reading order by voting over pairwise logits.
///
/// For each query `p`: `v[p] = sum_{i<p} sigma(logits[i][p]) + sum_{i>p}
/// (1 - sigma(logits[p][i]))`. Queries are ranked by ascending vote, ties
/// broken by original index, and the rank is the emitted `order`.
#[must_use = "returns the order rank per query"]
pub fn order_by_voting(logits: ArrayView2<f32>) -> Vec<usize> {
    let n = logits.nrows();
    let mut votes = vec![0.0f32; n];
    for p in 0..n {
        let mut v = 0.0f32;
        for i in 0..p {
            v += sigmoid(logits[[i, p]]);
        }
        for i in (p + 1)..n {
            v += 1.0 - sigmoid(logits[[p, i]]);
        }
        votes[p] = v;
    }
    let mut indices: Vec<usize> = (0..n).collect();
    indices.sort_by(|a, b| votes[*a].total_cmp(&votes[*b]).then(a.cmp(b)));
    // indices[rank] = query; invert to rank per query.
    let mut order = vec![0usize; n];
    for (rank, query) in indices.iter().enumerate() {
        order[*query] = rank;
    }
    order
}
