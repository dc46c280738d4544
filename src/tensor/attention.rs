// Scaled dot-product attention over per-head sequences.
#![allow(clippy::cast_precision_loss)]

use ndarray::{Array2, Array3, ArrayView2, ArrayView3};

use super::ops::softmax_1d;

/// Causal mask for a prefill of length `len`: `mask[i][j] = j <= i`.
///
/// Disallowed positions hold a large negative value so softmax zeroes them.
#[must_use]
pub fn causal_mask(len: usize) -> Array2<f32> {
    let mut mask = Array2::<f32>::zeros((len, len));
    for i in 0..len {
        for j in (i + 1)..len {
            mask[[i, j]] = f32::NEG_INFINITY;
        }
    }
    mask
}

/// Mask for prefilling `len` new tokens against a cache of `offset` previous
/// tokens: position `i` of the new chunk may attend to `j <= i + offset` of
/// the combined sequence.
#[must_use]
pub fn offset_mask(len: usize, offset: usize) -> Array2<f32> {
    let total = offset + len;
    let mut mask = Array2::<f32>::zeros((len, total));
    for i in 0..len {
        for j in (i + offset + 1)..total {
            mask[[i, j]] = f32::NEG_INFINITY;
        }
    }
    mask
}

/// Reshape a packed `(L, H*D)` projection into per-head `(H, L, D)`.
#[must_use]
pub fn split_heads(x: ArrayView2<f32>, n_heads: usize) -> Array3<f32> {
    let (l, packed) = x.dim();
    assert!(packed % n_heads == 0, "packed dim {packed} not divisible by {n_heads} heads");
    let d = packed / n_heads;
    let mut out = Array3::<f32>::zeros((n_heads, l, d));
    for i in 0..l {
        for h in 0..n_heads {
            for j in 0..d {
                out[[h, i, j]] = x[[i, h * d + j]];
            }
        }
    }
    out
}

/// Inverse of [`split_heads`]: `(H, L, D)` back to `(L, H*D)`.
#[must_use]
pub fn merge_heads(x: ArrayView3<f32>) -> Array2<f32> {
    let (n_heads, l, d) = x.dim();
    let mut out = Array2::<f32>::zeros((l, n_heads * d));
    for h in 0..n_heads {
        for i in 0..l {
            for j in 0..d {
                out[[i, h * d + j]] = x[[h, i, j]];
            }
        }
    }
    out
}

/// Scaled dot-product attention for one batch of heads.
///
/// * `q` - `(H, Lq, D)`
/// * `k` - `(H_kv, Lk, D)`
/// * `v` - `(H_kv, Lk, Dv)`
/// * `mask` - optional `(Lq, Lk)` additive mask
///
/// When `H > H_kv` (grouped-query attention) each KV head serves
/// `H / H_kv` consecutive query heads. Returns `(H, Lq, Dv)`.
#[must_use = "returns the attention output"]
pub fn scaled_dot_attention(
    q: ArrayView3<f32>,
    k: ArrayView3<f32>,
    v: ArrayView3<f32>,
    mask: Option<ArrayView2<f32>>,
    scale: f32,
) -> Array3<f32> {
    let (n_heads, l_q, _d) = q.dim();
    let (n_kv, l_k, d_v) = v.dim();
    assert!(
        n_heads % n_kv == 0,
        "query heads {n_heads} not divisible by kv heads {n_kv}"
    );
    let group = n_heads / n_kv;

    let mut out = Array3::<f32>::zeros((n_heads, l_q, d_v));
    for h in 0..n_heads {
        let kv_h = h / group;
        let qh = q.index_axis(ndarray::Axis(0), h);
        let kh = k.index_axis(ndarray::Axis(0), kv_h);
        let vh = v.index_axis(ndarray::Axis(0), kv_h);

        // (Lq, D) @ (D, Lk) -> (Lq, Lk)
        let mut scores = qh.dot(&kh.t());
        scores.mapv_inplace(|s| s * scale);
        if let Some(m) = mask {
            scores += &m;
        }
        for mut row in scores.axis_iter_mut(ndarray::Axis(0)) {
            softmax_1d(row.as_slice_mut().expect("row-major scores"));
        }
        let ctx = scores.dot(&vh);
        out.index_axis_mut(ndarray::Axis(0), h).assign(&ctx);
    }
    out
}
