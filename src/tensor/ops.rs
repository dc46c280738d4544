// Elementwise and normalization primitives.
// Intentional ML conversions: array indices, feature dimensions
#![allow(clippy::cast_precision_loss)]

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};

/// Affine projection: `x @ weight^T + bias`.
///
/// * `x` - `(L, d_in)`
/// * `weight` - `(d_out, d_in)` (checkpoint layout)
/// * `bias` - optional `(d_out,)`
///
/// Returns `(L, d_out)`.
#[must_use = "returns the projected activations"]
pub fn linear(x: ArrayView2<f32>, weight: ArrayView2<f32>, bias: Option<ArrayView1<f32>>) -> Array2<f32> {
    let mut out = x.dot(&weight.t());
    if let Some(b) = bias {
        out += &b;
    }
    out
}

/// Logistic sigmoid of a single value.
#[inline]
#[must_use]
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// In-place logistic sigmoid over a contiguous buffer.
pub fn sigmoid_inplace(x: &mut [f32]) {
    for v in x.iter_mut() {
        *v = sigmoid(*v);
    }
}

/// SiLU (swish): `x * sigmoid(x)`.
#[inline]
#[must_use]
pub fn silu(x: f32) -> f32 {
    x * sigmoid(x)
}

/// In-place SiLU over a contiguous buffer.
pub fn silu_inplace(x: &mut [f32]) {
    for v in x.iter_mut() {
        *v = silu(*v);
    }
}

/// GELU with the tanh approximation used by the source checkpoints.
///
/// `0.5 * x * (1 + tanh(sqrt(2/pi) * (x + 0.044715 * x^3)))`
#[inline]
#[must_use]
pub fn gelu(x: f32) -> f32 {
    const SQRT_2_OVER_PI: f32 = 0.797_884_6;
    0.5 * x * (1.0 + (SQRT_2_OVER_PI * (x + 0.044_715 * x * x * x)).tanh())
}

/// In-place GELU over a contiguous buffer.
pub fn gelu_inplace(x: &mut [f32]) {
    for v in x.iter_mut() {
        *v = gelu(*v);
    }
}

/// In-place ReLU over a contiguous buffer.
pub fn relu_inplace(x: &mut [f32]) {
    for v in x.iter_mut() {
        if *v < 0.0 {
            *v = 0.0;
        }
    }
}

/// Inverse of the logistic sigmoid, with inputs clamped to `[eps, 1-eps]`.
///
/// Used for iterative box refinement: `logit(p) = ln(p / (1 - p))`.
#[inline]
#[must_use]
pub fn inverse_sigmoid(x: f32, eps: f32) -> f32 {
    let x = x.clamp(eps, 1.0 - eps);
    (x / (1.0 - x)).ln()
}

/// Numerically stable softmax over a 1-D slice, in place.
pub fn softmax_1d(x: &mut [f32]) {
    let max = x.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    for v in x.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    if sum > 0.0 {
        for v in x.iter_mut() {
            *v /= sum;
        }
    }
}

/// Numerically stable log-softmax over a 1-D slice, in place.
pub fn log_softmax_1d(x: &mut [f32]) {
    let max = x.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    for v in x.iter() {
        sum += (*v - max).exp();
    }
    let log_sum = sum.ln() + max;
    for v in x.iter_mut() {
        *v -= log_sum;
    }
}

/// Softmax along the last axis of a 2-D array, in place.
pub fn softmax_axis_last(x: &mut Array2<f32>) {
    for mut row in x.axis_iter_mut(Axis(0)) {
        let slice = row.as_slice_mut().expect("row-major layout");
        softmax_1d(slice);
    }
}

/// Layer normalization over the last axis.
///
/// * `x` - `(L, d)`
/// * `weight`, `bias` - `(d,)`
#[must_use = "returns the normalized activations"]
pub fn layer_norm(
    x: ArrayView2<f32>,
    weight: ArrayView1<f32>,
    bias: ArrayView1<f32>,
    eps: f32,
) -> Array2<f32> {
    let d = x.ncols();
    let mut out = x.to_owned();
    for mut row in out.axis_iter_mut(Axis(0)) {
        let mean = row.sum() / d as f32;
        let mut var = 0.0f32;
        for v in row.iter() {
            let c = *v - mean;
            var += c * c;
        }
        var /= d as f32;
        let inv_std = 1.0 / (var + eps).sqrt();
        for (i, v) in row.iter_mut().enumerate() {
            *v = (*v - mean) * inv_std * weight[i] + bias[i];
        }
    }
    out
}

/// Root-mean-square normalization over the last axis.
///
/// `out = x / sqrt(mean(x^2) + eps) * weight`
#[must_use = "returns the normalized activations"]
pub fn rms_norm(x: ArrayView2<f32>, weight: ArrayView1<f32>, eps: f32) -> Array2<f32> {
    let d = x.ncols();
    let mut out = x.to_owned();
    for mut row in out.axis_iter_mut(Axis(0)) {
        let mut ms = 0.0f32;
        for v in row.iter() {
            ms += *v * *v;
        }
        ms /= d as f32;
        let inv = 1.0 / (ms + eps).sqrt();
        for (i, v) in row.iter_mut().enumerate() {
            *v = *v * inv * weight[i];
        }
    }
    out
}

/// Pad the row axis of `x` up to the next multiple of `step` with zeros.
///
/// Returns `x` unchanged when the row count is already aligned. Used by the
/// KV cache, which grows in fixed-size blocks.
#[must_use = "returns the padded array"]
pub fn pad_rows_to_multiple(x: ArrayView2<f32>, step: usize) -> Array2<f32> {
    let rows = x.nrows();
    let rem = rows % step;
    if rem == 0 {
        return x.to_owned();
    }
    let target = rows + (step - rem);
    let mut out = Array2::<f32>::zeros((target, x.ncols()));
    out.slice_mut(ndarray::s![..rows, ..]).assign(&x);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2};

    #[test]
    fn test_linear_with_bias() {
        let x = arr2(&[[1.0, 2.0], [3.0, 4.0]]);
        let w = arr2(&[[1.0, 0.0], [0.0, 1.0], [1.0, 1.0]]);
        let b = arr1(&[0.5, -0.5, 0.0]);
        let out = linear(x.view(), w.view(), Some(b.view()));
        assert_eq!(out.shape(), &[2, 3]);
        assert_eq!(out[[0, 0]], 1.5);
        assert_eq!(out[[0, 1]], 1.5);
        assert_eq!(out[[1, 2]], 7.0);
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let mut v = vec![1.0f32, 2.0, 3.0, 4.0];
        softmax_1d(&mut v);
        let sum: f32 = v.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert!(v[3] > v[2] && v[2] > v[1]);
    }

    #[test]
    fn test_log_softmax_matches_softmax() {
        let mut a = vec![0.5f32, -1.0, 2.0];
        let mut b = a.clone();
        softmax_1d(&mut a);
        log_softmax_1d(&mut b);
        for (p, lp) in a.iter().zip(b.iter()) {
            assert!((p.ln() - lp).abs() < 1e-5);
        }
    }

    #[test]
    fn test_inverse_sigmoid_round_trip() {
        for p in [0.1f32, 0.5, 0.73, 0.99] {
            let x = inverse_sigmoid(p, 1e-5);
            assert!((sigmoid(x) - p).abs() < 1e-4);
        }
    }

    #[test]
    fn test_layer_norm_zero_mean_unit_var() {
        let x = arr2(&[[1.0, 2.0, 3.0, 4.0]]);
        let w = arr1(&[1.0, 1.0, 1.0, 1.0]);
        let b = arr1(&[0.0, 0.0, 0.0, 0.0]);
        let out = layer_norm(x.view(), w.view(), b.view(), 1e-5);
        let mean: f32 = out.row(0).sum() / 4.0;
        assert!(mean.abs() < 1e-5);
    }

    #[test]
    fn test_rms_norm_identity_weight() {
        let x = arr2(&[[3.0, 4.0]]);
        let w = arr1(&[1.0, 1.0]);
        let out = rms_norm(x.view(), w.view(), 1e-6);
        // rms of [3,4] = sqrt(12.5)
        let rms = 12.5f32.sqrt();
        assert!((out[[0, 0]] - 3.0 / rms).abs() < 1e-5);
        assert!((out[[0, 1]] - 4.0 / rms).abs() < 1e-5);
    }

    #[test]
    fn test_pad_rows_to_multiple() {
        let x = Array2::<f32>::ones((5, 3));
        let padded = pad_rows_to_multiple(x.view(), 4);
        assert_eq!(padded.nrows(), 8);
        assert_eq!(padded[[4, 0]], 1.0);
        assert_eq!(padded[[5, 0]], 0.0);

        let aligned = pad_rows_to_multiple(x.view(), 5);
        assert_eq!(aligned.nrows(), 5);
    }

    #[test]
    fn test_activations() {
        assert!((silu(0.0)).abs() < 1e-7);
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-7);
        assert!(gelu(2.0) > 1.9 && gelu(2.0) < 2.0);
        assert!(gelu(-10.0).abs() < 1e-3);
    }
}
