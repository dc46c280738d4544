// 2-D convolution over channel-first feature maps.
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]

use ndarray::{Array3, ArrayView1, ArrayView3, ArrayView4};

/// Stride / padding / grouping for [`conv2d`].
#[derive(Debug, Clone, Copy)]
pub struct Conv2dParams {
    pub stride: usize,
    pub padding: usize,
    pub groups: usize,
}

impl Default for Conv2dParams {
    fn default() -> Self {
        Self {
            stride: 1,
            padding: 0,
            groups: 1,
        }
    }
}

impl Conv2dParams {
    #[must_use]
    pub fn new(stride: usize, padding: usize) -> Self {
        Self {
            stride,
            padding,
            groups: 1,
        }
    }

    /// Depthwise convolution: one group per channel.
    #[must_use]
    pub fn depthwise(stride: usize, padding: usize, channels: usize) -> Self {
        Self {
            stride,
            padding,
            groups: channels,
        }
    }
}

/// Grouped 2-D convolution.
///
/// * `input` - `(C_in, H, W)`
/// * `weight` - `(C_out, C_in / groups, kH, kW)` (checkpoint layout)
/// * `bias` - optional `(C_out,)`
///
/// Returns `(C_out, H_out, W_out)` with
/// `H_out = (H + 2*padding - kH) / stride + 1`.
///
/// The kernel loop skips out-of-bounds taps directly instead of materializing
/// a padded copy of the input.
#[must_use = "returns the convolved feature map"]
pub fn conv2d(
    input: ArrayView3<f32>,
    weight: ArrayView4<f32>,
    bias: Option<ArrayView1<f32>>,
    params: Conv2dParams,
) -> Array3<f32> {
    let (c_in, h, w) = input.dim();
    let (c_out, c_in_per_group, kh, kw) = weight.dim();
    let groups = params.groups;
    assert!(
        c_in == c_in_per_group * groups,
        "conv2d channel mismatch: input {c_in}, weight {c_in_per_group} x {groups} groups"
    );
    assert!(c_out % groups == 0, "conv2d output channels not divisible by groups");
    let out_per_group = c_out / groups;

    let h_out = (h + 2 * params.padding - kh) / params.stride + 1;
    let w_out = (w + 2 * params.padding - kw) / params.stride + 1;
    let mut output = Array3::<f32>::zeros((c_out, h_out, w_out));

    let input_slice = input.as_slice().expect("contiguous input");
    let weight_slice = weight.as_slice().expect("contiguous weight");
    let out_slice = output.as_slice_mut().expect("contiguous output");

    let pad = params.padding as isize;
    let stride = params.stride;

    for oc in 0..c_out {
        let group = oc / out_per_group;
        let ic_base = group * c_in_per_group;
        let bias_v = bias.map_or(0.0, |b| b[oc]);
        for oy in 0..h_out {
            let iy0 = (oy * stride) as isize - pad;
            for ox in 0..w_out {
                let ix0 = (ox * stride) as isize - pad;
                let mut acc = bias_v;
                for icg in 0..c_in_per_group {
                    let ic = ic_base + icg;
                    let in_chan = ic * h * w;
                    let w_base = ((oc * c_in_per_group) + icg) * kh * kw;
                    for ky in 0..kh {
                        let iy = iy0 + ky as isize;
                        if iy < 0 || iy >= h as isize {
                            continue;
                        }
                        let in_row = in_chan + iy as usize * w;
                        let w_row = w_base + ky * kw;
                        for kx in 0..kw {
                            let ix = ix0 + kx as isize;
                            if ix < 0 || ix >= w as isize {
                                continue;
                            }
                            acc += input_slice[in_row + ix as usize] * weight_slice[w_row + kx];
                        }
                    }
                }
                out_slice[(oc * h_out + oy) * w_out + ox] = acc;
            }
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array1, Array3, Array4};

    #[test]
    fn test_conv2d_identity_kernel() {
        // 1x1 kernel with weight 1.0 reproduces the input.
        let mut input = Array3::<f32>::zeros((1, 3, 3));
        for (i, v) in input.iter_mut().enumerate() {
            *v = i as f32;
        }
        let weight = Array4::<f32>::ones((1, 1, 1, 1));
        let out = conv2d(input.view(), weight.view(), None, Conv2dParams::default());
        assert_eq!(out, input);
    }

    #[test]
    fn test_conv2d_3x3_sum_kernel_with_padding() {
        let input = Array3::<f32>::ones((1, 3, 3));
        let weight = Array4::<f32>::ones((1, 1, 3, 3));
        let out = conv2d(input.view(), weight.view(), None, Conv2dParams::new(1, 1));
        assert_eq!(out.dim(), (1, 3, 3));
        // Center sees all 9 taps, corners see 4.
        assert_eq!(out[[0, 1, 1]], 9.0);
        assert_eq!(out[[0, 0, 0]], 4.0);
    }

    #[test]
    fn test_conv2d_stride_two() {
        let input = Array3::<f32>::ones((1, 4, 4));
        let weight = Array4::<f32>::ones((1, 1, 2, 2));
        let out = conv2d(input.view(), weight.view(), None, Conv2dParams::new(2, 0));
        assert_eq!(out.dim(), (1, 2, 2));
        assert_eq!(out[[0, 0, 0]], 4.0);
    }

    #[test]
    fn test_conv2d_depthwise() {
        // Two channels, depthwise: each output channel only sees its own input.
        let mut input = Array3::<f32>::zeros((2, 2, 2));
        input.slice_mut(ndarray::s![0, .., ..]).fill(1.0);
        input.slice_mut(ndarray::s![1, .., ..]).fill(10.0);
        let weight = Array4::<f32>::ones((2, 1, 1, 1));
        let out = conv2d(
            input.view(),
            weight.view(),
            None,
            Conv2dParams::depthwise(1, 0, 2),
        );
        assert_eq!(out[[0, 0, 0]], 1.0);
        assert_eq!(out[[1, 0, 0]], 10.0);
    }

    #[test]
    fn test_conv2d_bias() {
        let input = Array3::<f32>::zeros((1, 2, 2));
        let weight = Array4::<f32>::ones((3, 1, 1, 1));
        let bias = Array1::from(vec![1.0, 2.0, 3.0]);
        let out = conv2d(
            input.view(),
            weight.view(),
            Some(bias.view()),
            Conv2dParams::default(),
        );
        assert_eq!(out[[0, 0, 0]], 1.0);
        assert_eq!(out[[2, 1, 1]], 3.0);
    }
}
