// Feature-map interpolation and continuous-coordinate sampling.
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_wrap)]

use ndarray::{Array3, ArrayView2, ArrayView3};

/// Bilinear resize of a channel-first feature map to `(out_h, out_w)`.
///
/// Half-pixel centers (`align_corners = false`), edge-clamped taps. This is
/// the interpolation mode used by the encoder's mask-feature upsampling.
#[must_use = "returns the resized feature map"]
pub fn resize_bilinear(input: ArrayView3<f32>, out_h: usize, out_w: usize) -> Array3<f32> {
    let (c, h, w) = input.dim();
    if h == out_h && w == out_w {
        return input.to_owned();
    }
    let scale_y = h as f32 / out_h as f32;
    let scale_x = w as f32 / out_w as f32;
    let mut output = Array3::<f32>::zeros((c, out_h, out_w));

    for oy in 0..out_h {
        let sy = ((oy as f32 + 0.5) * scale_y - 0.5).max(0.0);
        let y0 = (sy.floor() as usize).min(h - 1);
        let y1 = (y0 + 1).min(h - 1);
        let fy = sy - y0 as f32;
        for ox in 0..out_w {
            let sx = ((ox as f32 + 0.5) * scale_x - 0.5).max(0.0);
            let x0 = (sx.floor() as usize).min(w - 1);
            let x1 = (x0 + 1).min(w - 1);
            let fx = sx - x0 as f32;
            for ch in 0..c {
                let v00 = input[[ch, y0, x0]];
                let v01 = input[[ch, y0, x1]];
                let v10 = input[[ch, y1, x0]];
                let v11 = input[[ch, y1, x1]];
                let top = v00 + (v01 - v00) * fx;
                let bot = v10 + (v11 - v10) * fx;
                output[[ch, oy, ox]] = top + (bot - top) * fy;
            }
        }
    }
    output
}

/// Nearest-neighbor resize of a channel-first feature map.
#[must_use = "returns the resized feature map"]
pub fn resize_nearest(input: ArrayView3<f32>, out_h: usize, out_w: usize) -> Array3<f32> {
    let (c, h, w) = input.dim();
    if h == out_h && w == out_w {
        return input.to_owned();
    }
    let scale_y = h as f32 / out_h as f32;
    let scale_x = w as f32 / out_w as f32;
    let mut output = Array3::<f32>::zeros((c, out_h, out_w));
    for oy in 0..out_h {
        let sy = ((oy as f32 + 0.5) * scale_y) as usize;
        let sy = sy.min(h - 1);
        for ox in 0..out_w {
            let sx = ((ox as f32 + 0.5) * scale_x) as usize;
            let sx = sx.min(w - 1);
            for ch in 0..c {
                output[[ch, oy, ox]] = input[[ch, sy, sx]];
            }
        }
    }
    output
}

/// 2x nearest upsample (the FPN top-down path).
#[inline]
#[must_use]
pub fn upsample_nearest_2x(input: ArrayView3<f32>) -> Array3<f32> {
    let (_, h, w) = input.dim();
    resize_nearest(input, h * 2, w * 2)
}

/// 2x bilinear upsample (the mask-feature scale heads).
#[inline]
#[must_use]
pub fn upsample_bilinear_2x(input: ArrayView3<f32>) -> Array3<f32> {
    let (_, h, w) = input.dim();
    resize_bilinear(input, h * 2, w * 2)
}

/// Bilinear sample of a single-channel map at a continuous pixel coordinate,
/// zero outside the map.
///
/// This is the inner step of deformable cross-attention: coordinates come in
/// as level-pixel positions (already shifted by -0.5 for center alignment),
/// and each of the four taps contributes only where it lands in bounds.
#[must_use]
pub fn bilinear_sample_zero_pad(map: ArrayView2<f32>, x: f32, y: f32) -> f32 {
    let (h, w) = map.dim();
    let x0 = x.floor() as isize;
    let y0 = y.floor() as isize;
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let mut acc = 0.0f32;
    for (dy, wy) in [(0isize, 1.0 - fy), (1, fy)] {
        let yy = y0 + dy;
        if yy < 0 || yy >= h as isize || wy == 0.0 {
            continue;
        }
        for (dx, wx) in [(0isize, 1.0 - fx), (1, fx)] {
            let xx = x0 + dx;
            if xx < 0 || xx >= w as isize || wx == 0.0 {
                continue;
            }
            acc += map[[yy as usize, xx as usize]] * wy * wx;
        }
    }
    acc
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr2, Array3};

    #[test]
    fn test_resize_bilinear_identity() {
        let mut input = Array3::<f32>::zeros((2, 3, 3));
        for (i, v) in input.iter_mut().enumerate() {
            *v = i as f32;
        }
        let out = resize_bilinear(input.view(), 3, 3);
        assert_eq!(out, input);
    }

    #[test]
    fn test_resize_bilinear_constant_preserved() {
        let input = Array3::<f32>::from_elem((1, 4, 4), 7.5);
        let out = resize_bilinear(input.view(), 9, 5);
        for v in out.iter() {
            assert!((v - 7.5).abs() < 1e-6);
        }
    }

    #[test]
    fn test_upsample_nearest_2x_blocks() {
        let mut input = Array3::<f32>::zeros((1, 2, 2));
        input[[0, 0, 0]] = 1.0;
        input[[0, 1, 1]] = 4.0;
        let out = upsample_nearest_2x(input.view());
        assert_eq!(out.dim(), (1, 4, 4));
        assert_eq!(out[[0, 0, 0]], 1.0);
        assert_eq!(out[[0, 0, 1]], 1.0);
        assert_eq!(out[[0, 1, 1]], 1.0);
        assert_eq!(out[[0, 3, 3]], 4.0);
    }

    #[test]
    fn test_bilinear_sample_center_and_out_of_bounds() {
        let map = arr2(&[[0.0, 1.0], [2.0, 3.0]]);
        // Exactly on pixel (0,0).
        assert!((bilinear_sample_zero_pad(map.view(), 0.0, 0.0) - 0.0).abs() < 1e-6);
        // Midpoint of all four pixels.
        let mid = bilinear_sample_zero_pad(map.view(), 0.5, 0.5);
        assert!((mid - 1.5).abs() < 1e-6);
        // Far out of bounds contributes zero.
        assert_eq!(bilinear_sample_zero_pad(map.view(), -5.0, 0.0), 0.0);
        assert_eq!(bilinear_sample_zero_pad(map.view(), 0.0, 9.0), 0.0);
    }

    #[test]
    fn test_bilinear_sample_edge_partial() {
        let map = arr2(&[[4.0]]);
        // Half a pixel off the edge: only one tap in bounds with weight 0.5.
        let v = bilinear_sample_zero_pad(map.view(), -0.5, 0.0);
        assert!((v - 2.0).abs() < 1e-6);
    }
}
