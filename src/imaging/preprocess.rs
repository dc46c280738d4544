// PIL-compatible separable resampling and tensor conversion.
//
// The `image` crate's resamplers round differently from PIL at a small
// fraction of pixels, and those one-bit differences amplify through the
// models. Both resize paths therefore implement PIL's two-pass algorithm:
// widen the filter by the scale when downsampling, accumulate weighted taps,
// normalize, round, clamp.
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

use ndarray::Array3;

use super::PageImage;
use crate::error::{GlmOcrError, Result};

/// Patch-grid factor for the recognizer's smart resize
/// (`patch_size * merge_size`).
pub const IMAGE_FACTOR: usize = 28;

/// Resampling filter selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResampleFilter {
    /// 4-tap Catmull-Rom kernel, PIL's BICUBIC.
    Bicubic,
    /// 2-tap triangle kernel, PIL's BILINEAR.
    Bilinear,
    /// Single nearest tap.
    Nearest,
}

impl ResampleFilter {
    /// Filter support radius in source pixels at scale 1.
    fn support(self) -> f32 {
        match self {
            Self::Bicubic => 2.0,
            Self::Bilinear => 1.0,
            Self::Nearest => 0.5,
        }
    }

    fn weight(self, x: f32) -> f32 {
        match self {
            Self::Bicubic => bicubic_filter(x),
            Self::Bilinear => {
                let a = x.abs();
                if a < 1.0 {
                    1.0 - a
                } else {
                    0.0
                }
            }
            Self::Nearest => {
                if (-0.5..0.5).contains(&x) {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }
}

/// PIL's bicubic kernel (Catmull-Rom with a = -0.5).
#[inline]
fn bicubic_filter(x: f32) -> f32 {
    const A: f32 = -0.5;
    let x = x.abs();
    if x < 1.0 {
        ((A + 2.0) * x - (A + 3.0)) * x * x + 1.0
    } else if x < 2.0 {
        (((x - 5.0) * x + 8.0) * x - 4.0) * A
    } else {
        0.0
    }
}

/// One separable pass along the row axis: resamples width from `in_w` to
/// `out_w` for every row of every channel.
fn horizontal_pass(
    input: &[u8],
    in_h: usize,
    in_w: usize,
    out_w: usize,
    filter: ResampleFilter,
) -> Vec<u8> {
    let scale = in_w as f32 / out_w as f32;
    let filterscale = scale.max(1.0);
    let support = filter.support() * filterscale;

    let mut out = vec![0u8; in_h * out_w * 3];
    for ox in 0..out_w {
        let center = (ox as f32 + 0.5) * scale;
        let xmin = ((center - support + 0.5).floor() as i32).max(0) as usize;
        let xmax = ((center + support + 0.5).floor() as i32).min(in_w as i32) as usize;
        for y in 0..in_h {
            let in_row = y * in_w * 3;
            for c in 0..3 {
                let mut sum = 0.0f32;
                let mut wsum = 0.0f32;
                for x in xmin..xmax {
                    let dist = (x as f32 + 0.5 - center) / filterscale;
                    let weight = filter.weight(dist);
                    sum += f32::from(input[in_row + x * 3 + c]) * weight;
                    wsum += weight;
                }
                let value = if wsum != 0.0 { sum / wsum } else { 0.0 };
                out[(y * out_w + ox) * 3 + c] = (value + 0.5).floor().clamp(0.0, 255.0) as u8;
            }
        }
    }
    out
}

/// One separable pass along the column axis.
fn vertical_pass(
    input: &[u8],
    in_h: usize,
    width: usize,
    out_h: usize,
    filter: ResampleFilter,
) -> Vec<u8> {
    let scale = in_h as f32 / out_h as f32;
    let filterscale = scale.max(1.0);
    let support = filter.support() * filterscale;

    let mut out = vec![0u8; out_h * width * 3];
    for oy in 0..out_h {
        let center = (oy as f32 + 0.5) * scale;
        let ymin = ((center - support + 0.5).floor() as i32).max(0) as usize;
        let ymax = ((center + support + 0.5).floor() as i32).min(in_h as i32) as usize;
        for x in 0..width {
            for c in 0..3 {
                let mut sum = 0.0f32;
                let mut wsum = 0.0f32;
                for y in ymin..ymax {
                    let dist = (y as f32 + 0.5 - center) / filterscale;
                    let weight = filter.weight(dist);
                    sum += f32::from(input[(y * width + x) * 3 + c]) * weight;
                    wsum += weight;
                }
                let value = if wsum != 0.0 { sum / wsum } else { 0.0 };
                out[(oy * width + x) * 3 + c] = (value + 0.5).floor().clamp(0.0, 255.0) as u8;
            }
        }
    }
    out
}

/// Resize an RGB page with the given filter.
#[must_use = "returns the resized page"]
pub fn resize_rgb(page: &PageImage, out_w: u32, out_h: u32, filter: ResampleFilter) -> PageImage {
    if page.width() == out_w && page.height() == out_h {
        return page.clone();
    }
    let in_h = page.height() as usize;
    let in_w = page.width() as usize;
    let horizontal = horizontal_pass(page.pixels(), in_h, in_w, out_w as usize, filter);
    let pixels = vertical_pass(&horizontal, in_h, out_w as usize, out_h as usize, filter);
    PageImage::from_rgb(out_w, out_h, pixels).expect("resized buffer sized correctly")
}

/// Convert an RGB page into a channel-first normalized f32 tensor.
///
/// Pixels are scaled to `[0, 1]`; when `mean`/`std` are given each channel is
/// additionally standardized as `(v - mean[c]) / std[c]`.
#[must_use = "returns the normalized tensor"]
pub fn normalize_to_chw(
    page: &PageImage,
    mean: Option<[f32; 3]>,
    std: Option<[f32; 3]>,
) -> Array3<f32> {
    let h = page.height() as usize;
    let w = page.width() as usize;
    let mean = mean.unwrap_or([0.0; 3]);
    let std = std.unwrap_or([1.0; 3]);
    let pixels = page.pixels();
    let mut out = Array3::<f32>::zeros((3, h, w));
    {
        let out_slice = out.as_slice_mut().expect("contiguous tensor");
        for y in 0..h {
            for x in 0..w {
                let src = (y * w + x) * 3;
                for c in 0..3 {
                    let v = f32::from(pixels[src + c]) / 255.0;
                    out_slice[(c * h + y) * w + x] = (v - mean[c]) / std[c];
                }
            }
        }
    }
    out
}

/// Recognizer "smart resize": pick output dimensions that are multiples of
/// `factor` with total pixel count inside `[min_pixels, max_pixels]`.
///
/// Fails when the aspect ratio exceeds 200. Shrinking floors toward the
/// factor; growing ceils.
pub fn smart_resize_dims(
    height: usize,
    width: usize,
    factor: usize,
    min_pixels: usize,
    max_pixels: usize,
) -> Result<(usize, usize)> {
    const MAX_RATIO: f32 = 200.0;
    if height == 0 || width == 0 {
        return Err(GlmOcrError::config("smart resize on empty image"));
    }
    let ratio = height.max(width) as f32 / height.min(width) as f32;
    if ratio > MAX_RATIO {
        return Err(GlmOcrError::config(format!(
            "absolute aspect ratio must be smaller than {MAX_RATIO}, got {ratio:.2}"
        )));
    }

    let round_by = |v: usize| -> usize { ((v as f32 / factor as f32).round() as usize).max(1) * factor };
    let floor_by = |v: f32| -> usize { ((v / factor as f32).floor() as usize).max(1) * factor };
    let ceil_by = |v: f32| -> usize { ((v / factor as f32).ceil() as usize).max(1) * factor };

    let mut h_bar = round_by(height);
    let mut w_bar = round_by(width);

    if h_bar * w_bar > max_pixels {
        let beta = ((height * width) as f32 / max_pixels as f32).sqrt();
        h_bar = floor_by(height as f32 / beta);
        w_bar = floor_by(width as f32 / beta);
    } else if h_bar * w_bar < min_pixels {
        let beta = (min_pixels as f32 / (height * width) as f32).sqrt();
        h_bar = ceil_by(height as f32 * beta);
        w_bar = ceil_by(width as f32 * beta);
    }
    Ok((h_bar, w_bar))
}
