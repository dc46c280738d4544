//! Multimodal rotary position indexing (M-RoPE).
//!
//! Text tokens advance all three axes together; vision spans get per-axis
//! positions `(t, h/merge, w/merge)`. The rotary dimensions are partitioned
//! into `(t, h, w)` sections, rotated with the half-rotation scheme.
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_wrap)]

use ndarray::{Array2, Array3, ArrayView2};

use super::config::TextConfig;
use crate::error::{GlmOcrError, Result};

/// Per-token positions on the three rotary axes, `(3, L)`.
pub type Positions = Array2<i64>;

/// Result of a position walk: per-axis positions and the decode-time delta.
#[derive(Debug, Clone)]
pub struct RopeIndex {
    pub positions: Positions,
    /// `max_position + 1 - sequence_length`; added to the cache offset to
    /// derive positions for subsequent single-token decode steps.
    pub delta: i64,
}

/// Walk a token sequence and assign M-RoPE positions.
///
/// `grids` supplies one `(t, h, w)` entry per placeholder span, already in
/// patch units (pre-merge). Without vision tokens the positions reduce to
/// `0..L` broadcast across axes.
pub fn get_rope_index(
    input_ids: &[u32],
    grids: &[(usize, usize, usize)],
    merge_size: usize,
    image_token_id: u32,
    video_token_id: u32,
    image_start_token_id: u32,
) -> Result<RopeIndex> {
    let len = input_ids.len();
    let mut positions = Array2::<i64>::zeros((3, len));

    if grids.is_empty() {
        for (i, mut col) in positions.axis_iter_mut(ndarray::Axis(1)).enumerate() {
            col.fill(i as i64);
        }
        return Ok(RopeIndex {
            positions,
            delta: 0,
        });
    }

    // Spans start after any image-start markers preceding the first vision
    // token; the marker count doubles as a sanity check on the grid list.
    let first_vision = input_ids
        .iter()
        .position(|id| *id == image_token_id || *id == video_token_id)
        .ok_or_else(|| {
            GlmOcrError::inference("Recognizer", "grids provided but no vision tokens present")
        })?;
    let start_markers = input_ids[..first_vision]
        .iter()
        .filter(|id| **id == image_start_token_id)
        .count();
    if start_markers > grids.len() {
        return Err(GlmOcrError::inference(
            "Recognizer",
            format!(
                "{start_markers} image spans announced but only {} grids supplied",
                grids.len()
            ),
        ));
    }

    let mut cursor = 0usize; // token index
    let mut st_idx = 0i64; // next position value
    let mut out_col = 0usize;
    for &(t, h, w) in grids {
        // Find the next placeholder run.
        let span_start = input_ids[cursor..]
            .iter()
            .position(|id| *id == image_token_id || *id == video_token_id)
            .map(|p| cursor + p)
            .ok_or_else(|| {
                GlmOcrError::inference("Recognizer", "fewer placeholder runs than grids")
            })?;

        // Text before the span: all three axes advance together.
        for _ in cursor..span_start {
            for axis in 0..3 {
                positions[[axis, out_col]] = st_idx;
            }
            st_idx += 1;
            out_col += 1;
        }

        let llm_h = h / merge_size;
        let llm_w = w / merge_size;
        let span_len = t * llm_h * llm_w;
        for ti in 0..t {
            for hi in 0..llm_h {
                for wi in 0..llm_w {
                    positions[[0, out_col]] = st_idx + ti as i64;
                    positions[[1, out_col]] = st_idx + hi as i64;
                    positions[[2, out_col]] = st_idx + wi as i64;
                    out_col += 1;
                }
            }
        }
        st_idx += t.max(llm_h).max(llm_w) as i64;
        cursor = span_start + span_len;
    }

    // Tail text.
    for _ in cursor..len {
        for axis in 0..3 {
            positions[[axis, out_col]] = st_idx;
        }
        st_idx += 1;
        out_col += 1;
    }
    if out_col != len {
        return Err(GlmOcrError::inference(
            "Recognizer",
            format!("position walk covered {out_col} of {len} tokens"),
        ));
    }

    let max_pos = positions.iter().copied().max().unwrap_or(0);
    Ok(RopeIndex {
        positions,
        delta: max_pos + 1 - len as i64,
    })
}

/// Positions for a decode step: `cache_offset + (0..len) + delta` on all
/// axes.
#[must_use]
pub fn decode_positions(cache_offset: usize, len: usize, delta: i64) -> Positions {
    let mut positions = Array2::<i64>::zeros((3, len));
    for i in 0..len {
        let p = cache_offset as i64 + i as i64 + delta;
        for axis in 0..3 {
            positions[[axis, i]] = p;
        }
    }
    positions
}

/// Cos/sin tables `(L, rotary_dim)` from per-axis positions.
///
/// Frequency `i` of the half-dimension belongs to the axis whose
/// `mrope_section` bucket contains it; the half tables are duplicated to the
/// full rotary width for the half-rotation scheme.
#[must_use]
pub fn mrope_cos_sin(positions: ArrayView2<i64>, config: &TextConfig) -> (Array2<f32>, Array2<f32>) {
    let len = positions.ncols();
    let rotary = config.rotary_dim();
    let half = rotary / 2;
    let sections = config.mrope_section;
    let mut cos = Array2::<f32>::zeros((len, rotary));
    let mut sin = Array2::<f32>::zeros((len, rotary));
    for i in 0..half {
        let axis = if i < sections[0] {
            0
        } else if i < sections[0] + sections[1] {
            1
        } else {
            2
        };
        let inv_freq = 1.0 / config.rope_theta.powf(2.0 * i as f32 / rotary as f32);
        for l in 0..len {
            let angle = positions[[axis, l]] as f32 * inv_freq;
            let (s, c) = angle.sin_cos();
            cos[[l, i]] = c;
            cos[[l, half + i]] = c;
            sin[[l, i]] = s;
            sin[[l, half + i]] = s;
        }
    }
    (cos, sin)
}

/// Apply half-rotation rotary embedding to the leading `rotary_dim` channels
/// of every head, in place.
///
/// `x` is `(H, L, D)`; `cos`/`sin` are `(L, rotary_dim)`.
pub fn apply_rotary(x: &mut Array3<f32>, cos: &Array2<f32>, sin: &Array2<f32>) {
    let (heads, len, _d) = x.dim();
    let rotary = cos.ncols();
    let half = rotary / 2;
    for h in 0..heads {
        for l in 0..len {
            for i in 0..half {
                let a = x[[h, l, i]];
                let b = x[[h, l, half + i]];
                let c0 = cos[[l, i]];
                let s0 = sin[[l, i]];
                // rotate_half: (a, b) -> (a*c - b*s, b*c + a*s)
                x[[h, l, i]] = a * c0 - b * s0;
                x[[h, l, half + i]] = b * cos[[l, half + i]] + a * sin[[l, half + i]];
            }
        }
    }
}

/// Per-patch rotary table for the vision tower: a 2-way `(h, w)` interleave.
///
/// Returns `(L, head_dim / 2)` cos and sin tables; the first half of the
/// frequencies carries the row coordinate, the second half the column.
#[must_use]
pub fn vision_rotary(
    grids: &[(usize, usize, usize)],
    head_dim: usize,
    theta: f32,
) -> (Array2<f32>, Array2<f32>) {
    let half = head_dim / 2;
    let quarter = half / 2;
    let total: usize = grids.iter().map(|(t, h, w)| t * h * w).sum();
    let mut cos = Array2::<f32>::zeros((total, half));
    let mut sin = Array2::<f32>::zeros((total, half));
    let mut row = 0usize;
    for &(t, h, w) in grids {
        for _ in 0..t {
            for hi in 0..h {
                for wi in 0..w {
                    for i in 0..quarter {
                        let inv_freq = 1.0 / theta.powf(2.0 * i as f32 / half as f32);
                        let (hs, hc) = (hi as f32 * inv_freq).sin_cos();
                        let (ws, wc) = (wi as f32 * inv_freq).sin_cos();
                        cos[[row, i]] = hc;
                        sin[[row, i]] = hs;
                        cos[[row, quarter + i]] = wc;
                        sin[[row, quarter + i]] = ws;
                    }
                    row += 1;
                }
            }
        }
    }
    (cos, sin)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_only_positions_are_arange() {
        let ids = vec![5, 6, 7, 8];
        let index = get_rope_index(&ids, &[], 2, 100, 101, 102).unwrap();
        for axis in 0..3 {
            for i in 0..4 {
                assert_eq!(index.positions[[axis, i]], i as i64);
            }
        }
        assert_eq!(index.delta, 0);
    }

    #[test]
    fn test_vision_span_positions() {
        // [text, start, img x 4, end, text] with a (1, 4, 4) grid merged 2x
        // -> 4 placeholder tokens.
        let img = 100u32;
        let ids = vec![1, 102, img, img, img, img, 103, 2];
        let index = get_rope_index(&ids, &[(1, 4, 4)], 2, img, 101, 102).unwrap();
        // Text prefix: positions 0, 1 on all axes.
        assert_eq!(index.positions[[0, 0]], 0);
        assert_eq!(index.positions[[2, 1]], 1);
        // Vision span starts at 2: t axis constant, h/w vary.
        assert_eq!(index.positions[[0, 2]], 2);
        assert_eq!(index.positions[[1, 2]], 2);
        assert_eq!(index.positions[[2, 3]], 3); // second column
        assert_eq!(index.positions[[1, 4]], 3); // second row
        // Tail resumes after max span extent (2 rows/cols -> st_idx 4).
        assert_eq!(index.positions[[0, 6]], 4);
        assert_eq!(index.positions[[0, 7]], 5);
        // delta = max_pos + 1 - len = 5 + 1 - 8.
        assert_eq!(index.delta, -2);
    }

    #[test]
    fn test_decode_positions_use_delta() {
        let positions = decode_positions(10, 1, -2);
        assert_eq!(positions[[0, 0]], 8);
        assert_eq!(positions[[2, 0]], 8);
    }

    #[test]
    fn test_mrope_cos_sin_axis_partition() {
        let config = TextConfig::default();
        // Distinct positions per axis so the partition is observable.
        let mut positions = Array2::<i64>::zeros((3, 1));
        positions[[0, 0]] = 0;
        positions[[1, 0]] = 7;
        positions[[2, 0]] = 13;
        let (cos, _sin) = mrope_cos_sin(positions.view(), &config);
        assert_eq!(cos.dim(), (1, 64));
        // Frequency 0 belongs to the t axis at position 0 -> cos = 1.
        assert!((cos[[0, 0]] - 1.0).abs() < 1e-6);
        // A frequency in the h section sees position 7.
        let i = config.mrope_section[0]; // first h frequency
        let inv = 1.0 / config.rope_theta.powf(2.0 * i as f32 / 64.0);
        assert!((cos[[0, i]] - (7.0 * inv).cos()).abs() < 1e-5);
    }

    #[test]
    fn test_apply_rotary_position_zero_is_identity() {
        let config = TextConfig::default();
        let positions = Array2::<i64>::zeros((3, 2));
        let (cos, sin) = mrope_cos_sin(positions.view(), &config);
        let mut x = Array3::<f32>::ones((1, 2, 128));
        let before = x.clone();
        apply_rotary(&mut x, &cos, &sin);
        for (a, b) in x.iter().zip(before.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_vision_rotary_shapes() {
        let (cos, sin) = vision_rotary(&[(1, 2, 3)], 64, 10_000.0);
        assert_eq!(cos.dim(), (6, 32));
        assert_eq!(sin.dim(), (6, 32));
        // First patch at (0, 0): identity rotation.
        for i in 0..32 {
            assert!((cos[[0, i]] - 1.0).abs() < 1e-6);
            assert!(sin[[0, i]].abs() < 1e-6);
        }
    }
}
