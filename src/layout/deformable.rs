//! Multi-scale deformable cross-attention.
//!
//! Each (query, head, level, point) samples the projected encoder features
//! at a learned continuous coordinate via bilinear interpolation, weights it
//! with a per-head softmax over `levels x points`, and sums. Out-of-bounds
//! samples contribute zero. The per-batch/per-head loops are flattened into
//! linear index arithmetic over the contiguous value buffer.
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_wrap)]

use ndarray::{Array2, ArrayView2};

use crate::error::{GlmOcrError, Result};
use crate::tensor::softmax_1d;
use crate::weights::{Linear, TensorMap};

#[derive(Debug)]
pub struct DeformableAttention {
    sampling_offsets: Linear,
    attention_weights: Linear,
    value_proj: Linear,
    output_proj: Linear,
    num_heads: usize,
    num_levels: usize,
    num_points: usize,
    head_dim: usize,
}

impl DeformableAttention {
    pub fn load(
        weights: &mut TensorMap,
        prefix: &str,
        d_model: usize,
        num_heads: usize,
        num_levels: usize,
        num_points: usize,
    ) -> Result<Self> {
        if d_model % num_heads != 0 {
            return Err(GlmOcrError::config(format!(
                "d_model {d_model} not divisible by {num_heads} heads"
            )));
        }
        Ok(Self {
            sampling_offsets: Linear::load(weights, &format!("{prefix}.sampling_offsets"))?,
            attention_weights: Linear::load(weights, &format!("{prefix}.attention_weights"))?,
            value_proj: Linear::load(weights, &format!("{prefix}.value_proj"))?,
            output_proj: Linear::load(weights, &format!("{prefix}.output_proj"))?,
            num_heads,
            num_levels,
            num_points,
            head_dim: d_model / num_heads,
        })
    }

    /// Attend from `queries` into the flattened multi-level encoder states.
    ///
    /// * `queries` - `(Q, d_model)`, position embedding already added
    /// * `encoder_states` - `(sum(h*w), d_model)` in level order
    /// * `spatial_shapes` - `(h, w)` per level
    /// * `reference_points` - `(Q, 2)` centers or `(Q, 4)` `cx,cy,w,h`,
    ///   normalized coordinates shared across levels
    pub fn forward(
        &self,
        queries: ArrayView2<f32>,
        encoder_states: ArrayView2<f32>,
        spatial_shapes: &[(usize, usize)],
        reference_points: ArrayView2<f32>,
    ) -> Result<Array2<f32>> {
        let num_queries = queries.nrows();
        let d_model = self.num_heads * self.head_dim;
        let total: usize = spatial_shapes.iter().map(|(h, w)| h * w).sum();
        if encoder_states.nrows() != total {
            return Err(GlmOcrError::inference(
                "DeformableAttention",
                format!(
                    "encoder sequence {} does not match spatial shapes sum {total}",
                    encoder_states.nrows()
                ),
            ));
        }
        let num_coordinates = reference_points.ncols();
        if num_coordinates != 2 && num_coordinates != 4 {
            return Err(GlmOcrError::inference(
                "DeformableAttention",
                format!("reference points must have 2 or 4 coordinates, got {num_coordinates}"),
            ));
        }

        let value = self.value_proj.forward(encoder_states);
        let value_slice = value.as_slice().expect("contiguous value");

        // Row offset of each level inside the flattened value tensor.
        let mut level_starts = Vec::with_capacity(self.num_levels);
        let mut acc = 0usize;
        for (h, w) in spatial_shapes {
            level_starts.push(acc);
            acc += h * w;
        }

        let offsets = self.sampling_offsets.forward(queries);
        let mut attn = self.attention_weights.forward(queries);

        // Per-head softmax over levels * points.
        let lp = self.num_levels * self.num_points;
        for q in 0..num_queries {
            let row = attn.row_mut(q).into_slice().expect("contiguous attention row");
            for h in 0..self.num_heads {
                softmax_1d(&mut row[h * lp..(h + 1) * lp]);
            }
        }

        let mut output = Array2::<f32>::zeros((num_queries, d_model));
        for q in 0..num_queries {
            let rp = reference_points.row(q);
            for head in 0..self.num_heads {
                let out_base = head * self.head_dim;
                for level in 0..self.num_levels {
                    let (lh, lw) = spatial_shapes[level];
                    let start = level_starts[level];
                    for point in 0..self.num_points {
                        let flat = (head * self.num_levels + level) * self.num_points + point;
                        let off_x = offsets[[q, flat * 2]];
                        let off_y = offsets[[q, flat * 2 + 1]];
                        let weight = attn[[q, flat]];

                        let (loc_x, loc_y) = if num_coordinates == 4 {
                            let scale = 0.5 / self.num_points as f32;
                            (
                                rp[0] + off_x * scale * rp[2],
                                rp[1] + off_y * scale * rp[3],
                            )
                        } else {
                            (rp[0] + off_x / lw as f32, rp[1] + off_y / lh as f32)
                        };

                        // Normalized -> level pixel coordinates.
                        let px = loc_x * lw as f32 - 0.5;
                        let py = loc_y * lh as f32 - 0.5;

                        let x0 = px.floor() as isize;
                        let y0 = py.floor() as isize;
                        let fx = px - x0 as f32;
                        let fy = py - y0 as f32;

                        for (dy, wy) in [(0isize, 1.0 - fy), (1, fy)] {
                            let yy = y0 + dy;
                            if yy < 0 || yy >= lh as isize {
                                continue;
                            }
                            for (dx, wx) in [(0isize, 1.0 - fx), (1, fx)] {
                                let xx = x0 + dx;
                                if xx < 0 || xx >= lw as isize {
                                    continue;
                                }
                                let tap = weight * wy * wx;
                                if tap == 0.0 {
                                    continue;
                                }
                                let row =
                                    start + yy as usize * lw + xx as usize;
                                let src = row * d_model + out_base;
                                for c in 0..self.head_dim {
                                    output[[q, out_base + c]] +=
                                        value_slice[src + c] * tap;
                                }
                            }
                        }
                    }
                }
            }
        }

        Ok(self.output_proj.forward(output.view()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, ArrayD, IxDyn};
    use rustc_hash::FxHashMap;

    /// Builds a deformable module whose projections are identity-like and
    /// whose offsets are zero, so each query samples exactly at its
    /// reference point.
    fn identity_module(d_model: usize, heads: usize, levels: usize, points: usize) -> DeformableAttention {
        let mut tensors = FxHashMap::default();
        let lp2 = heads * levels * points * 2;
        let lp = heads * levels * points;
        tensors.insert(
            "attn.sampling_offsets.weight".to_string(),
            ArrayD::zeros(IxDyn(&[lp2, d_model])),
        );
        tensors.insert(
            "attn.sampling_offsets.bias".to_string(),
            ArrayD::zeros(IxDyn(&[lp2])),
        );
        tensors.insert(
            "attn.attention_weights.weight".to_string(),
            ArrayD::zeros(IxDyn(&[lp, d_model])),
        );
        tensors.insert(
            "attn.attention_weights.bias".to_string(),
            ArrayD::zeros(IxDyn(&[lp])),
        );
        let mut eye = Array2::<f32>::zeros((d_model, d_model));
        for i in 0..d_model {
            eye[[i, i]] = 1.0;
        }
        tensors.insert(
            "attn.value_proj.weight".to_string(),
            eye.clone().into_dyn(),
        );
        tensors.insert("attn.output_proj.weight".to_string(), eye.into_dyn());
        let mut map = TensorMap::from_tensors(tensors);
        DeformableAttention::load(&mut map, "attn", d_model, heads, levels, points).unwrap()
    }

    #[test]
    fn test_zero_offsets_sample_reference_point() {
        let d_model = 4;
        let attn = identity_module(d_model, 2, 1, 1);
        // One 2x2 level; feature value at each pixel equals its row index.
        let mut states = Array2::<f32>::zeros((4, d_model));
        for r in 0..4 {
            for c in 0..d_model {
                states[[r, c]] = r as f32;
            }
        }
        // Reference at the center of pixel (1, 1) -> row 3.
        let refs = ndarray::arr2(&[[0.75f32, 0.75, 0.1, 0.1]]);
        let queries = Array2::<f32>::zeros((1, d_model));
        let out = attn
            .forward(queries.view(), states.view(), &[(2, 2)], refs.view())
            .unwrap();
        for c in 0..d_model {
            assert!((out[[0, c]] - 3.0).abs() < 1e-5, "channel {c}: {}", out[[0, c]]);
        }
    }

    #[test]
    fn test_sequence_mismatch_rejected() {
        let attn = identity_module(4, 2, 1, 1);
        let states = Array2::<f32>::zeros((3, 4));
        let refs = ndarray::arr2(&[[0.5f32, 0.5]]);
        let queries = Array2::<f32>::zeros((1, 4));
        assert!(attn
            .forward(queries.view(), states.view(), &[(2, 2)], refs.view())
            .is_err());
    }

    #[test]
    fn test_out_of_bounds_reference_contributes_zero() {
        let attn = identity_module(4, 2, 1, 1);
        let states = Array2::<f32>::ones((4, 4));
        let refs = ndarray::arr2(&[[5.0f32, 5.0, 0.1, 0.1]]);
        let queries = Array2::<f32>::zeros((1, 4));
        let out = attn
            .forward(queries.view(), states.view(), &[(2, 2)], refs.view())
            .unwrap();
        for c in 0..4 {
            assert_eq!(out[[0, c]], 0.0);
        }
    }
}
