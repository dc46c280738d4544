//! Recognizer vision tower: patch embedding, windowed rotary
//! self-attention, and the spatial merger.
#![allow(clippy::cast_precision_loss)]

use ndarray::{concatenate, Array2, Array4, Axis};

use crate::error::{GlmOcrError, Result};
use crate::tensor::{
    gelu_inplace, merge_heads, scaled_dot_attention, silu, split_heads,
};
use crate::weights::{LayerNorm, Linear, RmsNorm, TensorMap};

use super::config::VisionConfig;
use super::rope::{apply_rotary, vision_rotary};

const VISION_ROPE_THETA: f32 = 10_000.0;

/// One transformer block of the tower.
#[derive(Debug)]
struct VisionBlock {
    norm1: RmsNorm,
    qkv: Linear,
    q_norm: RmsNorm,
    k_norm: RmsNorm,
    proj: Linear,
    norm2: RmsNorm,
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
    num_heads: usize,
}

impl VisionBlock {
    fn load(weights: &mut TensorMap, prefix: &str, config: &VisionConfig) -> Result<Self> {
        let eps = config.rms_norm_eps;
        Ok(Self {
            norm1: RmsNorm::load(weights, &format!("{prefix}.norm1"), eps)?,
            qkv: Linear::load(weights, &format!("{prefix}.attn.qkv"))?,
            q_norm: RmsNorm::load(weights, &format!("{prefix}.attn.q_norm"), eps)?,
            k_norm: RmsNorm::load(weights, &format!("{prefix}.attn.k_norm"), eps)?,
            proj: Linear::load(weights, &format!("{prefix}.attn.proj"))?,
            norm2: RmsNorm::load(weights, &format!("{prefix}.norm2"), eps)?,
            gate_proj: Linear::load(weights, &format!("{prefix}.mlp.gate_proj"))?,
            up_proj: Linear::load(weights, &format!("{prefix}.mlp.up_proj"))?,
            down_proj: Linear::load(weights, &format!("{prefix}.mlp.down_proj"))?,
            num_heads: config.num_heads,
        })
    }

    /// `segments` are `(start, end)` row ranges; attention never crosses a
    /// segment boundary.
    fn forward(
        &self,
        x: &Array2<f32>,
        cos: &Array2<f32>,
        sin: &Array2<f32>,
        segments: &[(usize, usize)],
    ) -> Array2<f32> {
        let hidden = x.ncols();
        let normed = self.norm1.forward(x.view());
        let qkv = self.qkv.forward(normed.view());

        let mut attn_out = Array2::<f32>::zeros((x.nrows(), hidden));
        for &(start, end) in segments {
            let seg = qkv.slice(ndarray::s![start..end, ..]);
            let mut q = split_heads(seg.slice(ndarray::s![.., ..hidden]), self.num_heads);
            let mut k = split_heads(
                seg.slice(ndarray::s![.., hidden..2 * hidden]),
                self.num_heads,
            );
            let v = split_heads(seg.slice(ndarray::s![.., 2 * hidden..]), self.num_heads);

            // Per-head RMS norm, then rotary.
            for mut head in q.axis_iter_mut(Axis(0)) {
                for mut row in head.axis_iter_mut(Axis(0)) {
                    self.q_norm
                        .forward_1d(row.as_slice_mut().expect("contiguous q row"));
                }
            }
            for mut head in k.axis_iter_mut(Axis(0)) {
                for mut row in head.axis_iter_mut(Axis(0)) {
                    self.k_norm
                        .forward_1d(row.as_slice_mut().expect("contiguous k row"));
                }
            }
            let seg_cos = cos.slice(ndarray::s![start..end, ..]).to_owned();
            let seg_sin = sin.slice(ndarray::s![start..end, ..]).to_owned();
            apply_rotary(&mut q, &seg_cos, &seg_sin);
            apply_rotary(&mut k, &seg_cos, &seg_sin);

            let head_dim = hidden / self.num_heads;
            let ctx = scaled_dot_attention(
                q.view(),
                k.view(),
                v.view(),
                None,
                1.0 / (head_dim as f32).sqrt(),
            );
            attn_out
                .slice_mut(ndarray::s![start..end, ..])
                .assign(&merge_heads(ctx.view()));
        }

        let x = x + &self.proj.forward(attn_out.view());

        let normed = self.norm2.forward(x.view());
        let gate = self.gate_proj.forward(normed.view());
        let up = self.up_proj.forward(normed.view());
        let mut fused = Array2::<f32>::zeros(gate.raw_dim());
        ndarray::Zip::from(&mut fused)
            .and(&gate)
            .and(&up)
            .for_each(|f, g, u| *f = silu(*g) * *u);
        &x + &self.down_proj.forward(fused.view())
    }
}

/// The vision tower.
pub struct VisionTower {
    patch_embed: Linear,
    blocks: Vec<VisionBlock>,
    post_norm: RmsNorm,
    downsample_weight: Array4<f32>,
    downsample_bias: Option<ndarray::Array1<f32>>,
    merger_proj: Linear,
    merger_norm: LayerNorm,
    merger_gate: Linear,
    merger_up: Linear,
    merger_down: Linear,
    config: VisionConfig,
}

impl std::fmt::Debug for VisionTower {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VisionTower")
            .field("depth", &self.blocks.len())
            .field("hidden_size", &self.config.hidden_size)
            .finish()
    }
}

impl VisionTower {
    pub fn load(weights: &mut TensorMap, config: &VisionConfig) -> Result<Self> {
        let mut blocks = Vec::with_capacity(config.depth);
        for i in 0..config.depth {
            blocks.push(VisionBlock::load(
                weights,
                &format!("vision_tower.blocks.{i}"),
                config,
            )?);
        }
        Ok(Self {
            patch_embed: Linear::load(weights, "vision_tower.patch_embed.proj")?,
            blocks,
            post_norm: RmsNorm::load(weights, "vision_tower.post_layernorm", config.rms_norm_eps)?,
            downsample_weight: weights.take4("vision_tower.downsample.weight")?,
            downsample_bias: weights.take1("vision_tower.downsample.bias").ok(),
            merger_proj: Linear::load(weights, "vision_tower.merger.proj")?,
            merger_norm: LayerNorm::load(weights, "vision_tower.merger.post_projection_norm", 1e-5)?,
            merger_gate: Linear::load(weights, "vision_tower.merger.gate_proj")?,
            merger_up: Linear::load(weights, "vision_tower.merger.up_proj")?,
            merger_down: Linear::load(weights, "vision_tower.merger.down_proj")?,
            config: config.clone(),
        })
    }

    /// Encode patchified pixels into `(sum t*h*w / merge^2, out_hidden)`
    /// visual features.
    pub fn forward(
        &self,
        pixel_values: &Array2<f32>,
        grids: &[(usize, usize, usize)],
    ) -> Result<Array2<f32>> {
        let total: usize = grids.iter().map(|(t, h, w)| t * h * w).sum();
        if pixel_values.nrows() != total {
            return Err(GlmOcrError::inference(
                "Recognizer",
                format!(
                    "pixel rows {} do not match grid total {total}",
                    pixel_values.nrows()
                ),
            ));
        }

        let mut x = self.patch_embed.forward(pixel_values.view());

        // Cumulative sequence lengths: one window per (image, frame).
        let mut segments = Vec::new();
        let mut row = 0usize;
        for &(t, h, w) in grids {
            for _ in 0..t {
                segments.push((row, row + h * w));
                row += h * w;
            }
        }

        let head_dim = self.config.hidden_size / self.config.num_heads;
        let (half_cos, half_sin) = vision_rotary(grids, head_dim, VISION_ROPE_THETA);
        let cos = concatenate(Axis(1), &[half_cos.view(), half_cos.view()])
            .expect("rotary duplication");
        let sin = concatenate(Axis(1), &[half_sin.view(), half_sin.view()])
            .expect("rotary duplication");

        for block in &self.blocks {
            x = block.forward(&x, &cos, &sin, &segments);
        }
        let x = self.post_norm.forward(x.view());

        // Spatial 2x downsample per image frame, then the patch merger.
        let merged = self.downsample(&x, grids)?;
        let h = self.merger_proj.forward(merged.view());
        let mut h = self.merger_norm.forward(h.view());
        gelu_inplace(h.as_slice_mut().expect("contiguous merger"));
        let gate = self.merger_gate.forward(h.view());
        let up = self.merger_up.forward(h.view());
        let mut fused = Array2::<f32>::zeros(gate.raw_dim());
        ndarray::Zip::from(&mut fused)
            .and(&gate)
            .and(&up)
            .for_each(|f, g, u| *f = silu(*g) * *u);
        Ok(self.merger_down.forward(fused.view()))
    }

    /// Conv2d with stride = kernel = `spatial_merge` over each frame's patch
    /// grid.
    fn downsample(
        &self,
        x: &Array2<f32>,
        grids: &[(usize, usize, usize)],
    ) -> Result<Array2<f32>> {
        let m = self.config.spatial_merge_size;
        let hidden = self.config.hidden_size;
        let (out_ch, in_ch, kh, kw) = self.downsample_weight.dim();
        if in_ch != hidden || kh != m || kw != m {
            return Err(GlmOcrError::config(format!(
                "downsample weight {:?} does not match hidden {hidden} merge {m}",
                self.downsample_weight.dim()
            )));
        }

        let out_rows: usize = grids.iter().map(|(t, h, w)| t * (h / m) * (w / m)).sum();
        let mut out = Array2::<f32>::zeros((out_rows, out_ch));
        let mut src_row = 0usize;
        let mut dst_row = 0usize;
        for &(t, gh, gw) in grids {
            for _ in 0..t {
                for by in 0..gh / m {
                    for bx in 0..gw / m {
                        for oc in 0..out_ch {
                            let mut acc =
                                self.downsample_bias.as_ref().map_or(0.0, |b| b[oc]);
                            for ky in 0..m {
                                for kx in 0..m {
                                    let patch =
                                        src_row + (by * m + ky) * gw + bx * m + kx;
                                    for ic in 0..hidden {
                                        acc += x[[patch, ic]]
                                            * self.downsample_weight[[oc, ic, ky, kx]];
                                    }
                                }
                            }
                            out[[dst_row, oc]] = acc;
                        }
                        dst_row += 1;
                    }
                }
                src_row += gh * gw;
            }
        }
        Ok(out)
    }
}
