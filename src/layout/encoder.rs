//! Hybrid encoder: input projections, AIFI self-attention at the coarsest
//! level, FPN top-down and PAN bottom-up fusion, and the mask-feature head.
#![allow(clippy::cast_precision_loss)]

use ndarray::{concatenate, Array2, Array3, Axis};

use crate::error::Result;
use crate::tensor::{
    merge_heads, resize_bilinear, scaled_dot_attention, split_heads, upsample_bilinear_2x,
    upsample_nearest_2x, Conv2dParams,
};
use crate::weights::{LayerNorm, Linear, TensorMap};

use super::backbone::{Activation, BackboneFeatures, ConvNorm};
use super::config::LayoutModelConfig;

const LN_EPS: f32 = 1e-5;

/// Flatten a `(C, H, W)` map into a `(H*W, C)` token sequence.
fn flatten_hw(x: &Array3<f32>) -> Array2<f32> {
    let (c, h, w) = x.dim();
    let mut out = Array2::<f32>::zeros((h * w, c));
    for ch in 0..c {
        for y in 0..h {
            for xx in 0..w {
                out[[y * w + xx, ch]] = x[[ch, y, xx]];
            }
        }
    }
    out
}

/// Inverse of [`flatten_hw`].
fn unflatten_hw(x: &Array2<f32>, h: usize, w: usize) -> Array3<f32> {
    let c = x.ncols();
    let mut out = Array3::<f32>::zeros((c, h, w));
    for ch in 0..c {
        for y in 0..h {
            for xx in 0..w {
                out[[ch, y, xx]] = x[[y * w + xx, ch]];
            }
        }
    }
    out
}

/// Sine-cosine 2D position embedding for a `w x h` grid.
///
/// Quarter of the channels each for sin/cos of x and y, with a 10000
/// temperature schedule.
fn sincos_position_embedding(w: usize, h: usize, dim: usize) -> Array2<f32> {
    const TEMPERATURE: f32 = 10_000.0;
    let pos_dim = dim / 4;
    let mut out = Array2::<f32>::zeros((h * w, dim));
    for y in 0..h {
        for x in 0..w {
            let row = y * w + x;
            for i in 0..pos_dim {
                let omega = 1.0 / TEMPERATURE.powf(i as f32 / pos_dim as f32);
                let wx = x as f32 * omega;
                let wy = y as f32 * omega;
                out[[row, i]] = wx.sin();
                out[[row, pos_dim + i]] = wx.cos();
                out[[row, 2 * pos_dim + i]] = wy.sin();
                out[[row, 3 * pos_dim + i]] = wy.cos();
            }
        }
    }
    out
}

/// One AIFI transformer-encoder layer (post-norm, ReLU FFN).
#[derive(Debug)]
struct AifiLayer {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    linear1: Linear,
    linear2: Linear,
    norm1: LayerNorm,
    norm2: LayerNorm,
    num_heads: usize,
}

impl AifiLayer {
    fn load(weights: &mut TensorMap, prefix: &str, num_heads: usize) -> Result<Self> {
        Ok(Self {
            q_proj: Linear::load(weights, &format!("{prefix}.self_attn.q_proj"))?,
            k_proj: Linear::load(weights, &format!("{prefix}.self_attn.k_proj"))?,
            v_proj: Linear::load(weights, &format!("{prefix}.self_attn.v_proj"))?,
            out_proj: Linear::load(weights, &format!("{prefix}.self_attn.out_proj"))?,
            linear1: Linear::load(weights, &format!("{prefix}.linear1"))?,
            linear2: Linear::load(weights, &format!("{prefix}.linear2"))?,
            norm1: LayerNorm::load(weights, &format!("{prefix}.norm1"), LN_EPS)?,
            norm2: LayerNorm::load(weights, &format!("{prefix}.norm2"), LN_EPS)?,
            num_heads,
        })
    }

    fn forward(&self, x: &Array2<f32>, pos: &Array2<f32>) -> Array2<f32> {
        let with_pos = x + pos;
        let q = split_heads(self.q_proj.forward(with_pos.view()).view(), self.num_heads);
        let k = split_heads(self.k_proj.forward(with_pos.view()).view(), self.num_heads);
        let v = split_heads(self.v_proj.forward(x.view()).view(), self.num_heads);
        let head_dim = q.dim().2;
        let attn = scaled_dot_attention(
            q.view(),
            k.view(),
            v.view(),
            None,
            1.0 / (head_dim as f32).sqrt(),
        );
        let attn = self.out_proj.forward(merge_heads(attn.view()).view());
        let x = self.norm1.forward((x + &attn).view());

        let mut ffn = self.linear1.forward(x.view());
        crate::tensor::relu_inplace(ffn.as_slice_mut().expect("contiguous ffn"));
        let ffn = self.linear2.forward(ffn.view());
        self.norm2.forward((&x + &ffn).view())
    }
}

/// RepVGG-style block: parallel 3x3 and 1x1 branches, summed, SiLU.
#[derive(Debug)]
struct RepVggBlock {
    conv3: ConvNorm,
    conv1: ConvNorm,
}

impl RepVggBlock {
    fn load(weights: &mut TensorMap, prefix: &str) -> Result<Self> {
        Ok(Self {
            conv3: ConvNorm::load(
                weights,
                &format!("{prefix}.conv3x3"),
                Conv2dParams::new(1, 1),
                Activation::None,
            )?,
            conv1: ConvNorm::load(
                weights,
                &format!("{prefix}.conv1x1"),
                Conv2dParams::new(1, 0),
                Activation::None,
            )?,
        })
    }

    fn forward(&self, x: &Array3<f32>) -> Array3<f32> {
        let mut out = self.conv3.forward(x);
        out += &self.conv1.forward(x);
        crate::tensor::silu_inplace(out.as_slice_mut().expect("contiguous"));
        out
    }
}

/// Cross-stage partial block: three RepVGG blocks in one branch summed with
/// a parallel 1x1 branch.
#[derive(Debug)]
struct CspRepLayer {
    conv1: ConvNorm,
    conv2: ConvNorm,
    bottlenecks: Vec<RepVggBlock>,
    conv3: Option<ConvNorm>,
}

impl CspRepLayer {
    fn load(weights: &mut TensorMap, prefix: &str) -> Result<Self> {
        let conv1 = ConvNorm::load(
            weights,
            &format!("{prefix}.conv1"),
            Conv2dParams::new(1, 0),
            Activation::Silu,
        )?;
        let conv2 = ConvNorm::load(
            weights,
            &format!("{prefix}.conv2"),
            Conv2dParams::new(1, 0),
            Activation::Silu,
        )?;
        let mut bottlenecks = Vec::with_capacity(3);
        for i in 0..3 {
            bottlenecks.push(RepVggBlock::load(
                weights,
                &format!("{prefix}.bottlenecks.{i}"),
            )?);
        }
        let conv3 = if weights.contains(&format!("{prefix}.conv3.conv.weight")) {
            Some(ConvNorm::load(
                weights,
                &format!("{prefix}.conv3"),
                Conv2dParams::new(1, 0),
                Activation::Silu,
            )?)
        } else {
            None
        };
        Ok(Self {
            conv1,
            conv2,
            bottlenecks,
            conv3,
        })
    }

    fn forward(&self, x: &Array3<f32>) -> Array3<f32> {
        let mut branch = self.conv1.forward(x);
        for block in &self.bottlenecks {
            branch = block.forward(&branch);
        }
        let out = branch + self.conv2.forward(x);
        match &self.conv3 {
            Some(conv) => conv.forward(&out),
            None => out,
        }
    }
}

/// One mask-feature scale head: a SiLU conv, then conv + 2x bilinear
/// upsample repeated until the base stride is reached.
#[derive(Debug)]
struct ScaleHead {
    convs: Vec<ConvNorm>,
}

impl ScaleHead {
    fn load(weights: &mut TensorMap, prefix: &str, num_steps: usize) -> Result<Self> {
        let mut convs = Vec::with_capacity(num_steps.max(1));
        for i in 0..num_steps.max(1) {
            convs.push(ConvNorm::load(
                weights,
                &format!("{prefix}.{i}"),
                Conv2dParams::new(1, 1),
                Activation::Silu,
            )?);
        }
        Ok(Self { convs })
    }

    fn forward(&self, x: &Array3<f32>, upsample_steps: usize) -> Array3<f32> {
        let mut cur = self.convs[0].forward(x);
        for i in 0..upsample_steps {
            cur = upsample_bilinear_2x(cur.view());
            if i + 1 < self.convs.len() {
                cur = self.convs[i + 1].forward(&cur);
            }
        }
        cur
    }
}

/// Encoder outputs: fused pyramid features (stride ascending) plus the
/// high-resolution mask features.
#[derive(Debug)]
pub struct EncoderOutputs {
    /// Level features at strides 8, 16, 32, each `(d_model, H_l, W_l)`.
    pub features: Vec<Array3<f32>>,
    /// `(mask_channels, Mh, Mw)` mask features at the x4 resolution.
    pub mask_features: Array3<f32>,
}

/// The full hybrid encoder.
#[derive(Debug)]
pub struct LayoutEncoder {
    input_proj: Vec<ConvNorm>,
    aifi: Vec<AifiLayer>,
    encode_proj_layers: Vec<usize>,
    lateral_convs: Vec<ConvNorm>,
    fpn_blocks: Vec<CspRepLayer>,
    downsample_convs: Vec<ConvNorm>,
    pan_blocks: Vec<CspRepLayer>,
    scale_heads: Vec<ScaleHead>,
    mask_output_conv: ConvNorm,
    x4_lateral: ConvNorm,
    mask_base_conv: ConvNorm,
    mask_proj: ConvNorm,
    d_model: usize,
}

impl LayoutEncoder {
    pub fn load(weights: &mut TensorMap, config: &LayoutModelConfig) -> Result<Self> {
        let levels = config.num_levels;
        let mut input_proj = Vec::with_capacity(levels);
        for i in 0..levels {
            input_proj.push(ConvNorm::load(
                weights,
                &format!("encoder.input_proj.{i}"),
                Conv2dParams::new(1, 0),
                Activation::None,
            )?);
        }
        let mut aifi = Vec::with_capacity(config.encoder_layers);
        for i in 0..config.encoder_layers {
            aifi.push(AifiLayer::load(
                weights,
                &format!("encoder.aifi.{i}"),
                config.num_heads,
            )?);
        }
        let mut lateral_convs = Vec::with_capacity(levels - 1);
        let mut fpn_blocks = Vec::with_capacity(levels - 1);
        for i in 0..levels - 1 {
            lateral_convs.push(ConvNorm::load(
                weights,
                &format!("encoder.lateral_convs.{i}"),
                Conv2dParams::new(1, 0),
                Activation::Silu,
            )?);
            fpn_blocks.push(CspRepLayer::load(
                weights,
                &format!("encoder.fpn_blocks.{i}"),
            )?);
        }
        let mut downsample_convs = Vec::with_capacity(levels - 1);
        let mut pan_blocks = Vec::with_capacity(levels - 1);
        for i in 0..levels - 1 {
            downsample_convs.push(ConvNorm::load(
                weights,
                &format!("encoder.downsample_convs.{i}"),
                Conv2dParams::new(2, 1),
                Activation::Silu,
            )?);
            pan_blocks.push(CspRepLayer::load(
                weights,
                &format!("encoder.pan_blocks.{i}"),
            )?);
        }
        // Scale head i upsamples from stride feat_strides[i] down to the
        // base (finest) stride, one conv per step plus the entry conv.
        let mut scale_heads = Vec::with_capacity(levels);
        for (i, stride) in config.feat_strides.iter().enumerate() {
            let steps = (stride / config.feat_strides[0]).trailing_zeros() as usize;
            scale_heads.push(ScaleHead::load(
                weights,
                &format!("encoder.mask_head.scale_heads.{i}"),
                steps + 1,
            )?);
        }
        Ok(Self {
            input_proj,
            aifi,
            encode_proj_layers: config.encode_proj_layers.clone(),
            lateral_convs,
            fpn_blocks,
            downsample_convs,
            pan_blocks,
            scale_heads,
            mask_output_conv: ConvNorm::load(
                weights,
                "encoder.mask_head.output_conv",
                Conv2dParams::new(1, 1),
                Activation::Silu,
            )?,
            x4_lateral: ConvNorm::load(
                weights,
                "encoder.mask_head.x4_lateral",
                Conv2dParams::new(1, 0),
                Activation::None,
            )?,
            mask_base_conv: ConvNorm::load(
                weights,
                "encoder.mask_head.base_conv",
                Conv2dParams::new(1, 1),
                Activation::Silu,
            )?,
            mask_proj: ConvNorm::load(
                weights,
                "encoder.mask_head.mask_proj",
                Conv2dParams::new(1, 0),
                Activation::None,
            )?,
            d_model: config.d_model,
        })
    }

    /// Run the encoder over the backbone features.
    pub fn forward(&self, features: &BackboneFeatures) -> Result<EncoderOutputs> {
        // Project the last three stages to d_model.
        let mut proj: Vec<Array3<f32>> = Vec::with_capacity(self.input_proj.len());
        for (i, conv) in self.input_proj.iter().enumerate() {
            proj.push(conv.forward(&features.stages[i + 1]));
        }

        // AIFI at the configured pyramid levels only.
        for &level in &self.encode_proj_layers {
            let (_, h, w) = proj[level].dim();
            let mut tokens = flatten_hw(&proj[level]);
            let pos = sincos_position_embedding(w, h, self.d_model);
            for layer in &self.aifi {
                tokens = layer.forward(&tokens, &pos);
            }
            proj[level] = unflatten_hw(&tokens, h, w);
        }

        // FPN top-down.
        let levels = proj.len();
        let mut inner: Vec<Array3<f32>> = vec![proj[levels - 1].clone()];
        for idx in (1..levels).rev() {
            let lateral = self.lateral_convs[levels - 1 - idx].forward(&inner[0]);
            inner[0] = lateral.clone();
            let upsampled = upsample_nearest_2x(lateral.view());
            let cat = concatenate(
                Axis(0),
                &[upsampled.view(), proj[idx - 1].view()],
            )
            .expect("fpn concat");
            let fused = self.fpn_blocks[levels - 1 - idx].forward(&cat);
            inner.insert(0, fused);
        }

        // PAN bottom-up.
        let mut outs: Vec<Array3<f32>> = vec![inner[0].clone()];
        for idx in 0..levels - 1 {
            let down = self.downsample_convs[idx].forward(outs.last().expect("pan input"));
            let cat = concatenate(Axis(0), &[down.view(), inner[idx + 1].view()])
                .expect("pan concat");
            outs.push(self.pan_blocks[idx].forward(&cat));
        }

        // Mask features: per-scale heads summed at the base stride.
        let (_, base_h, base_w) = outs[0].dim();
        let mut summed: Option<Array3<f32>> = None;
        for (i, head) in self.scale_heads.iter().enumerate() {
            let up_steps = (base_h / outs[i].dim().1).trailing_zeros() as usize;
            let scaled = head.forward(&outs[i], up_steps);
            let scaled = if scaled.dim().1 != base_h || scaled.dim().2 != base_w {
                resize_bilinear(scaled.view(), base_h, base_w)
            } else {
                scaled
            };
            summed = Some(match summed {
                Some(acc) => acc + &scaled,
                None => scaled,
            });
        }
        let summed = summed.expect("at least one pyramid level");
        let out = self.mask_output_conv.forward(&summed);
        let up = upsample_bilinear_2x(out.view());
        let lateral = self.x4_lateral.forward(&features.x4);
        let fused = up + &lateral;
        let mask_features = self.mask_proj.forward(&self.mask_base_conv.forward(&fused));

        Ok(EncoderOutputs {
            features: outs,
            mask_features,
        })
    }
}
