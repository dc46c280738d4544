//! HGNet-style backbone: a stacked-conv stem and four aggregation stages.
//!
//! Each block runs `num_layers` convolutions, concatenates the block input
//! with every per-layer output along the channel axis, squeezes through two
//! 1x1 aggregation convolutions, and adds a residual on non-first blocks.
//! "Light" layers are a 1x1 pointwise conv followed by a depthwise k x k.

use ndarray::{concatenate, Array1, Array3, Array4, Axis};

use crate::error::Result;
use crate::tensor::{conv2d, relu_inplace, silu_inplace, Conv2dParams};
use crate::weights::{fuse_conv_bn, TensorMap};

use super::config::STAGE_CONFIG;

const BN_EPS: f32 = 1e-5;

/// Post-convolution activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Relu,
    Silu,
    None,
}

/// A convolution with folded batch-norm and an optional activation.
#[derive(Debug)]
pub struct ConvNorm {
    weight: Array4<f32>,
    bias: Array1<f32>,
    params: Conv2dParams,
    act: Activation,
}

impl ConvNorm {
    /// Load `{prefix}.conv.*` and fold `{prefix}.norm.*` when present.
    pub fn load(
        weights: &mut TensorMap,
        prefix: &str,
        params: Conv2dParams,
        act: Activation,
    ) -> Result<Self> {
        let mut weight = weights.take4(&format!("{prefix}.conv.weight"))?;
        let conv_bias = weights.take1(&format!("{prefix}.conv.bias")).ok();
        let bias = if weights.contains(&format!("{prefix}.norm.weight")) {
            let gamma = weights.take1(&format!("{prefix}.norm.weight"))?;
            let beta = weights.take1(&format!("{prefix}.norm.bias"))?;
            let mean = weights.take1(&format!("{prefix}.norm.running_mean"))?;
            let var = weights.take1(&format!("{prefix}.norm.running_var"))?;
            fuse_conv_bn(&mut weight, conv_bias, &gamma, &beta, &mean, &var, BN_EPS)?
        } else {
            conv_bias.unwrap_or_else(|| Array1::zeros(weight.dim().0))
        };
        Ok(Self {
            weight,
            bias,
            params,
            act,
        })
    }

    #[must_use]
    pub fn forward(&self, x: &Array3<f32>) -> Array3<f32> {
        let mut out = conv2d(
            x.view(),
            self.weight.view(),
            Some(self.bias.view()),
            self.params,
        );
        let slice = out.as_slice_mut().expect("contiguous conv output");
        match self.act {
            Activation::Relu => relu_inplace(slice),
            Activation::Silu => silu_inplace(slice),
            Activation::None => {}
        }
        out
    }

    #[inline]
    #[must_use]
    pub fn out_channels(&self) -> usize {
        self.weight.dim().0
    }
}

/// One convolution inside an aggregation block.
#[derive(Debug)]
enum HgLayer {
    /// Pointwise 1x1 then depthwise k x k.
    Light { pointwise: ConvNorm, depthwise: ConvNorm },
    /// A single k x k convolution.
    Plain(ConvNorm),
}

impl HgLayer {
    fn load(
        weights: &mut TensorMap,
        prefix: &str,
        light: bool,
        kernel: usize,
        channels: usize,
    ) -> Result<Self> {
        if light {
            let pointwise = ConvNorm::load(
                weights,
                &format!("{prefix}.pointwise"),
                Conv2dParams::new(1, 0),
                Activation::None,
            )?;
            let depthwise = ConvNorm::load(
                weights,
                &format!("{prefix}.depthwise"),
                Conv2dParams::depthwise(1, kernel / 2, channels),
                Activation::Relu,
            )?;
            Ok(Self::Light {
                pointwise,
                depthwise,
            })
        } else {
            Ok(Self::Plain(ConvNorm::load(
                weights,
                prefix,
                Conv2dParams::new(1, kernel / 2),
                Activation::Relu,
            )?))
        }
    }

    fn forward(&self, x: &Array3<f32>) -> Array3<f32> {
        match self {
            Self::Light {
                pointwise,
                depthwise,
            } => depthwise.forward(&pointwise.forward(x)),
            Self::Plain(conv) => conv.forward(x),
        }
    }
}

/// A concat-aggregate block with optional residual.
#[derive(Debug)]
struct HgBlock {
    layers: Vec<HgLayer>,
    aggregation_squeeze: ConvNorm,
    aggregation_excite: ConvNorm,
    identity: bool,
}

impl HgBlock {
    fn forward(&self, x: &Array3<f32>) -> Array3<f32> {
        let mut outputs = vec![x.clone()];
        for layer in &self.layers {
            let next = layer.forward(outputs.last().expect("at least the input"));
            outputs.push(next);
        }
        let views: Vec<_> = outputs.iter().map(Array3::view).collect();
        let cat = concatenate(Axis(0), &views).expect("channel concat");
        let mut out = self
            .aggregation_excite
            .forward(&self.aggregation_squeeze.forward(&cat));
        if self.identity {
            out += x;
        }
        out
    }
}

/// A backbone stage: optional depthwise stride-2 downsample plus blocks.
#[derive(Debug)]
struct HgStage {
    downsample: Option<ConvNorm>,
    blocks: Vec<HgBlock>,
}

impl HgStage {
    fn forward(&self, x: &Array3<f32>) -> Array3<f32> {
        let mut cur = match &self.downsample {
            Some(down) => down.forward(x),
            None => x.clone(),
        };
        for block in &self.blocks {
            cur = block.forward(&cur);
        }
        cur
    }
}

/// The 4-stage feature extractor.
#[derive(Debug)]
pub struct LayoutBackbone {
    stem: Vec<ConvNorm>,
    stages: Vec<HgStage>,
}

/// Backbone outputs: the stride-4 feature plus all four stage features.
#[derive(Debug)]
pub struct BackboneFeatures {
    /// First stage output (stride 4), consumed by the mask-feature head.
    pub x4: Array3<f32>,
    /// Stage outputs at strides 4, 8, 16, 32.
    pub stages: Vec<Array3<f32>>,
}

impl LayoutBackbone {
    pub fn load(weights: &mut TensorMap) -> Result<Self> {
        // Stem: three 3x3 convolutions, strides 2/1/2, landing at stride 4.
        let stem_plan = [(2usize, 1usize), (1, 1), (2, 1)];
        let mut stem = Vec::with_capacity(stem_plan.len());
        for (i, (stride, padding)) in stem_plan.iter().enumerate() {
            stem.push(ConvNorm::load(
                weights,
                &format!("backbone.stem.{i}"),
                Conv2dParams::new(*stride, *padding),
                Activation::Relu,
            )?);
        }

        let mut stages = Vec::with_capacity(STAGE_CONFIG.len());
        for (s, &(in_ch, mid_ch, _out_ch, num_blocks, downsample, light, kernel, num_layers)) in
            STAGE_CONFIG.iter().enumerate()
        {
            let down = if downsample {
                Some(ConvNorm::load(
                    weights,
                    &format!("backbone.stages.{s}.downsample"),
                    Conv2dParams::depthwise(2, 1, in_ch),
                    Activation::None,
                )?)
            } else {
                None
            };
            // Layer input widths (stage input for the first block, stage
            // output afterwards) are implied by the checkpoint shapes.
            let mut blocks = Vec::with_capacity(num_blocks);
            for b in 0..num_blocks {
                let mut layers = Vec::with_capacity(num_layers);
                for l in 0..num_layers {
                    layers.push(HgLayer::load(
                        weights,
                        &format!("backbone.stages.{s}.blocks.{b}.layers.{l}"),
                        light,
                        kernel,
                        mid_ch,
                    )?);
                }
                let aggregation_squeeze = ConvNorm::load(
                    weights,
                    &format!("backbone.stages.{s}.blocks.{b}.aggregation.0"),
                    Conv2dParams::new(1, 0),
                    Activation::Relu,
                )?;
                let aggregation_excite = ConvNorm::load(
                    weights,
                    &format!("backbone.stages.{s}.blocks.{b}.aggregation.1"),
                    Conv2dParams::new(1, 0),
                    Activation::Relu,
                )?;
                blocks.push(HgBlock {
                    layers,
                    aggregation_squeeze,
                    aggregation_excite,
                    identity: b > 0,
                });
            }
            stages.push(HgStage {
                downsample: down,
                blocks,
            });
        }
        Ok(Self { stem, stages })
    }

    /// Run the backbone on a normalized `(3, H, W)` input.
    #[must_use]
    pub fn forward(&self, input: &Array3<f32>) -> BackboneFeatures {
        let mut cur = input.clone();
        for conv in &self.stem {
            cur = conv.forward(&cur);
        }
        let mut stage_features = Vec::with_capacity(self.stages.len());
        for stage in &self.stages {
            cur = stage.forward(&cur);
            stage_features.push(cur.clone());
        }
        BackboneFeatures {
            x4: stage_features[0].clone(),
            stages: stage_features,
        }
    }
}
