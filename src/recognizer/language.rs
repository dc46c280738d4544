//! Recognizer language model: a GLM-style decoder stack with grouped-query
//! attention, M-RoPE, and sandwich RMS norms around both sublayers.
#![allow(clippy::cast_precision_loss)]

use ndarray::{Array2, Axis};

use crate::error::{GlmOcrError, Result};
use crate::tensor::{
    causal_mask, merge_heads, offset_mask, scaled_dot_attention, silu, split_heads,
};
use crate::weights::{Linear, RmsNorm, TensorMap};

use super::cache::KvCache;
use super::config::TextConfig;
use super::rope::{apply_rotary, mrope_cos_sin, Positions};

#[derive(Debug)]
struct GlmAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl GlmAttention {
    fn load(weights: &mut TensorMap, prefix: &str, config: &TextConfig) -> Result<Self> {
        Ok(Self {
            q_proj: Linear::load(weights, &format!("{prefix}.q_proj"))?,
            k_proj: Linear::load(weights, &format!("{prefix}.k_proj"))?,
            v_proj: Linear::load(weights, &format!("{prefix}.v_proj"))?,
            o_proj: Linear::load(weights, &format!("{prefix}.o_proj"))?,
            num_heads: config.num_attention_heads,
            num_kv_heads: config.num_key_value_heads,
            head_dim: config.head_dim,
        })
    }

    fn forward(
        &self,
        x: &Array2<f32>,
        cos: &Array2<f32>,
        sin: &Array2<f32>,
        mask: Option<&Array2<f32>>,
        cache: &mut super::cache::LayerKvCache,
    ) -> Array2<f32> {
        let mut q = split_heads(self.q_proj.forward(x.view()).view(), self.num_heads);
        let mut k = split_heads(self.k_proj.forward(x.view()).view(), self.num_kv_heads);
        let v = split_heads(self.v_proj.forward(x.view()).view(), self.num_kv_heads);

        apply_rotary(&mut q, cos, sin);
        apply_rotary(&mut k, cos, sin);

        let (k_all, v_all) = cache.update_and_fetch(k.view(), v.view());
        let ctx = scaled_dot_attention(
            q.view(),
            k_all,
            v_all,
            mask.map(Array2::view),
            1.0 / (self.head_dim as f32).sqrt(),
        );
        self.o_proj.forward(merge_heads(ctx.view()).view())
    }
}

#[derive(Debug)]
struct GlmDecoderLayer {
    input_layernorm: RmsNorm,
    self_attn: GlmAttention,
    post_self_attn_layernorm: RmsNorm,
    post_attention_layernorm: RmsNorm,
    gate_up_proj: Linear,
    down_proj: Linear,
    post_mlp_layernorm: RmsNorm,
}

impl GlmDecoderLayer {
    fn load(weights: &mut TensorMap, prefix: &str, config: &TextConfig) -> Result<Self> {
        let eps = config.rms_norm_eps;
        Ok(Self {
            input_layernorm: RmsNorm::load(weights, &format!("{prefix}.input_layernorm"), eps)?,
            self_attn: GlmAttention::load(weights, &format!("{prefix}.self_attn"), config)?,
            post_self_attn_layernorm: RmsNorm::load(
                weights,
                &format!("{prefix}.post_self_attn_layernorm"),
                eps,
            )?,
            post_attention_layernorm: RmsNorm::load(
                weights,
                &format!("{prefix}.post_attention_layernorm"),
                eps,
            )?,
            gate_up_proj: Linear::load(weights, &format!("{prefix}.mlp.gate_up_proj"))?,
            down_proj: Linear::load(weights, &format!("{prefix}.mlp.down_proj"))?,
            post_mlp_layernorm: RmsNorm::load(
                weights,
                &format!("{prefix}.post_mlp_layernorm"),
                eps,
            )?,
        })
    }

    fn forward(
        &self,
        x: &Array2<f32>,
        cos: &Array2<f32>,
        sin: &Array2<f32>,
        mask: Option<&Array2<f32>>,
        cache: &mut super::cache::LayerKvCache,
    ) -> Array2<f32> {
        let normed = self.input_layernorm.forward(x.view());
        let attn = self.self_attn.forward(&normed, cos, sin, mask, cache);
        let x = x + &self.post_self_attn_layernorm.forward(attn.view());

        let normed = self.post_attention_layernorm.forward(x.view());
        let gate_up = self.gate_up_proj.forward(normed.view());
        let inter = gate_up.ncols() / 2;
        let gate = gate_up.slice(ndarray::s![.., ..inter]);
        let up = gate_up.slice(ndarray::s![.., inter..]);
        let mut fused = Array2::<f32>::zeros((gate_up.nrows(), inter));
        ndarray::Zip::from(&mut fused)
            .and(&gate)
            .and(&up)
            .for_each(|f, g, u| *f = silu(*g) * *u);
        let mlp = self.down_proj.forward(fused.view());
        &x + &self.post_mlp_layernorm.forward(mlp.view())
    }
}

/// The decoder stack plus embedding table and output head.
pub struct GlmTextModel {
    embed_tokens: Array2<f32>,
    layers: Vec<GlmDecoderLayer>,
    norm: RmsNorm,
    lm_head: Linear,
    config: TextConfig,
}

impl std::fmt::Debug for GlmTextModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlmTextModel")
            .field("num_layers", &self.layers.len())
            .field("hidden_size", &self.config.hidden_size)
            .field("vocab_size", &self.config.vocab_size)
            .finish()
    }
}

impl GlmTextModel {
    pub fn load(weights: &mut TensorMap, config: &TextConfig) -> Result<Self> {
        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for i in 0..config.num_hidden_layers {
            layers.push(GlmDecoderLayer::load(
                weights,
                &format!("language_model.model.layers.{i}"),
                config,
            )?);
        }
        Ok(Self {
            embed_tokens: weights.take2("language_model.model.embed_tokens.weight")?,
            layers,
            norm: RmsNorm::load(weights, "language_model.model.norm", config.rms_norm_eps)?,
            lm_head: Linear::load(weights, "language_model.lm_head")?,
            config: config.clone(),
        })
    }

    #[inline]
    #[must_use]
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Look up token embeddings, `(L, hidden)`.
    pub fn embed(&self, input_ids: &[u32]) -> Result<Array2<f32>> {
        let hidden = self.embed_tokens.ncols();
        let mut out = Array2::<f32>::zeros((input_ids.len(), hidden));
        for (i, id) in input_ids.iter().enumerate() {
            let idx = *id as usize;
            if idx >= self.embed_tokens.nrows() {
                return Err(GlmOcrError::inference(
                    "Recognizer",
                    format!("token id {id} outside vocabulary"),
                ));
            }
            out.row_mut(i).assign(&self.embed_tokens.row(idx));
        }
        Ok(out)
    }

    /// Run the decoder stack over pre-computed embeddings, advancing the
    /// cache, and return the hidden states `(L, hidden)`.
    ///
    /// Mask selection: a causal mask when prefilling from an empty cache, an
    /// explicit `(L, offset+L)` mask when prefilling against history, no
    /// mask for single-token decode steps.
    pub fn forward_embeddings(
        &self,
        embeddings: &Array2<f32>,
        positions: &Positions,
        cache: &mut KvCache,
    ) -> Array2<f32> {
        let len = embeddings.nrows();
        let offset = cache.offset();
        let mask = if len == 1 {
            None
        } else if offset == 0 {
            Some(causal_mask(len))
        } else {
            Some(offset_mask(len, offset))
        };

        let (cos, sin) = mrope_cos_sin(positions.view(), &self.config);
        let mut hidden = embeddings.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            hidden = layer.forward(&hidden, &cos, &sin, mask.as_ref(), cache.layer(i));
        }
        self.norm.forward(hidden.view())
    }

    /// Project the last position's hidden state to vocabulary logits.
    #[must_use]
    pub fn logits_last(&self, hidden: &Array2<f32>) -> Vec<f32> {
        let last = hidden.slice(ndarray::s![hidden.nrows() - 1..hidden.nrows(), ..]);
        let logits = self.lm_head.forward(last);
        logits.index_axis(Axis(0), 0).to_vec()
    }

    /// Hidden size used by the embedding merge.
    #[inline]
    #[must_use]
    pub fn hidden_size(&self) -> usize {
        self.embed_tokens.ncols()
    }
}

/// Replace image-token rows of the text embedding with visual features, in
/// order. Falls back to the video token when no image tokens are present;
/// asserts the features are consumed exactly.
pub fn merge_vision_embeddings(
    embeddings: &mut Array2<f32>,
    input_ids: &[u32],
    features: &Array2<f32>,
    image_token_id: u32,
    video_token_id: u32,
) -> Result<()> {
    let mut token = image_token_id;
    if !input_ids.iter().any(|id| *id == image_token_id) {
        token = video_token_id;
    }
    let mut next = 0usize;
    for (i, id) in input_ids.iter().enumerate() {
        if *id != token {
            continue;
        }
        if next >= features.nrows() {
            return Err(GlmOcrError::inference(
                "Recognizer",
                format!(
                    "more image tokens than visual features ({} available)",
                    features.nrows()
                ),
            ));
        }
        embeddings.row_mut(i).assign(&features.row(next));
        next += 1;
    }
    if next != features.nrows() {
        return Err(GlmOcrError::inference(
            "Recognizer",
            format!(
                "visual features not consumed exactly: {next} of {}",
                features.nrows()
            ),
        ));
    }
    Ok(())
}
