//! Recognizer model configuration, parsed from the snapshot's `config.json`.

use std::path::Path;

use serde::Deserialize;

use crate::error::{GlmOcrError, Result};

/// Vision tower hyperparameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VisionConfig {
    pub depth: usize,
    pub hidden_size: usize,
    pub num_heads: usize,
    pub intermediate_size: usize,
    pub patch_size: usize,
    pub temporal_patch_size: usize,
    pub spatial_merge_size: usize,
    pub in_channels: usize,
    /// Output width after the patch merger (the text model's hidden size).
    pub out_hidden_size: usize,
    pub rms_norm_eps: f32,
    pub image_mean: [f32; 3],
    pub image_std: [f32; 3],
    pub min_pixels: usize,
    pub max_pixels: usize,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            depth: 24,
            hidden_size: 1024,
            num_heads: 16,
            intermediate_size: 4096,
            patch_size: 14,
            temporal_patch_size: 1,
            spatial_merge_size: 2,
            in_channels: 3,
            out_hidden_size: 1536,
            rms_norm_eps: 1e-5,
            image_mean: [0.48145466, 0.4578275, 0.40821073],
            image_std: [0.26862954, 0.261_302_6, 0.275_777_1],
            min_pixels: 56 * 56,
            max_pixels: 28 * 28 * 1280,
        }
    }
}

impl VisionConfig {
    /// The smart-resize rounding factor.
    #[inline]
    #[must_use]
    pub fn factor(&self) -> usize {
        self.patch_size * self.spatial_merge_size
    }
}

/// Language model hyperparameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TextConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
    pub head_dim: usize,
    pub intermediate_size: usize,
    pub rms_norm_eps: f32,
    pub rope_theta: f32,
    pub partial_rotary_factor: f32,
    /// Rotary dimension split across the (t, h, w) axes.
    pub mrope_section: [usize; 3],
    pub attention_bias: bool,
}

impl Default for TextConfig {
    fn default() -> Self {
        Self {
            vocab_size: 151_552,
            hidden_size: 1536,
            num_hidden_layers: 16,
            num_attention_heads: 12,
            num_key_value_heads: 2,
            head_dim: 128,
            intermediate_size: 4608,
            rms_norm_eps: 1e-5,
            rope_theta: 10_000.0,
            partial_rotary_factor: 0.5,
            mrope_section: [8, 12, 12],
            attention_bias: true,
        }
    }
}

impl TextConfig {
    /// Number of rotary dimensions per head.
    #[inline]
    #[must_use]
    pub fn rotary_dim(&self) -> usize {
        (self.head_dim as f32 * self.partial_rotary_factor) as usize
    }
}

/// Full recognizer configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecognizerConfig {
    pub vision_config: VisionConfig,
    pub text_config: TextConfig,
    pub image_token_id: u32,
    pub video_token_id: u32,
    pub image_start_token_id: u32,
    pub image_end_token_id: u32,
    pub eos_token_ids: Vec<u32>,
}

impl Default for RecognizerConfig {
    fn default() -> Self {
        Self {
            vision_config: VisionConfig::default(),
            text_config: TextConfig::default(),
            image_token_id: 151_343,
            video_token_id: 151_344,
            image_start_token_id: 151_339,
            image_end_token_id: 151_340,
            eos_token_ids: vec![151_329, 151_336, 151_338],
        }
    }
}

impl RecognizerConfig {
    /// Load the snapshot's `config.json` when present, otherwise defaults.
    pub fn from_snapshot(dir: &Path) -> Result<Self> {
        let path = dir.join("config.json");
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)?;
        let config: Self = serde_json::from_str(&text).map_err(|e| {
            GlmOcrError::config(format!("invalid recognizer config.json: {e}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let text = &self.text_config;
        if text.num_attention_heads % text.num_key_value_heads != 0 {
            return Err(GlmOcrError::config(format!(
                "attention heads {} not divisible by kv heads {}",
                text.num_attention_heads, text.num_key_value_heads
            )));
        }
        let sections: usize = text.mrope_section.iter().sum();
        if sections * 2 != text.rotary_dim() {
            return Err(GlmOcrError::config(format!(
                "mrope sections {:?} do not cover rotary dim {}",
                text.mrope_section,
                text.rotary_dim()
            )));
        }
        if self.vision_config.spatial_merge_size == 0 || self.vision_config.patch_size == 0 {
            return Err(GlmOcrError::config("vision patch sizes must be positive"));
        }
        Ok(())
    }
}
