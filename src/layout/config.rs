//! Layout-detector model configuration.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::{GlmOcrError, Result};

/// Backbone stage table: `(in, mid, out, num_blocks, downsample, light_block,
/// kernel, num_layers)`.
pub const STAGE_CONFIG: [(usize, usize, usize, usize, bool, bool, usize, usize); 4] = [
    (48, 48, 128, 1, false, false, 3, 6),
    (128, 96, 512, 1, true, false, 3, 6),
    (512, 192, 1024, 3, true, true, 5, 6),
    (1024, 384, 2048, 1, true, true, 5, 6),
];

/// Structural hyperparameters of the detector.
///
/// Everything here is fixed by the checkpoint; `from_json` overlays the
/// snapshot's `config.json` over these defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LayoutModelConfig {
    pub d_model: usize,
    pub num_queries: usize,
    pub num_classes: usize,
    pub num_decoder_layers: usize,
    pub num_heads: usize,
    pub num_levels: usize,
    pub num_decoder_points: usize,
    pub encoder_layers: usize,
    /// Pyramid levels that run AIFI self-attention (indices into the
    /// stride-ascending level list).
    pub encode_proj_layers: Vec<usize>,
    pub encoder_ffn_dim: usize,
    pub grid_size: f32,
    /// Square model input edge.
    pub eval_size: usize,
    /// Mask head output resolution `(h, w)`.
    pub mask_size: (usize, usize),
    pub mask_feature_channels: usize,
    pub mask_enhanced: bool,
    pub global_pointer_head_size: usize,
    pub feat_strides: Vec<usize>,
    pub id2label: BTreeMap<u32, String>,
}

impl Default for LayoutModelConfig {
    fn default() -> Self {
        Self {
            d_model: 256,
            num_queries: 300,
            num_classes: 25,
            num_decoder_layers: 6,
            num_heads: 8,
            num_levels: 3,
            num_decoder_points: 4,
            encoder_layers: 1,
            encode_proj_layers: vec![2],
            encoder_ffn_dim: 1024,
            grid_size: 0.05,
            eval_size: 800,
            mask_size: (200, 200),
            mask_feature_channels: 32,
            mask_enhanced: true,
            global_pointer_head_size: 64,
            feat_strides: vec![8, 16, 32],
            id2label: default_id2label(),
        }
    }
}

impl LayoutModelConfig {
    /// Load the snapshot's `config.json` when present, otherwise defaults.
    pub fn from_snapshot(dir: &Path) -> Result<Self> {
        let path = dir.join("config.json");
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)?;
        serde_json::from_str(&text).map_err(|e| {
            GlmOcrError::config(format!("invalid layout config.json: {e}"))
        })
    }

    /// Label for a class id, falling back to `class_{id}`.
    #[must_use]
    pub fn label_for(&self, class_id: u32) -> String {
        self.id2label
            .get(&class_id)
            .cloned()
            .unwrap_or_else(|| format!("class_{class_id}"))
    }
}

/// The 25-category label table of the shipped checkpoint.
fn default_id2label() -> BTreeMap<u32, String> {
    [
        "paragraph_title",
        "image",
        "text",
        "number",
        "abstract",
        "content",
        "figure_title",
        "formula",
        "table",
        "table_title",
        "reference",
        "doc_title",
        "footnote",
        "header",
        "algorithm",
        "footer",
        "seal",
        "chart_title",
        "chart",
        "formula_number",
        "header_image",
        "footer_image",
        "aside_text",
        "reference_content",
        "vision_footnote",
    ]
    .iter()
    .enumerate()
    .map(|(i, label)| (i as u32, (*label).to_string()))
    .collect()
}
