//! Recognizer checkpoint sanitization.
//!
//! Source checkpoints use heterogeneous naming; this rewrite runs before any
//! tensor is bound to a module. The `layers.16` drop assumes a 16-layer
//! decoder (indices 0..=15); the loader asserts the configured depth so a
//! deeper variant fails loudly instead of silently losing a layer.

use ndarray::{ArrayD, IxDyn};

use crate::error::{GlmOcrError, Result};
use crate::weights::TensorMap;

use super::config::RecognizerConfig;

/// Maximum decoder depth compatible with the `layers.16` sentinel drop.
const MAX_DECODER_LAYERS: usize = 16;

/// Apply the full key rewrite and conv-layout normalization.
pub fn sanitize_recognizer_weights(
    weights: &mut TensorMap,
    config: &RecognizerConfig,
) -> Result<()> {
    if config.text_config.num_hidden_layers > MAX_DECODER_LAYERS {
        return Err(GlmOcrError::config(format!(
            "sanitizer drops 'layers.16' keys; {} decoder layers would be mis-loaded",
            config.text_config.num_hidden_layers
        )));
    }

    weights.rewrite_keys(rewrite_key);
    normalize_conv_layouts(weights, config)?;
    Ok(())
}

/// The key rewrite, one key at a time. Returns `None` to drop.
pub fn rewrite_key(key: &str) -> Option<String> {
    // An absent 17th layer slice indexed by converted checkpoints.
    if key.contains("layers.16") {
        return None;
    }
    // Position-id buffers in the vision tower have no runtime counterpart.
    if key.contains("position_ids") && (key.contains("visual") || key.contains("vision_tower")) {
        return None;
    }

    let mut k = key.to_string();
    if k.contains("visual") && !k.contains("vision_tower") {
        if let Some(stripped) = k.strip_prefix("model.") {
            k = stripped.to_string();
        }
        k = k.replace("visual", "vision_tower");
    }
    if let Some(rest) = k.strip_prefix("model.language_model.") {
        k = format!("language_model.model.{rest}");
    }
    if k.contains("lm_head") && !k.contains("language_model") {
        let tail = k.split_once("lm_head").map_or("", |(_, t)| t);
        k = format!("language_model.lm_head{tail}");
    }
    Some(k)
}

/// Bring patch-embed and downsample convolutions into the channel-first
/// layouts the runtime consumes, flattening the patch-embed kernel into its
/// matmul form.
fn normalize_conv_layouts(weights: &mut TensorMap, config: &RecognizerConfig) -> Result<()> {
    let vision = &config.vision_config;
    let c = vision.in_channels;

    if let Some(tensor) = weights.remove("vision_tower.patch_embed.proj.weight") {
        let flattened = match tensor.ndim() {
            // (out, C, T, pH, pW) channels-first, or channels-last with C
            // trailing.
            5 => {
                let shape = tensor.shape().to_vec();
                let channels_first = shape[1] == c;
                let out = shape[0];
                let reordered = if channels_first {
                    tensor
                } else {
                    // (out, T, pH, pW, C) -> (out, C, T, pH, pW)
                    tensor.permuted_axes(IxDyn(&[0, 4, 1, 2, 3])).to_owned()
                };
                let len: usize = reordered.len() / out;
                let flat: Vec<f32> = reordered.iter().copied().collect();
                ArrayD::from_shape_vec(IxDyn(&[out, len]), flat)
                    .map_err(|e| GlmOcrError::config(format!("patch embed reshape: {e}")))?
            }
            2 => tensor,
            n => {
                return Err(GlmOcrError::config(format!(
                    "patch embed weight has unsupported rank {n}"
                )))
            }
        };
        weights.insert("vision_tower.patch_embed.proj.weight".to_string(), flattened);
    }

    if let Some(tensor) = weights.remove("vision_tower.downsample.weight") {
        let normalized = if tensor.ndim() == 4 {
            let shape = tensor.shape().to_vec();
            if shape[1] == vision.hidden_size {
                tensor
            } else {
                // (out, kH, kW, C) -> (out, C, kH, kW)
                tensor.permuted_axes(IxDyn(&[0, 3, 1, 2])).as_standard_layout().to_owned().into_dyn()
            }
        } else {
            return Err(GlmOcrError::config(format!(
                "downsample weight has unsupported rank {}",
                tensor.ndim()
            )));
        };
        weights.insert("vision_tower.downsample.weight".to_string(), normalized);
    }
    Ok(())
}
