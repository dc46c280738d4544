//! Recognizer input preparation: chat template, smart resize, patchify,
//! and image-token placeholder expansion.
#![allow(clippy::cast_precision_loss)]

use std::path::Path;

use ndarray::Array2;
use tokenizers::Tokenizer;

use crate::error::{GlmOcrError, Result};
use crate::imaging::{normalize_to_chw, resize_rgb, smart_resize_dims, PageImage, ResampleFilter};

use super::config::{RecognizerConfig, VisionConfig};

/// The literal chat template wrapped around every prompt.
pub const CHAT_TEMPLATE_PREFIX: &str =
    "[gMASK]<sop><|user|>\n<|begin_of_image|><|image|><|end_of_image|>";
pub const CHAT_TEMPLATE_SUFFIX: &str = "<|assistant|>\n";

/// Everything the language model needs for one recognition.
#[derive(Debug, Clone)]
pub struct PreparedInput {
    pub input_ids: Vec<u32>,
    pub attention_mask: Vec<u32>,
    /// `(num_patches, channels * temporal_patch * patch^2)` rows.
    pub pixel_values: Array2<f32>,
    /// One `(t, h, w)` grid per image, in patch units.
    pub image_grid_thw: Vec<(usize, usize, usize)>,
    pub image_token_id: u32,
}

impl PreparedInput {
    /// Count of image placeholder tokens in the token stream.
    #[must_use]
    pub fn placeholder_count(&self) -> usize {
        self.input_ids
            .iter()
            .filter(|id| **id == self.image_token_id)
            .count()
    }
}

/// Tokenizer wrapper bound to the recognizer's special token ids.
pub struct RecognizerTokenizer {
    inner: Tokenizer,
}

impl std::fmt::Debug for RecognizerTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecognizerTokenizer").finish_non_exhaustive()
    }
}

impl RecognizerTokenizer {
    /// Load `tokenizer.json` from a snapshot directory.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join("tokenizer.json");
        let inner = Tokenizer::from_file(&path).map_err(|e| {
            GlmOcrError::config(format!("failed to load tokenizer {}: {e}", path.display()))
        })?;
        Ok(Self { inner })
    }

    /// Encode without inserting special tokens.
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| GlmOcrError::config(format!("tokenization failed: {e}")))?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Decode generated ids, skipping special tokens.
    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        self.inner
            .decode(ids, true)
            .map_err(|e| GlmOcrError::config(format!("detokenization failed: {e}")))
    }
}

/// Patchify a normalized `(C, H, W)` frame stack into flat patch rows.
///
/// Frames are tiled to a multiple of `temporal_patch_size` by repeating the
/// last frame; rows are emitted in `(t, h, w)` order, each row holding the
/// patch in `channel, temporal, py, px` order. Returns the rows and the
/// `(t, h, w)` grid.
pub fn patchify(
    frames: &[ndarray::Array3<f32>],
    config: &VisionConfig,
) -> Result<(Array2<f32>, (usize, usize, usize))> {
    if frames.is_empty() {
        return Err(GlmOcrError::config("patchify on empty frame list"));
    }
    let p = config.patch_size;
    let tp = config.temporal_patch_size;
    let (c, h, w) = frames[0].dim();
    if h % p != 0 || w % p != 0 {
        return Err(GlmOcrError::config(format!(
            "frame {h}x{w} not divisible by patch size {p}"
        )));
    }

    // Tile the last frame until the count is temporal-aligned.
    let mut stack: Vec<&ndarray::Array3<f32>> = frames.iter().collect();
    while stack.len() % tp != 0 {
        stack.push(frames.last().expect("non-empty"));
    }

    let grid_t = stack.len() / tp;
    let grid_h = h / p;
    let grid_w = w / p;
    let row_len = c * tp * p * p;
    let mut rows = Array2::<f32>::zeros((grid_t * grid_h * grid_w, row_len));

    for ti in 0..grid_t {
        for hi in 0..grid_h {
            for wi in 0..grid_w {
                let row_idx = (ti * grid_h + hi) * grid_w + wi;
                let mut col = 0usize;
                for ch in 0..c {
                    for f in 0..tp {
                        let frame = stack[ti * tp + f];
                        for py in 0..p {
                            for px in 0..p {
                                rows[[row_idx, col]] =
                                    frame[[ch, hi * p + py, wi * p + px]];
                                col += 1;
                            }
                        }
                    }
                }
            }
        }
    }
    Ok((rows, (grid_t, grid_h, grid_w)))
}

/// Build the full [`PreparedInput`] for one region image and prompt.
pub fn prepare_input(
    image: &PageImage,
    prompt: &str,
    tokenizer: &RecognizerTokenizer,
    config: &RecognizerConfig,
) -> Result<PreparedInput> {
    let vision = &config.vision_config;

    // Smart resize and normalization.
    let (target_h, target_w) = smart_resize_dims(
        image.height() as usize,
        image.width() as usize,
        vision.factor(),
        vision.min_pixels,
        vision.max_pixels,
    )?;
    let resized = resize_rgb(
        image,
        target_w as u32,
        target_h as u32,
        ResampleFilter::Bicubic,
    );
    let tensor = normalize_to_chw(&resized, Some(vision.image_mean), Some(vision.image_std));

    let (pixel_values, grid) = patchify(&[tensor], vision)?;

    // Tokenize the templated prompt, then expand the placeholder.
    let text = format!("{CHAT_TEMPLATE_PREFIX}{prompt}{CHAT_TEMPLATE_SUFFIX}");
    let raw_ids = tokenizer.encode(&text)?;
    let merge_area = vision.spatial_merge_size * vision.spatial_merge_size;
    let expanded_len = (grid.0 * grid.1 * grid.2 / merge_area).max(1);
    let mut input_ids = Vec::with_capacity(raw_ids.len() + expanded_len);
    for id in raw_ids {
        if id == config.image_token_id {
            input_ids.extend(std::iter::repeat(config.image_token_id).take(expanded_len));
        } else {
            input_ids.push(id);
        }
    }

    let prepared = PreparedInput {
        attention_mask: vec![1; input_ids.len()],
        input_ids,
        pixel_values,
        image_grid_thw: vec![grid],
        image_token_id: config.image_token_id,
    };

    // Placeholder-count invariant.
    let expected: usize = prepared
        .image_grid_thw
        .iter()
        .map(|(t, h, w)| (t * h * w / merge_area).max(1))
        .sum();
    if prepared.placeholder_count() != expected {
        return Err(GlmOcrError::inference(
            "Recognizer",
            format!(
                "prepared {} image tokens but grids require {expected}",
                prepared.placeholder_count()
            ),
        ));
    }
    Ok(prepared)
}
