//! The multimodal recognizer: vision tower + causal language model.

mod cache;
mod config;
mod generate;
mod language;
mod prepare;
mod rope;
mod sampling;
mod sanitize;
mod vision;

pub use cache::{KvCache, LayerKvCache, CACHE_BLOCK};
pub use config::{RecognizerConfig, TextConfig, VisionConfig};
pub use generate::generate;
pub use language::{merge_vision_embeddings, GlmTextModel};
pub use prepare::{
    patchify, prepare_input, PreparedInput, RecognizerTokenizer, CHAT_TEMPLATE_PREFIX,
    CHAT_TEMPLATE_SUFFIX,
};
pub use rope::{decode_positions, get_rope_index, RopeIndex};
pub use sampling::{apply_repetition_penalty, sample_token, SampleRng};
pub use sanitize::{rewrite_key, sanitize_recognizer_weights};
pub use vision::VisionTower;

use std::path::Path;
use std::time::Instant;

use crate::config::RecognitionOptions;
use crate::error::Result;
use crate::imaging::PageImage;
use crate::pipeline::CancelToken;
use crate::weights::TensorMap;

/// One recognition result with stage timings.
#[derive(Debug, Clone)]
pub struct RecognitionOutput {
    pub text: String,
    pub preprocess_ms: f64,
    pub inference_ms: f64,
    pub postprocess_ms: f64,
}

/// Seam for the orchestrator; tests substitute in-memory fakes.
pub trait RegionRecognizer: Send + Sync {
    /// Transcribe one region image under the given prompt.
    fn recognize(
        &self,
        image: &PageImage,
        prompt: &str,
        options: &RecognitionOptions,
        cancel: &CancelToken,
    ) -> Result<RecognitionOutput>;
}

/// The full model: tokenizer, vision tower, and decoder stack.
pub struct GlmRecognizer {
    tokenizer: RecognizerTokenizer,
    vision_tower: VisionTower,
    text_model: GlmTextModel,
    config: RecognizerConfig,
}

impl std::fmt::Debug for GlmRecognizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlmRecognizer")
            .field("text_model", &self.text_model)
            .field("vision_tower", &self.vision_tower)
            .finish()
    }
}

impl GlmRecognizer {
    /// Load the recognizer from a resolved snapshot directory.
    pub fn load(dir: &Path) -> Result<Self> {
        let config = RecognizerConfig::from_snapshot(dir)?;
        let tokenizer = RecognizerTokenizer::load(dir)?;
        let mut weights = TensorMap::load_dir(dir)?;
        sanitize_recognizer_weights(&mut weights, &config)?;
        let vision_tower = VisionTower::load(&mut weights, &config.vision_config)?;
        let text_model = GlmTextModel::load(&mut weights, &config.text_config)?;
        if !weights.is_empty() {
            log::debug!("{} unused recognizer checkpoint tensors", weights.len());
        }
        Ok(Self {
            tokenizer,
            vision_tower,
            text_model,
            config,
        })
    }
}

impl RegionRecognizer for GlmRecognizer {
    fn recognize(
        &self,
        image: &PageImage,
        prompt: &str,
        options: &RecognitionOptions,
        cancel: &CancelToken,
    ) -> Result<RecognitionOutput> {
        let start = Instant::now();
        let prepared = prepare_input(image, prompt, &self.tokenizer, &self.config)?;
        let preprocess_ms = start.elapsed().as_secs_f64() * 1000.0;

        let start = Instant::now();
        let tokens = generate(
            &self.text_model,
            &self.vision_tower,
            &prepared,
            &self.config,
            options,
            cancel,
        )?;
        let inference_ms = start.elapsed().as_secs_f64() * 1000.0;

        let start = Instant::now();
        let text = self.tokenizer.decode(&tokens)?.trim().to_string();
        let postprocess_ms = start.elapsed().as_secs_f64() * 1000.0;

        log::debug!(
            "recognized {} tokens in {inference_ms:.1}ms",
            tokens.len()
        );
        Ok(RecognitionOutput {
            text,
            preprocess_ms,
            inference_ms,
            postprocess_ms,
        })
    }
}
