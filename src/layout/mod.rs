//! DETR-style layout detection.
//!
//! The detector resizes a page to a fixed square input, runs the HGNet
//! backbone, the hybrid encoder, and the deformable decoder, then converts
//! the raw prediction into ordered, labeled regions.

mod backbone;
mod config;
mod decoder;
mod deformable;
mod encoder;
mod order;
mod postprocess;
mod weights;

pub use config::LayoutModelConfig;
pub use decoder::LayoutPrediction;
pub use order::order_by_voting;
pub use postprocess::postprocess;
pub use weights::{load_layout_weights, sanitize_layout_keys};

use std::path::Path;
use std::time::Instant;

use crate::config::LayoutOptions;
use crate::error::{GlmOcrError, Result};
use crate::imaging::{normalize_to_chw, resize_rgb, PageImage, ResampleFilter};
use crate::types::LayoutRegion;

use backbone::LayoutBackbone;
use decoder::LayoutDecoder;
use encoder::LayoutEncoder;

/// Detection output with per-stage wall-clock timings.
#[derive(Debug, Clone)]
pub struct LayoutDetection {
    pub regions: Vec<LayoutRegion>,
    pub preprocess_ms: f64,
    pub inference_ms: f64,
    pub postprocess_ms: f64,
}

/// Seam for the orchestrator; tests substitute in-memory fakes.
pub trait LayoutDetector: Send + Sync {
    /// Detect regions on one page with stage timings.
    fn detect_detailed(&self, page: &PageImage, options: &LayoutOptions)
        -> Result<LayoutDetection>;
}

/// The full detector model.
pub struct LayoutModel {
    backbone: LayoutBackbone,
    encoder: LayoutEncoder,
    decoder: LayoutDecoder,
    config: LayoutModelConfig,
}

impl std::fmt::Debug for LayoutModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayoutModel")
            .field("eval_size", &self.config.eval_size)
            .field("num_queries", &self.config.num_queries)
            .field("num_classes", &self.config.num_classes)
            .finish()
    }
}

impl LayoutModel {
    /// Load the detector from a resolved snapshot directory.
    pub fn load(dir: &Path) -> Result<Self> {
        let config = LayoutModelConfig::from_snapshot(dir)?;
        let mut weights = load_layout_weights(dir)?;
        let backbone = LayoutBackbone::load(&mut weights)?;
        let encoder = LayoutEncoder::load(&mut weights, &config)?;
        let decoder = LayoutDecoder::load(&mut weights, &config)?;
        if !weights.is_empty() {
            log::debug!("{} unused layout checkpoint tensors", weights.len());
        }
        Ok(Self {
            backbone,
            encoder,
            decoder,
            config,
        })
    }

    /// Raw model forward on an already preprocessed `(3, eval, eval)` input.
    pub fn predict(&self, input: &ndarray::Array3<f32>) -> Result<LayoutPrediction> {
        let eval = self.config.eval_size;
        if input.dim() != (3, eval, eval) {
            return Err(GlmOcrError::config(format!(
                "layout input must be (3, {eval}, {eval}), got {:?}",
                input.dim()
            )));
        }
        let features = self.backbone.forward(input);
        let encoded = self.encoder.forward(&features)?;
        let prediction = self.decoder.forward(&encoded)?;

        // Tensor contract checks before postprocessing trusts the shapes.
        let (q, c) = prediction.logits.dim();
        if q != self.config.num_queries.min(q) || c != self.config.num_classes {
            return Err(GlmOcrError::inference(
                "LayoutDetector",
                format!("unexpected logits shape ({q}, {c})"),
            ));
        }
        if prediction.pred_boxes.dim() != (q, 4)
            || prediction.order_logits.dim() != (q, q)
            || prediction.out_masks.dim().0 != q
        {
            return Err(GlmOcrError::inference(
                "LayoutDetector",
                "prediction tensor shapes disagree".to_string(),
            ));
        }
        Ok(prediction)
    }
}

impl LayoutDetector for LayoutModel {
    fn detect_detailed(
        &self,
        page: &PageImage,
        options: &LayoutOptions,
    ) -> Result<LayoutDetection> {
        let eval = self.config.eval_size as u32;

        let start = Instant::now();
        let resized = resize_rgb(page, eval, eval, ResampleFilter::Bicubic);
        let input = normalize_to_chw(&resized, None, None);
        let preprocess_ms = start.elapsed().as_secs_f64() * 1000.0;

        let start = Instant::now();
        let prediction = self.predict(&input)?;
        let inference_ms = start.elapsed().as_secs_f64() * 1000.0;

        let start = Instant::now();
        let regions = postprocess(
            &prediction,
            (page.width(), page.height()),
            options,
            &self.config,
        );
        let postprocess_ms = start.elapsed().as_secs_f64() * 1000.0;

        log::debug!(
            "layout: {} regions in {:.1}ms",
            regions.len(),
            preprocess_ms + inference_ms + postprocess_ms
        );
        Ok(LayoutDetection {
            regions,
            preprocess_ms,
            inference_ms,
            postprocess_ms,
        })
    }
}
