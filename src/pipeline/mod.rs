//! Pipeline orchestration: staging, bounded concurrent recognition,
//! deterministic merging, diagnostics, and cancellation.

mod cancel;
mod crop;
mod diagnostics;
mod limiter;

pub use cancel::CancelToken;
pub use crop::{crop_region, validate_bbox};
pub use diagnostics::{debug_trace, prompt_hash, DiagnosticBundle};
pub use limiter::AsyncLimiter;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::OnceCell;
use tokio::task::JoinSet;

use crate::config::{OcrConfig, ParseOptions};
use crate::delivery::ModelDelivery;
use crate::error::{GlmOcrError, Result};
use crate::formatter;
use crate::imaging::PageImage;
use crate::layout::{LayoutDetector, LayoutModel};
use crate::loader::{load_pages, InputDocument, PdfRenderer};
use crate::recognizer::{GlmRecognizer, RecognitionOutput, RegionRecognizer};
use crate::types::{
    OcrDocumentResult, PageResult, PipelineTask, RecognitionJobKey, RegionRecord,
};

/// The long-lived parsing pipeline.
///
/// Models are loaded lazily under a single-flight cell, so concurrent
/// callers await one load; detector and recognizer are trait objects behind
/// shared handles and tests substitute in-memory fakes.
pub struct OcrPipeline {
    config: OcrConfig,
    detector: OnceCell<Arc<dyn LayoutDetector>>,
    recognizer: OnceCell<Arc<dyn RegionRecognizer>>,
    renderer: Option<Arc<dyn PdfRenderer>>,
    limiter: AsyncLimiter,
}

impl std::fmt::Debug for OcrPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OcrPipeline")
            .field("recognizer_model_id", &self.config.recognizer_model_id)
            .field("layout_model_id", &self.config.layout_model_id)
            .field("enable_layout", &self.config.enable_layout)
            .finish()
    }
}

impl OcrPipeline {
    /// Build a pipeline that resolves and loads its models on first use.
    pub fn new(config: OcrConfig) -> Result<Self> {
        config.validate()?;
        let limiter = AsyncLimiter::new(config.max_concurrent_recognitions as usize);
        Ok(Self {
            config,
            detector: OnceCell::new(),
            recognizer: OnceCell::new(),
            renderer: None,
            limiter,
        })
    }

    /// Build a pipeline around injected collaborators.
    pub fn with_components(
        config: OcrConfig,
        detector: Option<Arc<dyn LayoutDetector>>,
        recognizer: Arc<dyn RegionRecognizer>,
        renderer: Option<Arc<dyn PdfRenderer>>,
    ) -> Result<Self> {
        config.validate()?;
        let limiter = AsyncLimiter::new(config.max_concurrent_recognitions as usize);
        let detector_cell = OnceCell::new();
        if let Some(d) = detector {
            detector_cell.set(d).ok();
        }
        let recognizer_cell = OnceCell::new();
        recognizer_cell.set(recognizer).ok();
        Ok(Self {
            config,
            detector: detector_cell,
            recognizer: recognizer_cell,
            renderer,
            limiter,
        })
    }

    /// Inject a PDF renderer.
    #[must_use]
    pub fn with_renderer(mut self, renderer: Arc<dyn PdfRenderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    async fn detector(&self) -> Result<Arc<dyn LayoutDetector>> {
        let model_id = self.config.layout_model_id.clone();
        self.detector
            .get_or_try_init(|| async move {
                tokio::task::spawn_blocking(move || -> Result<Arc<dyn LayoutDetector>> {
                    let delivery = ModelDelivery::with_default_root()?;
                    let dir = delivery.ensure_model_ready(&model_id)?;
                    Ok(Arc::new(LayoutModel::load(&dir)?) as Arc<dyn LayoutDetector>)
                })
                .await
                .map_err(|e| GlmOcrError::config(format!("layout load task failed: {e}")))?
            })
            .await
            .cloned()
    }

    async fn recognizer(&self) -> Result<Arc<dyn RegionRecognizer>> {
        let model_id = self.config.recognizer_model_id.clone();
        self.recognizer
            .get_or_try_init(|| async move {
                tokio::task::spawn_blocking(move || -> Result<Arc<dyn RegionRecognizer>> {
                    let delivery = ModelDelivery::with_default_root()?;
                    let dir = delivery.ensure_model_ready(&model_id)?;
                    Ok(Arc::new(GlmRecognizer::load(&dir)?) as Arc<dyn RegionRecognizer>)
                })
                .await
                .map_err(|e| GlmOcrError::config(format!("recognizer load task failed: {e}")))?
            })
            .await
            .cloned()
    }

    /// Parse a document.
    pub async fn parse(
        &self,
        input: InputDocument,
        options: ParseOptions,
    ) -> Result<OcrDocumentResult> {
        self.parse_cancellable(input, options, CancelToken::new())
            .await
    }

    /// Parse with an external cancellation token.
    pub async fn parse_cancellable(
        &self,
        input: InputDocument,
        options: ParseOptions,
        cancel: CancelToken,
    ) -> Result<OcrDocumentResult> {
        options.validate()?;
        cancel.check()?;

        let total_start = Instant::now();
        let mut diagnostics = DiagnosticBundle::new();
        let effective_cap = self.config.effective_max_pages(&options);

        // Page loading.
        let start = Instant::now();
        let pages = {
            let input = input.clone();
            let renderer = self.renderer.clone();
            let dpi = self.config.pdf_dpi;
            let long_side = self.config.pdf_max_rendered_long_side;
            tokio::task::spawn_blocking(move || {
                load_pages(&input, effective_cap, dpi, long_side, renderer.as_deref())
            })
            .await
            .map_err(|e| GlmOcrError::config(format!("page load task failed: {e}")))??
        };
        diagnostics.set_timing("page_load", ms_since(start));

        self.fill_metadata(&mut diagnostics, &options, effective_cap, pages.len());

        let mut page_results = if self.config.enable_layout {
            self.run_layout_pipeline(&pages, &cancel, &mut diagnostics)
                .await?
        } else {
            self.run_whole_page_pipeline(&pages, &cancel, &mut diagnostics)
                .await?
        };

        cancel.check()?;

        let markdown = if options.include_markdown {
            formatter::format_document(&mut page_results)
        } else {
            formatter::renumber_only(&mut page_results);
            String::new()
        };

        diagnostics.set_timing("total", ms_since(total_start));
        Ok(OcrDocumentResult {
            pages: page_results,
            markdown,
            diagnostics: if options.include_diagnostics {
                diagnostics
            } else {
                DiagnosticBundle::new()
            },
        })
    }

    fn fill_metadata(
        &self,
        diagnostics: &mut DiagnosticBundle,
        options: &ParseOptions,
        effective_cap: Option<u32>,
        page_count: usize,
    ) {
        let optional = |v: Option<u32>| v.map_or_else(|| "none".to_string(), |n| n.to_string());
        diagnostics.set_metadata("layoutEnabled", self.config.enable_layout.to_string());
        diagnostics.set_metadata("pageCount", page_count.to_string());
        diagnostics.set_metadata(
            "maxConcurrentRecognitions",
            self.config.max_concurrent_recognitions.to_string(),
        );
        diagnostics.set_metadata("maxPagesOption", optional(options.max_pages));
        diagnostics.set_metadata("defaultMaxPages", optional(self.config.default_max_pages));
        diagnostics.set_metadata("effectiveMaxPages", optional(effective_cap));
        diagnostics.set_metadata("pdfDPI", format_number(self.config.pdf_dpi));
        diagnostics.set_metadata(
            "pdfMaxRenderedLongSide",
            self.config.pdf_max_rendered_long_side.to_string(),
        );
        diagnostics.set_metadata(
            "noLayoutPromptHash",
            prompt_hash(&self.config.prompts.no_layout),
        );
        diagnostics.set_metadata("textPromptHash", prompt_hash(&self.config.prompts.text));
        diagnostics.set_metadata("tablePromptHash", prompt_hash(&self.config.prompts.table));
        diagnostics.set_metadata(
            "formulaPromptHash",
            prompt_hash(&self.config.prompts.formula),
        );
    }

    /// Layout-enabled path: detect every page, then recognize each
    /// non-skipped region under the limiter.
    async fn run_layout_pipeline(
        &self,
        pages: &[PageImage],
        cancel: &CancelToken,
        diagnostics: &mut DiagnosticBundle,
    ) -> Result<Vec<PageResult>> {
        let detector = self.detector().await?;
        let layout_options = self.config.layout.clone();

        let mut detections = Vec::with_capacity(pages.len());
        let mut layout_pre = 0.0;
        let mut layout_inf = 0.0;
        let mut layout_post = 0.0;
        for page in pages {
            cancel.check()?;
            let detection = {
                let detector = Arc::clone(&detector);
                let page = page.clone();
                let layout_options = layout_options.clone();
                tokio::task::spawn_blocking(move || {
                    detector.detect_detailed(&page, &layout_options)
                })
                .await
                .map_err(|e| GlmOcrError::config(format!("layout task failed: {e}")))??
            };
            layout_pre += detection.preprocess_ms;
            layout_inf += detection.inference_ms;
            layout_post += detection.postprocess_ms;
            debug_trace(|| {
                format!(
                    "page {}: {} regions in {:.1}ms",
                    detections.len(),
                    detection.regions.len(),
                    detection.inference_ms
                )
            });
            detections.push(detection.regions);
        }
        diagnostics.set_timing("layout_preprocess", layout_pre);
        diagnostics.set_timing("layout_inference", layout_inf);
        diagnostics.set_timing("layout_postprocess", layout_post);

        // Pre-allocated region matrix in layout-postprocess order.
        let mut page_results: Vec<PageResult> = detections
            .iter()
            .map(|regions| PageResult {
                regions: regions
                    .iter()
                    .map(|r| RegionRecord {
                        index: r.index,
                        native_label: r.label.clone(),
                        task: r.task,
                        bbox: r.bbox,
                        content: None,
                    })
                    .collect(),
            })
            .collect();

        let recognizer = self.recognizer().await?;
        let recognition_options = self.config.recognition.clone();
        let mut join_set: JoinSet<(RecognitionJobKey, Result<RecognitionOutput>)> =
            JoinSet::new();
        let mut crop_failures: Vec<(RecognitionJobKey, String)> = Vec::new();

        for (page_index, page) in pages.iter().enumerate() {
            for (region_position, region) in detections[page_index].iter().enumerate() {
                if region.task.ocr_task().is_none() {
                    continue;
                }
                cancel.check()?;
                let key = RecognitionJobKey {
                    page_index,
                    region_position,
                };
                let cropped = validate_bbox(region.bbox)
                    .and_then(|()| crop_region(page, region.bbox, &region.polygon));
                let image = match cropped {
                    Ok(image) => image,
                    Err(err) => {
                        crop_failures.push((key, err.to_string()));
                        continue;
                    }
                };
                let prompt = self.config.prompts.for_task(region.task).to_string();
                let recognizer = Arc::clone(&recognizer);
                let limiter = self.limiter.clone();
                let options = recognition_options.clone();
                let cancel = cancel.clone();
                join_set.spawn(async move {
                    let permit = match limiter.acquire().await {
                        Ok(permit) => permit,
                        Err(err) => return (key, Err(err)),
                    };
                    let result = tokio::task::spawn_blocking(move || {
                        recognizer.recognize(&image, &prompt, &options, &cancel)
                    })
                    .await
                    .map_err(|e| {
                        GlmOcrError::config(format!("recognition task failed: {e}"))
                    })
                    .and_then(|r| r);
                    drop(permit);
                    (key, result)
                });
            }
        }

        // Crop failures: empty content plus a warning, no recognition job.
        for (key, message) in &crop_failures {
            let record =
                &mut page_results[key.page_index].regions[key.region_position];
            record.content = Some(String::new());
            diagnostics.warn(format!(
                "page[{}] region[{}] crop failed: {message}",
                key.page_index, key.region_position
            ));
        }

        self.gather(join_set, &mut page_results, cancel, diagnostics)
            .await?;
        Ok(page_results)
    }

    /// Layout-disabled path: one whole-page recognition per page.
    async fn run_whole_page_pipeline(
        &self,
        pages: &[PageImage],
        cancel: &CancelToken,
        diagnostics: &mut DiagnosticBundle,
    ) -> Result<Vec<PageResult>> {
        let mut page_results: Vec<PageResult> = pages
            .iter()
            .map(|_| PageResult {
                regions: vec![RegionRecord {
                    index: 0,
                    native_label: "text".to_string(),
                    task: PipelineTask::Text,
                    bbox: [0.0, 0.0, 1000.0, 1000.0],
                    content: None,
                }],
            })
            .collect();

        let recognizer = self.recognizer().await?;
        let recognition_options = self.config.recognition.clone();
        let prompt = self.config.prompts.no_layout.clone();
        let mut join_set: JoinSet<(RecognitionJobKey, Result<RecognitionOutput>)> =
            JoinSet::new();
        for (page_index, page) in pages.iter().enumerate() {
            cancel.check()?;
            let key = RecognitionJobKey {
                page_index,
                region_position: 0,
            };
            let recognizer = Arc::clone(&recognizer);
            let limiter = self.limiter.clone();
            let options = recognition_options.clone();
            let prompt = prompt.clone();
            let cancel = cancel.clone();
            let page = page.clone();
            join_set.spawn(async move {
                let permit = match limiter.acquire().await {
                    Ok(permit) => permit,
                    Err(err) => return (key, Err(err)),
                };
                let result = tokio::task::spawn_blocking(move || {
                    recognizer.recognize(&page, &prompt, &options, &cancel)
                })
                .await
                .map_err(|e| GlmOcrError::config(format!("recognition task failed: {e}")))
                .and_then(|r| r);
                drop(permit);
                (key, result)
            });
        }

        self.gather(join_set, &mut page_results, cancel, diagnostics)
            .await?;
        // Whole-page mode has no separate region preprocessing stage.
        diagnostics.set_timing("ocr_preprocess", 0.0);
        Ok(page_results)
    }

    /// Join all recognition jobs and merge results by key. Interleaved
    /// completion cannot affect output order: results are applied in key
    /// order.
    async fn gather(
        &self,
        mut join_set: JoinSet<(RecognitionJobKey, Result<RecognitionOutput>)>,
        page_results: &mut [PageResult],
        cancel: &CancelToken,
        diagnostics: &mut DiagnosticBundle,
    ) -> Result<()> {
        let mut results: BTreeMap<RecognitionJobKey, Result<RecognitionOutput>> =
            BTreeMap::new();
        while let Some(joined) = join_set.join_next().await {
            let (key, result) = joined
                .map_err(|e| GlmOcrError::config(format!("recognition join failed: {e}")))?;
            results.insert(key, result);
        }

        for (key, result) in results {
            let record = page_results
                .get_mut(key.page_index)
                .and_then(|p| p.regions.get_mut(key.region_position))
                .ok_or_else(|| {
                    GlmOcrError::config(format!(
                        "recognition result for unknown slot page[{}] region[{}]",
                        key.page_index, key.region_position
                    ))
                })?;
            match result {
                Ok(output) => {
                    record.content = Some(output.text);
                    diagnostics.add_timing("ocr_preprocess", output.preprocess_ms);
                    diagnostics.add_timing("ocr_inference", output.inference_ms);
                    diagnostics.add_timing("ocr_postprocess", output.postprocess_ms);
                }
                Err(GlmOcrError::Cancelled) => return Err(GlmOcrError::Cancelled),
                Err(err) => {
                    record.content = Some(String::new());
                    diagnostics.warn(format!(
                        "page[{}] region[{}] recognition failed: {err}",
                        key.page_index, key.region_position
                    ));
                }
            }
        }
        // Make sure the OCR stage keys exist even when every job failed.
        for stage in ["ocr_preprocess", "ocr_inference", "ocr_postprocess"] {
            diagnostics.add_timing(stage, 0.0);
        }
        cancel.check()
    }
}

fn ms_since(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

/// Format a float without a trailing `.0` when it is integral.
fn format_number(v: f32) -> String {
    if v.fract() == 0.0 {
        format!("{}", v as i64)
    } else {
        format!("{v}")
    }
}
