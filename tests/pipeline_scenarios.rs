//! End-to-end pipeline scenarios over in-memory fakes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use glm_ocr::config::{OcrConfig, ParseOptions};
use glm_ocr::imaging::PageImage;
use glm_ocr::layout::{LayoutDetection, LayoutDetector};
use glm_ocr::loader::{InputDocument, PdfRenderer};
use glm_ocr::pipeline::{CancelToken, OcrPipeline};
use glm_ocr::recognizer::{RecognitionOutput, RegionRecognizer};
use glm_ocr::types::{LayoutRegion, PipelineTask};
use glm_ocr::{GlmOcrError, LayoutOptions, RecognitionOptions, Result};
use sha2::{Digest, Sha256};

/// Recognizer fake: echoes canned text per prompt kind, optionally failing
/// selected calls.
struct FakeRecognizer {
    calls: AtomicUsize,
    fail_on_call: Option<usize>,
}

impl FakeRecognizer {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail_on_call: None,
        }
    }

    fn failing_on(call: usize) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail_on_call: Some(call),
        }
    }
}

impl RegionRecognizer for FakeRecognizer {
    fn recognize(
        &self,
        _image: &PageImage,
        prompt: &str,
        _options: &RecognitionOptions,
        cancel: &CancelToken,
    ) -> Result<RecognitionOutput> {
        cancel.check()?;
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_on_call == Some(call) {
            return Err(GlmOcrError::inference("Recognizer", "synthetic failure"));
        }
        let text = if prompt.starts_with("Table") {
            "<table><tr><td>cell</td></tr></table>".to_string()
        } else if prompt.starts_with("Title") {
            "Annual Report".to_string()
        } else {
            "  recognized text \n".to_string()
        };
        Ok(RecognitionOutput {
            text: text.trim().to_string(),
            preprocess_ms: 1.0,
            inference_ms: 2.0,
            postprocess_ms: 0.5,
        })
    }
}

/// Detector fake returning a fixed region list per page.
struct FakeDetector {
    regions: Vec<LayoutRegion>,
}

impl LayoutDetector for FakeDetector {
    fn detect_detailed(
        &self,
        _page: &PageImage,
        _options: &LayoutOptions,
    ) -> Result<LayoutDetection> {
        Ok(LayoutDetection {
            regions: self.regions.clone(),
            preprocess_ms: 1.0,
            inference_ms: 5.0,
            postprocess_ms: 1.0,
        })
    }
}

/// Detector fake that cancels the shared token on its second page.
struct CancellingDetector {
    calls: AtomicUsize,
    token: CancelToken,
}

impl LayoutDetector for CancellingDetector {
    fn detect_detailed(
        &self,
        _page: &PageImage,
        _options: &LayoutOptions,
    ) -> Result<LayoutDetection> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call == 1 {
            self.token.cancel();
            return Err(GlmOcrError::Cancelled);
        }
        Ok(LayoutDetection {
            regions: vec![region(0, "text", PipelineTask::Text, [10.0, 10.0, 500.0, 100.0])],
            preprocess_ms: 0.0,
            inference_ms: 0.0,
            postprocess_ms: 0.0,
        })
    }
}

struct FakeRenderer {
    pages: usize,
}

impl PdfRenderer for FakeRenderer {
    fn page_count(&self, _bytes: &[u8]) -> Result<usize> {
        Ok(self.pages)
    }

    fn page_size_points(&self, _bytes: &[u8], _index: usize) -> Result<(f32, f32)> {
        Ok((612.0, 792.0))
    }

    fn render_page(&self, _bytes: &[u8], _index: usize, _scale: f32) -> Result<PageImage> {
        Ok(PageImage::filled(200, 260, [255, 255, 255]))
    }
}

fn region(index: usize, label: &str, task: PipelineTask, bbox: [f32; 4]) -> LayoutRegion {
    LayoutRegion {
        index,
        label: label.to_string(),
        task,
        score: 0.9,
        bbox,
        polygon: vec![
            [bbox[0], bbox[1]],
            [bbox[2], bbox[1]],
            [bbox[2], bbox[3]],
            [bbox[0], bbox[3]],
        ],
        order: index,
    }
}

fn no_layout_config() -> OcrConfig {
    OcrConfig {
        enable_layout: false,
        ..OcrConfig::default()
    }
}

fn pipeline_with(
    config: OcrConfig,
    detector: Option<Arc<dyn LayoutDetector>>,
    recognizer: Arc<dyn RegionRecognizer>,
) -> OcrPipeline {
    OcrPipeline::with_components(config, detector, recognizer, None).unwrap()
}

/// S1: single image, layout disabled.
#[tokio::test]
async fn no_layout_image_produces_single_text_region() {
    let pipeline = pipeline_with(no_layout_config(), None, Arc::new(FakeRecognizer::new()));
    let input = InputDocument::Image(PageImage::filled(640, 480, [255, 255, 255]));
    let result = pipeline.parse(input, ParseOptions::default()).await.unwrap();

    assert_eq!(result.pages.len(), 1);
    assert_eq!(result.pages[0].regions.len(), 1);
    assert_eq!(result.pages[0].regions[0].native_label, "text");
    assert_eq!(result.markdown, "recognized text");

    let timings = &result.diagnostics.timings_ms;
    for key in ["page_load", "ocr_inference", "ocr_postprocess", "total"] {
        assert!(timings.contains_key(key), "missing timing {key}");
    }
    assert_eq!(timings["ocr_preprocess"], 0.0);
    assert!(!timings.contains_key("layout_inference"));
    assert_eq!(result.diagnostics.metadata["pageCount"], "1");
    assert_eq!(result.diagnostics.metadata["layoutEnabled"], "false");
}

/// S2: one page with doc_title / text / table regions in reading order.
#[tokio::test]
async fn layout_page_with_title_text_table() {
    let detector = FakeDetector {
        regions: vec![
            region(0, "doc_title", PipelineTask::Text, [100.0, 10.0, 900.0, 60.0]),
            region(1, "text", PipelineTask::Text, [100.0, 80.0, 900.0, 300.0]),
            region(2, "table", PipelineTask::Table, [100.0, 320.0, 900.0, 700.0]),
        ],
    };
    let pipeline = pipeline_with(
        OcrConfig::default(),
        Some(Arc::new(detector)),
        Arc::new(FakeRecognizer::new()),
    );
    let input = InputDocument::Image(PageImage::filled(800, 1000, [255, 255, 255]));
    let result = pipeline.parse(input, ParseOptions::default()).await.unwrap();

    let regions = &result.pages[0].regions;
    let labels: Vec<&str> = regions.iter().map(|r| r.native_label.as_str()).collect();
    assert_eq!(labels, vec!["text", "text", "table"]);
    assert!(regions[0]
        .content
        .as_deref()
        .unwrap()
        .starts_with("# "));
    // Indices strictly increase from zero.
    for (i, r) in regions.iter().enumerate() {
        assert_eq!(r.index, i);
    }

    // Two blank-line paragraph breaks, no horizontal rules, table last.
    assert_eq!(result.markdown.matches("\n\n").count(), 2);
    assert!(!result.markdown.contains("---"));
    assert!(result.markdown.ends_with("<table><tr><td>cell</td></tr></table>"));
    for key in [
        "layout_preprocess",
        "layout_inference",
        "layout_postprocess",
        "ocr_preprocess",
        "ocr_inference",
        "ocr_postprocess",
    ] {
        assert!(result.diagnostics.timings_ms.contains_key(key));
    }
}

/// S3: both page caps set, the smaller wins.
#[tokio::test]
async fn pdf_page_cap_takes_minimum() {
    let config = OcrConfig {
        default_max_pages: Some(2),
        ..no_layout_config()
    };
    let pipeline = OcrPipeline::with_components(
        config,
        None,
        Arc::new(FakeRecognizer::new()),
        Some(Arc::new(FakeRenderer { pages: 10 })),
    )
    .unwrap();
    let options = ParseOptions {
        max_pages: Some(5),
        ..ParseOptions::default()
    };
    let result = pipeline
        .parse(InputDocument::PdfBytes(vec![0]), options)
        .await
        .unwrap();
    assert_eq!(result.pages.len(), 2);
    assert_eq!(result.diagnostics.metadata["effectiveMaxPages"], "2");
    assert_eq!(result.diagnostics.metadata["maxPagesOption"], "5");
    assert_eq!(result.diagnostics.metadata["defaultMaxPages"], "2");
}

/// S5: cancellation during detection of page 2 of 3.
#[tokio::test]
async fn cancellation_during_layout_short_circuits() {
    let token = CancelToken::new();
    let detector = CancellingDetector {
        calls: AtomicUsize::new(0),
        token: token.clone(),
    };
    let state_root = tempfile::tempdir().unwrap();
    let state_file = state_root
        .path()
        .join("ModelDelivery")
        .join("model-delivery-state.json");

    let pipeline = OcrPipeline::with_components(
        OcrConfig::default(),
        Some(Arc::new(detector)),
        Arc::new(FakeRecognizer::new()),
        Some(Arc::new(FakeRenderer { pages: 3 })),
    )
    .unwrap();
    let err = pipeline
        .parse_cancellable(
            InputDocument::PdfBytes(vec![0]),
            ParseOptions::default(),
            token,
        )
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
    // No delivery state was written as a side effect.
    assert!(!state_file.exists());
}

/// S6: the no-layout prompt hash tracks the override.
#[tokio::test]
async fn prompt_override_hash_in_metadata() {
    let mut config = no_layout_config();
    config.prompts.no_layout = "Recognize:".to_string();
    let pipeline = pipeline_with(config, None, Arc::new(FakeRecognizer::new()));
    let input = InputDocument::Image(PageImage::filled(64, 64, [0, 0, 0]));
    let result = pipeline.parse(input, ParseOptions::default()).await.unwrap();

    let digest = Sha256::digest(b"Recognize:");
    let expected: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    assert_eq!(
        result.diagnostics.metadata["noLayoutPromptHash"],
        expected[..16]
    );
}

/// A failed region recognition yields empty content plus a warning and does
/// not fail the parse.
#[tokio::test]
async fn region_failure_is_recoverable() {
    let detector = FakeDetector {
        regions: vec![
            region(0, "text", PipelineTask::Text, [10.0, 10.0, 500.0, 100.0]),
            region(1, "text", PipelineTask::Text, [10.0, 120.0, 500.0, 220.0]),
        ],
    };
    let pipeline = pipeline_with(
        OcrConfig::default(),
        Some(Arc::new(detector)),
        Arc::new(FakeRecognizer::failing_on(0)),
    );
    let input = InputDocument::Image(PageImage::filled(800, 800, [255, 255, 255]));
    let result = pipeline.parse(input, ParseOptions::default()).await.unwrap();

    let regions = &result.pages[0].regions;
    let empty_count = regions
        .iter()
        .filter(|r| r.content.as_deref() == Some(""))
        .count();
    assert_eq!(empty_count, 1);
    assert_eq!(result.diagnostics.warnings.len(), 1);
    let warning = &result.diagnostics.warnings[0];
    assert!(warning.starts_with("page[0] region["));
    assert!(warning.contains("recognition failed:"));
    assert!(warning.contains("synthetic failure"));
}

/// Skip and abandon regions never reach the recognizer.
#[tokio::test]
async fn skip_regions_get_no_recognition() {
    let detector = FakeDetector {
        regions: vec![
            region(0, "image", PipelineTask::Skip, [10.0, 10.0, 500.0, 400.0]),
            region(1, "header", PipelineTask::Abandon, [10.0, 420.0, 500.0, 460.0]),
            region(2, "text", PipelineTask::Text, [10.0, 480.0, 500.0, 600.0]),
        ],
    };
    let recognizer = Arc::new(FakeRecognizer::new());
    let pipeline = pipeline_with(
        OcrConfig::default(),
        Some(Arc::new(detector)),
        recognizer.clone(),
    );
    let input = InputDocument::Image(PageImage::filled(800, 800, [255, 255, 255]));
    let result = pipeline.parse(input, ParseOptions::default()).await.unwrap();

    assert_eq!(recognizer.calls.load(Ordering::SeqCst), 1);
    // The image region becomes a placeholder in the markdown.
    assert!(result.markdown.contains("![](page=0,bbox=["));
    assert!(result.markdown.contains("recognized text"));
}

/// Property 6: byte-identical output for identical inputs.
#[tokio::test]
async fn parse_is_idempotent() {
    let detector = || FakeDetector {
        regions: vec![
            region(0, "doc_title", PipelineTask::Text, [100.0, 10.0, 900.0, 60.0]),
            region(1, "text", PipelineTask::Text, [100.0, 80.0, 900.0, 300.0]),
        ],
    };
    let run = |det: FakeDetector| async {
        let pipeline = pipeline_with(
            OcrConfig::default(),
            Some(Arc::new(det)),
            Arc::new(FakeRecognizer::new()),
        );
        let input = InputDocument::Image(PageImage::filled(640, 640, [255, 255, 255]));
        pipeline.parse(input, ParseOptions::default()).await.unwrap()
    };
    let a = run(detector()).await;
    let b = run(detector()).await;
    assert_eq!(a.pages, b.pages);
    assert_eq!(a.markdown, b.markdown);
    assert_eq!(a.diagnostics.warnings, b.diagnostics.warnings);
    assert_eq!(a.diagnostics.metadata, b.diagnostics.metadata);
}

/// Concurrent recognition with a limiter above one still merges results
/// deterministically by job key.
#[tokio::test]
async fn concurrent_recognitions_merge_in_order() {
    let regions: Vec<LayoutRegion> = (0..6)
        .map(|i| {
            region(
                i,
                "text",
                PipelineTask::Text,
                [10.0, 10.0 + i as f32 * 100.0, 900.0, 90.0 + i as f32 * 100.0],
            )
        })
        .collect();
    let config = OcrConfig {
        max_concurrent_recognitions: 4,
        ..OcrConfig::default()
    };
    let pipeline = pipeline_with(
        config,
        Some(Arc::new(FakeDetector { regions })),
        Arc::new(FakeRecognizer::new()),
    );
    let input = InputDocument::Image(PageImage::filled(800, 800, [255, 255, 255]));
    let result = pipeline.parse(input, ParseOptions::default()).await.unwrap();
    assert_eq!(result.pages[0].regions.len(), 6);
    for (i, r) in result.pages[0].regions.iter().enumerate() {
        assert_eq!(r.index, i);
        assert!(r.content.is_some());
    }
}

/// Whole-page recognition failure surfaces as a warning with the page key.
#[tokio::test]
async fn whole_page_failure_warns() {
    let pipeline = pipeline_with(
        no_layout_config(),
        None,
        Arc::new(FakeRecognizer::failing_on(0)),
    );
    let input = InputDocument::Image(PageImage::filled(64, 64, [0, 0, 0]));
    let result = pipeline.parse(input, ParseOptions::default()).await.unwrap();
    assert_eq!(result.pages[0].regions[0].content.as_deref(), Some(""));
    assert_eq!(result.diagnostics.warnings.len(), 1);
    assert!(result.diagnostics.warnings[0]
        .starts_with("page[0] region[0] recognition failed:"));
}

/// Zero max_pages is rejected before any work happens.
#[tokio::test]
async fn zero_max_pages_rejected() {
    let pipeline = pipeline_with(no_layout_config(), None, Arc::new(FakeRecognizer::new()));
    let options = ParseOptions {
        max_pages: Some(0),
        ..ParseOptions::default()
    };
    let err = pipeline
        .parse(
            InputDocument::Image(PageImage::filled(10, 10, [0, 0, 0])),
            options,
        )
        .await
        .unwrap_err();
    assert!(err.is_config_error());
}
