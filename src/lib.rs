//! # GLM-OCR
//!
//! On-device document understanding: a page image or PDF goes through a
//! DETR-style layout detector, a vision-language recognizer, and a
//! deterministic Markdown formatter, coordinated by a pipeline with bounded
//! concurrency and cooperative cancellation.
//!
//! ## Quick start
//!
//! ```no_run
//! use glm_ocr::{InputDocument, OcrConfig, OcrPipeline, ParseOptions};
//!
//! # async fn example() -> glm_ocr::Result<()> {
//! let pipeline = OcrPipeline::new(OcrConfig::default())?;
//! let bytes = std::fs::read("page.png")?;
//! let result = pipeline
//!     .parse(InputDocument::ImageBytes(bytes), ParseOptions::default())
//!     .await?;
//! println!("{}", result.markdown);
//! for warning in &result.diagnostics.warnings {
//!     log::warn!("{warning}");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`layout`] — HGNet backbone, hybrid encoder, deformable decoder,
//!   order-pointer voting, and detection postprocessing.
//! - [`recognizer`] — vision tower, GLM decoder stack with M-RoPE and a
//!   block-growing KV cache, sampling, and the generation loop.
//! - [`pipeline`] — the orchestrator: page staging, the recognition
//!   limiter, diagnostics, and cancellation.
//! - [`formatter`] — label normalization and Markdown assembly.
//! - [`delivery`] — snapshot resolution, integrity state, and offline
//!   verification.
//! - [`tensor`] — the f32 numeric primitives everything above runs on.
//!
//! Models resolve lazily on first parse; tests inject in-memory fakes
//! through the [`layout::LayoutDetector`], [`recognizer::RegionRecognizer`],
//! and [`loader::PdfRenderer`] seams.

pub mod config;
pub mod delivery;
pub mod error;
pub mod formatter;
pub mod imaging;
pub mod layout;
pub mod loader;
pub mod pipeline;
pub mod recognizer;
pub mod tensor;
pub mod types;
pub mod weights;

pub use config::{
    LayoutOptions, MergeMode, OcrConfig, ParseOptions, PromptConfig, RecognitionOptions,
};
pub use error::{DeliveryError, GlmOcrError, Result};
pub use imaging::PageImage;
pub use loader::{InputDocument, PdfRenderer};
pub use pipeline::{CancelToken, DiagnosticBundle, OcrPipeline};
pub use types::{
    LayoutRegion, OcrDocumentResult, PageResult, PipelineTask, RecognitionJobKey, RegionRecord,
};
