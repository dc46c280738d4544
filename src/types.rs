//! Core data structures shared across pipeline stages.

use serde::{Deserialize, Serialize};

/// What the recognizer should do with a detected region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineTask {
    Text,
    Table,
    Formula,
    /// Kept in the output but never sent to the recognizer.
    Skip,
    /// Auxiliary region; kept in the output but never recognized.
    Abandon,
}

impl PipelineTask {
    /// The recognition task for this region, or `None` when the region is
    /// not recognized at all.
    #[inline]
    #[must_use]
    pub const fn ocr_task(self) -> Option<Self> {
        match self {
            Self::Skip | Self::Abandon => None,
            other => Some(other),
        }
    }
}

/// One region located by the layout detector.
///
/// `bbox` is `[x1, y1, x2, y2]` normalized to `[0, 1000]`; `polygon` points
/// are normalized to `[0, 1000]^2`. `index` is the reading-order position
/// assigned after postprocessing; `order` is the raw order-pointer rank.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutRegion {
    pub index: usize,
    pub label: String,
    pub task: PipelineTask,
    pub score: f32,
    pub bbox: [f32; 4],
    pub polygon: Vec<[f32; 2]>,
    pub order: usize,
}

/// Mutable carrier for a region as it moves through recognition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionRecord {
    pub index: usize,
    pub native_label: String,
    pub task: PipelineTask,
    pub bbox: [f32; 4],
    /// Recognized content; `Some("")` after a failed recognition.
    pub content: Option<String>,
}

/// Stable identity used to merge concurrent recognition results back into
/// the pre-allocated region matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecognitionJobKey {
    pub page_index: usize,
    pub region_position: usize,
}

/// One parsed page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageResult {
    pub regions: Vec<RegionRecord>,
}

/// The full result of a parse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrDocumentResult {
    pub pages: Vec<PageResult>,
    pub markdown: String,
    pub diagnostics: crate::pipeline::DiagnosticBundle,
}
