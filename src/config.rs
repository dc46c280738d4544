//! Public configuration for the OCR pipeline.
//!
//! All structs serialize to JSON and round-trip losslessly. `validate()`
//! performs the checks a pipeline constructor relies on; every violation is
//! reported as [`GlmOcrError::InvalidConfiguration`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{GlmOcrError, Result};
use crate::types::PipelineTask;

/// Per-call parse options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParseOptions {
    pub include_markdown: bool,
    pub include_diagnostics: bool,
    /// Page cap for PDF inputs. Must be greater than zero when set.
    pub max_pages: Option<u32>,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            include_markdown: true,
            include_diagnostics: true,
            max_pages: None,
        }
    }
}

impl ParseOptions {
    pub fn validate(&self) -> Result<()> {
        if let Some(0) = self.max_pages {
            return Err(GlmOcrError::config("max_pages must be greater than zero"));
        }
        Ok(())
    }
}

/// Decoding parameters for the recognizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognitionOptions {
    pub max_tokens: usize,
    pub temperature: f32,
    pub prefill_step_size: usize,
    pub top_p: f32,
    pub top_k: usize,
    pub repetition_penalty: f32,
}

impl Default for RecognitionOptions {
    fn default() -> Self {
        Self {
            max_tokens: 4096,
            temperature: 0.0,
            prefill_step_size: 2048,
            top_p: 1.0,
            top_k: 1,
            repetition_penalty: 1.0,
        }
    }
}

/// Prompts for each recognition task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    pub no_layout: String,
    pub text: String,
    pub table: String,
    pub formula: String,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            no_layout: "Text Recognition:".to_string(),
            text: "Text Recognition:".to_string(),
            table: "Table Recognition:".to_string(),
            formula: "Formula Recognition:".to_string(),
        }
    }
}

impl PromptConfig {
    /// The prompt used for a recognized region of the given task.
    #[must_use]
    pub fn for_task(&self, task: PipelineTask) -> &str {
        match task {
            PipelineTask::Table => &self.table,
            PipelineTask::Formula => &self.formula,
            _ => &self.text,
        }
    }
}

/// Containment merge behavior for one class label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMode {
    /// Drop detections contained inside a detection of this class.
    Large,
    /// Drop detections that contain a detection of this class, unless they
    /// are themselves contained.
    Small,
}

/// Layout-detector postprocessing options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutOptions {
    /// Global score threshold.
    pub threshold: f32,
    /// Per-class score threshold overrides, keyed by class id.
    pub threshold_by_class: BTreeMap<u32, f32>,
    pub layout_nms: bool,
    /// Box expansion ratios `(x, y)` applied after filtering.
    pub unclip_ratio: (f32, f32),
    /// Containment filter behavior per class label.
    pub merge_bboxes_mode: BTreeMap<String, MergeMode>,
    /// Native label to pipeline task. Unmapped labels default to text.
    pub label_task_mapping: BTreeMap<String, PipelineTask>,
    /// Class-id to label override; when absent the model config's table is
    /// used.
    pub id2label: Option<BTreeMap<u32, String>>,
}

impl Default for LayoutOptions {
    fn default() -> Self {
        let mut label_task_mapping = BTreeMap::new();
        for label in ["image", "chart", "seal"] {
            label_task_mapping.insert(label.to_string(), PipelineTask::Skip);
        }
        for label in ["header", "footer", "header_image", "footer_image", "number"] {
            label_task_mapping.insert(label.to_string(), PipelineTask::Abandon);
        }
        label_task_mapping.insert("table".to_string(), PipelineTask::Table);
        label_task_mapping.insert("formula".to_string(), PipelineTask::Formula);
        label_task_mapping.insert("display_formula".to_string(), PipelineTask::Formula);

        Self {
            threshold: 0.3,
            threshold_by_class: BTreeMap::new(),
            layout_nms: true,
            unclip_ratio: (1.0, 1.0),
            merge_bboxes_mode: BTreeMap::new(),
            label_task_mapping,
            id2label: None,
        }
    }
}

/// Pipeline configuration.
///
/// Mirrors the options the engine recognizes; everything not listed here is
/// fixed by the model checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrConfig {
    pub recognizer_model_id: String,
    pub layout_model_id: String,
    pub max_concurrent_recognitions: u32,
    pub enable_layout: bool,
    pub recognition: RecognitionOptions,
    pub prompts: PromptConfig,
    pub layout: LayoutOptions,
    pub pdf_dpi: f32,
    pub pdf_max_rendered_long_side: u32,
    pub default_max_pages: Option<u32>,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            recognizer_model_id: "mlx-community/GLM-OCR-bf16".to_string(),
            layout_model_id: "PaddlePaddle/PP-DocLayoutV3_safetensors".to_string(),
            max_concurrent_recognitions: 1,
            enable_layout: true,
            recognition: RecognitionOptions::default(),
            prompts: PromptConfig::default(),
            layout: LayoutOptions::default(),
            pdf_dpi: 200.0,
            pdf_max_rendered_long_side: 3500,
            default_max_pages: None,
        }
    }
}

impl OcrConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.recognizer_model_id.is_empty() {
            return Err(GlmOcrError::config("recognizer_model_id must not be empty"));
        }
        if self.layout_model_id.is_empty() {
            return Err(GlmOcrError::config("layout_model_id must not be empty"));
        }
        if self.max_concurrent_recognitions < 1 {
            return Err(GlmOcrError::config(
                "max_concurrent_recognitions must be at least 1",
            ));
        }
        for (name, prompt) in [
            ("no_layout", &self.prompts.no_layout),
            ("text", &self.prompts.text),
            ("table", &self.prompts.table),
            ("formula", &self.prompts.formula),
        ] {
            if prompt.trim().is_empty() {
                return Err(GlmOcrError::config(format!(
                    "prompt '{name}' must not be empty"
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.layout.threshold) {
            return Err(GlmOcrError::config(format!(
                "layout threshold {} outside [0, 1]",
                self.layout.threshold
            )));
        }
        if self.recognition.max_tokens == 0 {
            return Err(GlmOcrError::config("max_tokens must be greater than zero"));
        }
        if self.recognition.prefill_step_size == 0 {
            return Err(GlmOcrError::config(
                "prefill_step_size must be greater than zero",
            ));
        }
        if !(0.0..=1.0).contains(&self.recognition.top_p) {
            return Err(GlmOcrError::config(format!(
                "top_p {} outside [0, 1]",
                self.recognition.top_p
            )));
        }
        if self.pdf_dpi <= 0.0 {
            return Err(GlmOcrError::config("pdf_dpi must be positive"));
        }
        if self.pdf_max_rendered_long_side == 0 {
            return Err(GlmOcrError::config(
                "pdf_max_rendered_long_side must be positive",
            ));
        }
        if let Some(0) = self.default_max_pages {
            return Err(GlmOcrError::config(
                "default_max_pages must be greater than zero",
            ));
        }
        Ok(())
    }

    /// The effective PDF page cap for a parse: the minimum of the option and
    /// the configured default when both are set, otherwise whichever is set.
    #[must_use]
    pub fn effective_max_pages(&self, options: &ParseOptions) -> Option<u32> {
        match (options.max_pages, self.default_max_pages) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }
}
