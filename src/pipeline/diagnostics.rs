//! Warnings, stage timings, and metadata for one parse.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Debug tracing gate. Controls stderr emission only; never results.
static TRACE_ENABLED: Lazy<bool> = Lazy::new(|| std::env::var("GLM_OCR_TRACE").is_ok());

/// Emit a debug trace line to stderr when `GLM_OCR_TRACE` is set.
pub fn debug_trace(message: impl FnOnce() -> String) {
    if *TRACE_ENABLED {
        eprintln!("[glm-ocr] {}", message());
    }
}

/// Diagnostics returned alongside a parse result.
///
/// Warnings preserve insertion order and may repeat; timing and metadata
/// maps are ordered for reproducible serialization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticBundle {
    pub warnings: Vec<String>,
    pub timings_ms: BTreeMap<String, f64>,
    pub metadata: BTreeMap<String, String>,
}

impl DiagnosticBundle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        log::warn!("{message}");
        self.warnings.push(message);
    }

    pub fn set_timing(&mut self, stage: &str, ms: f64) {
        self.timings_ms.insert(stage.to_string(), ms);
    }

    /// Accumulate into a stage bucket (per-region OCR stages sum up).
    pub fn add_timing(&mut self, stage: &str, ms: f64) {
        *self.timings_ms.entry(stage.to_string()).or_insert(0.0) += ms;
    }

    pub fn set_metadata(&mut self, key: &str, value: impl Into<String>) {
        self.metadata.insert(key.to_string(), value.into());
    }
}

/// First 16 hex characters of the SHA-256 of a configured prompt.
#[must_use]
pub fn prompt_hash(prompt: &str) -> String {
    let digest = Sha256::digest(prompt.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..16].to_string()
}
