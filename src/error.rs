//! Error types for the GLM-OCR document understanding engine
//!
//! All public APIs use the `Result<T>` type alias which wraps `GlmOcrError`.
//! Delivery-internal failures (checksums, missing files, hub errors) collapse
//! into [`GlmOcrError::ModelDeliveryFailed`] with the specific
//! [`DeliveryError`] preserved as the source.

use std::fmt;
use std::path::PathBuf;

/// Errors raised by the model delivery layer.
///
/// These carry the specific reason for a delivery failure and are always
/// surfaced wrapped in [`GlmOcrError::ModelDeliveryFailed`].
#[derive(Debug)]
pub enum DeliveryError {
    /// A file required by the model manifest is absent from the snapshot.
    MissingRequiredFile(PathBuf),
    /// No `.safetensors` weight file present in the snapshot.
    NoWeightFiles(PathBuf),
    /// The persisted delivery state file does not exist.
    MissingState(PathBuf),
    /// The persisted state has no entry for the given model or file.
    MissingMetadata(String),
    /// An on-disk file's SHA-256 does not match the recorded integrity value.
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },
    /// The hub request (snapshot fetch or metadata probe) failed.
    HubRequestFailed(String),
    /// Filesystem failure while materializing or verifying a snapshot.
    Io(std::io::Error),
}

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingRequiredFile(path) => {
                write!(f, "required file missing from snapshot: {}", path.display())
            }
            Self::NoWeightFiles(path) => {
                write!(f, "no .safetensors files in snapshot: {}", path.display())
            }
            Self::MissingState(path) => {
                write!(f, "delivery state file not found: {}", path.display())
            }
            Self::MissingMetadata(what) => {
                write!(f, "delivery state has no entry for {what}")
            }
            Self::ChecksumMismatch {
                path,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "checksum mismatch for {}: expected {expected}, actual {actual}",
                    path.display()
                )
            }
            Self::HubRequestFailed(reason) => write!(f, "hub request failed: {reason}"),
            Self::Io(err) => write!(f, "delivery I/O error: {err}"),
        }
    }
}

impl std::error::Error for DeliveryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for DeliveryError {
    #[inline]
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

/// Errors that can occur while parsing a document
///
/// Errors are categorized by the stage of processing where they occurred.
/// Per-region recognition and crop failures are never fatal; they are
/// recorded as diagnostics warnings and the region content is left empty.
#[derive(Debug)]
pub enum GlmOcrError {
    /// Configuration or option validation failed, or a model produced
    /// tensors that violate the pipeline's shape contracts.
    InvalidConfiguration {
        /// Description of what is invalid
        reason: String,
    },

    /// PDF page rasterization failed
    PdfRenderingFailed {
        /// Description of the rendering failure
        reason: String,
    },

    /// Model snapshot resolution or integrity verification failed
    ModelDeliveryFailed {
        /// The specific delivery failure
        source: DeliveryError,
    },

    /// A collaborator contract (PDF renderer, tokenizer backend) is not
    /// available in this build.
    NotImplemented {
        /// Name of the missing capability
        feature: String,
    },

    /// The parse was cancelled cooperatively; no partial results are
    /// produced.
    Cancelled,

    /// Model inference failed
    InferenceError {
        /// Name of the model that failed (e.g. "`LayoutDetector`")
        model_name: String,
        /// The underlying error that caused the failure
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// IO error (file not found, permission denied, etc.)
    IoError(std::io::Error),
}

impl fmt::Display for GlmOcrError {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfiguration { reason } => {
                write!(f, "Invalid configuration: {reason}")
            }
            Self::PdfRenderingFailed { reason } => {
                write!(f, "PDF rendering failed: {reason}")
            }
            Self::ModelDeliveryFailed { source } => {
                write!(f, "Model delivery failed: {source}")
            }
            Self::NotImplemented { feature } => {
                write!(f, "Not implemented: {feature}")
            }
            Self::Cancelled => write!(f, "Parse cancelled"),
            Self::InferenceError { model_name, source } => {
                write!(f, "Inference failed for {model_name}: {source}")
            }
            Self::IoError(err) => write!(f, "IO error: {err}"),
        }
    }
}

impl std::error::Error for GlmOcrError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ModelDeliveryFailed { source } => Some(source),
            Self::InferenceError { source, .. } => {
                Some(source.as_ref() as &(dyn std::error::Error + 'static))
            }
            Self::IoError(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for GlmOcrError {
    #[inline]
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err)
    }
}

impl From<DeliveryError> for GlmOcrError {
    #[inline]
    fn from(source: DeliveryError) -> Self {
        Self::ModelDeliveryFailed { source }
    }
}

impl GlmOcrError {
    /// Shorthand for an [`GlmOcrError::InvalidConfiguration`] with a formatted reason.
    #[inline]
    pub fn config(reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            reason: reason.into(),
        }
    }

    /// Shorthand for an [`GlmOcrError::InferenceError`] from a plain message.
    #[inline]
    pub fn inference(model_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InferenceError {
            model_name: model_name.into(),
            source: reason.into().into(),
        }
    }

    /// Returns true if this error is a configuration error (user-fixable)
    #[inline]
    #[must_use = "this method returns a boolean, not modifying the error"]
    pub const fn is_config_error(&self) -> bool {
        matches!(self, Self::InvalidConfiguration { .. })
    }

    /// Returns true if this error came from the model delivery layer
    #[inline]
    #[must_use = "this method returns a boolean, not modifying the error"]
    pub const fn is_delivery_error(&self) -> bool {
        matches!(self, Self::ModelDeliveryFailed { .. })
    }

    /// Returns true if the parse was cancelled
    #[inline]
    #[must_use = "this method returns a boolean, not modifying the error"]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Type alias for Result with `GlmOcrError`
pub type Result<T> = std::result::Result<T, GlmOcrError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_config_error_display() {
        let err = GlmOcrError::config("max_pages must be > 0");
        assert_eq!(
            err.to_string(),
            "Invalid configuration: max_pages must be > 0"
        );
        assert!(err.is_config_error());
    }

    #[test]
    fn test_checksum_mismatch_display() {
        let err: GlmOcrError = DeliveryError::ChecksumMismatch {
            path: PathBuf::from("model.safetensors"),
            expected: "aa".repeat(32),
            actual: "bb".repeat(32),
        }
        .into();
        let msg = err.to_string();
        assert!(msg.contains("Model delivery failed"));
        assert!(msg.contains("checksum mismatch for model.safetensors"));
        assert!(msg.contains(&"aa".repeat(32)));
        assert!(err.is_delivery_error());
    }

    #[test]
    fn test_delivery_error_has_source() {
        let err: GlmOcrError = DeliveryError::MissingState(PathBuf::from("state.json")).into();
        assert!(err.source().is_some());
    }

    #[test]
    fn test_cancelled_is_terminal() {
        let err = GlmOcrError::Cancelled;
        assert!(err.is_cancelled());
        assert!(err.source().is_none());
        assert_eq!(err.to_string(), "Parse cancelled");
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "not found");
        let err: GlmOcrError = io_err.into();
        assert!(matches!(err, GlmOcrError::IoError(_)));
    }

    #[test]
    fn test_inference_error_display() {
        let err = GlmOcrError::inference("LayoutDetector", "bad input shape");
        let msg = err.to_string();
        assert!(msg.contains("Inference failed for LayoutDetector"));
        assert!(msg.contains("bad input shape"));
    }
}
