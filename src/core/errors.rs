//! Core error types for the extraction pipeline.
//!
//! This module defines the fundamental error types used throughout the
//! header-recovery system, including the main ExtractError enum and the
//! ProcessingStage enum that tags where in the pipeline a failure occurred.

use thiserror::Error;

/// Enum representing different stages of processing in the extraction pipeline.
///
/// Used to identify which stage an error occurred in, providing context for
/// debugging without a separate error variant per stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingStage {
    /// Error occurred while rendering a page region to pixels.
    Rendering,
    /// Error occurred during image preprocessing.
    Preprocessing,
    /// Error occurred while invoking the OCR engine.
    Recognition,
    /// Error occurred while grouping pages into documents.
    Splitting,
    /// Error occurred while assembling an output document.
    Assembly,
    /// Generic processing error.
    Generic,
}

impl std::fmt::Display for ProcessingStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessingStage::Rendering => write!(f, "rendering"),
            ProcessingStage::Preprocessing => write!(f, "preprocessing"),
            ProcessingStage::Recognition => write!(f, "recognition"),
            ProcessingStage::Splitting => write!(f, "splitting"),
            ProcessingStage::Assembly => write!(f, "assembly"),
            ProcessingStage::Generic => write!(f, "processing"),
        }
    }
}

/// Enum representing the errors that can occur in the extraction pipeline.
#[derive(Error, Debug)]
pub enum ExtractError {
    /// The OCR engine binary is not installed or not runnable.
    ///
    /// Kept distinct from an empty recognition result so callers can tell
    /// "engine missing" apart from "page genuinely has no text".
    #[error("OCR engine '{engine}' unavailable: {reason}")]
    EngineUnavailable {
        /// The engine that could not be reached.
        engine: String,
        /// Why it was judged unavailable.
        reason: String,
    },

    /// The OCR engine ran but failed.
    #[error("OCR engine '{engine}' failed: {context}")]
    Recognition {
        /// The engine that failed.
        engine: String,
        /// Additional context about the failure.
        context: String,
    },

    /// Error occurred during processing.
    #[error("{stage} failed: {context}")]
    Processing {
        /// The stage of processing where the error occurred.
        stage: ProcessingStage,
        /// Additional context about the error.
        context: String,
        /// The underlying error that caused this error.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Error occurred while loading or manipulating an image.
    #[error("image")]
    Image(#[from] image::ImageError),

    /// Error from the PDF collaborator (open, render, text, assembly).
    #[error("pdf: {context}")]
    Pdf {
        /// Additional context about the PDF failure.
        context: String,
    },

    /// Error indicating invalid input.
    #[error("invalid input: {message}")]
    InvalidInput {
        /// A message describing the invalid input.
        message: String,
    },

    /// Error indicating a configuration problem.
    #[error("configuration: {message}")]
    Config {
        /// A message describing the configuration error.
        message: String,
    },

    /// IO error.
    #[error("io")]
    Io(#[from] std::io::Error),
}

impl ExtractError {
    /// Creates an invalid-input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Creates a configuration error with context and details.
    pub fn config_error(context: impl Into<String>, details: impl Into<String>) -> Self {
        Self::Config {
            message: format!("{}: {}", context.into(), details.into()),
        }
    }

    /// Creates a configuration error for invalid field values.
    pub fn invalid_field(
        field: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::Config {
            message: format!(
                "invalid value for field '{}': expected {}, got {}",
                field.into(),
                expected.into(),
                actual.into()
            ),
        }
    }

    /// Wraps an error from a named processing stage.
    pub fn processing(
        stage: ProcessingStage,
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Processing {
            stage,
            context: context.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a stage-tagged error without an underlying source.
    pub fn stage(stage: ProcessingStage, context: impl Into<String>) -> Self {
        Self::Processing {
            stage,
            context: context.into(),
            source: None,
        }
    }

    /// Creates a PDF collaborator error.
    pub fn pdf(context: impl Into<String>) -> Self {
        Self::Pdf {
            context: context.into(),
        }
    }
}

/// Convenient result alias used throughout the crate.
pub type ExtractResult<T> = Result<T, ExtractError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_display_is_lowercase() {
        assert_eq!(ProcessingStage::Rendering.to_string(), "rendering");
        assert_eq!(ProcessingStage::Generic.to_string(), "processing");
    }

    #[test]
    fn invalid_field_formats_message() {
        let err = ExtractError::invalid_field("max_render_scale", ">= initial_render_scale", "1.0");
        match err {
            ExtractError::Config { message } => {
                assert!(message.contains("max_render_scale"));
                assert!(message.contains("1.0"));
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn engine_unavailable_is_distinguishable() {
        let err = ExtractError::EngineUnavailable {
            engine: "tesseract".into(),
            reason: "binary not found".into(),
        };
        assert!(matches!(err, ExtractError::EngineUnavailable { .. }));
        assert!(err.to_string().contains("tesseract"));
    }
}
