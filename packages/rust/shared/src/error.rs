//! Error types for KnowTree.
//!
//! Library crates use [`KnowTreeError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;
use std::time::Duration;

/// Top-level error type for all KnowTree operations.
#[derive(Debug, thiserror::Error)]
pub enum KnowTreeError {
    /// The completion service could not be reached, timed out, or returned a
    /// non-success status.
    #[error("transport error: {0}")]
    Transport(String),

    /// The foundation classifier got something other than yes/no.
    #[error("ambiguous classification for {concept:?}: {response:?}")]
    ClassificationAmbiguous { concept: String, response: String },

    /// No usable prerequisite list could be extracted from the model output.
    #[error("could not parse prerequisites for {concept:?}")]
    PrerequisiteParse { concept: String, raw: String },

    /// Every call of an enrichment stage failed.
    #[error("enrichment stage {stage} unavailable: {message}")]
    StageUnavailable { stage: String, message: String },

    /// The run was cancelled by the caller.
    #[error("operation cancelled")]
    Cancelled,

    /// Structured model output (JSON object etc.) could not be parsed.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (schema mismatch, broken tree invariant, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Script generation failed.
    #[error("code generation error: {0}")]
    Codegen(String),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, KnowTreeError>;

impl KnowTreeError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// A call that did not complete within `after`.
    pub fn timeout(after: Duration) -> Self {
        Self::Transport(format!("request timed out after {}s", after.as_secs()))
    }

    pub fn stage_unavailable(stage: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::StageUnavailable {
            stage: stage.into(),
            message: msg.into(),
        }
    }

    /// Whether this error came from the transport rather than model output.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
