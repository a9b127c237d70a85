use miette::Diagnostic;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = ModError> = std::result::Result<T, E>;

/// Error kinds surfaced by the modification engine.
///
/// Callers match on the variant; the payload carries context for the report.
/// Every error aborts the whole `apply` before any manifest is written.
#[derive(Debug, Error, Diagnostic)]
#[non_exhaustive]
pub enum ModError {
    /// Unrecognized media type for a conversion, unsupported compression,
    /// malformed platform selector, or a similarly bad option argument.
    #[error("invalid input: {0}")]
    #[diagnostic(code(ocimod::invalid_input))]
    InvalidInput(String),

    /// A referenced object does not exist: layer index out of range, history
    /// pattern without a match, required annotation absent, missing blob.
    #[error("not found: {0}")]
    #[diagnostic(code(ocimod::not_found))]
    NotFound(String),

    /// Cross-object consistency violated, e.g. rebase prefix preconditions
    /// or layer/history/diff-id misalignment.
    #[error("mismatch: {0}")]
    #[diagnostic(code(ocimod::mismatch))]
    Mismatch(String),

    /// The operation cannot apply to this media type.
    #[error("unsupported media type: {0}")]
    #[diagnostic(code(ocimod::unsupported_media_type))]
    UnsupportedMediaType(String),

    /// A document, label, or inline data field failed to decode.
    #[error("parsing failed: {0}")]
    #[diagnostic(code(ocimod::parsing_failed))]
    ParsingFailed(String),

    /// Registry, filesystem, or archive i/o failure.
    #[error("i/o failed: {0}")]
    #[diagnostic(code(ocimod::io_failed))]
    Io(#[from] std::io::Error),
}

impl ModError {
    pub(crate) fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub(crate) fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub(crate) fn mismatch(msg: impl Into<String>) -> Self {
        Self::Mismatch(msg.into())
    }

    pub(crate) fn unsupported_media_type(msg: impl Into<String>) -> Self {
        Self::UnsupportedMediaType(msg.into())
    }

    pub(crate) fn parsing(msg: impl Into<String>) -> Self {
        Self::ParsingFailed(msg.into())
    }

    pub(crate) fn io_other(msg: impl std::fmt::Display) -> Self {
        Self::Io(std::io::Error::other(msg.to_string()))
    }
}

impl From<serde_json::Error> for ModError {
    fn from(e: serde_json::Error) -> Self {
        Self::ParsingFailed(e.to_string())
    }
}

impl From<oci_spec::OciSpecError> for ModError {
    fn from(e: oci_spec::OciSpecError) -> Self {
        Self::ParsingFailed(e.to_string())
    }
}

impl From<chrono::ParseError> for ModError {
    fn from(e: chrono::ParseError) -> Self {
        Self::ParsingFailed(e.to_string())
    }
}

impl From<reqwest::Error> for ModError {
    fn from(e: reqwest::Error) -> Self {
        Self::Io(std::io::Error::other(e))
    }
}
