// crates/core/src/error.rs
use std::path::PathBuf;
use thiserror::Error;

/// Request option that failed allow-list validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionField {
    OutputFormat,
    StemMode,
    IsolateStem,
    Model,
    ClipMode,
    Shifts,
    Segment,
    Overlap,
}

impl OptionField {
    /// Client-facing message for a rejected value of this field.
    pub fn message(&self) -> &'static str {
        match self {
            Self::OutputFormat => "Invalid output format",
            Self::StemMode => "Invalid stem mode",
            Self::IsolateStem => "Invalid isolate stem",
            Self::Model => "Invalid model",
            Self::ClipMode => "Invalid clip mode",
            Self::Shifts => "Invalid shifts value",
            Self::Segment => "Invalid segment value",
            Self::Overlap => "Invalid overlap value",
        }
    }
}

/// Errors raised while admitting a job. Always client-fault, always raised
/// before any path is computed or process spawned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Invalid job ID")]
    InvalidJobId,

    #[error("No file provided")]
    MissingFile,

    #[error("No file selected")]
    EmptyFilename,

    #[error("File type not allowed")]
    FileTypeNotAllowed,

    #[error("{}", .0.message())]
    InvalidOption(OptionField),

    #[error("Incompatible isolate_stem for selected model")]
    IncompatibleIsolateStem,

    #[error("Incompatible segment for selected model")]
    IncompatibleSegment,
}

impl ValidationError {
    /// True for cross-field violations (as opposed to a single bad value).
    pub fn is_incompatible_combination(&self) -> bool {
        matches!(
            self,
            Self::IncompatibleIsolateStem | Self::IncompatibleSegment
        )
    }
}

/// Errors raised by the path sandbox.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Path traversal detected: {attempted} escapes {root}")]
    Traversal { root: PathBuf, attempted: PathBuf },

    #[error("Sandbox root unavailable: {root}: {source}")]
    Root {
        root: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error resolving {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SandboxError {
    pub fn is_traversal(&self) -> bool {
        matches!(self, Self::Traversal { .. })
    }
}
