//! Error types for the filesystem collaborators.

use std::path::PathBuf;

use verdure_pipeline::PipelineError;

/// Errors raised while reading catalogs, rasters and areas of interest.
#[derive(Debug, thiserror::Error)]
pub enum IoError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON in {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("catalog item {id}: {reason}")]
    InvalidItem { id: String, reason: String },

    #[error("unsupported area-of-interest document: {0}")]
    UnsupportedAoi(String),

    #[error(transparent)]
    Aoi(#[from] PipelineError),
}

/// Result alias for filesystem operations.
pub type Result<T> = std::result::Result<T, IoError>;
