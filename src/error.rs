//! Typed errors raised by the analysis library.
//!
//! Pipeline stages map these onto an [`AnalysisStatus`](crate::face_analysis::AnalysisStatus);
//! the CLI wraps them with `anyhow` context.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("expected {expected} landmark points, got {actual}")]
    LandmarkCount { expected: usize, actual: usize },

    #[error("unsupported image layout: {0}")]
    UnsupportedImage(String),

    #[error("degenerate alignment transform: {0}")]
    DegenerateTransform(&'static str),

    #[error("model sidecar I/O failed: {0}")]
    SidecarIo(#[from] std::io::Error),

    #[error("model sidecar protocol error: {0}")]
    SidecarProtocol(String),
}
