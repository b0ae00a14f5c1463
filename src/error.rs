//! 流水线错误类型
//! Pipeline error taxonomy

use std::path::PathBuf;

/// Errors raised inside a camera pipeline.
///
/// Stage loops decide locally what each variant means for them: source errors are
/// retried forever by the capture stage, an encoder channel error ends the segment
/// stage, persistence errors fail one segment and are reported.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("camera source {source_id} unavailable: {reason}")]
    SourceUnavailable { source_id: String, reason: String },

    #[error("frame read from {source_id} failed: {reason}")]
    ReadFailure { source_id: String, reason: String },

    #[error("encoder channel for {camera_id} failed: {source}")]
    EncoderChannel {
        camera_id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to persist {}: {source}", path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("resolution probe for {source_id} failed: {reason}")]
    Probe { source_id: String, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("detector model error: {0}")]
    Model(String),

    #[error("failed to spawn {what}: {source}")]
    Spawn {
        what: String,
        #[source]
        source: std::io::Error,
    },

    #[error("metadata encoding failed: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    /// Source errors are recovered by reopening the camera; everything else is not
    /// retried by the stage that hit it.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::SourceUnavailable { .. } | PipelineError::ReadFailure { .. }
        )
    }

    pub fn persistence(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::Persistence {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
