use std::path::PathBuf;

use thiserror::Error;

use crate::types::SubjectKind;

#[derive(Debug, Error)]
pub enum TrackerError {
    /// Camera missing, permission denied, disconnected or failed to open.
    #[error("camera error: {0}")]
    Device(String),

    #[error("{kind} landmark provider failed: {source:#}")]
    Provider {
        kind: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to load overlay asset {}: {reason}", path.display())]
    Asset { path: PathBuf, reason: String },

    #[error("{kind:?} landmark provider is not ready")]
    ProviderNotReady { kind: SubjectKind },

    #[error("frame source is not available")]
    SourceUnavailable,

    #[error("model error: {0}")]
    Model(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl TrackerError {
    pub fn provider(kind: SubjectKind, source: anyhow::Error) -> Self {
        TrackerError::Provider {
            kind: kind.label(),
            source,
        }
    }
}

pub type Result<T, E = TrackerError> = std::result::Result<T, E>;
