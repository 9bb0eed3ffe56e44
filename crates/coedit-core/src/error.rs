//! Error types for coedit

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("pipeline not found: {pipeline} (session {session})")]
    PipelineNotFound { session: String, pipeline: String },

    #[error("intent not found: {0}")]
    IntentNotFound(String),

    #[error("session busy: {0} already has an analysis running")]
    SessionBusy(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("pipeline error: {name} - {message}")]
    Pipeline { name: String, message: String },

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn storage(message: impl std::fmt::Display) -> Self {
        Self::Storage(message.to_string())
    }

    pub fn pipeline(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Pipeline {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn pipeline_not_found(session: impl Into<String>, pipeline: impl Into<String>) -> Self {
        Self::PipelineNotFound {
            session: session.into(),
            pipeline: pipeline.into(),
        }
    }

    /// True for the lookup failures a caller can act on (unknown session,
    /// pipeline or intent).
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::SessionNotFound(_) | Self::PipelineNotFound { .. } | Self::IntentNotFound(_)
        )
    }
}
