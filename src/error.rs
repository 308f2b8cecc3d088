//! Error taxonomy for the playbook core
//!
//! `AceError` is what crosses module and HTTP boundaries. The learning
//! pipeline carries two narrower errors: `CapabilityError` for reflector and
//! curator calls, and `ApplyError` for curation batches that fail validation.

use axum::http::StatusCode;
use axum::Json;

use crate::types::OperationKind;

/// Result alias used throughout the library
pub type AceResult<T> = Result<T, AceError>;

#[derive(Debug, thiserror::Error)]
pub enum AceError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error(transparent)]
    Reference(#[from] ApplyError),

    #[error(transparent)]
    Capability(#[from] CapabilityError),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AceError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Reference(_) => StatusCode::CONFLICT,
            Self::Capability(_) => StatusCode::BAD_GATEWAY,
            Self::Database(_) | Self::Serialization(_) | Self::Io(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl axum::response::IntoResponse for AceError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("request failed: {}", self);
        }
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

/// Failure of a reflector or curator invocation.
///
/// Every variant is treated as transient by the retry policy; the message is
/// preserved verbatim on the failed job.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CapabilityError {
    #[error("{capability} request failed: {message}")]
    Transport { capability: &'static str, message: String },

    #[error("{capability} refused to respond: {message}")]
    Refused { capability: &'static str, message: String },

    #[error("{capability} returned malformed output: {message}")]
    Malformed { capability: &'static str, message: String },

    #[error("{capability} returned invalid output: {message}")]
    Invalid { capability: &'static str, message: String },

    #[error("{capability} timed out after {seconds}s")]
    Timeout { capability: &'static str, seconds: u64 },
}

/// Why a curation batch was rejected. Nothing from the batch is committed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ApplyError {
    #[error("operation {index} ({kind}) references bullet {bullet_id} which does not exist in playbook {playbook_id}")]
    MissingBullet {
        index: usize,
        kind: OperationKind,
        bullet_id: String,
        playbook_id: String,
    },

    #[error("operation {index} ({kind}) has invalid content: {reason}")]
    InvalidContent {
        index: usize,
        kind: OperationKind,
        reason: String,
    },
}
