//! Error types for Gambit

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("front matter parse error in {path}: {message}")]
    FrontMatterParse { path: String, message: String },

    #[error("embed cycle: {chain}")]
    EmbedCycle { chain: String },

    #[error("tool name is reserved: {name}")]
    ToolNameReserved { name: String },

    #[error("tool name is invalid: {name} ({reason})")]
    ToolNameInvalid { name: String, reason: String },

    #[error("tool name collision: {name}")]
    ToolNameCollision { name: String },

    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("depth {depth} exceeds max depth {max}")]
    DepthExceeded { depth: u32, max: u32 },

    #[error("pass limit of {max} exhausted")]
    PassesExceeded { max: u32 },

    #[error("run deadline exceeded")]
    Timeout,

    #[error("worker terminated")]
    WorkerTerminated,

    #[error("model error: {0}")]
    Model(String),

    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),

    #[error("invalid deck: {path}: {message}")]
    InvalidDeck { path: String, message: String },

    #[error("schema error: {0}")]
    Schema(#[from] crate::schema::SchemaError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Error reconstructed from a bridge crossing. `code` is preserved for
    /// programmatic handling.
    #[error("{message}")]
    Remote {
        name: String,
        message: String,
        code: Option<String>,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn invalid_deck(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidDeck {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn front_matter(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::FrontMatterParse {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Stable kind name, shared with the wire payload.
    pub fn name(&self) -> &'static str {
        match self {
            Self::FrontMatterParse { .. } => "FrontMatterParseError",
            Self::EmbedCycle { .. } => "EmbedCycle",
            Self::ToolNameReserved { .. } => "ToolNameReserved",
            Self::ToolNameInvalid { .. } => "ToolNameInvalid",
            Self::ToolNameCollision { .. } => "ToolNameCollision",
            Self::SchemaMismatch(_) => "SchemaMismatch",
            Self::PermissionDenied(_) => "PermissionDenied",
            Self::DepthExceeded { .. } => "DepthExceeded",
            Self::PassesExceeded { .. } => "PassesExceeded",
            Self::Timeout => "Timeout",
            Self::WorkerTerminated => "WorkerTerminated",
            Self::Model(_) => "ModelError",
            Self::UnsupportedFeature(_) => "UnsupportedFeature",
            Self::InvalidDeck { .. } => "InvalidDeck",
            Self::Schema(_) => "SchemaError",
            Self::Io(_) => "IoError",
            Self::Json(_) => "JsonError",
            Self::Remote { .. } => "RemoteError",
            Self::Internal(_) => "InternalError",
        }
    }

    /// Machine-readable code, when the kind carries one.
    pub fn code(&self) -> Option<String> {
        match self {
            Self::Remote { code, .. } => code.clone(),
            Self::Timeout => Some("timeout".to_string()),
            Self::DepthExceeded { .. } => Some("depth_exceeded".to_string()),
            Self::PassesExceeded { .. } => Some("passes_exceeded".to_string()),
            Self::WorkerTerminated => Some("worker_terminated".to_string()),
            _ => None,
        }
    }

    /// Serialize for a bridge crossing.
    pub fn to_payload(&self, source: impl Into<String>) -> ErrorPayload {
        ErrorPayload {
            source: Some(source.into()),
            name: match self {
                Self::Remote { name, .. } => name.clone(),
                other => other.name().to_string(),
            },
            message: self.to_string(),
            code: self.code(),
        }
    }
}

/// The `{source, name, message, code}` shape every error takes when it
/// crosses the bridge.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub name: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ErrorPayload {
    /// Reconstruct a generic error on the receiving side. The message is
    /// carried verbatim and `code` survives for programmatic handling.
    pub fn into_error(self) -> Error {
        Error::Remote {
            name: self.name,
            message: self.message,
            code: self.code,
        }
    }
}

impl From<ErrorPayload> for Error {
    fn from(payload: ErrorPayload) -> Self {
        payload.into_error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_round_trip_preserves_code() {
        let err = Error::Timeout;
        let payload = err.to_payload("worker");
        assert_eq!(payload.name, "Timeout");
        assert_eq!(payload.source.as_deref(), Some("worker"));

        let back = payload.into_error();
        assert_eq!(back.code().as_deref(), Some("timeout"));
        assert_eq!(back.to_string(), "run deadline exceeded");
    }

    #[test]
    fn remote_error_keeps_original_name() {
        let payload = ErrorPayload {
            source: Some("worker".into()),
            name: "PermissionDenied".into(),
            message: "permission denied: /etc".into(),
            code: None,
        };
        let err: Error = payload.clone().into();
        assert_eq!(err.to_payload("parent").name, "PermissionDenied");
    }
}
