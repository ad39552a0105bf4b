use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable, serializable tag for every failure the core can raise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Busy,
    Transport,
    Server,
    Auth,
    RateLimit,
    ModelUnavailable,
    MalformedResponse,
    Cancelled,
    Storage,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Busy => "busy",
            ErrorKind::Transport => "transport",
            ErrorKind::Server => "server",
            ErrorKind::Auth => "auth",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::ModelUnavailable => "model_unavailable",
            ErrorKind::MalformedResponse => "malformed_response",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Storage => "storage",
            ErrorKind::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum ChatError {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("a message is already being sent for this session")]
    Busy,

    #[error("network error: {0}")]
    Transport(String),

    #[error("model provider error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("malformed response from model provider: {0}")]
    MalformedResponse(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("{0}")]
    Unknown(String),
}

pub type Result<T, E = ChatError> = std::result::Result<T, E>;

impl ChatError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound { entity, id: id.to_string() }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn storage(message: impl std::fmt::Display) -> Self {
        Self::Storage(message.to_string())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ChatError::Validation(_) => ErrorKind::Validation,
            ChatError::NotFound { .. } => ErrorKind::NotFound,
            ChatError::Busy => ErrorKind::Busy,
            ChatError::Transport(_) => ErrorKind::Transport,
            ChatError::Server { .. } => ErrorKind::Server,
            ChatError::Auth(_) => ErrorKind::Auth,
            ChatError::RateLimit(_) => ErrorKind::RateLimit,
            ChatError::ModelUnavailable(_) => ErrorKind::ModelUnavailable,
            ChatError::MalformedResponse(_) => ErrorKind::MalformedResponse,
            ChatError::Cancelled => ErrorKind::Cancelled,
            ChatError::Storage(_) => ErrorKind::Storage,
            ChatError::Unknown(_) => ErrorKind::Unknown,
        }
    }

    /// Only these kinds enter the dispatcher's backoff loop.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Transport | ErrorKind::Server | ErrorKind::RateLimit
        )
    }

    /// Text for the inline system-style notice shown after a failed send.
    pub fn notice(&self) -> String {
        format!("Error: {}", self)
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(e: serde_json::Error) -> Self {
        ChatError::Storage(format!("serialization: {e}"))
    }
}

impl From<sqlx::Error> for ChatError {
    fn from(e: sqlx::Error) -> Self {
        ChatError::Storage(e.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for ChatError {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        ChatError::Storage(format!("migration: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_split() {
        assert!(ChatError::Transport("timeout".into()).is_retryable());
        assert!(ChatError::Server { status: 502, message: "bad gateway".into() }.is_retryable());
        assert!(ChatError::RateLimit("slow down".into()).is_retryable());
        assert!(!ChatError::Auth("bad key".into()).is_retryable());
        assert!(!ChatError::Validation("bad".into()).is_retryable());
        assert!(!ChatError::not_found("session", "x").is_retryable());
        assert!(!ChatError::MalformedResponse("no choices".into()).is_retryable());
    }

    #[test]
    fn kind_serializes_snake_case() {
        let v = serde_json::to_value(ErrorKind::MalformedResponse).unwrap();
        assert_eq!(v, "malformed_response");
        assert_eq!(ErrorKind::RateLimit.as_str(), "rate_limit");
    }

    #[test]
    fn notice_prefixes_message() {
        let e = ChatError::Unknown("provider exploded".into());
        assert_eq!(e.notice(), "Error: provider exploded");
    }
}
