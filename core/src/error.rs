/// Error types for the conversation synchronizer
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Request timed out")]
    Timeout,

    #[error("Unexpected HTTP status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("API error {code}: {message}")]
    Api { code: i64, message: String },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid message: {0}")]
    Validation(String),

    #[error("Synchronizer closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// How a failure is handled by the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Polling path: swallowed, retried on the next tick
    Transient,
    /// User-initiated action: surfaced once, never retried automatically
    UserAction,
    /// Session expired: surfaced once, handed to the session collaborator
    Authorization,
    /// Malformed server data
    Data,
}

impl SyncError {
    /// Network-level failures that a later poll may recover from
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Http(e) => !e.is_decode(),
            SyncError::Timeout => true,
            SyncError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, SyncError::Unauthorized(_))
    }

    /// Classify a failure by the path it happened on
    pub fn classify(&self, user_initiated: bool) -> ErrorClass {
        if self.is_auth() {
            ErrorClass::Authorization
        } else if matches!(self, SyncError::Serialization(_)) && !user_initiated {
            ErrorClass::Data
        } else if user_initiated {
            ErrorClass::UserAction
        } else {
            ErrorClass::Transient
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(SyncError::Timeout.is_transient());
        assert!(SyncError::Status { status: 503, body: String::new() }.is_transient());
        assert!(!SyncError::Status { status: 404, body: String::new() }.is_transient());

        let auth = SyncError::Unauthorized("expired".into());
        assert!(auth.is_auth());
        assert_eq!(auth.classify(false), ErrorClass::Authorization);
        assert_eq!(auth.classify(true), ErrorClass::Authorization);

        assert_eq!(SyncError::Timeout.classify(false), ErrorClass::Transient);
        assert_eq!(SyncError::Timeout.classify(true), ErrorClass::UserAction);

        let bad = serde_json::from_str::<u32>("x").unwrap_err();
        assert_eq!(SyncError::from(bad).classify(false), ErrorClass::Data);
    }
}
