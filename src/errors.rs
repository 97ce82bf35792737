use crate::models::Table;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure half of every remote call: the server's `{errorCode, message}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(rename_all = "camelCase")]
#[error("{code}: {message}")]
pub struct RemoteError {
    #[serde(rename = "errorCode")]
    pub code: String,
    pub message: String,
}

impl RemoteError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("NOT_AUTHENTICATED: {0}")]
    NotAuthenticated(String),
    #[error("FORBIDDEN: {0}")]
    Forbidden(String),
    #[error("REMOTE_ERROR: {0}")]
    Remote(RemoteError),
    #[error("SYNC_NON_CONVERGENCE: watermark for {0} did not advance")]
    SyncNonConvergence(Table),
    #[error("POLICY_DENIED: {0}")]
    Policy(String),
    #[error("STORE_UNAVAILABLE: {0}")]
    StoreUnavailable(String),
    #[error("IO_FAILURE: {0}")]
    Io(String),
    #[error("NOT_FOUND: {0}")]
    NotFound(String),
    #[error("INTERNAL: {0}")]
    Internal(String),
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(value: rusqlite::Error) -> Self {
        match value.sqlite_error_code() {
            Some(
                rusqlite::ErrorCode::DatabaseBusy
                | rusqlite::ErrorCode::DatabaseLocked
                | rusqlite::ErrorCode::CannotOpen
                | rusqlite::ErrorCode::NotADatabase,
            ) => Self::StoreUnavailable(value.to_string()),
            _ => Self::Internal(value.to_string()),
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<RemoteError> for AppError {
    fn from(value: RemoteError) -> Self {
        Self::Remote(value)
    }
}

pub type AppResult<T> = Result<T, AppError>;
pub type RemoteResult<T> = Result<T, RemoteError>;

#[cfg(test)]
mod tests {
    use super::{AppError, RemoteError};
    use crate::models::Table;

    #[test]
    fn display_carries_stable_code_prefix() {
        let remote = AppError::from(RemoteError::new("DEVICE_OFFLINE", "device is offline"));
        assert_eq!(remote.to_string(), "REMOTE_ERROR: DEVICE_OFFLINE: device is offline");

        let stalled = AppError::SyncNonConvergence(Table::WorkflowReactions);
        assert!(stalled.to_string().starts_with("SYNC_NON_CONVERGENCE"));
        assert!(stalled.to_string().contains("workflow_reactions"));
    }

    #[test]
    fn remote_error_uses_wire_field_names() {
        let parsed: RemoteError =
            serde_json::from_str(r#"{"errorCode":"E42","message":"nope"}"#).expect("parse");
        assert_eq!(parsed, RemoteError::new("E42", "nope"));
    }
}
