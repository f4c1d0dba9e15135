use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::io;

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Unprocessable(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, msg) = match &self {
            AppError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone()),
            AppError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
            AppError::Conflict(m) => (StatusCode::CONFLICT, m.clone()),
            AppError::Unprocessable(m) => (StatusCode::UNPROCESSABLE_ENTITY, m.clone()),
            AppError::Internal(e) => {
                tracing::error!("Internal error: {e:#}");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".into())
            }
        };
        (status, Json(json!({ "error": msg }))).into_response()
    }
}

impl From<InvalidScheduleError> for AppError {
    fn from(e: InvalidScheduleError) -> Self {
        AppError::Unprocessable(e.to_string())
    }
}

impl From<CatalogError> for AppError {
    fn from(e: CatalogError) -> Self {
        match e {
            CatalogError::InvalidSchedule(e) => e.into(),
            CatalogError::HostNotFound(id) => AppError::NotFound(format!("Host {id} not found")),
            CatalogError::TaskNotFound(id) => AppError::NotFound(format!("Backup {id} not found")),
            CatalogError::NotFound(m) => AppError::NotFound(m),
            CatalogError::Conflict(m) => AppError::Conflict(m),
            CatalogError::Invalid(m) => AppError::BadRequest(m),
            CatalogError::Store(e) => AppError::Internal(e),
        }
    }
}

/// Rejected at task creation; a schedule that fails here never reaches execution.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid schedule {expression:?}: {reason}")]
pub struct InvalidScheduleError {
    pub expression: String,
    pub reason: String,
}

#[derive(thiserror::Error, Debug)]
pub enum CatalogError {
    #[error(transparent)]
    InvalidSchedule(#[from] InvalidScheduleError),

    #[error("host {0} not found")]
    HostNotFound(String),

    #[error("backup task {0} not found")]
    TaskNotFound(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Invalid(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum TransferError {
    #[error("host unreachable: {0}")]
    Unreachable(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("source path not found: {0}")]
    PathNotFound(String),

    #[error("rsync failed (code {code}): {message}")]
    Rsync { code: i32, message: String },

    #[error("remote command refused: {0}")]
    CommandRefused(String),

    #[error("ssh error: {0}")]
    Ssh(String),

    #[error("transfer I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum HookError {
    #[error("invalid hook name {0:?}")]
    InvalidName(String),

    #[error("hook script not found: {0}")]
    NotFound(String),

    #[error("hook {name} failed ({status}): {output}")]
    Failed {
        name: String,
        status: String,
        output: String,
    },

    #[error("hook {name} could not be started: {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },
}

#[derive(thiserror::Error, Debug)]
pub enum CryptoError {
    #[error("encryption key not configured")]
    MissingKey,

    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Tag mismatch, wrong key, truncated or malformed ciphertext.
    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl CryptoError {
    pub fn is_authentication_failure(&self) -> bool {
        matches!(self, CryptoError::Decryption(_))
    }
}

#[derive(thiserror::Error, Debug)]
#[error("failed to prune version {version}: {source}")]
pub struct RetentionPruneError {
    pub version: String,
    #[source]
    pub source: io::Error,
}

/// A required step of a backup run failed.
#[derive(thiserror::Error, Debug)]
pub enum RunError {
    #[error("Pre-backup hooks failed: {0}")]
    PreHook(#[source] HookError),

    #[error("Failed to prepare destination: {0}")]
    Prepare(#[source] io::Error),

    #[error("Transfer failed: {0}")]
    Transfer(#[source] TransferError),

    #[error("Encryption failed: {0}")]
    Encryption(#[source] CryptoError),

    #[error("Failed to update latest version: {0}")]
    Versioning(#[source] io::Error),
}

/// A restore could not produce or deliver the selected content.
#[derive(thiserror::Error, Debug)]
pub enum RestoreError {
    #[error("no backup available to restore")]
    NothingToRestore,

    #[error("version {0} not found")]
    UnknownVersion(String),

    #[error("path {0} not found in backup")]
    PathNotFound(String),

    #[error("Decryption failed: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Restore transfer failed: {0}")]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl RunError {
    pub fn is_transfer(&self) -> bool {
        matches!(self, RunError::Transfer(_))
    }
}
