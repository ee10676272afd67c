#[macro_use]
mod macros;

mod collection;
mod content;
mod edge;
mod event;
mod plugin;
mod request;
mod tools;

pub use collection::*;
pub use content::*;
pub use edge::*;
pub use event::*;
pub use plugin::*;
pub use request::*;
pub use tools::*;

use reqwest::StatusCode;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EssError {
    #[error("internal error: {0}")]
    Internal(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("connection error: {0}")]
    ConnectionError(String),
    #[error("no suitable candidate: {0}")]
    NoSuitableCandidate(String),
    #[error("plugin unavailable: {0}")]
    PluginUnavailable(String),
    #[error("plugin execution failed: {0}")]
    PluginExecution(String),
    #[error("no requested data: {0}")]
    NoRequestedData(String),
    #[error("invalid param: {0}")]
    InvalidParam(String),
    #[error("invalid state transition: {0}")]
    InvalidStateTransition(String),
    #[error("db error: {0}")]
    DbError(String),
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("decode error: {0}")]
    DecodeError(String),
    #[error("remote error: {0}")]
    RemoteError(String),
}

impl EssError {
    pub fn from_http_status(code: StatusCode, info: String) -> Self {
        match code {
            StatusCode::NOT_FOUND => EssError::NotFound(info),
            StatusCode::CONFLICT => EssError::AlreadyExists(info),
            StatusCode::BAD_REQUEST => EssError::InvalidParam(info),
            StatusCode::INTERNAL_SERVER_ERROR => EssError::Internal(info),
            _ => EssError::RemoteError(format!("HTTP error: {} for {}", code, info)),
        }
    }

    /// Status code a Head service answers with for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            EssError::NotFound(_) => StatusCode::NOT_FOUND,
            EssError::AlreadyExists(_) => StatusCode::CONFLICT,
            EssError::InvalidParam(_)
            | EssError::InvalidStateTransition(_)
            | EssError::DecodeError(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, EssError::NotFound(_))
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, EssError::AlreadyExists(_))
    }

    pub fn is_connection_error(&self) -> bool {
        matches!(self, EssError::ConnectionError(_))
    }

    /// Errors raised by a plugin while executing a task.
    pub fn is_plugin_error(&self) -> bool {
        matches!(
            self,
            EssError::PluginExecution(_) | EssError::NoRequestedData(_)
        )
    }
}

pub type EssResult<T> = std::result::Result<T, EssError>;

impl From<std::io::Error> for EssError {
    fn from(err: std::io::Error) -> Self {
        EssError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for EssError {
    fn from(err: serde_json::Error) -> Self {
        EssError::DecodeError(err.to_string())
    }
}

impl From<reqwest::Error> for EssError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            EssError::ConnectionError(err.to_string())
        } else if let Some(status) = err.status() {
            EssError::from_http_status(status, err.to_string())
        } else if err.is_decode() {
            EssError::DecodeError(err.to_string())
        } else {
            EssError::RemoteError(err.to_string())
        }
    }
}
