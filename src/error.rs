//! Error classification at the HTTP boundary.

use crate::engine::EngineError;
use crate::storage::StorageError;
use axum::http::StatusCode;
use serde::Serialize;
use std::fmt;

/// Error classes exposed as `errorType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    Timeout,
    Canceled,
    Execution,
    BadData,
    Internal,
    Unavailable,
    NotFound,
    NotAcceptable,
}

impl ErrorType {
    pub fn status_code(self) -> StatusCode {
        match self {
            ErrorType::BadData => StatusCode::BAD_REQUEST,
            ErrorType::Execution => StatusCode::UNPROCESSABLE_ENTITY,
            // Client closed request; not in the registry but widely used.
            ErrorType::Canceled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
            ErrorType::Timeout => StatusCode::SERVICE_UNAVAILABLE,
            ErrorType::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorType::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorType::NotFound => StatusCode::NOT_FOUND,
            ErrorType::NotAcceptable => StatusCode::NOT_ACCEPTABLE,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorType::Timeout => "timeout",
            ErrorType::Canceled => "canceled",
            ErrorType::Execution => "execution",
            ErrorType::BadData => "bad_data",
            ErrorType::Internal => "internal",
            ErrorType::Unavailable => "unavailable",
            ErrorType::NotFound => "not_found",
            ErrorType::NotAcceptable => "not_acceptable",
        }
    }
}

/// A classified error ready to be rendered into the response envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub kind: ErrorType,
    pub message: String,
}

impl ApiError {
    pub fn new(kind: ErrorType, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn bad_data(message: impl Into<String>) -> Self {
        Self::new(ErrorType::BadData, message)
    }

    /// `invalid parameter "<name>": <cause>`
    pub fn invalid_param(cause: impl fmt::Display, param: &str) -> Self {
        Self::bad_data(format!("invalid parameter {:?}: {}", param, cause))
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(ErrorType::Execution, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorType::Internal, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorType::Unavailable, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorType::NotFound, message)
    }

    pub fn not_acceptable(message: impl Into<String>) -> Self {
        Self::new(ErrorType::NotAcceptable, message)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for ApiError {}

/// Storage errors met outside the engine. A not-ready store always reads
/// as unavailable.
impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        let kind = match &err {
            StorageError::NotReady => ErrorType::Unavailable,
            StorageError::Canceled => ErrorType::Canceled,
            StorageError::DeadlineExceeded => ErrorType::Timeout,
            StorageError::Db(_) | StorageError::Other(_) => ErrorType::Execution,
        };
        Self::new(kind, err.to_string())
    }
}

/// Engine errors are classified by variant. Storage failures surfacing
/// through the engine are internal unless the store is not ready.
impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let kind = match &err {
            EngineError::Canceled(_) => ErrorType::Canceled,
            EngineError::Timeout(_) => ErrorType::Timeout,
            EngineError::Storage(StorageError::NotReady) => ErrorType::Unavailable,
            EngineError::Storage(StorageError::Canceled) => ErrorType::Canceled,
            EngineError::Storage(StorageError::DeadlineExceeded) => ErrorType::Timeout,
            EngineError::Storage(_) => ErrorType::Internal,
            EngineError::Parse(_) => ErrorType::BadData,
            EngineError::Execution(_) => ErrorType::Execution,
        };
        Self::new(kind, err.to_string())
    }
}
