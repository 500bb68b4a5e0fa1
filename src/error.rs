//! Error types for the coordinator core.
//!
//! Infrastructure failures (bad config, unknown query ids, malformed
//! requests) travel as [`CoordError`]. Failures of a *query* are never
//! propagated as errors: they are recorded on the query handle as an
//! [`ExecutionFailure`] and surfaced to clients through the streaming
//! response's `error` field.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoordError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for CoordError {
    fn from(e: serde_json::Error) -> Self {
        CoordError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CoordError>;

/// Broad classification of a query failure, wire-visible as `errorType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    UserError,
    InternalError,
    InsufficientResources,
    External,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::UserError => "USER_ERROR",
            ErrorKind::InternalError => "INTERNAL_ERROR",
            ErrorKind::InsufficientResources => "INSUFFICIENT_RESOURCES",
            ErrorKind::External => "EXTERNAL",
        }
    }
}

/// A (numeric code, symbolic name, kind) triple from the static catalog
/// below. Codes are partitioned by kind: user errors start at 0,
/// internal at 0x0001_0000, resource errors at 0x0002_0000 and external
/// at 0x0100_0000.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorCode {
    pub code: u32,
    pub name: &'static str,
    pub kind: ErrorKind,
}

impl ErrorCode {
    pub const GENERIC_USER_ERROR: ErrorCode = ErrorCode {
        code: 0x0000_0000,
        name: "GENERIC_USER_ERROR",
        kind: ErrorKind::UserError,
    };
    pub const SYNTAX_ERROR: ErrorCode = ErrorCode {
        code: 0x0000_0001,
        name: "SYNTAX_ERROR",
        kind: ErrorKind::UserError,
    };
    pub const ABANDONED_QUERY: ErrorCode = ErrorCode {
        code: 0x0000_0002,
        name: "ABANDONED_QUERY",
        kind: ErrorKind::UserError,
    };
    pub const USER_CANCELED: ErrorCode = ErrorCode {
        code: 0x0000_0003,
        name: "USER_CANCELED",
        kind: ErrorKind::UserError,
    };
    pub const NOT_SUPPORTED: ErrorCode = ErrorCode {
        code: 0x0000_0004,
        name: "NOT_SUPPORTED",
        kind: ErrorKind::UserError,
    };

    pub const GENERIC_INTERNAL_ERROR: ErrorCode = ErrorCode {
        code: 0x0001_0000,
        name: "GENERIC_INTERNAL_ERROR",
        kind: ErrorKind::InternalError,
    };

    pub const QUERY_QUEUE_FULL: ErrorCode = ErrorCode {
        code: 0x0002_0000,
        name: "QUERY_QUEUE_FULL",
        kind: ErrorKind::InsufficientResources,
    };
    pub const EXCEEDED_MEMORY_LIMIT: ErrorCode = ErrorCode {
        code: 0x0002_0001,
        name: "EXCEEDED_MEMORY_LIMIT",
        kind: ErrorKind::InsufficientResources,
    };
    pub const SERVER_SHUTTING_DOWN: ErrorCode = ErrorCode {
        code: 0x0002_0002,
        name: "SERVER_SHUTTING_DOWN",
        kind: ErrorKind::InsufficientResources,
    };

    pub const REMOTE_TASK_ERROR: ErrorCode = ErrorCode {
        code: 0x0100_0000,
        name: "REMOTE_TASK_ERROR",
        kind: ErrorKind::External,
    };
}

/// Position of a failure inside the submitted SQL text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorLocation {
    pub line_number: u32,
    pub column_number: u32,
}

/// The failure recorded on a query handle when it transitions to FAILED.
#[derive(Debug, Clone)]
pub struct ExecutionFailure {
    pub code: ErrorCode,
    pub message: String,
    pub location: Option<ErrorLocation>,
}

impl ExecutionFailure {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            location: None,
        }
    }

    pub fn with_location(mut self, line: u32, column: u32) -> Self {
        self.location = Some(ErrorLocation {
            line_number: line,
            column_number: column,
        });
        self
    }

    pub fn is_user_canceled(&self) -> bool {
        self.code == ErrorCode::USER_CANCELED
    }

    /// Wire form for the streaming response `error` field.
    pub fn to_query_error(&self) -> QueryError {
        QueryError {
            message: self.message.clone(),
            error_code: self.code.code,
            error_name: self.code.name.to_string(),
            error_type: self.code.kind.as_str().to_string(),
            error_location: self.location,
            failure_info: Some(FailureInfo {
                kind: self.code.name.to_string(),
                message: self.message.clone(),
            }),
        }
    }
}

/// Wire-visible error descriptor carried in streaming responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryError {
    pub message: String,
    pub error_code: u32,
    pub error_name: String,
    pub error_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_location: Option<ErrorLocation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_info: Option<FailureInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureInfo {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
}
