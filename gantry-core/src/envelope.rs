//! Request-surface response envelope
//!
//! The HTTP layer in front of the coordinator is an external collaborator,
//! but the envelope it returns is part of this crate's contract: every reply
//! carries `{httpStatus, errorCode, errorMessage}`. Error codes are stable
//! numbers; clients are expected to switch on `errorCode`, not on message
//! text.

use serde::{Deserialize, Serialize};

/// Stable error categories surfaced to the request surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorCode {
    Ok,
    InvalidRequest,
    InvalidData,
    NotFound,
    ServerError,
}

impl ErrorCode {
    /// The stable numeric code. Never renumber these.
    pub const fn code(self) -> u16 {
        match self {
            ErrorCode::Ok => 0,
            ErrorCode::InvalidRequest => 1,
            ErrorCode::InvalidData => 2,
            ErrorCode::NotFound => 3,
            ErrorCode::ServerError => 4,
        }
    }

    /// The HTTP status the request surface maps this code to.
    pub const fn http_status(self) -> u16 {
        match self {
            ErrorCode::Ok => 200,
            ErrorCode::InvalidRequest => 400,
            ErrorCode::InvalidData => 422,
            ErrorCode::NotFound => 404,
            ErrorCode::ServerError => 500,
        }
    }
}

/// Success/error envelope returned by the request surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    pub http_status: u16,
    pub error_code: u16,
    pub error_message: String,
}

impl ResponseEnvelope {
    pub fn ok() -> Self {
        Self {
            http_status: ErrorCode::Ok.http_status(),
            error_code: ErrorCode::Ok.code(),
            error_message: String::new(),
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            http_status: code.http_status(),
            error_code: code.code(),
            error_message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error_code == ErrorCode::Ok.code()
    }
}
