// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! This module implements the framework error codes and the contents error.

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use thiserror::Error;

/// Application error codes start here; everything below is reserved.
pub const APPLICATION_ERROR_BASE: u16 = 1000;

#[allow(missing_docs)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u16)]
pub enum ErrorCode {
    Success = 0,
    RequestTimeout = 1,
    ServerNotFound = 2,
    StageNotFound = 3,
    ActorNotFound = 4,
    AuthenticationFailed = 5,
    NotAuthenticated = 6,
    AlreadyAuthenticated = 7,
    StageAlreadyExists = 8,
    StageCreationFailed = 9,
    JoinStageFailed = 10,
    InvalidMessage = 11,
    HandlerNotFound = 12,
    InvalidStageType = 13,
    SystemError = 14,
    UncheckedContentsError = 15,
    InvalidAccountId = 16,
    JoinStageRejected = 17,
    InternalError = 99,
}

impl ErrorCode {
    /// Resolve a wire error code into the framework enum, if it is one.
    pub fn from_u16(value: u16) -> Option<Self> {
        FromPrimitive::from_u16(value)
    }

    /// Whether the code belongs to the framework-reserved range.
    pub fn is_reserved(value: u16) -> bool {
        value < APPLICATION_ERROR_BASE
    }
}

impl From<ErrorCode> for u16 {
    fn from(code: ErrorCode) -> u16 {
        code as u16
    }
}

#[derive(Error, Debug, Clone)]
#[error("{message}")]
/// The error a user handler surfaces instead of raising; the dispatcher turns it
/// into an `error_code` reply when the inbound message was a request.
pub struct ContentsError {
    /// The error code carried back to the requester.
    pub code: u16,
    /// The message string, logged on the handling server.
    pub message: String,
}

impl ContentsError {
    /// Create a contents error from a framework code.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Create a contents error from a raw (application) code.
    pub fn code(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// The result type user handlers return.
pub type ContentsResult<T> = Result<T, ContentsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes_resolve() {
        assert_eq!(ErrorCode::from_u16(0), Some(ErrorCode::Success));
        assert_eq!(ErrorCode::from_u16(1), Some(ErrorCode::RequestTimeout));
        assert_eq!(ErrorCode::from_u16(12), Some(ErrorCode::HandlerNotFound));
        assert_eq!(ErrorCode::from_u16(16), Some(ErrorCode::InvalidAccountId));
        assert_eq!(ErrorCode::from_u16(99), Some(ErrorCode::InternalError));
        assert_eq!(ErrorCode::from_u16(98), None);
    }

    #[test]
    fn application_range() {
        assert!(ErrorCode::is_reserved(99));
        assert!(!ErrorCode::is_reserved(1000));
        let err = ContentsError::code(2000, "room is full");
        assert_eq!(err.code, 2000);
    }
}
