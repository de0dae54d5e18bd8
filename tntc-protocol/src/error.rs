//! Protocol error types and server error codes.

use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Kinds of length-prefixed values, named in size errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    String,
    Binary,
    Array,
    Map,
    Frame,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Kind::String => write!(f, "string"),
            Kind::Binary => write!(f, "byte string"),
            Kind::Array => write!(f, "array"),
            Kind::Map => write!(f, "map"),
            Kind::Frame => write!(f, "frame"),
        }
    }
}

/// Errors raised while encoding or decoding MsgPack values.
#[derive(Debug, Clone, Error)]
pub enum CodecError {
    #[error("integer {0} is out of the encodable range [-2^63, 2^64-1]")]
    IntegerOutOfRange(i128),

    #[error("{kind} of length {len} is too long to encode")]
    TooLong { kind: Kind, len: usize },

    #[error("deferred value failed to evaluate: {0}")]
    Deferred(#[source] Arc<dyn std::error::Error + Send + Sync>),

    #[error("unexpected end of input: need {needed} bytes, {remaining} remaining")]
    UnexpectedEof { needed: usize, remaining: usize },

    #[error("no more input available when expecting a value")]
    NoMoreInput,

    #[error("{kind} of length {len} is too large for this platform")]
    TooLarge { kind: Kind, len: u32 },

    #[error("nesting deeper than {0} levels")]
    TooDeep(usize),

    #[error("input contains invalid type value {0:#04x}")]
    InvalidType(u8),

    #[error("extension type {0:#04x} is not supported")]
    UnsupportedExtension(u8),

    #[error("invalid UTF-8 in string value")]
    InvalidUtf8,
}

/// Protocol-level errors raised by framing, greeting and auth handling.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("invalid frame marker: expected 0xce, got {0:#04x}")]
    InvalidMarker(u8),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u64, max: u32 },

    #[error("invalid length prefix tag: {0:#04x}")]
    InvalidLengthPrefix(u8),

    #[error("frame {what} must be a map, got {found}")]
    UnexpectedType {
        what: &'static str,
        found: &'static str,
    },

    #[error("frame {what} has a non-integer key: {found}")]
    InvalidKey { what: &'static str, found: String },

    #[error("frame payload has {0} trailing bytes after the body")]
    TrailingBytes(usize),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("welcome message from {addr} does not start with 'Tarantool': {line:?}")]
    BadGreeting { addr: String, line: String },

    #[error("invalid auth salt: {0}")]
    InvalidSalt(String),
}

/// Server error codes.
///
/// Only the codes the client reacts to, or reports specially, are named.
/// Any other non-zero code is carried as [`ErrorCode::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ReadOnly,
    NoSuchIndex,
    NoSuchSpace,
    AccessDenied,
    NoSuchUser,
    PasswordMismatch,
    Timeout,
    WrongSchemaVersion,
    Loading,
    LocalInstanceIdIsReadOnly,
    Other(u32),
}

impl ErrorCode {
    pub fn from_code(code: u32) -> Self {
        match code {
            7 => ErrorCode::ReadOnly,
            35 => ErrorCode::NoSuchIndex,
            36 => ErrorCode::NoSuchSpace,
            42 => ErrorCode::AccessDenied,
            45 => ErrorCode::NoSuchUser,
            47 => ErrorCode::PasswordMismatch,
            78 => ErrorCode::Timeout,
            109 => ErrorCode::WrongSchemaVersion,
            116 => ErrorCode::Loading,
            128 => ErrorCode::LocalInstanceIdIsReadOnly,
            other => ErrorCode::Other(other),
        }
    }

    pub fn code(&self) -> u32 {
        match self {
            ErrorCode::ReadOnly => 7,
            ErrorCode::NoSuchIndex => 35,
            ErrorCode::NoSuchSpace => 36,
            ErrorCode::AccessDenied => 42,
            ErrorCode::NoSuchUser => 45,
            ErrorCode::PasswordMismatch => 47,
            ErrorCode::Timeout => 78,
            ErrorCode::WrongSchemaVersion => 109,
            ErrorCode::Loading => 116,
            ErrorCode::LocalInstanceIdIsReadOnly => 128,
            ErrorCode::Other(code) => *code,
        }
    }

    /// Returns whether the same request may succeed later, possibly on
    /// another instance.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::ReadOnly
                | ErrorCode::Timeout
                | ErrorCode::Loading
                | ErrorCode::LocalInstanceIdIsReadOnly
                | ErrorCode::WrongSchemaVersion
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::ReadOnly => write!(f, "ER_READONLY"),
            ErrorCode::NoSuchIndex => write!(f, "ER_NO_SUCH_INDEX_ID"),
            ErrorCode::NoSuchSpace => write!(f, "ER_NO_SUCH_SPACE"),
            ErrorCode::AccessDenied => write!(f, "ER_ACCESS_DENIED"),
            ErrorCode::NoSuchUser => write!(f, "ER_NO_SUCH_USER"),
            ErrorCode::PasswordMismatch => write!(f, "ER_PASSWORD_MISMATCH"),
            ErrorCode::Timeout => write!(f, "ER_TIMEOUT"),
            ErrorCode::WrongSchemaVersion => write!(f, "ER_WRONG_SCHEMA_VERSION"),
            ErrorCode::Loading => write!(f, "ER_LOADING"),
            ErrorCode::LocalInstanceIdIsReadOnly => write!(f, "ER_LOCAL_INSTANCE_ID_IS_READ_ONLY"),
            ErrorCode::Other(code) => write!(f, "ER_{}", code),
        }
    }
}

/// An error response returned by the server for one request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("server error {code} ({}): {message}", .code.code())]
pub struct ServerError {
    pub code: ErrorCode,
    pub message: String,
}

impl ServerError {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::from_code(code),
            message: message.into(),
        }
    }

    /// Returns whether the error reports a stale schema on the client side.
    pub fn is_wrong_schema(&self) -> bool {
        self.code == ErrorCode::WrongSchemaVersion
    }

    /// Returns whether retrying the request may succeed.
    pub fn is_transient(&self) -> bool {
        self.code.is_retryable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        for code in [7, 35, 36, 42, 45, 47, 78, 109, 116, 128] {
            let parsed = ErrorCode::from_code(code);
            assert!(!matches!(parsed, ErrorCode::Other(_)), "code {code}");
            assert_eq!(parsed.code(), code);
        }
        assert_eq!(ErrorCode::from_code(9999), ErrorCode::Other(9999));
        assert_eq!(ErrorCode::Other(9999).code(), 9999);
    }

    #[test]
    fn test_error_code_retryable() {
        assert!(ErrorCode::ReadOnly.is_retryable());
        assert!(ErrorCode::Timeout.is_retryable());
        assert!(ErrorCode::Loading.is_retryable());
        assert!(ErrorCode::LocalInstanceIdIsReadOnly.is_retryable());

        assert!(!ErrorCode::NoSuchSpace.is_retryable());
        assert!(!ErrorCode::AccessDenied.is_retryable());
        assert!(!ErrorCode::Other(1).is_retryable());
    }

    #[test]
    fn test_error_code_display() {
        assert_eq!(format!("{}", ErrorCode::ReadOnly), "ER_READONLY");
        assert_eq!(
            format!("{}", ErrorCode::WrongSchemaVersion),
            "ER_WRONG_SCHEMA_VERSION"
        );
        assert_eq!(format!("{}", ErrorCode::Other(300)), "ER_300");
    }

    #[test]
    fn test_server_error_display() {
        let err = ServerError::new(109, "Wrong schema version, current: 81, in request: 80");
        assert!(err.is_wrong_schema());
        assert!(err.is_transient());
        assert!(!ServerError::new(36, "no space").is_transient());
        let msg = err.to_string();
        assert!(msg.contains("ER_WRONG_SCHEMA_VERSION"));
        assert!(msg.contains("109"));
        assert!(msg.contains("current: 81"));
    }

    #[test]
    fn test_codec_error_display() {
        let err = CodecError::TooLarge {
            kind: Kind::Array,
            len: 0xFF00_0000,
        };
        assert_eq!(
            err.to_string(),
            "array of length 4278190080 is too large for this platform"
        );

        let err = CodecError::InvalidType(0xC1);
        assert!(err.to_string().contains("0xc1"));

        assert_eq!(
            CodecError::NoMoreInput.to_string(),
            "no more input available when expecting a value"
        );
    }

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::BadGreeting {
            addr: "10.0.0.1:3301".to_string(),
            line: "SSH-2.0-OpenSSH".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("10.0.0.1:3301"));
        assert!(msg.contains("SSH-2.0-OpenSSH"));

        let err = ProtocolError::InvalidMarker(0x01);
        assert!(err.to_string().contains("0x01"));

        let err = ProtocolError::UnexpectedType {
            what: "header",
            found: "array",
        };
        assert_eq!(err.to_string(), "frame header must be a map, got array");
    }
}
