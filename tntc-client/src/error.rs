//! Client error types.

use std::sync::Arc;
use thiserror::Error;
use tntc_protocol::{CodecError, ProtocolError, ServerError};

/// Errors that prevent or tear down a session.
///
/// Shared as `Arc<ConnectionError>` so every operation failed by the same
/// event carries the same cause.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("failed to connect to {addr}: {source}")]
    Transient {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("connect to {addr} timed out")]
    Timeout { addr: String },

    #[error("gave up after {attempts} connection attempts")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Option<Arc<ConnectionError>>,
    },

    #[error("authentication failed: {0}")]
    AuthFailed(#[source] ServerError),

    #[error("server closed the connection")]
    EndOfStream,

    #[error("client closed")]
    Closed,

    #[error("invalid address: {0:?}")]
    InvalidAddress(String),

    #[error("address list must not be empty")]
    EmptyAddressList,

    #[error("no tokio runtime: {0}")]
    NoRuntime(String),
}

impl ConnectionError {
    /// Returns whether the connector should try the next attempt.
    ///
    /// Auth rejections are retried too: a server that is still loading
    /// rejects AUTH until recovery finishes. The provider's retries limit
    /// bounds the attempts for credentials that are simply wrong.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConnectionError::Io(_)
                | ConnectionError::Protocol(_)
                | ConnectionError::Codec(_)
                | ConnectionError::Transient { .. }
                | ConnectionError::Timeout { .. }
                | ConnectionError::AuthFailed(_)
                | ConnectionError::EndOfStream
        )
    }
}

/// Errors returned by client operations.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error("communication error: {0}")]
    Communication(#[source] Arc<ConnectionError>),

    #[error("client is closed")]
    Closed,

    #[error("illegal state: {0}")]
    State(&'static str),

    #[error("request queue full ({0} pending)")]
    QueueFull(usize),

    #[error("request timeout")]
    Timeout,

    #[error("space {0:?} not found")]
    SpaceNotFound(String),

    #[error("index {index:?} not found in space {space:?}")]
    IndexNotFound { space: String, index: String },

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl ClientError {
    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Communication(_) => true,
            ClientError::Timeout => true,
            ClientError::QueueFull(_) => true,
            ClientError::Server(err) => err.is_transient(),
            _ => false,
        }
    }

    /// Returns the connection error behind a communication failure.
    pub fn connection_error(&self) -> Option<&Arc<ConnectionError>> {
        match self {
            ClientError::Communication(cause) => Some(cause),
            _ => None,
        }
    }
}
