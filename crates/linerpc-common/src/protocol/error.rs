//! Operational error type shared across the workspace.

use thiserror::Error;

use super::jsonrpc::ErrorObject;
use crate::protocol::Id;

pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong while operating the runtime.
///
/// Wire-level JSON-RPC failures arrive as [`Error::Rpc`] with their numeric
/// code preserved; the remaining variants describe local lifecycle and I/O
/// failures. [`Error::is_retryable`] is the single retry classification
/// consulted by the client and the pool.
#[derive(Error, Debug)]
pub enum Error {
    /// An error response from the peer, code and all
    #[error("{0}")]
    Rpc(ErrorObject),

    #[error("connection pool is closed")]
    PoolClosed,

    #[error("connection pool exhausted")]
    PoolExhausted,

    #[error("invalid connection")]
    InvalidConn,

    #[error("client is closed")]
    ClientClosed,

    #[error("failed to get connection: {0}")]
    NoConnection(String),

    #[error("request timeout")]
    Timeout,

    #[error("operation canceled")]
    Canceled,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The response on the wire answered a different request
    #[error("response id mismatch: expected {expected}, got {got}")]
    IdMismatch { expected: u64, got: Id },

    #[error("invalid argument: {0}")]
    InvalidInput(String),

    #[error("registration error: {0}")]
    Registration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether the failure is transient and a fresh attempt may succeed.
    ///
    /// Network and connection-acquisition failures are retryable; lifecycle
    /// errors, cancellation and RPC-level error responses are terminal.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Io(_) | Error::NoConnection(_))
    }

    /// The JSON-RPC error code, when this is a wire-level error.
    pub fn rpc_code(&self) -> Option<i64> {
        match self {
            Error::Rpc(obj) => Some(obj.code),
            _ => None,
        }
    }

    /// Convert into the wire-level error object this failure should be
    /// reported as. Non-RPC errors become `Internal`.
    pub fn into_error_object(self) -> ErrorObject {
        match self {
            Error::Rpc(obj) => obj,
            other => ErrorObject::internal_error(other.to_string()),
        }
    }
}

impl From<ErrorObject> for Error {
    fn from(obj: ErrorObject) -> Self {
        Error::Rpc(obj)
    }
}

// Batch calls record an error on the failing call record and also return
// the first one observed, so the type has to be duplicable. `io::Error`
// and `serde_json::Error` are rebuilt from kind/message.
impl Clone for Error {
    fn clone(&self) -> Self {
        match self {
            Error::Rpc(obj) => Error::Rpc(obj.clone()),
            Error::PoolClosed => Error::PoolClosed,
            Error::PoolExhausted => Error::PoolExhausted,
            Error::InvalidConn => Error::InvalidConn,
            Error::ClientClosed => Error::ClientClosed,
            Error::NoConnection(msg) => Error::NoConnection(msg.clone()),
            Error::Timeout => Error::Timeout,
            Error::Canceled => Error::Canceled,
            Error::DeadlineExceeded => Error::DeadlineExceeded,
            Error::IdMismatch { expected, got } => Error::IdMismatch {
                expected: *expected,
                got: got.clone(),
            },
            Error::InvalidInput(msg) => Error::InvalidInput(msg.clone()),
            Error::Registration(msg) => Error::Registration(msg.clone()),
            Error::Io(err) => Error::Io(std::io::Error::new(err.kind(), err.to_string())),
            Error::Json(err) => {
                Error::Json(<serde_json::Error as serde::de::Error>::custom(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_retry_classification() {
        assert!(Error::Io(io::Error::new(io::ErrorKind::ConnectionReset, "reset")).is_retryable());
        assert!(Error::Io(io::Error::new(io::ErrorKind::UnexpectedEof, "eof")).is_retryable());
        assert!(Error::NoConnection("dial failed".into()).is_retryable());

        assert!(!Error::ClientClosed.is_retryable());
        assert!(!Error::PoolClosed.is_retryable());
        assert!(!Error::PoolExhausted.is_retryable());
        assert!(!Error::Canceled.is_retryable());
        assert!(!Error::DeadlineExceeded.is_retryable());
        assert!(!Error::Rpc(ErrorObject::internal_error("boom")).is_retryable());
    }

    #[test]
    fn test_rpc_code_extraction() {
        let err = Error::Rpc(ErrorObject::method_not_found("Svc.M"));
        assert_eq!(err.rpc_code(), Some(-32601));
        assert_eq!(Error::Timeout.rpc_code(), None);
    }

    #[test]
    fn test_clone_preserves_io_kind() {
        let err = Error::Io(io::Error::new(io::ErrorKind::BrokenPipe, "pipe"));
        match err.clone() {
            Error::Io(e) => assert_eq!(e.kind(), io::ErrorKind::BrokenPipe),
            other => panic!("unexpected variant: {other}"),
        }
    }

    #[test]
    fn test_into_error_object() {
        let obj = Error::Rpc(ErrorObject::invalid_params("x")).into_error_object();
        assert_eq!(obj.code, -32602);

        let obj = Error::Timeout.into_error_object();
        assert_eq!(obj.code, -32603);
    }
}
