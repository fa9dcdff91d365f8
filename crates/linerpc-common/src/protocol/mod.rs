//! linerpc Protocol Definitions
//!
//! Core protocol types for linerpc: JSON-RPC 2.0 requests, responses and
//! error objects, plus the crate-wide error type.
//!
//! # Error Handling
//!
//! Two layers of errors exist and must not be confused:
//!
//! - [`ErrorObject`] is the *wire-level* JSON-RPC error (code, message,
//!   optional data) that travels inside a [`Response`].
//! - [`error::Error`] is the crate's operational error enum (pool lifecycle,
//!   client lifecycle, I/O), which classifies failures as retryable or
//!   terminal via [`error::Error::is_retryable`].

pub mod error;
pub mod jsonrpc;

pub use error::{Error, Result};
pub use jsonrpc::{
    ErrorObject, Id, Request, Response, INTERNAL_ERROR, INVALID_PARAMS, INVALID_REQUEST,
    JSONRPC_VERSION, METHOD_NOT_FOUND, PARSE_ERROR,
};
