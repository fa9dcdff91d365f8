//! JSON-RPC 2.0 Protocol Types
//!
//! This module implements the JSON-RPC 2.0 message envelope for linerpc.
//!
//! # JSON-RPC 2.0 Compliance
//!
//! - JSON-RPC version: "2.0"
//! - Request format: `{"jsonrpc": "2.0", "method": "...", "params": ..., "id": ...}`
//! - Response format: `{"jsonrpc": "2.0", "result": ..., "error": ..., "id": ...}`
//! - Error format: `{"code": ..., "message": "...", "data": ...}`
//!
//! # Error Codes
//!
//! Standard JSON-RPC 2.0 error codes:
//! - `-32700`: Parse error
//! - `-32600`: Invalid request
//! - `-32601`: Method not found
//! - `-32602`: Invalid params
//! - `-32603`: Internal error
//!
//! # Payloads
//!
//! `params` and `result` are [`RawValue`]s: the envelope is validated
//! without touching the payload, which is parsed into its typed record
//! exactly once, by whoever knows the type.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::Value;

/// The protocol version tag carried by every message.
pub const JSONRPC_VERSION: &str = "2.0";

/// A request identifier.
///
/// JSON-RPC 2.0 allows numbers, strings, or null (null is reserved for
/// notifications, which this runtime does not support). Responses echo the
/// shape that arrived on the wire; the linerpc client only ever emits
/// numbers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Id {
    /// Integer identifier (the client's sequence number)
    Number(u64),
    /// String identifier from a foreign peer
    String(String),
    /// Absent identifier, used on error responses to undecodable requests
    #[default]
    Null,
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Id::Number(n) => write!(f, "{n}"),
            Id::String(s) => write!(f, "\"{s}\""),
            Id::Null => f.write_str("null"),
        }
    }
}

/// JSON-RPC 2.0 request.
///
/// `method` is a qualified `Service.Method` name. `params` stays raw until
/// the registry decodes it into the handler's argument record.
#[derive(Debug, Serialize, Deserialize)]
pub struct Request {
    /// JSON-RPC version (must be "2.0")
    #[serde(default)]
    pub jsonrpc: String,
    /// Qualified name of the method to invoke
    #[serde(default)]
    pub method: String,
    /// Raw parameter payload, decoded lazily
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Box<RawValue>>,
    /// Request identifier
    #[serde(default)]
    pub id: Id,
}

impl Request {
    /// Create a request with the version tag already set.
    pub fn new(method: impl Into<String>, params: Option<Box<RawValue>>, id: Id) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
            id,
        }
    }
}

/// JSON-RPC 2.0 response.
///
/// A well-formed response carries exactly one of `result` and `error`; the
/// codec enforces this on both encode and decode.
#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    /// JSON-RPC version (must be "2.0")
    #[serde(default)]
    pub jsonrpc: String,
    /// Raw result payload on success (None if error is present)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Box<RawValue>>,
    /// Error object on failure (None if result is present)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
    /// Identifier of the request this response answers
    #[serde(default)]
    pub id: Id,
}

impl Response {
    /// Create a success response.
    pub fn success(id: Id, result: Box<RawValue>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    /// Create an error response.
    pub fn error(id: Id, error: ErrorObject) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: None,
            error: Some(error),
            id,
        }
    }
}

// Standard JSON-RPC 2.0 error codes
/// Invalid JSON was received by the server
pub const PARSE_ERROR: i64 = -32700;
/// The JSON sent is not a valid Request object
pub const INVALID_REQUEST: i64 = -32600;
/// The method does not exist / is not available
pub const METHOD_NOT_FOUND: i64 = -32601;
/// Invalid method parameter(s)
pub const INVALID_PARAMS: i64 = -32602;
/// Internal JSON-RPC error
pub const INTERNAL_ERROR: i64 = -32603;

/// JSON-RPC 2.0 error object.
///
/// Standard codes carry their standard messages; the detail that triggered
/// the error goes into `data`. Callers route on `code`, never on the
/// message text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    /// Error code (standard codes are negative integers)
    pub code: i64,
    /// Short description of the error
    pub message: String,
    /// Additional data (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    /// Create an error with an explicit code and message.
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Attach free-form data to the error.
    pub fn with_data(mut self, data: impl Into<Value>) -> Self {
        self.data = Some(data.into());
        self
    }

    /// Create a parse error (-32700).
    pub fn parse_error(detail: impl Into<Value>) -> Self {
        Self::new(PARSE_ERROR, "Parse error").with_data(detail)
    }

    /// Create an invalid request error (-32600).
    pub fn invalid_request(detail: impl Into<Value>) -> Self {
        Self::new(INVALID_REQUEST, "Invalid Request").with_data(detail)
    }

    /// Create a method not found error (-32601).
    pub fn method_not_found(method: impl Into<Value>) -> Self {
        Self::new(METHOD_NOT_FOUND, "Method not found").with_data(method)
    }

    /// Create an invalid params error (-32602).
    pub fn invalid_params(detail: impl Into<Value>) -> Self {
        Self::new(INVALID_PARAMS, "Invalid params").with_data(detail)
    }

    /// Create an internal error (-32603).
    pub fn internal_error(detail: impl Into<Value>) -> Self {
        Self::new(INTERNAL_ERROR, "Internal error").with_data(detail)
    }
}

impl fmt::Display for ErrorObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.data {
            Some(data) => write!(f, "{} ({}): {}", self.message, self.code, data),
            None => write!(f, "{} ({})", self.message, self.code),
        }
    }
}

impl std::error::Error for ErrorObject {}
