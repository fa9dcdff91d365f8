//! linerpc Common Types and Codec
//!
//! This crate provides the protocol definitions, wire codec and shared
//! infrastructure for the linerpc RPC runtime.
//!
//! # Overview
//!
//! linerpc is a bidirectional JSON-RPC 2.0 runtime: a server that dispatches
//! incoming method invocations to registered services, and a client that
//! issues synchronous, asynchronous and batched calls over persistent,
//! pooled TCP connections. This crate contains the pieces both sides share:
//!
//! - **Protocol Layer**: Request/Response/Error types and the JSON-RPC 2.0
//!   error-code constants
//! - **Codec**: JSON encoding/decoding with envelope validation and
//!   newline framing
//! - **Arena**: a bounded pool of reusable scratch buffers backing the
//!   encode path
//! - **Context**: the deadline/cancellation handle accepted by every
//!   blocking operation
//!
//! # Wire Protocol
//!
//! Messages travel over a persistent byte stream, one JSON document per
//! line, each terminated by a single `\n`:
//!
//! ```text
//! {"jsonrpc":"2.0","method":"Service.Method","params":{...},"id":1}\n
//! {"jsonrpc":"2.0","result":{...},"id":1}\n
//! ```
//!
//! Parameter and result payloads are kept as raw JSON
//! ([`serde_json::value::RawValue`]) so the codec never needs to know
//! handler types; the typed decode happens exactly once per call, in the
//! server registry or at the calling site.
//!
//! # Example
//!
//! ```
//! use linerpc_common::protocol::{Request, Id};
//! use linerpc_common::codec::JsonCodec;
//!
//! let codec = JsonCodec::new();
//! let req = Request::new("Echo.Say", None, Id::Number(1));
//! let encoded = codec.encode_request(&req).unwrap();
//! assert_eq!(encoded.last(), Some(&b'\n'));
//! ```

pub mod arena;
pub mod codec;
pub mod context;
pub mod protocol;

pub use codec::JsonCodec;
pub use context::Context;
pub use protocol::error::{Error, Result};
pub use protocol::{ErrorObject, Id, Request, Response, JSONRPC_VERSION};
