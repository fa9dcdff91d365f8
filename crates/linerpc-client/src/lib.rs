//! linerpc Client
//!
//! A JSON-RPC 2.0 client over persistent, pooled TCP connections.
//!
//! # Overview
//!
//! The client composes a bounded [`pool::ConnPool`] with the shared codec
//! and a call tracker that multiplexes sequence numbers onto pending calls.
//! Calls come in three shapes:
//!
//! - [`Client::call`]: synchronous, blocks the caller until the reply
//!   arrives or the [`Context`](linerpc_common::Context) is done
//! - [`Client::go`] / [`Client::go_with_context`]: asynchronous, runs on a
//!   background task and hands back a [`client::CallHandle`]
//! - [`Client::batch`]: concurrent fan-out over a slice of
//!   [`client::Call`] records
//!
//! Transient failures (I/O, EOF, no connection) are retried with
//! exponential backoff; cancellation, client shutdown, pool exhaustion and
//! RPC-level error responses are terminal.
//!
//! # Connection discipline
//!
//! A connection is leased for exactly one request/response exchange and is
//! strictly serial: the next request is never written before the previous
//! response was read. A connection that saw any read or write failure is
//! destroyed rather than returned, since a partial write leaves the stream
//! unusable.
//!
//! # Example
//!
//! ```no_run
//! use linerpc_client::{Client, ClientConfig};
//! use linerpc_common::Context;
//! use serde_json::json;
//!
//! # async fn run() -> linerpc_common::Result<()> {
//! let client = Client::new(ClientConfig {
//!     address: "127.0.0.1:4580".into(),
//!     ..Default::default()
//! })?;
//!
//! let ctx = Context::with_timeout(std::time::Duration::from_secs(5));
//! let reply: serde_json::Value = client
//!     .call(&ctx, "Calculator.Add", &json!({"a": 10, "b": 20}))
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod conn;
pub mod pool;

pub use client::{Call, CallHandle, Client, ClientConfig, ClientStats};
pub use conn::PooledConn;
pub use pool::{ConnPool, PoolConfig, PoolStats, SweeperHandle};
