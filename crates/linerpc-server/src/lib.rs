//! linerpc Server
//!
//! A JSON-RPC 2.0 server over newline-framed TCP.
//!
//! # Overview
//!
//! The server composes three pieces:
//!
//! - [`registry::ServiceRegistry`] maps `Service.Method` names to typed
//!   handlers built with [`registry::Service`]
//! - [`worker::WorkerPool`] bounds how many connections are handled
//!   concurrently and gives shutdown a quiescence point
//! - [`server::Server`] runs the accept loop and per-connection
//!   request/response cycle
//!
//! # Defining a service
//!
//! Services are descriptor tables built explicitly; the typed decode of
//! argument records happens inside the generated wrapper, so a handler is
//! just an async function from its argument record to its reply record:
//!
//! ```
//! use linerpc_server::Service;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Deserialize, Default)]
//! struct AddArgs { a: i64, b: i64 }
//!
//! #[derive(Serialize)]
//! struct AddReply { result: i64 }
//!
//! let service = Service::new("Calculator")
//!     .method("Add", |_ctx, args: AddArgs| async move {
//!         Ok(AddReply { result: args.a + args.b })
//!     });
//! ```
//!
//! # Running
//!
//! ```no_run
//! # use linerpc_server::{Server, Service};
//! # async fn run(service: Service) -> linerpc_common::Result<()> {
//! let server = Server::new(100);
//! server.register(service)?;
//! server.serve("tcp", "127.0.0.1:4580").await?;
//! # Ok(())
//! # }
//! ```

pub mod registry;
pub mod server;
pub mod worker;

pub use registry::{Service, ServiceRegistry};
pub use server::Server;
pub use worker::WorkerPool;
