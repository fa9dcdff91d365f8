//! Accept loop and per-connection request/response cycle.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use linerpc_common::codec::read_frame;
use linerpc_common::{Context, Error, ErrorObject, Id, JsonCodec, Response, Result};

use crate::registry::{Service, ServiceRegistry};
use crate::worker::WorkerPool;

/// Buffer size for each direction of an accepted connection.
const STREAM_BUF_SIZE: usize = 32 * 1024;

/// Idle deadline for reading the next request on a connection.
const READ_TIMEOUT: Duration = Duration::from_secs(300);

/// Deadline for writing one response.
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

struct ServerInner {
    registry: ServiceRegistry,
    workers: WorkerPool,
    codec: JsonCodec,
    shutdown: AtomicBool,
    serving: AtomicBool,
    shutdown_token: CancellationToken,
    tracker: TaskTracker,
    local_addr: Mutex<Option<SocketAddr>>,
}

/// A JSON-RPC 2.0 server over newline-framed TCP.
///
/// Connections are handled by a bounded worker pool; within one connection
/// requests are strictly serial (read, dispatch, write, repeat) and the
/// connection stays open across exchanges.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Create a server with `workers` connection handlers (0 coerces to
    /// 100). The task queue holds twice the worker count.
    pub fn new(workers: usize) -> Self {
        let workers = if workers == 0 { 100 } else { workers };
        Self {
            inner: Arc::new(ServerInner {
                registry: ServiceRegistry::new(),
                workers: WorkerPool::new(workers, workers * 2),
                codec: JsonCodec::new(),
                shutdown: AtomicBool::new(false),
                serving: AtomicBool::new(false),
                shutdown_token: CancellationToken::new(),
                tracker: TaskTracker::new(),
                local_addr: Mutex::new(None),
            }),
        }
    }

    /// Register a service under its declared name.
    pub fn register(&self, service: Service) -> Result<()> {
        self.inner.registry.register(service)
    }

    /// Register a service under an explicit name.
    pub fn register_named(&self, name: impl Into<String>, service: Service) -> Result<()> {
        self.inner.registry.register_named(name, service)
    }

    /// Listen on `address` and serve until shutdown. Blocks the calling
    /// task. `network` must be "tcp", "tcp4" or "tcp6".
    pub async fn serve(&self, network: &str, address: &str) -> Result<()> {
        if !matches!(network, "tcp" | "tcp4" | "tcp6") {
            return Err(Error::InvalidInput(format!(
                "unsupported network: {network}"
            )));
        }
        if self.inner.serving.swap(true, Ordering::SeqCst) {
            return Err(Error::InvalidInput("server is already running".into()));
        }

        let listener = TcpListener::bind(address).await?;
        *self
            .inner
            .local_addr
            .lock()
            .expect("local addr lock poisoned") = listener.local_addr().ok();
        tracing::info!(address, "server listening");

        loop {
            tokio::select! {
                _ = self.inner.shutdown_token.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tracing::debug!(%peer, "accepted connection");
                        let inner = Arc::clone(&self.inner);
                        let task = self
                            .inner
                            .tracker
                            .track_future(async move { handle_conn(inner, stream).await });
                        if self.inner.workers.submit(task).await.is_err() {
                            // Worker pool closed: drop the connection and
                            // stop accepting.
                            break;
                        }
                    }
                    Err(err) => {
                        if self.is_shutdown() {
                            break;
                        }
                        tracing::error!(error = %err, "accept failed");
                        continue;
                    }
                }
            }
        }

        // Dropping the listener here is what makes new dials fail fast
        // after shutdown.
        Ok(())
    }

    /// Graceful shutdown: stop accepting, wait up to `timeout` for
    /// in-flight connection handlers, then close the worker pool.
    /// Idempotent; returns `Timeout` if in-flight work outlived the bound.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.shutdown_token.cancel();
        self.inner.tracker.close();

        let drained = tokio::time::timeout(timeout, self.inner.tracker.wait())
            .await
            .is_ok();
        self.inner.workers.close().await;

        if drained {
            Ok(())
        } else {
            Err(Error::Timeout)
        }
    }

    /// Immediate shutdown: stop accepting and close the worker pool
    /// without waiting for connection handlers. Idempotent.
    pub async fn close(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.shutdown_token.cancel();
        self.inner.tracker.close();
        self.inner.workers.close().await;
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }

    /// Names of the registered services, for diagnostics.
    pub fn services(&self) -> Vec<String> {
        self.inner.registry.list_services()
    }

    /// The bound address once [`Server::serve`] is listening.
    pub fn addr(&self) -> Option<SocketAddr> {
        *self
            .inner
            .local_addr
            .lock()
            .expect("local addr lock poisoned")
    }
}

/// Per-connection loop: read one framed request, process, write the reply,
/// repeat until EOF, error, idle timeout or shutdown.
async fn handle_conn(inner: Arc<ServerInner>, stream: TcpStream) {
    let peer = stream.peer_addr().ok();
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::with_capacity(STREAM_BUF_SIZE, read_half);
    let mut writer = BufWriter::with_capacity(STREAM_BUF_SIZE, write_half);
    let mut buf = Vec::new();

    loop {
        if inner.shutdown.load(Ordering::SeqCst) {
            break;
        }

        // Shutdown interrupts the wait for the *next* request; a request
        // already being processed still gets its reply.
        let n = tokio::select! {
            read = tokio::time::timeout(READ_TIMEOUT, read_frame(&mut reader, &mut buf)) => {
                match read {
                    Ok(Ok(n)) => n,
                    Ok(Err(err)) => {
                        tracing::debug!(?peer, error = %err, "read failed");
                        break;
                    }
                    Err(_) => {
                        tracing::debug!(?peer, "idle connection timed out");
                        break;
                    }
                }
            }
            _ = inner.shutdown_token.cancelled() => break,
        };
        if n == 0 {
            // Clean EOF from the peer.
            break;
        }

        let reply = process_request(&inner, &buf[..n]).await;

        let write = async {
            writer.write_all(&reply).await?;
            writer.flush().await
        };
        match tokio::time::timeout(WRITE_TIMEOUT, write).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::debug!(?peer, error = %err, "write failed");
                break;
            }
            Err(_) => {
                tracing::debug!(?peer, "write timed out");
                break;
            }
        }
    }
}

/// Decode, dispatch and encode one request. Every failure mode turns into
/// an encoded error response; this function never fails upward.
async fn process_request(inner: &ServerInner, data: &[u8]) -> Vec<u8> {
    let req = match inner.codec.decode_request(data) {
        Ok(req) => req,
        Err(err) => {
            // Undecodable request: no identifier to echo.
            return encode_error_response(&inner.codec, Id::Null, err.into_error_object());
        }
    };

    let Some((service, method)) = split_method(&req.method) else {
        return encode_error_response(
            &inner.codec,
            req.id.clone(),
            ErrorObject::method_not_found(req.method.clone()),
        );
    };

    let ctx = Context::background();
    match inner.registry.call(ctx, service, method, req.params).await {
        Ok(result) => {
            let resp = Response::success(req.id, result);
            match inner.codec.encode_response(&resp) {
                Ok(data) => data,
                Err(err) => {
                    encode_error_response(&inner.codec, resp.id, err.into_error_object())
                }
            }
        }
        Err(obj) => encode_error_response(&inner.codec, req.id, obj),
    }
}

fn encode_error_response(codec: &JsonCodec, id: Id, obj: ErrorObject) -> Vec<u8> {
    let resp = Response::error(id, obj);
    match codec.encode_response(&resp) {
        Ok(data) => data,
        Err(err) => {
            // Last resort when even the error response will not encode.
            tracing::error!(error = %err, "failed to encode error response");
            let id = serde_json::to_string(&resp.id).unwrap_or_else(|_| "null".to_string());
            format!(
                "{{\"jsonrpc\":\"2.0\",\"error\":{{\"code\":-32603,\"message\":\"Internal error\"}},\"id\":{id}}}\n"
            )
            .into_bytes()
        }
    }
}

/// Split a qualified method name at the first `.` into (service, method).
fn split_method(method: &str) -> Option<(&str, &str)> {
    let dot = method.find('.')?;
    if dot == 0 || dot == method.len() - 1 {
        return None;
    }
    Some((&method[..dot], &method[dot + 1..]))
}
