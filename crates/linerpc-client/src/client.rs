//! The RPC client: call multiplexer over a connection pool.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::value::{to_raw_value, RawValue};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use linerpc_common::{Context, Error, ErrorObject, Id, JsonCodec, Request, Result};

use crate::pool::{ConnPool, PoolConfig, PoolStats};

/// Deadline applied by [`Client::go`] when the caller supplies no context.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Client configuration. Zero-valued fields take their defaults.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Network family: "tcp", "tcp4" or "tcp6"
    pub network: String,
    /// Server address (required)
    pub address: String,
    /// Maximum idle pooled connections (default 10)
    pub max_idle: usize,
    /// Maximum live pooled connections (default 100)
    pub max_active: usize,
    /// Dial timeout (default 5 s)
    pub dial_timeout: Duration,
    /// Retries after the initial attempt (default 3)
    pub max_retries: u32,
    /// Base backoff delay, doubled per attempt (default 100 ms)
    pub retry_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            network: "tcp".to_string(),
            address: String::new(),
            max_idle: 10,
            max_active: 100,
            dial_timeout: Duration::from_secs(5),
            max_retries: 3,
            retry_delay: Duration::from_millis(100),
        }
    }
}

/// One RPC invocation as a record: what was asked, and how it ended.
///
/// Used by [`Client::batch`] and returned from asynchronous calls. At most
/// one of `reply` and `error` is set once the call completed.
#[derive(Debug, Clone)]
pub struct Call {
    /// Qualified "Service.Method" name
    pub method: String,
    /// Argument payload
    pub args: Value,
    /// Result payload, set on success
    pub reply: Option<Value>,
    /// Failure, set when the call did not succeed
    pub error: Option<Error>,
}

impl Call {
    pub fn new(method: impl Into<String>, args: Value) -> Self {
        Self {
            method: method.into(),
            args,
            reply: None,
            error: None,
        }
    }

    /// Decode the reply into a typed record.
    pub fn reply_as<T: DeserializeOwned>(&self) -> Result<T> {
        match &self.reply {
            Some(value) => Ok(serde_json::from_value(value.clone())?),
            None => Err(Error::InvalidInput("call has no reply".into())),
        }
    }
}

/// Completion handle for an asynchronous call.
pub struct CallHandle {
    handle: JoinHandle<Call>,
}

impl CallHandle {
    /// Wait for the background call to finish and take its record.
    pub async fn done(self) -> Call {
        match self.handle.await {
            Ok(call) => call,
            Err(err) => {
                let mut call = Call::new("", Value::Null);
                call.error = Some(Error::Rpc(ErrorObject::internal_error(format!(
                    "call task failed: {err}"
                ))));
                call
            }
        }
    }
}

/// Point-in-time client counters.
#[derive(Debug, Clone)]
pub struct ClientStats {
    pub pending_calls: usize,
    pub pool: PoolStats,
    pub closed: bool,
}

struct PendingEntry {
    #[allow(dead_code)]
    method: String,
    token: CancellationToken,
}

struct ClientInner {
    pool: ConnPool,
    codec: JsonCodec,
    seq: AtomicU64,
    pending: Mutex<HashMap<u64, PendingEntry>>,
    closed: AtomicBool,
    max_retries: u32,
    retry_delay: Duration,
}

/// A JSON-RPC 2.0 client over pooled TCP connections.
///
/// Cheap to clone; clones share the pool, the sequence counter and the
/// pending-call map. Each call leases a connection for a single serial
/// request/response exchange; connections are not multiplexed across
/// concurrent calls.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

impl Client {
    /// Create a client. Fails if the address is missing or the network
    /// family is unsupported.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let defaults = ClientConfig::default();
        let max_idle = if config.max_idle == 0 {
            defaults.max_idle
        } else {
            config.max_idle
        };
        let max_active = if config.max_active == 0 {
            defaults.max_active
        } else {
            config.max_active
        };
        let dial_timeout = if config.dial_timeout.is_zero() {
            defaults.dial_timeout
        } else {
            config.dial_timeout
        };
        let retry_delay = if config.retry_delay.is_zero() {
            defaults.retry_delay
        } else {
            config.retry_delay
        };

        let pool = ConnPool::new(PoolConfig {
            network: config.network,
            address: config.address,
            max_idle,
            max_active,
            dial_timeout,
            test_on_get: true,
            ..Default::default()
        })?;

        Ok(Self {
            inner: Arc::new(ClientInner {
                pool,
                codec: JsonCodec::new(),
                seq: AtomicU64::new(0),
                pending: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
                max_retries: config.max_retries,
                retry_delay,
            }),
        })
    }

    /// Synchronous call: serialize `args`, perform one request/response
    /// exchange (with retry on transient failures) and decode the result.
    ///
    /// The wait is bounded by `ctx`; an already-done context fails before
    /// any request is dispatched.
    pub async fn call<A, R>(&self, ctx: &Context, method: &str, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let params = to_raw_value(args)?;
        let raw = self.call_raw(ctx, method, &params).await?;
        Ok(serde_json::from_str(raw.get())?)
    }

    /// Untyped variant of [`Client::call`] used by batch and asynchronous
    /// calls.
    pub async fn call_value(&self, ctx: &Context, method: &str, args: &Value) -> Result<Value> {
        self.call(ctx, method, args).await
    }

    /// Asynchronous call with the default 30-second deadline.
    ///
    /// The finished [`Call`] is returned through the [`CallHandle`]; when a
    /// `done` sender is supplied (its channel should have capacity for the
    /// completion, or it is dropped) the record is also try-sent there.
    pub fn go(
        &self,
        method: impl Into<String>,
        args: Value,
        done: Option<mpsc::Sender<Call>>,
    ) -> CallHandle {
        let ctx = Context::with_timeout(DEFAULT_CALL_TIMEOUT);
        self.go_with_context(&ctx, method, args, done)
    }

    /// Asynchronous call bounded by a caller-supplied context.
    pub fn go_with_context(
        &self,
        ctx: &Context,
        method: impl Into<String>,
        args: Value,
        done: Option<mpsc::Sender<Call>>,
    ) -> CallHandle {
        let client = self.clone();
        let ctx = ctx.clone();
        let method = method.into();
        let handle = tokio::spawn(async move {
            let mut call = Call::new(method, args);
            let result = client.call_value(&ctx, &call.method, &call.args).await;
            match result {
                Ok(value) => call.reply = Some(value),
                Err(err) => call.error = Some(err),
            }
            if let Some(tx) = done {
                if tx.try_send(call.clone()).is_err() {
                    tracing::warn!(
                        method = %call.method,
                        "done channel full or dropped, discarding completion signal"
                    );
                }
            }
            call
        });
        CallHandle { handle }
    }

    /// Run every call concurrently, record each outcome on its own record,
    /// and return the first error observed (if any).
    pub async fn batch(&self, ctx: &Context, calls: &mut [Call]) -> Result<()> {
        if calls.is_empty() {
            return Ok(());
        }
        if self.is_closed() {
            return Err(Error::ClientClosed);
        }

        let mut handles = Vec::with_capacity(calls.len());
        for call in calls.iter() {
            let client = self.clone();
            let ctx = ctx.clone();
            let method = call.method.clone();
            let args = call.args.clone();
            handles.push(tokio::spawn(async move {
                client.call_value(&ctx, &method, &args).await
            }));
        }

        for (call, handle) in calls.iter_mut().zip(handles) {
            match handle.await {
                Ok(Ok(value)) => call.reply = Some(value),
                Ok(Err(err)) => call.error = Some(err),
                Err(err) => {
                    call.error = Some(Error::Rpc(ErrorObject::internal_error(format!(
                        "call task failed: {err}"
                    ))))
                }
            }
        }

        for call in calls.iter() {
            if let Some(err) = &call.error {
                return Err(err.clone());
            }
        }
        Ok(())
    }

    /// Verify a connection can be leased and returned.
    pub async fn ping(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ClientClosed);
        }
        self.inner.pool.ping().await
    }

    /// Close the client: reject new calls, close the pool and cancel every
    /// pending call (each completes with `ClientClosed`). Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.pool.close();

        let entries: Vec<PendingEntry> = {
            let mut pending = self.inner.pending.lock().expect("pending map lock poisoned");
            pending.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            entry.token.cancel();
        }
    }

    /// Wait for the pending-call map to drain. A zero timeout waits
    /// indefinitely.
    pub async fn wait_for_pending(&self, timeout: Duration) -> Result<()> {
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        loop {
            if self.pending_count() == 0 {
                return Ok(());
            }
            if matches!(deadline, Some(d) if Instant::now() >= d) {
                return Err(Error::Timeout);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Wait up to `timeout` for pending calls, then close either way.
    pub async fn close_gracefully(&self, timeout: Duration) {
        let _ = self.wait_for_pending(timeout).await;
        self.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn pending_count(&self) -> usize {
        self.inner
            .pending
            .lock()
            .expect("pending map lock poisoned")
            .len()
    }

    pub fn stats(&self) -> ClientStats {
        ClientStats {
            pending_calls: self.pending_count(),
            pool: self.inner.pool.stats(),
            closed: self.is_closed(),
        }
    }

    /// Core exchange with retry. Each attempt is a full lease/write/read
    /// cycle with a fresh sequence number.
    async fn call_raw(
        &self,
        ctx: &Context,
        method: &str,
        params: &RawValue,
    ) -> Result<Box<RawValue>> {
        if self.is_closed() {
            return Err(Error::ClientClosed);
        }
        if method.is_empty() {
            return Err(Error::InvalidInput("service method is required".into()));
        }

        let mut last_err = None;
        for attempt in 0..=self.inner.max_retries {
            ctx.check()?;

            match self.attempt(ctx, method, params).await {
                Ok(raw) => return Ok(raw),
                Err(err) => {
                    if !err.is_retryable() {
                        return Err(err);
                    }
                    tracing::debug!(attempt, method, error = %err, "call attempt failed, will retry");
                    last_err = Some(err);
                }
            }

            if attempt < self.inner.max_retries {
                let delay = self.inner.retry_delay * 2u32.pow(attempt);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = ctx.done() => return Err(ctx.error().unwrap_or(Error::Canceled)),
                }
            }
        }

        Err(last_err.unwrap_or(Error::ClientClosed))
    }

    /// One lease/write/read exchange, tracked in the pending map for its
    /// whole duration.
    async fn attempt(
        &self,
        ctx: &Context,
        method: &str,
        params: &RawValue,
    ) -> Result<Box<RawValue>> {
        let seq = self.inner.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let token = CancellationToken::new();
        {
            let mut pending = self.inner.pending.lock().expect("pending map lock poisoned");
            pending.insert(
                seq,
                PendingEntry {
                    method: method.to_string(),
                    token: token.clone(),
                },
            );
        }

        let result = self.exchange(ctx, &token, seq, method, params).await;

        self.inner
            .pending
            .lock()
            .expect("pending map lock poisoned")
            .remove(&seq);
        result
    }

    async fn exchange(
        &self,
        ctx: &Context,
        token: &CancellationToken,
        seq: u64,
        method: &str,
        params: &RawValue,
    ) -> Result<Box<RawValue>> {
        let mut conn = match self.inner.pool.get().await {
            Ok(conn) => conn,
            Err(Error::PoolClosed) => return Err(Error::ClientClosed),
            Err(err @ Error::PoolExhausted) => return Err(err),
            Err(err) => return Err(Error::NoConnection(err.to_string())),
        };

        let req = Request::new(method, Some(params.to_owned()), Id::Number(seq));
        let encoded = match self.inner.codec.encode_request(&req) {
            Ok(data) => data,
            Err(err) => {
                self.inner.pool.put(conn);
                return Err(err);
            }
        };

        if let Err(err) = conn.write_frame(&encoded).await {
            // A partial write poisons the stream for the next exchange.
            self.inner.pool.discard(conn);
            return Err(err);
        }

        let mut buf = Vec::new();
        let read_result: Result<usize> = tokio::select! {
            res = conn.read_frame(&mut buf) => res,
            _ = ctx.done() => Err(ctx.error().unwrap_or(Error::Canceled)),
            _ = token.cancelled() => Err(if self.is_closed() {
                Error::ClientClosed
            } else {
                Error::Canceled
            }),
        };

        let n = match read_result {
            Ok(n) => n,
            Err(err) => {
                self.inner.pool.discard(conn);
                return Err(err);
            }
        };
        if n == 0 {
            self.inner.pool.discard(conn);
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed by server",
            )));
        }

        let resp = match self.inner.codec.decode_response(&buf) {
            Ok(resp) => resp,
            Err(err) => {
                // The frame itself was whole, so the stream is still aligned.
                self.inner.pool.put(conn);
                return Err(err);
            }
        };

        if resp.id != Id::Number(seq) {
            self.inner.pool.discard(conn);
            return Err(Error::IdMismatch {
                expected: seq,
                got: resp.id,
            });
        }

        self.inner.pool.put(conn);

        match resp.error {
            Some(obj) => Err(Error::Rpc(obj)),
            None => resp.result.ok_or_else(|| {
                Error::Rpc(ErrorObject::invalid_request(
                    "response carried neither result nor error",
                ))
            }),
        }
    }
}
