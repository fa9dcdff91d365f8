//! Bounded TCP connection pool with health checking and retry.
//!
//! The pool owns every connection it ever dialed. Callers lease one with
//! [`ConnPool::get`], use it for exactly one request/response exchange and
//! either return it ([`ConnPool::put`]) or destroy it
//! ([`ConnPool::discard`]) if the exchange failed.
//!
//! The active counter tracks every live connection, leased or idle; it is
//! incremented when a dial succeeds and decremented when a connection is
//! destroyed. The idle set is a FIFO bounded by `max_idle`; returns never
//! block, they drop the connection instead.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use linerpc_common::{Error, Result};

use crate::conn::PooledConn;

/// Connection factory. Replaceable for tests or custom transports.
pub type DialFn = Arc<dyn Fn() -> BoxFuture<'static, io::Result<TcpStream>> + Send + Sync>;

/// Health probe consulted on acquire (when enabled) and by the sweeper.
pub type TestFn = Arc<dyn Fn(&PooledConn) -> bool + Send + Sync>;

/// Connection pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Network family: "tcp", "tcp4" or "tcp6"
    pub network: String,
    /// Server address, e.g. "127.0.0.1:4580" (required)
    pub address: String,
    /// Maximum idle connections retained (0 picks the default of 10)
    pub max_idle: usize,
    /// Maximum live connections (0 = unbounded)
    pub max_active: usize,
    /// Timeout for a single dial (0 picks the default of 5 s)
    pub dial_timeout: Duration,
    /// Idle connections older than this are destroyed by the sweeper
    /// (0 picks the default of 5 min)
    pub idle_timeout: Duration,
    /// Run the health probe on every acquire from the idle set
    pub test_on_get: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            network: "tcp".to_string(),
            address: String::new(),
            max_idle: 10,
            max_active: 0,
            dial_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(300),
            test_on_get: false,
        }
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    /// Live connections, leased or idle
    pub active: i64,
    /// Connections currently in the idle set
    pub idle: usize,
    pub closed: bool,
}

struct IdleEntry {
    conn: PooledConn,
    since: Instant,
}

/// A pool of reusable TCP connections to a single address.
pub struct ConnPool {
    max_idle: usize,
    max_active: usize,
    dial_timeout: Duration,
    idle_timeout: Duration,
    test_on_get: bool,

    idle: Mutex<VecDeque<IdleEntry>>,
    active: AtomicI64,
    closed: AtomicBool,

    dial: Mutex<DialFn>,
    test: Mutex<TestFn>,
}

impl std::fmt::Debug for ConnPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnPool").finish_non_exhaustive()
    }
}

impl ConnPool {
    /// Create a pool. Fails on a missing address or an unsupported network
    /// family; zero-valued limits and timeouts take their defaults.
    pub fn new(config: PoolConfig) -> Result<Self> {
        if config.address.is_empty() {
            return Err(Error::InvalidInput("address is required".into()));
        }
        let network = if config.network.is_empty() {
            "tcp".to_string()
        } else {
            config.network
        };
        if !matches!(network.as_str(), "tcp" | "tcp4" | "tcp6") {
            return Err(Error::InvalidInput(format!(
                "unsupported network: {network}"
            )));
        }

        let defaults = PoolConfig::default();
        let max_idle = if config.max_idle == 0 {
            defaults.max_idle
        } else {
            config.max_idle
        };
        let dial_timeout = if config.dial_timeout.is_zero() {
            defaults.dial_timeout
        } else {
            config.dial_timeout
        };
        let idle_timeout = if config.idle_timeout.is_zero() {
            defaults.idle_timeout
        } else {
            config.idle_timeout
        };

        let address = config.address;
        let dial: DialFn = Arc::new(move || {
            let address = address.clone();
            Box::pin(async move { TcpStream::connect(&address).await })
        });
        let test: TestFn = Arc::new(|conn: &PooledConn| conn.is_healthy());

        Ok(Self {
            max_idle,
            max_active: config.max_active,
            dial_timeout,
            idle_timeout,
            test_on_get: config.test_on_get,
            idle: Mutex::new(VecDeque::with_capacity(max_idle)),
            active: AtomicI64::new(0),
            closed: AtomicBool::new(false),
            dial: Mutex::new(dial),
            test: Mutex::new(test),
        })
    }

    /// Lease a connection.
    ///
    /// Fast path: take one from the idle set, optionally health-checked
    /// (failed probes destroy the connection and try the next). Slow path:
    /// dial a new connection, bounded by `max_active` and `dial_timeout`.
    pub async fn get(&self) -> Result<PooledConn> {
        loop {
            if self.is_closed() {
                return Err(Error::PoolClosed);
            }

            let entry = self.idle.lock().expect("idle set lock poisoned").pop_front();
            let Some(entry) = entry else { break };

            if self.test_on_get && !(self.test_fn())(&entry.conn) {
                tracing::debug!(peer = ?entry.conn.peer_addr(), "destroying unhealthy idle connection");
                self.destroy(entry.conn);
                continue;
            }
            return Ok(entry.conn);
        }

        if self.max_active > 0 && self.active.load(Ordering::SeqCst) >= self.max_active as i64 {
            return Err(Error::PoolExhausted);
        }

        let dial = self.dial_fn();
        let stream = match tokio::time::timeout(self.dial_timeout, (dial)()).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => return Err(Error::Io(err)),
            Err(_) => {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "dial timed out",
                )))
            }
        };

        self.active.fetch_add(1, Ordering::SeqCst);
        Ok(PooledConn::new(stream))
    }

    /// Lease with retry and exponential backoff (`base_delay × 2^attempt`).
    /// `PoolClosed` and `PoolExhausted` are terminal and returned at once.
    pub async fn get_with_retry(
        &self,
        max_retries: u32,
        base_delay: Duration,
    ) -> Result<PooledConn> {
        let mut last_err = None;
        for attempt in 0..=max_retries {
            match self.get().await {
                Ok(conn) => return Ok(conn),
                Err(err @ (Error::PoolClosed | Error::PoolExhausted)) => return Err(err),
                Err(err) => last_err = Some(err),
            }
            if attempt < max_retries {
                tokio::time::sleep(base_delay * 2u32.pow(attempt)).await;
            }
        }
        Err(last_err.unwrap_or(Error::PoolClosed))
    }

    /// Return a leased connection to the idle set.
    ///
    /// Never blocks: if the pool is closed or the idle set is full, the
    /// connection is destroyed instead.
    pub fn put(&self, conn: PooledConn) {
        {
            let mut idle = self.idle.lock().expect("idle set lock poisoned");
            if !self.closed.load(Ordering::SeqCst) && idle.len() < self.max_idle {
                idle.push_back(IdleEntry {
                    conn,
                    since: Instant::now(),
                });
                return;
            }
        }
        self.destroy(conn);
    }

    /// Destroy a leased connection without returning it. Used after any
    /// read/write failure: a stream that saw a partial exchange is not safe
    /// to reuse.
    pub fn discard(&self, conn: PooledConn) {
        self.destroy(conn);
    }

    fn destroy(&self, conn: PooledConn) {
        drop(conn);
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    /// Close the pool: reject new leases and destroy every idle connection.
    /// Leased connections are destroyed as they come back. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let drained: Vec<IdleEntry> = {
            let mut idle = self.idle.lock().expect("idle set lock poisoned");
            idle.drain(..).collect()
        };
        for entry in drained {
            self.destroy(entry.conn);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn active_count(&self) -> i64 {
        self.active.load(Ordering::SeqCst)
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().expect("idle set lock poisoned").len()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            active: self.active_count(),
            idle: self.idle_count(),
            closed: self.is_closed(),
        }
    }

    /// Lease a connection and return it immediately, verifying the pool is
    /// usable end to end.
    pub async fn ping(&self) -> Result<()> {
        let conn = self.get().await?;
        self.put(conn);
        Ok(())
    }

    /// Scan the idle set once, destroying entries that are stale (older
    /// than `idle_timeout`) or fail the health probe. Returns the number
    /// destroyed.
    pub fn sweep_idle(&self) -> usize {
        if self.is_closed() {
            return 0;
        }

        let test = self.test_fn();
        let mut cleaned = 0;
        let snapshot = self.idle.lock().expect("idle set lock poisoned").len();

        for _ in 0..snapshot {
            let entry = self.idle.lock().expect("idle set lock poisoned").pop_front();
            let Some(entry) = entry else { break };

            let stale = entry.since.elapsed() >= self.idle_timeout;
            if !stale && (test)(&entry.conn) {
                let mut idle = self.idle.lock().expect("idle set lock poisoned");
                if !self.closed.load(Ordering::SeqCst) && idle.len() < self.max_idle {
                    idle.push_back(entry);
                    continue;
                }
            }
            self.destroy(entry.conn);
            cleaned += 1;
        }

        if cleaned > 0 {
            tracing::debug!(cleaned, "idle sweep destroyed connections");
        }
        cleaned
    }

    /// Spawn a background task sweeping the idle set every `interval`.
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) -> SweeperHandle {
        let pool = Arc::clone(self);
        let token = CancellationToken::new();
        let task_token = token.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // the first tick is immediate
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = ticker.tick() => {
                        pool.sweep_idle();
                    }
                }
            }
        });
        SweeperHandle { token, handle }
    }

    /// Replace the connection factory (custom transports, tests).
    pub fn set_dial_fn(&self, dial: DialFn) {
        *self.dial.lock().expect("dial fn lock poisoned") = dial;
    }

    /// Replace the health probe.
    pub fn set_test_fn(&self, test: TestFn) {
        *self.test.lock().expect("test fn lock poisoned") = test;
    }

    fn dial_fn(&self) -> DialFn {
        self.dial.lock().expect("dial fn lock poisoned").clone()
    }

    fn test_fn(&self) -> TestFn {
        self.test.lock().expect("test fn lock poisoned").clone()
    }
}

/// Handle to a running idle sweeper; stop it with [`SweeperHandle::stop`].
pub struct SweeperHandle {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl SweeperHandle {
    pub async fn stop(self) {
        self.token.cancel();
        let _ = self.handle.await;
    }
}
