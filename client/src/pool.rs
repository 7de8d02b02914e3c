//! # Local Connection Pool
//!
//! One pool per local target. The idle list is a LIFO stack; entries are
//! revalidated on checkout (age, idle time, and a 1 ms liveness probe) and
//! a background sweeper reaps stale entries every 30 seconds.
//!
//! The liveness probe uses `TcpStream::peek` so a healthy keepalive
//! connection about to deliver bytes never loses them — the timeout path
//! means "healthy and quiet", an EOF or error means "dead".

use serde::Deserialize;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{Duration, Instant};
use tracing::{debug, trace};

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const PROBE_BUDGET: Duration = Duration::from_millis(1);

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("pool exhausted ({max_open} connections in use)")]
    Exhausted { max_open: usize },
    #[error("pool is closed")]
    Closed,
    #[error("dialing {addr} failed: {source}")]
    Dial { addr: String, source: io::Error },
    #[error("dialing {addr} timed out")]
    DialTimeout { addr: String },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_idle: usize,
    /// Zero means unlimited.
    pub max_open: usize,
    pub max_lifetime_ms: u64,
    pub max_idle_time_ms: u64,
    pub dial_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle: 8,
            max_open: 0,
            max_lifetime_ms: 600_000,
            max_idle_time_ms: 90_000,
            dial_timeout_ms: 10_000,
        }
    }
}

impl PoolConfig {
    fn max_lifetime(&self) -> Option<Duration> {
        (self.max_lifetime_ms > 0).then(|| Duration::from_millis(self.max_lifetime_ms))
    }

    fn max_idle_time(&self) -> Option<Duration> {
        (self.max_idle_time_ms > 0).then(|| Duration::from_millis(self.max_idle_time_ms))
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }
}

/// A checked-out connection; return it with [`Pool::put`] or drop it via
/// [`Pool::discard`] so the open-connection count stays honest.
pub struct PooledConn {
    pub conn: TcpStream,
    created_at: Instant,
    last_used: Instant,
}

#[derive(Debug, Default)]
pub struct PoolMetrics {
    /// Checkouts refused because `max_open` was reached.
    pub wait_count: AtomicU64,
    /// Successful fresh dials.
    pub total_conns: AtomicU64,
    /// Checkouts served from the idle list.
    pub total_reused: AtomicU64,
}

struct PoolState {
    idle: Vec<PooledConn>,
    num_open: usize,
}

pub struct Pool {
    addr: String,
    config: PoolConfig,
    state: Mutex<PoolState>,
    metrics: PoolMetrics,
    closed: AtomicBool,
}

impl Pool {
    pub fn new(addr: impl Into<String>, config: PoolConfig) -> Arc<Self> {
        let pool = Arc::new(Self {
            addr: addr.into(),
            config,
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                num_open: 0,
            }),
            metrics: PoolMetrics::default(),
            closed: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&pool);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tick.tick().await;
            loop {
                tick.tick().await;
                let Some(pool) = weak.upgrade() else { break };
                if pool.closed.load(Ordering::Acquire) {
                    break;
                }
                pool.sweep().await;
            }
        });
        pool
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn metrics(&self) -> &PoolMetrics {
        &self.metrics
    }

    fn expired(&self, entry: &PooledConn, now: Instant) -> bool {
        if let Some(max_lifetime) = self.config.max_lifetime() {
            if now.duration_since(entry.created_at) > max_lifetime {
                return true;
            }
        }
        if let Some(max_idle_time) = self.config.max_idle_time() {
            if now.duration_since(entry.last_used) > max_idle_time {
                return true;
            }
        }
        false
    }

    /// A 1 ms peek: timing out means the connection is healthy and quiet;
    /// EOF or a real error means it is dead. Peeking never consumes bytes.
    async fn probe(conn: &TcpStream) -> bool {
        let mut byte = [0u8; 1];
        match tokio::time::timeout(PROBE_BUDGET, conn.peek(&mut byte)).await {
            Err(_elapsed) => true,
            Ok(Ok(0)) => false,
            Ok(Ok(_)) => true,
            Ok(Err(_)) => false,
        }
    }

    /// Checks out a connection: most-recent idle entry that survives
    /// revalidation, else a fresh dial (the pool lock is released across
    /// the dial).
    pub async fn get(&self) -> Result<PooledConn, PoolError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed);
        }
        let mut state = self.state.lock().await;
        let now = Instant::now();
        while let Some(mut entry) = state.idle.pop() {
            if self.expired(&entry, now) {
                state.num_open -= 1;
                trace!(addr = %self.addr, "idle connection expired");
                continue;
            }
            if !Self::probe(&entry.conn).await {
                state.num_open -= 1;
                trace!(addr = %self.addr, "idle connection dead");
                continue;
            }
            entry.last_used = now;
            self.metrics.total_reused.fetch_add(1, Ordering::Relaxed);
            return Ok(entry);
        }

        if self.config.max_open > 0 && state.num_open >= self.config.max_open {
            self.metrics.wait_count.fetch_add(1, Ordering::Relaxed);
            return Err(PoolError::Exhausted {
                max_open: self.config.max_open,
            });
        }
        state.num_open += 1;
        drop(state);

        match tokio::time::timeout(self.config.dial_timeout(), TcpStream::connect(&self.addr)).await
        {
            Ok(Ok(conn)) => {
                let _ = conn.set_nodelay(true);
                self.metrics.total_conns.fetch_add(1, Ordering::Relaxed);
                let now = Instant::now();
                Ok(PooledConn {
                    conn,
                    created_at: now,
                    last_used: now,
                })
            }
            Ok(Err(source)) => {
                self.state.lock().await.num_open -= 1;
                Err(PoolError::Dial {
                    addr: self.addr.clone(),
                    source,
                })
            }
            Err(_) => {
                self.state.lock().await.num_open -= 1;
                Err(PoolError::DialTimeout {
                    addr: self.addr.clone(),
                })
            }
        }
    }

    /// Returns a connection to the idle stack, or closes it when the pool
    /// is closed or full.
    pub async fn put(&self, mut entry: PooledConn) {
        let mut state = self.state.lock().await;
        if self.closed.load(Ordering::Acquire) || state.idle.len() >= self.config.max_idle {
            state.num_open -= 1;
            return;
        }
        entry.last_used = Instant::now();
        state.idle.push(entry);
    }

    /// Drops a connection that must not be reused (I/O error, half-closed).
    pub async fn discard(&self, entry: PooledConn) {
        drop(entry);
        self.state.lock().await.num_open -= 1;
    }

    async fn sweep(&self) {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let before = state.idle.len();
        let (keep, expired): (Vec<_>, Vec<_>) = state
            .idle
            .drain(..)
            .partition(|entry| !self.expired(entry, now));
        state.idle = keep;
        state.num_open -= expired.len();
        if !expired.is_empty() {
            debug!(addr = %self.addr, reaped = expired.len(), kept = before - expired.len(), "pool sweep");
        }
    }

    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let mut state = self.state.lock().await;
        let drained = state.idle.drain(..).count();
        state.num_open -= drained;
    }
}

/// One pool per configured local target; headers naming an unregistered
/// target fall back to a direct dial in the dispatcher.
pub struct PoolMap {
    pools: RwLock<HashMap<String, Arc<Pool>>>,
    config: PoolConfig,
}

impl PoolMap {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub async fn register(&self, host: &str, port: u16) -> Arc<Pool> {
        let addr = format!("{host}:{port}");
        let mut pools = self.pools.write().await;
        Arc::clone(
            pools
                .entry(addr.clone())
                .or_insert_with(|| Pool::new(addr, self.config.clone())),
        )
    }

    pub async fn get(&self, host: &str, port: u16) -> Option<Arc<Pool>> {
        let addr = format!("{host}:{port}");
        let pools = self.pools.read().await;
        pools.get(&addr).map(Arc::clone)
    }

    pub async fn close_all(&self) {
        let pools = self.pools.read().await;
        for pool in pools.values() {
            pool.close().await;
        }
    }
}
