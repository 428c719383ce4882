//! # Connection Pool
//!
//! Purpose: Reuse TCP connections across cache calls and bound how many are
//! open at once.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Keep a bounded set of reusable connections.
//! 2. **Minimal Locking**: Hold the mutex only while moving idle connections.
//! 3. **Bounded Concurrency**: A semaphore caps checked-out connections;
//!    callers past the cap wait, and the caller's timeout bounds that wait.
//! 4. **Never Reuse a Dirty Connection**: A connection goes back to the pool
//!    only after its command completed. Timeouts, IO errors and abandoned
//!    futures close it instead, so a late reply can never reach the next caller.
//! 5. **Check Before Checkout**: Idle connections the server closed while
//!    parked (idle timeouts, restarts) are dropped instead of handed out.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use telli_cache_common::RespValue;

use crate::config::ConnectionTarget;
use crate::connection::Connection;
use crate::error::{CacheError, CacheResult};

/// Pool configuration.
#[derive(Debug, Clone)]
pub(crate) struct PoolConfig {
    pub(crate) target: ConnectionTarget,
    /// Maximum number of idle connections to keep.
    pub(crate) max_idle: usize,
    /// Maximum connections checked out at once.
    pub(crate) max_total: usize,
}

struct PoolInner {
    config: PoolConfig,
    idle: Mutex<Vec<Connection>>,
    permits: Arc<Semaphore>,
}

/// Connection pool handle.
#[derive(Clone)]
pub(crate) struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Creates an empty pool. Connections are opened lazily on first use.
    pub(crate) fn new(config: PoolConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_total));
        ConnectionPool {
            inner: Arc::new(PoolInner {
                idle: Mutex::new(Vec::with_capacity(config.max_idle)),
                config,
                permits,
            }),
        }
    }

    /// Checks out a connection, reusing an idle one when possible.
    pub(crate) async fn acquire(&self) -> CacheResult<PooledConnection> {
        let permit = Arc::clone(&self.inner.permits)
            .acquire_owned()
            .await
            .map_err(|_| CacheError::Unavailable("connection pool closed".to_string()))?;

        let conn = match self.pop_idle() {
            Some(conn) => conn,
            None => Connection::connect(&self.inner.config.target).await?,
        };

        Ok(PooledConnection {
            pool: Arc::clone(&self.inner),
            conn: Some(conn),
            reusable: true,
            _permit: permit,
        })
    }

    /// Number of idle connections currently parked in the pool.
    pub(crate) fn idle_count(&self) -> usize {
        self.inner.idle.lock().len()
    }

    /// Pops the newest idle connection the server has not closed meanwhile.
    fn pop_idle(&self) -> Option<Connection> {
        let mut idle = self.inner.idle.lock();
        while let Some(conn) = idle.pop() {
            if conn.is_open() {
                return Some(conn);
            }
            debug!("discarding idle connection closed by cache server");
        }
        None
    }
}

impl PoolInner {
    fn return_connection(&self, conn: Connection) {
        let mut idle = self.idle.lock();
        if idle.len() < self.config.max_idle {
            idle.push(conn);
        }
    }
}

/// RAII guard returning a connection to the pool on drop.
///
/// Field order matters: the connection is parked in `Drop::drop`, before the
/// permit field is dropped and wakes the next waiter.
pub(crate) struct PooledConnection {
    pool: Arc<PoolInner>,
    conn: Option<Connection>,
    reusable: bool,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// Executes a command and returns the parsed reply.
    pub(crate) async fn exec(&mut self, args: &[&[u8]]) -> CacheResult<RespValue> {
        let conn = match self.conn.as_mut() {
            Some(conn) => conn,
            None => return Err(CacheError::Unavailable("connection already released".to_string())),
        };

        // Stays false if the command fails or this future is dropped mid-flight.
        self.reusable = false;
        let reply = conn.exec(args).await?;
        self.reusable = true;
        Ok(reply)
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if self.reusable {
                self.pool.return_connection(conn);
            }
        }
    }
}
