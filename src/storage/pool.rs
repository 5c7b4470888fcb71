//! Bounded connection pool.
//!
//! `[min, max]` connections guarded by a semaphore of `max` permits. A
//! checkout that cannot get a permit within `checkout_timeout` fails with
//! `pool_exhausted`, never with a generic error. Returned connections sit on
//! an idle list; `reap_idle` closes the ones above `min` that have been idle
//! longer than `idle_timeout`.

use crate::types::{Error, PoolConfig, Result};
use serde::Serialize;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// Opens and checks connections for the pool.
pub trait ConnectionManager: Send + Sync + 'static {
    type Connection: Send + 'static;

    fn connect(&self) -> Result<Self::Connection>;

    /// Cheap liveness check run on idle connections before reuse.
    fn is_valid(&self, conn: &mut Self::Connection) -> bool;
}

struct IdleConnection<C> {
    conn: C,
    since: Instant,
}

struct PoolInner<M: ConnectionManager> {
    manager: M,
    config: PoolConfig,
    permits: Arc<Semaphore>,
    idle: Mutex<VecDeque<IdleConnection<M::Connection>>>,
    open: AtomicUsize,
    exhausted_total: AtomicU64,
    checkouts_total: AtomicU64,
}

impl<M: ConnectionManager> PoolInner<M> {
    fn idle_lock(&self) -> std::sync::MutexGuard<'_, VecDeque<IdleConnection<M::Connection>>> {
        // A panic while holding the lock leaves the deque itself consistent.
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn release(&self, conn: M::Connection) {
        self.idle_lock().push_back(IdleConnection {
            conn,
            since: Instant::now(),
        });
    }
}

/// Pool status reported by the performance endpoint.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PoolStats {
    pub min_connections: usize,
    pub max_connections: usize,
    pub open: usize,
    pub idle: usize,
    pub in_use: usize,
    pub exhausted_total: u64,
    pub checkouts_total: u64,
    pub status: &'static str,
}

/// Shared handle to a pool; clones share the same connections.
pub struct ConnectionPool<M: ConnectionManager> {
    inner: Arc<PoolInner<M>>,
}

impl<M: ConnectionManager> Clone for ConnectionPool<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<M: ConnectionManager> std::fmt::Debug for ConnectionPool<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("stats", &self.stats())
            .finish()
    }
}

impl<M: ConnectionManager> ConnectionPool<M> {
    /// Build the pool and open `min_connections` eagerly.
    pub fn new(manager: M, config: PoolConfig) -> Result<Self> {
        if config.max_connections == 0 || config.min_connections > config.max_connections {
            return Err(Error::validation(format!(
                "pool bounds invalid: min={} max={}",
                config.min_connections, config.max_connections
            )));
        }
        let pool = Self {
            inner: Arc::new(PoolInner {
                permits: Arc::new(Semaphore::new(config.max_connections)),
                idle: Mutex::new(VecDeque::with_capacity(config.max_connections)),
                open: AtomicUsize::new(0),
                exhausted_total: AtomicU64::new(0),
                checkouts_total: AtomicU64::new(0),
                manager,
                config,
            }),
        };
        for _ in 0..pool.inner.config.min_connections {
            let conn = pool.inner.manager.connect()?;
            pool.inner.open.fetch_add(1, Ordering::SeqCst);
            pool.inner.release(conn);
        }
        Ok(pool)
    }

    /// Check out a connection, waiting up to `checkout_timeout`.
    pub async fn checkout(&self) -> Result<PooledConnection<M>> {
        let timeout = self.inner.config.checkout_timeout;
        let permit = match tokio::time::timeout(timeout, self.inner.permits.clone().acquire_owned())
            .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_closed)) => return Err(Error::internal("connection pool closed")),
            Err(_elapsed) => {
                self.inner.exhausted_total.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    max_connections = self.inner.config.max_connections,
                    timeout_ms = timeout.as_millis() as u64,
                    "connection pool exhausted"
                );
                return Err(Error::pool_exhausted(format!(
                    "no connection available within {}ms ({} in use)",
                    timeout.as_millis(),
                    self.inner.config.max_connections
                )));
            }
        };
        self.inner.checkouts_total.fetch_add(1, Ordering::Relaxed);

        // Most recently returned first; stale ones are closed on the way.
        loop {
            let candidate = self.inner.idle_lock().pop_back();
            match candidate {
                Some(mut idle) => {
                    if self.inner.manager.is_valid(&mut idle.conn) {
                        return Ok(PooledConnection::new(idle.conn, self.inner.clone(), permit));
                    }
                    self.inner.open.fetch_sub(1, Ordering::SeqCst);
                    tracing::debug!("discarded invalid pooled connection");
                }
                None => break,
            }
        }

        // Opening may touch the filesystem; keep it off the async workers.
        let inner = self.inner.clone();
        let conn = tokio::task::spawn_blocking(move || inner.manager.connect())
            .await
            .map_err(|e| Error::internal(format!("connect task failed: {}", e)))??;
        self.inner.open.fetch_add(1, Ordering::SeqCst);
        Ok(PooledConnection::new(conn, self.inner.clone(), permit))
    }

    /// Close idle connections above `min` that exceeded `idle_timeout`.
    /// Returns how many were closed.
    pub fn reap_idle(&self) -> usize {
        let min = self.inner.config.min_connections;
        let idle_timeout = self.inner.config.idle_timeout;
        let mut idle = self.inner.idle_lock();
        let mut reaped = 0;

        // Oldest sit at the front.
        while let Some(front) = idle.front() {
            if self.inner.open.load(Ordering::SeqCst) <= min
                || front.since.elapsed() < idle_timeout
            {
                break;
            }
            idle.pop_front();
            self.inner.open.fetch_sub(1, Ordering::SeqCst);
            reaped += 1;
        }
        drop(idle);

        if reaped > 0 {
            tracing::debug!(reaped, "reclaimed idle connections");
        }
        reaped
    }

    /// Run `reap_idle` every `reap_interval` until cancelled.
    pub fn spawn_reaper(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let pool = self.clone();
        let every = self.inner.config.reap_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        pool.reap_idle();
                    }
                    _ = cancel.cancelled() => {
                        tracing::info!("pool_reaper_stopped");
                        break;
                    }
                }
            }
        })
    }

    pub fn stats(&self) -> PoolStats {
        let idle = self.inner.idle_lock().len();
        let open = self.inner.open.load(Ordering::SeqCst);
        let in_use = self.inner.config.max_connections - self.inner.permits.available_permits();
        let status = if in_use >= self.inner.config.max_connections {
            "saturated"
        } else {
            "healthy"
        };
        PoolStats {
            min_connections: self.inner.config.min_connections,
            max_connections: self.inner.config.max_connections,
            open,
            idle,
            in_use,
            exhausted_total: self.inner.exhausted_total.load(Ordering::Relaxed),
            checkouts_total: self.inner.checkouts_total.load(Ordering::Relaxed),
            status,
        }
    }
}

/// A checked-out connection. Goes back to the idle list on drop.
pub struct PooledConnection<M: ConnectionManager> {
    conn: Option<M::Connection>,
    pool: Arc<PoolInner<M>>,
    _permit: OwnedSemaphorePermit,
}

impl<M: ConnectionManager> PooledConnection<M> {
    fn new(conn: M::Connection, pool: Arc<PoolInner<M>>, permit: OwnedSemaphorePermit) -> Self {
        Self {
            conn: Some(conn),
            pool,
            _permit: permit,
        }
    }

    /// Close this connection instead of returning it (e.g. after a fatal error).
    pub fn discard(mut self) {
        if self.conn.take().is_some() {
            self.pool.open.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl<M: ConnectionManager> std::fmt::Debug for PooledConnection<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection").finish_non_exhaustive()
    }
}

impl<M: ConnectionManager> Deref for PooledConnection<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        // Only `discard` and `drop` take the connection, both consume self.
        self.conn.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl<M: ConnectionManager> DerefMut for PooledConnection<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl<M: ConnectionManager> Drop for PooledConnection<M> {
    fn drop(&mut self) {
        // Runs before the permit field drops, so waiters find the connection idle.
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Default)]
    struct CountingManager {
        opened: AtomicUsize,
    }

    impl ConnectionManager for CountingManager {
        type Connection = usize;

        fn connect(&self) -> Result<usize> {
            Ok(self.opened.fetch_add(1, Ordering::SeqCst))
        }

        fn is_valid(&self, _conn: &mut usize) -> bool {
            true
        }
    }

    fn config(min: usize, max: usize) -> PoolConfig {
        PoolConfig {
            min_connections: min,
            max_connections: max,
            checkout_timeout: Duration::from_millis(50),
            idle_timeout: Duration::from_millis(20),
            reap_interval: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn test_opens_min_eagerly() {
        let pool = ConnectionPool::new(CountingManager::default(), config(2, 4)).unwrap();
        let stats = pool.stats();
        assert_eq!(stats.open, 2);
        assert_eq!(stats.idle, 2);
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.status, "healthy");
    }

    #[tokio::test]
    async fn test_checkout_reuses_returned_connection() {
        let pool = ConnectionPool::new(CountingManager::default(), config(0, 2)).unwrap();
        let first = *pool.checkout().await.unwrap();
        let second = *pool.checkout().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(pool.stats().open, 1);
    }

    #[tokio::test]
    async fn test_saturation_reports_pool_exhausted() {
        let pool = ConnectionPool::new(CountingManager::default(), config(0, 2)).unwrap();
        let _a = pool.checkout().await.unwrap();
        let _b = pool.checkout().await.unwrap();
        assert_eq!(pool.stats().status, "saturated");

        let err = pool.checkout().await.unwrap_err();
        assert_eq!(err.code(), "pool_exhausted");
        assert_eq!(pool.stats().exhausted_total, 1);
    }

    #[tokio::test]
    async fn test_waiter_gets_connection_when_released() {
        let mut cfg = config(0, 1);
        cfg.checkout_timeout = Duration::from_secs(2);
        let pool = ConnectionPool::new(CountingManager::default(), cfg).unwrap();
        let held = pool.checkout().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.checkout().await.map(|c| *c) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);

        assert_eq!(waiter.await.unwrap().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reap_keeps_min() {
        let pool = ConnectionPool::new(CountingManager::default(), config(1, 4)).unwrap();
        {
            let _a = pool.checkout().await.unwrap();
            let _b = pool.checkout().await.unwrap();
            let _c = pool.checkout().await.unwrap();
        }
        assert_eq!(pool.stats().open, 3);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(pool.reap_idle(), 2);
        let stats = pool.stats();
        assert_eq!(stats.open, 1);
        assert_eq!(stats.idle, 1);
    }

    #[tokio::test]
    async fn test_fresh_idle_not_reaped() {
        let mut cfg = config(0, 4);
        cfg.idle_timeout = Duration::from_secs(60);
        let pool = ConnectionPool::new(CountingManager::default(), cfg).unwrap();
        drop(pool.checkout().await.unwrap());
        assert_eq!(pool.reap_idle(), 0);
        assert_eq!(pool.stats().open, 1);
    }

    #[tokio::test]
    async fn test_discard_closes_connection() {
        let pool = ConnectionPool::new(CountingManager::default(), config(0, 2)).unwrap();
        pool.checkout().await.unwrap().discard();
        let stats = pool.stats();
        assert_eq!(stats.open, 0);
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.in_use, 0);
    }

    /// Records which thread opened each connection.
    #[derive(Default)]
    struct ThreadManager {
        opened_on: Mutex<Vec<std::thread::ThreadId>>,
        fail: bool,
    }

    impl ConnectionManager for ThreadManager {
        type Connection = ();

        fn connect(&self) -> Result<()> {
            if self.fail {
                return Err(Error::internal("database unreachable"));
            }
            self.opened_on
                .lock()
                .unwrap()
                .push(std::thread::current().id());
            Ok(())
        }

        fn is_valid(&self, _conn: &mut ()) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_checkout_connects_off_the_runtime_thread() {
        let pool = ConnectionPool::new(ThreadManager::default(), config(0, 2)).unwrap();
        drop(pool.checkout().await.unwrap());

        let opened_on = pool.inner.manager.opened_on.lock().unwrap().clone();
        assert_eq!(opened_on.len(), 1);
        assert_ne!(opened_on[0], std::thread::current().id());
    }

    #[tokio::test]
    async fn test_connect_failure_is_not_exhaustion() {
        let manager = ThreadManager {
            fail: true,
            ..Default::default()
        };
        let pool = ConnectionPool::new(manager, config(0, 1)).unwrap();

        let err = pool.checkout().await.unwrap_err();
        assert_eq!(err.code(), "internal_error");
        let stats = pool.stats();
        assert_eq!(stats.exhausted_total, 0);
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.open, 0);
    }

    #[test]
    fn test_rejects_invalid_bounds() {
        assert!(ConnectionPool::new(CountingManager::default(), config(3, 2)).is_err());
        assert!(ConnectionPool::new(CountingManager::default(), config(0, 0)).is_err());
    }
}
