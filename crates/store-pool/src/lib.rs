//! Bounded connection pool for persistent-store handles.
//!
//! The pool keeps up to `target_size` idle connections for reuse and lets
//! callers hold at most `target_size + max_overflow` connections at once.
//! Connections are created lazily, with a bounded number of attempts and a
//! constant delay between them, so acquisition never blocks indefinitely.
//!
//! # Safety Model
//!
//! 1. A semaphore with `target_size + max_overflow` permits caps concurrent holders
//! 2. The idle set is a `Mutex<Vec<_>>`; a connection is popped out of it
//!    before being handed to a caller, so no two callers ever share one
//! 3. `PooledConnection` owns both the connection and its permit, and gives
//!    them back exactly once on drop
//!
//! There is no background health checking. Staleness is discovered by the
//! caller (see [`PooledConnection::mark_broken`]) or by
//! [`Connector::has_broken`] at release time, and such connections are
//! closed rather than recycled.
//!
//! # Example
//!
//! ```
//! use async_trait::async_trait;
//! use store_pool::{Connector, Pool, PoolConfig};
//!
//! struct Numbers;
//!
//! #[async_trait]
//! impl Connector for Numbers {
//!     type Connection = u32;
//!     type Error = std::io::Error;
//!
//!     async fn connect(&self) -> Result<u32, Self::Error> {
//!         Ok(7)
//!     }
//! }
//!
//! # tokio_test::block_on(async {
//! let pool = Pool::new(Numbers, PoolConfig::default());
//! let conn = pool.acquire().await.unwrap();
//! assert_eq!(*conn, 7);
//! drop(conn); // back to the idle set
//! assert_eq!(pool.stats().idle, 1);
//! # });
//! ```

pub mod retry;

pub use retry::{PoolConfig, RetryPolicy};

use async_trait::async_trait;
use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Creates, checks and closes connections for a [`Pool`].
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// The pooled connection type.
    type Connection: Send + 'static;

    /// Error produced when a connection cannot be created.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Open a brand-new connection.
    async fn connect(&self) -> Result<Self::Connection, Self::Error>;

    /// Cheap, synchronous staleness check run when a connection is released.
    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }

    /// Close a connection that will not be recycled.
    fn close(&self, conn: Self::Connection) {
        drop(conn);
    }
}

/// Errors reported by [`Pool::acquire`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// Every creation attempt failed.
    #[error("store unavailable after {attempts} connection attempts: {last_error}")]
    Exhausted {
        /// Number of attempts made.
        attempts: u32,
        /// Message of the final failure.
        last_error: String,
    },

    /// All `limit` connections stayed checked out for the whole wait budget.
    #[error("pool exhausted: {limit} connections in use for {waited:?}")]
    Saturated {
        /// Hard cap on concurrently held connections.
        limit: usize,
        /// How long the caller waited for a slot.
        waited: Duration,
    },

    /// The pool was closed.
    #[error("pool is closed")]
    Closed,
}

/// Point-in-time counters for a [`Pool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Connections waiting in the idle set.
    pub idle: usize,
    /// Connections currently held by callers.
    pub in_use: usize,
    /// Connections created since the pool was built.
    pub created: usize,
    /// Connections closed since the pool was built.
    pub closed: usize,
    /// Idle set size target.
    pub target_size: usize,
    /// Allowed overflow beyond `target_size`.
    pub max_overflow: usize,
}

/// Bounded pool of connections produced by a [`Connector`].
pub struct Pool<C: Connector> {
    connector: C,
    config: PoolConfig,
    /// Idle connections, most recently released last.
    idle: Mutex<Vec<C::Connection>>,
    /// One permit per connection a caller may hold.
    permits: Arc<Semaphore>,
    created: AtomicUsize,
    closed: AtomicUsize,
}

impl<C: Connector> Pool<C> {
    /// Create an empty pool. No connection is opened until needed.
    ///
    /// A `target_size` of 0 is raised to 1.
    pub fn new(connector: C, mut config: PoolConfig) -> Arc<Self> {
        config.target_size = config.target_size.max(1);
        let permits = Arc::new(Semaphore::new(config.max_held()));

        Arc::new(Self {
            connector,
            idle: Mutex::new(Vec::with_capacity(config.target_size)),
            config,
            permits,
            created: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
        })
    }

    /// Pre-open idle connections up to `target_size`.
    ///
    /// Best effort: stops at the first failure and returns how many
    /// connections were added.
    pub async fn warm_up(self: &Arc<Self>) -> usize {
        let mut added = 0;
        while self.idle.lock().len() < self.config.target_size {
            match self.connector.connect().await {
                Ok(conn) => {
                    self.created.fetch_add(1, Ordering::Relaxed);
                    self.idle.lock().push(conn);
                    added += 1;
                }
                Err(e) => {
                    warn!(error = %e, added, "Pool warm-up stopped early");
                    break;
                }
            }
        }
        debug!(added, "Pool warm-up complete");
        added
    }

    /// Acquire a connection.
    ///
    /// Reuses an idle connection when one exists, otherwise creates a new one
    /// under the retry policy. Waiting for a free slot and creating the
    /// connection share one deadline, [`RetryPolicy::budget`] after the call.
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledConnection<C>, PoolError> {
        let budget = self.config.retry.budget();
        let deadline = Instant::now() + budget;
        let permit =
            match tokio::time::timeout_at(deadline, Arc::clone(&self.permits).acquire_owned())
                .await
            {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(PoolError::Closed),
                Err(_) => {
                    warn!(
                        limit = self.config.max_held(),
                        waited_ms = budget.as_millis() as u64,
                        "Pool acquire timeout - all connections in use"
                    );
                    return Err(PoolError::Saturated {
                        limit: self.config.max_held(),
                        waited: budget,
                    });
                }
            };

        let reused = self.idle.lock().pop();
        let conn = match reused {
            Some(conn) => conn,
            None => self.connect_with_retry(deadline).await?,
        };

        Ok(PooledConnection {
            pool: Arc::clone(self),
            conn: Some(conn),
            healthy: true,
            _permit: permit,
        })
    }

    /// Try to open a connection, giving up at `deadline` or after the
    /// configured number of attempts, whichever comes first.
    async fn connect_with_retry(&self, deadline: Instant) -> Result<C::Connection, PoolError> {
        let attempts = self.config.retry.attempts();
        let delay = self.config.retry.backoff_delay;
        let mut made = 0;
        let mut last_error = String::new();

        while made < attempts {
            made += 1;
            let result = match tokio::time::timeout_at(deadline, self.connector.connect()).await {
                Ok(result) => result.map_err(|e| e.to_string()),
                Err(_) => Err("acquire deadline reached while connecting".to_string()),
            };
            match result {
                Ok(conn) => {
                    let created = self.created.fetch_add(1, Ordering::Relaxed) + 1;
                    debug!(attempt = made, created, "Opened store connection");
                    return Ok(conn);
                }
                Err(e) => {
                    error!(attempt = made, attempts, error = %e, "Store connection attempt failed");
                    last_error = e;
                    if made == attempts || Instant::now() + delay > deadline {
                        break;
                    }
                    tokio::time::sleep(delay).await;
                }
            }
        }

        Err(PoolError::Exhausted {
            attempts: made,
            last_error,
        })
    }

    /// Return a connection: recycle it when healthy and the idle set has
    /// room, otherwise close it.
    fn release(&self, mut conn: C::Connection, healthy: bool) {
        let rejected = if healthy && !self.connector.has_broken(&mut conn) {
            let mut idle = self.idle.lock();
            if idle.len() < self.config.target_size && !self.permits.is_closed() {
                idle.push(conn);
                None
            } else {
                Some(conn)
            }
        } else {
            warn!("Discarding unhealthy store connection");
            Some(conn)
        };

        if let Some(conn) = rejected {
            self.connector.close(conn);
            self.closed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Close every idle connection and refuse further acquisitions.
    ///
    /// Connections still checked out are closed when released.
    pub fn close(&self) {
        self.permits.close();
        let drained: Vec<_> = self.idle.lock().drain(..).collect();
        for conn in drained {
            self.connector.close(conn);
            self.closed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Current pool counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let in_use = if self.permits.is_closed() {
            0
        } else {
            self.config.max_held() - self.permits.available_permits()
        };
        PoolStats {
            idle: self.idle.lock().len(),
            in_use,
            created: self.created.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
            target_size: self.config.target_size,
            max_overflow: self.config.max_overflow,
        }
    }

    /// The pool configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// The connector used to open connections.
    #[must_use]
    pub fn connector(&self) -> &C {
        &self.connector
    }
}

/// RAII guard for a checked-out connection.
///
/// Dereferences to the connection. When dropped, the connection goes back to
/// the pool (or is closed) and the caller's slot is freed, exactly once.
pub struct PooledConnection<C: Connector> {
    pool: Arc<Pool<C>>,
    conn: Option<C::Connection>,
    healthy: bool,
    _permit: OwnedSemaphorePermit,
}

impl<C: Connector> PooledConnection<C> {
    /// Flag the connection as unusable; it will be closed on release.
    pub fn mark_broken(&mut self) {
        self.healthy = false;
    }

    /// Whether the connection is still considered usable.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    /// Release explicitly with the given health verdict.
    pub fn release(mut self, healthy: bool) {
        self.healthy = self.healthy && healthy;
    }
}

impl<C: Connector> Deref for PooledConnection<C> {
    type Target = C::Connection;

    fn deref(&self) -> &Self::Target {
        self.conn
            .as_ref()
            .expect("connection taken before drop - internal invariant violated")
    }
}

impl<C: Connector> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn
            .as_mut()
            .expect("connection taken before drop - internal invariant violated")
    }
}

impl<C: Connector> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn, self.healthy);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicU32;

    #[derive(Debug)]
    struct MockConn {
        id: usize,
    }

    #[derive(Default)]
    struct MockConnector {
        next_id: AtomicUsize,
        fail_remaining: AtomicU32,
        attempts: AtomicU32,
        broken_ids: Mutex<HashSet<usize>>,
    }

    impl MockConnector {
        fn failing(times: u32) -> Self {
            let connector = Self::default();
            connector.fail_remaining.store(times, Ordering::SeqCst);
            connector
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        type Connection = MockConn;
        type Error = std::io::Error;

        async fn connect(&self) -> Result<MockConn, Self::Error> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let failing = self
                .fail_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "store down",
                ));
            }
            Ok(MockConn {
                id: self.next_id.fetch_add(1, Ordering::SeqCst),
            })
        }

        fn has_broken(&self, conn: &mut MockConn) -> bool {
            self.broken_ids.lock().contains(&conn.id)
        }
    }

    fn config(target_size: usize, max_overflow: usize) -> PoolConfig {
        PoolConfig {
            target_size,
            max_overflow,
            retry: RetryPolicy {
                max_attempts: 3,
                backoff_delay: Duration::from_secs(2),
            },
        }
    }

    #[tokio::test]
    async fn test_lazy_creation() {
        let pool = Pool::new(MockConnector::default(), config(5, 1));
        assert_eq!(pool.stats().created, 0);

        let conn = pool.acquire().await.unwrap();
        assert_eq!(conn.id, 0);
        assert_eq!(pool.stats().created, 1);
        assert_eq!(pool.stats().in_use, 1);
    }

    #[tokio::test]
    async fn test_released_connection_reused_before_creating() {
        let pool = Pool::new(MockConnector::default(), config(5, 1));

        let first = pool.acquire().await.unwrap();
        let first_id = first.id;
        drop(first);

        let second = pool.acquire().await.unwrap();
        assert_eq!(second.id, first_id);
        assert_eq!(pool.stats().created, 1);
    }

    #[tokio::test]
    async fn test_prewarmed_pool_serves_five_without_sixth() {
        let pool = Pool::new(MockConnector::default(), config(5, 1));
        assert_eq!(pool.warm_up().await, 5);

        let held: Vec<_> = futures::future::join_all((0..5).map(|_| pool.acquire()))
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();

        let stats = pool.stats();
        assert_eq!(stats.created, 5);
        assert_eq!(stats.in_use, 5);
        assert_eq!(stats.idle, 0);
        drop(held);
        assert_eq!(pool.stats().idle, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overflow_is_capped() {
        let pool = Pool::new(MockConnector::default(), config(5, 1));
        pool.warm_up().await;

        let mut held = Vec::new();
        for _ in 0..6 {
            held.push(pool.acquire().await.unwrap());
        }
        assert_eq!(pool.stats().created, 6);

        let start = Instant::now();
        let err = pool.acquire().await.err().unwrap();
        assert_eq!(
            err,
            PoolError::Saturated {
                limit: 6,
                waited: Duration::from_secs(6)
            }
        );
        assert!(start.elapsed() >= Duration::from_secs(6));
        assert_eq!(pool.stats().created, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_gets_released_connection() {
        let pool = Pool::new(MockConnector::default(), config(1, 0));
        let held = pool.acquire().await.unwrap();
        let held_id = held.id;

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire().await.map(|c| c.id) })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        drop(held);

        assert_eq!(waiter.await.unwrap(), Ok(held_id));
        assert_eq!(pool.stats().created, 1);
    }

    #[tokio::test]
    async fn test_overflow_connection_closed_when_idle_full() {
        let pool = Pool::new(MockConnector::default(), config(1, 1));

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        drop(a);
        drop(b);

        let stats = pool.stats();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.closed, 1);
        assert_eq!(stats.in_use, 0);
    }

    #[tokio::test]
    async fn test_unhealthy_connection_discarded() {
        let pool = Pool::new(MockConnector::default(), config(5, 1));

        let mut conn = pool.acquire().await.unwrap();
        conn.mark_broken();
        drop(conn);
        assert_eq!(pool.stats().idle, 0);
        assert_eq!(pool.stats().closed, 1);

        let conn = pool.acquire().await.unwrap();
        conn.release(false);
        assert_eq!(pool.stats().closed, 2);
        assert_eq!(pool.stats().created, 2);
    }

    #[tokio::test]
    async fn test_has_broken_checked_on_release() {
        let pool = Pool::new(MockConnector::default(), config(5, 1));

        let conn = pool.acquire().await.unwrap();
        pool.connector().broken_ids.lock().insert(conn.id);
        conn.release(true);

        assert_eq!(pool.stats().idle, 0);
        assert_eq!(pool.stats().closed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_creation_retries_with_delay() {
        let pool = Pool::new(MockConnector::failing(2), config(5, 1));

        let start = Instant::now();
        let conn = pool.acquire().await.unwrap();
        assert_eq!(conn.id, 0);
        assert_eq!(pool.connector().attempts.load(Ordering::SeqCst), 3);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(4) && elapsed < Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_creation_exhausted_frees_slot() {
        let pool = Pool::new(MockConnector::failing(3), config(1, 0));

        let err = pool.acquire().await.err().unwrap();
        assert!(matches!(err, PoolError::Exhausted { attempts: 3, .. }));
        assert_eq!(pool.stats().in_use, 0);

        // The failed attempt gave its slot back
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slot_wait_and_creation_share_one_deadline() {
        let pool = Pool::new(MockConnector::default(), config(1, 0));
        let mut held = pool.acquire().await.unwrap();
        // Store goes down after the first connection
        pool.connector().fail_remaining.store(u32::MAX, Ordering::SeqCst);

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                let start = Instant::now();
                let result = pool.acquire().await.map(|c| c.id);
                (result, start.elapsed())
            })
        };

        tokio::time::sleep(Duration::from_millis(5900)).await;
        held.mark_broken();
        drop(held);

        let (result, elapsed) = waiter.await.unwrap();
        assert!(matches!(result, Err(PoolError::Exhausted { attempts: 1, .. })));
        let budget = pool.config().retry.budget();
        assert!(elapsed <= budget, "acquire took {elapsed:?}, budget {budget:?}");
        assert_eq!(pool.stats().in_use, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_never_hands_connection_twice() {
        let pool = Pool::new(MockConnector::default(), config(3, 1));
        let in_hand = Arc::new(Mutex::new(HashSet::new()));

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let in_hand = Arc::clone(&in_hand);
                tokio::spawn(async move {
                    let conn = pool.acquire().await.unwrap();
                    assert!(in_hand.lock().insert(conn.id), "connection shared");
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    in_hand.lock().remove(&conn.id);
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap();
        }

        // Live connections never exceed target_size + max_overflow
        let stats = pool.stats();
        assert!(stats.created - stats.closed <= 4);
        assert_eq!(stats.in_use, 0);
    }

    #[tokio::test]
    async fn test_close_drains_idle_and_rejects() {
        let pool = Pool::new(MockConnector::default(), config(2, 0));
        pool.warm_up().await;

        pool.close();
        assert_eq!(pool.stats().idle, 0);
        assert_eq!(pool.stats().closed, 2);
        assert_eq!(pool.acquire().await.err(), Some(PoolError::Closed));
    }
}
