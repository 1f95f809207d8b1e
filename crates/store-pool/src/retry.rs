//! Retry and sizing policies for the connection pool.

use std::time::Duration;

/// Defines a policy for retrying connection creation.
///
/// Specifies how many times to attempt creating a connection and how long to
/// wait between attempts.
///
/// # Example
///
/// ```rust
/// use store_pool::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy {
///     max_attempts: 5,
///     backoff_delay: Duration::from_millis(200),
/// };
/// assert_eq!(policy.budget(), Duration::from_secs(1));
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of creation attempts, including the first one.
    ///
    /// Values below 1 are treated as 1.
    pub max_attempts: u32,

    /// Constant delay between two consecutive attempts.
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    /// Three attempts, two seconds apart.
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Number of attempts actually made.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Upper bound on how long one [`Pool::acquire`](crate::Pool::acquire) may take.
    #[must_use]
    pub fn budget(&self) -> Duration {
        self.backoff_delay.saturating_mul(self.attempts())
    }
}

/// Sizing and retry configuration for a [`Pool`](crate::Pool).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of idle connections kept for reuse.
    pub target_size: usize,

    /// Extra connections that may be held concurrently beyond `target_size`.
    ///
    /// Overflow connections are closed instead of recycled when the idle set
    /// is already full.
    pub max_overflow: usize,

    /// Creation retry policy.
    pub retry: RetryPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            target_size: 5,
            max_overflow: 1,
            retry: RetryPolicy::default(),
        }
    }
}

impl PoolConfig {
    /// Hard cap on connections held by callers at the same time.
    #[must_use]
    pub fn max_held(&self) -> usize {
        self.target_size + self.max_overflow
    }
}
