//! Retry policy for dispatches that fail because the connection was lost.
//!
//! Only connection-loss errors whose code is in the policy's retryable set
//! are retried; statement-level errors (syntax, missing table, constraint
//! violations) never are. Delays are deterministic so worst-case batch latency
//! stays bounded and testable.
//!
//! ```rust
//! use prax_batch::{DriverError, RetryPolicy};
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::new()
//!     .max_attempts(3)
//!     .fixed_delay(Duration::from_millis(250));
//!
//! let lost = DriverError::connection(2013, "Lost connection to MySQL server during query");
//! assert!(policy.should_retry(1, &lost));
//! assert!(policy.should_retry(2, &lost));
//! assert!(!policy.should_retry(3, &lost));
//!
//! let syntax = DriverError::query(1064, "You have an error in your SQL syntax");
//! assert!(!policy.should_retry(1, &syntax));
//! ```

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::DriverError;

/// Client cannot connect through the local socket.
pub const CR_CONNECTION_ERROR: i32 = 2002;
/// Client cannot connect to the server host.
pub const CR_CONN_HOST_ERROR: i32 = 2003;
/// Server has gone away.
pub const CR_SERVER_GONE_ERROR: i32 = 2006;
/// Connection lost during a query.
pub const CR_SERVER_LOST: i32 = 2013;

/// The default set of transient connection-loss codes (MySQL client codes).
pub const DEFAULT_RETRYABLE_CODES: [i32; 4] = [
    CR_CONNECTION_ERROR,
    CR_CONN_HOST_ERROR,
    CR_SERVER_GONE_ERROR,
    CR_SERVER_LOST,
];

/// Observer called before each retry with `(attempt, error, delay)`.
pub type BeforeRetry = Arc<dyn Fn(u32, &DriverError, Duration) + Send + Sync>;

/// Delay strategy between a failed dispatch and its retry.
#[derive(Debug, Clone, PartialEq)]
pub enum Backoff {
    /// The same delay before every retry.
    Fixed(Duration),
    /// `initial * multiplier^(attempt - 1)`, capped at `max`.
    Exponential {
        /// Delay before the first retry.
        initial: Duration,
        /// Growth factor per attempt.
        multiplier: f64,
        /// Upper bound for any single delay.
        max: Duration,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Fixed(Duration::from_millis(1000))
    }
}

impl Backoff {
    /// Calculate the delay after the given failed attempt (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            Self::Fixed(delay) => *delay,
            Self::Exponential {
                initial,
                multiplier,
                max,
            } => {
                let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
                let delay_ms = initial.as_millis() as f64 * multiplier.max(1.0).powi(exponent);
                let delay_ms = delay_ms.min(max.as_millis() as f64);
                Duration::from_millis(delay_ms as u64)
            }
        }
    }
}

/// Decides whether and when a failed dispatch is retried.
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Backoff,
    retryable_codes: BTreeSet<i32>,
    before_retry: Option<BeforeRetry>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            backoff: Backoff::default(),
            retryable_codes: DEFAULT_RETRYABLE_CODES.into_iter().collect(),
            before_retry: None,
        }
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("retryable_codes", &self.retryable_codes)
            .field("before_retry", &self.before_retry.is_some())
            .finish()
    }
}

impl RetryPolicy {
    /// Create a policy with the defaults: two attempts, 1s fixed delay,
    /// MySQL connection-loss codes.
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy that never retries.
    pub fn never() -> Self {
        Self::default().max_attempts(1)
    }

    /// Set the total number of dispatch attempts (initial attempt included).
    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n.max(1);
        self
    }

    /// Use a fixed delay before every retry.
    pub fn fixed_delay(mut self, delay: Duration) -> Self {
        self.backoff = Backoff::Fixed(delay);
        self
    }

    /// Set the backoff strategy.
    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Replace the set of retryable error codes.
    pub fn retryable_codes(mut self, codes: impl IntoIterator<Item = i32>) -> Self {
        self.retryable_codes = codes.into_iter().collect();
        self
    }

    /// Add a retryable error code.
    pub fn retry_on_code(mut self, code: i32) -> Self {
        self.retryable_codes.insert(code);
        self
    }

    /// Register an observer called before each retry.
    pub fn before_retry<F>(mut self, hook: F) -> Self
    where
        F: Fn(u32, &DriverError, Duration) + Send + Sync + 'static,
    {
        self.before_retry = Some(Arc::new(hook));
        self
    }

    /// Total dispatch attempts allowed.
    pub fn attempts(&self) -> u32 {
        self.max_attempts
    }

    /// The configured backoff strategy.
    pub fn backoff_strategy(&self) -> &Backoff {
        &self.backoff
    }

    /// Check if a code is in the retryable set.
    pub fn is_retryable_code(&self, code: i32) -> bool {
        self.retryable_codes.contains(&code)
    }

    /// Decide whether to retry after `attempt` failed attempts (1-based).
    pub fn should_retry(&self, attempt: u32, error: &DriverError) -> bool {
        attempt < self.max_attempts && self.is_retryable_code(error.code)
    }

    /// The delay to wait after `attempt` failed attempts before redispatching.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        self.backoff.delay_for_attempt(attempt)
    }

    pub(crate) fn notify_retry(&self, attempt: u32, error: &DriverError, delay: Duration) {
        if let Some(hook) = &self.before_retry {
            hook(attempt, error, delay);
        }
    }
}
