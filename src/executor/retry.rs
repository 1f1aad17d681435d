// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Executor retry policy.
//!
//! Only two phases are retried: opening the pool and starting a batch
//! transaction. Statements never are, since a batch that failed halfway has
//! no snapshot left to resume from. Compilation never retries either:
//! identical input yields an identical error.
//!
//! Only transport failures ([`is_transient`]) are retried. Bad URLs,
//! credentials and database errors return on the first attempt.
//!
//! # Example
//!
//! ```
//! use searchbox::executor::{RetryPhase, RetryPolicy};
//!
//! let policy = RetryPolicy::default();
//! assert_eq!(policy.backoff(RetryPhase::Connect).max_attempts, 5);
//! assert_eq!(policy.backoff(RetryPhase::Begin).max_attempts, 3);
//!
//! // Fail fast, e.g. behind a caller that already retries requests
//! let strict = RetryPolicy::no_retry();
//! assert_eq!(strict.backoff(RetryPhase::Begin).max_attempts, 1);
//! ```

use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::metrics;

/// Executor phase an operation belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPhase {
    /// Opening the connection pool
    Connect,
    /// Acquiring a connection and starting the batch transaction
    Begin,
}

impl RetryPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryPhase::Connect => "connect",
            RetryPhase::Begin => "begin",
        }
    }
}

impl fmt::Display for RetryPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exponential backoff for one phase. The delay doubles per attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Total attempts, including the first (1 = no retry)
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Backoff {
    pub const fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay after failed attempt number `attempt` (1-based)
    fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Backoff per executor phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Pool creation: a database still starting up gets ~3s
    pub connect: Backoff,
    /// Per search: a short wait for a free connection, then fail the search
    pub begin: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            connect: Backoff {
                max_attempts: 5,
                initial_delay: Duration::from_millis(200),
                max_delay: Duration::from_secs(2),
            },
            begin: Backoff {
                max_attempts: 3,
                initial_delay: Duration::from_millis(50),
                max_delay: Duration::from_millis(500),
            },
        }
    }
}

impl RetryPolicy {
    pub const fn no_retry() -> Self {
        Self {
            connect: Backoff::none(),
            begin: Backoff::none(),
        }
    }

    pub fn backoff(&self, phase: RetryPhase) -> Backoff {
        match phase {
            RetryPhase::Connect => self.connect,
            RetryPhase::Begin => self.begin,
        }
    }
}

/// Failures worth another attempt: the network or the pool, not the request.
pub fn is_transient(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::PoolTimedOut
    )
}

/// Run `operation` under the policy for `phase`.
pub(crate) async fn with_retry<F, Fut, T>(phase: RetryPhase, policy: &RetryPolicy, mut operation: F) -> Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    let backoff = policy.backoff(phase);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    info!(phase = %phase, attempts = attempt, "Executor recovered after retry");
                }
                return Ok(value);
            }
            Err(err) if attempt < backoff.max_attempts && is_transient(&err) => {
                let delay = backoff.delay(attempt);
                metrics::record_retry(phase.as_str(), attempt as usize);
                warn!(
                    phase = %phase,
                    attempt,
                    max_attempts = backoff.max_attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "Transient executor failure, retrying"
                );
                sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}
