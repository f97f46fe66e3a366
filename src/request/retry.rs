//! Bounded retries with widening per-attempt timeouts.
//!
//! ## Design
//! - A fixed backoff schedule, not exponential growth from a base: the
//!   delays were tuned for interactive sessions where a caller is
//!   blocked on the answer. Attempts = schedule length + 1.
//! - Each attempt gets its own timeout that widens with the attempt
//!   number, so a slow-but-healthy host gets more room on later tries.
//! - The caller separates transport failures (the request future
//!   errored) from unusable answers (the validator returned `None`).
//!   When every attempt fails with a request error, the last error
//!   propagates unchanged; when the final attempt merely produced an
//!   unusable answer or timed out, the caller's `exhausted` error is
//!   returned instead.

use std::future::Future;
use std::time::Duration;

use crate::error::SyncError;

/// Default backoff schedule between attempts, in milliseconds.
pub(crate) const DEFAULT_BACKOFF_MS: [u64; 5] = [100, 200, 200, 400, 600];

/// Default base timeout for a single attempt: 500 ms.
pub(crate) const DEFAULT_BASE_TIMEOUT_MS: u64 = 500;

/// Retry driver with a fixed delay schedule.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    delays: Vec<Duration>,
    base_timeout: Duration,
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::with_base_timeout(Duration::from_millis(DEFAULT_BASE_TIMEOUT_MS))
    }

    pub fn with_base_timeout(base_timeout: Duration) -> Self {
        Self::with_delays(
            base_timeout,
            DEFAULT_BACKOFF_MS
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect(),
        )
    }

    pub fn with_delays(base_timeout: Duration, delays: Vec<Duration>) -> Self {
        Self {
            delays,
            base_timeout,
        }
    }

    /// Total attempts this policy will make: one initial try plus one
    /// per scheduled delay.
    pub fn attempts(&self) -> usize {
        self.delays.len() + 1
    }

    /// Timeout for attempt `n` (zero-based).
    ///
    /// Widens linearly with the attempt number but never drops below
    /// three times the base, so even the first attempt is not cut off
    /// by an aggressive base value.
    pub fn attempt_timeout(&self, n: usize) -> Duration {
        let widened = self.base_timeout.saturating_mul(n as u32 + 1);
        let floor = self.base_timeout.saturating_mul(3);
        widened.max(floor)
    }

    /// Drive `request` until `validate` accepts an answer or the
    /// schedule runs out.
    ///
    /// - `request` issues one attempt and may fail outright.
    /// - `validate` inspects a raw answer and extracts the usable value,
    ///   returning `None` for answers that are well-formed but unusable.
    /// - `exhausted` builds the error reported when the schedule ends
    ///   without a usable answer and no request error is available to
    ///   propagate.
    pub async fn run<Raw, T, Req, Fut, V, E>(
        &self,
        operation: &str,
        mut request: Req,
        mut validate: V,
        exhausted: E,
    ) -> Result<T, SyncError>
    where
        Req: FnMut() -> Fut,
        Fut: Future<Output = Result<Raw, SyncError>>,
        V: FnMut(Raw) -> Option<T>,
        E: Fn() -> SyncError,
    {
        let attempts = self.attempts();
        for attempt in 0..attempts {
            let last = attempt + 1 == attempts;
            let timeout = self.attempt_timeout(attempt);

            match tokio::time::timeout(timeout, request()).await {
                Ok(Ok(raw)) => {
                    if let Some(value) = validate(raw) {
                        return Ok(value);
                    }
                    if last {
                        tracing::debug!(operation, attempt, "answer unusable, attempts exhausted");
                        return Err(exhausted());
                    }
                    tracing::debug!(operation, attempt, "answer unusable, retrying");
                }
                Ok(Err(err)) => {
                    if last {
                        return Err(err);
                    }
                    tracing::debug!(operation, attempt, error = %err, "attempt failed, retrying");
                }
                Err(_) => {
                    if last {
                        tracing::debug!(operation, attempt, "attempt timed out, attempts exhausted");
                        return Err(exhausted());
                    }
                    tracing::debug!(operation, attempt, timeout_ms = timeout.as_millis() as u64, "attempt timed out, retrying");
                }
            }

            tokio::time::sleep(self.delays[attempt]).await;
        }
        Err(exhausted())
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ───────────────────────────────────────────────────────
