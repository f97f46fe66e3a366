//! Request-shaping utilities for flaky hosts.
//!
//! ## Pieces
//! - [`RequestCache`]: coalesces concurrent identical requests into a
//!   single in-flight future and keeps the result for a short TTL.
//! - [`RetryPolicy`]: bounded retries with a fixed backoff schedule and
//!   per-attempt timeouts that widen with each attempt.

pub mod cache;
pub mod retry;

pub use cache::RequestCache;
pub use retry::RetryPolicy;
