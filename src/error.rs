//! Error taxonomy for the synchronization engine.
//!
//! Network-layer failures are absorbed and retried inside the request
//! machinery up to its budgets; once exhausted they surface here as
//! terminal errors. Precondition violations fail fast and are never
//! retried. Errors are `Clone` because results flow through shared,
//! coalesced futures observed by many callers.

use std::time::Duration;

/// Everything this crate can fail with.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
    /// Timestamp or error bound requested before the clock produced a
    /// sample.
    #[error("clock has not produced a sample yet (call start() first)")]
    ClockNotStarted,

    /// `start()` called on a clock that is already running.
    #[error("clock is already running")]
    ClockAlreadyRunning,

    /// A roles or identity query was issued without a client id.
    #[error("client id is missing or empty")]
    MissingClientId,

    /// A single attempt exceeded its time budget.
    #[error("attempt exceeded its {waited:?} budget")]
    Timeout { waited: Duration },

    /// Every attempt in the retry schedule was spent.
    #[error("timed out {operation}")]
    Exhausted { operation: String },

    /// The sender holds none of the roles allowed to act.
    #[error("client {client_id} holds none of the allowed roles")]
    RoleDenied { client_id: String },

    /// Submit attempted while the transport is disconnected.
    #[error("transport is not connected")]
    NotConnected,

    /// The transport went away underneath a waiter.
    #[error("transport closed")]
    TransportClosed,

    /// The host rejected or failed a request for a non-timeout reason.
    #[error("host rejected the request: {0}")]
    Host(String),

    /// A payload could not be encoded or decoded.
    #[error("payload serialization failed: {0}")]
    Serialization(String),
}

impl SyncError {
    /// Whether this error carries a timeout signature. The authorization
    /// resolver uses this to tell "the API is slow or absent" apart from
    /// "the API exists and said no".
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            SyncError::Timeout { .. } | SyncError::Exhausted { .. }
        )
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}
