//! Timestamped session events.
//!
//! Every message peers exchange is a [`LiveEvent`]: a named payload stamped
//! with the sender's client id and a session timestamp. The ordering rule
//! in [`ordering`] consumes only the stamp, so freshness decisions stay a
//! pure function of two events.

pub mod ordering;
pub mod scope;

pub use ordering::is_newer;
pub use scope::{ErrorListener, EventListener, EventScope, SubscriptionId};

use serde::{Deserialize, Serialize};

/// An event stamped with sender identity and session time.
///
/// On the receive path `client_id` is always overwritten with the
/// transport-verified sender id; the payload field is never trusted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveEvent<T> {
    /// Event name within its scope.
    pub name: String,
    /// Sending client id.
    #[serde(rename = "clientId")]
    pub client_id: String,
    /// Session timestamp in UTC milliseconds, from a timestamp source.
    pub timestamp: i64,
    /// Application payload.
    pub data: T,
}

impl<T> LiveEvent<T> {
    /// The identity fields consulted by the ordering rule.
    pub fn stamp(&self) -> EventStamp<'_> {
        EventStamp {
            client_id: &self.client_id,
            timestamp: self.timestamp,
        }
    }
}

/// Borrowed view of the fields that decide event freshness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventStamp<'a> {
    pub client_id: &'a str,
    pub timestamp: i64,
}

impl<'a> EventStamp<'a> {
    pub fn new(client_id: &'a str, timestamp: i64) -> Self {
        Self {
            client_id,
            timestamp,
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────
