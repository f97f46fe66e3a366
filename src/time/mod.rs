//! Server time access and clock synchronization.
//!
//! ## Pieces
//! - [`TimeService`]: the host-side time endpoint, one round trip per
//!   call.
//! - [`SessionClock`]: estimates the offset between the local clock and
//!   the host's, then hands out host-aligned, strictly monotonic
//!   timestamps.
//! - [`LocalClock`]: the degenerate single-machine variant with zero
//!   offset and zero error.

pub mod clock;

pub use clock::{ClockConfig, LocalClock, SessionClock, TimeSample, TimestampSource};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// One reading of the host's clock, as it crosses the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerTime {
    #[serde(rename = "isoTime")]
    pub iso_time: String,
    #[serde(rename = "utcMillis")]
    pub utc_millis: i64,
}

/// Source of the host's current time.
#[async_trait]
pub trait TimeService: Send + Sync {
    async fn server_time(&self) -> Result<ServerTime, SyncError>;
}

/// Time service backed by this machine's own clock. Useful when the
/// host and the session share a box, and as the baseline in tests.
#[derive(Debug, Default)]
pub struct SystemTimeService;

#[async_trait]
impl TimeService for SystemTimeService {
    async fn server_time(&self) -> Result<ServerTime, SyncError> {
        let now = Utc::now();
        Ok(ServerTime {
            iso_time: now.to_rfc3339(),
            utc_millis: now.timestamp_millis(),
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────
