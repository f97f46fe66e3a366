//! Synchronization engine for live collaborative sessions.
//!
//! ## Pieces
//! - [`time`]: host-aligned, strictly monotonic timestamps.
//! - [`events`]: ordered event delivery with sender authorization.
//! - [`authorization`]: role lookups with caching, retries, and a
//!   polyfill for hosts without a rich identity endpoint.
//! - [`request`]: request coalescing and bounded retries.
//! - [`transport`]: the seam a signaling backend implements, plus an
//!   in-process loopback hub.
//! - [`synchronizer`]: whole-value state replication per peer.
//!
//! Peers agree on event order through a pure freshness rule
//! ([`is_newer`]) applied to timestamps from a shared clock, so no
//! central sequencer is involved.

pub mod authorization;
pub mod error;
pub mod events;
pub mod request;
pub mod synchronizer;
pub mod time;
pub mod transport;

pub use authorization::{
    AuthorizationConfig, ClientInfo, HostDirectory, Role, RoleResolver, StaticDirectory,
};
pub use error::SyncError;
pub use events::{
    is_newer, ErrorListener, EventListener, EventScope, EventStamp, LiveEvent, SubscriptionId,
};
pub use request::{RequestCache, RetryPolicy};
pub use synchronizer::{StateChange, StateRecord, StateSynchronizer, SynchronizerConfig};
pub use time::{
    ClockConfig, LocalClock, ServerTime, SessionClock, SystemTimeService, TimeSample, TimeService,
    TimestampSource,
};
pub use transport::{
    Connectivity, LoopbackHub, LoopbackTransport, SignalEnvelope, SignalTransport, TransportEvent,
};
