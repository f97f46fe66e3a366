//! Continuous state synchronization across peers.
//!
//! ## Design
//! - Each peer owns exactly one state value per key and broadcasts it;
//!   everyone keeps a record of every other peer's latest accepted
//!   state. There is no merge: acceptance is per whole value, decided
//!   by the caller's callback.
//! - Announcements happen on connect (unless the host vetoes), when a
//!   newcomer joins, and on a periodic tick that only fires for state
//!   changed since the last successful broadcast.
//! - Departed peers are evicted so held state does not outlive
//!   presence.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::SyncError;
use crate::events::{EventStamp, LiveEvent};
use crate::time::TimestampSource;
use crate::transport::{Connectivity, SignalEnvelope, SignalTransport, TransportEvent};

/// Event name carried by every state broadcast.
const UPDATE_EVENT: &str = "update";

/// Default seconds between rebroadcast ticks.
const DEFAULT_TICK_SECS: u64 = 5;

/// Buffered change notifications per subscriber.
const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Tuning for one synchronized key.
#[derive(Debug, Clone)]
pub struct SynchronizerConfig {
    pub key: String,
    pub tick: Duration,
}

impl SynchronizerConfig {
    pub fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            tick: Duration::from_secs(DEFAULT_TICK_SECS),
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }
}

/// Latest accepted state from one peer.
#[derive(Debug, Clone)]
pub struct StateRecord<S> {
    pub state: S,
    pub timestamp: i64,
}

/// Notification that a peer's record changed.
#[derive(Debug, Clone)]
pub struct StateChange<S> {
    pub client_id: String,
    pub state: S,
    pub timestamp: i64,
}

struct LocalState<S> {
    state: S,
    timestamp: i64,
    last_broadcast: i64,
}

struct SyncShared<S> {
    config: SynchronizerConfig,
    transport: Arc<dyn SignalTransport>,
    clock: Arc<dyn TimestampSource>,
    local: Mutex<LocalState<S>>,
    records: Mutex<HashMap<String, StateRecord<S>>>,
    on_remote: Box<dyn Fn(&LiveEvent<S>, Option<EventStamp<'_>>) -> bool + Send + Sync>,
    should_connect: Box<dyn Fn() -> bool + Send + Sync>,
    changes: broadcast::Sender<StateChange<S>>,
}

/// Keeps one local state value in sync with every peer on the same key.
pub struct StateSynchronizer<S> {
    shared: Arc<SyncShared<S>>,
    tasks: Vec<JoinHandle<()>>,
}

impl<S> StateSynchronizer<S>
where
    S: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Stamp `initial_state` and start the background loops.
    ///
    /// `on_remote` decides whether an incoming update replaces the
    /// record held for its sender; `should_connect` lets the host veto
    /// unprompted announcements.
    pub fn start(
        config: SynchronizerConfig,
        transport: Arc<dyn SignalTransport>,
        clock: Arc<dyn TimestampSource>,
        initial_state: S,
        on_remote: impl Fn(&LiveEvent<S>, Option<EventStamp<'_>>) -> bool + Send + Sync + 'static,
        should_connect: impl Fn() -> bool + Send + Sync + 'static,
    ) -> Result<Self, SyncError> {
        let timestamp = clock.timestamp()?;
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        let shared = Arc::new(SyncShared {
            config,
            transport,
            clock,
            local: Mutex::new(LocalState {
                state: initial_state,
                // The initial value counts as already broadcast; the
                // connect announcement carries it to peers, the tick
                // only ever picks up later changes.
                timestamp,
                last_broadcast: timestamp,
            }),
            records: Mutex::new(HashMap::new()),
            on_remote: Box::new(on_remote),
            should_connect: Box::new(should_connect),
            changes,
        });
        // Subscribe before spawning so no event slips past the loops.
        let events = shared.transport.events();
        let tasks = vec![
            tokio::spawn(connect_watcher(shared.clone())),
            tokio::spawn(tick_loop(shared.clone())),
            tokio::spawn(receive_loop(shared.clone(), events)),
        ];
        Ok(Self { shared, tasks })
    }

    /// Replace the local state with a fresh stamp. The next tick or
    /// newcomer announcement carries it out.
    pub fn set_local_state(&self, state: S) -> Result<i64, SyncError> {
        let timestamp = self.shared.clock.timestamp()?;
        let mut local = self.shared.local.lock();
        local.state = state;
        local.timestamp = timestamp;
        Ok(timestamp)
    }

    pub fn local_state(&self) -> (S, i64) {
        let local = self.shared.local.lock();
        (local.state.clone(), local.timestamp)
    }

    /// Record held for one peer, if any.
    pub fn record_for(&self, client_id: &str) -> Option<StateRecord<S>> {
        self.shared.records.lock().get(client_id).cloned()
    }

    /// Snapshot of every peer record.
    pub fn records(&self) -> HashMap<String, StateRecord<S>> {
        self.shared.records.lock().clone()
    }

    /// Subscribe to accepted remote changes.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<StateChange<S>> {
        self.shared.changes.subscribe()
    }

    /// Stop every background loop. Local state stays readable.
    pub fn dispose(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl<S> Drop for StateSynchronizer<S> {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Announce on every transition into the connected state.
async fn connect_watcher<S>(shared: Arc<SyncShared<S>>)
where
    S: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    let mut connectivity = shared.transport.connectivity();
    loop {
        let connected = matches!(
            &*connectivity.borrow_and_update(),
            Connectivity::Connected { .. }
        );
        if connected {
            if (shared.should_connect)() {
                broadcast_local(&shared, "connect announcement").await;
            } else {
                tracing::debug!(key = %shared.config.key, "connect announcement vetoed by host");
            }
            // Wait out the connected stretch before arming again.
            loop {
                if connectivity.changed().await.is_err() {
                    return;
                }
                if matches!(
                    &*connectivity.borrow_and_update(),
                    Connectivity::Disconnected
                ) {
                    break;
                }
            }
        } else if connectivity.changed().await.is_err() {
            return;
        }
    }
}

async fn tick_loop<S>(shared: Arc<SyncShared<S>>)
where
    S: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    let mut ticks = tokio::time::interval(shared.config.tick);
    // The first interval fire is immediate; skip it so announcements
    // stay on the connect path.
    ticks.tick().await;
    loop {
        ticks.tick().await;
        if !shared.transport.is_connected() {
            continue;
        }
        let pending = {
            let local = shared.local.lock();
            local.timestamp > local.last_broadcast
        };
        if pending {
            broadcast_local(&shared, "periodic rebroadcast").await;
        }
    }
}

async fn receive_loop<S>(
    shared: Arc<SyncShared<S>>,
    mut events: broadcast::Receiver<TransportEvent>,
) where
    S: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    loop {
        match events.recv().await {
            Ok(TransportEvent::Signal(envelope)) => handle_signal(&shared, envelope),
            Ok(TransportEvent::PeerJoined { client_id }) => {
                if (shared.should_connect)() {
                    tracing::debug!(key = %shared.config.key, peer = %client_id, "rebroadcasting for newcomer");
                    broadcast_local(&shared, "newcomer announcement").await;
                }
            }
            Ok(TransportEvent::PeerLeft { client_id }) => {
                if shared.records.lock().remove(&client_id).is_some() {
                    tracing::debug!(key = %shared.config.key, peer = %client_id, "departed peer record evicted");
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(key = %shared.config.key, skipped, "event stream lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Send the current local state to every peer.
async fn broadcast_local<S>(shared: &SyncShared<S>, reason: &str)
where
    S: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    let Some(client_id) = shared.transport.client_id() else {
        return;
    };
    let (state, timestamp) = {
        let local = shared.local.lock();
        (local.state.clone(), local.timestamp)
    };
    let event = LiveEvent {
        name: UPDATE_EVENT.to_string(),
        client_id,
        timestamp,
        data: state,
    };
    let content = match serde_json::to_value(&event) {
        Ok(content) => content,
        Err(err) => {
            tracing::warn!(key = %shared.config.key, error = %err, "state not serializable");
            return;
        }
    };
    match shared.transport.submit(&shared.config.key, content).await {
        Ok(()) => {
            shared.local.lock().last_broadcast = timestamp;
            tracing::debug!(key = %shared.config.key, timestamp, reason, "local state broadcast");
        }
        Err(err) => {
            // Leave last_broadcast stale so the next tick retries.
            tracing::debug!(key = %shared.config.key, error = %err, reason, "state broadcast failed");
        }
    }
}

fn handle_signal<S>(shared: &SyncShared<S>, envelope: SignalEnvelope)
where
    S: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    if envelope.name != shared.config.key {
        return;
    }
    // Own broadcasts echo back; the local copy is already current.
    if envelope.local_echo {
        return;
    }
    let Some(sender_id) = envelope.sender_id else {
        return;
    };
    let mut event: LiveEvent<S> = match serde_json::from_value(envelope.content) {
        Ok(event) => event,
        Err(err) => {
            tracing::debug!(key = %shared.config.key, error = %err, "dropping malformed state update");
            return;
        }
    };
    // Identity comes from the transport, not the payload.
    event.client_id = sender_id;

    let accepted = {
        let current = shared
            .records
            .lock()
            .get(&event.client_id)
            .map(|record| (record.timestamp, event.client_id.clone()));
        let stamp = current
            .as_ref()
            .map(|(timestamp, client_id)| EventStamp::new(client_id, *timestamp));
        (shared.on_remote)(&event, stamp)
    };
    if !accepted {
        tracing::debug!(
            key = %shared.config.key,
            peer = %event.client_id,
            timestamp = event.timestamp,
            "stale state update ignored"
        );
        return;
    }
    shared.records.lock().insert(
        event.client_id.clone(),
        StateRecord {
            state: event.data.clone(),
            timestamp: event.timestamp,
        },
    );
    let _ = shared.changes.send(StateChange {
        client_id: event.client_id,
        state: event.data,
        timestamp: event.timestamp,
    });
}

// ── Tests ───────────────────────────────────────────────────────
