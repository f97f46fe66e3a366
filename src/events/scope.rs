//! Scoped event fan-out with stamping and sender authorization.
//!
//! ## Responsibilities
//! - Stamp outgoing events with the sender's identity and a
//!   host-aligned timestamp before they touch the wire.
//! - Gate both directions on the scope's allowed sender roles.
//! - Hand incoming events to listeners keyed by event name, taking the
//!   sender identity from the transport envelope rather than from the
//!   payload.
//! - Surface rejections on watched names through an error channel;
//!   rejections on names nobody watches are dropped quietly.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::authorization::{Role, RoleResolver};
use crate::error::SyncError;
use crate::events::LiveEvent;
use crate::time::TimestampSource;
use crate::transport::{SignalTransport, TransportEvent};

/// Handle for detaching a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

/// Callback for delivered events. The flag is true when the event
/// originated on this side.
pub type EventListener = Arc<dyn Fn(&LiveEvent<Value>, bool) + Send + Sync>;

/// Callback for events that arrived but were rejected.
pub type ErrorListener = Arc<dyn Fn(&LiveEvent<Value>, &SyncError) + Send + Sync>;

struct RegisteredListener {
    id: SubscriptionId,
    listener: EventListener,
}

struct ScopeShared {
    scope_id: String,
    allowed_senders: Vec<Role>,
    transport: Arc<dyn SignalTransport>,
    clock: Arc<dyn TimestampSource>,
    resolver: Arc<RoleResolver>,
    listeners: Mutex<HashMap<String, Vec<RegisteredListener>>>,
    watched_names: Mutex<HashSet<String>>,
    error_listeners: Mutex<Vec<(SubscriptionId, ErrorListener)>>,
}

impl ScopeShared {
    /// Wait for the connection, check the sender's roles, and stamp.
    async fn gate_and_stamp<T: Serialize>(
        &self,
        name: &str,
        payload: &T,
    ) -> Result<LiveEvent<Value>, SyncError> {
        let client_id = self.transport.wait_for_connect().await?;
        let allowed = self
            .resolver
            .verify_roles_allowed(&client_id, &self.allowed_senders)
            .await?;
        if !allowed {
            return Err(SyncError::RoleDenied { client_id });
        }
        Ok(LiveEvent {
            name: name.to_string(),
            client_id,
            timestamp: self.clock.timestamp()?,
            data: serde_json::to_value(payload)?,
        })
    }
}

/// One named event channel over a transport.
///
/// Events sent here echo back through the transport, so the sender's
/// own listeners fire too, flagged as local.
pub struct EventScope {
    shared: Arc<ScopeShared>,
    receive_task: JoinHandle<()>,
}

impl EventScope {
    pub fn new(
        scope_id: &str,
        allowed_senders: Vec<Role>,
        transport: Arc<dyn SignalTransport>,
        clock: Arc<dyn TimestampSource>,
        resolver: Arc<RoleResolver>,
    ) -> Self {
        let shared = Arc::new(ScopeShared {
            scope_id: scope_id.to_string(),
            allowed_senders,
            transport,
            clock,
            resolver,
            listeners: Mutex::new(HashMap::new()),
            watched_names: Mutex::new(HashSet::new()),
            error_listeners: Mutex::new(Vec::new()),
        });
        // Subscribe before spawning so no event slips between the two.
        let events = shared.transport.events();
        let receive_task = tokio::spawn(receive_loop(shared.clone(), events));
        Self {
            shared,
            receive_task,
        }
    }

    /// Attach a listener for `name`. The name stays watched for the
    /// scope's lifetime, so later rejections on it stay loud even after
    /// the listener detaches.
    pub fn on_event(&self, name: &str, listener: EventListener) -> SubscriptionId {
        let id = SubscriptionId(Uuid::new_v4());
        self.shared
            .listeners
            .lock()
            .entry(name.to_string())
            .or_default()
            .push(RegisteredListener { id, listener });
        self.shared.watched_names.lock().insert(name.to_string());
        id
    }

    pub fn off_event(&self, name: &str, id: SubscriptionId) {
        if let Some(registered) = self.shared.listeners.lock().get_mut(name) {
            registered.retain(|entry| entry.id != id);
        }
    }

    pub fn on_error(&self, listener: ErrorListener) -> SubscriptionId {
        let id = SubscriptionId(Uuid::new_v4());
        self.shared.error_listeners.lock().push((id, listener));
        id
    }

    pub fn off_error(&self, id: SubscriptionId) {
        self.shared
            .error_listeners
            .lock()
            .retain(|(entry, _)| *entry != id);
    }

    /// Stamp `payload` and send it to every connected peer. Waits for
    /// the connection first and fails when the sender's roles do not
    /// clear the scope's allowlist.
    pub async fn send_event<T: Serialize>(
        &self,
        name: &str,
        payload: &T,
    ) -> Result<LiveEvent<Value>, SyncError> {
        let event = self.shared.gate_and_stamp(name, payload).await?;
        self.shared
            .transport
            .submit(&self.shared.scope_id, serde_json::to_value(&event)?)
            .await?;
        tracing::debug!(
            scope = %self.shared.scope_id,
            event = %event.name,
            timestamp = event.timestamp,
            "event sent"
        );
        Ok(event)
    }

    /// Stamp `payload` and deliver it to this side's listeners only.
    /// Same gating as [`Self::send_event`], no wire traffic.
    pub async fn send_local_event<T: Serialize>(
        &self,
        name: &str,
        payload: &T,
    ) -> Result<LiveEvent<Value>, SyncError> {
        let event = self.shared.gate_and_stamp(name, payload).await?;
        dispatch(&self.shared, &event, true);
        Ok(event)
    }

    /// Stop receiving. Listeners already running finish, nothing new is
    /// delivered.
    pub fn dispose(&self) {
        self.receive_task.abort();
    }
}

impl Drop for EventScope {
    fn drop(&mut self) {
        self.receive_task.abort();
    }
}

async fn receive_loop(shared: Arc<ScopeShared>, mut events: broadcast::Receiver<TransportEvent>) {
    loop {
        let envelope = match events.recv().await {
            Ok(TransportEvent::Signal(envelope)) => envelope,
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(scope = %shared.scope_id, skipped, "event stream lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        if envelope.name != shared.scope_id {
            continue;
        }
        let Some(sender_id) = envelope.sender_id else {
            tracing::debug!(scope = %shared.scope_id, "dropping unattributable signal");
            continue;
        };
        if !shared.transport.is_connected() {
            // Signals racing a disconnect are not deliverable.
            continue;
        }
        let mut event: LiveEvent<Value> = match serde_json::from_value(envelope.content) {
            Ok(event) => event,
            Err(err) => {
                tracing::debug!(scope = %shared.scope_id, error = %err, "dropping malformed event");
                continue;
            }
        };
        // Identity comes from the transport, not the payload.
        event.client_id = sender_id.clone();
        // Localness too: the sender check decides, not the envelope's
        // echo marker.
        let local = shared
            .transport
            .client_id()
            .map_or(false, |id| id == sender_id);

        match shared
            .resolver
            .verify_roles_allowed(&sender_id, &shared.allowed_senders)
            .await
        {
            Ok(true) => dispatch(&shared, &event, local),
            Ok(false) => reject(
                &shared,
                &event,
                SyncError::RoleDenied {
                    client_id: sender_id,
                },
            ),
            Err(err) => reject(&shared, &event, err),
        }
    }
}

fn dispatch(shared: &ScopeShared, event: &LiveEvent<Value>, local: bool) {
    // Clone the handles out so listeners run without the lock held.
    let listeners: Vec<EventListener> = {
        let registered = shared.listeners.lock();
        registered
            .get(&event.name)
            .map(|entries| entries.iter().map(|entry| entry.listener.clone()).collect())
            .unwrap_or_default()
    };
    for listener in listeners {
        listener(event, local);
    }
}

fn reject(shared: &ScopeShared, event: &LiveEvent<Value>, error: SyncError) {
    if !shared.watched_names.lock().contains(&event.name) {
        tracing::debug!(
            scope = %shared.scope_id,
            event = %event.name,
            "dropping rejected event for unwatched name"
        );
        return;
    }
    tracing::warn!(
        scope = %shared.scope_id,
        event = %event.name,
        client_id = %event.client_id,
        error = %error,
        "event rejected"
    );
    let listeners: Vec<ErrorListener> = shared
        .error_listeners
        .lock()
        .iter()
        .map(|(_, listener)| listener.clone())
        .collect();
    for listener in listeners {
        listener(event, &error);
    }
}

// ── Tests ───────────────────────────────────────────────────────
