//! Transport seam between sessions and the wire.
//!
//! ## Design
//! - [`SignalTransport`] is the narrow seam a real backend implements:
//!   a connectivity watch, a broadcast event stream, and `submit`.
//! - [`LoopbackHub`] is the in-process implementation: every attached
//!   transport fans out to every connected one, the sender included
//!   (marked `local_echo`). It backs single-machine sessions and tests.
//! - Producers never await consumers. Events ride a broadcast channel,
//!   so a slow consumer observes `Lagged` rather than exerting
//!   backpressure on the wire.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, watch};

use crate::error::SyncError;

/// Buffered events per attached transport before `Lagged` kicks in.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Connection state as seen through the connectivity watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Connectivity {
    Disconnected,
    Connected { client_id: String },
}

/// One named signal crossing the transport.
#[derive(Debug, Clone)]
pub struct SignalEnvelope {
    /// Authenticated sender, stamped by the transport. `None` means the
    /// transport could not attribute the signal.
    pub sender_id: Option<String>,
    pub name: String,
    pub content: Value,
    /// True on the copy delivered back to the sender itself.
    pub local_echo: bool,
}

/// Everything a transport can deliver.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Signal(SignalEnvelope),
    PeerJoined { client_id: String },
    PeerLeft { client_id: String },
}

/// The seam a signaling backend implements.
#[async_trait]
pub trait SignalTransport: Send + Sync {
    /// Watch over the connection state.
    fn connectivity(&self) -> watch::Receiver<Connectivity>;

    /// Subscribe to the event stream. Only events sent after the call
    /// are observed.
    fn events(&self) -> broadcast::Receiver<TransportEvent>;

    /// Send a named signal to every connected peer, self included.
    async fn submit(&self, name: &str, content: Value) -> Result<(), SyncError>;

    /// Client id granted by the backend, once connected.
    fn client_id(&self) -> Option<String> {
        match &*self.connectivity().borrow() {
            Connectivity::Connected { client_id } => Some(client_id.clone()),
            Connectivity::Disconnected => None,
        }
    }

    fn is_connected(&self) -> bool {
        matches!(&*self.connectivity().borrow(), Connectivity::Connected { .. })
    }

    /// Resolve with the client id once the transport is connected.
    async fn wait_for_connect(&self) -> Result<String, SyncError> {
        let mut connectivity = self.connectivity();
        loop {
            let connected = match &*connectivity.borrow() {
                Connectivity::Connected { client_id } => Some(client_id.clone()),
                Connectivity::Disconnected => None,
            };
            if let Some(client_id) = connected {
                return Ok(client_id);
            }
            connectivity
                .changed()
                .await
                .map_err(|_| SyncError::TransportClosed)?;
        }
    }
}

struct PeerChannels {
    events: broadcast::Sender<TransportEvent>,
    connected: bool,
}

/// In-process signaling backend. Peers attach, connect, and every
/// submitted signal fans out to all connected peers.
pub struct LoopbackHub {
    peers: Mutex<HashMap<String, PeerChannels>>,
}

impl LoopbackHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            peers: Mutex::new(HashMap::new()),
        })
    }

    /// Create a transport for `client_id` attached to this hub. The new
    /// transport starts disconnected.
    pub fn attach(self: &Arc<Self>, client_id: &str) -> LoopbackTransport {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (connectivity, _) = watch::channel(Connectivity::Disconnected);
        self.peers.lock().insert(
            client_id.to_string(),
            PeerChannels {
                events: events.clone(),
                connected: false,
            },
        );
        LoopbackTransport {
            hub: self.clone(),
            local_id: client_id.to_string(),
            events,
            connectivity,
        }
    }

    fn set_connected(&self, client_id: &str, connected: bool) {
        let mut peers = self.peers.lock();
        if let Some(peer) = peers.get_mut(client_id) {
            peer.connected = connected;
        }
        let notice = if connected {
            TransportEvent::PeerJoined {
                client_id: client_id.to_string(),
            }
        } else {
            TransportEvent::PeerLeft {
                client_id: client_id.to_string(),
            }
        };
        for (peer_id, peer) in peers.iter() {
            if peer_id == client_id || !peer.connected {
                continue;
            }
            let _ = peer.events.send(notice.clone());
        }
    }

    fn fan_out(&self, sender_id: &str, name: &str, content: Value) {
        let peers = self.peers.lock();
        for (peer_id, peer) in peers.iter() {
            if !peer.connected {
                continue;
            }
            let envelope = SignalEnvelope {
                sender_id: Some(sender_id.to_string()),
                name: name.to_string(),
                content: content.clone(),
                local_echo: peer_id == sender_id,
            };
            let _ = peer.events.send(TransportEvent::Signal(envelope));
        }
    }
}

/// One peer's handle on a [`LoopbackHub`].
pub struct LoopbackTransport {
    hub: Arc<LoopbackHub>,
    local_id: String,
    events: broadcast::Sender<TransportEvent>,
    connectivity: watch::Sender<Connectivity>,
}

impl LoopbackTransport {
    pub fn connect(&self) {
        self.connectivity.send_replace(Connectivity::Connected {
            client_id: self.local_id.clone(),
        });
        self.hub.set_connected(&self.local_id, true);
        tracing::debug!(client_id = %self.local_id, "transport connected");
    }

    pub fn disconnect(&self) {
        self.connectivity.send_replace(Connectivity::Disconnected);
        self.hub.set_connected(&self.local_id, false);
        tracing::debug!(client_id = %self.local_id, "transport disconnected");
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Deliver a raw envelope to this transport's own event stream,
    /// bypassing the hub. Lets tests shape arbitrary incoming traffic.
    pub fn inject(&self, envelope: SignalEnvelope) {
        let _ = self.events.send(TransportEvent::Signal(envelope));
    }
}

#[async_trait]
impl SignalTransport for LoopbackTransport {
    fn connectivity(&self) -> watch::Receiver<Connectivity> {
        self.connectivity.subscribe()
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    async fn submit(&self, name: &str, content: Value) -> Result<(), SyncError> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        self.hub.fan_out(&self.local_id, name, content);
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────
