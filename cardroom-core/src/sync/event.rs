//! Typed transport events.

use tokio::sync::broadcast;

use super::transport::ConnectionState;
use crate::ledger::Section;

/// Capacity of each transport's event channel. Slow subscribers lag and
/// skip events rather than blocking the transport.
const EVENT_BUFFER: usize = 64;

/// Something that happened on a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    StateChanged(ConnectionState),
    PeerJoined { peer_id: String },
    PeerLeft { peer_id: String },
    /// The local store was replaced with a full snapshot from the host
    SnapshotReceived,
    /// One section of the local store was overwritten by a remote update
    DataChanged { section: Section, sender_id: String },
    Error(String),
}

/// Fan-out channel for [`TransportEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<TransportEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        Self { tx }
    }

    /// Publishes an event. Having no subscribers is fine.
    pub fn emit(&self, event: TransportEvent) {
        tracing::trace!("Transport event: {:?}", event);
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
