//! The transport abstraction shared by every sync strategy.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use tokio::sync::broadcast;

use super::error::SyncError;
use super::event::{EventBus, TransportEvent};
use super::protocol::DataUpdate;
use crate::ledger::{LedgerDocument, Section};
use crate::storage::LedgerStore;

/// Connection state of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Hosting,
}

impl ConnectionState {
    /// True while hosting or connected to a host.
    pub fn is_online(&self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Hosting)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Hosting => "hosting",
        };
        write!(f, "{}", s)
    }
}

/// Which transport variant to use, as named in config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Direct data channels between devices
    Peer,
    /// HTTP polling against the server's `/host` endpoint
    #[default]
    Polling,
    /// WebSocket rooms relayed by the server
    Broadcast,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportKind::Peer => "peer",
            TransportKind::Polling => "polling",
            TransportKind::Broadcast => "broadcast",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "peer" | "webrtc" => Ok(TransportKind::Peer),
            "polling" | "http" => Ok(TransportKind::Polling),
            "broadcast" | "websocket" | "ws" => Ok(TransportKind::Broadcast),
            _ => Err(format!(
                "Invalid transport '{}'. Valid options: peer, polling, broadcast",
                s
            )),
        }
    }
}

/// Replicates the ledger between a host device and its clients.
///
/// Failures to reach other devices are reported as `None`/`false` and
/// logged; the local store always remains usable.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    fn state(&self) -> ConnectionState;

    fn is_connected(&self) -> bool {
        self.state().is_online()
    }

    /// Starts hosting and returns the host id clients connect with.
    async fn start_as_host(&self) -> Option<String>;

    /// Connects to a host and replaces the local store with its snapshot.
    async fn connect_as_client(&self, host_id: &str) -> bool;

    /// Sends a whole-section replacement to every other participant.
    ///
    /// Does nothing while disconnected.
    async fn update_data(&self, section: Section, value: Value) -> Result<(), SyncError>;

    /// Tears down all links. Calling it twice is harmless.
    async fn disconnect(&self);

    /// Number of other participants currently reachable.
    fn connected_devices(&self) -> usize;

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
}

/// Writes a remote section update into the local store and announces it.
pub(crate) fn apply_update(store: &LedgerStore, events: &EventBus, update: &DataUpdate) {
    match store.save_section(update.section, &update.value) {
        Ok(()) => {
            tracing::debug!(
                "Applied {} update from {}",
                update.section,
                update.sender_id
            );
            events.emit(TransportEvent::DataChanged {
                section: update.section,
                sender_id: update.sender_id.clone(),
            });
        }
        Err(e) => {
            tracing::warn!(
                "Rejected {} update from {}: {}",
                update.section,
                update.sender_id,
                e
            );
            events.emit(TransportEvent::Error(e.to_string()));
        }
    }
}

/// Replaces the whole local store with a host snapshot and announces it.
pub(crate) fn apply_snapshot(
    store: &LedgerStore,
    events: &EventBus,
    doc: &LedgerDocument,
) -> Result<(), SyncError> {
    store.save_document(doc)?;
    events.emit(TransportEvent::SnapshotReceived);
    Ok(())
}
