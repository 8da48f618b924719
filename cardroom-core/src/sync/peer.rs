//! Direct device-to-device transport.
//!
//! Devices exchange CBOR-encoded [`PeerMessage`] frames over data channels.
//! A [`PeerNetwork`] plays the role of the signaling broker: it maps peer
//! ids to the receiving end of each device's channel, so a client only
//! needs the host's id to reach it.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use super::error::SyncError;
use super::event::{EventBus, TransportEvent};
use super::protocol::{generate_host_code, generate_peer_id, DataUpdate, PeerMessage};
use super::transport::{apply_snapshot, apply_update, ConnectionState, Transport, TransportKind};
use crate::ledger::Section;
use crate::storage::LedgerStore;

/// Default wait for the host's snapshot after connecting.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
struct Envelope {
    from: String,
    frame: Vec<u8>,
}

/// Registry of reachable peers, keyed by peer id.
#[derive(Debug, Clone, Default)]
pub struct PeerNetwork {
    peers: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Envelope>>>>,
}

impl PeerNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn peers(&self) -> MutexGuard<'_, HashMap<String, mpsc::UnboundedSender<Envelope>>> {
        self.peers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn register(&self, peer_id: &str) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.peers().insert(peer_id.to_string(), tx);
        rx
    }

    fn unregister(&self, peer_id: &str) {
        self.peers().remove(peer_id);
    }

    fn send(&self, from: &str, to: &str, msg: &PeerMessage) -> Result<(), SyncError> {
        let frame = msg.encode().map_err(|e| SyncError::CborError(e.to_string()))?;
        let peers = self.peers();
        let tx = peers
            .get(to)
            .ok_or_else(|| SyncError::HostNotFound(to.to_string()))?;
        tx.send(Envelope {
            from: from.to_string(),
            frame,
        })
        .map_err(|_| SyncError::ConnectionError(format!("Channel to {} is closed", to)))
    }

    pub fn is_registered(&self, peer_id: &str) -> bool {
        self.peers().contains_key(peer_id)
    }

    /// Number of registered peers.
    pub fn len(&self) -> usize {
        self.peers().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Default)]
struct PeerInner {
    state: Option<ConnectionState>,
    local_id: Option<String>,
    host_id: Option<String>,
    links: HashSet<String>,
    task: Option<JoinHandle<()>>,
    /// Resolved once the host snapshot has been written to the store.
    pending_snapshot: Option<oneshot::Sender<Result<(), SyncError>>>,
}

impl PeerInner {
    fn state(&self) -> ConnectionState {
        self.state.unwrap_or(ConnectionState::Disconnected)
    }
}

struct Shared {
    network: PeerNetwork,
    store: LedgerStore,
    events: EventBus,
    inner: Mutex<PeerInner>,
}

impl Shared {
    fn inner(&self) -> MutexGuard<'_, PeerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: ConnectionState) {
        self.inner().state = Some(state);
        self.events.emit(TransportEvent::StateChanged(state));
    }

    /// Drops every link and unregisters from the network. Returns the
    /// receive task so the caller can decide whether to abort it.
    fn reset(&self) -> Option<JoinHandle<()>> {
        let (local_id, task) = {
            let mut inner = self.inner();
            let local_id = inner.local_id.take();
            let task = inner.task.take();
            *inner = PeerInner::default();
            (local_id, task)
        };

        if let Some(id) = local_id {
            self.network.unregister(&id);
        }
        self.events
            .emit(TransportEvent::StateChanged(ConnectionState::Disconnected));
        task
    }

    /// Handles one incoming frame. Returns false when the receive loop
    /// should stop.
    fn handle(&self, envelope: Envelope) -> bool {
        let msg = match PeerMessage::decode(&envelope.frame) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!("Dropping undecodable frame from {}: {}", envelope.from, e);
                return true;
            }
        };

        let (state, local_id, host_id) = {
            let inner = self.inner();
            (inner.state(), inner.local_id.clone(), inner.host_id.clone())
        };
        let Some(local_id) = local_id else {
            return false;
        };
        let hosting = state == ConnectionState::Hosting;

        match msg {
            PeerMessage::Hello { sender_id } => {
                if hosting && self.inner().links.insert(envelope.from.clone()) {
                    tracing::info!("Peer {} joined", sender_id);
                    self.events.emit(TransportEvent::PeerJoined {
                        peer_id: envelope.from,
                    });
                }
            }
            PeerMessage::RequestInitialData { sender_id } => {
                if !hosting {
                    return true;
                }
                self.inner().links.insert(envelope.from.clone());
                let reply = PeerMessage::InitialData {
                    data: self.store.load(),
                };
                if let Err(e) = self.network.send(&local_id, &envelope.from, &reply) {
                    tracing::warn!("Failed to send snapshot to {}: {}", sender_id, e);
                }
            }
            PeerMessage::InitialData { data } => {
                // Applied here so it lands in arrival order with the updates
                // queued behind it.
                let result = apply_snapshot(&self.store, &self.events, &data);
                let pending = self.inner().pending_snapshot.take();
                match pending {
                    Some(tx) => {
                        let _ = tx.send(result);
                    }
                    None => {
                        if let Err(e) = result {
                            tracing::warn!("Failed to apply snapshot: {}", e);
                        }
                    }
                }
            }
            PeerMessage::DataUpdate(update) => {
                apply_update(&self.store, &self.events, &update);

                if hosting {
                    let targets: Vec<String> = self
                        .inner()
                        .links
                        .iter()
                        .filter(|id| **id != envelope.from)
                        .cloned()
                        .collect();
                    let forward = PeerMessage::DataUpdate(update);
                    for target in targets {
                        if let Err(e) = self.network.send(&local_id, &target, &forward) {
                            tracing::warn!("Failed to forward update to {}: {}", target, e);
                        }
                    }
                }
            }
            PeerMessage::Goodbye { sender_id } => {
                if hosting {
                    if self.inner().links.remove(&envelope.from) {
                        tracing::info!("Peer {} left", sender_id);
                        self.events.emit(TransportEvent::PeerLeft {
                            peer_id: envelope.from,
                        });
                    }
                } else if host_id.as_deref() == Some(envelope.from.as_str()) {
                    tracing::info!("Host {} closed the session", envelope.from);
                    self.events.emit(TransportEvent::PeerLeft {
                        peer_id: envelope.from,
                    });
                    // Dropping the handle detaches this task; the loop ends below.
                    drop(self.reset());
                    return false;
                }
            }
        }

        true
    }
}

async fn receive_loop(shared: Arc<Shared>, mut rx: mpsc::UnboundedReceiver<Envelope>) {
    while let Some(envelope) = rx.recv().await {
        if !shared.handle(envelope) {
            break;
        }
    }
}

/// Transport over direct peer data channels.
pub struct PeerTransport {
    shared: Arc<Shared>,
    handshake_timeout: Duration,
}

impl PeerTransport {
    pub fn new(network: PeerNetwork, store: LedgerStore) -> Self {
        Self {
            shared: Arc::new(Shared {
                network,
                store,
                events: EventBus::new(),
                inner: Mutex::new(PeerInner::default()),
            }),
            handshake_timeout: HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
        self.handshake_timeout = handshake_timeout;
        self
    }

    /// This device's id on the peer network, while online.
    pub fn local_id(&self) -> Option<String> {
        self.shared.inner().local_id.clone()
    }

    fn listen(&self, peer_id: &str) {
        let rx = self.shared.network.register(peer_id);
        let task = tokio::spawn(receive_loop(self.shared.clone(), rx));
        let mut inner = self.shared.inner();
        inner.local_id = Some(peer_id.to_string());
        inner.task = Some(task);
    }

    /// Greets the host and waits until its snapshot has been applied.
    async fn handshake(&self, host_id: &str) -> Result<(), SyncError> {
        if !self.shared.network.is_registered(host_id) {
            return Err(SyncError::HostNotFound(host_id.to_string()));
        }

        let peer_id = generate_peer_id();
        let (snapshot_tx, snapshot_rx) = oneshot::channel();
        {
            let mut inner = self.shared.inner();
            inner.host_id = Some(host_id.to_string());
            inner.pending_snapshot = Some(snapshot_tx);
        }
        self.listen(&peer_id);

        let network = &self.shared.network;
        network.send(
            &peer_id,
            host_id,
            &PeerMessage::Hello {
                sender_id: peer_id.clone(),
            },
        )?;
        network.send(
            &peer_id,
            host_id,
            &PeerMessage::RequestInitialData {
                sender_id: peer_id.clone(),
            },
        )?;

        match timeout(self.handshake_timeout, snapshot_rx).await {
            Ok(Ok(applied)) => applied,
            Ok(Err(_)) => Err(SyncError::ConnectionError(
                "Host closed the channel before sending data".to_string(),
            )),
            Err(_) => Err(SyncError::HandshakeTimeout),
        }
    }
}

#[async_trait]
impl Transport for PeerTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Peer
    }

    fn state(&self) -> ConnectionState {
        self.shared.inner().state()
    }

    async fn start_as_host(&self) -> Option<String> {
        let state = self.state();
        if state == ConnectionState::Hosting {
            return self.local_id();
        }
        if state != ConnectionState::Disconnected {
            self.disconnect().await;
        }

        let device_id = match self.shared.store.device_id() {
            Ok(id) => id,
            Err(e) => {
                tracing::error!("Cannot start host: {}", e);
                return None;
            }
        };

        let host_id = generate_host_code(&device_id);
        self.listen(&host_id);
        self.shared.set_state(ConnectionState::Hosting);

        tracing::info!("Hosting as {}", host_id);
        Some(host_id)
    }

    async fn connect_as_client(&self, host_id: &str) -> bool {
        if self.state() != ConnectionState::Disconnected {
            self.disconnect().await;
        }
        self.shared.set_state(ConnectionState::Connecting);

        match self.handshake(host_id).await {
            Ok(()) => {
                self.shared.inner().links.insert(host_id.to_string());
                self.shared.set_state(ConnectionState::Connected);
                tracing::info!("Connected to host {}", host_id);
                true
            }
            Err(e) => {
                tracing::warn!("Failed to connect to host {}: {}", host_id, e);
                self.shared.events.emit(TransportEvent::Error(e.to_string()));
                if let Some(task) = self.shared.reset() {
                    task.abort();
                }
                false
            }
        }
    }

    async fn update_data(&self, section: Section, value: Value) -> Result<(), SyncError> {
        let (local_id, targets) = {
            let inner = self.shared.inner();
            if !inner.state().is_online() {
                return Ok(());
            }
            let Some(local_id) = inner.local_id.clone() else {
                return Ok(());
            };
            (local_id, inner.links.iter().cloned().collect::<Vec<_>>())
        };

        let msg = PeerMessage::DataUpdate(DataUpdate::new(section, value, local_id.clone()));
        for target in targets {
            if let Err(e) = self.shared.network.send(&local_id, &target, &msg) {
                tracing::warn!("Failed to send {} update to {}: {}", section, target, e);
            }
        }
        Ok(())
    }

    async fn disconnect(&self) {
        let (local_id, targets) = {
            let inner = self.shared.inner();
            if inner.state.is_none() && inner.local_id.is_none() {
                return;
            }
            (
                inner.local_id.clone(),
                inner.links.iter().cloned().collect::<Vec<_>>(),
            )
        };

        if let Some(local_id) = local_id {
            let goodbye = PeerMessage::Goodbye {
                sender_id: local_id.clone(),
            };
            for target in targets {
                let _ = self.shared.network.send(&local_id, &target, &goodbye);
            }
        }

        if let Some(task) = self.shared.reset() {
            task.abort();
        }
        tracing::info!("Peer transport disconnected");
    }

    fn connected_devices(&self) -> usize {
        let inner = self.shared.inner();
        if inner.state().is_online() {
            inner.links.len()
        } else {
            0
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.shared.events.subscribe()
    }
}

impl Drop for PeerTransport {
    fn drop(&mut self) {
        if let Some(task) = self.shared.reset() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::LedgerDocument;
    use crate::models::Player;

    async fn wait_for<F>(rx: &mut broadcast::Receiver<TransportEvent>, mut pred: F)
    where
        F: FnMut(&TransportEvent) -> bool,
    {
        timeout(Duration::from_secs(2), async {
            loop {
                let event = rx.recv().await.unwrap();
                if pred(&event) {
                    return;
                }
            }
        })
        .await
        .expect("event not received");
    }

    fn host_store() -> LedgerStore {
        let store = LedgerStore::memory();
        let mut doc = LedgerDocument::new();
        let player = doc.add_player("Tanaka").unwrap().value;
        doc.buy_in(&player.id, 5000).unwrap();
        store.save_document(&doc).unwrap();
        store
    }

    #[tokio::test]
    async fn test_client_receives_host_snapshot() {
        let network = PeerNetwork::new();
        let host = PeerTransport::new(network.clone(), host_store());
        let client_store = LedgerStore::memory();
        let client = PeerTransport::new(network.clone(), client_store.clone());

        let host_id = host.start_as_host().await.unwrap();
        assert_eq!(host.state(), ConnectionState::Hosting);

        assert!(client.connect_as_client(&host_id).await);
        assert_eq!(client.state(), ConnectionState::Connected);
        assert!(client.is_connected());
        assert_eq!(client_store.load(), host.shared.store.load());
        assert_eq!(host.connected_devices(), 1);
        assert_eq!(client.connected_devices(), 1);
    }

    #[tokio::test]
    async fn test_client_update_reaches_host_and_other_clients() {
        let network = PeerNetwork::new();
        let host_store = LedgerStore::memory();
        let host = PeerTransport::new(network.clone(), host_store.clone());
        let a = PeerTransport::new(network.clone(), LedgerStore::memory());
        let b_store = LedgerStore::memory();
        let b = PeerTransport::new(network.clone(), b_store.clone());

        let host_id = host.start_as_host().await.unwrap();
        assert!(a.connect_as_client(&host_id).await);
        assert!(b.connect_as_client(&host_id).await);

        let mut host_events = host.subscribe();
        let mut b_events = b.subscribe();

        let players = vec![Player::new("Sato").with_id("p9")];
        a.update_data(Section::Players, serde_json::to_value(&players).unwrap())
            .await
            .unwrap();

        wait_for(&mut host_events, |e| {
            matches!(e, TransportEvent::DataChanged { section: Section::Players, .. })
        })
        .await;
        wait_for(&mut b_events, |e| {
            matches!(e, TransportEvent::DataChanged { section: Section::Players, .. })
        })
        .await;

        assert_eq!(host_store.load().players, players);
        assert_eq!(b_store.load().players, players);
    }

    #[tokio::test]
    async fn test_join_during_concurrent_update_matches_host() {
        for round in 0..20 {
            let network = PeerNetwork::new();
            let host_store = LedgerStore::memory();
            let host = PeerTransport::new(network.clone(), host_store.clone());
            let a = PeerTransport::new(network.clone(), LedgerStore::memory());
            let b_store = LedgerStore::memory();
            let b = PeerTransport::new(network.clone(), b_store.clone());

            let host_id = host.start_as_host().await.unwrap();
            assert!(a.connect_as_client(&host_id).await);

            let players = vec![Player::new("Sato").with_id(format!("p{}", round))];
            let (joined, sent) = tokio::join!(
                b.connect_as_client(&host_id),
                a.update_data(Section::Players, serde_json::to_value(&players).unwrap())
            );
            assert!(joined);
            sent.unwrap();

            timeout(Duration::from_secs(2), async {
                while host_store.load().players != players || b_store.load() != host_store.load() {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await
            .unwrap_or_else(|_| panic!("replicas diverged in round {}", round));
        }
    }

    #[tokio::test]
    async fn test_connect_to_unknown_host_fails() {
        let network = PeerNetwork::new();
        let client = PeerTransport::new(network.clone(), LedgerStore::memory());

        assert!(!client.connect_as_client("nobody").await);
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(network.is_empty());
    }

    #[tokio::test]
    async fn test_handshake_timeout_when_host_is_silent() {
        let network = PeerNetwork::new();
        // Registered but nobody reads the channel.
        let _silent = network.register("silent-host");
        let client = PeerTransport::new(network.clone(), LedgerStore::memory())
            .with_handshake_timeout(Duration::from_millis(50));

        assert!(!client.connect_as_client("silent-host").await);
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_update_data_while_disconnected_is_noop() {
        let store = LedgerStore::memory();
        let transport = PeerTransport::new(PeerNetwork::new(), store.clone());

        let result = transport
            .update_data(Section::Players, serde_json::json!([]))
            .await;

        assert!(result.is_ok());
        assert!(!transport.is_connected());
        assert_eq!(transport.connected_devices(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let network = PeerNetwork::new();
        let host = PeerTransport::new(network.clone(), LedgerStore::memory());
        host.start_as_host().await.unwrap();

        host.disconnect().await;
        host.disconnect().await;

        assert_eq!(host.state(), ConnectionState::Disconnected);
        assert!(!host.is_connected());
        assert!(network.is_empty());
    }

    #[tokio::test]
    async fn test_host_goodbye_disconnects_client() {
        let network = PeerNetwork::new();
        let host = PeerTransport::new(network.clone(), LedgerStore::memory());
        let client = PeerTransport::new(network.clone(), LedgerStore::memory());

        let host_id = host.start_as_host().await.unwrap();
        assert!(client.connect_as_client(&host_id).await);
        let mut events = client.subscribe();

        host.disconnect().await;

        wait_for(&mut events, |e| {
            *e == TransportEvent::StateChanged(ConnectionState::Disconnected)
        })
        .await;
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_client_goodbye_removes_link() {
        let network = PeerNetwork::new();
        let host = PeerTransport::new(network.clone(), LedgerStore::memory());
        let client = PeerTransport::new(network.clone(), LedgerStore::memory());

        let host_id = host.start_as_host().await.unwrap();
        assert!(client.connect_as_client(&host_id).await);
        let mut events = host.subscribe();

        client.disconnect().await;

        wait_for(&mut events, |e| matches!(e, TransportEvent::PeerLeft { .. })).await;
        assert_eq!(host.connected_devices(), 0);
        assert!(host.is_connected());
    }
}
