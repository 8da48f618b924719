//! WebSocket transport through the server's broadcast relay.
//!
//! The host opens a room named after its host code; clients join the room
//! by that code. The server relays JSON [`RelayMessage`]s: updates go to
//! every other member, snapshots only to the member that asked.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use super::error::SyncError;
use super::event::{EventBus, TransportEvent};
use super::peer::HANDSHAKE_TIMEOUT;
use super::protocol::{generate_host_code, generate_peer_id, DataUpdate, RelayMessage, RelayRole};
use super::transport::{apply_snapshot, apply_update, ConnectionState, Transport, TransportKind};
use crate::ledger::{LedgerDocument, Section};
use crate::storage::LedgerStore;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Builds the relay URL, converting http(s) to ws(s) if needed.
pub fn build_ws_url(server_url: &str, room: &str, client_id: &str, role: RelayRole) -> String {
    let server_url = server_url.trim_end_matches('/');
    let base_url = if let Some(rest) = server_url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else if let Some(rest) = server_url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if !server_url.starts_with("ws://") && !server_url.starts_with("wss://") {
        format!("ws://{}", server_url)
    } else {
        server_url.to_string()
    };

    let role = match role {
        RelayRole::Host => "host",
        RelayRole::Client => "client",
    };

    format!(
        "{}/ws?room={}&clientId={}&role={}",
        base_url,
        urlencoding::encode(room),
        urlencoding::encode(client_id),
        role
    )
}

fn encode(msg: &RelayMessage) -> Result<Message, SyncError> {
    let text = serde_json::to_string(msg).map_err(|e| SyncError::ProtocolError(e.to_string()))?;
    Ok(Message::Text(text.into()))
}

/// Reads the next relay message, skipping non-text frames.
async fn next_message(receiver: &mut WsSource) -> Result<RelayMessage, SyncError> {
    while let Some(frame) = receiver.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                return serde_json::from_str(text.as_str())
                    .map_err(|e| SyncError::ProtocolError(e.to_string()));
            }
            Ok(Message::Close(_)) => {
                return Err(SyncError::ConnectionError(
                    "Server closed connection during handshake".to_string(),
                ));
            }
            Ok(_) => {}
            Err(e) => return Err(SyncError::WebSocketError(e.to_string())),
        }
    }
    Err(SyncError::ConnectionError(
        "Connection closed before handshake completed".to_string(),
    ))
}

/// Waits for the server's `WELCOME` and returns the room size.
async fn expect_welcome(receiver: &mut WsSource) -> Result<usize, SyncError> {
    loop {
        match next_message(receiver).await? {
            RelayMessage::Welcome { connected, .. } => return Ok(connected),
            RelayMessage::Error { message } => return Err(SyncError::Rejected(message)),
            other => tracing::debug!("Ignoring {:?} before welcome", other),
        }
    }
}

/// Waits for the host's snapshot, tracking presence changes meanwhile.
///
/// Updates relayed ahead of the snapshot are returned in arrival order so
/// they can be replayed over it; the host may have taken the snapshot
/// before applying them.
async fn expect_snapshot(
    receiver: &mut WsSource,
    members: &mut usize,
) -> Result<(LedgerDocument, Vec<DataUpdate>), SyncError> {
    let mut early = Vec::new();
    loop {
        match next_message(receiver).await? {
            RelayMessage::InitialData { data, .. } => return Ok((data, early)),
            RelayMessage::DataUpdate(update) => early.push(update),
            RelayMessage::Presence { connected } => *members = connected,
            RelayMessage::HostLeft => {
                return Err(SyncError::HostNotFound("host left the room".to_string()))
            }
            RelayMessage::Error { message } => return Err(SyncError::Rejected(message)),
            other => tracing::debug!("Ignoring {:?} before snapshot", other),
        }
    }
}

#[derive(Default)]
struct BroadcastInner {
    state: Option<ConnectionState>,
    room: Option<String>,
    local_id: Option<String>,
    members: usize,
    writer: Option<mpsc::UnboundedSender<Message>>,
    tasks: Vec<JoinHandle<()>>,
}

impl BroadcastInner {
    fn state(&self) -> ConnectionState {
        self.state.unwrap_or(ConnectionState::Disconnected)
    }
}

struct Shared {
    server_url: String,
    store: LedgerStore,
    events: EventBus,
    inner: Mutex<BroadcastInner>,
}

impl Shared {
    fn inner(&self) -> MutexGuard<'_, BroadcastInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: ConnectionState) {
        self.inner().state = Some(state);
        self.events.emit(TransportEvent::StateChanged(state));
    }

    fn reset(&self) -> Vec<JoinHandle<()>> {
        let tasks = {
            let mut inner = self.inner();
            let tasks = std::mem::take(&mut inner.tasks);
            *inner = BroadcastInner::default();
            tasks
        };
        self.events
            .emit(TransportEvent::StateChanged(ConnectionState::Disconnected));
        tasks
    }

    fn send(&self, msg: &RelayMessage) -> Result<(), SyncError> {
        let frame = encode(msg)?;
        let writer = self
            .inner()
            .writer
            .clone()
            .ok_or_else(|| SyncError::ConnectionError("Not connected to relay".to_string()))?;
        writer
            .send(frame)
            .map_err(|_| SyncError::ConnectionError("Relay connection closed".to_string()))
    }

    /// Handles one relayed message. Returns false when the session is over.
    fn handle(&self, msg: RelayMessage) -> bool {
        let (state, local_id) = {
            let inner = self.inner();
            (inner.state(), inner.local_id.clone())
        };

        match msg {
            RelayMessage::Welcome { connected, .. } | RelayMessage::Presence { connected } => {
                self.inner().members = connected;
                tracing::debug!("Room now has {} member(s)", connected);
            }
            RelayMessage::RequestInitialData { sender_id } => {
                if state != ConnectionState::Hosting {
                    return true;
                }
                let reply = RelayMessage::InitialData {
                    target_id: sender_id.clone(),
                    data: self.store.load(),
                };
                match self.send(&reply) {
                    Ok(()) => self.events.emit(TransportEvent::PeerJoined { peer_id: sender_id }),
                    Err(e) => tracing::warn!("Failed to send snapshot to {}: {}", sender_id, e),
                }
            }
            RelayMessage::InitialData { data, .. } => {
                if let Err(e) = apply_snapshot(&self.store, &self.events, &data) {
                    tracing::warn!("Failed to apply snapshot: {}", e);
                }
            }
            RelayMessage::DataUpdate(update) => {
                if local_id.as_deref() != Some(update.sender_id.as_str()) {
                    apply_update(&self.store, &self.events, &update);
                }
            }
            RelayMessage::HostLeft => {
                if state != ConnectionState::Hosting {
                    tracing::info!("Host left the room");
                    let room = self.inner().room.clone().unwrap_or_default();
                    self.events.emit(TransportEvent::PeerLeft { peer_id: room });
                    drop(self.reset());
                    return false;
                }
            }
            RelayMessage::Error { message } => {
                tracing::warn!("Relay error: {}", message);
                self.events.emit(TransportEvent::Error(message));
            }
        }
        true
    }
}

async fn read_loop(shared: Arc<Shared>, mut receiver: WsSource) {
    while let Some(frame) = receiver.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<RelayMessage>(text.as_str()) {
                Ok(msg) => {
                    if !shared.handle(msg) {
                        return;
                    }
                }
                Err(e) => tracing::warn!("Dropping malformed relay message: {}", e),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("Relay connection error: {}", e);
                break;
            }
        }
    }

    if shared.inner().state().is_online() {
        shared
            .events
            .emit(TransportEvent::Error("Connection to relay lost".to_string()));
        drop(shared.reset());
    }
}

async fn write_loop(mut sink: WsSink, mut rx: mpsc::UnboundedReceiver<Message>) {
    while let Some(frame) = rx.recv().await {
        let closing = matches!(frame, Message::Close(_));
        if let Err(e) = sink.send(frame).await {
            tracing::debug!("Relay write failed: {}", e);
            break;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
}

/// Transport over a WebSocket room on the server's relay.
pub struct BroadcastTransport {
    shared: Arc<Shared>,
    handshake_timeout: Duration,
}

impl BroadcastTransport {
    pub fn new(server_url: impl Into<String>, store: LedgerStore) -> Self {
        Self {
            shared: Arc::new(Shared {
                server_url: server_url.into(),
                store,
                events: EventBus::new(),
                inner: Mutex::new(BroadcastInner::default()),
            }),
            handshake_timeout: HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
        self.handshake_timeout = handshake_timeout;
        self
    }

    async fn open(&self, room: &str, client_id: &str, role: RelayRole) -> Result<WsStream, SyncError> {
        let url = build_ws_url(&self.shared.server_url, room, client_id, role);
        let (ws_stream, _) = connect_async(&url)
            .await
            .map_err(|e| SyncError::ConnectionError(e.to_string()))?;
        Ok(ws_stream)
    }

    async fn host(&self) -> Result<(String, WsSink, WsSource, usize), SyncError> {
        let device_id = self.shared.store.device_id()?;
        let room = generate_host_code(&device_id);

        let (sink, mut source) = self.open(&room, &room, RelayRole::Host).await?.split();
        let members = expect_welcome(&mut source).await?;
        Ok((room, sink, source, members))
    }

    async fn join(
        &self,
        room: &str,
        client_id: &str,
    ) -> Result<(WsSink, WsSource, usize), SyncError> {
        let (mut sink, mut source) = self.open(room, client_id, RelayRole::Client).await?.split();
        let mut members = expect_welcome(&mut source).await?;

        let request = encode(&RelayMessage::RequestInitialData {
            sender_id: client_id.to_string(),
        })?;
        sink.send(request)
            .await
            .map_err(|e| SyncError::WebSocketError(e.to_string()))?;

        let (doc, early) = expect_snapshot(&mut source, &mut members).await?;
        apply_snapshot(&self.shared.store, &self.shared.events, &doc)?;
        if !early.is_empty() {
            tracing::debug!("Replaying {} update(s) relayed before the snapshot", early.len());
        }
        for update in &early {
            apply_update(&self.shared.store, &self.shared.events, update);
        }
        Ok((sink, source, members))
    }

    fn attach(&self, room: String, local_id: String, sink: WsSink, source: WsSource, members: usize) {
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_loop(sink, rx));
        let reader = tokio::spawn(read_loop(self.shared.clone(), source));

        let mut inner = self.shared.inner();
        inner.room = Some(room);
        inner.local_id = Some(local_id);
        inner.members = members;
        inner.writer = Some(tx);
        inner.tasks = vec![writer, reader];
    }
}

#[async_trait]
impl Transport for BroadcastTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Broadcast
    }

    fn state(&self) -> ConnectionState {
        self.shared.inner().state()
    }

    async fn start_as_host(&self) -> Option<String> {
        match self.state() {
            ConnectionState::Hosting => return self.shared.inner().room.clone(),
            ConnectionState::Disconnected => {}
            _ => self.disconnect().await,
        }

        match timeout(self.handshake_timeout, self.host()).await {
            Ok(Ok((room, sink, source, members))) => {
                self.attach(room.clone(), room.clone(), sink, source, members);
                self.shared.set_state(ConnectionState::Hosting);
                tracing::info!("Hosting room {}", room);
                Some(room)
            }
            Ok(Err(e)) => {
                tracing::warn!("Failed to open room: {}", e);
                self.shared.events.emit(TransportEvent::Error(e.to_string()));
                None
            }
            Err(_) => {
                let e = SyncError::HandshakeTimeout;
                tracing::warn!("Failed to open room: {}", e);
                self.shared.events.emit(TransportEvent::Error(e.to_string()));
                None
            }
        }
    }

    async fn connect_as_client(&self, host_id: &str) -> bool {
        if self.state() != ConnectionState::Disconnected {
            self.disconnect().await;
        }
        self.shared.set_state(ConnectionState::Connecting);

        let client_id = generate_peer_id();
        let result = match timeout(self.handshake_timeout, self.join(host_id, &client_id)).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::HandshakeTimeout),
        };

        match result {
            Ok((sink, source, members)) => {
                self.attach(host_id.to_string(), client_id, sink, source, members);
                self.shared.set_state(ConnectionState::Connected);
                tracing::info!("Joined room {}", host_id);
                true
            }
            Err(e) => {
                tracing::warn!("Failed to join room {}: {}", host_id, e);
                self.shared.events.emit(TransportEvent::Error(e.to_string()));
                drop(self.shared.reset());
                false
            }
        }
    }

    async fn update_data(&self, section: Section, value: Value) -> Result<(), SyncError> {
        let local_id = {
            let inner = self.shared.inner();
            if !inner.state().is_online() {
                return Ok(());
            }
            inner.local_id.clone().unwrap_or_default()
        };

        self.shared
            .send(&RelayMessage::DataUpdate(DataUpdate::new(section, value, local_id)))
    }

    async fn disconnect(&self) {
        let writer = {
            let inner = self.shared.inner();
            if inner.state.is_none() && inner.tasks.is_empty() {
                return;
            }
            inner.writer.clone()
        };

        let mut tasks = self.shared.reset();
        if let Some(writer) = writer {
            if writer.send(Message::Close(None)).is_ok() {
                // Let the writer flush the close frame before tearing down.
                if !tasks.is_empty() {
                    let writer_task = tasks.remove(0);
                    let _ = timeout(Duration::from_millis(500), writer_task).await;
                }
            }
        }
        for task in tasks {
            task.abort();
        }
        tracing::info!("Broadcast transport disconnected");
    }

    fn connected_devices(&self) -> usize {
        let inner = self.shared.inner();
        if inner.state().is_online() {
            inner.members.saturating_sub(1)
        } else {
            0
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.shared.events.subscribe()
    }
}

impl Drop for BroadcastTransport {
    fn drop(&mut self) {
        for task in std::mem::take(&mut self.shared.inner().tasks) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Player;
    use tokio::net::TcpListener;

    /// Serves one relay session: welcomes the client, waits for its
    /// snapshot request, then sends `before` ahead of the snapshot.
    async fn scripted_relay(before: Vec<RelayMessage>, snapshot: LedgerDocument) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let (mut sink, mut source) = ws.split();
            let welcome = RelayMessage::Welcome {
                room: "ROOM".to_string(),
                client_id: "c1".to_string(),
                connected: 2,
            };
            sink.send(encode(&welcome).unwrap()).await.unwrap();

            let frame = source.next().await.unwrap().unwrap();
            let request: RelayMessage = serde_json::from_str(frame.to_text().unwrap()).unwrap();
            let RelayMessage::RequestInitialData { sender_id } = request else {
                panic!("expected snapshot request, got {:?}", request);
            };
            for msg in &before {
                sink.send(encode(msg).unwrap()).await.unwrap();
            }
            let reply = RelayMessage::InitialData {
                target_id: sender_id,
                data: snapshot,
            };
            sink.send(encode(&reply).unwrap()).await.unwrap();
            // Hold the socket open until the client leaves.
            while source.next().await.is_some() {}
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_updates_relayed_before_snapshot_are_replayed() {
        let players = vec![Player::new("Sato").with_id("p1")];
        let update = DataUpdate::new(
            Section::Players,
            serde_json::to_value(&players).unwrap(),
            "other-client",
        );
        let url = scripted_relay(
            vec![RelayMessage::DataUpdate(update)],
            LedgerDocument::new(),
        )
        .await;

        let store = LedgerStore::memory();
        let client = BroadcastTransport::new(url, store.clone());
        assert!(client.connect_as_client("ROOM").await);

        assert_eq!(store.load().players, players);
        assert_eq!(client.connected_devices(), 1);
        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_host_handshake_timeout_emits_error() {
        // Accepts TCP but never answers the upgrade.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let transport = BroadcastTransport::new(url, LedgerStore::memory())
            .with_handshake_timeout(Duration::from_millis(100));
        let mut events = transport.subscribe();

        assert!(transport.start_as_host().await.is_none());
        assert_eq!(
            events.try_recv().unwrap(),
            TransportEvent::Error(SyncError::HandshakeTimeout.to_string())
        );
        drop(listener);
    }

    #[test]
    fn test_build_ws_url_with_http() {
        let url = build_ws_url("http://localhost:3000", "ROOM1", "c1", RelayRole::Client);
        assert_eq!(url, "ws://localhost:3000/ws?room=ROOM1&clientId=c1&role=client");
    }

    #[test]
    fn test_build_ws_url_with_https() {
        let url = build_ws_url("https://club.example.com/", "R", "h", RelayRole::Host);
        assert_eq!(url, "wss://club.example.com/ws?room=R&clientId=h&role=host");
    }

    #[test]
    fn test_build_ws_url_bare_host_and_escaping() {
        let url = build_ws_url("localhost:3000", "a b", "c&d", RelayRole::Client);
        assert_eq!(url, "ws://localhost:3000/ws?room=a%20b&clientId=c%26d&role=client");
    }

    #[tokio::test]
    async fn test_update_data_while_disconnected_is_noop() {
        let transport = BroadcastTransport::new("http://127.0.0.1:1", LedgerStore::memory());
        assert!(transport
            .update_data(Section::Players, serde_json::json!([]))
            .await
            .is_ok());
        assert_eq!(transport.connected_devices(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_relay_fails_cleanly() {
        let transport = BroadcastTransport::new("http://127.0.0.1:1", LedgerStore::memory());

        assert!(transport.start_as_host().await.is_none());
        assert!(!transport.connect_as_client("ROOM").await);
        assert_eq!(transport.state(), ConnectionState::Disconnected);

        transport.disconnect().await;
        assert!(!transport.is_connected());
    }
}
