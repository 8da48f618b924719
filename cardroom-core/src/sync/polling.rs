//! HTTP polling transport against the server's `/host` endpoint.
//!
//! The server keeps the host's current snapshot and a version counter.
//! Every participant posts its updates there and polls
//! `GET /host?action=status`; a higher version means someone else wrote,
//! and the local store is replaced with the server's snapshot.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use super::error::SyncError;
use super::event::{EventBus, TransportEvent};
use super::peer::HANDSHAKE_TIMEOUT;
use super::protocol::{generate_peer_id, DataUpdate, HostAction, HostRequest, HostResponse, HostStatus};
use super::transport::{apply_snapshot, ConnectionState, Transport, TransportKind};
use crate::ledger::{LedgerDocument, Section};
use crate::storage::LedgerStore;

/// Default time between status polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HostInfo {
    host_id: String,
    #[serde(default)]
    connected_clients: usize,
}

#[derive(Default)]
struct PollInner {
    state: Option<ConnectionState>,
    host_id: Option<String>,
    client_id: Option<String>,
    version: u64,
    connected_clients: usize,
    task: Option<JoinHandle<()>>,
}

impl PollInner {
    fn state(&self) -> ConnectionState {
        self.state.unwrap_or(ConnectionState::Disconnected)
    }
}

struct Shared {
    server_url: String,
    http: reqwest::Client,
    store: LedgerStore,
    events: EventBus,
    inner: Mutex<PollInner>,
}

impl Shared {
    fn inner(&self) -> MutexGuard<'_, PollInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: ConnectionState) {
        self.inner().state = Some(state);
        self.events.emit(TransportEvent::StateChanged(state));
    }

    fn reset(&self) -> Option<JoinHandle<()>> {
        let task = {
            let mut inner = self.inner();
            let task = inner.task.take();
            *inner = PollInner::default();
            task
        };
        self.events
            .emit(TransportEvent::StateChanged(ConnectionState::Disconnected));
        task
    }

    fn host_url(&self) -> String {
        format!("{}/host", self.server_url)
    }

    /// Posts an action to `/host`. A `success: false` body is an error.
    async fn post(&self, request: &HostRequest) -> Result<HostResponse, SyncError> {
        let response = self.http.post(self.host_url()).json(request).send().await?;
        let status = response.status();
        let body: HostResponse = response
            .json()
            .await
            .map_err(|e| SyncError::HttpError(format!("{} ({})", e, status)))?;

        if !body.success {
            return Err(SyncError::Rejected(body.reason()));
        }
        Ok(body)
    }

    async fn status(&self) -> Result<HostStatus, SyncError> {
        let response = self
            .http
            .get(self.host_url())
            .query(&[("action", "status")])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(SyncError::HttpError(format!(
                "Server returned status {}",
                response.status()
            )));
        }

        Ok(response.json().await?)
    }

    /// One poll round. Returns false once the session is gone.
    async fn poll_once(&self) -> Result<bool, SyncError> {
        let status = self.status().await?;
        let (state, version) = {
            let inner = self.inner();
            (inner.state(), inner.version)
        };

        if !status.is_active {
            if state == ConnectionState::Connected {
                tracing::info!("Host session ended");
                self.events.emit(TransportEvent::PeerLeft {
                    peer_id: self.inner().host_id.clone().unwrap_or_default(),
                });
                return Ok(false);
            }
            return Err(SyncError::HostNotFound(
                "server has no active host session".to_string(),
            ));
        }

        self.inner().connected_clients = status.connected_clients;

        if status.version > version {
            if let Some(doc) = status.data {
                apply_snapshot(&self.store, &self.events, &doc)?;
                self.inner().version = status.version;
                tracing::debug!("Pulled snapshot version {}", status.version);
            }
        }

        Ok(true)
    }
}

async fn poll_loop(shared: Arc<Shared>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if !shared.inner().state().is_online() {
            break;
        }

        match shared.poll_once().await {
            Ok(true) => {}
            Ok(false) => {
                drop(shared.reset());
                break;
            }
            Err(e) => {
                tracing::warn!("Poll failed: {}", e);
                shared.events.emit(TransportEvent::Error(e.to_string()));
            }
        }
    }
}

/// Quick reachability probe against the server's `/health` endpoint.
pub async fn check_server(server_url: &str) -> bool {
    let url = format!("{}/health", server_url.trim_end_matches('/'));
    let client = reqwest::Client::new();
    match timeout(Duration::from_secs(3), client.get(&url).send()).await {
        Ok(Ok(response)) => response.status().is_success(),
        _ => false,
    }
}

/// Transport that relays through the server's host session over HTTP.
pub struct PollingTransport {
    shared: Arc<Shared>,
    poll_interval: Duration,
    handshake_timeout: Duration,
}

impl PollingTransport {
    pub fn new(server_url: impl Into<String>, store: LedgerStore) -> Self {
        let server_url = server_url.into().trim_end_matches('/').to_string();
        Self {
            shared: Arc::new(Shared {
                server_url,
                http: reqwest::Client::new(),
                store,
                events: EventBus::new(),
                inner: Mutex::new(PollInner::default()),
            }),
            poll_interval: DEFAULT_POLL_INTERVAL,
            handshake_timeout: HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
        self.handshake_timeout = handshake_timeout;
        self
    }

    pub fn server_url(&self) -> &str {
        &self.shared.server_url
    }

    fn spawn_poller(&self) {
        let task = tokio::spawn(poll_loop(self.shared.clone(), self.poll_interval));
        self.shared.inner().task = Some(task);
    }

    async fn host(&self) -> Result<String, SyncError> {
        let device_id = self.shared.store.device_id()?;
        let doc = self.shared.store.load();
        let data = serde_json::to_value(&doc)
            .map_err(|e| SyncError::ProtocolError(e.to_string()))?;

        let request = HostRequest::new(HostAction::StartHost)
            .with_data(data)
            .with_client(device_id);
        let response = timeout(self.handshake_timeout, self.shared.post(&request))
            .await
            .map_err(|_| SyncError::HandshakeTimeout)??;

        let info: HostInfo = response
            .data
            .ok_or_else(|| SyncError::ProtocolError("START_HOST returned no data".to_string()))
            .and_then(|v| {
                serde_json::from_value(v).map_err(|e| SyncError::ProtocolError(e.to_string()))
            })?;

        let mut inner = self.shared.inner();
        inner.host_id = Some(info.host_id.clone());
        inner.client_id = Some(info.host_id.clone());
        inner.version = response.version.unwrap_or(0);
        Ok(info.host_id)
    }

    async fn join(&self, host_id: &str) -> Result<(), SyncError> {
        let client_id = generate_peer_id();

        let connect = HostRequest::new(HostAction::ClientConnect).with_client(client_id.clone());
        let response = self.shared.post(&connect).await?;
        let info: HostInfo = response
            .data
            .and_then(|v| serde_json::from_value(v).ok())
            .ok_or_else(|| SyncError::ProtocolError("CLIENT_CONNECT returned no host".to_string()))?;

        if !host_id.is_empty() && info.host_id != host_id {
            let leave = HostRequest::new(HostAction::ClientDisconnect).with_client(client_id);
            let _ = self.shared.post(&leave).await;
            return Err(SyncError::HostNotFound(host_id.to_string()));
        }

        let get = HostRequest::new(HostAction::GetData).with_client(client_id.clone());
        let response = self.shared.post(&get).await?;
        let doc: LedgerDocument = response
            .data
            .ok_or_else(|| SyncError::ProtocolError("GET_DATA returned no data".to_string()))
            .and_then(|v| {
                serde_json::from_value(v).map_err(|e| SyncError::ProtocolError(e.to_string()))
            })?;

        apply_snapshot(&self.shared.store, &self.shared.events, &doc)?;

        let mut inner = self.shared.inner();
        inner.host_id = Some(info.host_id);
        inner.client_id = Some(client_id);
        inner.version = response.version.unwrap_or(0);
        inner.connected_clients = info.connected_clients.max(1);
        Ok(())
    }
}

#[async_trait]
impl Transport for PollingTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Polling
    }

    fn state(&self) -> ConnectionState {
        self.shared.inner().state()
    }

    async fn start_as_host(&self) -> Option<String> {
        match self.state() {
            ConnectionState::Hosting => return self.shared.inner().host_id.clone(),
            ConnectionState::Disconnected => {}
            _ => self.disconnect().await,
        }

        match self.host().await {
            Ok(host_id) => {
                self.shared.set_state(ConnectionState::Hosting);
                self.spawn_poller();
                tracing::info!("Hosting on {} as {}", self.shared.server_url, host_id);
                Some(host_id)
            }
            Err(e) => {
                tracing::warn!("Failed to start host on {}: {}", self.shared.server_url, e);
                self.shared.events.emit(TransportEvent::Error(e.to_string()));
                drop(self.shared.reset());
                None
            }
        }
    }

    async fn connect_as_client(&self, host_id: &str) -> bool {
        if self.state() != ConnectionState::Disconnected {
            self.disconnect().await;
        }
        self.shared.set_state(ConnectionState::Connecting);

        let result = match timeout(self.handshake_timeout, self.join(host_id)).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::HandshakeTimeout),
        };

        match result {
            Ok(()) => {
                self.shared.set_state(ConnectionState::Connected);
                self.spawn_poller();
                tracing::info!("Connected to host {} via {}", host_id, self.shared.server_url);
                true
            }
            Err(e) => {
                tracing::warn!("Failed to connect to host {}: {}", host_id, e);
                self.shared.events.emit(TransportEvent::Error(e.to_string()));
                drop(self.shared.reset());
                false
            }
        }
    }

    async fn update_data(&self, section: Section, value: Value) -> Result<(), SyncError> {
        let client_id = {
            let inner = self.shared.inner();
            if !inner.state().is_online() {
                return Ok(());
            }
            inner.client_id.clone().unwrap_or_default()
        };

        let update = DataUpdate::new(section, value, client_id.clone());
        let data =
            serde_json::to_value(&update).map_err(|e| SyncError::ProtocolError(e.to_string()))?;
        let request = HostRequest::new(HostAction::UpdateData)
            .with_data(data)
            .with_client(client_id);

        let response = self.shared.post(&request).await?;
        if let Some(version) = response.version {
            let mut inner = self.shared.inner();
            // Only our own write happened since the last pull. Any gap means
            // another device wrote too, so leave the version for the poller.
            if version == inner.version + 1 {
                inner.version = version;
            }
        }
        Ok(())
    }

    async fn disconnect(&self) {
        let (state, client_id) = {
            let inner = self.shared.inner();
            if inner.state.is_none() && inner.task.is_none() {
                return;
            }
            (inner.state(), inner.client_id.clone())
        };

        let request = match state {
            ConnectionState::Hosting => Some(HostRequest::new(HostAction::StopHost)),
            ConnectionState::Connected => client_id
                .map(|id| HostRequest::new(HostAction::ClientDisconnect).with_client(id)),
            _ => None,
        };
        if let Some(request) = request {
            if let Err(e) = self.shared.post(&request).await {
                tracing::warn!("Failed to leave host session: {}", e);
            }
        }

        if let Some(task) = self.shared.reset() {
            task.abort();
        }
        tracing::info!("Polling transport disconnected");
    }

    fn connected_devices(&self) -> usize {
        let inner = self.shared.inner();
        if inner.state().is_online() {
            inner.connected_clients
        } else {
            0
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.shared.events.subscribe()
    }
}

impl Drop for PollingTransport {
    fn drop(&mut self) {
        if let Some(task) = self.shared.inner().task.take() {
            task.abort();
        }
    }
}
