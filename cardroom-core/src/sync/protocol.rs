//! Wire types shared by the transports and the server.
//!
//! Peer data channels carry CBOR-encoded [`PeerMessage`]s. Everything that
//! goes over HTTP or WebSocket is JSON with camelCase field names, matching
//! what browser clients of the server send.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ledger::{LedgerDocument, Section};

/// Messages exchanged over a direct peer data channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PeerMessage {
    /// Sent by a client when it opens a channel to the host
    Hello {
        #[serde(rename = "senderId")]
        sender_id: String,
    },
    RequestInitialData {
        #[serde(rename = "senderId")]
        sender_id: String,
    },
    /// Full snapshot, sent by the host in reply to `REQUEST_INITIAL_DATA`
    InitialData { data: LedgerDocument },
    DataUpdate(DataUpdate),
    /// Sent before a participant closes its channels
    Goodbye {
        #[serde(rename = "senderId")]
        sender_id: String,
    },
}

impl PeerMessage {
    /// Encode message as CBOR bytes.
    pub fn encode(&self) -> Result<Vec<u8>, ciborium::ser::Error<std::io::Error>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)?;
        Ok(buf)
    }

    /// Decode message from CBOR bytes.
    pub fn decode(data: &[u8]) -> Result<Self, ciborium::de::Error<std::io::Error>> {
        ciborium::from_reader(data)
    }
}

/// A whole-section replacement broadcast to other participants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataUpdate {
    pub section: Section,
    pub value: Value,
    pub sender_id: String,
    pub timestamp: DateTime<Utc>,
}

impl DataUpdate {
    pub fn new(section: Section, value: Value, sender_id: impl Into<String>) -> Self {
        Self {
            section,
            value,
            sender_id: sender_id.into(),
            timestamp: Utc::now(),
        }
    }
}

/// The `{section, value}` part of an update as accepted over HTTP.
///
/// Also accepts the `{type, data}` spelling used by the `/data` endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectionUpdate {
    #[serde(alias = "type")]
    pub section: Section,
    #[serde(alias = "data")]
    pub value: Value,
}

/// Actions accepted by `POST /host`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HostAction {
    StartHost,
    StopHost,
    GetData,
    UpdateData,
    ClientConnect,
    ClientDisconnect,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostRequest {
    pub action: HostAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

impl HostRequest {
    pub fn new(action: HostAction) -> Self {
        Self {
            action,
            data: None,
            client_id: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_client(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }
}

/// Response envelope used by `/host`, `/client`, `/data` and `/players`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

impl HostResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = Some(version);
        self
    }

    /// The error text, falling back to the message.
    pub fn reason(&self) -> String {
        self.error
            .clone()
            .or_else(|| self.message.clone())
            .unwrap_or_else(|| "unknown error".to_string())
    }
}

/// Response to `GET /host?action=status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostStatus {
    pub success: bool,
    pub is_active: bool,
    pub connected_clients: usize,
    #[serde(default)]
    pub data: Option<LedgerDocument>,
    #[serde(default)]
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_id: Option<String>,
}

/// Actions accepted by `POST /client`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientAction {
    Connect,
    GetData,
    UpdateData,
    Disconnect,
}

impl ClientAction {
    /// The `/host` action this client action is relayed as.
    pub fn host_action(self) -> HostAction {
        match self {
            ClientAction::Connect => HostAction::ClientConnect,
            ClientAction::GetData => HostAction::GetData,
            ClientAction::UpdateData => HostAction::UpdateData,
            ClientAction::Disconnect => HostAction::ClientDisconnect,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRequest {
    pub action: ClientAction,
    pub host_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

/// Role of a participant in a relay room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayRole {
    Host,
    Client,
}

/// Frames exchanged with the server's broadcast relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelayMessage {
    /// Sent by the server once a participant has joined a room
    Welcome {
        room: String,
        #[serde(rename = "clientId")]
        client_id: String,
        connected: usize,
    },
    /// Room size changed
    Presence { connected: usize },
    RequestInitialData {
        #[serde(rename = "senderId")]
        sender_id: String,
    },
    InitialData {
        #[serde(rename = "targetId")]
        target_id: String,
        data: LedgerDocument,
    },
    DataUpdate(DataUpdate),
    /// The room's host went away; the room is closed
    HostLeft,
    Error { message: String },
}

/// A local write waiting to be pushed by the offline queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingChange {
    #[serde(rename = "type")]
    pub section: Section,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

/// Body of `POST /sync`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub device_id: String,
    #[serde(default)]
    pub changes: Vec<PendingChange>,
    pub data: LedgerDocument,
    #[serde(default)]
    pub sync_version: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    pub success: bool,
    #[serde(default)]
    pub sync_version: u64,
    #[serde(default)]
    pub accepted_changes: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Generate a short, shareable host code for a device.
///
/// The code is `base58check(sha256(device_id + ":" + nonce)[0:8])`, short
/// enough to type or put in a QR code.
pub fn generate_host_code(device_id: &str) -> String {
    use sha2::{Digest, Sha256};

    let nonce = uuid::Uuid::new_v4();
    let mut hasher = Sha256::new();
    hasher.update(device_id.as_bytes());
    hasher.update(b":");
    hasher.update(nonce.as_bytes());
    let hash = hasher.finalize();
    bs58::encode(&hash[..8]).with_check().into_string()
}

/// Generate a random peer ID for this connection.
pub fn generate_peer_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
