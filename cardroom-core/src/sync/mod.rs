//! Multi-device replication of the ledger.
//!
//! One host device owns the session; clients connect to it and receive a
//! full snapshot, after which every write is sent as a whole-section
//! replacement. The last update to arrive for a section wins.
//!
//! Three [`Transport`] variants share the same semantics:
//! - [`PeerTransport`]: direct data channels brokered by a [`PeerNetwork`]
//! - [`PollingTransport`]: HTTP against the server's `/host` endpoint
//! - [`BroadcastTransport`]: WebSocket rooms on the server's relay
//!
//! [`SyncHook`] wraps a transport for the application, and [`HybridSync`]
//! adds an offline queue pushed to the server's `/sync` endpoint.

mod broadcast;
mod error;
mod event;
mod hook;
mod hybrid;
mod peer;
mod polling;
pub mod protocol;
mod transport;

pub use broadcast::{build_ws_url, BroadcastTransport};
pub use error::SyncError;
pub use event::{EventBus, TransportEvent};
pub use hook::SyncHook;
pub use hybrid::{HybridSync, SyncState, DEFAULT_SYNC_INTERVAL, SYNC_STATE_KEY};
pub use peer::{PeerNetwork, PeerTransport, HANDSHAKE_TIMEOUT};
pub use polling::{check_server, PollingTransport, DEFAULT_POLL_INTERVAL};
pub use protocol::{generate_host_code, generate_peer_id, PeerMessage, RelayMessage};
pub use transport::{ConnectionState, Transport, TransportKind};
