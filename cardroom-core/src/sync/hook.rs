//! The uniform layer the application talks to.
//!
//! Every write lands in local persistence first; replication is best-effort
//! on top of it. Nothing here returns a transport error: failures are
//! logged and the device carries on in local-only mode.

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::TryRecvError};

use super::event::TransportEvent;
use super::hybrid::HybridSync;
use super::transport::{ConnectionState, Transport};
use crate::ledger::{Applied, LedgerDocument, Section};
use crate::storage::LedgerStore;

pub struct SyncHook {
    store: LedgerStore,
    transport: Box<dyn Transport>,
    queue: Option<Arc<HybridSync>>,
    events: broadcast::Receiver<TransportEvent>,
    server_data: Option<LedgerDocument>,
    connected_devices: usize,
    loading: bool,
}

impl SyncHook {
    pub fn new(store: LedgerStore, transport: Box<dyn Transport>) -> Self {
        let events = transport.subscribe();
        Self {
            store,
            transport,
            queue: None,
            events,
            server_data: None,
            connected_devices: 0,
            loading: false,
        }
    }

    /// Also records every write in an offline queue.
    pub fn with_queue(mut self, queue: Arc<HybridSync>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn store(&self) -> &LedgerStore {
        &self.store
    }

    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    pub fn queue(&self) -> Option<&Arc<HybridSync>> {
        self.queue.as_ref()
    }

    pub fn state(&self) -> ConnectionState {
        self.transport.state()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    /// The document as of the last refresh or applied remote change.
    pub fn server_data(&self) -> Option<&LedgerDocument> {
        self.server_data.as_ref()
    }

    /// Other devices seen at the last refresh.
    pub fn connected_devices(&self) -> usize {
        self.connected_devices
    }

    /// Writes a section locally, then propagates it.
    ///
    /// Returns true iff the local write succeeded.
    pub async fn save_to_server(&mut self, section: Section, value: Value) -> bool {
        if let Err(e) = self.store.save_section(section, &value) {
            tracing::error!("Failed to save {}: {}", section, e);
            return false;
        }

        if let Some(queue) = &self.queue {
            if let Err(e) = queue.record_change(section, value.clone()) {
                tracing::warn!("Failed to queue {} change: {}", section, e);
            }
        }

        if let Err(e) = self.transport.update_data(section, value).await {
            tracing::warn!("Failed to propagate {}: {}", section, e);
        }

        self.server_data = Some(self.store.load());
        true
    }

    /// Saves every section an operation touched.
    pub async fn save_applied<T>(&mut self, applied: &Applied<T>, doc: &LedgerDocument) -> bool {
        let mut ok = true;
        for section in applied.sections {
            ok &= self.save_to_server(*section, doc.section_value(*section)).await;
        }
        ok
    }

    /// Re-reads local persistence and the transport's device count.
    pub fn refresh_data(&mut self) -> bool {
        self.loading = true;
        let result = match self.store.reload() {
            Ok(doc) => {
                self.server_data = Some(doc);
                self.connected_devices = self.transport.connected_devices();
                true
            }
            Err(e) => {
                tracing::warn!("Failed to refresh ledger: {}", e);
                false
            }
        };
        self.loading = false;
        result
    }

    pub async fn start_as_host(&mut self) -> Option<String> {
        self.loading = true;
        let host_id = self.transport.start_as_host().await;
        self.loading = false;

        if host_id.is_some() {
            self.refresh_data();
        }
        host_id
    }

    pub async fn connect_as_client(&mut self, host_id: &str) -> bool {
        self.loading = true;
        let connected = self.transport.connect_as_client(host_id).await;
        self.loading = false;

        if connected {
            self.refresh_data();
        }
        connected
    }

    pub async fn disconnect(&mut self) {
        self.transport.disconnect().await;
        self.connected_devices = 0;
    }

    /// Joins `host_id` if given, otherwise (or if joining fails) starts
    /// hosting. Stays local-only if both fail.
    pub async fn auto_connect(&mut self, host_id: Option<&str>) -> ConnectionState {
        if let Some(host_id) = host_id {
            if self.connect_as_client(host_id).await {
                return ConnectionState::Connected;
            }
            tracing::info!("Could not join {}, trying to host instead", host_id);
        }

        if self.start_as_host().await.is_some() {
            return ConnectionState::Hosting;
        }

        tracing::warn!("Sync unavailable, continuing in local-only mode");
        self.refresh_data();
        ConnectionState::Disconnected
    }

    /// Drains queued transport events and returns how many were seen.
    ///
    /// Refreshes [`server_data`](Self::server_data) if any remote change
    /// arrived.
    pub fn pump_events(&mut self) -> usize {
        let mut seen = 0;
        let mut dirty = false;

        loop {
            match self.events.try_recv() {
                Ok(event) => {
                    seen += 1;
                    match event {
                        TransportEvent::DataChanged { .. } | TransportEvent::SnapshotReceived => {
                            dirty = true
                        }
                        TransportEvent::Error(message) => {
                            tracing::debug!("Transport reported: {}", message)
                        }
                        _ => {}
                    }
                }
                Err(TryRecvError::Lagged(skipped)) => {
                    tracing::debug!("Skipped {} transport events", skipped);
                    dirty = true;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }

        if dirty {
            self.refresh_data();
        }
        seen
    }
}
