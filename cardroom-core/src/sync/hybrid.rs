//! Online/offline sync queue.
//!
//! Local writes are recorded as pending changes and pushed to the server's
//! `/sync` endpoint together with the full current snapshot, either on a
//! timer or as soon as connectivity returns. The snapshot is authoritative;
//! the pending list only tells the server (and the UI) that something is
//! unsynced.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use super::error::SyncError;
use super::protocol::{PendingChange, SyncRequest, SyncResponse};
use crate::ledger::Section;
use crate::storage::{LedgerStore, StorageError};

/// Key of the persisted [`SyncState`] in the device's key-value store.
pub const SYNC_STATE_KEY: &str = "syncState";

/// Default time between background syncs.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Persisted bookkeeping for the offline queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    #[serde(default)]
    pub last_sync_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pending_changes: Vec<PendingChange>,
    pub device_id: String,
    #[serde(default)]
    pub sync_version: u64,
}

impl SyncState {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            last_sync_time: None,
            pending_changes: Vec::new(),
            device_id: device_id.into(),
            sync_version: 0,
        }
    }
}

pub struct HybridSync {
    server_url: String,
    http: reqwest::Client,
    store: LedgerStore,
    state: Mutex<SyncState>,
    online: AtomicBool,
    sync_interval: Duration,
}

impl HybridSync {
    /// Creates the queue, restoring any state persisted by a previous run.
    pub fn new(server_url: impl Into<String>, store: LedgerStore) -> Result<Self, StorageError> {
        let device_id = store.device_id()?;
        let state = match store.kv().get(SYNC_STATE_KEY)? {
            Some(raw) => match serde_json::from_str::<SyncState>(&raw) {
                Ok(state) => state,
                Err(e) => {
                    tracing::warn!("Discarding unparsable sync state: {}", e);
                    SyncState::new(device_id)
                }
            },
            None => SyncState::new(device_id),
        };

        Ok(Self {
            server_url: server_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
            store,
            state: Mutex::new(state),
            online: AtomicBool::new(true),
            sync_interval: DEFAULT_SYNC_INTERVAL,
        })
    }

    pub fn with_sync_interval(mut self, sync_interval: Duration) -> Self {
        self.sync_interval = sync_interval;
        self
    }

    fn lock(&self) -> MutexGuard<'_, SyncState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self, state: &SyncState) -> Result<(), StorageError> {
        let raw = serde_json::to_string(state)?;
        self.store.kv().set(SYNC_STATE_KEY, &raw)
    }

    /// A copy of the current queue state.
    pub fn state(&self) -> SyncState {
        self.lock().clone()
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending_changes.len()
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Appends a change to the queue and persists the queue.
    pub fn record_change(&self, section: Section, data: Value) -> Result<(), StorageError> {
        let mut state = self.lock();
        state.pending_changes.push(PendingChange {
            section,
            data,
            timestamp: Utc::now(),
        });
        self.persist(&state)
    }

    async fn push(&self, request: &SyncRequest) -> Result<SyncResponse, SyncError> {
        let response = self
            .http
            .post(format!("{}/sync", self.server_url))
            .json(request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(SyncError::HttpError(format!(
                "Server returned status {}",
                response.status()
            )));
        }

        let body: SyncResponse = response.json().await?;
        if !body.success {
            return Err(SyncError::Rejected(
                body.error.unwrap_or_else(|| "sync rejected".to_string()),
            ));
        }
        Ok(body)
    }

    /// Pushes the queue and the current snapshot to the server.
    ///
    /// Returns false when offline or when the push fails; the queue is kept
    /// in both cases.
    pub async fn sync_now(&self) -> bool {
        if !self.is_online() {
            tracing::debug!("Offline, keeping {} pending change(s)", self.pending_count());
            return false;
        }

        let request = {
            let state = self.lock();
            SyncRequest {
                device_id: state.device_id.clone(),
                changes: state.pending_changes.clone(),
                data: self.store.load(),
                sync_version: state.sync_version,
            }
        };
        let sent = request.changes.len();

        match self.push(&request).await {
            Ok(response) => {
                let mut state = self.lock();
                // Changes recorded while the request was in flight stay queued.
                let sent = sent.min(state.pending_changes.len());
                state.pending_changes.drain(..sent);
                state.last_sync_time = Some(Utc::now());
                state.sync_version = response.sync_version;
                if let Err(e) = self.persist(&state) {
                    tracing::warn!("Failed to persist sync state: {}", e);
                }
                tracing::info!(
                    "Synced {} change(s), server version {}",
                    response.accepted_changes,
                    response.sync_version
                );
                true
            }
            Err(e) => {
                tracing::warn!("Sync failed, keeping queue: {}", e);
                false
            }
        }
    }

    /// Runs the background loop until the connectivity sender is dropped.
    ///
    /// Syncs on every tick while online and immediately on each
    /// offline-to-online transition.
    pub async fn run(&self, mut connectivity: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.sync_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.set_online(*connectivity.borrow_and_update());

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.is_online() {
                        self.sync_now().await;
                    }
                }
                changed = connectivity.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let online = *connectivity.borrow_and_update();
                    let was_online = self.online.swap(online, Ordering::SeqCst);
                    if online && !was_online {
                        tracing::info!("Back online, syncing");
                        self.sync_now().await;
                    } else if !online && was_online {
                        tracing::info!("Offline, queueing changes");
                    }
                }
            }
        }

        tracing::debug!("Connectivity watch closed, stopping sync loop");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn queue(store: LedgerStore) -> HybridSync {
        HybridSync::new("http://127.0.0.1:1", store).unwrap()
    }

    #[test]
    fn test_record_change_persists() {
        let store = LedgerStore::memory();
        let sync = queue(store.clone());

        sync.record_change(Section::Players, json!([])).unwrap();
        sync.record_change(Section::Settings, json!({})).unwrap();
        assert_eq!(sync.pending_count(), 2);

        let restored = queue(store.clone());
        let state = restored.state();
        assert_eq!(state.pending_changes.len(), 2);
        assert_eq!(state.pending_changes[0].section, Section::Players);
        assert_eq!(state.device_id, store.device_id().unwrap());
    }

    #[test]
    fn test_sync_state_wire_format() {
        let mut state = SyncState::new("dev-1");
        state.pending_changes.push(PendingChange {
            section: Section::DailySales,
            data: json!([]),
            timestamp: Utc::now(),
        });

        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["deviceId"], "dev-1");
        assert_eq!(json["syncVersion"], 0);
        assert_eq!(json["pendingChanges"][0]["type"], "dailySales");
    }

    #[test]
    fn test_corrupt_state_is_replaced() {
        let store = LedgerStore::memory();
        store.kv().set(SYNC_STATE_KEY, "{broken").unwrap();

        let sync = queue(store);
        assert_eq!(sync.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_sync_now_offline_keeps_queue() {
        let sync = queue(LedgerStore::memory());
        sync.record_change(Section::Players, json!([])).unwrap();
        sync.set_online(false);

        assert!(!sync.sync_now().await);
        assert_eq!(sync.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_sync_now_unreachable_server_keeps_queue() {
        let sync = queue(LedgerStore::memory());
        sync.record_change(Section::Players, json!([])).unwrap();

        assert!(!sync.sync_now().await);
        assert_eq!(sync.pending_count(), 1);
        assert!(sync.state().last_sync_time.is_none());
    }

    #[tokio::test]
    async fn test_run_tracks_connectivity_and_exits() {
        let sync = Arc::new(
            queue(LedgerStore::memory()).with_sync_interval(Duration::from_secs(3600)),
        );
        let (tx, rx) = watch::channel(true);

        let runner = {
            let sync = sync.clone();
            tokio::spawn(async move { sync.run(rx).await })
        };

        tx.send(false).unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while sync.is_online() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        drop(tx);
        tokio::time::timeout(Duration::from_secs(2), runner)
            .await
            .unwrap()
            .unwrap();
    }
}
