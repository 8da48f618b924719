//! Cardroom Core Library
//!
//! Ledger models, persistence and the multi-device sync transports shared
//! by the Cardroom CLI and server.

pub mod calc;
pub mod ledger;
pub mod models;
pub mod storage;
pub mod sync;

pub use calc::{calculate_daily_stats, calculate_receipt_total, DailyStats};
pub use ledger::{Applied, LedgerDocument, LedgerError, Section};
pub use models::{
    DailySales, GameSession, HistoryAction, HistoryEntry, ItemType, Player, Receipt, ReceiptItem,
    ReceiptStatus, SessionStatus, SystemSettings,
};
pub use storage::{FileStore, KeyValueStore, LedgerStore, MemoryStore, StorageError};
pub use sync::{
    check_server, BroadcastTransport, ConnectionState, HybridSync, PeerNetwork, PeerTransport,
    PollingTransport, SyncError, SyncHook, Transport, TransportEvent, TransportKind,
};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }
}
