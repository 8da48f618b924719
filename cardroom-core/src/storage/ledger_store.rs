use chrono::Utc;
use serde_json::Value;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use super::{FileStore, KeyValueStore, MemoryStore, StorageError};
use crate::ledger::{validate_section, LedgerDocument, Section};

/// Subdirectory of a file-backed store that holds full-document backups.
pub const BACKUP_DIR: &str = "backups";

const DEVICE_ID_KEY: &str = "deviceId";

/// Persistence adapter for the ledger document.
///
/// Each section lives under its own key. Reads never fail on bad data: a
/// missing or unparsable section is replaced by its default and logged.
/// Writes replace a section wholesale, so the last completed write wins.
#[derive(Clone)]
pub struct LedgerStore {
    kv: Arc<dyn KeyValueStore>,
}

impl LedgerStore {
    pub fn new(kv: impl KeyValueStore + 'static) -> Self {
        Self { kv: Arc::new(kv) }
    }

    /// A store backed by one JSON file per section under `dir`.
    pub fn file(dir: impl Into<PathBuf>) -> Self {
        Self::new(FileStore::new(dir))
    }

    /// A store that lives only as long as the process.
    pub fn memory() -> Self {
        Self::new(MemoryStore::new())
    }

    /// The underlying key-value store, shared with other per-device state.
    pub fn kv(&self) -> &dyn KeyValueStore {
        self.kv.as_ref()
    }

    /// Reads the whole document.
    ///
    /// Only backend failures (e.g. an unreadable directory) are errors;
    /// corrupt or missing sections fall back to defaults.
    pub fn reload(&self) -> Result<LedgerDocument, StorageError> {
        let mut doc = LedgerDocument::default();

        for section in Section::ALL {
            let Some(raw) = self.kv.get(section.filename())? else {
                continue;
            };

            let value: Value = match serde_json::from_str(&raw) {
                Ok(value) => value,
                Err(e) => {
                    tracing::warn!("Discarding unparsable section {}: {}", section, e);
                    continue;
                }
            };

            if let Err(e) = doc.set_section(section, value) {
                tracing::warn!("Discarding invalid section {}: {}", section, e);
            }
        }

        Ok(doc)
    }

    /// Reads the whole document, substituting defaults on any failure.
    pub fn load(&self) -> LedgerDocument {
        self.reload().unwrap_or_else(|e| {
            tracing::warn!("Failed to load ledger, using defaults: {}", e);
            LedgerDocument::default()
        })
    }

    /// Reads one section as JSON.
    pub fn load_section(&self, section: Section) -> Value {
        self.load().section_value(section)
    }

    /// Replaces one section and persists it before returning.
    pub fn save_section(&self, section: Section, value: &Value) -> Result<(), StorageError> {
        validate_section(section, value)?;
        let contents = serde_json::to_string_pretty(value)?;
        self.kv.set(section.filename(), &contents)?;

        tracing::debug!("Saved section {}", section);
        Ok(())
    }

    /// Writes every section of `doc`.
    pub fn save_document(&self, doc: &LedgerDocument) -> Result<(), StorageError> {
        for section in Section::ALL {
            self.save_section(section, &doc.section_value(section))?;
        }
        Ok(())
    }

    /// Writes a timestamped full-document backup and returns its path.
    pub fn backup(&self, doc: &LedgerDocument) -> Result<PathBuf, StorageError> {
        let root = self.kv.root().ok_or(StorageError::BackupUnsupported)?;
        let dir = root.join(BACKUP_DIR);
        fs::create_dir_all(&dir).map_err(|e| StorageError::io(&dir, e))?;

        let name = format!("ledger-{}.json", Utc::now().format("%Y%m%d-%H%M%S%.3f"));
        let path = dir.join(name);
        let contents = serde_json::to_string_pretty(doc)?;
        fs::write(&path, contents).map_err(|e| StorageError::io(&path, e))?;

        tracing::info!("Wrote backup {}", path.display());
        Ok(path)
    }

    /// Backup files, newest first.
    pub fn list_backups(&self) -> Result<Vec<PathBuf>, StorageError> {
        let root = self.kv.root().ok_or(StorageError::BackupUnsupported)?;
        let dir = root.join(BACKUP_DIR);

        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::io(dir, e)),
        };

        let mut backups: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect();
        backups.sort();
        backups.reverse();
        Ok(backups)
    }

    /// The id of this device, created on first use.
    pub fn device_id(&self) -> Result<String, StorageError> {
        if let Some(id) = self.kv.get(DEVICE_ID_KEY)? {
            if !id.trim().is_empty() {
                return Ok(id.trim().to_string());
            }
        }

        let id = Uuid::new_v4().to_string();
        self.kv.set(DEVICE_ID_KEY, &id)?;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Player;
    use serde_json::json;
    use tempfile::TempDir;

    fn players(names: &[&str]) -> Value {
        let list: Vec<Player> = names
            .iter()
            .map(|n| Player::new(*n).with_id(*n))
            .collect();
        serde_json::to_value(list).unwrap()
    }

    #[test]
    fn test_load_empty_store_returns_defaults() {
        let store = LedgerStore::memory();
        let doc = store.load();

        assert_eq!(doc.players.len(), 0);
        assert_eq!(doc.settings.confirmed_rake, 0);
    }

    #[test]
    fn test_save_section_then_load() {
        let store = LedgerStore::memory();
        for section in Section::ALL {
            let value = LedgerDocument::default().section_value(section);
            store.save_section(section, &value).unwrap();
            assert_eq!(store.load_section(section), value);
        }

        let value = players(&["a", "b"]);
        store.save_section(Section::Players, &value).unwrap();
        assert_eq!(store.load_section(Section::Players), value);
    }

    #[test]
    fn test_save_section_rejects_wrong_shape() {
        let store = LedgerStore::memory();
        let result = store.save_section(Section::Players, &json!({"oops": true}));

        assert!(matches!(result, Err(StorageError::InvalidSection(_))));
        assert!(store.load().players.is_empty());
    }

    #[test]
    fn test_last_completed_write_wins() {
        let store = LedgerStore::memory();
        let a = players(&["a"]);
        let b = players(&["b"]);

        store.save_section(Section::Players, &b).unwrap();
        store.save_section(Section::Players, &a).unwrap();

        assert_eq!(store.load_section(Section::Players), a);
    }

    #[test]
    fn test_corrupt_section_falls_back_to_default() {
        let kv = MemoryStore::new();
        kv.set("players.json", "{not json").unwrap();
        kv.set("settings.json", r#"{"confirmedRake": 700}"#).unwrap();
        let store = LedgerStore::new(kv);

        let doc = store.load();
        assert!(doc.players.is_empty());
        assert_eq!(doc.settings.confirmed_rake, 700);
    }

    #[test]
    fn test_file_layout() {
        let temp = TempDir::new().unwrap();
        let store = LedgerStore::file(temp.path());
        store.save_document(&LedgerDocument::default()).unwrap();

        for name in [
            "players.json",
            "sessions.json",
            "receipts.json",
            "daily-sales.json",
            "history.json",
            "settings.json",
        ] {
            assert!(temp.path().join(name).exists(), "missing {}", name);
        }
    }

    #[test]
    fn test_document_roundtrip_through_files() {
        let temp = TempDir::new().unwrap();
        let store = LedgerStore::file(temp.path());

        let mut doc = LedgerDocument::default();
        let player = doc.add_player("Tanaka").unwrap().value;
        doc.buy_in(&player.id, 5000).unwrap();
        store.save_document(&doc).unwrap();

        let reopened = LedgerStore::file(temp.path());
        assert_eq!(reopened.load(), doc);
    }

    #[test]
    fn test_backup_and_list() {
        let temp = TempDir::new().unwrap();
        let store = LedgerStore::file(temp.path());

        let path = store.backup(&LedgerDocument::default()).unwrap();
        assert!(path.starts_with(temp.path().join(BACKUP_DIR)));

        let backups = store.list_backups().unwrap();
        assert_eq!(backups, vec![path]);
    }

    #[test]
    fn test_backup_unsupported_in_memory() {
        let store = LedgerStore::memory();
        assert!(matches!(
            store.backup(&LedgerDocument::default()),
            Err(StorageError::BackupUnsupported)
        ));
    }

    #[test]
    fn test_device_id_is_stable() {
        let store = LedgerStore::memory();
        let first = store.device_id().unwrap();
        let second = store.device_id().unwrap();

        assert_eq!(first, second);
        assert!(Uuid::parse_str(&first).is_ok());
    }
}
