use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::Builder;

use super::{validate_key, KeyValueStore, StorageError};

/// Stores each key as a file in one directory.
///
/// ```text
/// <DATA_DIR>/
///   players.json
///   sessions.json
///   ...
/// ```
///
/// Each write goes to its own temp file that is renamed over the target,
/// so readers never see a half-written value and concurrent writers of
/// one key never share a file. The last rename wins.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        validate_key(key)?;
        let path = self.path(key);

        match fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::io(path, e)),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        validate_key(key)?;
        fs::create_dir_all(&self.dir).map_err(|e| StorageError::io(&self.dir, e))?;

        let path = self.path(key);
        let mut file = Builder::new()
            .prefix(&format!(".{}.", key))
            .suffix(".tmp")
            .tempfile_in(&self.dir)
            .map_err(|e| StorageError::io(&self.dir, e))?;

        let temp_path = file.path().to_path_buf();
        file.write_all(value.as_bytes())
            .map_err(|e| StorageError::io(&temp_path, e))?;
        file.as_file()
            .sync_all()
            .map_err(|e| StorageError::io(&temp_path, e))?;

        file.persist(&path)
            .map_err(|e| StorageError::io(path, e.error))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        validate_key(key)?;
        let path = self.path(key);

        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::io(path, e)),
        }
    }

    fn root(&self) -> Option<&Path> {
        Some(&self.dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (FileStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::new(temp_dir.path().join("data"));
        (store, temp_dir)
    }

    #[test]
    fn test_get_missing_returns_none() {
        let (store, _temp) = setup();
        assert!(store.get("players.json").unwrap().is_none());
    }

    #[test]
    fn test_set_creates_directory_and_file() {
        let (store, temp) = setup();
        store.set("players.json", "[]").unwrap();

        let expected = temp.path().join("data").join("players.json");
        assert!(expected.exists());
        assert_eq!(fs::read_to_string(expected).unwrap(), "[]");
    }

    #[test]
    fn test_overwrite_existing() {
        let (store, _temp) = setup();
        store.set("settings.json", "1").unwrap();
        store.set("settings.json", "2").unwrap();

        assert_eq!(store.get("settings.json").unwrap().as_deref(), Some("2"));
    }

    #[test]
    fn test_no_temp_file_left_behind() {
        let (store, _temp) = setup();
        store.set("history.json", "[]").unwrap();

        let names: Vec<String> = fs::read_dir(store.dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["history.json".to_string()]);
    }

    #[test]
    fn test_concurrent_writers_never_corrupt() {
        let (store, _temp) = setup();
        let bodies: Vec<String> = (1..=4)
            .map(|n| serde_json::to_string(&vec!["x".repeat(n * 500); n]).unwrap())
            .collect();

        for _ in 0..50 {
            std::thread::scope(|scope| {
                let handles: Vec<_> = bodies
                    .iter()
                    .map(|body| {
                        let store = store.clone();
                        scope.spawn(move || store.set("players.json", body))
                    })
                    .collect();
                for handle in handles {
                    handle.join().unwrap().unwrap();
                }
            });

            let contents = store.get("players.json").unwrap().unwrap();
            assert!(bodies.contains(&contents));
        }

        let leftovers = fs::read_dir(store.dir()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn test_remove_missing_is_ok() {
        let (store, _temp) = setup();
        assert!(store.remove("nothing.json").is_ok());
    }

    #[test]
    fn test_rejects_path_traversal() {
        let (store, _temp) = setup();
        assert!(matches!(
            store.set("../escape.json", "x"),
            Err(StorageError::InvalidKey(_))
        ));
    }
}
