//! File-backed key-value storage.
//!
//! One JSON file per key under a base directory. Writes go to a temp file
//! first and are renamed into place, so readers see either the previous
//! value or the new one, never a torn write — the atomicity the pending
//! queue's load-modify-store cycle relies on.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use fleettrack_core::{KeyValueStore, StorageError};

/// Durable key-value store over flat JSON files.
pub struct FileKeyValueStore {
    dir: PathBuf,
}

impl FileKeyValueStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| StorageError::WriteError {
            key: dir.display().to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        // Keys are dotted names; keep them filesystem-safe.
        let safe: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }
}

impl KeyValueStore for FileKeyValueStore {
    fn load_raw(&self, key: &str) -> Result<Option<String>, StorageError> {
        match fs::read_to_string(self.path_for(key)) {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::ReadError {
                key: key.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    fn save_raw(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");

        let write_err = |e: std::io::Error| StorageError::WriteError {
            key: key.to_string(),
            reason: e.to_string(),
        };

        fs::write(&tmp, value).map_err(write_err)?;
        fs::rename(&tmp, &path).map_err(write_err)
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::WriteError {
                key: key.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    fn has_key(&self, key: &str) -> bool {
        self.path_for(key).exists()
    }
}
