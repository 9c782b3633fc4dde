//! On-disk persistence for the capability store: a single JSON document,
//! written via temp-file-then-rename so a reader never observes a partial
//! write (spec §4.2, §6.3).

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::capability::Capability;
use crate::error::{CoreError, CoreResult};
use crate::store::usage::CapabilityUsage;

#[derive(Serialize, Deserialize, Default)]
pub struct PersistedStore {
    pub capabilities: HashMap<String, Capability>,
    pub usage: HashMap<String, CapabilityUsage>,
}

/// Loads the persisted document at `path`. A missing or empty file yields
/// an empty store; any other read or parse failure aborts start-up per
/// spec §4.2.
pub fn load(path: &Path) -> CoreResult<PersistedStore> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(PersistedStore::default()),
        Err(e) => {
            return Err(CoreError::StorePersistence(format!(
                "failed to read {}: {e}",
                path.display()
            )))
        }
    };
    if bytes.is_empty() {
        return Ok(PersistedStore::default());
    }
    serde_json::from_slice(&bytes)
        .map_err(|e| CoreError::StoreCorrupt(format!("{}: {e}", path.display())))
}

/// Serializes `store` and atomically replaces `path` with the result: write
/// to a sibling temp file, then `rename` over the target.
pub fn save(path: &Path, store: &PersistedStore) -> CoreResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| {
                CoreError::StorePersistence(format!("failed to create store directory: {e}"))
            })?;
        }
    }
    let bytes = serde_json::to_vec_pretty(store)
        .map_err(|e| CoreError::StorePersistence(format!("failed to serialize store: {e}")))?;

    let tmp_path = temp_path_for(path);
    fs::write(&tmp_path, &bytes)
        .map_err(|e| CoreError::StorePersistence(format!("failed to write temp store file: {e}")))?;
    fs::rename(&tmp_path, path)
        .map_err(|e| CoreError::StorePersistence(format!("failed to rename store file into place: {e}")))
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let loaded = load(&path).unwrap();
        assert!(loaded.capabilities.is_empty());
        assert!(loaded.usage.is_empty());
    }

    #[test]
    fn save_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let store = PersistedStore::default();
        save(&path, &store).unwrap();
        assert!(path.exists());
        let loaded = load(&path).unwrap();
        assert!(loaded.capabilities.is_empty());
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        fs::write(&path, b"not json").unwrap();
        assert!(load(&path).is_err());
    }

    #[test]
    fn repeated_saves_produce_identical_bytes_when_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let store = PersistedStore::default();
        save(&path, &store).unwrap();
        let first = fs::read(&path).unwrap();
        save(&path, &store).unwrap();
        let second = fs::read(&path).unwrap();
        assert_eq!(first, second);
    }
}
