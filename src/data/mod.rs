//! Storage for results agents want to keep across calls.
//!
//! Two independent stores live under the storage directory:
//! [`DataSessions`] (named key/value scratchpads with optional expiry, one
//! JSON file each under `sessions/`) and [`DataEntries`] (typed captured
//! records under `file_data/`, indexed by `index.json`).

mod entries;
mod sessions;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

pub use entries::{DataEntries, DataEntry, EntryQuery};
pub use sessions::{DataSession, DataSessions};

/// Both data stores.
pub struct DataStore {
    /// Key/value sessions.
    pub sessions: DataSessions,
    /// Captured records.
    pub entries: DataEntries,
}

impl DataStore {
    /// Open (and create if needed) the stores under `storage_dir`.
    pub async fn open(storage_dir: &Path) -> Result<Self> {
        Ok(Self {
            sessions: DataSessions::open(storage_dir.join("sessions")).await?,
            entries: DataEntries::open(storage_dir.join("file_data")).await?,
        })
    }
}

/// Ids become file names, so only accept what we generate ourselves.
pub(crate) fn is_safe_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

pub(crate) async fn write_json<T: Serialize>(path: PathBuf, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    tokio::task::spawn_blocking(move || -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, &path)
    })
    .await??;
    Ok(())
}

pub(crate) async fn read_json<T: DeserializeOwned + Send + 'static>(path: PathBuf) -> Result<Option<T>> {
    tokio::task::spawn_blocking(move || -> Result<Option<T>> {
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    })
    .await?
}

pub(crate) async fn remove_file(path: PathBuf) -> Result<bool> {
    tokio::task::spawn_blocking(move || -> Result<bool> {
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    })
    .await?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_with_path_characters_are_rejected() {
        assert!(is_safe_id("0b6c1f3e-58a5-4a0e-9d2b-6f4c8f1e2a77"));
        assert!(!is_safe_id("../state"));
        assert!(!is_safe_id(""));
        assert!(!is_safe_id("a/b"));
    }

    #[tokio::test]
    async fn json_helpers_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/value.json");
        write_json(path.clone(), &serde_json::json!({"a": 1})).await.unwrap();
        let value: Option<serde_json::Value> = read_json(path.clone()).await.unwrap();
        assert_eq!(value.unwrap()["a"], 1);
        assert!(remove_file(path.clone()).await.unwrap());
        assert!(!remove_file(path.clone()).await.unwrap());
        let gone: Option<serde_json::Value> = read_json(path).await.unwrap();
        assert!(gone.is_none());
    }
}
