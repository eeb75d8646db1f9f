//! Durable page metadata.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::lock::{LockOutcome, StateLock};
use super::page_id::PageId;
use crate::error::Result;

/// Seconds since the Unix epoch, with sub-second precision.
pub fn now_secs() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// What we remember about a page id between processes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageMetadata {
    /// Last URL a handler reported for the page.
    #[serde(default)]
    pub last_url: Option<String>,
    /// When the id was first registered.
    #[serde(default)]
    pub created_at: f64,
    /// Last successful lookup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_accessed: Option<f64>,
    /// Last URL report.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<f64>,
    /// Fields written by other tools, carried through untouched.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl PageMetadata {
    /// Metadata for a page registered now, sitting on `url`.
    pub fn new(url: impl Into<String>) -> Self {
        let now = now_secs();
        Self {
            last_url: Some(url.into()),
            created_at: now,
            last_accessed: Some(now),
            last_updated: None,
            extra: serde_json::Map::new(),
        }
    }
}

/// On-disk layout of the state file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    /// Every known page id.
    #[serde(rename = "pageMetadata", alias = "page_metadata", default)]
    pub page_metadata: BTreeMap<PageId, PageMetadata>,
}

/// Reads and writes [`PersistedState`] under a [`StateLock`].
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
    lock: StateLock,
}

impl StateStore {
    /// Store backed by `path`, guarded by `lock`.
    pub fn new(path: impl Into<PathBuf>, lock: StateLock) -> Self {
        Self {
            path: path.into(),
            lock,
        }
    }

    /// State file location.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted state. A missing or unreadable file yields an empty
    /// state; this never fails.
    pub async fn load(&self) -> PersistedState {
        let path = self.path.clone();
        let lock = self.lock.clone();
        let loaded = tokio::task::spawn_blocking(move || lock.hold(|| read_state(&path)).1).await;

        match loaded {
            Ok(Ok(Some(state))) => {
                info!(pages = state.page_metadata.len(), path = %self.path.display(), "loaded page state");
                state
            }
            Ok(Ok(None)) => {
                info!(path = %self.path.display(), "no saved page state, starting fresh");
                PersistedState::default()
            }
            Ok(Err(e)) => {
                warn!(path = %self.path.display(), error = %e, "page state unreadable, starting fresh");
                PersistedState::default()
            }
            Err(e) => {
                warn!(error = %e, "page state load task failed, starting fresh");
                PersistedState::default()
            }
        }
    }

    /// Write `state` in full, replacing the previous file atomically.
    pub async fn save(&self, state: &PersistedState) -> Result<LockOutcome> {
        let bytes = serde_json::to_vec_pretty(state)?;
        let path = self.path.clone();
        let lock = self.lock.clone();
        let pages = state.page_metadata.len();

        let (outcome, written) =
            tokio::task::spawn_blocking(move || lock.hold(|| write_atomic(&path, &bytes))).await?;
        written?;

        debug!(pages, ?outcome, "saved page state");
        Ok(outcome)
    }
}

fn read_state(path: &Path) -> Result<Option<PersistedState>> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(serde_json::from_slice(&data)?))
}

fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn store_in(dir: &Path) -> StateStore {
        let lock = StateLock::new(
            dir.join("browser_lock"),
            Duration::from_millis(100),
            Duration::from_millis(10),
        );
        StateStore::new(dir.join("browser_state.json"), lock)
    }

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        assert!(store.load().await.page_metadata.is_empty());
    }

    #[tokio::test]
    async fn corrupt_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        fs::write(store.path(), b"{ not json").unwrap();
        assert!(store.load().await.page_metadata.is_empty());
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());

        let mut state = PersistedState::default();
        let mut meta = PageMetadata::new("https://example.com");
        meta.last_updated = Some(1.5);
        state.page_metadata.insert(PageId::from_number(1), meta);
        state
            .page_metadata
            .insert(PageId::parse("docs").unwrap(), PageMetadata::new("about:blank"));

        let outcome = store.save(&state).await.unwrap();
        assert_eq!(outcome, LockOutcome::Acquired);

        let loaded = store.load().await;
        assert_eq!(loaded, state);

        // load then save without mutation leaves the file byte-identical
        let before = fs::read(store.path()).unwrap();
        store.save(&loaded).await.unwrap();
        assert_eq!(fs::read(store.path()).unwrap(), before);
    }

    #[tokio::test]
    async fn wire_layout_uses_page_metadata_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let mut state = PersistedState::default();
        state
            .page_metadata
            .insert(PageId::from_number(4), PageMetadata::new("https://a.test"));
        store.save(&state).await.unwrap();

        let raw: serde_json::Value =
            serde_json::from_slice(&fs::read(store.path()).unwrap()).unwrap();
        let entry = &raw["pageMetadata"]["4"];
        assert_eq!(entry["last_url"], "https://a.test");
        assert!(entry["created_at"].is_number());
        assert!(entry["last_accessed"].is_number());
    }

    #[tokio::test]
    async fn legacy_snake_case_key_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        fs::write(
            store.path(),
            br#"{"page_metadata": {"2": {"created_at": 10.0, "last_url": "https://b.test", "title": "B"}}}"#,
        )
        .unwrap();

        let state = store.load().await;
        let meta = &state.page_metadata[&PageId::from_number(2)];
        assert_eq!(meta.last_url.as_deref(), Some("https://b.test"));
        assert_eq!(meta.last_accessed, None);
        assert_eq!(meta.extra["title"], "B");
    }
}
