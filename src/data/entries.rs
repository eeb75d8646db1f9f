use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{is_safe_id, read_json, remove_file, write_json};
use crate::error::{Error, Result};

/// A captured record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataEntry {
    /// Entry id.
    pub id: String,
    /// Free-form type tag, e.g. `page_content` or `extracted_links`.
    #[serde(rename = "type")]
    pub entry_type: String,
    /// Capture time.
    pub timestamp: DateTime<Utc>,
    /// Payload.
    pub data: Value,
    /// Context about the payload (source page, URL, ...).
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexRecord {
    #[serde(rename = "type")]
    entry_type: String,
    timestamp: DateTime<Utc>,
}

/// Filter for [`DataEntries::query`].
#[derive(Debug, Clone, Default)]
pub struct EntryQuery {
    /// Exact type match.
    pub entry_type: Option<String>,
    /// Inclusive lower bound.
    pub start: Option<DateTime<Utc>>,
    /// Inclusive upper bound.
    pub end: Option<DateTime<Utc>>,
    /// Maximum number of entries, newest first.
    pub limit: Option<usize>,
}

impl EntryQuery {
    fn matches(&self, record: &IndexRecord) -> bool {
        if let Some(ref t) = self.entry_type {
            if &record.entry_type != t {
                return false;
            }
        }
        if self.start.is_some_and(|start| record.timestamp < start) {
            return false;
        }
        if self.end.is_some_and(|end| record.timestamp > end) {
            return false;
        }
        true
    }
}

/// File-backed entry store with a JSON index.
pub struct DataEntries {
    dir: PathBuf,
    index: Mutex<BTreeMap<String, IndexRecord>>,
}

impl DataEntries {
    /// Open the store in `dir`. An unreadable index starts empty.
    pub async fn open(dir: PathBuf) -> Result<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        let index = match read_json::<BTreeMap<String, IndexRecord>>(dir.join("index.json")).await {
            Ok(index) => index.unwrap_or_default(),
            Err(e) => {
                warn!(error = %e, "data index unreadable, starting empty");
                BTreeMap::new()
            }
        };
        info!(entries = index.len(), "loaded data index");
        Ok(Self {
            dir,
            index: Mutex::new(index),
        })
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Store a new entry.
    pub async fn save(
        &self,
        entry_type: impl Into<String>,
        data: Value,
        metadata: Map<String, Value>,
    ) -> Result<DataEntry> {
        let entry = DataEntry {
            id: uuid::Uuid::new_v4().to_string(),
            entry_type: entry_type.into(),
            timestamp: Utc::now(),
            data,
            metadata,
        };

        write_json(self.path_for(&entry.id), &entry).await?;

        let mut index = self.index.lock().await;
        index.insert(
            entry.id.clone(),
            IndexRecord {
                entry_type: entry.entry_type.clone(),
                timestamp: entry.timestamp,
            },
        );
        write_json(self.dir.join("index.json"), &*index).await?;

        debug!(entry_id = %entry.id, entry_type = %entry.entry_type, "saved data entry");
        Ok(entry)
    }

    /// Load an entry by id.
    pub async fn load(&self, id: &str) -> Result<DataEntry> {
        if !is_safe_id(id) || !self.index.lock().await.contains_key(id) {
            return Err(Error::EntryNotFound(id.to_string()));
        }
        read_json(self.path_for(id))
            .await?
            .ok_or_else(|| Error::EntryNotFound(id.to_string()))
    }

    /// Delete an entry. Returns whether it existed.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let mut index = self.index.lock().await;
        if index.remove(id).is_none() {
            return Ok(false);
        }
        remove_file(self.path_for(id)).await?;
        write_json(self.dir.join("index.json"), &*index).await?;
        debug!(entry_id = id, "deleted data entry");
        Ok(true)
    }

    /// Entries matching `query`, newest first.
    pub async fn query(&self, query: &EntryQuery) -> Result<Vec<DataEntry>> {
        let mut matching: Vec<(String, DateTime<Utc>)> = self
            .index
            .lock()
            .await
            .iter()
            .filter(|(_, record)| query.matches(record))
            .map(|(id, record)| (id.clone(), record.timestamp))
            .collect();
        matching.sort_by(|a, b| b.1.cmp(&a.1));
        if let Some(limit) = query.limit {
            matching.truncate(limit);
        }

        let mut entries = Vec::with_capacity(matching.len());
        for (id, _) in matching {
            match read_json::<DataEntry>(self.path_for(&id)).await {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => warn!(entry_id = %id, "indexed entry missing on disk"),
                Err(e) => warn!(entry_id = %id, error = %e, "skipping unreadable entry"),
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn save_load_delete() {
        let dir = tempfile::tempdir().unwrap();
        let entries = DataEntries::open(dir.path().to_path_buf()).await.unwrap();

        let mut meta = Map::new();
        meta.insert("page_id".into(), json!("1"));
        let saved = entries
            .save("page_content", json!({"title": "Example"}), meta)
            .await
            .unwrap();

        let loaded = entries.load(&saved.id).await.unwrap();
        assert_eq!(loaded, saved);
        assert_eq!(loaded.metadata["page_id"], "1");

        assert!(entries.delete(&saved.id).await.unwrap());
        assert!(!entries.delete(&saved.id).await.unwrap());
        assert!(matches!(
            entries.load(&saved.id).await,
            Err(Error::EntryNotFound(_))
        ));
    }

    #[tokio::test]
    async fn query_filters_sorts_and_limits() {
        let dir = tempfile::tempdir().unwrap();
        let entries = DataEntries::open(dir.path().to_path_buf()).await.unwrap();

        let first = entries.save("extracted_links", json!(1), Map::new()).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        entries.save("page_html", json!(2), Map::new()).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let third = entries.save("extracted_links", json!(3), Map::new()).await.unwrap();

        let links = entries
            .query(&EntryQuery {
                entry_type: Some("extracted_links".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        let ids: Vec<&str> = links.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, [third.id.as_str(), first.id.as_str()]);

        let newest = entries
            .query(&EntryQuery {
                limit: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(newest[0].id, third.id);

        let after_first = entries
            .query(&EntryQuery {
                start: Some(third.timestamp),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(after_first.len(), 1);
    }

    #[tokio::test]
    async fn index_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let entries = DataEntries::open(dir.path().to_path_buf()).await.unwrap();
            entries.save("page_metadata", json!({}), Map::new()).await.unwrap().id
        };
        let entries = DataEntries::open(dir.path().to_path_buf()).await.unwrap();
        assert!(entries.load(&id).await.is_ok());
    }
}
