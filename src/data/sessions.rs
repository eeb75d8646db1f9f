use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{is_safe_id, read_json, remove_file, write_json};
use crate::error::{Error, Result};

/// A named key/value scratchpad.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSession {
    /// Session id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last read or write.
    pub last_accessed: DateTime<Utc>,
    /// Idle lifetime in seconds; `None` never expires.
    pub expiration: Option<u64>,
    /// Stored values.
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl DataSession {
    fn new(name: Option<String>, expiration: Option<u64>) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        Self {
            name: name.unwrap_or_else(|| format!("Session {id}")),
            id,
            created_at: now,
            last_accessed: now,
            expiration,
            data: Map::new(),
        }
    }

    /// Whether the idle lifetime has run out at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.expiration {
            None => false,
            Some(secs) => {
                let secs = i64::try_from(secs).unwrap_or(i64::MAX);
                match ChronoDuration::try_seconds(secs)
                    .and_then(|ttl| self.last_accessed.checked_add_signed(ttl))
                {
                    Some(deadline) => now > deadline,
                    None => false,
                }
            }
        }
    }
}

/// File-backed [`DataSession`] store, one JSON file per session.
pub struct DataSessions {
    dir: PathBuf,
    active: Mutex<HashMap<String, DataSession>>,
}

impl DataSessions {
    /// Load every unexpired session from `dir`.
    pub async fn open(dir: PathBuf) -> Result<Self> {
        tokio::fs::create_dir_all(&dir).await?;

        let mut active = HashMap::new();
        let mut reader = tokio::fs::read_dir(&dir).await?;
        let now = Utc::now();
        while let Some(entry) = reader.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_json::<DataSession>(path.clone()).await {
                Ok(Some(session)) if !session.is_expired_at(now) => {
                    active.insert(session.id.clone(), session);
                }
                Ok(_) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable data session"),
            }
        }

        info!(sessions = active.len(), "loaded data sessions");
        Ok(Self {
            dir,
            active: Mutex::new(active),
        })
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Create and persist a session.
    pub async fn create(&self, name: Option<String>, expiration: Option<u64>) -> Result<DataSession> {
        let session = DataSession::new(name, expiration);
        write_json(self.path_for(&session.id), &session).await?;
        self.active
            .lock()
            .await
            .insert(session.id.clone(), session.clone());
        info!(session_id = %session.id, "created data session");
        Ok(session)
    }

    /// Run `f` on a live session, refreshing its access time and saving it.
    async fn with_session<T>(&self, id: &str, f: impl FnOnce(&mut DataSession) -> T) -> Result<T> {
        if !is_safe_id(id) {
            return Err(Error::SessionNotFound(id.to_string()));
        }

        let mut active = self.active.lock().await;
        if !active.contains_key(id) {
            if let Some(session) = read_json::<DataSession>(self.path_for(id)).await? {
                active.insert(id.to_string(), session);
            }
        }

        let now = Utc::now();
        let Some(session) = active.get_mut(id) else {
            return Err(Error::SessionNotFound(id.to_string()));
        };
        if session.is_expired_at(now) {
            active.remove(id);
            remove_file(self.path_for(id)).await?;
            info!(session_id = id, "data session expired");
            return Err(Error::SessionNotFound(id.to_string()));
        }

        session.last_accessed = now;
        let out = f(session);
        write_json(self.path_for(id), &*session).await?;
        Ok(out)
    }

    /// Fetch a session.
    pub async fn get(&self, id: &str) -> Result<DataSession> {
        self.with_session(id, |session| session.clone()).await
    }

    /// Store `value` under `key`.
    pub async fn set_value(&self, id: &str, key: &str, value: Value) -> Result<DataSession> {
        self.with_session(id, |session| {
            session.data.insert(key.to_string(), value);
            session.clone()
        })
        .await
    }

    /// Read `key`, if set.
    pub async fn get_value(&self, id: &str, key: &str) -> Result<Option<Value>> {
        self.with_session(id, |session| session.data.get(key).cloned())
            .await
    }

    /// Remove `key`. Returns whether it was set.
    pub async fn delete_value(&self, id: &str, key: &str) -> Result<bool> {
        self.with_session(id, |session| session.data.remove(key).is_some())
            .await
    }

    /// Delete a session. Returns whether it existed.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        if !is_safe_id(id) {
            return Ok(false);
        }
        let was_active = self.active.lock().await.remove(id).is_some();
        let had_file = remove_file(self.path_for(id)).await?;
        debug!(session_id = id, "deleted data session");
        Ok(was_active || had_file)
    }

    /// Delete every expired session, in memory and on disk. Returns how many
    /// were removed.
    pub async fn cleanup_expired(&self) -> Result<usize> {
        let now = Utc::now();
        let mut removed = 0;

        {
            let mut active = self.active.lock().await;
            let expired: Vec<String> = active
                .values()
                .filter(|s| s.is_expired_at(now))
                .map(|s| s.id.clone())
                .collect();
            for id in expired {
                active.remove(&id);
                remove_file(self.path_for(&id)).await?;
                removed += 1;
            }
        }

        let mut reader = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = reader.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Ok(Some(session)) = read_json::<DataSession>(path.clone()).await {
                if session.is_expired_at(now) && remove_file(path).await? {
                    removed += 1;
                }
            }
        }

        info!(removed, "cleaned up expired data sessions");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn values_persist_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let sessions = DataSessions::open(dir.path().to_path_buf()).await.unwrap();
            let session = sessions.create(Some("research".into()), None).await.unwrap();
            sessions
                .set_value(&session.id, "links", json!(["https://a.test"]))
                .await
                .unwrap();
            session.id
        };

        let sessions = DataSessions::open(dir.path().to_path_buf()).await.unwrap();
        let session = sessions.get(&id).await.unwrap();
        assert_eq!(session.name, "research");
        assert_eq!(
            sessions.get_value(&id, "links").await.unwrap(),
            Some(json!(["https://a.test"]))
        );
        assert_eq!(sessions.get_value(&id, "missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn expired_sessions_disappear() {
        let dir = tempfile::tempdir().unwrap();
        let sessions = DataSessions::open(dir.path().to_path_buf()).await.unwrap();
        let session = sessions.create(None, Some(0)).await.unwrap();
        assert!(session.name.starts_with("Session "));

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let err = sessions.get(&session.id).await.unwrap_err();
        assert!(matches!(err, Error::SessionNotFound(_)));
        assert!(!dir.path().join(format!("{}.json", session.id)).exists());
    }

    #[tokio::test]
    async fn cleanup_counts_removed_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let sessions = DataSessions::open(dir.path().to_path_buf()).await.unwrap();
        sessions.create(None, Some(0)).await.unwrap();
        sessions.create(None, Some(0)).await.unwrap();
        let keep = sessions.create(None, None).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(sessions.cleanup_expired().await.unwrap(), 2);
        assert!(sessions.get(&keep.id).await.is_ok());
    }

    #[tokio::test]
    async fn delete_and_unsafe_ids() {
        let dir = tempfile::tempdir().unwrap();
        let sessions = DataSessions::open(dir.path().to_path_buf()).await.unwrap();
        let session = sessions.create(None, None).await.unwrap();
        assert!(sessions.delete(&session.id).await.unwrap());
        assert!(!sessions.delete(&session.id).await.unwrap());
        assert!(matches!(
            sessions.get("../browser_state").await,
            Err(Error::SessionNotFound(_))
        ));
    }
}
