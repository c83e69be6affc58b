//! Session records: what the manager knows about each live sandbox, kept in
//! a store that other processes can read.
//!
//! Records are keyed by the rendered [`SessionKey`] and expire a fixed time
//! after their last write.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::limits::ResourceLimits;
use crate::session::{CodeSession, SessionKey};

/// How long a record survives without being refreshed.
pub const DEFAULT_RECORD_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Errors from a record store.
#[derive(Debug, Error)]
pub enum RecordError {
    /// The store could not be reached or refused the operation.
    #[error("session record store {operation} failed: {message}")]
    Backend {
        /// Store operation
        operation: &'static str,
        /// Store-specific detail
        message: String,
    },
    /// A record could not be encoded or decoded.
    #[error("session record encoding: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Persistent description of one sandbox session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Sandbox id handed to tool callers.
    pub session_id: String,
    /// Registry key.
    pub key: SessionKey,
    /// Backend handle of the sandbox.
    pub container_handle: String,
    /// Backend the sandbox lives on.
    pub backend: String,
    /// Image the sandbox runs.
    pub image: String,
    /// Working directory inside the sandbox.
    pub workdir: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last time the session was resolved.
    pub last_used_at: DateTime<Utc>,
    /// Sandbox environment.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Limits the sandbox was created with.
    pub limits: ResourceLimits,
}

impl SessionRecord {
    /// Record describing `session` on the backend called `backend`.
    pub fn from_session(session: &CodeSession, backend: &str) -> Self {
        Self {
            session_id: session.id.clone(),
            key: session.key.clone(),
            container_handle: session.container_handle.clone(),
            backend: backend.to_string(),
            image: session.config.resolved_image(),
            workdir: session.config.resolved_workdir().to_string(),
            created_at: session.created_at,
            last_used_at: session.last_used_at,
            env: session.config.env.clone(),
            limits: session.config.limits.clone(),
        }
    }
}

/// Keyed store of [`SessionRecord`]s.
///
/// Prefixes match rendered keys, see [`SessionKey::scope_prefix`].
#[async_trait]
pub trait SessionRecordStore: Send + Sync {
    /// Insert or replace the record for `record.key`.
    async fn put(&self, record: SessionRecord) -> Result<(), RecordError>;

    /// Record for `key`, if present and not expired.
    async fn get(&self, key: &SessionKey) -> Result<Option<SessionRecord>, RecordError>;

    /// Record whose `session_id` is `id`.
    async fn get_by_session_id(&self, id: &str) -> Result<Option<SessionRecord>, RecordError>;

    /// Remove the record for `key`. Returns whether there was one.
    async fn delete(&self, key: &SessionKey) -> Result<bool, RecordError>;

    /// Remove every record whose rendered key starts with `prefix`.
    async fn delete_by_prefix(&self, prefix: &str) -> Result<usize, RecordError>;

    /// Every live record whose rendered key starts with `prefix`.
    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<SessionRecord>, RecordError>;

    /// Every live record.
    async fn list(&self) -> Result<Vec<SessionRecord>, RecordError> {
        self.list_by_prefix("").await
    }

    /// Set `last_used_at` to now and restart the expiry clock.
    ///
    /// Returns `false` when there is no record for `key`.
    async fn update_last_used(&self, key: &SessionKey) -> Result<bool, RecordError>;
}

#[derive(Debug, Clone)]
struct Stored {
    record: SessionRecord,
    expires_at: Instant,
}

/// Record store in process memory.
#[derive(Debug)]
pub struct MemorySessionRecordStore {
    ttl: Duration,
    records: RwLock<HashMap<String, Stored>>,
}

impl Default for MemorySessionRecordStore {
    fn default() -> Self {
        Self::with_ttl(DEFAULT_RECORD_TTL)
    }
}

impl MemorySessionRecordStore {
    /// Store with the default 24 hour expiry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store whose records expire `ttl` after their last write.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            records: RwLock::new(HashMap::new()),
        }
    }

    fn stored(&self, record: SessionRecord) -> Stored {
        Stored {
            record,
            expires_at: Instant::now() + self.ttl,
        }
    }
}

fn live(stored: &Stored, now: Instant) -> bool {
    stored.expires_at > now
}

#[async_trait]
impl SessionRecordStore for MemorySessionRecordStore {
    async fn put(&self, record: SessionRecord) -> Result<(), RecordError> {
        let key = record.key.to_string();
        let stored = self.stored(record);
        let mut records = self.records.write().await;
        let now = Instant::now();
        records.retain(|_, s| live(s, now));
        records.insert(key, stored);
        Ok(())
    }

    async fn get(&self, key: &SessionKey) -> Result<Option<SessionRecord>, RecordError> {
        let now = Instant::now();
        Ok(self
            .records
            .read()
            .await
            .get(&key.to_string())
            .filter(|s| live(s, now))
            .map(|s| s.record.clone()))
    }

    async fn get_by_session_id(&self, id: &str) -> Result<Option<SessionRecord>, RecordError> {
        let now = Instant::now();
        Ok(self
            .records
            .read()
            .await
            .values()
            .find(|s| live(s, now) && s.record.session_id == id)
            .map(|s| s.record.clone()))
    }

    async fn delete(&self, key: &SessionKey) -> Result<bool, RecordError> {
        let now = Instant::now();
        let removed = self.records.write().await.remove(&key.to_string());
        Ok(removed.is_some_and(|s| live(&s, now)))
    }

    async fn delete_by_prefix(&self, prefix: &str) -> Result<usize, RecordError> {
        let now = Instant::now();
        let mut records = self.records.write().await;
        let before = records.len();
        let mut expired = 0;
        records.retain(|key, s| {
            if !key.starts_with(prefix) {
                return true;
            }
            if !live(s, now) {
                expired += 1;
            }
            false
        });
        Ok(before - records.len() - expired)
    }

    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<SessionRecord>, RecordError> {
        let now = Instant::now();
        let mut records: Vec<SessionRecord> = self
            .records
            .read()
            .await
            .iter()
            .filter(|(key, s)| key.starts_with(prefix) && live(s, now))
            .map(|(_, s)| s.record.clone())
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    async fn update_last_used(&self, key: &SessionKey) -> Result<bool, RecordError> {
        let now = Instant::now();
        let mut records = self.records.write().await;
        match records.get_mut(&key.to_string()) {
            Some(stored) if live(stored, now) => {
                stored.record.last_used_at = Utc::now();
                stored.expires_at = now + self.ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::session::{Scope, SessionConfig, SessionStatus};

    fn record(key: SessionKey, id: &str) -> SessionRecord {
        let now = Utc::now();
        SessionRecord::from_session(
            &CodeSession {
                id: id.to_string(),
                container_handle: format!("c-{id}"),
                key,
                config: SessionConfig::default(),
                status: SessionStatus::Ready,
                created_at: now,
                last_used_at: now,
            },
            "memory",
        )
    }

    #[test]
    fn test_record_describes_session() {
        let record = record(SessionKey::agent("run-1"), "sbx_1");
        assert_eq!(record.image, "python:3.11-slim");
        assert_eq!(record.workdir, "/work");
        assert_eq!(record.backend, "memory");

        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("env").is_none());
        assert_eq!(json["key"]["scope_id"], "run-1");
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemorySessionRecordStore::new();
        let key = SessionKey::workflow("wf-1");
        store.put(record(key.clone(), "sbx_1")).await.unwrap();

        assert_eq!(store.get(&key).await.unwrap().unwrap().session_id, "sbx_1");
        assert_eq!(
            store.get_by_session_id("sbx_1").await.unwrap().unwrap().key,
            key
        );
        assert!(store.get_by_session_id("sbx_2").await.unwrap().is_none());

        assert!(store.delete(&key).await.unwrap());
        assert!(!store.delete(&key).await.unwrap());
        assert!(store.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_prefix_matches_one_scope_only() {
        let store = MemorySessionRecordStore::new();
        store
            .put(record(SessionKey::workflow("wf-1"), "a"))
            .await
            .unwrap();
        store
            .put(record(SessionKey::named(Scope::Workflow, "wf-1", "scratch"), "b"))
            .await
            .unwrap();
        store
            .put(record(SessionKey::workflow("wf-10"), "c"))
            .await
            .unwrap();

        let prefix = SessionKey::scope_prefix(Scope::Workflow, "wf-1");
        assert_eq!(store.list_by_prefix(&prefix).await.unwrap().len(), 2);
        assert_eq!(store.delete_by_prefix(&prefix).await.unwrap(), 2);

        let left = store.list().await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].session_id, "c");
    }

    #[tokio::test(start_paused = true)]
    async fn test_records_expire_unless_refreshed() {
        let store = MemorySessionRecordStore::with_ttl(Duration::from_secs(60));
        let stale = SessionKey::agent("stale");
        let fresh = SessionKey::agent("fresh");
        store.put(record(stale.clone(), "s")).await.unwrap();
        store.put(record(fresh.clone(), "f")).await.unwrap();

        tokio::time::advance(Duration::from_secs(45)).await;
        assert!(store.update_last_used(&fresh).await.unwrap());
        tokio::time::advance(Duration::from_secs(30)).await;

        assert!(store.get(&stale).await.unwrap().is_none());
        assert!(!store.update_last_used(&stale).await.unwrap());
        assert!(store.get(&fresh).await.unwrap().is_some());
        assert_eq!(store.list().await.unwrap().len(), 1);
    }
}
