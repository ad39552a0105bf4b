use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Sqlite, Row, sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous}};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::catalog::ModelDescriptor;
use crate::error::{ChatError, Result};
use crate::session::{
    Message, MessageView, ModelUsageStats, NewMessage, Role, Session, SessionPatch, SessionStats,
    SessionSummary, average_response_time,
};

/// Where the serialized store blob lives.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<String>>;
    async fn save(&self, key: &str, blob: &str) -> Result<()>;
}

/// Process-scoped backend; the blob disappears with the process.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, String>>,
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn load(&self, key: &str) -> Result<Option<String>> {
        Ok(self.blobs.lock().await.get(key).cloned())
    }

    async fn save(&self, key: &str, blob: &str) -> Result<()> {
        self.blobs.lock().await.insert(key.to_owned(), blob.to_owned());
        Ok(())
    }
}

#[derive(Clone)]
pub struct SqliteBlobStore {
    pool: Pool<Sqlite>,
}

impl SqliteBlobStore {
    pub async fn initialize(database_url: Option<String>) -> Result<Self> {
        let url = match database_url {
            Some(u) => u,
            None => resolve_default_db_url()?,
        };
        let options = url.parse::<SqliteConnectOptions>()?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);
        let pool = Pool::<Sqlite>::connect_with(options).await?;
        sqlx::query("PRAGMA busy_timeout = 5000;").execute(&pool).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        debug!(%url, "sqlite blob store ready");
        Ok(Self { pool })
    }

    #[cfg(test)]
    pub fn pool(&self) -> &Pool<Sqlite> { &self.pool }
}

fn resolve_default_db_url() -> Result<String> {
    let base = std::env::var("XDG_DATA_HOME").ok().map(PathBuf::from).unwrap_or_else(|| {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
        PathBuf::from(home).join(".local").join("share")
    });
    let dir = base.join("polychat");
    std::fs::create_dir_all(&dir).map_err(ChatError::storage)?;
    let path = dir.join("polychat.db");
    Ok(format!("sqlite://{}", path.to_string_lossy()))
}

#[async_trait]
impl BlobStore for SqliteBlobStore {
    async fn load(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM blobs WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>("value")))
    }

    async fn save(&self, key: &str, blob: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO blobs (key, value, updated_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(blob)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Opens the backend named by a database URL; `memory` selects the in-process map.
pub async fn open_backend(database_url: Option<String>) -> Result<Arc<dyn BlobStore>> {
    match database_url.as_deref() {
        Some("memory") => Ok(Arc::new(MemoryBlobStore::default())),
        _ => Ok(Arc::new(SqliteBlobStore::initialize(database_url).await?)),
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct StoreData {
    sessions: Vec<Session>,
    messages: Vec<Message>,
    current_session_id: Option<Uuid>,
    available_models: Vec<ModelDescriptor>,
    settings: BTreeMap<String, String>,
}

impl StoreData {
    fn session_mut(&mut self, id: Uuid) -> Result<&mut Session> {
        self.sessions
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| ChatError::not_found("session", id))
    }

    fn model_name(&self, model_id: Option<&str>) -> Option<String> {
        let id = model_id?;
        self.available_models
            .iter()
            .find(|m| m.model_id == id)
            .map(|m| m.display_name.clone())
    }
}

/// Session, message and model-catalog records behind one serialized blob.
///
/// Writes go through [`SessionStore::commit`]: the change is applied to a copy,
/// the copy is saved, and only then does it replace the visible state.
pub struct SessionStore {
    backend: Arc<dyn BlobStore>,
    key: String,
    data: RwLock<StoreData>,
}

impl SessionStore {
    /// Loads the blob under `key`. Sessions, the current pointer and settings
    /// survive a reload; messages do not, and the catalog is always replaced.
    pub async fn initialize(
        backend: Arc<dyn BlobStore>,
        key: impl Into<String>,
        catalog: Vec<ModelDescriptor>,
    ) -> Result<Self> {
        let key = key.into();
        let mut data = match backend.load(&key).await? {
            Some(blob) => serde_json::from_str::<StoreData>(&blob).unwrap_or_else(|e| {
                warn!(%key, error = %e, "discarding unreadable store blob");
                StoreData::default()
            }),
            None => StoreData::default(),
        };
        data.messages.clear();
        data.available_models = catalog;
        backend.save(&key, &serde_json::to_string(&data)?).await?;
        info!(
            %key,
            sessions = data.sessions.len(),
            models = data.available_models.len(),
            "session store initialized"
        );
        Ok(Self { backend, key, data: RwLock::new(data) })
    }

    async fn commit<T>(&self, f: impl FnOnce(&mut StoreData) -> Result<T>) -> Result<T> {
        let mut guard = self.data.write().await;
        let mut next = guard.clone();
        let out = f(&mut next)?;
        let blob = serde_json::to_string(&next)?;
        if let Err(e) = self.backend.save(&self.key, &blob).await {
            error!(key = %self.key, error = %e, "store commit failed");
            return Err(e);
        }
        *guard = next;
        Ok(out)
    }

    /// Starts a fresh session, evicting every prior session and message.
    pub async fn create_session(
        &self,
        user_id: Option<String>,
        model_id: impl Into<String>,
        title: impl Into<String>,
    ) -> Result<Session> {
        let session = Session::new(user_id, model_id.into(), title.into());
        let created = session.clone();
        self.commit(move |d| {
            d.sessions.clear();
            d.messages.clear();
            d.current_session_id = Some(session.id);
            d.sessions.push(session);
            Ok(())
        })
        .await?;
        info!(session_id = %created.id, model = %created.model_id, "session created");
        Ok(created)
    }

    pub async fn get_session(&self, id: Uuid) -> Option<Session> {
        self.data.read().await.sessions.iter().find(|s| s.id == id).cloned()
    }

    /// Non-archived sessions for `user_id`, most recently active first.
    pub async fn list_sessions(
        &self,
        user_id: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Vec<SessionSummary> {
        let d = self.data.read().await;
        let mut sessions: Vec<&Session> = d
            .sessions
            .iter()
            .filter(|s| !s.archived && s.user_id.as_deref() == user_id)
            .collect();
        sessions.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        sessions
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|s| {
                let own = d.messages.iter().filter(|m| m.session_id == s.id);
                let (count, last) = own.fold((0, None), |(n, _), m| (n + 1, Some(m.created_at)));
                SessionSummary {
                    session: s.clone(),
                    message_count: count,
                    last_message_at: last.unwrap_or(s.last_activity),
                }
            })
            .collect()
    }

    pub async fn update_session(&self, id: Uuid, patch: SessionPatch) -> Result<Session> {
        let updated = self
            .commit(move |d| {
                let s = d.session_mut(id)?;
                if let Some(title) = patch.title {
                    s.title = title;
                }
                if let Some(model_id) = patch.model_id {
                    s.model_id = model_id;
                }
                if let Some(archived) = patch.archived {
                    s.archived = archived;
                }
                let now = Utc::now();
                s.updated_at = now;
                s.last_activity = now;
                let s = s.clone();
                if s.archived && d.current_session_id == Some(id) {
                    d.current_session_id = None;
                }
                Ok(s)
            })
            .await?;
        debug!(session_id = %id, "session updated");
        Ok(updated)
    }

    /// Appends a message and bumps the owning session's last activity.
    pub async fn add_message(&self, new: NewMessage) -> Result<Message> {
        self.commit(move |d| {
            let now = Utc::now();
            // createdAt never runs backwards, so its order is insertion order
            let created_at = match d.messages.last() {
                Some(last) if last.created_at > now => last.created_at,
                _ => now,
            };
            let session = d.session_mut(new.session_id)?;
            session.last_activity = created_at;
            let message = Message {
                id: Uuid::new_v4(),
                session_id: new.session_id,
                role: new.role,
                content: new.content,
                model_id: new.model_id,
                token_count: new.token_count,
                response_time_ms: new.response_time_ms,
                created_at,
            };
            d.messages.push(message.clone());
            Ok(message)
        })
        .await
    }

    /// Messages of a session in ascending creation order, with model names resolved.
    pub async fn get_messages(&self, session_id: Uuid, limit: usize, offset: usize) -> Vec<MessageView> {
        let d = self.data.read().await;
        let mut own: Vec<&Message> = d.messages.iter().filter(|m| m.session_id == session_id).collect();
        own.sort_by_key(|m| m.created_at);
        own.into_iter()
            .skip(offset)
            .take(limit)
            .map(|m| MessageView {
                message: m.clone(),
                model_name: d.model_name(m.model_id.as_deref()),
            })
            .collect()
    }

    /// The last `k` messages of a session, oldest first.
    pub async fn recent_messages(&self, session_id: Uuid, k: usize) -> Vec<Message> {
        let d = self.data.read().await;
        let own: Vec<&Message> = d.messages.iter().filter(|m| m.session_id == session_id).collect();
        let skip = own.len().saturating_sub(k);
        own.into_iter().skip(skip).cloned().collect()
    }

    pub async fn get_message(&self, id: Uuid) -> Option<Message> {
        self.data.read().await.messages.iter().find(|m| m.id == id).cloned()
    }

    pub async fn message_count(&self) -> usize {
        self.data.read().await.messages.len()
    }

    /// Counts for one session. An unknown id yields all-zero stats rather than NotFound.
    pub async fn session_stats(&self, session_id: Uuid) -> SessionStats {
        let d = self.data.read().await;
        let own: Vec<&Message> = d.messages.iter().filter(|m| m.session_id == session_id).collect();
        SessionStats {
            total_messages: own.len(),
            user_messages: own.iter().filter(|m| m.role == Role::User).count(),
            assistant_messages: own.iter().filter(|m| m.role == Role::Assistant).count(),
            total_tokens: own.iter().filter_map(|m| m.token_count).sum(),
            avg_response_time_ms: average_response_time(own.iter().copied()),
        }
    }

    pub async fn model_usage_stats(&self, model_id: &str, days: i64) -> ModelUsageStats {
        let cutoff = Utc::now() - Duration::days(days);
        let d = self.data.read().await;
        let used: Vec<&Message> = d
            .messages
            .iter()
            .filter(|m| m.model_id.as_deref() == Some(model_id) && m.created_at >= cutoff)
            .collect();
        ModelUsageStats {
            total_requests: used.len(),
            total_tokens: used.iter().filter_map(|m| m.token_count).sum(),
            avg_response_time_ms: average_response_time(used.iter().copied()),
            unique_sessions: used.iter().map(|m| m.session_id).collect::<HashSet<_>>().len(),
        }
    }

    pub async fn available_models(&self) -> Vec<ModelDescriptor> {
        self.data.read().await.available_models.iter().filter(|m| m.active).cloned().collect()
    }

    pub async fn get_model(&self, model_id: &str) -> Option<ModelDescriptor> {
        self.data
            .read()
            .await
            .available_models
            .iter()
            .find(|m| m.model_id == model_id)
            .cloned()
    }

    /// Replaces the cached catalog; sessions and messages are untouched.
    pub async fn refresh_models(&self, catalog: Vec<ModelDescriptor>) -> Result<()> {
        self.commit(move |d| {
            d.available_models = catalog;
            Ok(())
        })
        .await
    }

    pub async fn current_session(&self) -> Option<Session> {
        let d = self.data.read().await;
        let id = d.current_session_id?;
        d.sessions.iter().find(|s| s.id == id).cloned()
    }

    pub async fn set_current_session(&self, id: Option<Uuid>) -> Result<()> {
        self.commit(move |d| {
            if let Some(id) = id {
                d.session_mut(id)?;
            }
            d.current_session_id = id;
            Ok(())
        })
        .await
    }

    pub async fn get_setting(&self, key: &str) -> Option<String> {
        self.data.read().await.settings.get(key).cloned()
    }

    pub async fn set_setting(&self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        let (key, value) = (key.into(), value.into());
        self.commit(move |d| {
            d.settings.insert(key, value);
            Ok(())
        })
        .await
    }

    pub async fn archive_older_than(&self, days: i64) -> Result<usize> {
        self.archive_inactive_since(Utc::now() - Duration::days(days)).await
    }

    /// Archives every live session whose last activity precedes `cutoff`.
    pub async fn archive_inactive_since(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let archived = self
            .commit(move |d| {
                let now = Utc::now();
                let mut n = 0;
                for s in d.sessions.iter_mut().filter(|s| !s.archived && s.last_activity < cutoff) {
                    s.archived = true;
                    s.updated_at = now;
                    n += 1;
                }
                let current_archived = d
                    .current_session_id
                    .is_some_and(|id| d.sessions.iter().any(|s| s.id == id && s.archived));
                if current_archived {
                    d.current_session_id = None;
                }
                Ok(n)
            })
            .await?;
        info!(archived, "archived inactive sessions");
        Ok(archived)
    }

    pub async fn purge_messages_older_than(&self, days: i64) -> Result<usize> {
        self.purge_messages_before(Utc::now() - Duration::days(days)).await
    }

    pub async fn purge_messages_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let deleted = self
            .commit(move |d| {
                let before = d.messages.len();
                d.messages.retain(|m| m.created_at >= cutoff);
                Ok(before - d.messages.len())
            })
            .await?;
        info!(deleted, "purged old messages");
        Ok(deleted)
    }

    /// Drops sessions, messages, the current pointer and settings; keeps the catalog.
    pub async fn clear_all(&self) -> Result<()> {
        self.commit(|d| {
            let models = std::mem::take(&mut d.available_models);
            *d = StoreData { available_models: models, ..StoreData::default() };
            Ok(())
        })
        .await
    }
}
