use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::catalog::{self, ModelDescriptor};
use crate::dispatcher::{Dispatcher, OpenRouterClient, Turn};
use crate::error::{ChatError, Result};
use crate::session::{
    DEFAULT_TITLE, Message, MessageView, NewMessage, Role, Session, SessionPatch, SessionStats,
    SessionSummary,
};
use crate::settings::AppConfig;
use crate::storage::{self, SessionStore};

const LAST_MODEL_KEY: &str = "last_model";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    NoSession,
    Active,
    Pending,
}

/// Both committed messages of a successful turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendOutcome {
    pub user_message: Message,
    pub assistant_message: Message,
    pub response_time_ms: u64,
    pub raw_model_id: String,
}

struct Current {
    session_id: Option<Uuid>,
    cancel: CancellationToken,
}

/// Clears the pending flag when a send finishes, however it finishes.
struct PendingGuard<'a>(&'a AtomicBool);

impl<'a> PendingGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| ChatError::Busy)?;
        Ok(Self(flag))
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Owns the active session pointer and runs conversation turns against the store and dispatcher.
pub struct ChatService {
    store: Arc<SessionStore>,
    dispatcher: Dispatcher,
    default_model: String,
    history_window: usize,
    current: RwLock<Current>,
    pending: AtomicBool,
}

impl ChatService {
    /// Resumes the store's current session if it is still live. A configured
    /// default model missing from the catalog falls back to the catalog default.
    pub async fn new(store: Arc<SessionStore>, dispatcher: Dispatcher, cfg: &AppConfig) -> Self {
        let session_id = store.current_session().await.filter(|s| !s.archived).map(|s| s.id);
        let default_model = match store.get_model(&cfg.default_model).await {
            Some(_) => cfg.default_model.clone(),
            None => {
                let models = store.available_models().await;
                let fallback = catalog::default_model(&models)
                    .map_or_else(|| cfg.default_model.clone(), |m| m.model_id.clone());
                warn!(configured = %cfg.default_model, %fallback, "default model not in catalog");
                fallback
            }
        };
        Self {
            store,
            dispatcher,
            default_model,
            history_window: cfg.history_window,
            current: RwLock::new(Current { session_id, cancel: CancellationToken::new() }),
            pending: AtomicBool::new(false),
        }
    }

    /// Builds the store, the HTTP backend and the service from configuration.
    pub async fn connect(cfg: &AppConfig) -> Result<Self> {
        cfg.validate()?;
        let models = catalog::builtin_models();
        let backend = storage::open_backend(cfg.database_url.clone()).await?;
        let store = Arc::new(SessionStore::initialize(backend, cfg.storage_key.clone(), models.clone()).await?);
        let client = Arc::new(OpenRouterClient::new(cfg)?);
        let dispatcher = Dispatcher::new(client, cfg.retry.clone(), models, cfg.global_defaults());
        Ok(Self::new(store, dispatcher, cfg).await)
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub async fn phase(&self) -> Phase {
        if self.pending.load(Ordering::Acquire) {
            Phase::Pending
        } else if self.current_session().await.is_some() {
            Phase::Active
        } else {
            Phase::NoSession
        }
    }

    pub async fn current_session(&self) -> Option<Session> {
        let id = self.current.read().await.session_id?;
        self.store.get_session(id).await.filter(|s| !s.archived)
    }

    async fn require_session(&self) -> Result<Session> {
        self.current_session()
            .await
            .ok_or_else(|| ChatError::not_found("session", "current"))
    }

    async fn ensure_model(&self, model_id: &str) -> Result<()> {
        match self.store.get_model(model_id).await {
            Some(_) => Ok(()),
            None => Err(ChatError::validation(format!("unknown model: {model_id}"))),
        }
    }

    /// Requested model, else the current session's, else the last one used, else the default.
    async fn resolve_model(&self, requested: Option<&str>) -> String {
        if let Some(m) = requested {
            return m.to_owned();
        }
        if let Some(s) = self.current_session().await {
            return s.model_id;
        }
        match self.store.get_setting(LAST_MODEL_KEY).await {
            Some(m) => m,
            None => self.default_model.clone(),
        }
    }

    /// Replaces the in-flight cancellation token, cancelling the old one.
    async fn detach(&self, next: Option<Uuid>) {
        let mut cur = self.current.write().await;
        cur.cancel.cancel();
        cur.cancel = CancellationToken::new();
        cur.session_id = next;
    }

    pub async fn create_session(&self, model_id: Option<&str>, user_id: Option<String>) -> Result<Session> {
        let model = self.resolve_model(model_id).await;
        self.ensure_model(&model).await?;
        let session = self.store.create_session(user_id, model.clone(), DEFAULT_TITLE).await?;
        self.store.set_setting(LAST_MODEL_KEY, model).await?;
        self.detach(Some(session.id)).await;
        Ok(session)
    }

    pub async fn load_session(&self, id: Uuid) -> Result<Session> {
        let session = self
            .store
            .get_session(id)
            .await
            .filter(|s| !s.archived)
            .ok_or_else(|| ChatError::not_found("session", id))?;
        self.store.set_current_session(Some(id)).await?;
        self.detach(Some(id)).await;
        info!(session_id = %id, "session loaded");
        Ok(session)
    }

    /// Commits the user message before dispatching, so it survives a failed dispatch.
    /// The assistant message is committed only on success.
    pub async fn send_message(&self, content: &str, model_id: Option<&str>) -> Result<SendOutcome> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ChatError::validation("message content is empty"));
        }
        let _pending = PendingGuard::acquire(&self.pending)?;
        if let Some(m) = model_id {
            self.ensure_model(m).await?;
        }
        let session = match self.current_session().await {
            Some(s) => s,
            None => self.create_session(model_id, None).await?,
        };
        let model = model_id.map_or_else(|| session.model_id.clone(), str::to_owned);
        let cancel = self.current.read().await.cancel.clone();
        counter!("polychat_sends_total").increment(1);

        let history = self.store.recent_messages(session.id, self.history_window).await;
        let started = Instant::now();
        let user_message = self
            .store
            .add_message(NewMessage::new(session.id, Role::User, content))
            .await?;

        let mut turns: Vec<Turn> = history.into_iter().map(|m| Turn::new(m.role, m.content)).collect();
        turns.push(Turn::new(Role::User, content));

        let completion = match self.dispatcher.dispatch(&model, &turns, &cancel).await {
            Ok(c) => c,
            Err(e) => {
                warn!(session_id = %session.id, kind = e.kind().as_str(), error = %e, "send failed; user message kept");
                return Err(e);
            }
        };
        if cancel.is_cancelled() {
            warn!(session_id = %session.id, "session torn down during dispatch; reply dropped");
            return Err(ChatError::Cancelled);
        }
        let response_time_ms = started.elapsed().as_millis() as u64;
        let assistant_message = self
            .store
            .add_message(
                NewMessage::new(session.id, Role::Assistant, completion.text)
                    .with_model(model.clone())
                    .with_usage(completion.token_count, response_time_ms),
            )
            .await?;
        info!(session_id = %session.id, %model, response_time_ms, "turn completed");
        Ok(SendOutcome {
            user_message,
            assistant_message,
            response_time_ms,
            raw_model_id: completion.raw_model_id,
        })
    }

    /// Changes the session's model, keeping history; creates a session when none is active.
    pub async fn switch_model(&self, model_id: &str) -> Result<Session> {
        self.ensure_model(model_id).await?;
        let Some(session) = self.current_session().await else {
            return self.create_session(Some(model_id), None).await;
        };
        let patch = SessionPatch { model_id: Some(model_id.to_owned()), ..SessionPatch::default() };
        let updated = self.store.update_session(session.id, patch).await?;
        self.store.set_setting(LAST_MODEL_KEY, model_id).await?;
        Ok(updated)
    }

    /// Applies a title and/or model change as one store write. Both fields are
    /// validated before anything is committed.
    pub async fn patch_session(&self, title: Option<&str>, model_id: Option<&str>) -> Result<Session> {
        let title = title.map(str::trim);
        if title.is_some_and(str::is_empty) {
            return Err(ChatError::validation("title is empty"));
        }
        if let Some(m) = model_id {
            self.ensure_model(m).await?;
        }
        let session = match (self.current_session().await, title) {
            (Some(s), _) => s,
            (None, None) => match model_id {
                Some(m) => return self.create_session(Some(m), None).await,
                None => return Err(ChatError::validation("nothing to update")),
            },
            (None, Some(_)) => return Err(ChatError::not_found("session", "current")),
        };
        let patch = SessionPatch {
            title: title.map(str::to_owned),
            model_id: model_id.map(str::to_owned),
            ..SessionPatch::default()
        };
        let updated = self.store.update_session(session.id, patch).await?;
        if let Some(m) = model_id {
            self.store.set_setting(LAST_MODEL_KEY, m).await?;
        }
        Ok(updated)
    }

    pub async fn update_title(&self, title: &str) -> Result<Session> {
        let title = title.trim();
        if title.is_empty() {
            return Err(ChatError::validation("title is empty"));
        }
        let session = self.require_session().await?;
        let patch = SessionPatch { title: Some(title.to_owned()), ..SessionPatch::default() };
        self.store.update_session(session.id, patch).await
    }

    pub async fn archive_session(&self) -> Result<()> {
        let session = self.require_session().await?;
        let patch = SessionPatch { archived: Some(true), ..SessionPatch::default() };
        self.store.update_session(session.id, patch).await?;
        self.detach(None).await;
        info!(session_id = %session.id, "session archived");
        Ok(())
    }

    /// Drops the current pointer without archiving; messages stay until purged.
    pub async fn clear_session(&self) -> Result<()> {
        self.store.set_current_session(None).await?;
        self.detach(None).await;
        Ok(())
    }

    pub async fn list_user_sessions(&self, user_id: Option<&str>, limit: usize) -> Vec<SessionSummary> {
        self.store.list_sessions(user_id, limit, 0).await
    }

    pub async fn session_stats(&self) -> Result<SessionStats> {
        let session = self.require_session().await?;
        Ok(self.store.session_stats(session.id).await)
    }

    pub async fn conversation_history(&self, limit: usize) -> Result<Vec<MessageView>> {
        let session = self.require_session().await?;
        Ok(self.store.get_messages(session.id, limit, 0).await)
    }

    /// Every message of the current session, oldest first.
    pub async fn full_history(&self) -> Result<Vec<MessageView>> {
        let session = self.require_session().await?;
        Ok(self.store.get_messages(session.id, usize::MAX, 0).await)
    }

    pub async fn available_models(&self) -> Vec<ModelDescriptor> {
        self.store.available_models().await
    }
}
