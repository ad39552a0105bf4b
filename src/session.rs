use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_TITLE: &str = "New Chat";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub user_id: Option<String>,
    pub title: String,
    pub model_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub archived: bool,
}

impl Session {
    pub fn new(user_id: Option<String>, model_id: String, title: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            title,
            model_id,
            created_at: now,
            updated_at: now,
            last_activity: now,
            archived: false,
        }
    }
}

/// Committed conversation entry. Never edited once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub session_id: Uuid,
    pub role: Role,
    pub content: String,
    pub model_id: Option<String>,
    pub token_count: Option<u64>,
    pub response_time_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
}

/// Fields a caller supplies when appending a message.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub session_id: Uuid,
    pub role: Role,
    pub content: String,
    pub model_id: Option<String>,
    pub token_count: Option<u64>,
    pub response_time_ms: Option<u64>,
}

impl NewMessage {
    pub fn new(session_id: Uuid, role: Role, content: impl Into<String>) -> Self {
        Self {
            session_id,
            role,
            content: content.into(),
            model_id: None,
            token_count: None,
            response_time_ms: None,
        }
    }

    pub fn with_model(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = Some(model_id.into());
        self
    }

    pub fn with_usage(mut self, token_count: u64, response_time_ms: u64) -> Self {
        self.token_count = Some(token_count);
        self.response_time_ms = Some(response_time_ms);
        self
    }
}

/// A message as returned to readers, with the model name resolved from the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageView {
    #[serde(flatten)]
    pub message: Message,
    pub model_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    #[serde(flatten)]
    pub session: Session,
    pub message_count: usize,
    pub last_message_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionPatch {
    pub title: Option<String>,
    pub model_id: Option<String>,
    pub archived: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionStats {
    pub total_messages: usize,
    pub user_messages: usize,
    pub assistant_messages: usize,
    pub total_tokens: u64,
    pub avg_response_time_ms: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelUsageStats {
    pub total_requests: usize,
    pub total_tokens: u64,
    pub avg_response_time_ms: f64,
    pub unique_sessions: usize,
}

/// Mean of the response times that are present; 0 when none are.
pub(crate) fn average_response_time<'a>(messages: impl Iterator<Item = &'a Message>) -> f64 {
    let (sum, n) = messages
        .filter_map(|m| m.response_time_ms)
        .fold((0u64, 0u64), |(s, n), t| (s + t, n + 1));
    if n == 0 { 0.0 } else { sum as f64 / n as f64 }
}
