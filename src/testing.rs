use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::dispatcher::{ChatBackend, ChatRequest, Completion};
use crate::error::{ChatError, Result};

/// Backend that replays scripted outcomes and records every request it sees.
/// When the script runs dry it answers with `fallback` (or an Unknown error).
#[derive(Default)]
pub struct ScriptedBackend {
    pub script: Mutex<VecDeque<Result<Completion>>>,
    pub seen: Mutex<Vec<ChatRequest>>,
    pub fallback: Option<String>,
    /// When set, each call waits for a permit before answering.
    pub gate: Option<Arc<Notify>>,
    pub entered: Arc<Notify>,
}

impl ScriptedBackend {
    pub fn new(script: Vec<Result<Completion>>) -> Arc<Self> {
        Arc::new(Self { script: Mutex::new(script.into()), ..Self::default() })
    }

    pub fn echoing(fallback: &str) -> Arc<Self> {
        Arc::new(Self { fallback: Some(fallback.into()), ..Self::default() })
    }

    pub fn gated(script: Vec<Result<Completion>>, gate: Arc<Notify>) -> Arc<Self> {
        Arc::new(Self { script: Mutex::new(script.into()), gate: Some(gate), ..Self::default() })
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn last_request(&self) -> Option<ChatRequest> {
        self.seen.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl ChatBackend for ScriptedBackend {
    async fn complete(&self, req: &ChatRequest) -> Result<Completion> {
        self.seen.lock().unwrap().push(req.clone());
        self.entered.notify_one();
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        let next = self.script.lock().unwrap().pop_front();
        match (next, &self.fallback) {
            (Some(outcome), _) => outcome,
            (None, Some(text)) => ok(text),
            (None, None) => Err(ChatError::Unknown("script exhausted".into())),
        }
    }
}

pub fn ok(text: &str) -> Result<Completion> {
    Ok(Completion { text: text.into(), token_count: 7, raw_model_id: "raw".into(), usage: None })
}
