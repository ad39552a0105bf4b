use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::catalog::{self, ModelDescriptor};
use crate::error::{ChatError, Result};
use crate::session::Role;
use crate::settings::{AppConfig, GlobalDefaults, ModelParams, RequestOverrides, RetryPolicy, resolve_effective_settings};

/// One role-tagged unit of conversation content as sent on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self { role, content: content.into() }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    /// Provider-facing model identifier.
    pub model: String,
    pub messages: Vec<Turn>,
    pub params: ModelParams,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    pub token_count: u64,
    pub raw_model_id: String,
    pub usage: Option<Usage>,
}

/// A model endpoint. Implementations classify their own failures into [`ChatError`].
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn complete(&self, req: &ChatRequest) -> Result<Completion>;
}

#[derive(Clone)]
pub struct OpenRouterClient {
    base_url: String,
    api_key: Option<String>,
    app_title: String,
    referer: String,
    client: reqwest::Client,
}

impl OpenRouterClient {
    pub fn new(cfg: &AppConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(cfg.request_timeout)
            .build()
            .map_err(|e| ChatError::Transport(e.to_string()))?;
        Ok(Self {
            base_url: cfg.base_url.clone(),
            api_key: cfg.api_key.clone(),
            app_title: cfg.app_title.clone(),
            referer: cfg.referer.clone(),
            client,
        })
    }
}

#[derive(Debug, Serialize)]
struct OaiChatRequest<'a> {
    model: &'a str,
    messages: &'a [Turn],
    #[serde(skip_serializing_if = "Option::is_none")] temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")] max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")] top_p: Option<f32>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct OaiChatResponse {
    #[serde(default)]
    choices: Vec<OaiChoice>,
    model: Option<String>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct OaiChoice { message: Option<OaiMessage> }

#[derive(Debug, Deserialize)]
struct OaiMessage { content: Option<OaiContent> }

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OaiContent {
    Text(String),
    Parts(Vec<OaiPart>),
}

#[derive(Debug, Deserialize)]
struct OaiPart {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
}

impl OaiContent {
    fn into_text(self) -> String {
        match self {
            OaiContent::Text(s) => s,
            OaiContent::Parts(parts) => parts
                .into_iter()
                .find(|p| p.kind == "text")
                .and_then(|p| p.text)
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct OaiErrorBody {
    error: Option<OaiErrorDetail>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OaiErrorDetail { message: Option<String> }

/// Maps a non-2xx provider response onto the error taxonomy.
pub fn classify_status(status: u16, message: &str) -> ChatError {
    let lower = message.to_lowercase();
    if matches!(status, 401 | 403) || lower.contains("user not found") || lower.contains("unauthorized") {
        return ChatError::Auth(message.to_owned());
    }
    if status == 404 || (lower.contains("model") && lower.contains("not found")) {
        return ChatError::ModelUnavailable(message.to_owned());
    }
    match status {
        429 => ChatError::RateLimit(message.to_owned()),
        400 | 422 => ChatError::Validation(message.to_owned()),
        500..=599 => ChatError::Server { status, message: message.to_owned() },
        _ => ChatError::Unknown(message.to_owned()),
    }
}

fn parse_completion(body: &str, requested_model: &str) -> Result<Completion> {
    let parsed: OaiChatResponse = serde_json::from_str(body)
        .map_err(|e| ChatError::MalformedResponse(format!("invalid body: {e}")))?;
    let text = parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message)
        .and_then(|m| m.content)
        .map(OaiContent::into_text)
        .unwrap_or_default();
    if text.is_empty() {
        return Err(ChatError::MalformedResponse("no completion text in response".into()));
    }
    Ok(Completion {
        text,
        token_count: parsed.usage.as_ref().and_then(|u| u.total_tokens).unwrap_or(0),
        raw_model_id: parsed.model.unwrap_or_else(|| requested_model.to_owned()),
        usage: parsed.usage,
    })
}

#[async_trait]
impl ChatBackend for OpenRouterClient {
    async fn complete(&self, req: &ChatRequest) -> Result<Completion> {
        let Some(key) = self.api_key.as_deref().filter(|k| !k.trim().is_empty()) else {
            return Err(ChatError::Auth("API key is not configured".into()));
        };
        let body = OaiChatRequest {
            model: &req.model,
            messages: &req.messages,
            temperature: req.params.temperature,
            max_tokens: req.params.max_tokens,
            top_p: req.params.top_p,
            stream: false,
        };
        debug!(model = %req.model, turns = req.messages.len(), "sending chat request");
        let resp = self
            .client
            .post(&self.base_url)
            .bearer_auth(key)
            .header("HTTP-Referer", &self.referer)
            .header("X-Title", &self.app_title)
            .json(&body)
            .send()
            .await
            .map_err(|e| ChatError::Transport(e.to_string()))?;

        let status = resp.status();
        let text = resp.text().await.map_err(|e| ChatError::Transport(e.to_string()))?;
        if !status.is_success() {
            let err: OaiErrorBody = serde_json::from_str(&text).unwrap_or_default();
            let message = err
                .error
                .and_then(|e| e.message)
                .or(err.message)
                .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed").to_owned());
            return Err(classify_status(status.as_u16(), &message));
        }
        parse_completion(&text, &req.model)
    }
}

/// Sends turn sets to a backend with classified, bounded retry.
pub struct Dispatcher {
    backend: Arc<dyn ChatBackend>,
    retry: RetryPolicy,
    catalog: Vec<ModelDescriptor>,
    global: GlobalDefaults,
}

impl Dispatcher {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        retry: RetryPolicy,
        catalog: Vec<ModelDescriptor>,
        global: GlobalDefaults,
    ) -> Self {
        Self { backend, retry, catalog, global }
    }

    fn build_request(&self, model_id: &str, turns: &[Turn], overrides: &RequestOverrides) -> ChatRequest {
        let descriptor = catalog::find(&self.catalog, model_id);
        let eff = resolve_effective_settings(&self.global, Some(model_id), descriptor, overrides);
        let model = eff.model.unwrap_or_else(|| model_id.to_owned());
        let model = catalog::find(&self.catalog, &model)
            .map(|m| m.provider_model_id.clone())
            .unwrap_or(model);
        ChatRequest {
            model,
            messages: turns.iter().filter(|t| t.role != Role::System).cloned().collect(),
            params: eff.model_params,
        }
    }

    pub async fn dispatch(&self, model_id: &str, turns: &[Turn], cancel: &CancellationToken) -> Result<Completion> {
        self.dispatch_with(model_id, turns, &RequestOverrides::default(), cancel).await
    }

    /// Retries only retryable failures; backoff before attempt n+1 is `base * 2^(n-1)`.
    pub async fn dispatch_with(
        &self,
        model_id: &str,
        turns: &[Turn],
        overrides: &RequestOverrides,
        cancel: &CancellationToken,
    ) -> Result<Completion> {
        let request = self.build_request(model_id, turns, overrides);
        if request.messages.is_empty() {
            return Err(ChatError::validation("no user or assistant turns to send"));
        }
        let started = Instant::now();
        let mut attempt = 1;
        loop {
            if cancel.is_cancelled() {
                return Err(ChatError::Cancelled);
            }
            counter!("polychat_dispatch_attempts_total").increment(1);
            match self.backend.complete(&request).await {
                Ok(completion) => {
                    histogram!("polychat_dispatch_seconds").record(started.elapsed().as_secs_f64());
                    debug!(model = %request.model, attempt, tokens = completion.token_count, "dispatch succeeded");
                    return Ok(completion);
                }
                Err(e) if e.is_retryable() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        model = %request.model,
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        ?delay,
                        error = %e,
                        "dispatch failed, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(ChatError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(e) => {
                    counter!("polychat_dispatch_failures_total", "kind" => e.kind().as_str()).increment(1);
                    error!(model = %request.model, attempt, kind = e.kind().as_str(), error = %e, "dispatch failed");
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::builtin_models;
    use crate::error::ErrorKind;
    use crate::testing::{ScriptedBackend, ok};
    use axum::{Json, Router, http::StatusCode, routing::post};
    use serde_json::{Value, json};
    use std::time::Duration;

    fn dispatcher(backend: Arc<ScriptedBackend>) -> Dispatcher {
        Dispatcher::new(backend, RetryPolicy::default(), builtin_models(), GlobalDefaults::default())
    }

    fn hello() -> Vec<Turn> {
        vec![Turn::new(Role::User, "hello")]
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failures_back_off_then_succeed() {
        let backend = ScriptedBackend::new(vec![
            Err(ChatError::Transport("reset".into())),
            Err(ChatError::Transport("timeout".into())),
            ok("hi there"),
        ]);
        let d = dispatcher(backend.clone());
        let start = tokio::time::Instant::now();
        let out = d.dispatch("x-ai/grok-4-fast", &hello(), &CancellationToken::new()).await.unwrap();
        assert_eq!(out.text, "hi there");
        assert_eq!(backend.calls(), 3);
        // two backoff delays: 1s then 2s
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_failures_do_not_retry() {
        let backend = ScriptedBackend::new(vec![Err(ChatError::Auth("bad key".into())), ok("unused")]);
        let d = dispatcher(backend.clone());
        let start = tokio::time::Instant::now();
        let err = d.dispatch("x-ai/grok-4-fast", &hello(), &CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Auth);
        assert_eq!(backend.calls(), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_stop_after_max_attempts() {
        let backend = ScriptedBackend::new(vec![
            Err(ChatError::Server { status: 503, message: "down".into() }),
            Err(ChatError::RateLimit("slow".into())),
            Err(ChatError::Server { status: 502, message: "still down".into() }),
            ok("unused"),
        ]);
        let d = dispatcher(backend.clone());
        let err = d.dispatch("x-ai/grok-4-fast", &hello(), &CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Server);
        assert_eq!(backend.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_before_next_attempt() {
        let backend = ScriptedBackend::new(vec![Err(ChatError::Transport("reset".into())), ok("late")]);
        let d = dispatcher(backend.clone());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            trigger.cancel();
        });
        let err = d.dispatch("x-ai/grok-4-fast", &hello(), &cancel).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn system_turns_are_filtered_and_model_id_mapped() {
        let backend = ScriptedBackend::new(vec![ok("fine")]);
        let d = dispatcher(backend.clone());
        let turns = vec![
            Turn::new(Role::System, "notice"),
            Turn::new(Role::User, "q"),
            Turn::new(Role::Assistant, "a"),
            Turn::new(Role::User, "q2"),
        ];
        d.dispatch("mistralai/devstral-2512", &turns, &CancellationToken::new()).await.unwrap();
        let seen = backend.seen.lock().unwrap();
        assert_eq!(seen[0].model, "mistralai/devstral-2512:free");
        assert_eq!(seen[0].messages.len(), 3);
        assert!(seen[0].messages.iter().all(|t| t.role != Role::System));
        assert_eq!(seen[0].params.max_tokens, Some(4096));
    }

    #[tokio::test]
    async fn only_system_turns_is_a_validation_error() {
        let backend = ScriptedBackend::new(vec![ok("unused")]);
        let d = dispatcher(backend.clone());
        let err = d
            .dispatch("x-ai/grok-4-fast", &[Turn::new(Role::System, "x")], &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(backend.calls(), 0);
    }

    #[test]
    fn classification_of_provider_errors() {
        assert_eq!(classify_status(401, "nope").kind(), ErrorKind::Auth);
        assert_eq!(classify_status(400, "User not found.").kind(), ErrorKind::Auth);
        assert_eq!(classify_status(429, "slow down").kind(), ErrorKind::RateLimit);
        assert_eq!(classify_status(400, "Model foo not found").kind(), ErrorKind::ModelUnavailable);
        assert_eq!(classify_status(422, "bad field").kind(), ErrorKind::Validation);
        assert_eq!(classify_status(503, "overloaded").kind(), ErrorKind::Server);
        let unknown = classify_status(418, "I'm a teapot");
        assert_eq!(unknown.kind(), ErrorKind::Unknown);
        assert_eq!(unknown.to_string(), "I'm a teapot");
    }

    #[test]
    fn completion_parsing() {
        let c = parse_completion(
            r#"{"model":"x-ai/grok","choices":[{"message":{"content":"hey"}}],"usage":{"total_tokens":9}}"#,
            "req",
        )
        .unwrap();
        assert_eq!((c.text.as_str(), c.token_count, c.raw_model_id.as_str()), ("hey", 9, "x-ai/grok"));

        let parts = parse_completion(
            r#"{"choices":[{"message":{"content":[{"type":"image"},{"type":"text","text":"from parts"}]}}]}"#,
            "req",
        )
        .unwrap();
        assert_eq!(parts.text, "from parts");
        assert_eq!(parts.raw_model_id, "req");
        assert_eq!(parts.token_count, 0);

        for body in [r#"{"choices":[]}"#, r#"{"choices":[{"message":{"content":""}}]}"#, "not json"] {
            assert_eq!(parse_completion(body, "req").unwrap_err().kind(), ErrorKind::MalformedResponse);
        }
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}/chat", addr)
    }

    fn client(base_url: String) -> OpenRouterClient {
        let cfg = AppConfig { base_url, api_key: Some("sk-test".into()), ..AppConfig::default() };
        OpenRouterClient::new(&cfg).unwrap()
    }

    fn request() -> ChatRequest {
        ChatRequest { model: "m".into(), messages: hello(), params: ModelParams::default() }
    }

    #[tokio::test]
    async fn http_backend_parses_success() {
        let url = serve(Router::new().route(
            "/chat",
            post(|Json(body): Json<Value>| async move {
                Json(json!({
                    "model": body["model"],
                    "choices": [{"message": {"content": format!("echo {}", body["messages"][0]["content"].as_str().unwrap_or(""))}}],
                    "usage": {"total_tokens": 5}
                }))
            }),
        ))
        .await;
        let c = client(url).complete(&request()).await.unwrap();
        assert_eq!(c.text, "echo hello");
        assert_eq!(c.raw_model_id, "m");
        assert_eq!(c.token_count, 5);
    }

    #[tokio::test]
    async fn http_backend_classifies_failures() {
        let cases = [
            (StatusCode::UNAUTHORIZED, ErrorKind::Auth),
            (StatusCode::TOO_MANY_REQUESTS, ErrorKind::RateLimit),
            (StatusCode::INTERNAL_SERVER_ERROR, ErrorKind::Server),
            (StatusCode::IM_A_TEAPOT, ErrorKind::Unknown),
        ];
        for (status, kind) in cases {
            let url = serve(Router::new().route(
                "/chat",
                post(move || async move { (status, Json(json!({"error": {"message": "provider said no"}}))) }),
            ))
            .await;
            let err = client(url).complete(&request()).await.unwrap_err();
            assert_eq!(err.kind(), kind, "status {status}");
            assert!(err.to_string().contains("provider said no"));
        }
    }

    #[tokio::test]
    async fn http_backend_without_key_fails_fast() {
        let cfg = AppConfig { base_url: "http://127.0.0.1:9/chat".into(), api_key: None, ..AppConfig::default() };
        let err = OpenRouterClient::new(&cfg).unwrap().complete(&request()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Auth);
    }

    #[tokio::test]
    async fn http_backend_connection_refused_is_transport() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = client(format!("http://{}/chat", addr)).complete(&request()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(err.is_retryable());
    }
}
