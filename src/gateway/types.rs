//! Shared types for the gateway.
//!
//! Caller-facing request/response types plus the Ollama wire shapes used for
//! request building and response parsing.

use std::time::Duration;

use serde::{Deserialize, Serialize};

// ─── Endpoints ───────────────────────────────────────────────────────────────

/// One configured upstream Ollama server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Human-readable name (e.g., "LAN", "WAN").
    pub label: String,
    /// Base URL without trailing slash, e.g. `http://192.168.50.123:11434`.
    pub base_url: String,
    /// Lower is preferred.
    pub priority: u32,
    /// Bound on every network call made against this endpoint.
    pub timeout: Duration,
}

impl Endpoint {
    /// Full URL for an API path such as `/api/chat`.
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

// ─── Request Types ───────────────────────────────────────────────────────────

/// Message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    /// Parse an upstream role string; unknown roles yield `None`.
    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "system" => Some(Role::System),
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "tool" => Some(Role::Tool),
            _ => None,
        }
    }
}

/// A single message in the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Caller-supplied parameters for `/api/chat`.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    /// Upper bound on generated tokens (`num_predict`). `None` = server default.
    pub max_tokens: Option<u32>,
    pub stream: bool,
}

impl ChatRequest {
    /// A non-streaming request with temperature 0.7 and no token bound.
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: 0.7,
            max_tokens: None,
            stream: false,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }
}

/// Caller-supplied parameters for the legacy `/api/generate` completion API.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateRequest {
    pub model: String,
    pub prompt: String,
    pub system: Option<String>,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub stream: bool,
}

impl GenerateRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            system: None,
            temperature: 0.7,
            max_tokens: None,
            stream: false,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }
}

/// Ollama `options` object.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SamplingOptions {
    pub temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_predict: Option<u32>,
}

/// Request body for `POST /api/chat`.
#[derive(Debug, Clone, Serialize)]
pub struct ChatPayload<'a> {
    pub model: &'a str,
    pub messages: &'a [ChatMessage],
    pub stream: bool,
    pub options: SamplingOptions,
}

impl<'a> ChatPayload<'a> {
    pub fn from_request(request: &'a ChatRequest, stream: bool) -> Self {
        Self {
            model: &request.model,
            messages: &request.messages,
            stream,
            options: SamplingOptions {
                temperature: request.temperature,
                num_predict: request.max_tokens,
            },
        }
    }
}

/// Request body for `POST /api/generate`.
#[derive(Debug, Clone, Serialize)]
pub struct GeneratePayload<'a> {
    pub model: &'a str,
    pub prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<&'a str>,
    pub stream: bool,
    pub options: SamplingOptions,
}

impl<'a> GeneratePayload<'a> {
    pub fn from_request(request: &'a GenerateRequest, stream: bool) -> Self {
        Self {
            model: &request.model,
            prompt: &request.prompt,
            system: request.system.as_deref(),
            stream,
            options: SamplingOptions {
                temperature: request.temperature,
                num_predict: request.max_tokens,
            },
        }
    }
}

// ─── Response Types ──────────────────────────────────────────────────────────

/// Where the normalized content came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentSource {
    /// Chat API shape: `message.content`.
    MessageContent,
    /// Legacy generate API shape: top-level `response`.
    Response,
    /// Neither key held a non-empty string.
    Empty,
}

/// Token accounting reported by Ollama on the final object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// Metadata attached to every normalized response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseMeta {
    /// Label of the endpoint that served the request.
    pub endpoint: String,
    pub base_url: String,
    pub latency_ms: u64,
    pub source: ContentSource,
    /// A content key was present but null or not a string.
    pub coerced: bool,
    pub model: Option<String>,
    pub done_reason: Option<String>,
    pub usage: Option<TokenUsage>,
}

/// The unified response shape, independent of which upstream API answered.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedResponse {
    pub role: Role,
    pub content: String,
    pub meta: ResponseMeta,
}

/// One incremental unit of streamed output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatFragment {
    /// A piece of model output text.
    Content(String),
    /// The upstream signalled end-of-stream.
    Done,
    /// The stream broke; already-yielded fragments stand.
    Error { message: String },
}

impl ChatFragment {
    /// `Done` and `Error` end the sequence.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ChatFragment::Content(_))
    }
}

// ─── Model Management ────────────────────────────────────────────────────────

/// A model installed on the active Ollama server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelInfo {
    pub name: String,
    pub size_bytes: u64,
    pub parameter_size: String,
    pub quantization_level: String,
    pub modified_at: Option<String>,
}

/// Raw `/api/tags` response shape.
#[derive(Debug, Deserialize)]
pub(crate) struct TagsResponse {
    pub models: Option<Vec<TagModel>>,
}

/// Raw model entry from the tags API.
#[derive(Debug, Deserialize)]
pub(crate) struct TagModel {
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub modified_at: Option<String>,
    #[serde(default)]
    pub details: Option<ModelDetails>,
}

impl From<TagModel> for ModelInfo {
    fn from(m: TagModel) -> Self {
        let details = m.details.unwrap_or_default();
        ModelInfo {
            name: m.name,
            size_bytes: m.size,
            parameter_size: details.parameter_size.unwrap_or_default(),
            quantization_level: details.quantization_level.unwrap_or_default(),
            modified_at: m.modified_at,
        }
    }
}

/// `details` sub-object shared by `/api/tags` and `/api/show`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelDetails {
    #[serde(default)]
    pub family: Option<String>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub parameter_size: Option<String>,
    #[serde(default)]
    pub quantization_level: Option<String>,
}

/// `/api/show` response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelDetail {
    #[serde(default)]
    pub license: Option<String>,
    #[serde(default)]
    pub modelfile: Option<String>,
    #[serde(default)]
    pub parameters: Option<String>,
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub details: Option<ModelDetails>,
}

/// Progress update while pulling a model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PullProgress {
    pub status: String,
    pub digest: Option<String>,
    pub total: u64,
    pub completed: u64,
    pub percent: f64,
}

/// Raw progress line from the `/api/pull` NDJSON stream.
#[derive(Debug, Deserialize)]
pub(crate) struct PullLine {
    pub status: Option<String>,
    pub digest: Option<String>,
    pub total: Option<u64>,
    pub completed: Option<u64>,
    pub error: Option<String>,
}

impl PullProgress {
    pub(crate) fn from_line(line: PullLine) -> Self {
        let total = line.total.unwrap_or(0);
        let completed = line.completed.unwrap_or(0);
        let percent = if total > 0 {
            (completed as f64 / total as f64) * 100.0
        } else {
            0.0
        };

        PullProgress {
            status: line.status.unwrap_or_default(),
            digest: line.digest,
            total,
            completed,
            percent: (percent * 10.0).round() / 10.0,
        }
    }

    /// Ollama's final pull status.
    pub fn is_success(&self) -> bool {
        self.status == "success"
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_url_strips_trailing_slash() {
        let ep = Endpoint {
            label: "LAN".into(),
            base_url: "http://localhost:11434/".into(),
            priority: 1,
            timeout: Duration::from_secs(5),
        };
        assert_eq!(ep.url("/api/tags"), "http://localhost:11434/api/tags");
    }

    #[test]
    fn test_chat_payload_shape() {
        let req = ChatRequest::new("llama3.1:8b", vec![ChatMessage::user("hola")])
            .with_temperature(0.2)
            .with_max_tokens(64);
        let json = serde_json::to_value(ChatPayload::from_request(&req, true)).unwrap();
        assert_eq!(json["model"], "llama3.1:8b");
        assert_eq!(json["messages"][0]["role"], "user");
        assert_eq!(json["messages"][0]["content"], "hola");
        assert_eq!(json["stream"], true);
        assert_eq!(json["options"]["num_predict"], 64);
        assert!((json["options"]["temperature"].as_f64().unwrap() - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_payload_omits_unbounded_num_predict() {
        let req = GenerateRequest::new("m", "p");
        let json = serde_json::to_value(GeneratePayload::from_request(&req, false)).unwrap();
        assert!(json["options"].get("num_predict").is_none());
        assert!(json.get("system").is_none());
    }

    #[test]
    fn test_tag_model_without_details() {
        let raw: TagsResponse =
            serde_json::from_str(r#"{"models":[{"name":"llama3.1:8b","size":4920753328}]}"#)
                .unwrap();
        let info: ModelInfo = raw.models.unwrap().remove(0).into();
        assert_eq!(info.name, "llama3.1:8b");
        assert_eq!(info.size_bytes, 4_920_753_328);
        assert!(info.parameter_size.is_empty());
    }

    #[test]
    fn test_pull_progress_percent_rounding() {
        let progress = PullProgress::from_line(PullLine {
            status: Some("downloading".into()),
            digest: Some("sha256:abc".into()),
            total: Some(3),
            completed: Some(1),
            error: None,
        });
        assert_eq!(progress.percent, 33.3);
        assert!(!progress.is_success());
    }

    #[test]
    fn test_pull_progress_without_total() {
        let progress = PullProgress::from_line(PullLine {
            status: Some("success".into()),
            digest: None,
            total: None,
            completed: None,
            error: None,
        });
        assert_eq!(progress.percent, 0.0);
        assert!(progress.is_success());
    }

    #[test]
    fn test_fragment_terminal() {
        assert!(!ChatFragment::Content("a".into()).is_terminal());
        assert!(ChatFragment::Done.is_terminal());
        assert!(ChatFragment::Error {
            message: "x".into()
        }
        .is_terminal());
    }
}
