//! Request relay: the gateway's public client.
//!
//! Resolves an active endpoint through the prober, sends chat/generate and
//! model-management calls, and normalizes responses. Holds no per-request
//! state; the only shared state is the registry's active selection.
//!
//! Failure policy for non-streaming calls:
//! - timeout: invalidate, re-probe once, retry once; a second failure surfaces
//! - connection, status, decode failures: invalidate and surface, no retry

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use uuid::Uuid;

use super::config::GatewayConfig;
use super::errors::GatewayError;
use super::normalize::normalize;
use super::prober::HealthProber;
use super::registry::{ActiveSelection, ServerRegistry};
use super::streaming::{relay_fragments, relay_pull_progress, FragmentStream, PullStream};
use super::transport::{millis, ReqwestTransport, UpstreamTransport};
use super::types::{
    ChatPayload, ChatRequest, Endpoint, GeneratePayload, GenerateRequest, ModelDetail,
    ModelInfo, NormalizedResponse, ResponseMeta, TagsResponse,
};

const CHAT_PATH: &str = "/api/chat";
const GENERATE_PATH: &str = "/api/generate";
const TAGS_PATH: &str = "/api/tags";
const SHOW_PATH: &str = "/api/show";
const PULL_PATH: &str = "/api/pull";

/// Result of [`GatewayClient::dispatch`], shaped by the request's streaming flag.
pub enum ChatOutcome {
    Complete(NormalizedResponse),
    Stream(FragmentStream),
}

/// Defaults applied by callers that do not pick their own model/sampling.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestDefaults {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

/// Client for a set of failover Ollama endpoints.
#[derive(Clone)]
pub struct GatewayClient {
    prober: HealthProber,
    transport: Arc<dyn UpstreamTransport>,
    defaults: RequestDefaults,
}

impl GatewayClient {
    /// Create a client that talks HTTP through `reqwest`.
    ///
    /// Does NOT probe: the first request (or [`ensure_active`](Self::ensure_active))
    /// selects an endpoint.
    pub fn from_config(config: &GatewayConfig) -> Result<Self, GatewayError> {
        let transport = ReqwestTransport::new().map_err(|e| GatewayError::ConfigError {
            reason: format!("failed to build HTTP client: {e}"),
        })?;
        Self::with_transport(config, Arc::new(transport))
    }

    /// Create a client over a caller-supplied transport.
    pub fn with_transport(
        config: &GatewayConfig,
        transport: Arc<dyn UpstreamTransport>,
    ) -> Result<Self, GatewayError> {
        config.validate()?;
        let registry = Arc::new(ServerRegistry::new(
            config.endpoints(),
            config.health_cache_ttl(),
        )?);
        let prober = HealthProber::new(registry, Arc::clone(&transport));

        Ok(Self {
            prober,
            transport,
            defaults: RequestDefaults {
                model: config.default_model.clone(),
                temperature: config.temperature,
                max_tokens: config.max_tokens,
            },
        })
    }

    pub fn registry(&self) -> &Arc<ServerRegistry> {
        self.prober.registry()
    }

    pub fn defaults(&self) -> &RequestDefaults {
        &self.defaults
    }

    /// The currently selected endpoint, without any network call.
    pub fn active_endpoint(&self) -> Option<Endpoint> {
        self.registry().active_endpoint().map(|e| (*e).clone())
    }

    /// Select (or confirm) an active endpoint.
    pub async fn ensure_active(&self) -> Result<Arc<ActiveSelection>, GatewayError> {
        self.prober.ensure_active().await
    }

    // ─── Model Management ────────────────────────────────────────────────

    /// Models installed on the active endpoint.
    pub async fn list_models(&self) -> Result<Vec<ModelInfo>, GatewayError> {
        let (body, selection, _) = self.call_json(TAGS_PATH, None).await?;
        let tags: TagsResponse = serde_json::from_value(body).map_err(|e| {
            GatewayError::UpstreamProtocolError {
                endpoint: selection.endpoint.label.clone(),
                reason: format!("unexpected tags shape: {e}"),
            }
        })?;
        Ok(tags
            .models
            .unwrap_or_default()
            .into_iter()
            .map(ModelInfo::from)
            .collect())
    }

    /// Modelfile, template and details of one model.
    pub async fn show_model(&self, name: &str) -> Result<ModelDetail, GatewayError> {
        let payload = serde_json::json!({ "name": name });
        let (body, selection, _) = self.call_json(SHOW_PATH, Some(&payload)).await?;
        serde_json::from_value(body).map_err(|e| GatewayError::UpstreamProtocolError {
            endpoint: selection.endpoint.label.clone(),
            reason: format!("unexpected show shape: {e}"),
        })
    }

    /// Download a model on the active endpoint, streaming progress.
    ///
    /// No idle timeout: layers can take minutes between progress lines.
    pub async fn pull_model(&self, name: &str) -> Result<PullStream, GatewayError> {
        let payload = serde_json::json!({ "name": name, "stream": true });
        let selection = self.ensure_active().await?;
        let endpoint = &selection.endpoint;
        tracing::info!(endpoint = %endpoint.label, model = name, "pulling model");

        let upstream = self
            .transport
            .post_stream(&endpoint.url(PULL_PATH), &payload, endpoint.timeout, None)
            .await
            .map_err(|e| {
                self.registry().invalidate(&selection);
                GatewayError::from_transport(endpoint, e)
            })?;

        Ok(relay_pull_progress(
            upstream,
            Arc::clone(self.registry()),
            Arc::clone(&selection),
        ))
    }

    // ─── Chat / Generate (non-streaming) ─────────────────────────────────

    /// Send a chat request and wait for the complete response.
    ///
    /// The request's streaming flag is ignored; see [`dispatch`](Self::dispatch).
    pub async fn chat(&self, request: &ChatRequest) -> Result<NormalizedResponse, GatewayError> {
        validate_model(&request.model)?;
        if request.messages.is_empty() {
            return Err(GatewayError::InvalidRequest {
                reason: "chat request has no messages".into(),
            });
        }
        let payload = to_payload(&ChatPayload::from_request(request, false))?;
        self.complete(CHAT_PATH, &request.model, &payload).await
    }

    /// Send a generate request and wait for the complete response.
    pub async fn generate(
        &self,
        request: &GenerateRequest,
    ) -> Result<NormalizedResponse, GatewayError> {
        validate_model(&request.model)?;
        let payload = to_payload(&GeneratePayload::from_request(request, false))?;
        self.complete(GENERATE_PATH, &request.model, &payload).await
    }

    // ─── Chat / Generate (streaming) ─────────────────────────────────────

    /// Start a streaming chat.
    ///
    /// Setup failures (no endpoint, refused connection, non-2xx) are returned
    /// here; failures after the first byte arrive as an `Error` fragment.
    /// Streams are never retried: call again for a fresh attempt, which may
    /// land on a different endpoint.
    pub async fn chat_stream(&self, request: &ChatRequest) -> Result<FragmentStream, GatewayError> {
        validate_model(&request.model)?;
        if request.messages.is_empty() {
            return Err(GatewayError::InvalidRequest {
                reason: "chat request has no messages".into(),
            });
        }
        let payload = to_payload(&ChatPayload::from_request(request, true))?;
        self.open_stream(CHAT_PATH, &request.model, &payload).await
    }

    /// Start a streaming generate.
    pub async fn generate_stream(
        &self,
        request: &GenerateRequest,
    ) -> Result<FragmentStream, GatewayError> {
        validate_model(&request.model)?;
        let payload = to_payload(&GeneratePayload::from_request(request, true))?;
        self.open_stream(GENERATE_PATH, &request.model, &payload).await
    }

    /// Honor the request's streaming flag.
    pub async fn dispatch(&self, request: &ChatRequest) -> Result<ChatOutcome, GatewayError> {
        if request.stream {
            self.chat_stream(request).await.map(ChatOutcome::Stream)
        } else {
            self.chat(request).await.map(ChatOutcome::Complete)
        }
    }

    // ─── Internals ───────────────────────────────────────────────────────

    async fn complete(
        &self,
        path: &str,
        model: &str,
        payload: &Value,
    ) -> Result<NormalizedResponse, GatewayError> {
        let (body, selection, started) = self.call_json(path, Some(payload)).await?;
        let latency = started.elapsed();
        let normalized = normalize(&body);

        if normalized.content.trim().is_empty() {
            tracing::warn!(
                endpoint = %selection.endpoint.label,
                model,
                source = ?normalized.source,
                coerced = normalized.coerced,
                "upstream returned an empty completion"
            );
        }

        Ok(NormalizedResponse {
            role: normalized.role,
            content: normalized.content,
            meta: ResponseMeta {
                endpoint: selection.endpoint.label.clone(),
                base_url: selection.endpoint.base_url.clone(),
                latency_ms: millis(latency),
                source: normalized.source,
                coerced: normalized.coerced,
                model: normalized.model,
                done_reason: normalized.done_reason,
                usage: normalized.usage,
            },
        })
    }

    /// One JSON call with the single-retry-on-timeout policy.
    ///
    /// `payload = None` issues a GET. Returns the body, the selection that
    /// served it, and when the successful attempt started.
    async fn call_json(
        &self,
        path: &str,
        payload: Option<&Value>,
    ) -> Result<(Value, Arc<ActiveSelection>, Instant), GatewayError> {
        let request_id = Uuid::new_v4();
        let selection = self.ensure_active().await?;

        let first = self.attempt(&selection, path, payload, request_id).await;
        let err = match first {
            Ok((body, started)) => return Ok((body, selection, started)),
            Err(err) => err,
        };
        self.registry().invalidate(&selection);
        if !err.is_retriable() {
            tracing::warn!(%request_id, path, error = %err, "upstream request failed");
            return Err(err);
        }

        tracing::warn!(
            %request_id,
            path,
            endpoint = %selection.endpoint.label,
            error = %err,
            "upstream timed out, re-probing and retrying once"
        );
        let retry = self.ensure_active().await?;
        match self.attempt(&retry, path, payload, request_id).await {
            Ok((body, started)) => Ok((body, retry, started)),
            Err(err) => {
                self.registry().invalidate(&retry);
                tracing::warn!(%request_id, path, error = %err, "retry failed");
                Err(err)
            }
        }
    }

    async fn attempt(
        &self,
        selection: &ActiveSelection,
        path: &str,
        payload: Option<&Value>,
        request_id: Uuid,
    ) -> Result<(Value, Instant), GatewayError> {
        let endpoint = &selection.endpoint;
        let url = endpoint.url(path);
        tracing::debug!(
            %request_id,
            url = %url,
            endpoint = %endpoint.label,
            timeout_ms = millis(endpoint.timeout),
            "upstream request"
        );

        let started = Instant::now();
        let result = match payload {
            Some(body) => self.transport.post_json(&url, body, endpoint.timeout).await,
            None => self.transport.get_json(&url, endpoint.timeout).await,
        };
        result
            .map(|body| (body, started))
            .map_err(|e| GatewayError::from_transport(endpoint, e))
    }

    async fn open_stream(
        &self,
        path: &str,
        model: &str,
        payload: &Value,
    ) -> Result<FragmentStream, GatewayError> {
        let selection = self.ensure_active().await?;
        let endpoint = &selection.endpoint;
        let url = endpoint.url(path);
        tracing::info!(url = %url, endpoint = %endpoint.label, model, "opening upstream stream");

        let upstream = self
            .transport
            .post_stream(&url, payload, endpoint.timeout, Some(endpoint.timeout))
            .await
            .map_err(|e| {
                self.registry().invalidate(&selection);
                let err = GatewayError::from_transport(endpoint, e);
                tracing::warn!(endpoint = %endpoint.label, error = %err, "stream setup failed");
                err
            })?;

        Ok(relay_fragments(
            upstream,
            Arc::clone(self.registry()),
            Arc::clone(&selection),
        ))
    }
}

fn validate_model(model: &str) -> Result<(), GatewayError> {
    if model.trim().is_empty() {
        return Err(GatewayError::InvalidRequest {
            reason: "model identifier is empty".into(),
        });
    }
    Ok(())
}

fn to_payload<T: Serialize>(payload: &T) -> Result<Value, GatewayError> {
    serde_json::to_value(payload).map_err(|e| GatewayError::InvalidRequest {
        reason: format!("failed to encode payload: {e}"),
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
