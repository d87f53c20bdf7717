//! HTTP transport to upstream servers.
//!
//! [`UpstreamTransport`] is the seam between gateway policy (which endpoint,
//! when to retry) and the wire. The production implementation wraps a single
//! pooled `reqwest::Client`; every call carries the caller's timeout.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::Client as HttpClient;
use serde_json::Value;

use super::errors::TransportError;

// ─── Constants ───────────────────────────────────────────────────────────────

/// TCP connection timeout, independent of the per-endpoint request timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on how much of an error body is kept for diagnostics.
const MAX_ERROR_BODY: usize = 2048;

// ─── Trait ───────────────────────────────────────────────────────────────────

/// Raw body bytes of a streaming response, in arrival order.
///
/// Dropping the stream releases the underlying connection.
pub type ByteStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// Wire operations the gateway needs from an HTTP client.
#[async_trait]
pub trait UpstreamTransport: Send + Sync {
    /// Liveness check: succeeds on any 2xx within `timeout`. The body is ignored.
    async fn probe(&self, url: &str, timeout: Duration) -> Result<(), TransportError>;

    /// `GET` returning a decoded JSON body.
    async fn get_json(&self, url: &str, timeout: Duration) -> Result<Value, TransportError>;

    /// `POST` a JSON body, returning a decoded JSON body.
    async fn post_json(
        &self,
        url: &str,
        body: &Value,
        timeout: Duration,
    ) -> Result<Value, TransportError>;

    /// `POST` a JSON body and hand back the response body as it arrives.
    ///
    /// `timeout` bounds the wait for response headers. `idle_timeout`, when
    /// set, bounds the gap between consecutive body reads.
    async fn post_stream(
        &self,
        url: &str,
        body: &Value,
        timeout: Duration,
        idle_timeout: Option<Duration>,
    ) -> Result<ByteStream, TransportError>;
}

// ─── reqwest implementation ──────────────────────────────────────────────────

/// [`UpstreamTransport`] backed by `reqwest`.
#[derive(Clone)]
pub struct ReqwestTransport {
    http: HttpClient,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, TransportError> {
        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| TransportError::Connect {
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { http })
    }

    async fn read_json(
        response: reqwest::Response,
        timeout: Duration,
    ) -> Result<Value, TransportError> {
        let response = check_status(response).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| classify(e, timeout))?;
        serde_json::from_slice(&bytes).map_err(|e| TransportError::Decode {
            reason: format!("invalid JSON: {e}"),
        })
    }
}

#[async_trait]
impl UpstreamTransport for ReqwestTransport {
    async fn probe(&self, url: &str, timeout: Duration) -> Result<(), TransportError> {
        let response = self
            .http
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| classify(e, timeout))?;
        check_status(response).await.map(|_| ())
    }

    async fn get_json(&self, url: &str, timeout: Duration) -> Result<Value, TransportError> {
        let response = self
            .http
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| classify(e, timeout))?;
        Self::read_json(response, timeout).await
    }

    async fn post_json(
        &self,
        url: &str,
        body: &Value,
        timeout: Duration,
    ) -> Result<Value, TransportError> {
        let response = self
            .http
            .post(url)
            .json(body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| classify(e, timeout))?;
        Self::read_json(response, timeout).await
    }

    async fn post_stream(
        &self,
        url: &str,
        body: &Value,
        timeout: Duration,
        idle_timeout: Option<Duration>,
    ) -> Result<ByteStream, TransportError> {
        // A request-level timeout would cut off long generations. Only the
        // wait for headers (and the error body, on non-2xx) is bounded here.
        let send = self.http.post(url).json(body).send();
        let setup = async {
            match send.await {
                Ok(response) => check_status(response).await,
                Err(e) => Err(classify(e, timeout)),
            }
        };
        let response = tokio::time::timeout(timeout, setup)
            .await
            .map_err(|_| TransportError::Timeout {
                after_ms: millis(timeout),
            })??;

        let fallback = idle_timeout.unwrap_or(timeout);
        let bytes = response
            .bytes_stream()
            .map(move |chunk| chunk.map_err(|e| classify(e, fallback)))
            .boxed();

        Ok(match idle_timeout {
            Some(idle) => with_idle_timeout(bytes, idle),
            None => bytes,
        })
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// Fail with [`TransportError::Status`] on non-2xx, keeping a bounded body excerpt.
///
/// Reads at most [`MAX_ERROR_BODY`] bytes; a body that breaks off early keeps
/// whatever arrived.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let mut response = response;
    let mut excerpt = Vec::new();
    while excerpt.len() < MAX_ERROR_BODY {
        match response.chunk().await {
            Ok(Some(chunk)) => excerpt.extend_from_slice(&chunk),
            Ok(None) | Err(_) => break,
        }
    }
    excerpt.truncate(MAX_ERROR_BODY);
    let body = String::from_utf8_lossy(&excerpt).into_owned();
    let body = body.trim_end_matches('\u{FFFD}').to_string();

    Err(TransportError::Status {
        status: status.as_u16(),
        body,
    })
}

/// Map a `reqwest` failure onto the gateway's transport taxonomy.
///
/// JSON is decoded with `serde_json` after the body is read, so a `reqwest`
/// decode or body error always means the body was cut off: the connection
/// failed, not the payload.
fn classify(e: reqwest::Error, timeout: Duration) -> TransportError {
    if e.is_timeout() {
        return TransportError::Timeout {
            after_ms: millis(timeout),
        };
    }

    let mut reason = e.to_string();
    let mut source = std::error::Error::source(&e);
    while let Some(cause) = source {
        reason.push_str(": ");
        reason.push_str(&cause.to_string());
        source = cause.source();
    }
    TransportError::Connect { reason }
}

/// End the stream with a timeout error if no chunk arrives within `idle`.
fn with_idle_timeout(inner: ByteStream, idle: Duration) -> ByteStream {
    stream::unfold(Some(inner), move |state| async move {
        let Some(mut inner) = state else {
            return None;
        };
        match tokio::time::timeout(idle, inner.next()).await {
            Ok(Some(item)) => Some((item, Some(inner))),
            Ok(None) => None,
            Err(_) => Some((
                Err(TransportError::Timeout {
                    after_ms: millis(idle),
                }),
                None,
            )),
        }
    })
    .boxed()
}

pub(crate) fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
