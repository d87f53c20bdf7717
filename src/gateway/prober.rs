//! Health prober: lazy, priority-ordered endpoint selection.
//!
//! Probing only happens on demand, when the cached selection is missing or
//! older than the health-cache TTL. There is no background timer.

use std::sync::Arc;

use tokio::time::Instant;

use super::errors::{GatewayError, TransportError};
use super::registry::{ActiveSelection, ServerRegistry};
use super::transport::{millis, UpstreamTransport};

/// Liveness path. Lists installed models, cheap on every Ollama version.
pub const LIVENESS_PATH: &str = "/api/tags";

/// Picks the first reachable endpoint in priority order.
#[derive(Clone)]
pub struct HealthProber {
    registry: Arc<ServerRegistry>,
    transport: Arc<dyn UpstreamTransport>,
}

impl HealthProber {
    pub fn new(registry: Arc<ServerRegistry>, transport: Arc<dyn UpstreamTransport>) -> Self {
        Self {
            registry,
            transport,
        }
    }

    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    /// Return a selection verified within the TTL, probing only if needed.
    pub async fn ensure_active(&self) -> Result<Arc<ActiveSelection>, GatewayError> {
        if let Some(selection) = self.registry.fresh() {
            return Ok(selection);
        }
        self.probe_all().await
    }

    /// Probe every candidate in priority order and record the first success.
    ///
    /// Stops at the first reachable endpoint: priority is a preference order,
    /// not a load-balancing weight. Clears the selection if none answer.
    pub async fn probe_all(&self) -> Result<Arc<ActiveSelection>, GatewayError> {
        let endpoints = self.registry.endpoints();
        tracing::info!(candidates = endpoints.len(), "probing upstream endpoints");

        let mut attempted = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            attempted.push(endpoint.label.clone());

            let url = endpoint.url(LIVENESS_PATH);
            let started = Instant::now();
            let outcome = tokio::time::timeout(
                endpoint.timeout,
                self.transport.probe(&url, endpoint.timeout),
            )
            .await
            .unwrap_or_else(|_| {
                Err(TransportError::Timeout {
                    after_ms: millis(endpoint.timeout),
                })
            });

            match outcome {
                Ok(()) => {
                    let latency = started.elapsed();
                    let selection = self
                        .registry
                        .record(ActiveSelection::new(Arc::clone(endpoint), latency));
                    tracing::info!(
                        endpoint = %endpoint.label,
                        url = %endpoint.base_url,
                        latency_ms = millis(latency),
                        "upstream selected"
                    );
                    return Ok(selection);
                }
                Err(e) => {
                    tracing::warn!(
                        endpoint = %endpoint.label,
                        url = %endpoint.base_url,
                        error = %e,
                        "upstream probe failed"
                    );
                }
            }
        }

        tracing::error!(attempted = ?attempted, "no upstream endpoint reachable");
        self.registry.clear();
        Err(GatewayError::NoUpstreamAvailable { attempted })
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
