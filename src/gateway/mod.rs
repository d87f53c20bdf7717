//! Ollama Gateway: failover client for one or more Ollama servers.
//!
//! This module handles all communication with the upstream LLM servers:
//! - Lazy, priority-ordered health probing with a cached active selection
//! - Non-streaming chat/generate with a single retry on timeout
//! - NDJSON streaming relay with cancellation on drop
//! - Response normalization across chat and legacy generate shapes
//! - Model listing, inspection and pulls
//! - Configuration loading from `config/gateway.yaml`
//!
//! Endpoints are interchangeable via config. Moving from a LAN box to a
//! hosted server is a config change, not a code change.

pub mod client;
pub mod config;
pub mod errors;
pub mod normalize;
pub mod prober;
pub mod registry;
pub mod streaming;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenience
pub use client::{ChatOutcome, GatewayClient, RequestDefaults};
pub use config::{EndpointConfig, GatewayConfig};
pub use errors::{GatewayError, TransportError};
pub use streaming::{FragmentStream, PullStream};
pub use types::{
    ChatFragment, ChatMessage, ChatRequest, Endpoint, GenerateRequest, ModelDetail, ModelInfo,
    NormalizedResponse, PullProgress, Role,
};
