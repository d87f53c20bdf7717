//! Gateway configuration loading and validation.
//!
//! Reads `config/gateway.yaml` and resolves environment variables. When no
//! file exists the built-in LAN/WAN pair is used.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::errors::GatewayError;
use super::registry::DEFAULT_HEALTH_CACHE_TTL;
use super::types::Endpoint;

/// Config file location relative to a project root.
pub const CONFIG_RELATIVE_PATH: &str = "config/gateway.yaml";

/// Env var naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "OLLAMA_GATEWAY_CONFIG";

// ─── Public Types ────────────────────────────────────────────────────────────

/// One upstream as written in the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub label: String,
    pub base_url: String,
    /// Lower probes first.
    pub priority: u32,
    /// Bounds probes, requests, and the gap between streamed chunks.
    pub timeout_secs: u64,
}

/// Top-level gateway configuration (mirrors `config/gateway.yaml`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub default_model: String,
    pub health_cache_ttl_secs: u64,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    /// Overrides the platform data dir for log files.
    pub log_dir: Option<String>,
    pub endpoints: Vec<EndpointConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            default_model: "llama3.1:8b".into(),
            health_cache_ttl_secs: DEFAULT_HEALTH_CACHE_TTL.as_secs(),
            temperature: 0.7,
            max_tokens: Some(2048),
            log_dir: None,
            endpoints: vec![
                EndpointConfig {
                    label: "LAN".into(),
                    base_url: "http://192.168.50.123:11434".into(),
                    priority: 1,
                    timeout_secs: 120,
                },
                EndpointConfig {
                    label: "WAN".into(),
                    base_url: "http://iaevolutionxm.asuscomm.com:11434".into(),
                    priority: 2,
                    timeout_secs: 180,
                },
            ],
        }
    }
}

impl GatewayConfig {
    /// Reject configurations the registry cannot work with.
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.endpoints.is_empty() {
            return Err(config_error("at least one upstream endpoint is required"));
        }
        if self.health_cache_ttl_secs == 0 {
            return Err(config_error("health_cache_ttl_secs must be greater than zero"));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(config_error(format!(
                "temperature {} is outside 0.0..=2.0",
                self.temperature
            )));
        }

        let mut labels = HashSet::new();
        for endpoint in &self.endpoints {
            if endpoint.label.trim().is_empty() {
                return Err(config_error("endpoint label must not be empty"));
            }
            if !labels.insert(endpoint.label.as_str()) {
                return Err(config_error(format!(
                    "duplicate endpoint label '{}'",
                    endpoint.label
                )));
            }
            if endpoint.timeout_secs == 0 {
                return Err(config_error(format!(
                    "endpoint '{}' has a zero timeout",
                    endpoint.label
                )));
            }
            let url = reqwest::Url::parse(&endpoint.base_url).map_err(|e| {
                config_error(format!(
                    "endpoint '{}' has an invalid base_url '{}': {e}",
                    endpoint.label, endpoint.base_url
                ))
            })?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(config_error(format!(
                    "endpoint '{}' must use http or https",
                    endpoint.label
                )));
            }
        }
        Ok(())
    }

    /// Runtime endpoints, in configuration order.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.endpoints
            .iter()
            .map(|e| Endpoint {
                label: e.label.clone(),
                base_url: e.base_url.trim_end_matches('/').to_string(),
                priority: e.priority,
                timeout: Duration::from_secs(e.timeout_secs),
            })
            .collect()
    }

    pub fn health_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.health_cache_ttl_secs)
    }
}

fn config_error(reason: impl Into<String>) -> GatewayError {
    GatewayError::ConfigError {
        reason: reason.into(),
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Locate `config/gateway.yaml`.
///
/// `OLLAMA_GATEWAY_CONFIG` wins when it names an existing file; otherwise
/// searches upward from `start`.
pub fn find_config_path(start: &Path) -> Result<PathBuf, GatewayError> {
    if let Ok(explicit) = std::env::var(CONFIG_ENV_VAR) {
        let candidate = PathBuf::from(expand_tilde(&explicit));
        if candidate.is_file() {
            return Ok(candidate);
        }
        tracing::warn!(path = %candidate.display(), "OLLAMA_GATEWAY_CONFIG does not name a file");
    }

    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(CONFIG_RELATIVE_PATH);
        if candidate.is_file() {
            return Ok(candidate);
        }
        if !dir.pop() {
            break;
        }
    }

    Err(config_error(format!("could not find {CONFIG_RELATIVE_PATH}")))
}

/// Load, interpolate, parse and validate a config file.
///
/// String values may use `${VAR_NAME}` or `${VAR_NAME:-default}`.
pub fn load_gateway_config(path: &Path) -> Result<GatewayConfig, GatewayError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| config_error(format!("failed to read {}: {e}", path.display())))?;

    let interpolated = interpolate_env_vars(&raw);

    let config: GatewayConfig = serde_yaml::from_str(&interpolated)
        .map_err(|e| config_error(format!("failed to parse {}: {e}", path.display())))?;
    config.validate()?;

    tracing::debug!(
        path = %path.display(),
        endpoints = config.endpoints.len(),
        "gateway config loaded"
    );
    Ok(config)
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Substitute `${VAR}` and `${VAR:-default}` references.
///
/// An unterminated `${` is kept as written.
fn interpolate_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let reference = &rest[start + 2..];
        let Some(close) = reference.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        out.push_str(&lookup_var(&reference[..close]));
        rest = &reference[close + 1..];
    }

    out.push_str(rest);
    out
}

/// Value of `VAR` or `VAR:-default`. With a default, an empty variable counts
/// as unset.
fn lookup_var(reference: &str) -> String {
    let (name, default) = match reference.split_once(":-") {
        Some((name, default)) => (name, Some(default)),
        None => (reference, None),
    };
    match (std::env::var(name), default) {
        (Ok(value), _) if !value.is_empty() => value,
        (_, Some(default)) => expand_tilde(default),
        (Ok(value), None) => value,
        (Err(_), None) => String::new(),
    }
}

/// Expand `~` or a leading `~/` to the home directory. `~user` is left alone.
pub fn expand_tilde(path: &str) -> String {
    let rest = match path.strip_prefix('~') {
        Some("") => None,
        Some(rest) if rest.starts_with('/') || rest.starts_with(std::path::MAIN_SEPARATOR) => {
            Some(&rest[1..])
        }
        _ => return path.to_string(),
    };
    let Some(home) = dirs::home_dir() else {
        return path.to_string();
    };
    match rest {
        Some(rest) => home.join(rest).to_string_lossy().into_owned(),
        None => home.to_string_lossy().into_owned(),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
