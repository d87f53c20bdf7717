//! Gateway error types.
//!
//! Two layers: [`TransportError`] describes what went wrong on the wire with
//! no knowledge of which endpoint was involved, and [`GatewayError`] is what
//! callers see, carrying the endpoint label and the policy-relevant category.
//! Structured logging is the caller's responsibility.

use thiserror::Error;

use super::types::Endpoint;

/// Wire-level failures reported by an [`UpstreamTransport`](super::transport::UpstreamTransport).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// No response (or no further bytes) within the allotted time.
    #[error("timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    /// TCP/TLS connection could not be established or was reset.
    #[error("connection failed: {reason}")]
    Connect { reason: String },

    /// The server answered with a non-2xx status.
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// The body could not be read or decoded.
    #[error("undecodable body: {reason}")]
    Decode { reason: String },
}

/// Errors surfaced by the gateway to the request-handling layer.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Every candidate endpoint failed its liveness probe.
    #[error("no upstream available (tried: {})", attempted.join(", "))]
    NoUpstreamAvailable { attempted: Vec<String> },

    /// The endpoint accepted the connection but did not answer in time.
    #[error("upstream '{endpoint}' timed out after {timeout_ms}ms")]
    UpstreamTimeout { endpoint: String, timeout_ms: u64 },

    /// Connection-level failure: the endpoint is gone.
    #[error("upstream '{endpoint}' unavailable: {reason}")]
    UpstreamUnavailable { endpoint: String, reason: String },

    /// The endpoint answered with a body we could not decode.
    #[error("upstream '{endpoint}' sent a malformed response: {reason}")]
    UpstreamProtocolError { endpoint: String, reason: String },

    /// The endpoint answered with a non-2xx status.
    #[error("upstream '{endpoint}' returned HTTP {status}: {body}")]
    UpstreamRejected {
        endpoint: String,
        status: u16,
        body: String,
    },

    /// The endpoint reported an error in-band (an `{"error": …}` line).
    #[error("upstream '{endpoint}' reported: {message}")]
    UpstreamReported { endpoint: String, message: String },

    /// The caller's request cannot be sent as-is.
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// Configuration loading or validation error.
    #[error("config error: {reason}")]
    ConfigError { reason: String },
}

impl GatewayError {
    /// Attach endpoint context to a transport failure.
    pub fn from_transport(endpoint: &Endpoint, err: TransportError) -> Self {
        let label = endpoint.label.clone();
        match err {
            TransportError::Timeout { after_ms } => GatewayError::UpstreamTimeout {
                endpoint: label,
                timeout_ms: after_ms,
            },
            TransportError::Connect { reason } => GatewayError::UpstreamUnavailable {
                endpoint: label,
                reason,
            },
            TransportError::Status { status, body } => GatewayError::UpstreamRejected {
                endpoint: label,
                status,
                body,
            },
            TransportError::Decode { reason } => GatewayError::UpstreamProtocolError {
                endpoint: label,
                reason,
            },
        }
    }

    /// Whether the relay may retry this failure against a re-probed endpoint.
    ///
    /// Only timeouts qualify: a slow server may recover or a faster one may
    /// take over, while a vanished server or a malformed body will not.
    pub fn is_retriable(&self) -> bool {
        matches!(self, GatewayError::UpstreamTimeout { .. })
    }

    /// HTTP status the request-handling layer should answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            GatewayError::NoUpstreamAvailable { .. } => 503,
            GatewayError::UpstreamTimeout { .. } => 504,
            GatewayError::UpstreamUnavailable { .. } => 503,
            GatewayError::UpstreamProtocolError { .. } => 502,
            GatewayError::UpstreamRejected { status: 404, .. } => 404,
            GatewayError::UpstreamRejected { .. } => 502,
            GatewayError::UpstreamReported { .. } => 502,
            GatewayError::InvalidRequest { .. } => 400,
            GatewayError::ConfigError { .. } => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn lan() -> Endpoint {
        Endpoint {
            label: "LAN".into(),
            base_url: "http://10.0.0.2:11434".into(),
            priority: 1,
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_from_transport_maps_each_kind() {
        let e = GatewayError::from_transport(&lan(), TransportError::Timeout { after_ms: 5000 });
        assert!(matches!(
            e,
            GatewayError::UpstreamTimeout { ref endpoint, timeout_ms: 5000 } if endpoint == "LAN"
        ));

        let e = GatewayError::from_transport(
            &lan(),
            TransportError::Connect {
                reason: "refused".into(),
            },
        );
        assert!(matches!(e, GatewayError::UpstreamUnavailable { .. }));

        let e = GatewayError::from_transport(
            &lan(),
            TransportError::Status {
                status: 404,
                body: "model not found".into(),
            },
        );
        assert!(matches!(e, GatewayError::UpstreamRejected { status: 404, .. }));

        let e = GatewayError::from_transport(
            &lan(),
            TransportError::Decode {
                reason: "expected value".into(),
            },
        );
        assert!(matches!(e, GatewayError::UpstreamProtocolError { .. }));
    }

    #[test]
    fn test_only_timeout_is_retriable() {
        assert!(GatewayError::UpstreamTimeout {
            endpoint: "LAN".into(),
            timeout_ms: 1
        }
        .is_retriable());
        assert!(!GatewayError::UpstreamUnavailable {
            endpoint: "LAN".into(),
            reason: "".into()
        }
        .is_retriable());
        assert!(!GatewayError::UpstreamProtocolError {
            endpoint: "LAN".into(),
            reason: "".into()
        }
        .is_retriable());
        assert!(!GatewayError::NoUpstreamAvailable { attempted: vec![] }.is_retriable());
    }

    #[test]
    fn test_http_status_translation() {
        assert_eq!(
            GatewayError::NoUpstreamAvailable { attempted: vec![] }.http_status(),
            503
        );
        assert_eq!(
            GatewayError::UpstreamTimeout {
                endpoint: "WAN".into(),
                timeout_ms: 1
            }
            .http_status(),
            504
        );
        assert_eq!(
            GatewayError::UpstreamRejected {
                endpoint: "WAN".into(),
                status: 404,
                body: "".into()
            }
            .http_status(),
            404
        );
        assert_eq!(
            GatewayError::UpstreamRejected {
                endpoint: "WAN".into(),
                status: 500,
                body: "".into()
            }
            .http_status(),
            502
        );
    }

    #[test]
    fn test_no_upstream_message_lists_attempts() {
        let err = GatewayError::NoUpstreamAvailable {
            attempted: vec!["LAN".into(), "WAN".into()],
        };
        assert_eq!(err.to_string(), "no upstream available (tried: LAN, WAN)");
    }
}
