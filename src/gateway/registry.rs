//! Server registry: candidate endpoints and the current active selection.
//!
//! The selection lives behind an atomic pointer swap. Readers never block,
//! concurrent writers race with last-writer-wins, and invalidation only
//! clears the selection a failing request actually used.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use tokio::time::Instant;

use super::errors::GatewayError;
use super::types::Endpoint;

/// How long a successful probe is trusted.
pub const DEFAULT_HEALTH_CACHE_TTL: Duration = Duration::from_secs(60);

// ─── ActiveSelection ─────────────────────────────────────────────────────────

/// The currently trusted endpoint.
#[derive(Debug, Clone)]
pub struct ActiveSelection {
    pub endpoint: Arc<Endpoint>,
    /// Round-trip of the probe that selected this endpoint.
    pub latency: Duration,
    /// Monotonic verification time, used for TTL checks.
    pub verified_at: Instant,
    /// Wall-clock verification time, for display only.
    pub verified_at_utc: DateTime<Utc>,
}

impl ActiveSelection {
    /// A selection verified just now.
    pub fn new(endpoint: Arc<Endpoint>, latency: Duration) -> Self {
        Self {
            endpoint,
            latency,
            verified_at: Instant::now(),
            verified_at_utc: Utc::now(),
        }
    }

    pub fn age(&self) -> Duration {
        Instant::now().saturating_duration_since(self.verified_at)
    }

    pub fn is_fresh(&self, ttl: Duration) -> bool {
        self.age() < ttl
    }
}

// ─── ServerRegistry ──────────────────────────────────────────────────────────

/// Ordered candidate endpoints plus the cached active selection.
pub struct ServerRegistry {
    /// Sorted by ascending priority; ties keep configuration order.
    endpoints: Vec<Arc<Endpoint>>,
    health_cache_ttl: Duration,
    active: ArcSwapOption<ActiveSelection>,
}

impl ServerRegistry {
    /// Build a registry. Starts with no active selection.
    pub fn new(mut endpoints: Vec<Endpoint>, health_cache_ttl: Duration) -> Result<Self, GatewayError> {
        if endpoints.is_empty() {
            return Err(GatewayError::ConfigError {
                reason: "at least one upstream endpoint is required".into(),
            });
        }
        endpoints.sort_by_key(|e| e.priority);

        Ok(Self {
            endpoints: endpoints.into_iter().map(Arc::new).collect(),
            health_cache_ttl,
            active: ArcSwapOption::empty(),
        })
    }

    /// Candidates in probe order.
    pub fn endpoints(&self) -> &[Arc<Endpoint>] {
        &self.endpoints
    }

    pub fn health_cache_ttl(&self) -> Duration {
        self.health_cache_ttl
    }

    /// The stored selection, fresh or not.
    pub fn current(&self) -> Option<Arc<ActiveSelection>> {
        self.active.load_full()
    }

    /// The stored selection if it was verified within the TTL.
    pub fn fresh(&self) -> Option<Arc<ActiveSelection>> {
        self.current()
            .filter(|selection| selection.is_fresh(self.health_cache_ttl))
    }

    /// The selected endpoint, if any. Makes no network call.
    pub fn active_endpoint(&self) -> Option<Arc<Endpoint>> {
        self.current().map(|selection| Arc::clone(&selection.endpoint))
    }

    /// Store a freshly probed selection, replacing whatever was there.
    pub fn record(&self, selection: ActiveSelection) -> Arc<ActiveSelection> {
        let selection = Arc::new(selection);
        self.active.store(Some(Arc::clone(&selection)));
        selection
    }

    /// Clear the selection if it is still `used`.
    ///
    /// Returns `false` when another request already replaced it, in which
    /// case the newer selection is left alone.
    pub fn invalidate(&self, used: &Arc<ActiveSelection>) -> bool {
        let expected = Some(Arc::clone(used));
        let previous = self.active.compare_and_swap(&expected, None::<Arc<ActiveSelection>>);
        let cleared = matches!(&*previous, Some(prev) if Arc::ptr_eq(prev, used));
        if cleared {
            tracing::debug!(endpoint = %used.endpoint.label, "active upstream invalidated");
        }
        cleared
    }

    /// Drop the selection unconditionally.
    pub fn clear(&self) {
        self.active.store(None);
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(label: &str, priority: u32) -> Endpoint {
        Endpoint {
            label: label.into(),
            base_url: format!("http://{}.local:11434", label.to_lowercase()),
            priority,
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_empty_endpoint_list_rejected() {
        let result = ServerRegistry::new(vec![], DEFAULT_HEALTH_CACHE_TTL);
        assert!(matches!(result, Err(GatewayError::ConfigError { .. })));
    }

    #[test]
    fn test_endpoints_sorted_by_priority_stable() {
        let registry = ServerRegistry::new(
            vec![endpoint("WAN", 2), endpoint("LAN", 1), endpoint("BACKUP", 2)],
            DEFAULT_HEALTH_CACHE_TTL,
        )
        .unwrap();
        let labels: Vec<_> = registry.endpoints().iter().map(|e| e.label.as_str()).collect();
        assert_eq!(labels, vec!["LAN", "WAN", "BACKUP"]);
    }

    #[test]
    fn test_starts_without_selection() {
        let registry = ServerRegistry::new(vec![endpoint("LAN", 1)], DEFAULT_HEALTH_CACHE_TTL).unwrap();
        assert!(registry.current().is_none());
        assert!(registry.active_endpoint().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_selection_goes_stale_after_ttl() {
        let registry = ServerRegistry::new(vec![endpoint("LAN", 1)], Duration::from_secs(60)).unwrap();
        let lan = Arc::clone(&registry.endpoints()[0]);
        registry.record(ActiveSelection::new(lan, Duration::from_millis(3)));
        assert!(registry.fresh().is_some());

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(registry.fresh().is_some());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(registry.fresh().is_none());
        assert!(registry.current().is_some(), "stale selection is kept until replaced");
    }

    #[test]
    fn test_invalidate_clears_matching_selection() {
        let registry = ServerRegistry::new(vec![endpoint("LAN", 1)], DEFAULT_HEALTH_CACHE_TTL).unwrap();
        let lan = Arc::clone(&registry.endpoints()[0]);
        let used = registry.record(ActiveSelection::new(lan, Duration::ZERO));

        assert!(registry.invalidate(&used));
        assert!(registry.current().is_none());
        assert!(!registry.invalidate(&used), "second invalidation is a no-op");
    }

    #[test]
    fn test_invalidate_keeps_newer_selection() {
        let registry = ServerRegistry::new(
            vec![endpoint("LAN", 1), endpoint("WAN", 2)],
            DEFAULT_HEALTH_CACHE_TTL,
        )
        .unwrap();
        let lan = Arc::clone(&registry.endpoints()[0]);
        let wan = Arc::clone(&registry.endpoints()[1]);

        let stale = registry.record(ActiveSelection::new(lan, Duration::ZERO));
        registry.record(ActiveSelection::new(wan, Duration::ZERO));

        assert!(!registry.invalidate(&stale));
        assert_eq!(registry.active_endpoint().unwrap().label, "WAN");
    }
}
