use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{EndpointConfig, OAuthConfig};
use crate::rewrite::RewriteRule;

/// Native wire format of an upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EndpointKind {
    #[default]
    Anthropic,
    OpenAi,
}

/// How the outbound auth header is formed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthKind {
    /// `x-api-key: <value>` plus the client's `anthropic-version` header.
    #[default]
    ApiKey,
    /// `Authorization: Bearer <value>`.
    AuthToken,
    /// `Authorization: Bearer <access_token>`, resolved through the OAuth
    /// manager immediately before dispatch.
    Oauth,
}

/// One configured upstream target. Immutable once built; hot updates
/// publish a whole new set.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub name: String,
    pub base_url: String,
    pub path_prefix: Option<String>,
    pub kind: EndpointKind,
    pub auth: AuthKind,
    pub auth_value: Option<String>,
    pub oauth: Option<OAuthConfig>,
    pub enabled: bool,
    pub priority: u32,
    pub tags: Vec<String>,
    pub model_rewrite: Vec<RewriteRule>,
}

impl Endpoint {
    pub fn from_config(cfg: &EndpointConfig) -> Self {
        Self {
            name: cfg.name.clone(),
            base_url: cfg.url.trim_end_matches('/').to_string(),
            path_prefix: cfg
                .path_prefix
                .as_deref()
                .map(|p| format!("/{}", p.trim_matches('/')))
                .filter(|p| p != "/"),
            kind: cfg.endpoint_type,
            auth: cfg.auth_type,
            auth_value: cfg.auth_value.clone(),
            oauth: cfg.oauth.clone(),
            enabled: cfg.enabled,
            priority: cfg.priority,
            tags: cfg.tags.clone(),
            model_rewrite: cfg.model_rewrite.clone(),
        }
    }

    pub fn is_universal(&self) -> bool {
        self.tags.is_empty()
    }

    /// Full upstream URL for a request path (with query).
    pub fn target_url(&self, path_and_query: &str) -> String {
        match &self.path_prefix {
            Some(prefix) => format!("{}{}{}", self.base_url, prefix, path_and_query),
            None => format!("{}{}", self.base_url, path_and_query),
        }
    }
}

/// Runtime health for one endpoint, kept in a side table keyed by name so
/// endpoint snapshots stay immutable.
#[derive(Debug, Clone)]
pub struct HealthState {
    pub available: bool,
    pub consecutive_failures: u32,
    pub last_failure_ms: Option<u64>,
    pub last_success_ms: Option<u64>,
}

impl Default for HealthState {
    fn default() -> Self {
        Self {
            available: true,
            consecutive_failures: 0,
            last_failure_ms: None,
            last_success_ms: None,
        }
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Endpoint registry: an atomically swapped snapshot (priority + name order)
/// plus the health side table.
///
/// Readers take a snapshot for the duration of one selection; writers
/// publish a new snapshot. Health updates never invalidate snapshots.
pub struct EndpointRegistry {
    snapshot: RwLock<Arc<Vec<Arc<Endpoint>>>>,
    health: Mutex<HashMap<String, HealthState>>,
    unhealthy_threshold: u32,
}

fn sorted_snapshot(mut endpoints: Vec<Endpoint>) -> Arc<Vec<Arc<Endpoint>>> {
    endpoints.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));
    Arc::new(endpoints.into_iter().map(Arc::new).collect())
}

impl EndpointRegistry {
    pub fn new(endpoints: Vec<Endpoint>, unhealthy_threshold: u32) -> Self {
        let snapshot = sorted_snapshot(endpoints);
        let mut health = HashMap::new();
        for ep in snapshot.iter() {
            health.insert(ep.name.clone(), HealthState::default());
        }
        Self {
            snapshot: RwLock::new(snapshot),
            health: Mutex::new(health),
            unhealthy_threshold: unhealthy_threshold.max(1),
        }
    }

    pub fn from_configs(configs: &[EndpointConfig], unhealthy_threshold: u32) -> Self {
        Self::new(
            configs.iter().map(Endpoint::from_config).collect(),
            unhealthy_threshold,
        )
    }

    /// Current endpoint set, ordered by ascending priority with name as the
    /// deterministic tie-break.
    pub fn snapshot(&self) -> Arc<Vec<Arc<Endpoint>>> {
        self.snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn list_all(&self) -> Vec<Arc<Endpoint>> {
        self.snapshot().iter().cloned().collect()
    }

    /// Atomic replace-by-name. Endpoints whose name survives keep their
    /// runtime counters; new names start available; removed names are
    /// discarded. Readers observe either the old set or the new set.
    pub fn update(&self, endpoints: Vec<Endpoint>) {
        let next = sorted_snapshot(endpoints);
        // 先持有 snapshot 写锁再改 health，保证读者看不到“半套”状态。
        let mut snap = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
        let mut health = self.health.lock().unwrap_or_else(|e| e.into_inner());
        let mut kept = HashMap::new();
        for ep in next.iter() {
            let state = health.remove(&ep.name).unwrap_or_default();
            kept.insert(ep.name.clone(), state);
        }
        *health = kept;
        *snap = next;
        info!("endpoint registry updated: {} endpoints", snap.len());
    }

    pub fn record_success(&self, name: &str) {
        let mut health = self.health.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(state) = health.get_mut(name) {
            state.consecutive_failures = 0;
            state.last_success_ms = Some(now_ms());
        }
    }

    pub fn record_failure(&self, name: &str, reason: &str) {
        let mut health = self.health.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(state) = health.get_mut(name) {
            state.consecutive_failures = state.consecutive_failures.saturating_add(1);
            state.last_failure_ms = Some(now_ms());
            if state.available && state.consecutive_failures >= self.unhealthy_threshold {
                state.available = false;
                warn!(
                    "endpoint '{}' marked unavailable after {} consecutive failures (last: {})",
                    name, state.consecutive_failures, reason
                );
            }
        }
    }

    /// Availability is only ever restored here, by the health prober.
    pub fn mark_available(&self, name: &str) {
        let mut health = self.health.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(state) = health.get_mut(name) {
            if !state.available {
                info!("endpoint '{}' back to available after health probe", name);
            }
            state.available = true;
            state.consecutive_failures = 0;
            state.last_success_ms = Some(now_ms());
        }
    }

    pub fn is_available(&self, name: &str) -> bool {
        let health = self.health.lock().unwrap_or_else(|e| e.into_inner());
        health.get(name).map(|s| s.available).unwrap_or(false)
    }

    pub fn health_of(&self, name: &str) -> Option<HealthState> {
        let health = self.health.lock().unwrap_or_else(|e| e.into_inner());
        health.get(name).cloned()
    }

    /// Point-in-time availability map for one selection pass.
    pub fn availability_view(&self) -> HashMap<String, bool> {
        let health = self.health.lock().unwrap_or_else(|e| e.into_inner());
        health.iter().map(|(k, v)| (k.clone(), v.available)).collect()
    }
}
