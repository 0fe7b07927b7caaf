//! OAuth access-token lifecycle for `auth_type: oauth` endpoints.
//!
//! One token cell per endpoint, with single-flight refresh: the first caller
//! that sees an expiring token spawns the refresh task and stores the shared
//! future under the cell lock; concurrent callers await the same future. The
//! refresh runs in its own task, so a cancelled request does not cancel a
//! refresh other requests are waiting on.
//!
//! A refreshed credential is persisted through the callback before the new
//! access token is handed to anyone.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use reqwest::Client;
use serde::Deserialize;
use tracing::{info, warn};

use crate::config::OAuthConfig;
use crate::endpoint::{AuthKind, Endpoint, now_ms};

/// Refresh this long before the recorded expiry.
pub const REFRESH_SKEW_MS: u64 = 60_000;

const DEFAULT_EXPIRES_IN_SECS: u64 = 3600;

/// Durable-write hook invoked after every successful refresh, before the new
/// token is used. Synchronous on purpose: when it returns Ok the credentials
/// are on disk.
pub type PersistFn = Arc<dyn Fn(&str, &OAuthConfig) -> Result<()> + Send + Sync>;

type SharedRefresh = Shared<BoxFuture<'static, Result<OAuthConfig, String>>>;

struct TokenCell {
    tokens: OAuthConfig,
    failed: bool,
    inflight: Option<SharedRefresh>,
}

pub struct OAuthManager {
    http: Client,
    persist: PersistFn,
    cells: Arc<Mutex<HashMap<String, TokenCell>>>,
}

impl OAuthManager {
    pub fn new(http: Client, persist: PersistFn) -> Self {
        Self {
            http,
            persist,
            cells: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register or update the cells for the OAuth endpoints of a snapshot.
    /// A cell whose refresh token is unchanged keeps its runtime tokens, so
    /// a hot update does not discard a refreshed credential.
    pub fn register_endpoints(&self, endpoints: &[Arc<Endpoint>]) {
        let mut cells = self.cells.lock().unwrap_or_else(|e| e.into_inner());
        for ep in endpoints {
            if ep.auth != AuthKind::Oauth {
                continue;
            }
            let Some(oauth) = &ep.oauth else {
                warn!("endpoint '{}' has auth_type oauth but no oauth section", ep.name);
                continue;
            };
            match cells.get(&ep.name) {
                Some(cell) if cell.tokens.refresh_token == oauth.refresh_token => {}
                _ => {
                    cells.insert(
                        ep.name.clone(),
                        TokenCell {
                            tokens: oauth.clone(),
                            failed: false,
                            inflight: None,
                        },
                    );
                }
            }
        }
    }

    /// Resolve the access token to sign the next outbound request with,
    /// refreshing first if the token expires within the skew window or the
    /// cell is in the failed state.
    pub async fn access_token(&self, name: &str) -> Result<String> {
        let shared = {
            let mut cells = self.cells.lock().unwrap_or_else(|e| e.into_inner());
            let cell = cells
                .get_mut(name)
                .ok_or_else(|| anyhow!("no oauth credentials registered for endpoint '{name}'"))?;
            let expiring = cell.tokens.auto_refresh
                && now_ms() + REFRESH_SKEW_MS >= cell.tokens.expires_at_ms;
            if !expiring && !cell.failed {
                return Ok(cell.tokens.access_token.clone());
            }
            self.begin_refresh_locked(cell, name)
        };
        match shared.await {
            Ok(tokens) => Ok(tokens.access_token),
            Err(err) => Err(anyhow!("oauth refresh for '{name}' failed: {err}")),
        }
    }

    /// Unconditional refresh, used after an upstream 401/403.
    pub async fn force_refresh(&self, name: &str) -> Result<String> {
        let shared = {
            let mut cells = self.cells.lock().unwrap_or_else(|e| e.into_inner());
            let cell = cells
                .get_mut(name)
                .ok_or_else(|| anyhow!("no oauth credentials registered for endpoint '{name}'"))?;
            self.begin_refresh_locked(cell, name)
        };
        match shared.await {
            Ok(tokens) => Ok(tokens.access_token),
            Err(err) => Err(anyhow!("oauth refresh for '{name}' failed: {err}")),
        }
    }

    fn begin_refresh_locked(&self, cell: &mut TokenCell, name: &str) -> SharedRefresh {
        if let Some(shared) = &cell.inflight {
            return shared.clone();
        }

        let http = self.http.clone();
        let tokens = cell.tokens.clone();
        let persist = self.persist.clone();
        let cells = self.cells.clone();
        let name = name.to_string();
        let handle = tokio::spawn(async move {
            let result = refresh_once(&http, &name, &tokens, persist).await;
            let mut cells = cells.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(cell) = cells.get_mut(&name) {
                cell.inflight = None;
                match &result {
                    Ok(next) => {
                        cell.tokens = next.clone();
                        cell.failed = false;
                    }
                    Err(err) => {
                        cell.failed = true;
                        warn!("oauth refresh for '{name}' failed: {err}");
                    }
                }
            }
            result
        });
        let shared = async move {
            match handle.await {
                Ok(result) => result,
                Err(err) => Err(format!("refresh task aborted: {err}")),
            }
        }
        .boxed()
        .shared();
        cell.inflight = Some(shared.clone());
        shared
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

async fn refresh_once(
    http: &Client,
    name: &str,
    current: &OAuthConfig,
    persist: PersistFn,
) -> Result<OAuthConfig, String> {
    let body = serde_json::json!({
        "grant_type": "refresh_token",
        "refresh_token": current.refresh_token,
        "client_id": current.client_id,
    });
    let resp = http
        .post(&current.token_url)
        .header("Content-Type", "application/json")
        .header("Accept", "application/json")
        .json(&body)
        .send()
        .await
        .map_err(|e| format!("token request failed: {e}"))?;

    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        return Err(format!("token endpoint returned {status}: {text}"));
    }

    let parsed: TokenResponse = resp
        .json()
        .await
        .map_err(|e| format!("token response is not valid JSON: {e}"))?;

    let mut next = current.clone();
    next.access_token = parsed.access_token;
    if let Some(rt) = parsed.refresh_token {
        next.refresh_token = rt;
    }
    next.expires_at_ms =
        now_ms() + parsed.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS) * 1000;

    // The new credential must be durable before anyone signs a request with it.
    persist(name, &next).map_err(|e| format!("persisting refreshed credentials failed: {e}"))?;

    info!("refreshed oauth credentials for endpoint '{name}'");
    Ok(next)
}
