//! Background health prober.
//!
//! Availability is only ever restored here: endpoints that are enabled but
//! currently unavailable get a minimal messages probe every
//! `check_interval`. The probe goes through the same model rewrite and
//! format conversion as real traffic, so a broken rewrite rule keeps the
//! endpoint down instead of flapping it back up.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use reqwest::Client;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::config::TimeoutsConfig;
use crate::convert::{
    self, ANTHROPIC_VERSION, CHAT_COMPLETIONS_PATH, Content, MESSAGES_PATH, Message,
    MessagesRequest, Role,
};
use crate::endpoint::{AuthKind, Endpoint, EndpointKind, EndpointRegistry};
use crate::oauth::OAuthManager;
use crate::rewrite::rewrite_model;
use crate::validator::{validate_anthropic_body, validate_openai_body};

const PROBE_MODEL: &str = "claude-3-5-haiku-20241022";

pub struct HealthChecker {
    registry: Arc<EndpointRegistry>,
    oauth: Arc<OAuthManager>,
    http: Client,
    probe_timeout: Duration,
    check_interval: Duration,
    /// Names with a probe currently in flight; probes never overlap per
    /// endpoint.
    in_flight: Mutex<HashSet<String>>,
}

impl HealthChecker {
    pub fn new(
        registry: Arc<EndpointRegistry>,
        oauth: Arc<OAuthManager>,
        http: Client,
        timeouts: &TimeoutsConfig,
    ) -> Self {
        Self {
            registry,
            oauth,
            http,
            probe_timeout: timeouts.health_check_timeout(),
            check_interval: timeouts.check_interval(),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.check_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.run_once().await;
            }
        })
    }

    /// One probing pass over the enabled endpoints that are currently out of
    /// rotation.
    pub async fn run_once(&self) {
        let snapshot = self.registry.snapshot();
        for ep in snapshot.iter() {
            if !ep.enabled || self.registry.is_available(&ep.name) {
                continue;
            }
            {
                let mut guard = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
                if !guard.insert(ep.name.clone()) {
                    continue;
                }
            }
            let healthy = match self.probe(ep).await {
                Ok(healthy) => healthy,
                Err(err) => {
                    debug!("health probe for '{}' errored: {err}", ep.name);
                    false
                }
            };
            if healthy {
                self.registry.mark_available(&ep.name);
            }
            let mut guard = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            guard.remove(&ep.name);
        }
    }

    async fn probe(&self, ep: &Endpoint) -> Result<bool> {
        let model = rewrite_model(&ep.model_rewrite, PROBE_MODEL)
            .unwrap_or_else(|| PROBE_MODEL.to_string());
        let probe = MessagesRequest {
            model,
            messages: vec![Message {
                role: Role::User,
                content: Content::Text("ping".to_string()),
            }],
            system: None,
            max_tokens: 1,
            stream: None,
            temperature: None,
            top_p: None,
            top_k: None,
            stop_sequences: None,
            tools: None,
            tool_choice: None,
            thinking: None,
            metadata: None,
        };

        let (url, body) = match ep.kind {
            EndpointKind::Anthropic => (
                ep.target_url(MESSAGES_PATH),
                serde_json::to_vec(&probe)?,
            ),
            EndpointKind::OpenAi => (
                ep.target_url(CHAT_COMPLETIONS_PATH),
                serde_json::to_vec(&convert::anthropic_request_to_openai(&probe)?)?,
            ),
        };

        let mut request = self
            .http
            .post(&url)
            .header("content-type", "application/json")
            .body(body);
        match ep.auth {
            AuthKind::ApiKey => {
                request = request
                    .header("x-api-key", ep.auth_value.clone().unwrap_or_default())
                    .header("anthropic-version", ANTHROPIC_VERSION);
            }
            AuthKind::AuthToken => {
                request = request.header(
                    "authorization",
                    format!("Bearer {}", ep.auth_value.clone().unwrap_or_default()),
                );
            }
            AuthKind::Oauth => {
                let token = self.oauth.access_token(&ep.name).await?;
                request = request
                    .header("authorization", format!("Bearer {token}"))
                    .header("anthropic-version", ANTHROPIC_VERSION);
            }
        }

        let resp = match tokio::time::timeout(self.probe_timeout, request.send()).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(err)) => {
                debug!("health probe transport error for '{}': {err}", ep.name);
                return Ok(false);
            }
            Err(_) => {
                warn!("health probe for '{}' timed out", ep.name);
                return Ok(false);
            }
        };
        if !resp.status().is_success() {
            debug!(
                "health probe for '{}' returned {}",
                ep.name,
                resp.status()
            );
            return Ok(false);
        }
        let bytes = match resp.bytes().await {
            Ok(b) => b,
            Err(_) => return Ok(false),
        };
        // 探测响应必须能按端点自身的原生格式解析。
        let verdict = match ep.kind {
            EndpointKind::Anthropic => validate_anthropic_body(&bytes),
            EndpointKind::OpenAi => validate_openai_body(&bytes),
        };
        Ok(verdict.is_ok())
    }
}
