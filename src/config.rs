use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::endpoint::{AuthKind, EndpointKind};
use crate::rewrite::RewriteRule;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub tagging: TaggingConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub client_auth: ClientAuthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Unique, immutable identifier. Hot updates match runtime state by name.
    pub name: String,
    /// Base URL, e.g. `https://api.anthropic.com`.
    pub url: String,
    /// Optional path prefix inserted between the base URL and the request path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_prefix: Option<String>,
    #[serde(default)]
    pub endpoint_type: EndpointKind,
    #[serde(default)]
    pub auth_type: AuthKind,
    /// API key or bearer token, depending on `auth_type`. Unused for `oauth`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth: Option<OAuthConfig>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Lower is preferred.
    #[serde(default)]
    pub priority: u32,
    /// Empty = universal endpoint, eligible for untagged requests and as
    /// fallback for tagged ones.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub model_rewrite: Vec<RewriteRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthConfig {
    pub access_token: String,
    pub refresh_token: String,
    /// Absolute expiry in unix milliseconds.
    #[serde(default)]
    pub expires_at_ms: u64,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default = "default_oauth_client_id")]
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
    #[serde(default = "default_true")]
    pub auto_refresh: bool,
}

pub fn default_token_url() -> String {
    "https://console.anthropic.com/v1/oauth/token".to_string()
}

pub fn default_oauth_client_id() -> String {
    "9d1c250a-e61b-44d9-88ed-5944d1962f5e".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Directory for the per-request JSONL log. Defaults to
    /// `<relay home>/logs`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_directory: Option<PathBuf>,
    #[serde(default)]
    pub log_request_body: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            log_directory: None,
            log_request_body: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaggingConfig {
    /// Budget for the whole pipeline run, not per tagger.
    #[serde(default = "default_pipeline_timeout_secs")]
    pub pipeline_timeout_secs: u64,
    #[serde(default)]
    pub taggers: Vec<TaggerConfig>,
}

impl Default for TaggingConfig {
    fn default() -> Self {
        Self {
            pipeline_timeout_secs: default_pipeline_timeout_secs(),
            taggers: Vec::new(),
        }
    }
}

fn default_pipeline_timeout_secs() -> u64 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaggerConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: TaggerKind,
    /// The tag contributed when the rule matches.
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaggerKind {
    PathPrefix,
    Model,
    Header,
    Thinking,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    #[serde(default = "default_tls_handshake_secs")]
    pub tls_handshake_secs: u64,
    #[serde(default = "default_response_header_secs")]
    pub response_header_secs: u64,
    #[serde(default = "default_idle_connection_secs")]
    pub idle_connection_secs: u64,
    #[serde(default = "default_health_check_timeout_secs")]
    pub health_check_timeout_secs: u64,
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    /// Consecutive proxy-path failures before an endpoint is taken out of
    /// rotation. Recovery is only ever through a successful health probe.
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            tls_handshake_secs: default_tls_handshake_secs(),
            response_header_secs: default_response_header_secs(),
            idle_connection_secs: default_idle_connection_secs(),
            health_check_timeout_secs: default_health_check_timeout_secs(),
            check_interval_secs: default_check_interval_secs(),
            unhealthy_threshold: default_unhealthy_threshold(),
        }
    }
}

impl TimeoutsConfig {
    pub fn tls_handshake(&self) -> Duration {
        Duration::from_secs(self.tls_handshake_secs)
    }

    pub fn response_header(&self) -> Duration {
        Duration::from_secs(self.response_header_secs)
    }

    pub fn idle_connection(&self) -> Duration {
        Duration::from_secs(self.idle_connection_secs)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_secs(self.health_check_timeout_secs)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

fn default_tls_handshake_secs() -> u64 {
    10
}

fn default_response_header_secs() -> u64 {
    60
}

fn default_idle_connection_secs() -> u64 {
    90
}

fn default_health_check_timeout_secs() -> u64 {
    30
}

fn default_check_interval_secs() -> u64 {
    30
}

fn default_unhealthy_threshold() -> u32 {
    1
}

/// Admin credentials. The admin UI itself is an external collaborator; the
/// section is parsed so env overrides and persistence keep it intact.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClientAuthConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub required_token: String,
}

/// Home directory for config and logs.
pub fn relay_home_dir() -> PathBuf {
    if let Ok(dir) = env::var("CLAUDE_RELAY_HOME")
        && !dir.trim().is_empty()
    {
        return PathBuf::from(dir);
    }
    home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".claude-relay")
}

pub fn default_config_path() -> PathBuf {
    relay_home_dir().join("config.yaml")
}

pub fn config_backup_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "config.yaml".to_string());
    name.push_str(".backup");
    path.with_file_name(name)
}

const CONFIG_YAML_TEMPLATE: &str = r#"# claude-relay config.yaml
#
# Generated template. Every key is optional; defaults are shown commented out.
# The proxy serves the Anthropic Messages API under /v1/* and forwards each
# request to the first eligible endpoint below, in ascending priority.
#
# server:
#   host: 127.0.0.1
#   port: 8080
#
# endpoints:
#   - name: anthropic-main
#     url: https://api.anthropic.com
#     endpoint_type: anthropic        # anthropic | openai
#     auth_type: api_key              # api_key | auth_token | oauth
#     auth_value: sk-ant-...
#     priority: 1
#
#   - name: openai-backup
#     url: https://api.openai.com
#     endpoint_type: openai
#     auth_type: auth_token
#     auth_value: sk-...
#     priority: 2
#     tags: [background]
#     model_rewrite:
#       - pattern: "claude-*"
#         replacement: "gpt-4.1-mini"
#
#   - name: anthropic-oauth
#     url: https://api.anthropic.com
#     endpoint_type: anthropic
#     auth_type: oauth
#     priority: 3
#     oauth:
#       access_token: ...
#       refresh_token: ...
#       expires_at_ms: 0
#       auto_refresh: true
#
# tagging:
#   pipeline_timeout_secs: 5
#   taggers:
#     - name: haiku-to-fast
#       type: model                   # path-prefix | model | header | thinking
#       model_pattern: "*haiku*"
#       tag: background
#
# timeouts:
#   tls_handshake_secs: 10
#   response_header_secs: 60
#   idle_connection_secs: 90
#   health_check_timeout_secs: 30
#   check_interval_secs: 30
#   unhealthy_threshold: 1
#
# client_auth:
#   enabled: false
#   required_token: ""
#
# logging:
#   level: info
#   log_request_body: false
#
# auth:
#   enabled: false
#   username: ""
#   password: ""
"#;

/// Write the commented template, refusing to overwrite without `force`.
pub fn init_template(path: &Path, force: bool) -> Result<PathBuf> {
    if path.exists() && !force {
        anyhow::bail!(
            "config already exists at {}; use --force to overwrite",
            path.display()
        );
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("failed to create {:?}", parent))?;
    }
    if path.exists() {
        let backup = config_backup_path(path);
        if let Err(err) = fs::copy(path, &backup) {
            warn!("failed to back up {:?} to {:?}: {}", path, backup, err);
        }
    }
    fs::write(path, CONFIG_YAML_TEMPLATE)
        .with_context(|| format!("failed to write config template to {:?}", path))?;
    Ok(path.to_path_buf())
}

/// Load the config, writing a commented template first when the file does not
/// exist yet.
pub fn load_or_init(path: &Path) -> Result<Config> {
    if !path.exists() {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {:?}", parent))?;
        }
        fs::write(path, CONFIG_YAML_TEMPLATE)
            .with_context(|| format!("failed to write config template to {:?}", path))?;
        info!("wrote config template to {:?}", path);
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        return Ok(cfg);
    }

    let text =
        fs::read_to_string(path).with_context(|| format!("failed to read {:?}", path))?;
    let mut cfg: Config = serde_yaml::from_str(&text)
        .with_context(|| format!("failed to parse {:?} as YAML", path))?;
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

/// `ADMIN_USERNAME` / `ADMIN_PASSWORD` override `auth.*` and force
/// `auth.enabled = true`.
pub fn apply_env_overrides(cfg: &mut Config) {
    let mut forced = false;
    if let Ok(username) = env::var("ADMIN_USERNAME")
        && !username.trim().is_empty()
    {
        cfg.auth.username = username;
        forced = true;
    }
    if let Ok(password) = env::var("ADMIN_PASSWORD")
        && !password.trim().is_empty()
    {
        cfg.auth.password = password;
        forced = true;
    }
    if forced && !cfg.auth.enabled {
        cfg.auth.enabled = true;
        info!("admin auth enabled via ADMIN_USERNAME/ADMIN_PASSWORD");
    }
}

/// Persist the config: the existing file is renamed to `<path>.backup`, then
/// the new content is written atomically (tmp + rename).
pub fn save_config(cfg: &Config, path: &Path) -> Result<()> {
    let dir = path
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."));
    fs::create_dir_all(&dir).with_context(|| format!("failed to create {:?}", dir))?;

    let body = serde_yaml::to_string(cfg).context("failed to serialize config")?;

    if path.exists() {
        let backup = config_backup_path(path);
        if let Err(err) = fs::rename(path, &backup) {
            warn!("failed to move {:?} to {:?}: {}", path, backup, err);
        }
    }

    let tmp = dir.join("config.yaml.tmp");
    fs::write(&tmp, body.as_bytes()).with_context(|| format!("failed to write {:?}", tmp))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("failed to rename {:?} to {:?}", tmp, path))?;
    Ok(())
}

/// Replace the OAuth section of one endpoint. Used by the refresh
/// persistence callback before a refreshed token is handed out.
pub fn update_endpoint_oauth(cfg: &mut Config, name: &str, tokens: &OAuthConfig) -> bool {
    for ep in cfg.endpoints.iter_mut() {
        if ep.name == name {
            ep.oauth = Some(tokens.clone());
            return true;
        }
    }
    false
}
