//! The request path: inbound auth, body capture, tagging, endpoint
//! selection, and the attempt loop with transparent fallback.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{HeaderMap, HeaderValue, Request, Response, StatusCode};
use axum::routing::any;
use bytes::Bytes;
use reqwest::Client;
use subtle::ConstantTimeEq;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

mod stream;
#[cfg(test)]
mod tests;

use crate::config::{ClientAuthConfig, Config};
use crate::convert::{self, ANTHROPIC_VERSION, CHAT_COMPLETIONS_PATH};
use crate::endpoint::{AuthKind, Endpoint, EndpointKind, EndpointRegistry};
use crate::error::{ErrorKind, auth_error_body, proxy_error_body};
use crate::logging::{self, RequestLog};
use crate::oauth::OAuthManager;
use crate::rewrite::{apply_model_override, rewrite_model};
use crate::selector;
use crate::tagging::{TaggedRequest, TaggingPipeline};
use crate::validator::{Verdict, validate_anthropic_body};

const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

#[derive(Clone)]
pub struct ProxyService {
    pub client: Client,
    pub config: Arc<Config>,
    pub registry: Arc<EndpointRegistry>,
    pub oauth: Arc<OAuthManager>,
    tagging: Arc<TaggingPipeline>,
}

impl ProxyService {
    pub fn new(
        client: Client,
        config: Arc<Config>,
        registry: Arc<EndpointRegistry>,
        oauth: Arc<OAuthManager>,
    ) -> Self {
        let tagging = Arc::new(TaggingPipeline::from_config(&config.tagging));
        Self {
            client,
            config,
            registry,
            oauth,
            tagging,
        }
    }

    fn log_dir(&self) -> PathBuf {
        self.config
            .logging
            .log_directory
            .clone()
            .unwrap_or_else(logging::default_log_dir)
    }
}

/// Per-request state: stable id, start time, ordered attempt history.
struct RequestContext {
    id: String,
    start: Instant,
    attempts: Vec<String>,
}

impl RequestContext {
    fn new() -> Self {
        Self {
            id: format!("req_{}", Uuid::new_v4().simple()),
            start: Instant::now(),
            attempts: Vec::new(),
        }
    }

    fn chain(&self) -> String {
        self.attempts.join("; ")
    }
}

/// One failed attempt against one endpoint.
struct AttemptFailure {
    kind: ErrorKind,
    message: String,
    /// Whether the failure counts against the endpoint's health.
    penalize: bool,
    status: StatusCode,
}

impl AttemptFailure {
    fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            penalize: true,
            status: StatusCode::BAD_GATEWAY,
        }
    }

    fn no_penalty(mut self) -> Self {
        self.penalize = false;
        self
    }

    fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }
}

fn check_client_auth(cfg: &ClientAuthConfig, headers: &HeaderMap) -> Result<(), String> {
    if !cfg.enabled {
        return Ok(());
    }
    if cfg.required_token.is_empty() {
        return Err(
            "server configuration error: client authentication is enabled but no token is configured"
                .to_string(),
        );
    }
    let Some(header) = headers.get("authorization").and_then(|v| v.to_str().ok()) else {
        return Err("missing Authorization header".to_string());
    };
    let Some(token) = header.strip_prefix("Bearer ") else {
        return Err("invalid Authorization header format, expected: Bearer <token>".to_string());
    };
    if token.is_empty() {
        return Err("empty token in Authorization header".to_string());
    }
    // 常量时间比较，避免时序侧信道。
    if !bool::from(token.as_bytes().ct_eq(cfg.required_token.as_bytes())) {
        return Err("invalid authentication token".to_string());
    }
    Ok(())
}

fn is_hop_by_hop_header(name_lower: &str) -> bool {
    matches!(
        name_lower,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Copy client headers for the upstream, dropping host/content-length,
/// hop-by-hop headers, and the client's own credentials (outbound auth
/// always comes from the endpoint configuration).
fn filter_request_headers(src: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in src.iter() {
        let name_lower = name.as_str().to_ascii_lowercase();
        if name_lower == "host"
            || name_lower == "content-length"
            || name_lower == "authorization"
            || name_lower == "x-api-key"
            || is_hop_by_hop_header(&name_lower)
        {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

fn filter_response_headers(src: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in src.iter() {
        let name_lower = name.as_str().to_ascii_lowercase();
        // reqwest 可能已自动解压响应体；content-length/content-encoding 不再可信。
        if is_hop_by_hop_header(&name_lower)
            || name_lower == "content-length"
            || name_lower == "content-encoding"
        {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("static response")
}

/// Resolve the outbound auth headers for one dispatch. OAuth tokens are
/// fetched from the manager immediately before the request goes out.
async fn apply_endpoint_auth(
    proxy: &ProxyService,
    ep: &Endpoint,
    headers: &mut HeaderMap,
    client_headers: &HeaderMap,
) -> Result<(), AttemptFailure> {
    match ep.auth {
        AuthKind::ApiKey => {
            let key = ep.auth_value.clone().unwrap_or_default();
            if let Ok(v) = HeaderValue::from_str(&key) {
                headers.insert("x-api-key", v);
            }
            // anthropic-version is forwarded from the client when present.
            if headers.get("anthropic-version").is_none() {
                let version = client_headers
                    .get("anthropic-version")
                    .cloned()
                    .unwrap_or_else(|| HeaderValue::from_static(ANTHROPIC_VERSION));
                headers.insert("anthropic-version", version);
            }
        }
        AuthKind::AuthToken => {
            let token = ep.auth_value.clone().unwrap_or_default();
            if let Ok(v) = HeaderValue::from_str(&format!("Bearer {token}")) {
                headers.insert("authorization", v);
            }
        }
        AuthKind::Oauth => {
            let token = proxy.oauth.access_token(&ep.name).await.map_err(|err| {
                AttemptFailure::new(ErrorKind::OauthRefreshFailed, err.to_string()).no_penalty()
            })?;
            if let Ok(v) = HeaderValue::from_str(&format!("Bearer {token}")) {
                headers.insert("authorization", v);
            }
            if headers.get("anthropic-version").is_none() {
                headers.insert(
                    "anthropic-version",
                    HeaderValue::from_static(ANTHROPIC_VERSION),
                );
            }
        }
    }
    Ok(())
}

#[instrument(skip_all)]
pub async fn handle_proxy(proxy: ProxyService, req: Request<Body>) -> Response<Body> {
    let ctx = RequestContext::new();
    let (parts, body) = req.into_parts();

    if let Err(msg) = check_client_auth(&proxy.config.client_auth, &parts.headers) {
        debug!("client auth rejected: {msg}");
        return json_response(
            ErrorKind::ClientAuthFailed.status(),
            auth_error_body(&msg, "client_auth_required", &ctx.id),
        );
    }

    let raw_body = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(err) => {
            return json_response(
                StatusCode::BAD_REQUEST,
                proxy_error_body(
                    ErrorKind::BadRequestBody,
                    &format!("failed to read request body: {err}"),
                    &ctx.id,
                ),
            );
        }
    };

    let mut tagged = TaggedRequest::capture(
        parts.method.clone(),
        parts.uri.path().to_string(),
        parts.uri.query().map(|q| q.to_string()),
        parts.headers.clone(),
        raw_body,
    );
    proxy.tagging.run(&mut tagged);

    run_attempts(proxy, tagged, ctx).await
}

async fn run_attempts(
    proxy: ProxyService,
    tagged: TaggedRequest,
    mut ctx: RequestContext,
) -> Response<Body> {
    let snapshot = proxy.registry.snapshot();
    let availability = proxy.registry.availability_view();
    let candidates = match selector::select_candidates(&snapshot, &availability, &tagged.tags) {
        Ok(candidates) => candidates,
        Err(diag) => {
            let message = format!("request {} {}", ctx.id, diag);
            warn!("no eligible endpoint: {message}");
            finish_log(&proxy, &ctx, &tagged, StatusCode::BAD_GATEWAY.as_u16(), "-");
            return json_response(
                StatusCode::BAD_GATEWAY,
                proxy_error_body(ErrorKind::NoEligibleEndpoint, &message, &ctx.id),
            );
        }
    };

    let mut attempted_any = false;
    let mut last_failure: Option<AttemptFailure> = None;

    // At most one full pass over the candidate list; no endpoint is tried
    // twice for the same request.
    for ep in candidates.iter() {
        if tagged.is_count_tokens() && ep.kind == EndpointKind::OpenAi {
            // OpenAI has no count_tokens; skip without touching the
            // endpoint's health.
            ctx.attempts
                .push(format!("{}: skipped count_tokens on openai endpoint", ep.name));
            continue;
        }
        attempted_any = true;

        match try_endpoint(&proxy, ep, &tagged, &mut ctx).await {
            Ok(resp) => return resp,
            Err(failure) => {
                if failure.penalize {
                    proxy.registry.record_failure(&ep.name, &failure.message);
                }
                info!(
                    "attempt {} against '{}' failed ({}): {}; trying next candidate",
                    ctx.attempts.len() + 1,
                    ep.name,
                    failure.kind.as_str(),
                    failure.message
                );
                ctx.attempts.push(format!("{}: {}", ep.name, failure.message));
                last_failure = Some(failure);
            }
        }
    }

    let (kind, status, detail) = match (&last_failure, attempted_any) {
        (Some(failure), _) => (failure.kind, failure.status, failure.message.clone()),
        (None, false) => (
            ErrorKind::NoEligibleEndpoint,
            StatusCode::BAD_GATEWAY,
            "no eligible endpoint supports this request".to_string(),
        ),
        (None, true) => (
            ErrorKind::Internal,
            StatusCode::INTERNAL_SERVER_ERROR,
            "attempt loop ended without an outcome".to_string(),
        ),
    };
    let message = if ctx.attempts.is_empty() {
        format!("request {}: {detail}", ctx.id)
    } else {
        format!("request {}: {detail}; attempts: {}", ctx.id, ctx.chain())
    };
    warn!("request failed on every candidate: {message}");
    finish_log(&proxy, &ctx, &tagged, status.as_u16(), "-");
    json_response(status, proxy_error_body(kind, &message, &ctx.id))
}

async fn try_endpoint(
    proxy: &ProxyService,
    ep: &Arc<Endpoint>,
    tagged: &TaggedRequest,
    ctx: &mut RequestContext,
) -> Result<Response<Body>, AttemptFailure> {
    // Rewrite mutates only the outbound copy; the captured request keeps the
    // original model for logging and for the next candidate.
    let mut body = tagged.body.clone();
    let mut effective_model = tagged.original_model.clone();
    if let Some(original) = &tagged.original_model
        && let Some(rewritten) = rewrite_model(&ep.model_rewrite, original)
        && rewritten != *original
    {
        if let Some(new_body) = apply_model_override(&body, &rewritten) {
            body = Bytes::from(new_body);
        }
        debug!("endpoint '{}' rewrote model {} -> {}", ep.name, original, rewritten);
        effective_model = Some(rewritten);
    }

    let cross_format = ep.kind == EndpointKind::OpenAi;
    let (url, outbound_body) = if cross_format {
        let parsed = convert::parse_messages_request(&body).map_err(|err| {
            AttemptFailure::new(ErrorKind::ConversionFailed, format!("request conversion: {err}"))
        })?;
        let openai = convert::anthropic_request_to_openai(&parsed).map_err(|err| {
            AttemptFailure::new(ErrorKind::ConversionFailed, format!("request conversion: {err}"))
        })?;
        let bytes = serde_json::to_vec(&openai).map_err(|err| {
            AttemptFailure::new(ErrorKind::ConversionFailed, format!("request conversion: {err}"))
        })?;
        (ep.target_url(CHAT_COMPLETIONS_PATH), Bytes::from(bytes))
    } else {
        (ep.target_url(&tagged.path_and_query()), body)
    };

    let response_header_timeout = proxy.config.timeouts.response_header();
    let mut forced_refresh = false;

    loop {
        let mut headers = filter_request_headers(&tagged.headers);
        if cross_format {
            headers.remove("anthropic-version");
            headers.remove("anthropic-beta");
        }
        apply_endpoint_auth(proxy, ep, &mut headers, &tagged.headers).await?;

        let send = proxy
            .client
            .request(tagged.method.clone(), url.as_str())
            .headers(headers)
            .body(outbound_body.clone())
            .send();
        let resp = match tokio::time::timeout(response_header_timeout, send).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(err)) => {
                return Err(AttemptFailure::new(
                    ErrorKind::UpstreamTransport,
                    format!("transport error: {err}"),
                ));
            }
            Err(_) => {
                return Err(AttemptFailure::new(
                    ErrorKind::UpstreamTransport,
                    format!(
                        "no response headers within {}s",
                        response_header_timeout.as_secs()
                    ),
                )
                .with_status(StatusCode::GATEWAY_TIMEOUT));
            }
        };

        let status = resp.status();
        if !status.is_success() {
            // 401/403 on an OAuth endpoint: force one refresh and retry the
            // same endpoint before the failure counts.
            if matches!(status.as_u16(), 401 | 403)
                && ep.auth == AuthKind::Oauth
                && !forced_refresh
            {
                forced_refresh = true;
                match proxy.oauth.force_refresh(&ep.name).await {
                    Ok(_) => {
                        info!(
                            "endpoint '{}' returned {}; retrying with refreshed oauth token",
                            ep.name, status
                        );
                        continue;
                    }
                    Err(err) => {
                        return Err(AttemptFailure::new(
                            ErrorKind::OauthRefreshFailed,
                            err.to_string(),
                        )
                        .no_penalty());
                    }
                }
            }
            return Err(AttemptFailure::new(
                ErrorKind::UpstreamStatus,
                format!("http {}", status.as_u16()),
            ));
        }

        let is_event_stream = resp
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.starts_with("text/event-stream"))
            .unwrap_or(false);
        if is_event_stream || (tagged.stream && !tagged.is_count_tokens()) {
            // Forwarding begins here; success or failure is recorded when
            // the stream closes.
            let model = effective_model.as_deref().unwrap_or("unknown");
            return Ok(stream::stream_response(proxy, ep, tagged, ctx, resp, model));
        }

        let resp_headers = resp.headers().clone();
        let bytes = match resp.bytes().await {
            Ok(b) => b,
            Err(err) => {
                return Err(AttemptFailure::new(
                    ErrorKind::UpstreamTransport,
                    format!("failed to read upstream body: {err}"),
                ));
            }
        };

        let (client_body, response_headers) = if cross_format {
            let v: serde_json::Value = serde_json::from_slice(&bytes).map_err(|err| {
                AttemptFailure::new(
                    ErrorKind::UpstreamMalformed,
                    format!("upstream body is not JSON: {err}"),
                )
            })?;
            let fallback = effective_model.as_deref().unwrap_or("unknown");
            let converted = convert::openai_response_to_anthropic(&v, fallback).map_err(|err| {
                AttemptFailure::new(
                    ErrorKind::UpstreamMalformed,
                    format!("response conversion: {err}"),
                )
            })?;
            let body = serde_json::to_vec(&converted).map_err(|err| {
                AttemptFailure::new(ErrorKind::ConversionFailed, err.to_string())
            })?;
            let mut headers = HeaderMap::new();
            headers.insert("content-type", HeaderValue::from_static("application/json"));
            (Bytes::from(body), headers)
        } else {
            (bytes, filter_response_headers(&resp_headers))
        };

        // count_tokens responses are not message-shaped; a parseable JSON
        // body is all that is required of them.
        let verdict = if tagged.is_count_tokens() {
            match serde_json::from_slice::<serde_json::Value>(&client_body) {
                Ok(_) => Verdict::Ok,
                Err(err) => Verdict::Malformed(format!("body is not valid JSON: {err}")),
            }
        } else {
            validate_anthropic_body(&client_body)
        };
        match verdict {
            Verdict::Ok => {}
            Verdict::Malformed(msg) => {
                return Err(AttemptFailure::new(ErrorKind::UpstreamMalformed, msg));
            }
            Verdict::SemanticallyEmpty(msg) => {
                return Err(AttemptFailure::new(ErrorKind::ValidationFailed, msg));
            }
        }

        proxy.registry.record_success(&ep.name);
        ctx.attempts.push(format!("{}: http {}", ep.name, status.as_u16()));
        finish_log(proxy, ctx, tagged, status.as_u16(), &ep.name);

        let mut builder = Response::builder().status(status);
        for (name, value) in response_headers.iter() {
            builder = builder.header(name, value);
        }
        return Ok(builder
            .body(Body::from(client_body))
            .unwrap_or_else(|_| json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                proxy_error_body(ErrorKind::Internal, "failed to build response", &ctx.id),
            )));
    }
}

fn finish_log(
    proxy: &ProxyService,
    ctx: &RequestContext,
    tagged: &TaggedRequest,
    status_code: u16,
    endpoint: &str,
) {
    let entry = RequestLog {
        timestamp_ms: logging::now_unix_ms(),
        request_id: &ctx.id,
        method: tagged.method.as_str(),
        path: &tagged.path,
        status_code,
        duration_ms: ctx.start.elapsed().as_millis() as u64,
        endpoint,
        tags: tagged.tags.clone(),
        attempts: ctx.attempts.clone(),
    };
    logging::log_request(&proxy.log_dir(), &entry);
}

pub fn router(proxy: ProxyService) -> Router {
    // axum 0.8 wildcard syntax; every /v1 subpath is accepted.
    Router::new().route(
        "/v1/{*path}",
        any(move |req| handle_proxy(proxy.clone(), req)),
    )
}
