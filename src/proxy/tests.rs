use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::Json;
use axum::http::{StatusCode, header};
use axum::routing::post;
use reqwest::Client;

use crate::config::{Config, OAuthConfig, TaggerConfig, TaggerKind};
use crate::endpoint::{AuthKind, Endpoint, EndpointKind, EndpointRegistry};
use crate::oauth::{OAuthManager, PersistFn};
use crate::proxy::{ProxyService, router};
use crate::rewrite::RewriteRule;

fn spawn_axum_server(app: axum::Router) -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("local_addr");
    listener.set_nonblocking(true).expect("nonblocking");
    let listener = tokio::net::TcpListener::from_std(listener).expect("to tokio listener");
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    (addr, handle)
}

fn anthropic_message(text: &str) -> serde_json::Value {
    serde_json::json!({
        "id": "msg_1", "type": "message", "role": "assistant",
        "content": [{"type": "text", "text": text}],
        "model": "claude-3-opus",
        "stop_reason": "end_turn",
        "usage": {"input_tokens": 3, "output_tokens": 2}
    })
}

fn make_endpoint(name: &str, addr: std::net::SocketAddr, priority: u32, tags: &[&str]) -> Endpoint {
    Endpoint {
        name: name.to_string(),
        base_url: format!("http://{addr}"),
        path_prefix: None,
        kind: EndpointKind::Anthropic,
        auth: AuthKind::ApiKey,
        auth_value: Some("sk-test".to_string()),
        oauth: None,
        enabled: true,
        priority,
        tags: tags.iter().map(|t| t.to_string()).collect(),
        model_rewrite: Vec::new(),
    }
}

fn test_config() -> Config {
    let mut cfg = Config::default();
    cfg.logging.log_directory = Some(
        std::env::temp_dir().join(format!("claude-relay-proxy-test-{}", uuid::Uuid::new_v4())),
    );
    cfg
}

fn make_service(endpoints: Vec<Endpoint>, cfg: Config) -> ProxyService {
    let registry = Arc::new(EndpointRegistry::new(
        endpoints,
        cfg.timeouts.unhealthy_threshold,
    ));
    let persist: PersistFn = Arc::new(|_, _| Ok(()));
    let oauth = Arc::new(OAuthManager::new(Client::new(), persist));
    oauth.register_endpoints(&registry.snapshot());
    ProxyService::new(Client::new(), Arc::new(cfg), registry, oauth)
}

fn spawn_proxy(service: ProxyService) -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
    spawn_axum_server(router(service))
}

#[tokio::test]
async fn untagged_request_uses_the_preferred_endpoint_only() {
    let a_hits = Arc::new(AtomicUsize::new(0));
    let b_hits = Arc::new(AtomicUsize::new(0));

    let hits = a_hits.clone();
    let upstream_a = axum::Router::new().route(
        "/v1/messages",
        post(move || {
            let hits = hits.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                Json(anthropic_message("from a"))
            }
        }),
    );
    let (a_addr, a_handle) = spawn_axum_server(upstream_a);

    let hits = b_hits.clone();
    let upstream_b = axum::Router::new().route(
        "/v1/messages",
        post(move || {
            let hits = hits.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                Json(anthropic_message("from b"))
            }
        }),
    );
    let (b_addr, b_handle) = spawn_axum_server(upstream_b);

    let service = make_service(
        vec![
            make_endpoint("a", a_addr, 1, &[]),
            make_endpoint("b", b_addr, 2, &[]),
        ],
        test_config(),
    );
    let (proxy_addr, proxy_handle) = spawn_proxy(service);

    let resp = Client::new()
        .post(format!("http://{proxy_addr}/v1/messages"))
        .header("content-type", "application/json")
        .body(r#"{"model":"claude-3-opus","max_tokens":16,"messages":[{"role":"user","content":"hi"}]}"#)
        .send()
        .await
        .expect("send");

    assert_eq!(resp.status(), StatusCode::OK);
    let body = resp.text().await.expect("text");
    assert!(body.contains("from a"), "got: {body}");
    assert_eq!(a_hits.load(Ordering::SeqCst), 1);
    assert_eq!(b_hits.load(Ordering::SeqCst), 0, "B must stay untouched");

    proxy_handle.abort();
    a_handle.abort();
    b_handle.abort();
}

#[tokio::test]
async fn http_500_falls_back_to_the_next_candidate_and_penalizes() {
    let a_hits = Arc::new(AtomicUsize::new(0));
    let b_hits = Arc::new(AtomicUsize::new(0));

    let hits = a_hits.clone();
    let upstream_a = axum::Router::new().route(
        "/v1/messages",
        post(move || {
            let hits = hits.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(serde_json::json!({"error": "boom"})),
                )
            }
        }),
    );
    let (a_addr, a_handle) = spawn_axum_server(upstream_a);

    let hits = b_hits.clone();
    let upstream_b = axum::Router::new().route(
        "/v1/messages",
        post(move || {
            let hits = hits.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                Json(anthropic_message("from b"))
            }
        }),
    );
    let (b_addr, b_handle) = spawn_axum_server(upstream_b);

    let service = make_service(
        vec![
            make_endpoint("a", a_addr, 1, &[]),
            make_endpoint("b", b_addr, 2, &[]),
        ],
        test_config(),
    );
    let registry = service.registry.clone();
    let (proxy_addr, proxy_handle) = spawn_proxy(service);

    let resp = Client::new()
        .post(format!("http://{proxy_addr}/v1/messages"))
        .header("content-type", "application/json")
        .body(r#"{"model":"claude-3-opus","max_tokens":16,"messages":[{"role":"user","content":"hi"}]}"#)
        .send()
        .await
        .expect("send");

    assert_eq!(resp.status(), StatusCode::OK);
    let body = resp.text().await.expect("text");
    assert!(body.contains("from b"), "got: {body}");
    assert_eq!(a_hits.load(Ordering::SeqCst), 1);
    assert_eq!(b_hits.load(Ordering::SeqCst), 1);
    let a_health = registry.health_of("a").expect("health of a");
    assert_eq!(a_health.consecutive_failures, 1);
    assert!(!a_health.available, "default threshold of 1 flips availability");

    proxy_handle.abort();
    a_handle.abort();
    b_handle.abort();
}

#[tokio::test]
async fn tagged_requests_prefer_tagged_endpoints_and_untagged_skip_them() {
    let tagged_hits = Arc::new(AtomicUsize::new(0));
    let universal_hits = Arc::new(AtomicUsize::new(0));

    let hits = tagged_hits.clone();
    let upstream_tagged = axum::Router::new().route(
        "/v1/messages",
        post(move || {
            let hits = hits.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                Json(anthropic_message("from tagged"))
            }
        }),
    );
    let (t_addr, t_handle) = spawn_axum_server(upstream_tagged);

    let hits = universal_hits.clone();
    let upstream_universal = axum::Router::new().route(
        "/v1/messages",
        post(move || {
            let hits = hits.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                Json(anthropic_message("from universal"))
            }
        }),
    );
    let (u_addr, u_handle) = spawn_axum_server(upstream_universal);

    let mut cfg = test_config();
    cfg.tagging.taggers.push(TaggerConfig {
        name: "haiku".to_string(),
        kind: TaggerKind::Model,
        tag: "fast".to_string(),
        path_prefix: None,
        model_pattern: Some("*haiku*".to_string()),
        header: None,
        value: None,
    });
    let service = make_service(
        vec![
            // The universal endpoint has the better priority, but a tagged
            // request must still prefer the tag match.
            make_endpoint("u", u_addr, 1, &[]),
            make_endpoint("t", t_addr, 2, &["fast"]),
        ],
        cfg,
    );
    let (proxy_addr, proxy_handle) = spawn_proxy(service);

    let client = Client::new();
    let resp = client
        .post(format!("http://{proxy_addr}/v1/messages"))
        .header("content-type", "application/json")
        .body(r#"{"model":"claude-3-haiku","max_tokens":16,"messages":[{"role":"user","content":"hi"}]}"#)
        .send()
        .await
        .expect("send tagged");
    assert!(resp.text().await.unwrap().contains("from tagged"));
    assert_eq!(tagged_hits.load(Ordering::SeqCst), 1);
    assert_eq!(universal_hits.load(Ordering::SeqCst), 0);

    let resp = client
        .post(format!("http://{proxy_addr}/v1/messages"))
        .header("content-type", "application/json")
        .body(r#"{"model":"claude-3-opus","max_tokens":16,"messages":[{"role":"user","content":"hi"}]}"#)
        .send()
        .await
        .expect("send untagged");
    assert!(resp.text().await.unwrap().contains("from universal"));
    assert_eq!(tagged_hits.load(Ordering::SeqCst), 1, "untagged must not reach tagged endpoint");
    assert_eq!(universal_hits.load(Ordering::SeqCst), 1);

    proxy_handle.abort();
    t_handle.abort();
    u_handle.abort();
}

#[tokio::test]
async fn count_tokens_with_only_openai_endpoints_is_no_eligible_endpoint() {
    let hits = Arc::new(AtomicUsize::new(0));
    let hits_srv = hits.clone();
    let upstream = axum::Router::new().route(
        "/v1/chat/completions",
        post(move || {
            let hits = hits_srv.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                Json(serde_json::json!({"choices": []}))
            }
        }),
    );
    let (addr, handle) = spawn_axum_server(upstream);

    let mut ep = make_endpoint("o", addr, 1, &[]);
    ep.kind = EndpointKind::OpenAi;
    ep.auth = AuthKind::AuthToken;
    let service = make_service(vec![ep], test_config());
    let (proxy_addr, proxy_handle) = spawn_proxy(service);

    let resp = Client::new()
        .post(format!("http://{proxy_addr}/v1/messages/count_tokens"))
        .header("content-type", "application/json")
        .body(r#"{"model":"claude-3-opus","messages":[{"role":"user","content":"hi"}]}"#)
        .send()
        .await
        .expect("send");

    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    let body: serde_json::Value = resp.json().await.expect("json");
    assert_eq!(body["error"]["type"], "no_eligible_endpoint");
    assert!(body["request_id"].as_str().unwrap().starts_with("req_"));
    assert_eq!(hits.load(Ordering::SeqCst), 0, "O must never be contacted");

    proxy_handle.abort();
    handle.abort();
}

#[tokio::test]
async fn oauth_refresh_happens_once_and_persists_before_dispatch() {
    let refresh_hits = Arc::new(AtomicUsize::new(0));
    let hits = refresh_hits.clone();
    let token_server = axum::Router::new().route(
        "/token",
        post(move || {
            let hits = hits.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                Json(serde_json::json!({
                    "access_token": "fresh-token",
                    "refresh_token": "refresh-2",
                    "expires_in": 3600
                }))
            }
        }),
    );
    let (token_addr, token_handle) = spawn_axum_server(token_server);

    let seen_auth = Arc::new(std::sync::Mutex::new(String::new()));
    let seen = seen_auth.clone();
    let upstream = axum::Router::new().route(
        "/v1/messages",
        post(move |headers: axum::http::HeaderMap| {
            let seen = seen.clone();
            async move {
                *seen.lock().unwrap() = headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                Json(anthropic_message("ok"))
            }
        }),
    );
    let (up_addr, up_handle) = spawn_axum_server(upstream);

    let mut ep = make_endpoint("x", up_addr, 1, &[]);
    ep.auth = AuthKind::Oauth;
    ep.auth_value = None;
    ep.oauth = Some(OAuthConfig {
        access_token: "stale".to_string(),
        refresh_token: "refresh-1".to_string(),
        expires_at_ms: 1,
        token_url: format!("http://{token_addr}/token"),
        client_id: "client-1".to_string(),
        scopes: Vec::new(),
        auto_refresh: true,
    });

    let persisted = Arc::new(AtomicUsize::new(0));
    let persist_count = persisted.clone();
    let registry = Arc::new(EndpointRegistry::new(vec![ep], 1));
    let persist: PersistFn = Arc::new(move |_, tokens| {
        assert_eq!(tokens.access_token, "fresh-token");
        persist_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    let oauth = Arc::new(OAuthManager::new(Client::new(), persist));
    oauth.register_endpoints(&registry.snapshot());
    let service = ProxyService::new(Client::new(), Arc::new(test_config()), registry, oauth);
    let (proxy_addr, proxy_handle) = spawn_proxy(service);

    let resp = Client::new()
        .post(format!("http://{proxy_addr}/v1/messages"))
        .header("content-type", "application/json")
        .body(r#"{"model":"claude-3-opus","max_tokens":16,"messages":[{"role":"user","content":"hi"}]}"#)
        .send()
        .await
        .expect("send");

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(refresh_hits.load(Ordering::SeqCst), 1, "exactly one refresh call");
    assert_eq!(persisted.load(Ordering::SeqCst), 1, "persist callback invoked once");
    assert_eq!(
        seen_auth.lock().unwrap().as_str(),
        "Bearer fresh-token",
        "outbound request must carry the refreshed token"
    );

    proxy_handle.abort();
    token_handle.abort();
    up_handle.abort();
}

#[tokio::test]
async fn oauth_persist_failure_fails_the_request_without_dispatch() {
    let token_server = axum::Router::new().route(
        "/token",
        post(|| async {
            Json(serde_json::json!({
                "access_token": "fresh-token",
                "expires_in": 3600
            }))
        }),
    );
    let (token_addr, token_handle) = spawn_axum_server(token_server);

    let upstream_hits = Arc::new(AtomicUsize::new(0));
    let hits = upstream_hits.clone();
    let upstream = axum::Router::new().route(
        "/v1/messages",
        post(move || {
            let hits = hits.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                Json(anthropic_message("ok"))
            }
        }),
    );
    let (up_addr, up_handle) = spawn_axum_server(upstream);

    let mut ep = make_endpoint("x", up_addr, 1, &[]);
    ep.auth = AuthKind::Oauth;
    ep.auth_value = None;
    ep.oauth = Some(OAuthConfig {
        access_token: "stale".to_string(),
        refresh_token: "refresh-1".to_string(),
        expires_at_ms: 1,
        token_url: format!("http://{token_addr}/token"),
        client_id: "client-1".to_string(),
        scopes: Vec::new(),
        auto_refresh: true,
    });

    let registry = Arc::new(EndpointRegistry::new(vec![ep], 1));
    let persist: PersistFn = Arc::new(|_, _| anyhow::bail!("disk full"));
    let oauth = Arc::new(OAuthManager::new(Client::new(), persist));
    oauth.register_endpoints(&registry.snapshot());
    let registry_view = registry.clone();
    let service = ProxyService::new(Client::new(), Arc::new(test_config()), registry, oauth);
    let (proxy_addr, proxy_handle) = spawn_proxy(service);

    let resp = Client::new()
        .post(format!("http://{proxy_addr}/v1/messages"))
        .header("content-type", "application/json")
        .body(r#"{"model":"claude-3-opus","max_tokens":16,"messages":[{"role":"user","content":"hi"}]}"#)
        .send()
        .await
        .expect("send");

    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    let body: serde_json::Value = resp.json().await.expect("json");
    assert_eq!(body["error"]["type"], "oauth_refresh_failed");
    assert_eq!(upstream_hits.load(Ordering::SeqCst), 0, "no dispatch after failed persist");
    // The failure is an oauth problem, not an endpoint health problem.
    assert!(registry_view.is_available("x"));

    proxy_handle.abort();
    token_handle.abort();
    up_handle.abort();
}

#[tokio::test]
async fn openai_response_is_converted_to_an_anthropic_message() {
    let seen_model = Arc::new(std::sync::Mutex::new(String::new()));
    let seen = seen_model.clone();
    let upstream = axum::Router::new().route(
        "/v1/chat/completions",
        post(move |Json(body): Json<serde_json::Value>| {
            let seen = seen.clone();
            async move {
                *seen.lock().unwrap() = body["model"].as_str().unwrap_or_default().to_string();
                Json(serde_json::json!({
                    "id": "chatcmpl_1",
                    "model": "gpt-4.1-mini",
                    "choices": [{
                        "finish_reason": "stop",
                        "message": {"role": "assistant", "content": "converted hello"}
                    }],
                    "usage": {"prompt_tokens": 9, "completion_tokens": 4}
                }))
            }
        }),
    );
    let (addr, handle) = spawn_axum_server(upstream);

    let mut ep = make_endpoint("o", addr, 1, &[]);
    ep.kind = EndpointKind::OpenAi;
    ep.auth = AuthKind::AuthToken;
    ep.model_rewrite = vec![RewriteRule {
        pattern: "claude-*".to_string(),
        replacement: "gpt-4.1-mini".to_string(),
    }];
    let service = make_service(vec![ep], test_config());
    let (proxy_addr, proxy_handle) = spawn_proxy(service);

    let resp = Client::new()
        .post(format!("http://{proxy_addr}/v1/messages"))
        .header("content-type", "application/json")
        .body(r#"{"model":"claude-3-opus","max_tokens":16,"messages":[{"role":"user","content":"hi"}]}"#)
        .send()
        .await
        .expect("send");

    assert_eq!(resp.status(), StatusCode::OK);
    let body: serde_json::Value = resp.json().await.expect("json");
    assert_eq!(body["type"], "message");
    assert_eq!(body["role"], "assistant");
    assert_eq!(body["content"][0]["text"], "converted hello");
    assert_eq!(body["stop_reason"], "end_turn");
    assert_eq!(body["usage"]["input_tokens"], 9);
    assert_eq!(body["usage"]["output_tokens"], 4);
    // The rewrite applies to the outbound copy only.
    assert_eq!(seen_model.lock().unwrap().as_str(), "gpt-4.1-mini");

    proxy_handle.abort();
    handle.abort();
}

#[tokio::test]
async fn openai_stream_is_converted_to_the_anthropic_event_sequence() {
    let sse_body = concat!(
        "data: {\"id\":\"chatcmpl_s\",\"choices\":[{\"delta\":{\"content\":\"Hel\"},\"finish_reason\":null}]}\n\n",
        "data: {\"id\":\"chatcmpl_s\",\"choices\":[{\"delta\":{\"content\":\"lo\"},\"finish_reason\":null}]}\n\n",
        "data: {\"id\":\"chatcmpl_s\",\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
        "data: [DONE]\n\n",
    );
    let upstream = axum::Router::new().route(
        "/v1/chat/completions",
        post(move || async move {
            ([(header::CONTENT_TYPE, "text/event-stream")], sse_body)
        }),
    );
    let (addr, handle) = spawn_axum_server(upstream);

    let mut ep = make_endpoint("o", addr, 1, &[]);
    ep.kind = EndpointKind::OpenAi;
    ep.auth = AuthKind::AuthToken;
    let service = make_service(vec![ep], test_config());
    let (proxy_addr, proxy_handle) = spawn_proxy(service);

    let resp = Client::new()
        .post(format!("http://{proxy_addr}/v1/messages"))
        .header("content-type", "application/json")
        .body(r#"{"model":"claude-3-opus","max_tokens":16,"stream":true,"messages":[{"role":"user","content":"hi"}]}"#)
        .send()
        .await
        .expect("send");

    assert_eq!(resp.status(), StatusCode::OK);
    assert!(
        resp.headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .starts_with("text/event-stream")
    );
    let text = resp.text().await.expect("stream body");

    let events: Vec<&str> = text
        .lines()
        .filter_map(|l| l.strip_prefix("event: "))
        .collect();
    assert_eq!(
        events,
        vec![
            "message_start",
            "content_block_start",
            "content_block_delta",
            "content_block_delta",
            "content_block_stop",
            "message_delta",
            "message_stop",
        ]
    );
    let deltas: String = text
        .lines()
        .filter_map(|l| l.strip_prefix("data: "))
        .filter_map(|d| serde_json::from_str::<serde_json::Value>(d).ok())
        .filter(|v| v["type"] == "content_block_delta")
        .filter_map(|v| v["delta"]["text"].as_str().map(|s| s.to_string()))
        .collect();
    assert_eq!(deltas, "Hello");
    assert!(text.contains(r#""stop_reason":"end_turn""#), "got: {text}");

    proxy_handle.abort();
    handle.abort();
}

#[tokio::test]
async fn malformed_2xx_body_triggers_fallback() {
    let upstream_a = axum::Router::new().route(
        "/v1/messages",
        post(|| async { "this is not json" }),
    );
    let (a_addr, a_handle) = spawn_axum_server(upstream_a);

    let upstream_b = axum::Router::new().route(
        "/v1/messages",
        post(|| async { Json(anthropic_message("rescued")) }),
    );
    let (b_addr, b_handle) = spawn_axum_server(upstream_b);

    let service = make_service(
        vec![
            make_endpoint("a", a_addr, 1, &[]),
            make_endpoint("b", b_addr, 2, &[]),
        ],
        test_config(),
    );
    let (proxy_addr, proxy_handle) = spawn_proxy(service);

    let resp = Client::new()
        .post(format!("http://{proxy_addr}/v1/messages"))
        .header("content-type", "application/json")
        .body(r#"{"model":"claude-3-opus","max_tokens":16,"messages":[{"role":"user","content":"hi"}]}"#)
        .send()
        .await
        .expect("send");

    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.text().await.unwrap().contains("rescued"));

    proxy_handle.abort();
    a_handle.abort();
    b_handle.abort();
}

#[tokio::test]
async fn exhausted_candidates_report_every_attempt_once() {
    let a_hits = Arc::new(AtomicUsize::new(0));
    let b_hits = Arc::new(AtomicUsize::new(0));

    let hits = a_hits.clone();
    let upstream_a = axum::Router::new().route(
        "/v1/messages",
        post(move || {
            let hits = hits.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                (StatusCode::BAD_GATEWAY, Json(serde_json::json!({"error": "a down"})))
            }
        }),
    );
    let (a_addr, a_handle) = spawn_axum_server(upstream_a);

    let hits = b_hits.clone();
    let upstream_b = axum::Router::new().route(
        "/v1/messages",
        post(move || {
            let hits = hits.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                (StatusCode::SERVICE_UNAVAILABLE, Json(serde_json::json!({"error": "b down"})))
            }
        }),
    );
    let (b_addr, b_handle) = spawn_axum_server(upstream_b);

    let service = make_service(
        vec![
            make_endpoint("a", a_addr, 1, &[]),
            make_endpoint("b", b_addr, 2, &[]),
        ],
        test_config(),
    );
    let (proxy_addr, proxy_handle) = spawn_proxy(service);

    let resp = Client::new()
        .post(format!("http://{proxy_addr}/v1/messages"))
        .header("content-type", "application/json")
        .body(r#"{"model":"claude-3-opus","max_tokens":16,"messages":[{"role":"user","content":"hi"}]}"#)
        .send()
        .await
        .expect("send");

    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    let body: serde_json::Value = resp.json().await.expect("json");
    assert_eq!(body["error"]["type"], "upstream_status");
    let message = body["error"]["message"].as_str().unwrap();
    assert!(message.contains("a: http 502"), "got: {message}");
    assert!(message.contains("b: http 503"), "got: {message}");
    // No endpoint is attempted twice for one request.
    assert_eq!(a_hits.load(Ordering::SeqCst), 1);
    assert_eq!(b_hits.load(Ordering::SeqCst), 1);

    proxy_handle.abort();
    a_handle.abort();
    b_handle.abort();
}

#[tokio::test]
async fn client_auth_rejects_bad_tokens_in_the_flat_envelope() {
    let upstream = axum::Router::new().route(
        "/v1/messages",
        post(|| async { Json(anthropic_message("ok")) }),
    );
    let (addr, handle) = spawn_axum_server(upstream);

    let mut cfg = test_config();
    cfg.client_auth.enabled = true;
    cfg.client_auth.required_token = "proxy-secret".to_string();
    let service = make_service(vec![make_endpoint("a", addr, 1, &[])], cfg);
    let (proxy_addr, proxy_handle) = spawn_proxy(service);

    let client = Client::new();
    let url = format!("http://{proxy_addr}/v1/messages");
    let body = r#"{"model":"claude-3-opus","max_tokens":16,"messages":[{"role":"user","content":"hi"}]}"#;

    let resp = client.post(&url).body(body).send().await.expect("send");
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let v: serde_json::Value = resp.json().await.expect("json");
    assert_eq!(v["code"], "client_auth_required");
    assert!(v["error"].as_str().unwrap().contains("missing Authorization"));
    assert!(v["request_id"].as_str().unwrap().starts_with("req_"));

    let resp = client
        .post(&url)
        .header("authorization", "Bearer wrong")
        .body(body)
        .send()
        .await
        .expect("send");
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = client
        .post(&url)
        .header("authorization", "Bearer proxy-secret")
        .body(body)
        .send()
        .await
        .expect("send");
    assert_eq!(resp.status(), StatusCode::OK);

    proxy_handle.abort();
    handle.abort();
}

#[tokio::test]
async fn no_endpoints_at_all_yields_the_selection_diagnostic() {
    let service = make_service(Vec::new(), test_config());
    let (proxy_addr, proxy_handle) = spawn_proxy(service);

    let resp = Client::new()
        .post(format!("http://{proxy_addr}/v1/messages"))
        .body(r#"{"model":"m","max_tokens":1,"messages":[]}"#)
        .send()
        .await
        .expect("send");

    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    let v: serde_json::Value = resp.json().await.expect("json");
    assert_eq!(v["error"]["type"], "no_eligible_endpoint");
    let message = v["error"]["message"].as_str().unwrap();
    assert!(
        message.contains("0 active of 0 (universal) endpoints"),
        "got: {message}"
    );

    proxy_handle.abort();
}
