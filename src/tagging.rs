use std::time::{Duration, Instant};

use anyhow::Result;
use axum::http::{HeaderMap, Method};
use bytes::Bytes;
use tracing::{debug, warn};

use crate::config::{TaggerConfig, TaggerKind, TaggingConfig};
use crate::rewrite::wildcard_matches;

/// A captured inbound request. The body is fully buffered because it may be
/// replayed against several endpoints.
#[derive(Debug, Clone)]
pub struct TaggedRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub tags: Vec<String>,
    /// The model name as the client sent it, before any rewrite.
    pub original_model: Option<String>,
    pub thinking_enabled: bool,
    pub stream: bool,
}

impl TaggedRequest {
    pub fn capture(
        method: Method,
        path: String,
        query: Option<String>,
        headers: HeaderMap,
        body: Bytes,
    ) -> Self {
        let parsed: Option<serde_json::Value> = serde_json::from_slice(&body).ok();
        let original_model = parsed
            .as_ref()
            .and_then(|v| v.get("model"))
            .and_then(|m| m.as_str())
            .map(|s| s.to_string());
        let thinking_enabled = parsed
            .as_ref()
            .and_then(|v| v.get("thinking"))
            .and_then(|t| t.get("type"))
            .and_then(|t| t.as_str())
            .map(|t| t == "enabled")
            .unwrap_or(false);
        let stream = parsed
            .as_ref()
            .and_then(|v| v.get("stream"))
            .and_then(|s| s.as_bool())
            .unwrap_or(false);

        Self {
            method,
            path,
            query,
            headers,
            body,
            tags: Vec::new(),
            original_model,
            thinking_enabled,
            stream,
        }
    }

    pub fn is_count_tokens(&self) -> bool {
        self.path.ends_with("/count_tokens")
    }

    pub fn path_and_query(&self) -> String {
        match &self.query {
            Some(q) => format!("{}?{}", self.path, q),
            None => self.path.clone(),
        }
    }
}

/// A tagger classifies the buffered request and contributes zero or more
/// tags. Errors are logged by the pipeline and contribute nothing.
pub trait Tagger: Send + Sync {
    fn name(&self) -> &str;
    fn evaluate(&self, req: &TaggedRequest) -> Result<Vec<String>>;
}

struct PathPrefixTagger {
    name: String,
    prefix: String,
    tag: String,
}

impl Tagger for PathPrefixTagger {
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&self, req: &TaggedRequest) -> Result<Vec<String>> {
        if req.path.starts_with(&self.prefix) {
            Ok(vec![self.tag.clone()])
        } else {
            Ok(Vec::new())
        }
    }
}

struct ModelTagger {
    name: String,
    pattern: String,
    tag: String,
}

impl Tagger for ModelTagger {
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&self, req: &TaggedRequest) -> Result<Vec<String>> {
        match req.original_model.as_deref() {
            Some(model) if wildcard_matches(&self.pattern, model) => Ok(vec![self.tag.clone()]),
            _ => Ok(Vec::new()),
        }
    }
}

struct HeaderTagger {
    name: String,
    header: String,
    value: Option<String>,
    tag: String,
}

impl Tagger for HeaderTagger {
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&self, req: &TaggedRequest) -> Result<Vec<String>> {
        let Some(got) = req.headers.get(&self.header).and_then(|v| v.to_str().ok()) else {
            return Ok(Vec::new());
        };
        let hit = match &self.value {
            Some(want) => got == want,
            None => true,
        };
        if hit {
            Ok(vec![self.tag.clone()])
        } else {
            Ok(Vec::new())
        }
    }
}

struct ThinkingTagger {
    name: String,
    tag: String,
}

impl Tagger for ThinkingTagger {
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&self, req: &TaggedRequest) -> Result<Vec<String>> {
        if req.thinking_enabled {
            Ok(vec![self.tag.clone()])
        } else {
            Ok(Vec::new())
        }
    }
}

fn build_tagger(cfg: &TaggerConfig) -> Result<Box<dyn Tagger>> {
    match cfg.kind {
        TaggerKind::PathPrefix => {
            let prefix = cfg
                .path_prefix
                .clone()
                .ok_or_else(|| anyhow::anyhow!("tagger '{}' requires path_prefix", cfg.name))?;
            Ok(Box::new(PathPrefixTagger {
                name: cfg.name.clone(),
                prefix,
                tag: cfg.tag.clone(),
            }))
        }
        TaggerKind::Model => {
            let pattern = cfg
                .model_pattern
                .clone()
                .ok_or_else(|| anyhow::anyhow!("tagger '{}' requires model_pattern", cfg.name))?;
            Ok(Box::new(ModelTagger {
                name: cfg.name.clone(),
                pattern,
                tag: cfg.tag.clone(),
            }))
        }
        TaggerKind::Header => {
            let header = cfg
                .header
                .clone()
                .ok_or_else(|| anyhow::anyhow!("tagger '{}' requires header", cfg.name))?;
            Ok(Box::new(HeaderTagger {
                name: cfg.name.clone(),
                header,
                value: cfg.value.clone(),
                tag: cfg.tag.clone(),
            }))
        }
        TaggerKind::Thinking => Ok(Box::new(ThinkingTagger {
            name: cfg.name.clone(),
            tag: cfg.tag.clone(),
        })),
    }
}

/// Ordered taggers under one global deadline. The union of contributed tags
/// becomes the request's tag set; replaying the pipeline on the same bytes
/// yields the same set.
pub struct TaggingPipeline {
    taggers: Vec<Box<dyn Tagger>>,
    timeout: Duration,
}

impl TaggingPipeline {
    pub fn from_config(cfg: &TaggingConfig) -> Self {
        let mut taggers = Vec::new();
        for tc in &cfg.taggers {
            match build_tagger(tc) {
                Ok(t) => taggers.push(t),
                Err(err) => warn!("skipping misconfigured tagger: {err}"),
            }
        }
        Self {
            taggers,
            timeout: Duration::from_secs(cfg.pipeline_timeout_secs.max(1)),
        }
    }

    #[cfg(test)]
    pub fn from_taggers(taggers: Vec<Box<dyn Tagger>>, timeout: Duration) -> Self {
        Self { taggers, timeout }
    }

    pub fn run(&self, req: &mut TaggedRequest) {
        let deadline = Instant::now() + self.timeout;
        for tagger in &self.taggers {
            if Instant::now() >= deadline {
                warn!(
                    "tagging pipeline deadline exceeded; skipping remaining taggers from '{}'",
                    tagger.name()
                );
                break;
            }
            match tagger.evaluate(req) {
                Ok(tags) => {
                    for tag in tags {
                        if !req.tags.contains(&tag) {
                            req.tags.push(tag);
                        }
                    }
                }
                Err(err) => {
                    // 单个 tagger 出错只跳过它自己，不影响整条流水线。
                    warn!("tagger '{}' failed: {err}", tagger.name());
                }
            }
        }
        debug!("request {} tagged as {:?}", req.path, req.tags);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_with_body(body: &str) -> TaggedRequest {
        TaggedRequest::capture(
            Method::POST,
            "/v1/messages".to_string(),
            None,
            HeaderMap::new(),
            Bytes::from(body.to_string()),
        )
    }

    struct FailingTagger;

    impl Tagger for FailingTagger {
        fn name(&self) -> &str {
            "failing"
        }

        fn evaluate(&self, _req: &TaggedRequest) -> Result<Vec<String>> {
            anyhow::bail!("boom")
        }
    }

    fn pipeline(cfgs: Vec<TaggerConfig>) -> TaggingPipeline {
        TaggingPipeline::from_config(&TaggingConfig {
            pipeline_timeout_secs: 5,
            taggers: cfgs,
        })
    }

    fn model_tagger(pattern: &str, tag: &str) -> TaggerConfig {
        TaggerConfig {
            name: format!("model-{tag}"),
            kind: TaggerKind::Model,
            tag: tag.to_string(),
            path_prefix: None,
            model_pattern: Some(pattern.to_string()),
            header: None,
            value: None,
        }
    }

    #[test]
    fn capture_extracts_model_stream_and_thinking() {
        let req = request_with_body(
            r#"{"model":"claude-3-opus","stream":true,"thinking":{"type":"enabled","budget_tokens":1024}}"#,
        );
        assert_eq!(req.original_model.as_deref(), Some("claude-3-opus"));
        assert!(req.stream);
        assert!(req.thinking_enabled);
        assert!(!req.is_count_tokens());
    }

    #[test]
    fn union_of_tags_without_duplicates() {
        let p = pipeline(vec![
            model_tagger("claude-*", "claude"),
            model_tagger("*opus*", "big"),
            model_tagger("claude*", "claude"),
        ]);
        let mut req = request_with_body(r#"{"model":"claude-3-opus"}"#);
        p.run(&mut req);
        assert_eq!(req.tags, vec!["claude".to_string(), "big".to_string()]);
    }

    #[test]
    fn failing_tagger_contributes_nothing() {
        let p = TaggingPipeline::from_taggers(
            vec![
                Box::new(FailingTagger),
                Box::new(ModelTagger {
                    name: "m".to_string(),
                    pattern: "*".to_string(),
                    tag: "any".to_string(),
                }),
            ],
            Duration::from_secs(5),
        );
        let mut req = request_with_body(r#"{"model":"claude-3-haiku"}"#);
        p.run(&mut req);
        assert_eq!(req.tags, vec!["any".to_string()]);
    }

    #[test]
    fn pipeline_is_idempotent_on_same_bytes() {
        let p = pipeline(vec![model_tagger("*haiku*", "fast")]);
        let mut a = request_with_body(r#"{"model":"claude-3-haiku"}"#);
        let mut b = request_with_body(r#"{"model":"claude-3-haiku"}"#);
        p.run(&mut a);
        p.run(&mut b);
        assert_eq!(a.tags, b.tags);
    }

    #[test]
    fn thinking_and_header_taggers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-priority", "high".parse().unwrap());
        let mut req = TaggedRequest::capture(
            Method::POST,
            "/v1/messages".to_string(),
            None,
            headers,
            Bytes::from(r#"{"model":"m","thinking":{"type":"enabled"}}"#),
        );
        let p = pipeline(vec![
            TaggerConfig {
                name: "think".to_string(),
                kind: TaggerKind::Thinking,
                tag: "thinking".to_string(),
                path_prefix: None,
                model_pattern: None,
                header: None,
                value: None,
            },
            TaggerConfig {
                name: "prio".to_string(),
                kind: TaggerKind::Header,
                tag: "prio-high".to_string(),
                path_prefix: None,
                model_pattern: None,
                header: Some("x-priority".to_string()),
                value: Some("high".to_string()),
            },
        ]);
        p.run(&mut req);
        assert_eq!(
            req.tags,
            vec!["thinking".to_string(), "prio-high".to_string()]
        );
    }
}
