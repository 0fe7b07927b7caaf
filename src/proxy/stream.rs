//! Streaming response forwarding.
//!
//! Native Anthropic upstreams are passed through chunk by chunk; OpenAI
//! upstreams go through the SSE converter. Once bytes have reached the
//! client a mid-stream upstream error is terminal: the client sees a
//! truncated stream, and the endpoint is penalized only because the error
//! was a transport error.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_stream::stream;
use axum::body::Body;
use axum::http::{HeaderValue, Response};
use bytes::Bytes;
use futures_util::StreamExt;
use tracing::warn;

use crate::convert::stream::OpenAiStreamConverter;
use crate::endpoint::{Endpoint, EndpointKind, EndpointRegistry};
use crate::error::ErrorKind;
use crate::logging::{self, RequestLog};
use crate::tagging::TaggedRequest;

use super::{ProxyService, RequestContext, filter_response_headers};

#[derive(Default)]
struct StreamState {
    finished: bool,
    stream_error: bool,
}

/// Settles endpoint health and logs the request when the client stream is
/// dropped: a clean close records success, a transport-interrupted one
/// records failure.
struct StreamFinalize {
    log_dir: PathBuf,
    request_id: String,
    method: String,
    path: String,
    status_code: u16,
    start: Instant,
    endpoint: String,
    tags: Vec<String>,
    attempts: Vec<String>,
    registry: Arc<EndpointRegistry>,
    state: Arc<Mutex<StreamState>>,
}

impl Drop for StreamFinalize {
    fn drop(&mut self) {
        let stream_error = {
            let mut state = match self.state.lock() {
                Ok(s) => s,
                Err(e) => e.into_inner(),
            };
            if state.finished {
                return;
            }
            state.finished = true;
            state.stream_error
        };
        if stream_error {
            self.registry
                .record_failure(&self.endpoint, ErrorKind::StreamInterrupted.as_str());
        } else {
            // Success is recorded at stream close, not at the 2xx header;
            // otherwise a stream that dies mid-flight on every attempt would
            // keep resetting its own failure counter.
            self.registry.record_success(&self.endpoint);
        }
        let entry = RequestLog {
            timestamp_ms: logging::now_unix_ms(),
            request_id: &self.request_id,
            method: &self.method,
            path: &self.path,
            status_code: self.status_code,
            duration_ms: self.start.elapsed().as_millis() as u64,
            endpoint: &self.endpoint,
            tags: self.tags.clone(),
            attempts: self.attempts.clone(),
        };
        logging::log_request(&self.log_dir, &entry);
    }
}

pub(super) fn stream_response(
    proxy: &ProxyService,
    ep: &Arc<Endpoint>,
    tagged: &TaggedRequest,
    ctx: &mut RequestContext,
    resp: reqwest::Response,
    model: &str,
) -> Response<Body> {
    let status = resp.status();
    ctx.attempts
        .push(format!("{}: http {} (stream)", ep.name, status.as_u16()));

    let finalize = StreamFinalize {
        log_dir: proxy.log_dir(),
        request_id: ctx.id.clone(),
        method: tagged.method.to_string(),
        path: tagged.path.clone(),
        status_code: status.as_u16(),
        start: ctx.start,
        endpoint: ep.name.clone(),
        tags: tagged.tags.clone(),
        attempts: ctx.attempts.clone(),
        registry: proxy.registry.clone(),
        state: Arc::new(Mutex::new(StreamState::default())),
    };

    match ep.kind {
        EndpointKind::Anthropic => passthrough_stream(resp, finalize),
        EndpointKind::OpenAi => converted_stream(resp, finalize, model.to_string()),
    }
}

fn passthrough_stream(resp: reqwest::Response, finalize: StreamFinalize) -> Response<Body> {
    let status = resp.status();
    let resp_headers = filter_response_headers(resp.headers());
    let state = finalize.state.clone();

    let body_stream = resp.bytes_stream().map(move |item| {
        let _hold = &finalize;
        match item {
            Ok(chunk) => Ok(chunk),
            Err(err) => {
                if let Ok(mut s) = state.lock() {
                    s.stream_error = true;
                }
                warn!("upstream stream error: {err}");
                Err(err)
            }
        }
    });

    let mut builder = Response::builder().status(status);
    for (name, value) in resp_headers.iter() {
        builder = builder.header(name, value);
    }
    if resp_headers.get("content-type").is_none() {
        builder = builder.header("content-type", HeaderValue::from_static("text/event-stream"));
    }
    builder
        .body(Body::from_stream(body_stream))
        .expect("stream response")
}

fn converted_stream(
    resp: reqwest::Response,
    finalize: StreamFinalize,
    model: String,
) -> Response<Body> {
    let status = resp.status();
    let state = finalize.state.clone();

    let body_stream = stream! {
        let _hold = finalize;
        let mut converter = OpenAiStreamConverter::new(&model);
        let mut upstream = resp.bytes_stream();
        while let Some(item) = upstream.next().await {
            match item {
                Ok(chunk) => {
                    for frame in converter.push_chunk(&chunk) {
                        yield Ok::<Bytes, std::io::Error>(Bytes::from(frame));
                    }
                    if converter.saw_message_stop() {
                        break;
                    }
                }
                Err(err) => {
                    if let Ok(mut s) = state.lock() {
                        s.stream_error = true;
                    }
                    warn!("upstream stream error during conversion: {err}");
                    // 已写出的事件无法撤回，客户端只能看到截断的流。
                    return;
                }
            }
        }
        for frame in converter.finish() {
            yield Ok(Bytes::from(frame));
        }
    };

    Response::builder()
        .status(status)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .body(Body::from_stream(body_stream))
        .expect("stream response")
}
