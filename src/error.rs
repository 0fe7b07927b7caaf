//! Wire-visible error taxonomy and response envelopes.

use axum::http::StatusCode;
use serde_json::{Value, json};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ClientAuthFailed,
    BadRequestBody,
    NoEligibleEndpoint,
    UpstreamTransport,
    UpstreamStatus,
    UpstreamMalformed,
    OauthRefreshFailed,
    ConversionFailed,
    ValidationFailed,
    StreamInterrupted,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ClientAuthFailed => "client_auth_failed",
            ErrorKind::BadRequestBody => "bad_request_body",
            ErrorKind::NoEligibleEndpoint => "no_eligible_endpoint",
            ErrorKind::UpstreamTransport => "upstream_transport",
            ErrorKind::UpstreamStatus => "upstream_status",
            ErrorKind::UpstreamMalformed => "upstream_malformed",
            ErrorKind::OauthRefreshFailed => "oauth_refresh_failed",
            ErrorKind::ConversionFailed => "conversion_failed",
            ErrorKind::ValidationFailed => "validation_failed",
            ErrorKind::StreamInterrupted => "stream_interrupted",
            ErrorKind::Internal => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ErrorKind::ClientAuthFailed => StatusCode::UNAUTHORIZED,
            ErrorKind::BadRequestBody => StatusCode::BAD_REQUEST,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}

/// Proxy-layer failure envelope: `{error: {type, message}, request_id}`.
pub fn proxy_error_body(kind: ErrorKind, message: &str, request_id: &str) -> Value {
    json!({
        "error": {
            "type": kind.as_str(),
            "message": message,
        },
        "request_id": request_id,
    })
}

/// Inbound auth failure envelope: `{error, code, request_id}`.
pub fn auth_error_body(message: &str, code: &str, request_id: &str) -> Value {
    json!({
        "error": message,
        "code": code,
        "request_id": request_id,
    })
}
