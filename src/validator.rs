//! Non-streaming response validation, applied after any conversion so the
//! body is always checked against the client-facing Anthropic schema.

use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Ok,
    /// Body does not parse or is not message-shaped. Retryable.
    Malformed(String),
    /// Well-formed but carries nothing usable (no content blocks and zero
    /// output tokens). Retryable.
    SemanticallyEmpty(String),
}

impl Verdict {
    pub fn is_ok(&self) -> bool {
        matches!(self, Verdict::Ok)
    }
}

/// Validate a response body against the Anthropic Messages schema.
pub fn validate_anthropic_body(body: &[u8]) -> Verdict {
    let v: Value = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(err) => return Verdict::Malformed(format!("body is not valid JSON: {err}")),
    };
    let Some(obj) = v.as_object() else {
        return Verdict::Malformed("body is not a JSON object".to_string());
    };
    if obj.contains_key("error") {
        return Verdict::Malformed("body carries an error object".to_string());
    }
    if let Some(kind) = obj.get("type").and_then(|t| t.as_str())
        && kind != "message"
    {
        return Verdict::Malformed(format!("unexpected response type '{kind}'"));
    }
    let Some(content) = obj.get("content").and_then(|c| c.as_array()) else {
        return Verdict::Malformed("missing content array".to_string());
    };
    for block in content {
        if block.get("type").and_then(|t| t.as_str()).is_none() {
            return Verdict::Malformed("content block without a type".to_string());
        }
    }

    let output_tokens = obj
        .get("usage")
        .and_then(|u| u.get("output_tokens"))
        .and_then(|t| t.as_u64())
        .unwrap_or(0);
    let has_substance = content.iter().any(|block| {
        match block.get("type").and_then(|t| t.as_str()) {
            Some("text") => block
                .get("text")
                .and_then(|t| t.as_str())
                .map(|t| !t.is_empty())
                .unwrap_or(false),
            Some(_) => true,
            None => false,
        }
    });
    if !has_substance && output_tokens == 0 {
        return Verdict::SemanticallyEmpty(
            "no content blocks and zero output tokens".to_string(),
        );
    }

    Verdict::Ok
}

/// Shape check for OpenAI Chat Completions bodies. Used by the health
/// prober against native-OpenAI endpoints, where no conversion runs.
pub fn validate_openai_body(body: &[u8]) -> Verdict {
    let v: Value = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(err) => return Verdict::Malformed(format!("body is not valid JSON: {err}")),
    };
    let Some(obj) = v.as_object() else {
        return Verdict::Malformed("body is not a JSON object".to_string());
    };
    if obj.contains_key("error") {
        return Verdict::Malformed("body carries an error object".to_string());
    }
    match obj.get("choices").and_then(|c| c.as_array()) {
        Some(choices) if !choices.is_empty() => Verdict::Ok,
        Some(_) => Verdict::SemanticallyEmpty("empty choices array".to_string()),
        None => Verdict::Malformed("missing choices array".to_string()),
    }
}
