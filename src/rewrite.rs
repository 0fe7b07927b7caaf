use serde::{Deserialize, Serialize};

/// One rewrite rule. Rules are evaluated in declaration order and the first
/// matching pattern wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewriteRule {
    pub pattern: String,
    pub replacement: String,
}

/// Split a pattern around its single `*`. Patterns holding zero or more
/// than one `*` are not wildcards.
fn wildcard_parts(pattern: &str) -> Option<(&str, &str)> {
    let (prefix, suffix) = pattern.split_once('*')?;
    if suffix.contains('*') {
        return None;
    }
    Some((prefix, suffix))
}

/// The text the pattern's `*` swallowed, when the pattern matches.
fn wildcard_capture<'a>(pattern: &str, input: &'a str) -> Option<&'a str> {
    let (prefix, suffix) = wildcard_parts(pattern)?;
    input.strip_prefix(prefix)?.strip_suffix(suffix)
}

/// Exact match, or a single-`*` wildcard match.
pub fn wildcard_matches(pattern: &str, text: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == text;
    }
    wildcard_capture(pattern, text).is_some()
}

/// Apply the endpoint's rules to a model name. `None` means no rule matched
/// and the original name is preserved.
pub fn rewrite_model(rules: &[RewriteRule], model: &str) -> Option<String> {
    for rule in rules {
        if !wildcard_matches(&rule.pattern, model) {
            continue;
        }
        // A `*` in the replacement receives whatever the pattern's `*`
        // captured; otherwise the replacement is literal.
        let rewritten = match (
            wildcard_capture(&rule.pattern, model),
            rule.replacement.split_once('*'),
        ) {
            (Some(captured), Some((head, tail))) => format!("{head}{captured}{tail}"),
            _ => rule.replacement.clone(),
        };
        return Some(rewritten);
    }
    None
}

/// Replace the `model` field of a JSON request body, returning the rewritten
/// bytes. The caller keeps the original body for logging and fallback.
pub fn apply_model_override(body: &[u8], model: &str) -> Option<Vec<u8>> {
    let mut v: serde_json::Value = serde_json::from_slice(body).ok()?;
    v.as_object_mut()?.insert(
        "model".to_string(),
        serde_json::Value::String(model.to_string()),
    );
    serde_json::to_vec(&v).ok()
}
