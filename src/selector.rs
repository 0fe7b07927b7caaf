use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::endpoint::Endpoint;

/// Why selection produced an empty candidate list. Carries the counts the
/// user-facing diagnostic is built from.
#[derive(Debug, Clone)]
pub struct SelectionError {
    pub tags: Vec<String>,
    pub tagged_available: usize,
    pub tagged_total: usize,
    pub universal_available: usize,
    pub universal_total: usize,
    /// True when the request is untagged but every enabled endpoint carries
    /// tags, which usually means the tagging setup is wrong.
    pub all_endpoints_tagged: bool,
}

impl fmt::Display for SelectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.tags.is_empty() {
            write!(
                f,
                "without tag had failed on {} active of {} (universal) endpoints",
                self.universal_available, self.universal_total
            )?;
            if self.all_endpoints_tagged && self.universal_total == 0 {
                write!(
                    f,
                    ". All endpoints are tagged but request is not tagged, make sure you understand how tags works"
                )?;
            }
            Ok(())
        } else {
            write!(
                f,
                "with tag ({}) had failed on {} active out of {} (with tags) and {} active of {} (universal) endpoints",
                self.tags.join(", "),
                self.tagged_available,
                self.tagged_total,
                self.universal_available,
                self.universal_total
            )
        }
    }
}

impl std::error::Error for SelectionError {}

fn matches_tags(ep: &Endpoint, tags: &[String]) -> bool {
    if tags.is_empty() {
        return ep.tags.is_empty();
    }
    tags.iter().all(|t| ep.tags.contains(t))
}

/// Build the ordered candidate list for a request.
///
/// An endpoint is eligible iff it is enabled, available, and the request's
/// tag set is a subset of its tags (an untagged request only matches
/// universal endpoints). The snapshot is already ordered by (priority,
/// name); tagged matches come first, then — for tagged requests only —
/// universal endpoints as a non-preferred fallback suffix.
pub fn select_candidates(
    snapshot: &[Arc<Endpoint>],
    availability: &HashMap<String, bool>,
    tags: &[String],
) -> Result<Vec<Arc<Endpoint>>, SelectionError> {
    let available = |ep: &Endpoint| availability.get(&ep.name).copied().unwrap_or(false);

    let mut candidates: Vec<Arc<Endpoint>> = Vec::new();
    if tags.is_empty() {
        for ep in snapshot {
            if ep.enabled && ep.is_universal() && available(ep) {
                candidates.push(ep.clone());
            }
        }
    } else {
        for ep in snapshot {
            if ep.enabled && !ep.is_universal() && matches_tags(ep, tags) && available(ep) {
                candidates.push(ep.clone());
            }
        }
        // Tagged preference is strict but not fatal: universal endpoints are
        // appended after every tagged match.
        for ep in snapshot {
            if ep.enabled && ep.is_universal() && available(ep) {
                candidates.push(ep.clone());
            }
        }
    }

    if !candidates.is_empty() {
        return Ok(candidates);
    }

    // 构造诊断信息：统计只看 enabled 的端点。
    let mut err = SelectionError {
        tags: tags.to_vec(),
        tagged_available: 0,
        tagged_total: 0,
        universal_available: 0,
        universal_total: 0,
        all_endpoints_tagged: true,
    };
    for ep in snapshot {
        if !ep.enabled {
            continue;
        }
        if ep.is_universal() {
            err.all_endpoints_tagged = false;
            err.universal_total += 1;
            if available(ep) {
                err.universal_available += 1;
            }
        } else if !tags.is_empty() && matches_tags(ep, tags) {
            err.tagged_total += 1;
            if available(ep) {
                err.tagged_available += 1;
            }
        }
    }
    Err(err)
}
