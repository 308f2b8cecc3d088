//! Decoding structured (JSON) replies

use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;

static CODE_FENCE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```(?:json|JSON)?\s*\n?(.*?)```").expect("valid fence regex"));

/// Locate the JSON object in a model reply.
///
/// Models in JSON mode usually return the bare object, but some still wrap
/// it in a code fence or add a sentence around it.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    if trimmed.starts_with('{') && trimmed.ends_with('}') {
        return Some(trimmed);
    }

    if let Some(inner) = CODE_FENCE_RE
        .captures(trimmed)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim())
    {
        if inner.starts_with('{') && inner.ends_with('}') {
            return Some(inner);
        }
    }

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (end > start).then(|| &trimmed[start..=end])
}

/// Decode a reply into `T`, describing what went wrong on failure
pub fn parse_reply<T: DeserializeOwned>(text: &str) -> Result<T, String> {
    let json = extract_json_object(text).ok_or_else(|| {
        format!(
            "no JSON object in reply: {}",
            super::truncate(text.trim(), 200)
        )
    })?;
    serde_json::from_str(json).map_err(|e| format!("reply does not match schema: {}", e))
}
