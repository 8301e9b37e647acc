//! JSON recovery from model output.
//!
//! Models asked for "JSON only" still wrap their answer in markdown fences
//! or prose often enough that callers must not trust the raw text.

use std::sync::LazyLock;

use regex::Regex;

static CODE_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"```(?:json)?\s*([\s\S]*?)\s*```").unwrap());

/// Extract the first JSON object from model output.
///
/// Tries, in order: fenced code blocks, the whole text, and the outermost
/// `{...}` span. Returns `None` when nothing parses.
pub fn extract_object(text: &str) -> Option<serde_json::Value> {
    let candidate = match CODE_FENCE.captures(text) {
        Some(caps) => caps.get(1).map_or("", |m| m.as_str()),
        None => text,
    };
    let candidate = candidate.trim();

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(candidate)
        && value.is_object()
    {
        return Some(value);
    }

    let start = candidate.find('{')?;
    let end = candidate.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<serde_json::Value>(&candidate[start..=end])
        .ok()
        .filter(|value| value.is_object())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_bare_object() {
        let value = extract_object(r#"{"should_transition": true}"#).unwrap();
        assert_eq!(value["should_transition"], true);
    }

    #[test]
    fn test_extract_from_json_fence() {
        let text = "Here you go:\n```json\n{\"outcome\": \"partial_progress\"}\n```";
        let value = extract_object(text).unwrap();
        assert_eq!(value["outcome"], "partial_progress");
    }

    #[test]
    fn test_extract_from_anonymous_fence() {
        let text = "```\n{\"a\": 1}\n```";
        assert_eq!(extract_object(text).unwrap()["a"], 1);
    }

    #[test]
    fn test_extract_embedded_in_prose() {
        let text = "Sure! The decision is {\"should_transition\": false, \"next_phase\": null} as requested.";
        let value = extract_object(text).unwrap();
        assert_eq!(value["should_transition"], false);
    }

    #[test]
    fn test_rejects_non_object_and_garbage() {
        assert!(extract_object("[1, 2, 3]").is_none());
        assert!(extract_object("no json here").is_none());
        assert!(extract_object("{broken").is_none());
    }
}
