//! Extraction of `{summary, tags}` from free-form model output.
//!
//! Models are asked for bare JSON but often wrap it in prose or code fences. Parsing
//! falls back in order: strict JSON, a fenced block, then a line heuristic.

use regex::Regex;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::LazyLock;
use tracing::debug;

/// Summary used when nothing but tag lines could be recovered.
pub const SUMMARY_FALLBACK: &str = "Summary could not be extracted from response.";

static JSON_FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)```json\s*(.*?)```").expect("valid json fence regex")
});

static PLAIN_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```\s*(.*?)```").expect("valid fence regex"));

static TAG_LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^.*?\btags?\s*:").expect("valid tag label regex"));

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SummaryAndTags {
    pub summary: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// How a response was understood; logged for prompt tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ParseMethod {
    Json,
    FencedJson,
    LineHeuristic,
}

/// Contents of the first fenced block, preferring a ```json fence.
pub fn extract_fenced_block(text: &str) -> Option<&str> {
    JSON_FENCE
        .captures(text)
        .or_else(|| PLAIN_FENCE.captures(text))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim())
}

fn is_tag_line(line: &str) -> bool {
    let lower = line.to_lowercase();
    lower.contains("tags:") || lower.contains("tag:") || line.starts_with('-') || line.starts_with('*')
}

/// Split a tag line ("Tags: a, b" or "- a") into candidate tags.
fn split_tag_line(line: &str) -> impl Iterator<Item = String> + '_ {
    let body = match TAG_LABEL.find(line) {
        Some(label) => &line[label.end()..],
        None => line,
    };
    body.split(',').filter_map(|tag| {
        let tag = tag
            .trim()
            .trim_start_matches(['-', '*'])
            .trim()
            .trim_matches('"');
        (!tag.is_empty()).then(|| tag.to_string())
    })
}

/// Line heuristic: tag-looking lines become tags, everything else summary prose.
pub fn extract_from_lines(text: &str) -> SummaryAndTags {
    let mut summary_lines = Vec::new();
    let mut tags = Vec::new();

    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if is_tag_line(line) {
            tags.extend(split_tag_line(line));
        } else {
            summary_lines.push(line);
        }
    }

    let summary = if summary_lines.is_empty() {
        SUMMARY_FALLBACK.to_string()
    } else {
        summary_lines.join("\n")
    };

    SummaryAndTags { summary, tags }
}

/// Parse a summarize response; never fails, the heuristic always yields something.
pub fn parse_summary_and_tags(response: &str) -> (SummaryAndTags, ParseMethod) {
    if let Ok(parsed) = serde_json::from_str::<SummaryAndTags>(response.trim()) {
        return (parsed, ParseMethod::Json);
    }

    if let Some(block) = extract_fenced_block(response) {
        match serde_json::from_str::<SummaryAndTags>(block) {
            Ok(parsed) => return (parsed, ParseMethod::FencedJson),
            Err(e) => debug!(error = %e, "Fenced block is not a summary object"),
        }
    }

    (extract_from_lines(response), ParseMethod::LineHeuristic)
}

/// Parse a tag-only response: a JSON array, a `{tags}` object, or comma/line separated text.
pub fn parse_tag_list(response: &str) -> Vec<String> {
    #[derive(Deserialize)]
    struct TagsOnly {
        tags: Vec<String>,
    }

    let candidates = [Some(response.trim()), extract_fenced_block(response)];
    for candidate in candidates.into_iter().flatten() {
        if let Ok(tags) = serde_json::from_str::<Vec<String>>(candidate) {
            return tags;
        }
        if let Ok(TagsOnly { tags }) = serde_json::from_str::<TagsOnly>(candidate) {
            return tags;
        }
    }

    response
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with("```"))
        .flat_map(split_tag_line)
        .collect()
}

/// Keep tags present in `allowed` (trimmed, case-insensitive), preserving the
/// generated casing and dropping repeats.
pub fn filter_valid_tags(generated: &[String], allowed: &[String]) -> Vec<String> {
    let allowed: HashSet<String> = allowed.iter().map(|t| t.trim().to_lowercase()).collect();
    let mut seen = HashSet::new();

    generated
        .iter()
        .map(|t| t.trim())
        .filter(|t| allowed.contains(&t.to_lowercase()))
        .filter(|t| seen.insert(t.to_lowercase()))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_filter_keeps_original_casing() {
        let filtered = filter_valid_tags(
            &strings(&["Fiction", "thriller", "mystery"]),
            &strings(&["fiction", "mystery"]),
        );
        assert_eq!(filtered, strings(&["Fiction", "mystery"]));
    }

    #[test]
    fn test_filter_trims_and_dedupes() {
        let filtered = filter_valid_tags(
            &strings(&["  Fiction ", "fiction", "Sci-Fi"]),
            &strings(&["fiction", " sci-fi"]),
        );
        assert_eq!(filtered, strings(&["Fiction", "Sci-Fi"]));
    }

    #[test]
    fn test_strict_json() {
        let (parsed, method) =
            parse_summary_and_tags(r#"{"summary":"A detective story.","tags":["mystery"]}"#);
        assert_eq!(method, ParseMethod::Json);
        assert_eq!(parsed.summary, "A detective story.");
        assert_eq!(parsed.tags, strings(&["mystery"]));
    }

    #[test]
    fn test_json_fence_with_prose() {
        let response = "Here you go:\n```JSON\n{\"summary\": \"Two friends travel.\", \"tags\": [\"adventure\"]}\n```\nHope this helps!";
        let (parsed, method) = parse_summary_and_tags(response);
        assert_eq!(method, ParseMethod::FencedJson);
        assert_eq!(parsed.summary, "Two friends travel.");
        assert_eq!(parsed.tags, strings(&["adventure"]));
    }

    #[test]
    fn test_plain_fence() {
        let response = "```\n{\"summary\": \"S\", \"tags\": []}\n```";
        let (parsed, method) = parse_summary_and_tags(response);
        assert_eq!(method, ParseMethod::FencedJson);
        assert_eq!(parsed.summary, "S");
        assert!(parsed.tags.is_empty());
    }

    #[test]
    fn test_line_heuristic() {
        let response = "A young wizard discovers his heritage.\nHe attends a school of magic.\nTags: Fantasy, Coming of Age\n- adventure\n* magic";
        let (parsed, method) = parse_summary_and_tags(response);
        assert_eq!(method, ParseMethod::LineHeuristic);
        assert_eq!(
            parsed.summary,
            "A young wizard discovers his heritage.\nHe attends a school of magic."
        );
        assert_eq!(
            parsed.tags,
            strings(&["Fantasy", "Coming of Age", "adventure", "magic"])
        );
    }

    #[test]
    fn test_heuristic_without_prose_uses_fallback_summary() {
        let parsed = extract_from_lines("Tags: mystery\n");
        assert_eq!(parsed.summary, SUMMARY_FALLBACK);
        assert_eq!(parsed.tags, strings(&["mystery"]));
    }

    #[test]
    fn test_broken_fence_falls_through_to_heuristic() {
        let response = "```json\n{\"summary\": oops}\n```";
        let (_, method) = parse_summary_and_tags(response);
        assert_eq!(method, ParseMethod::LineHeuristic);
    }

    #[test]
    fn test_parse_tag_list_forms() {
        assert_eq!(parse_tag_list(r#"["a", "b"]"#), strings(&["a", "b"]));
        assert_eq!(parse_tag_list(r#"{"tags": ["a"]}"#), strings(&["a"]));
        assert_eq!(
            parse_tag_list("mystery, thriller ,  fiction"),
            strings(&["mystery", "thriller", "fiction"])
        );
        assert_eq!(
            parse_tag_list("Tags: mystery\n- crime"),
            strings(&["mystery", "crime"])
        );
    }
}
