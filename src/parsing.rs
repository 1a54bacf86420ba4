//! Lenient decoding of model output.
//!
//! Generated text is untrusted: it may be wrapped in markdown fences or
//! surrounded by prose. Every task decodes through [`parse_generated`].

use serde::de::DeserializeOwned;

use crate::error::TurnError;

/// Strip code fences and delimiters, then keep the outermost `{...}` span.
/// Text without a `{` is returned as-is after stripping.
pub fn extract_json_span(raw: &str) -> &str {
    let text = strip_fences(raw.trim());
    let Some(start) = text.find('{') else { return text };
    match text.rfind('}') {
        Some(end) if end > start => &text[start..=end],
        _ => &text[start..],
    }
}

fn strip_fences(text: &str) -> &str {
    let mut text = text.trim();
    if let Some(rest) = text.strip_prefix("```") {
        // drop the info string (```json, ```JSON, ...); it may share a line with the body
        text = match rest.split_once('\n') {
            Some((info, body)) if !info.contains('{') => body,
            _ => rest.trim_start_matches(|c: char| c.is_ascii_alphanumeric()),
        };
    }
    if let Some(rest) = text.trim_end().strip_suffix("```") {
        text = rest;
    }
    text.trim().trim_matches('`').trim()
}

/// Decode generated text into `T`, classifying failures.
pub fn parse_generated<T: DeserializeOwned>(raw: &str) -> Result<T, TurnError> {
    if raw.trim().is_empty() {
        return Err(TurnError::EmptyGenerationResult);
    }
    let span = extract_json_span(raw);
    serde_json::from_str(span).map_err(|e| TurnError::MalformedGenerationOutput {
        reason: e.to_string(),
        raw: raw.to_string(),
    })
}
