//! Interpretation of sandbox stdout: HTTP envelope or raw output.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Appended to any textual payload cut at the output byte cap.
pub const TRUNCATION_MARKER: &str = "... [truncated]";

/// Parsed HTTP response produced by a handler: `{status, headers, body}`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct HttpEnvelope {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Value,
}

/// Two-mode capture: handlers that answer an HTTP request produce an
/// envelope; handlers that merely print produce raw output.
#[derive(Clone, Debug, PartialEq)]
pub enum CapturedResponse {
    Envelope(HttpEnvelope),
    Raw { text: String },
}

/// Interpret sandbox stdout.
///
/// Stdout that parses as a single JSON object with an integer `status` in
/// [100, 599], a string-valued `headers` object, and a `body` becomes an
/// [HttpEnvelope]; a string `body` that is itself JSON is decoded one more
/// level. Anything else falls back to raw mode. Malformed envelopes are not
/// errors.
pub fn capture_stdout(stdout: &str, max_bytes: usize) -> CapturedResponse {
    match parse_envelope(stdout.trim(), max_bytes) {
        Some(envelope) => CapturedResponse::Envelope(envelope),
        None => CapturedResponse::Raw {
            text: truncate_text(stdout, max_bytes),
        },
    }
}

fn parse_envelope(text: &str, max_bytes: usize) -> Option<HttpEnvelope> {
    let value: Value = serde_json::from_str(text).ok()?;
    let object = value.as_object()?;

    let status = object.get("status")?.as_u64()?;
    if !(100..=599).contains(&status) {
        return None;
    }

    let headers = match object.get("headers") {
        Some(Value::Object(map)) => map
            .iter()
            .map(|(name, value)| Some((name.clone(), value.as_str()?.to_string())))
            .collect::<Option<BTreeMap<_, _>>>()?,
        None => BTreeMap::new(),
        Some(_) => return None,
    };

    let body = match object.get("body") {
        Some(Value::String(text)) => serde_json::from_str(text)
            .unwrap_or_else(|_| Value::String(truncate_text(text, max_bytes))),
        Some(other) => other.clone(),
        None => Value::Null,
    };

    Some(HttpEnvelope {
        status: status as u16,
        headers,
        body,
    })
}

/// Cut `text` at `max_bytes` (on a char boundary) and append the marker.
pub fn truncate_text(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{}", &text[..end], TRUNCATION_MARKER)
}
