//! Log sanitization.
//!
//! Applied to every params map and preview before it reaches the event log:
//! sensitive keys are redacted, long strings truncated.  The rules are
//! mechanical so the same value always sanitizes the same way.

use serde_json::{Map, Value};

/// Keys whose values never reach the log (matched case-insensitively).
const SENSITIVE_KEYS: &[&str] = &[
    "api_key",
    "apikey",
    "token",
    "password",
    "secret",
    "authorization",
];

pub const REDACTED: &str = "***REDACTED***";
pub const TRUNCATION_MARKER: &str = "…[truncated]";

/// Strings longer than this are truncated in params.
pub const MAX_STRING_LEN: usize = 500;

/// Result previews are capped harder.
pub const MAX_PREVIEW_LEN: usize = 200;

fn is_sensitive(key: &str) -> bool {
    SENSITIVE_KEYS
        .iter()
        .any(|s| key.eq_ignore_ascii_case(s))
}

/// Sanitize a params map: redact sensitive keys, truncate long strings,
/// recurse into nested objects and arrays.
pub fn sanitize_map(params: &Map<String, Value>) -> Map<String, Value> {
    params
        .iter()
        .map(|(key, value)| {
            let clean = if is_sensitive(key) {
                Value::String(REDACTED.to_owned())
            } else {
                sanitize_value(value)
            };
            (key.clone(), clean)
        })
        .collect()
}

fn sanitize_value(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(truncate(s, MAX_STRING_LEN)),
        Value::Object(map) => Value::Object(sanitize_map(map)),
        Value::Array(items) => Value::Array(items.iter().map(sanitize_value).collect()),
        other => other.clone(),
    }
}

/// Truncate to at most `max` characters, appending the truncation marker.
/// Counts chars, not bytes, so multi-byte input cannot split a codepoint.
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_owned();
    }
    let mut out: String = s.chars().take(max).collect();
    out.push_str(TRUNCATION_MARKER);
    out
}

/// Build a result preview: truncated to [`MAX_PREVIEW_LEN`].
pub fn preview(s: &str) -> String {
    truncate(s, MAX_PREVIEW_LEN)
}
