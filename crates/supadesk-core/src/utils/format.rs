use chrono::{DateTime, Utc};
use serde_json::Value;

/// Truncate a string to a maximum length in characters, adding ellipsis if needed
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else if max_len <= 3 {
        s.chars().take(max_len).collect()
    } else {
        let truncated: String = s.chars().take(max_len - 3).collect();
        format!("{}...", truncated)
    }
}

/// Render a JSON value as a single table cell
pub fn format_cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.replace(['\n', '\r', '\t'], " "),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

/// Time remaining until `expires_at`, e.g. "expires in 42m" or "expired 3m ago"
pub fn format_expiry(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let remaining = expires_at - now;
    let minutes = remaining.num_minutes();
    if remaining.num_seconds() <= 0 {
        if minutes == 0 {
            "just expired".to_string()
        } else {
            format!("expired {}m ago", -minutes)
        }
    } else if minutes < 1 {
        "expires in <1m".to_string()
    } else if minutes < 120 {
        format!("expires in {}m", minutes)
    } else {
        format!("expires in {}h", minutes / 60)
    }
}
