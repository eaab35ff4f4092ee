use regex::{Captures, Regex};
use serde_json::{Map, Value};
use std::sync::LazyLock;

pub const REDACTED: &str = "[REDACTED]";

static INLINE_CREDENTIAL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(password|passwd|token|api[_-]?key|secret|cookie|session[_-]?id|authorization)\b\s*([:=])\s*([^\s,;&]+)",
    )
    .expect("inline credential pattern")
});

static BEARER_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(bearer)\s+[A-Za-z0-9._~+/=-]+").expect("bearer pattern")
});

static URL_USERINFO_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)([a-z][a-z0-9+.-]*://[^:@/\s]+:)([^@/\s]+)(@)").expect("url userinfo pattern")
});

/// Scraper configs routinely carry portal logins and session cookies.
const CREDENTIAL_KEY_TOKENS: &[&str] = &[
    "password",
    "passwd",
    "secret",
    "token",
    "api_key",
    "apikey",
    "cookie",
    "authorization",
    "session_id",
    "credential",
    "private_key",
];

/// Masks credentials embedded in free text such as scraper error messages.
pub fn scrub_text(input: &str) -> String {
    let inline = INLINE_CREDENTIAL_REGEX.replace_all(input, |caps: &Captures| {
        format!("{}{}{}", &caps[1], &caps[2], REDACTED)
    });
    let bearer = BEARER_REGEX.replace_all(&inline, |caps: &Captures| {
        format!("{} {}", &caps[1], REDACTED)
    });
    URL_USERINFO_REGEX
        .replace_all(&bearer, |caps: &Captures| {
            format!("{}{}{}", &caps[1], REDACTED, &caps[3])
        })
        .to_string()
}

/// Returns a copy of a session config with credential-looking values masked.
pub fn scrub_config(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(scrub_object(map)),
        Value::Array(values) => Value::Array(values.iter().map(scrub_config).collect()),
        Value::String(text) => Value::String(scrub_text(text)),
        other => other.clone(),
    }
}

fn scrub_object(map: &Map<String, Value>) -> Map<String, Value> {
    map.iter()
        .map(|(key, value)| {
            let scrubbed = if is_credential_key(key) {
                Value::String(REDACTED.to_string())
            } else {
                scrub_config(value)
            };
            (key.clone(), scrubbed)
        })
        .collect()
}

fn is_credential_key(key: &str) -> bool {
    let normalized = key
        .trim()
        .to_ascii_lowercase()
        .replace(['-', ' ', '.'], "_");
    CREDENTIAL_KEY_TOKENS
        .iter()
        .any(|token| normalized.contains(token))
}

#[cfg(test)]
mod tests;
