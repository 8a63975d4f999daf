//! Bearer-token scrubbing for URLs, log fields and diagnostic payloads.

use once_cell::sync::Lazy;
use regex::Regex;

pub const REDACTED: &str = "[REDACTED]";

static SECRET_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?i)\b(access_token|client_secret|appsecret_proof|input_token)=([^&\s#]+)")
            .expect("valid regex"),
        Regex::new(r"(?i)\b(bearer)\s+([A-Za-z0-9_\-\.=]{8,})").expect("valid regex"),
        Regex::new(r#"(?i)"(access_token)"\s*:\s*"([^"]+)""#).expect("valid regex"),
    ]
});

/// Replaces well-known credential shapes (`access_token=...`, `Bearer ...`, JSON
/// `"access_token": "..."`) with [`REDACTED`].
pub fn redact_secrets(input: &str) -> String {
    let mut result = input.to_string();
    for pattern in SECRET_PATTERNS.iter() {
        if !pattern.is_match(&result) {
            continue;
        }
        result = pattern
            .replace_all(&result, |caps: &regex::Captures<'_>| {
                let whole = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
                let secret = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
                whole.replacen(secret, REDACTED, 1)
            })
            .into_owned();
    }
    result
}

/// Redacts a specific known token value in addition to the generic patterns.
///
/// Covers messages that echo the raw token outside of a query string.
pub fn redact_token(input: &str, token: &str) -> String {
    let scrubbed = redact_secrets(input);
    if token.len() < 4 {
        return scrubbed;
    }
    scrubbed.replace(token, REDACTED)
}
