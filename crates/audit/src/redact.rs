//! Best-effort scrubbing of secrets from audit payloads.
//!
//! This is a safety net for HTTP-layer entries; callers are still expected to
//! keep credentials out of payloads in the first place.

use serde_json::Value;

/// Where a pattern has to sit in a value to count.
#[derive(Debug, Clone, Copy)]
enum Anchor {
    /// Anywhere, ignoring case.
    Anywhere,
    /// At the start of the value, ignoring case (header-style credentials).
    Prefix,
    /// As a URL query parameter name, right after `?` or `&`, ignoring case.
    QueryParam,
    /// Case-sensitive, at the start of a token.
    TokenStart,
}

const SECRET_PATTERNS: &[(&str, Anchor, &str)] = &[
    ("Bearer ", Anchor::Prefix, "bearer_token"),
    ("Basic ", Anchor::Prefix, "basic_auth"),
    ("eyJ", Anchor::TokenStart, "jwt_token"),
    ("X-Goog-Signature", Anchor::Anywhere, "gcs_signature"),
    ("AWSAccessKeyId", Anchor::Anywhere, "aws_key"),
    ("X-Amz-Signature", Anchor::Anywhere, "aws_signature"),
    ("X-Amz-Security-Token", Anchor::Anywhere, "aws_session_token"),
    ("sas-token", Anchor::Anywhere, "sas_token"),
    ("access-key", Anchor::Anywhere, "access_key"),
    ("sig=", Anchor::QueryParam, "signature_param"),
    ("signature=", Anchor::QueryParam, "signature_param"),
    ("token=", Anchor::QueryParam, "token_param"),
    ("key=", Anchor::QueryParam, "key_param"),
    ("secret=", Anchor::QueryParam, "secret_param"),
    ("password=", Anchor::QueryParam, "password_param"),
];

const SENSITIVE_KEYS: &[&str] = &[
    "authorization",
    "proxy-authorization",
    "cookie",
    "set-cookie",
    "password",
    "passwd",
    "secret",
    "client_secret",
    "token",
    "access_token",
    "refresh_token",
    "id_token",
    "api_key",
    "apikey",
    "x-api-key",
    "private_key",
];

fn found(value: &str, lower: &str, pattern: &str, anchor: Anchor) -> bool {
    let pattern_lower = pattern.to_ascii_lowercase();
    match anchor {
        Anchor::Anywhere => lower.contains(&pattern_lower),
        Anchor::Prefix => lower.trim_start().starts_with(&pattern_lower),
        Anchor::QueryParam => {
            lower.contains(&format!("?{pattern_lower}"))
                || lower.contains(&format!("&{pattern_lower}"))
        }
        Anchor::TokenStart => value.match_indices(pattern).any(|(at, _)| {
            value[..at]
                .chars()
                .next_back()
                .is_none_or(|c| !c.is_ascii_alphanumeric())
        }),
    }
}

/// Name of the first secret pattern found in `value`, if any.
pub fn detect_secret_pattern(value: &str) -> Option<&'static str> {
    let lower = value.to_ascii_lowercase();
    SECRET_PATTERNS
        .iter()
        .find(|(pattern, anchor, _)| found(value, &lower, pattern, *anchor))
        .map(|(_, _, name)| *name)
}

fn is_sensitive_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    SENSITIVE_KEYS.contains(&lower.as_str())
        || lower.ends_with("_token")
        || lower.ends_with("_secret")
        || lower.contains("password")
}

/// Replace secret-looking values in place. Returns the number of redactions.
pub fn scrub(value: &mut Value) -> usize {
    match value {
        Value::String(s) => match detect_secret_pattern(s) {
            Some(p) => {
                *s = format!("[REDACTED:{p}]");
                1
            }
            None => 0,
        },
        Value::Array(items) => items.iter_mut().map(scrub).sum(),
        Value::Object(map) => {
            let mut count = 0;
            for (key, v) in map.iter_mut() {
                if is_sensitive_key(key) && !v.is_null() {
                    *v = Value::String("[REDACTED:sensitive_key]".to_string());
                    count += 1;
                } else {
                    count += scrub(v);
                }
            }
            count
        }
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn redacts_tokens_in_values() {
        let mut v = json!({
            "path": "/jobs/123",
            "headers": { "x-trace": "Bearer abc.def" },
            "url": "https://bucket/x?X-Amz-Signature=deadbeef",
        });
        assert_eq!(scrub(&mut v), 2);
        assert_eq!(v["headers"]["x-trace"], "[REDACTED:bearer_token]");
        assert_eq!(v["url"], "[REDACTED:aws_signature]");
        assert_eq!(v["path"], "/jobs/123");
    }

    #[test]
    fn redacts_sensitive_keys_regardless_of_value() {
        let mut v = json!({
            "Authorization": "opaque",
            "body": { "db_password": "hunter2", "refresh_token": 42, "note": null },
            "items": [{ "api_key": "k" }],
        });
        assert_eq!(scrub(&mut v), 4);
        assert_eq!(v["Authorization"], "[REDACTED:sensitive_key]");
        assert_eq!(v["body"]["db_password"], "[REDACTED:sensitive_key]");
        assert_eq!(v["body"]["refresh_token"], "[REDACTED:sensitive_key]");
        assert_eq!(v["items"][0]["api_key"], "[REDACTED:sensitive_key]");
    }

    #[test]
    fn patterns_respect_their_position() {
        assert_eq!(detect_secret_pattern("heyjude"), None);
        assert_eq!(detect_secret_pattern("EYJ is not a token"), None);
        assert_eq!(
            detect_secret_pattern("token eyJhbGciOiJIUzI1NiJ9.e30.sig"),
            Some("jwt_token")
        );
        assert_eq!(detect_secret_pattern("monkey=banana"), None);
        assert_eq!(detect_secret_pattern("/data?key=abc"), Some("key_param"));
        assert_eq!(detect_secret_pattern("/data?a=1&SIG=ff"), Some("signature_param"));
        assert_eq!(detect_secret_pattern("a basic model"), None);
        assert_eq!(detect_secret_pattern("Basic dXNlcjpwdw=="), Some("basic_auth"));
    }

    #[test]
    fn leaves_plain_payloads_alone() {
        let mut v = json!({ "model": "cardio-v2", "steps": 100, "dt": 0.01 });
        let before = v.clone();
        assert_eq!(scrub(&mut v), 0);
        assert_eq!(v, before);
    }
}
