use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

/// Key fragments that mark a field as sensitive. Matching is on the
/// lowercased key name, by equality or substring.
const SENSITIVE_KEY_FRAGMENTS: &[&str] = &[
    "password",
    "passwd",
    "secret",
    "token",
    "api_key",
    "apikey",
    "authorization",
    "bearer",
    "ssn",
    "social_security",
    "credit_card",
    "card_number",
    "cardnumber",
    "cvv",
    "cvc",
    "private_key",
    "privatekey",
    "access_key",
    "session_key",
    "cookie",
    "jwt",
    "credential",
];

const REDACTED: &str = "[REDACTED]";

static CC_RE: OnceLock<Regex> = OnceLock::new();
static SSN_RE: OnceLock<Regex> = OnceLock::new();
static JWT_RE: OnceLock<Regex> = OnceLock::new();

fn cc_re() -> &'static Regex {
    CC_RE.get_or_init(|| {
        Regex::new(r"\b\d{4}[ -]?\d{4}[ -]?\d{4}[ -]?\d{3,4}\b")
            .expect("credit card regex must compile")
    })
}

fn ssn_re() -> &'static Regex {
    SSN_RE.get_or_init(|| {
        Regex::new(r"\b\d{3}-\d{2}-\d{4}\b|\b\d{9}\b").expect("ssn regex must compile")
    })
}

fn jwt_re() -> &'static Regex {
    JWT_RE.get_or_init(|| {
        Regex::new(r"eyJ[A-Za-z0-9_-]+\.eyJ[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+")
            .expect("jwt regex must compile")
    })
}

fn is_sensitive_key(key: &str) -> bool {
    let lower = key.to_lowercase();
    SENSITIVE_KEY_FRAGMENTS
        .iter()
        .any(|fragment| lower.contains(fragment))
}

fn scrub_string(s: &str) -> String {
    let s = jwt_re().replace_all(s, "[REDACTED:JWT]");
    let s = cc_re().replace_all(&s, "[REDACTED:CC]");
    let s = ssn_re().replace_all(&s, "[REDACTED:SSN]");
    s.into_owned()
}

/// Produce a scrubbed deep copy of a payload for the audit log. The input is
/// never mutated. Values under sensitive keys are replaced wholesale; string
/// leaves elsewhere get the value-shaped patterns masked in place.
pub fn redact(payload: &Value) -> Value {
    match payload {
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, value) in map {
                if is_sensitive_key(key) {
                    out.insert(key.clone(), Value::String(REDACTED.to_string()));
                } else {
                    out.insert(key.clone(), redact(value));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(redact).collect()),
        Value::String(s) => Value::String(scrub_string(s)),
        other => other.clone(),
    }
}
