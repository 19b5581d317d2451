//! Field-name based payload redaction.
//!
//! Keys are normalised (lowercased, non-alphanumerics dropped) before matching,
//! so `access_token`, `accessToken` and `Access-Token` are treated alike.

use serde_json::{Map, Value};

/// Replacement for every redacted value.
pub const REDACTED: &str = "[REDACTED]";

/// Matched anywhere inside a normalised key.
const SENSITIVE_FRAGMENTS: &[&str] = &[
    "password",
    "passwd",
    "passphrase",
    "secret",
    "token",
    "authorization",
    "apikey",
    "cookie",
    "credential",
    "privatekey",
    "signingkey",
    "contentkey",
    "passport",
    "taxid",
    "taxpayerid",
    "governmentid",
    "nationalid",
    "socialsecurity",
    "socialinsurance",
];

/// Short identifiers only matched as a whole key (or a suffix, for the
/// unambiguous ones), so that e.g. `setting` is not mistaken for a TIN.
const SENSITIVE_EXACT: &[&str] = &[
    "otp", "otpcode", "onetimecode", "pin", "ssn", "sin", "tin", "itin", "nin",
];
const SENSITIVE_SUFFIXES: &[&str] = &["ssn", "itin"];

fn normalise(key: &str) -> String {
    key.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Whether values under `key` must never be persisted.
pub fn is_sensitive_key(key: &str) -> bool {
    let key = normalise(key);
    SENSITIVE_EXACT.contains(&key.as_str())
        || SENSITIVE_SUFFIXES.iter().any(|s| key.ends_with(s))
        || SENSITIVE_FRAGMENTS.iter().any(|f| key.contains(f))
}

fn looks_like_credential(s: &str) -> bool {
    let s = s.trim_start();
    s.get(..7).is_some_and(|p| p.eq_ignore_ascii_case("bearer ")) || s.starts_with("eyJ")
}

/// Return a copy of `value` with every sensitive field replaced by [`REDACTED`].
///
/// Recurses through objects and arrays. String values that are themselves
/// bearer credentials are redacted regardless of their key.
pub fn redact(value: &Value) -> Value {
    match value {
        Value::Object(fields) => {
            let mut out = Map::with_capacity(fields.len());
            for (key, v) in fields {
                let redacted = if is_sensitive_key(key) {
                    Value::String(REDACTED.to_string())
                } else {
                    redact(v)
                };
                out.insert(key.clone(), redacted);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(redact).collect()),
        Value::String(s) if looks_like_credential(s) => Value::String(REDACTED.to_string()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn nested_secrets_are_replaced() {
        let payload = json!({
            "email": "client@example.com",
            "password": "hunter2",
            "profile": {
                "spouse_ssn": "123-45-6789",
                "dependents": [{ "name": "Kid", "SIN": "046 454 286" }],
            },
            "headers": { "Authorization": "Bearer abc.def.ghi" },
            "setting": "dark",
        });

        let out = redact(&payload);
        assert_eq!(out["email"], "client@example.com");
        assert_eq!(out["password"], REDACTED);
        assert_eq!(out["profile"]["spouse_ssn"], REDACTED);
        assert_eq!(out["profile"]["dependents"][0]["SIN"], REDACTED);
        assert_eq!(out["profile"]["dependents"][0]["name"], "Kid");
        assert_eq!(out["headers"]["Authorization"], REDACTED);
        assert_eq!(out["setting"], "dark");
    }

    #[test]
    fn key_spelling_variants_are_normalised() {
        for key in ["access_token", "accessToken", "Access-Token", "refreshToken", "api_key", "X-Api-Key"] {
            assert!(is_sensitive_key(key), "{key} should be sensitive");
        }
        for key in ["status", "filing_year", "label", "destination", "settings"] {
            assert!(!is_sensitive_key(key), "{key} should not be sensitive");
        }
    }

    #[test]
    fn bearer_values_are_redacted_under_innocent_keys() {
        let out = redact(&json!({ "note": "Bearer eyJhbGciOi.x.y", "jwt": "eyJhbGciOiJIUzI1NiJ9.e.s" }));
        assert_eq!(out["note"], REDACTED);
        assert_eq!(out["jwt"], REDACTED);
    }

    proptest! {
        /// A secret placed under any sensitive key, at any depth, never survives redaction.
        #[test]
        fn secrets_never_survive(
            key in prop::sample::select(vec!["password", "token", "ssn", "otp", "client_secret", "passport_number"]),
            secret in "[a-zA-Z0-9]{12,24}",
            depth in 0usize..4,
        ) {
            let mut value = json!({ key: secret.clone() });
            for _ in 0..depth {
                value = json!({ "wrapper": [value] });
            }
            let rendered = serde_json::to_string(&redact(&value)).unwrap();
            prop_assert!(!rendered.contains(&secret));
        }
    }
}
