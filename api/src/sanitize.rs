use sha2::{Digest, Sha256};

/// Field names whose values never leave the gate in the clear.
const SENSITIVE_KEYS: &[&str] = &[
    "password", "passwd", "pwd", "secret", "token", "api_key", "apikey",
];

/// Build the recordable excerpt of a request body.
///
/// Only JSON bodies produce an excerpt; anything else is opaque and
/// skipped. Sensitive fields are replaced with a deterministic
/// `hash_<prefix>_len<N>` marker — the same credential spammed a thousand
/// times still shows up as the same marker, so the classifier can see the
/// repetition without the store ever holding the value.
pub fn payload_excerpt(body: &[u8], limit: usize) -> Option<String> {
    let mut value: serde_json::Value = serde_json::from_slice(body).ok()?;
    sanitize_value(&mut value);
    let mut rendered = value.to_string();
    if rendered.len() > limit {
        let mut cut = limit;
        while !rendered.is_char_boundary(cut) {
            cut -= 1;
        }
        rendered.truncate(cut);
    }
    Some(rendered)
}

fn sanitize_value(value: &mut serde_json::Value) {
    let serde_json::Value::Object(map) = value else {
        return;
    };
    for (key, entry) in map.iter_mut() {
        let key_lower = key.to_lowercase();
        if SENSITIVE_KEYS.iter().any(|s| key_lower.contains(s)) {
            *entry = serde_json::Value::String(hash_marker(entry));
        } else {
            sanitize_value(entry);
        }
    }
}

fn hash_marker(value: &serde_json::Value) -> String {
    let raw = match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if raw.is_empty() {
        return "hash_empty".to_string();
    }
    let digest = Sha256::digest(raw.as_bytes());
    format!("hash_{}_len{}", &hex::encode(digest)[..16], raw.len())
}

#[cfg(test)]
mod tests {
    use super::payload_excerpt;

    #[test]
    fn passwords_are_reduced_to_deterministic_markers() {
        let body = br#"{"username":"admin","password":"hunter2"}"#;
        let first = payload_excerpt(body, 512).expect("json body should produce an excerpt");
        let second = payload_excerpt(body, 512).expect("json body should produce an excerpt");
        assert_eq!(first, second);
        assert!(!first.contains("hunter2"));
        assert!(first.contains("hash_"));
        assert!(first.contains("_len7"));
        assert!(first.contains("admin"), "non-sensitive fields stay readable");
    }

    #[test]
    fn nested_objects_are_sanitized_recursively() {
        let body = br#"{"auth":{"api_key":"sk-12345"},"query":"widgets"}"#;
        let excerpt = payload_excerpt(body, 512).expect("json body should produce an excerpt");
        assert!(!excerpt.contains("sk-12345"));
        assert!(excerpt.contains("widgets"));
    }

    #[test]
    fn empty_sensitive_values_get_a_stable_marker() {
        let body = br#"{"password":""}"#;
        let excerpt = payload_excerpt(body, 512).expect("json body should produce an excerpt");
        assert!(excerpt.contains("hash_empty"));
    }

    #[test]
    fn non_json_bodies_are_skipped() {
        assert_eq!(payload_excerpt(b"username=admin&password=x", 512), None);
    }

    #[test]
    fn excerpts_are_truncated_to_the_limit() {
        let body = format!(r#"{{"note":"{}"}}"#, "x".repeat(2000));
        let excerpt =
            payload_excerpt(body.as_bytes(), 128).expect("json body should produce an excerpt");
        assert!(excerpt.len() <= 128);
    }
}
