//! Request digests for log correlation, and the canonical signing message
//! of the service-to-service authentication contract.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

pub const SERVICE_NAME_HEADER: &str = "X-Service-Name";
pub const SIGNATURE_HEADER: &str = "X-Signature";

/// Short, stable fingerprint of a payload. Payload values never reach the
/// logs; this does. Key order does not change it.
pub fn payload_digest(payload: &Map<String, Value>) -> String {
    let canonical = serde_json::to_vec(&sorted(payload)).unwrap_or_default();
    let mut hex = hex::encode(Sha256::digest(&canonical));
    hex.truncate(16);
    hex
}

fn sorted(map: &Map<String, Value>) -> Map<String, Value> {
    let mut entries: Vec<(&String, &Value)> = map.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    entries
        .into_iter()
        .map(|(k, v)| (k.clone(), canonical(v)))
        .collect()
}

fn canonical(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(sorted(map)),
        Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
        other => other.clone(),
    }
}

/// The exact bytes a caller signs for `X-Signature`:
/// `service_name || hex(sha256(body))`.
pub fn signing_message(service_name: &str, body: &[u8]) -> String {
    format!("{}{}", service_name, hex::encode(Sha256::digest(body)))
}

/// Header lines a caller sends with `body`; the signature itself is
/// produced with the caller's own key.
pub fn signing_headers(service_name: &str, body: &[u8]) -> String {
    format!(
        "{}: {}\n{}: <sign \"{}\">",
        SERVICE_NAME_HEADER,
        service_name,
        SIGNATURE_HEADER,
        signing_message(service_name, body)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payload_digest_is_short_and_stable() {
        let payload = json!({"company_id": "c1", "type": "batch"});
        let payload = payload.as_object().unwrap();
        let a = payload_digest(payload);
        assert_eq!(a.len(), 16);
        assert_eq!(a, payload_digest(payload));
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));

        let other = json!({"company_id": "c2", "type": "batch"});
        assert_ne!(a, payload_digest(other.as_object().unwrap()));
    }

    #[test]
    fn test_payload_digest_ignores_key_order() {
        let a = json!({"a": 1, "b": {"x": [{"p": 1, "q": 2}], "y": null}});
        let b = json!({"b": {"y": null, "x": [{"q": 2, "p": 1}]}, "a": 1});
        assert_eq!(
            payload_digest(a.as_object().unwrap()),
            payload_digest(b.as_object().unwrap())
        );

        // Array order is data, not layout.
        let c = json!({"a": 1, "b": {"x": [{"p": 1, "q": 2}, 3], "y": null}});
        let d = json!({"a": 1, "b": {"x": [3, {"p": 1, "q": 2}], "y": null}});
        assert_ne!(
            payload_digest(c.as_object().unwrap()),
            payload_digest(d.as_object().unwrap())
        );
    }

    #[test]
    fn test_signing_message() {
        // sha256("") is well known.
        assert_eq!(
            signing_message("billing", b""),
            "billinge3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_signing_headers() {
        let lines = signing_headers("billing", b"");
        let mut lines = lines.lines();
        assert_eq!(lines.next(), Some("X-Service-Name: billing"));
        assert_eq!(
            lines.next(),
            Some("X-Signature: <sign \"billinge3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855\">")
        );
        assert_eq!(lines.next(), None);
    }
}
