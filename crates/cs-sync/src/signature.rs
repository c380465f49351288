use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use ring::{digest, hmac};
use subtle::ConstantTimeEq;

/// Header carrying the HMAC of the raw webhook body.
pub const SIGNATURE_HEADER: &str = "x-channel-signature";

/// `sha256:` followed by the lower-case hex SHA-256 of `body`.
pub fn content_hash(body: &[u8]) -> String {
    format!("sha256:{}", hex::encode(digest::digest(&digest::SHA256, body)))
}

/// Check an HMAC-SHA256 signature over the raw body.
///
/// Accepts `sha256=<sig>`, `hmac-sha256=<sig>` or a bare value, with the
/// signature in hex or standard base64.
pub fn verify_signature(secret: &[u8], body: &[u8], header: &str) -> bool {
    let value = header.trim();
    let value = value
        .strip_prefix("sha256=")
        .or_else(|| value.strip_prefix("hmac-sha256="))
        .unwrap_or(value);

    let Some(provided) = decode_signature(value) else {
        return false;
    };
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    let expected = hmac::sign(&key, body);
    expected.as_ref().ct_eq(&provided).into()
}

/// Sign `body`, hex encoded with the `sha256=` prefix.
pub fn sign(secret: &[u8], body: &[u8]) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    format!("sha256={}", hex::encode(hmac::sign(&key, body)))
}

fn decode_signature(value: &str) -> Option<Vec<u8>> {
    if value.len() == 64 {
        if let Ok(bytes) = hex::decode(value) {
            return Some(bytes);
        }
    }
    STANDARD.decode(value).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_stable() {
        let a = content_hash(br#"{"action":"reservation.created"}"#);
        assert_eq!(a, content_hash(br#"{"action":"reservation.created"}"#));
        assert!(a.starts_with("sha256:"));
        assert_eq!(a.len(), "sha256:".len() + 64);
        assert_ne!(a, content_hash(b"{}"));
    }

    #[test]
    fn hex_and_base64_signatures() {
        let body = br#"{"action":"reservation.modified"}"#;
        let signed = sign(b"secret", body);
        assert!(verify_signature(b"secret", body, &signed));

        let raw = hex::decode(signed.trim_start_matches("sha256=")).unwrap();
        let b64 = STANDARD.encode(raw);
        assert!(verify_signature(b"secret", body, &format!("hmac-sha256={b64}")));
        assert!(verify_signature(b"secret", body, &b64));
    }

    #[test]
    fn wrong_secret_or_body_fails() {
        let body = b"payload";
        let signed = sign(b"secret", body);
        assert!(!verify_signature(b"other", body, &signed));
        assert!(!verify_signature(b"secret", b"tampered", &signed));
        assert!(!verify_signature(b"secret", body, "sha256=zz"));
        assert!(!verify_signature(b"secret", body, ""));
    }
}
