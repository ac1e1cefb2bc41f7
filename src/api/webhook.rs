//! HMAC verification for the inbound tracker webhook (§4.5.2, §6.2).

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Verifies `signature_hex` (lowercase hex-encoded HMAC-SHA256) against
/// `body` under `secret`. Constant-time comparison is delegated to
/// `Mac::verify_slice`.
pub fn verify_signature(secret: &str, body: &[u8], signature_hex: &str) -> bool {
    let Ok(signature) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn accepts_a_correctly_signed_body() {
        let body = br#"{"action":"create"}"#;
        let sig = sign("shh", body);
        assert!(verify_signature("shh", body, &sig));
    }

    #[test]
    fn rejects_a_mismatched_secret() {
        let body = br#"{"action":"create"}"#;
        let sig = sign("shh", body);
        assert!(!verify_signature("other", body, &sig));
    }

    #[test]
    fn rejects_a_tampered_body() {
        let body = br#"{"action":"create"}"#;
        let sig = sign("shh", body);
        assert!(!verify_signature("shh", br#"{"action":"remove"}"#, &sig));
    }

    #[test]
    fn rejects_malformed_hex() {
        assert!(!verify_signature("shh", b"body", "not-hex"));
    }
}
