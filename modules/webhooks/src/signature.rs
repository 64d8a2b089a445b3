//! `X-Signature: sbwh_sig=v1:<hex hmac-sha256(secret, payload)>`

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{WebhookError, WebhookResult};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Signature";
pub const SIGNATURE_PREFIX: &str = "sbwh_sig=v1:";

fn mac(secret: &str) -> WebhookResult<HmacSha256> {
    HmacSha256::new_from_slice(secret.as_bytes()).map_err(|e| WebhookError::Signing(e.to_string()))
}

/// Header value for `payload` signed with `secret`
pub fn sign(secret: &str, payload: &[u8]) -> WebhookResult<String> {
    let mut mac = mac(secret)?;
    mac.update(payload);
    Ok(format!(
        "{}{}",
        SIGNATURE_PREFIX,
        hex::encode(mac.finalize().into_bytes())
    ))
}

/// Check a received header value in constant time
pub fn verify_signature(secret: &str, payload: &[u8], header: &str) -> bool {
    let Some(hex_sig) = header.trim().strip_prefix(SIGNATURE_PREFIX) else {
        return false;
    };
    let Ok(received) = hex::decode(hex_sig) else {
        return false;
    };

    let Ok(mut mac) = mac(secret) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&received).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_vector() {
        // RFC 4231 test case 2
        let sig = sign("Jefe", b"what do ya want for nothing?").unwrap();
        assert_eq!(
            sig,
            "sbwh_sig=v1:5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_verify() {
        let payload = br#"{"id":"evt-1"}"#;
        let header = sign("s3cret", payload).unwrap();

        assert!(verify_signature("s3cret", payload, &header));
        assert!(!verify_signature("other", payload, &header));
        assert!(!verify_signature("s3cret", b"{}", &header));
        assert!(!verify_signature("s3cret", payload, "v1:deadbeef"));
        assert!(!verify_signature("s3cret", payload, "sbwh_sig=v1:zz"));
    }

    #[test]
    fn test_any_secret_length_signs() {
        // keys longer than the SHA-256 block are hashed first
        let long = "k".repeat(200);
        for secret in ["", "x", long.as_str()] {
            let header = sign(secret, b"payload").unwrap();
            assert!(header.starts_with(SIGNATURE_PREFIX));
            assert!(verify_signature(secret, b"payload", &header));
        }
    }
}
