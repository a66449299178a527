//! Request signing for the APIM token service

use std::time::SystemTime;

use sha2::{Digest, Sha256};

use crate::{AppKeyRef, AppSecretRef};

/// Computes the `encryption` field sent with token requests
///
/// The signature is the lowercase hex SHA-256 digest of the app key, the
/// timestamp and the app secret, concatenated in that order.
pub fn sign(app_key: &AppKeyRef, timestamp: &str, app_secret: &AppSecretRef) -> String {
    let mut hasher = Sha256::new();
    hasher.update(app_key.as_str().as_bytes());
    hasher.update(timestamp.as_bytes());
    hasher.update(app_secret.as_str().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// The current time as epoch milliseconds, formatted for signing
pub fn timestamp_millis() -> String {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AppKey, AppSecret};

    fn key() -> AppKey {
        AppKey::from_static("app-key")
    }

    fn secret() -> AppSecret {
        AppSecret::from_static("app-secret")
    }

    #[test]
    fn matches_digest_of_concatenation() {
        let expected = format!("{:x}", Sha256::digest(b"app-key1700000000000app-secret"));
        assert_eq!(sign(&key(), "1700000000000", &secret()), expected);
    }

    #[test]
    fn known_vector() {
        // sha256("abc")
        assert_eq!(
            sign(
                &AppKey::from_static("a"),
                "b",
                &AppSecret::from_static("c")
            ),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn is_deterministic() {
        let first = sign(&key(), "1700000000000", &secret());
        let second = sign(&key(), "1700000000000", &secret());
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
    }

    #[test]
    fn every_input_contributes() {
        let base = sign(&key(), "1700000000000", &secret());

        assert_ne!(base, sign(&AppKey::from_static("other-key"), "1700000000000", &secret()));
        assert_ne!(base, sign(&key(), "1700000000001", &secret()));
        assert_ne!(
            base,
            sign(&key(), "1700000000000", &AppSecret::from_static("other-secret"))
        );
    }

    #[test]
    fn timestamp_is_in_milliseconds() {
        let ts: u128 = timestamp_millis().parse().unwrap();
        assert!(ts > 1_577_836_800_000);
    }
}
