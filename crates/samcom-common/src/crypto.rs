//! Challenge-response primitive shared by the switching center and user stations.
//!
//! The response is `HMAC-SHA256(secret_key, user_id ‖ challenge)` rendered as
//! lowercase hex. The center recomputes it from its key store and compares in
//! constant time; the station computes the same value from its own secret.

use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Number of random bytes in a challenge (before hex encoding).
pub const CHALLENGE_LEN: usize = 32;

/// Length of a hex-encoded response.
pub const RESPONSE_HEX_LEN: usize = 64;

/// Computes the keyed response to `challenge` for `user_id`.
///
/// Deterministic: the same inputs always produce the same 64-char hex string.
///
/// # Examples
///
/// ```
/// use samcom_common::crypto;
///
/// let a = crypto::respond("A", "k1", "123456");
/// let b = crypto::respond("A", "k1", "123456");
/// assert_eq!(a, b);
/// assert_eq!(a.len(), 64);
/// ```
#[must_use]
pub fn respond(user_id: &str, secret_key: &str, challenge: &str) -> String {
    hex::encode(mac(user_id, secret_key, challenge))
}

/// Checks `response` against the expected value in constant time.
///
/// A response that is not valid hex or has the wrong length fails.
///
/// # Examples
///
/// ```
/// use samcom_common::crypto;
///
/// let r = crypto::respond("A", "k1", "123456");
/// assert!(crypto::verify("A", "k1", "123456", &r));
/// assert!(!crypto::verify("A", "k2", "123456", &r));
/// ```
#[must_use]
pub fn verify(user_id: &str, secret_key: &str, challenge: &str, response: &str) -> bool {
    if response.len() != RESPONSE_HEX_LEN {
        return false;
    }
    let Ok(presented) = hex::decode(response) else {
        return false;
    };
    let expected = mac(user_id, secret_key, challenge);
    expected.ct_eq(presented.as_slice()).into()
}

/// Constant-time equality for two strings (used for echoed challenges).
#[must_use]
pub fn ct_str_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Generates a fresh, unguessable challenge from the OS CSPRNG.
#[must_use]
pub fn generate_challenge() -> String {
    let mut bytes = [0u8; CHALLENGE_LEN];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn mac(user_id: &str, secret_key: &str, challenge: &str) -> [u8; 32] {
    // HMAC accepts keys of any length, so construction cannot fail here.
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret_key.as_bytes())
        .unwrap_or_else(|_| unreachable!("hmac accepts keys of any length"));
    mac.update(user_id.as_bytes());
    mac.update(challenge.as_bytes());
    let digest = mac.finalize().into_bytes();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_is_deterministic() {
        let a = respond("1234567890", "secretkey123", "abc");
        let b = respond("1234567890", "secretkey123", "abc");
        assert_eq!(a, b);
    }

    #[test]
    fn response_is_lowercase_hex_of_expected_length() {
        let r = respond("A", "k1", "123456");
        assert_eq!(r.len(), RESPONSE_HEX_LEN);
        assert!(r.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn matches_hmac_over_concatenated_user_and_challenge() {
        let mut mac = HmacSha256::new_from_slice(b"k1").unwrap();
        mac.update(b"A123456");
        let expected = hex::encode(mac.finalize().into_bytes());
        assert_eq!(respond("A", "k1", "123456"), expected);
    }

    #[test]
    fn different_keys_give_different_responses() {
        assert_ne!(respond("A", "k1", "c"), respond("A", "k2", "c"));
    }

    #[test]
    fn different_users_give_different_responses() {
        assert_ne!(respond("A", "k1", "c"), respond("B", "k1", "c"));
    }

    #[test]
    fn different_challenges_give_different_responses() {
        assert_ne!(respond("A", "k1", "c1"), respond("A", "k1", "c2"));
    }

    #[test]
    fn verify_accepts_matching_response() {
        let r = respond("A", "k1", "123456");
        assert!(verify("A", "k1", "123456", &r));
    }

    #[test]
    fn verify_rejects_wrong_key() {
        let r = respond("B", "wrong", "123456");
        assert!(!verify("B", "right", "123456", &r));
    }

    #[test]
    fn verify_rejects_wrong_length_and_non_hex() {
        assert!(!verify("A", "k1", "c", ""));
        assert!(!verify("A", "k1", "c", "abcd"));
        assert!(!verify("A", "k1", "c", &"z".repeat(RESPONSE_HEX_LEN)));
    }

    #[test]
    fn verify_accepts_uppercase_hex() {
        let r = respond("A", "k1", "c").to_uppercase();
        assert!(verify("A", "k1", "c", &r));
    }

    #[test]
    fn challenges_are_hex_and_unique() {
        let a = generate_challenge();
        let b = generate_challenge();
        assert_eq!(a.len(), CHALLENGE_LEN * 2);
        assert!(hex::decode(&a).is_ok());
        assert_ne!(a, b);
    }

    #[test]
    fn ct_str_eq_compares_content() {
        assert!(ct_str_eq("abc", "abc"));
        assert!(!ct_str_eq("abc", "abd"));
        assert!(!ct_str_eq("abc", "abcd"));
    }
}
