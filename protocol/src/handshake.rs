//! Mutual proof-of-shared-secret.
//!
//! Each side sends a random 256-bit challenge and must receive back
//! `HMAC-SHA256(shared_key, challenge)` as a lowercase hex digest. The
//! channel is privileged only once both directions have verified, so the key
//! itself never crosses the wire. Certificate pinning is the transport-level
//! half: a single trusted peer certificate compared byte-for-byte after the
//! TLS handshake.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Challenges are 32 random bytes, hex encoded.
pub const CHALLENGE_LEN: usize = 64;

pub fn new_challenge() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// The digest the peer expects for `challenge` under `key`.
pub fn challenge_response(key: &str, challenge: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(key.as_bytes()).expect("HMAC accepts any key length");
    mac.update(challenge.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a peer's response to our challenge. Constant-time on the digest.
pub fn verify_response(key: &str, challenge: &str, response: &str) -> bool {
    let Ok(bytes) = hex::decode(response) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(key.as_bytes()).expect("HMAC accepts any key length");
    mac.update(challenge.as_bytes());
    mac.verify_slice(&bytes).is_ok()
}

/// Constant-time byte compare, for callers that pin a peer certificate.
pub fn verify_pinned(presented: &[u8], pinned: &[u8]) -> bool {
    if presented.len() != pinned.len() {
        return false;
    }
    presented
        .iter()
        .zip(pinned)
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

/// Tracks the two directions of the mutual proof on one connection.
#[derive(Debug, Default, Clone, Copy)]
pub struct AuthState {
    /// We verified the peer's response to our challenge.
    pub peer_proven: bool,
    /// The peer acknowledged our response to its challenge.
    pub self_proven: bool,
}

impl AuthState {
    pub fn privileged(&self) -> bool {
        self.peer_proven && self.self_proven
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn challenge_shape() {
        let c = new_challenge();
        assert_eq!(c.len(), CHALLENGE_LEN);
        assert!(c.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()));
        assert_ne!(c, new_challenge());
    }

    #[test]
    fn digest_is_deterministic() {
        let c = new_challenge();
        let a = challenge_response("secret", &c);
        let b = challenge_response("secret", &c);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn different_key_different_digest() {
        let c = new_challenge();
        assert_ne!(
            challenge_response("secret", &c),
            challenge_response("not-secret", &c)
        );
    }

    #[test]
    fn verify_accepts_the_right_digest_only() {
        let c = new_challenge();
        let resp = challenge_response("secret", &c);
        assert!(verify_response("secret", &c, &resp));
        assert!(!verify_response("other", &c, &resp));
        assert!(!verify_response("secret", &c, "zz-not-hex"));
        assert!(!verify_response("secret", &new_challenge(), &resp));
    }

    #[test]
    fn pinned_certificate_comparison() {
        assert!(verify_pinned(b"cert-bytes", b"cert-bytes"));
        assert!(!verify_pinned(b"cert-bytes", b"cert-bytez"));
        assert!(!verify_pinned(b"cert", b"cert-bytes"));
    }

    #[test]
    fn privileged_requires_both_directions() {
        let mut auth = AuthState::default();
        assert!(!auth.privileged());
        auth.peer_proven = true;
        assert!(!auth.privileged());
        auth.self_proven = true;
        assert!(auth.privileged());
    }
}
