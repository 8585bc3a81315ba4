//! PKCE (RFC 7636) and opaque-token helpers

use base64::{engine::general_purpose, Engine as _};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Generate a URL-safe random string from `bytes` bytes of entropy
pub fn random_urlsafe(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    OsRng.fill_bytes(&mut buf);
    general_purpose::URL_SAFE_NO_PAD.encode(buf)
}

/// Generate a PKCE code verifier (43 characters, per RFC 7636 section 4.1)
pub fn generate_verifier() -> String {
    random_urlsafe(32)
}

/// Compute the S256 code challenge for a verifier
pub fn challenge_s256(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    general_purpose::URL_SAFE_NO_PAD.encode(digest)
}

/// Validate a presented verifier against a stored S256 challenge
pub fn verify_s256(verifier: &str, challenge: &str) -> bool {
    challenge_s256(verifier) == challenge
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verifier_shape() {
        let verifier = generate_verifier();
        assert_eq!(verifier.len(), 43);
        assert!(verifier
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn test_challenge_matches_rfc_vector() {
        // Appendix B of RFC 7636
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        assert_eq!(challenge_s256(verifier), "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM");
    }

    #[test]
    fn test_verify_roundtrip() {
        let verifier = generate_verifier();
        let challenge = challenge_s256(&verifier);
        assert!(verify_s256(&verifier, &challenge));
        assert!(!verify_s256("wrong-verifier", &challenge));
    }

    #[test]
    fn test_random_tokens_are_distinct() {
        assert_ne!(random_urlsafe(16), random_urlsafe(16));
    }
}
