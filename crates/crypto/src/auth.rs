//! Challenge-response authenticator
//!
//! The relay sends every new session a fresh random challenge. Legacy clients
//! answer with SHA-1 over `passphrase || challenge`; versioned clients answer
//! with HMAC-SHA256 over the challenge keyed by the passphrase. Both checks
//! run in constant time and report only success or failure.

use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha1::{Digest, Sha1};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Size of a legacy challenge response (SHA-1 digest)
pub const LEGACY_RESPONSE_SIZE: usize = 20;

/// Size of an HMAC-SHA256 challenge response
pub const HMAC_RESPONSE_SIZE: usize = 32;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Passphrase must not be empty")]
    EmptyPassphrase,

    #[error("Invalid HMAC key: {0}")]
    InvalidKey(String),
}

/// Shared-passphrase authenticator
pub struct Authenticator {
    passphrase: Vec<u8>,
    keyed_mac: HmacSha256,
}

impl Authenticator {
    /// Create an authenticator for the given passphrase
    pub fn new(passphrase: &str) -> Result<Self, AuthError> {
        if passphrase.is_empty() {
            return Err(AuthError::EmptyPassphrase);
        }

        let keyed_mac = HmacSha256::new_from_slice(passphrase.as_bytes())
            .map_err(|e| AuthError::InvalidKey(e.to_string()))?;

        Ok(Self {
            passphrase: passphrase.as_bytes().to_vec(),
            keyed_mac,
        })
    }

    /// Generate a random challenge of `size` bytes
    pub fn generate_challenge(&self, size: usize) -> Vec<u8> {
        let mut challenge = vec![0u8; size];
        OsRng.fill_bytes(&mut challenge);
        challenge
    }

    /// Expected legacy response for a challenge
    pub fn response(&self, challenge: &[u8]) -> [u8; LEGACY_RESPONSE_SIZE] {
        let mut hasher = Sha1::new();
        hasher.update(&self.passphrase);
        hasher.update(challenge);
        hasher.finalize().into()
    }

    /// HMAC-SHA256 tag a versioned client sends for a challenge
    pub fn hmac_response(&self, challenge: &[u8]) -> [u8; HMAC_RESPONSE_SIZE] {
        let mut mac = self.keyed_mac.clone();
        mac.update(challenge);
        mac.finalize().into_bytes().into()
    }

    /// Check a legacy response; the candidate must be exactly 20 bytes
    pub fn verify_response(&self, challenge: &[u8], candidate: &[u8]) -> bool {
        if candidate.len() != LEGACY_RESPONSE_SIZE {
            return false;
        }
        let expected = self.response(challenge);
        expected[..].ct_eq(candidate).into()
    }

    /// Check an HMAC response; the candidate must be exactly 32 bytes
    pub fn verify_response_hmac(&self, challenge: &[u8], candidate: &[u8]) -> bool {
        if candidate.len() != HMAC_RESPONSE_SIZE {
            return false;
        }
        let mut mac = self.keyed_mac.clone();
        mac.update(challenge);
        mac.verify_slice(candidate).is_ok()
    }

    /// Check a response using the scheme the client declared at connect time
    pub fn verify(&self, challenge: &[u8], candidate: &[u8], uses_hmac: bool) -> bool {
        if uses_hmac {
            self.verify_response_hmac(challenge, candidate)
        } else {
            self.verify_response(challenge, candidate)
        }
    }
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use echotun_core::CHALLENGE_SIZE;

    fn auth() -> Authenticator {
        Authenticator::new("correct horse").unwrap()
    }

    #[test]
    fn test_empty_passphrase_rejected() {
        assert!(matches!(
            Authenticator::new(""),
            Err(AuthError::EmptyPassphrase)
        ));
    }

    #[test]
    fn test_challenges_are_fresh() {
        let auth = auth();
        let a = auth.generate_challenge(CHALLENGE_SIZE);
        let b = auth.generate_challenge(CHALLENGE_SIZE);
        assert_eq!(a.len(), CHALLENGE_SIZE);
        assert_ne!(a, b);
    }

    #[test]
    fn test_legacy_response_is_sha1_of_passphrase_and_challenge() {
        let auth = auth();
        let challenge = [7u8; CHALLENGE_SIZE];

        let mut hasher = Sha1::new();
        hasher.update(b"correct horse");
        hasher.update(challenge);
        let expected: [u8; LEGACY_RESPONSE_SIZE] = hasher.finalize().into();

        assert_eq!(auth.response(&challenge), expected);
        assert!(auth.verify_response(&challenge, &expected));
    }

    #[test]
    fn test_legacy_response_wrong_value() {
        let auth = auth();
        let challenge = auth.generate_challenge(CHALLENGE_SIZE);
        let mut response = auth.response(&challenge);
        response[0] ^= 0xff;
        assert!(!auth.verify_response(&challenge, &response));
    }

    #[test]
    fn test_legacy_response_wrong_length() {
        let auth = auth();
        let challenge = auth.generate_challenge(CHALLENGE_SIZE);
        let response = auth.response(&challenge);
        assert!(!auth.verify_response(&challenge, &response[..19]));
        assert!(!auth.verify_response(&challenge, &[]));
    }

    #[test]
    fn test_hmac_response_roundtrip() {
        let auth = auth();
        let challenge = auth.generate_challenge(CHALLENGE_SIZE);
        let tag = auth.hmac_response(&challenge);
        assert!(auth.verify_response_hmac(&challenge, &tag));
        assert!(auth.verify(&challenge, &tag, true));
        assert!(!auth.verify(&challenge, &tag, false));
    }

    #[test]
    fn test_hmac_wrong_key() {
        let ours = auth();
        let theirs = Authenticator::new("battery staple").unwrap();
        let challenge = ours.generate_challenge(CHALLENGE_SIZE);
        let tag = theirs.hmac_response(&challenge);
        assert!(!ours.verify_response_hmac(&challenge, &tag));
    }

    #[test]
    fn test_hmac_wrong_length() {
        let auth = auth();
        let challenge = auth.generate_challenge(CHALLENGE_SIZE);
        let tag = auth.hmac_response(&challenge);
        assert!(!auth.verify_response_hmac(&challenge, &tag[..31]));
        let mut long = tag.to_vec();
        long.push(0);
        assert!(!auth.verify_response_hmac(&challenge, &long));
    }

    #[test]
    fn test_legacy_response_not_accepted_as_hmac() {
        let auth = auth();
        let challenge = auth.generate_challenge(CHALLENGE_SIZE);
        let legacy = auth.response(&challenge);
        assert!(!auth.verify(&challenge, &legacy, true));
    }

    #[test]
    fn test_debug_hides_passphrase() {
        let debug = format!("{:?}", auth());
        assert!(!debug.contains("horse"));
    }
}
