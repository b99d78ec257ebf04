//! Cryptographic primitives for EasyShare.
//!
//! This module provides:
//! - Passphrase key derivation (iterated SHA-512 with an id-derived salt)
//! - Authenticated encryption (XSalsa20-Poly1305) for the data plane
//! - Challenge/response proof of secret possession for pairing
//! - Truncated SHA-512 checksums, batch and streaming
//! - Random identifier generation
//!
//! ## Security Model
//!
//! - The pairing passphrase never crosses the wire; each side derives the
//!   same 32-byte secret from `(passphrase, sorted device ids)`
//! - Possession is proven with a hash over a random 32-byte challenge
//! - Text and chunk payloads are sealed with a fresh 24-byte nonce per call

use base64::prelude::*;
use crypto_secretbox::aead::{Aead, KeyInit};
use crypto_secretbox::{Key, Nonce, XSalsa20Poly1305};
use rand::RngCore;
use sha2::{Digest, Sha512};

use crate::error::{Error, Result};
use crate::KDF_ITERATIONS;

/// Byte length of the AEAD nonce.
pub const NONCE_SIZE: usize = 24;

/// Byte length of a derived shared secret.
pub const SECRET_SIZE: usize = 32;

/// Byte length of the truncated checksum digest.
pub const CHECKSUM_SIZE: usize = 16;

/// Generate a device id: 16 random bytes, URL-safe base64 without padding.
#[must_use]
pub fn generate_device_id() -> String {
    let mut raw = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut raw);
    BASE64_URL_SAFE_NO_PAD.encode(raw)
}

/// Generate a message id: 8 random bytes, URL-safe base64 without padding.
#[must_use]
pub fn generate_message_id() -> String {
    let mut raw = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut raw);
    BASE64_URL_SAFE_NO_PAD.encode(raw)
}

/// Derive the pair-shared secret from a passphrase and the two device ids.
///
/// The ids are sorted lexicographically so both peers derive the same
/// secret regardless of who initiated. The salt is the first 16 bytes of
/// `SHA-512("<low>:<high>")`; the passphrase concatenated with the salt is
/// then hashed [`KDF_ITERATIONS`] times and the first 32 bytes of the
/// final digest become the secret.
#[must_use]
pub fn derive_shared_secret(passphrase: &str, id_a: &str, id_b: &str) -> [u8; SECRET_SIZE] {
    let (low, high) = if id_a <= id_b { (id_a, id_b) } else { (id_b, id_a) };

    let salt_digest = Sha512::digest(format!("{low}:{high}").as_bytes());
    let salt = &salt_digest[..16];

    let mut buf = Vec::with_capacity(passphrase.len() + salt.len());
    buf.extend_from_slice(passphrase.as_bytes());
    buf.extend_from_slice(salt);

    for _ in 0..KDF_ITERATIONS {
        buf = Sha512::digest(&buf).to_vec();
    }

    let mut secret = [0u8; SECRET_SIZE];
    secret.copy_from_slice(&buf[..SECRET_SIZE]);
    secret
}

/// Seal plaintext with the session secret.
///
/// Output layout: `[nonce_len(1)][nonce][ciphertext]` with a fresh random
/// 24-byte nonce per call. The ciphertext carries the 16-byte Poly1305
/// authenticator.
///
/// # Errors
///
/// Returns an error if encryption fails.
pub fn seal(plaintext: &[u8], secret: &[u8; SECRET_SIZE]) -> Result<Vec<u8>> {
    let cipher = XSalsa20Poly1305::new(Key::from_slice(secret));
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| Error::Internal("encryption failure".to_string()))?;

    let mut out = Vec::with_capacity(1 + NONCE_SIZE + ciphertext.len());
    out.push(NONCE_SIZE as u8);
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open a sealed payload produced by [`seal`].
///
/// # Errors
///
/// Returns [`Error::DecryptFailed`] if the framing is malformed or the
/// authenticator does not verify. No partial plaintext is ever returned.
pub fn open(sealed: &[u8], secret: &[u8; SECRET_SIZE]) -> Result<Vec<u8>> {
    let nonce_len = *sealed.first().ok_or(Error::DecryptFailed)? as usize;
    if nonce_len != NONCE_SIZE || sealed.len() < 1 + NONCE_SIZE {
        return Err(Error::DecryptFailed);
    }

    let nonce = Nonce::from_slice(&sealed[1..1 + NONCE_SIZE]);
    let cipher = XSalsa20Poly1305::new(Key::from_slice(secret));

    cipher
        .decrypt(nonce, &sealed[1 + NONCE_SIZE..])
        .map_err(|_| Error::DecryptFailed)
}

/// Generate a random 32-byte pairing challenge.
#[must_use]
pub fn generate_challenge() -> [u8; 32] {
    let mut challenge = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut challenge);
    challenge
}

/// Compute the proof for a pairing challenge: the first 32 bytes of
/// `SHA-512(challenge || secret)`.
#[must_use]
pub fn challenge_response(challenge: &[u8], secret: &[u8; SECRET_SIZE]) -> [u8; 32] {
    let mut hasher = Sha512::new();
    hasher.update(challenge);
    hasher.update(secret);
    let digest = hasher.finalize();

    let mut response = [0u8; 32];
    response.copy_from_slice(&digest[..32]);
    response
}

/// Verify a pairing response against a recomputation.
#[must_use]
pub fn verify_response(challenge: &[u8], secret: &[u8; SECRET_SIZE], response: &[u8]) -> bool {
    constant_time_eq(&challenge_response(challenge, secret), response)
}

/// Compute the batch checksum of a byte slice: base64 of the first 16
/// bytes of its SHA-512 digest.
#[must_use]
pub fn checksum(data: &[u8]) -> String {
    BASE64_STANDARD.encode(&Sha512::digest(data)[..CHECKSUM_SIZE])
}

/// Incremental counterpart of [`checksum`] for data that is not held in
/// memory at once. `digest()` produces the same string as the batch form.
#[derive(Debug, Default)]
pub struct StreamingChecksum {
    hasher: Sha512,
}

impl StreamingChecksum {
    /// Create a fresh streaming checksum.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed more bytes into the checksum.
    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    /// Finish and produce the truncated base64 digest.
    #[must_use]
    pub fn digest(self) -> String {
        BASE64_STANDARD.encode(&self.hasher.finalize()[..CHECKSUM_SIZE])
    }
}

/// Compare two byte slices without an early exit.
///
/// Every position is visited and the differences are OR-folded into one
/// accumulator, so the runtime does not reveal where a proof first
/// diverges.
#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b)
            .fold(0u8, |acc, (x, y)| acc | (x ^ y))
            == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_shared_secret_symmetric() {
        let a = derive_shared_secret("horse battery", "alpha", "bravo");
        let b = derive_shared_secret("horse battery", "bravo", "alpha");
        assert_eq!(a, b, "id order must not matter");
    }

    #[test]
    fn test_derive_shared_secret_passphrase_sensitivity() {
        let a = derive_shared_secret("horse battery", "alpha", "bravo");
        let b = derive_shared_secret("horse battery!", "alpha", "bravo");
        assert_ne!(a, b);
    }

    #[test]
    fn test_derive_shared_secret_id_sensitivity() {
        let a = derive_shared_secret("pw", "alpha", "bravo");
        let b = derive_shared_secret("pw", "alpha", "charlie");
        assert_ne!(a, b);
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let secret = derive_shared_secret("pw", "a", "b");
        let plaintext = b"attack at dawn";

        let sealed = seal(plaintext, &secret).expect("seal");
        assert_eq!(sealed[0] as usize, NONCE_SIZE);
        assert_eq!(sealed.len(), 1 + NONCE_SIZE + plaintext.len() + 16);

        let opened = open(&sealed, &secret).expect("open");
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn test_open_with_wrong_key_fails() {
        let secret = derive_shared_secret("pw", "a", "b");
        let other = derive_shared_secret("pw2", "a", "b");

        let sealed = seal(b"payload", &secret).expect("seal");
        assert!(matches!(open(&sealed, &other), Err(Error::DecryptFailed)));
    }

    #[test]
    fn test_open_tampered_fails() {
        let secret = derive_shared_secret("pw", "a", "b");
        let mut sealed = seal(b"payload", &secret).expect("seal");
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(open(&sealed, &secret).is_err());
    }

    #[test]
    fn test_open_truncated_fails() {
        let secret = derive_shared_secret("pw", "a", "b");
        assert!(open(&[], &secret).is_err());
        assert!(open(&[24, 1, 2, 3], &secret).is_err());
    }

    #[test]
    fn test_nonce_freshness() {
        let secret = derive_shared_secret("pw", "a", "b");
        let s1 = seal(b"x", &secret).expect("seal");
        let s2 = seal(b"x", &secret).expect("seal");
        assert_ne!(s1, s2, "each seal must use a fresh nonce");
    }

    #[test]
    fn test_challenge_response_verifies() {
        let secret = derive_shared_secret("pw", "a", "b");
        let challenge = generate_challenge();

        let response = challenge_response(&challenge, &secret);
        assert!(verify_response(&challenge, &secret, &response));

        let wrong = derive_shared_secret("other", "a", "b");
        assert!(!verify_response(&challenge, &wrong, &response));
    }

    #[test]
    fn test_checksum_batch_matches_streaming() {
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();

        let batch = checksum(&data);

        let mut streaming = StreamingChecksum::new();
        for piece in data.chunks(7_919) {
            streaming.update(piece);
        }
        assert_eq!(batch, streaming.digest());
    }

    #[test]
    fn test_checksum_is_truncated_base64() {
        let sum = checksum(b"hello");
        let raw = BASE64_STANDARD.decode(&sum).expect("valid base64");
        assert_eq!(raw.len(), CHECKSUM_SIZE);
    }

    #[test]
    fn test_id_generation() {
        let device = generate_device_id();
        let message = generate_message_id();

        // 16 bytes -> 22 chars, 8 bytes -> 11 chars, no padding
        assert_eq!(device.len(), 22);
        assert_eq!(message.len(), 11);
        assert!(!device.contains('='));
        assert_ne!(generate_device_id(), device);
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"same", b"same"));
        assert!(!constant_time_eq(b"same", b"sama"));
        assert!(!constant_time_eq(b"same", b"sam"));
    }
}
