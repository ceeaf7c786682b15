//! Pure cryptographic primitives over byte buffers: SHA-256, HMAC-SHA256/512,
//! AES-GCM, PBKDF2. No I/O, no global state — callers own keys and nonces.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use sha2::{Digest, Sha256, Sha512};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("ciphertext too short to contain a nonce")]
    CiphertextTooShort,
    #[error("AES-GCM operation failed")]
    Aead,
    #[error("key must be exactly 32 bytes, got {0}")]
    BadKeyLen(usize),
}

/// SHA-256 of `data`, hex-encoded lowercase.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Raw SHA-256 digest.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

type HmacSha256 = Hmac<Sha256>;
type HmacSha512 = Hmac<Sha512>;

/// HMAC-SHA256(key, data), hex-encoded lowercase.
pub fn hmac_sha256_hex(key: &[u8], data: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    hex::encode(mac.finalize().into_bytes())
}

/// HMAC-SHA512(key, data), hex-encoded lowercase.
pub fn hmac_sha512_hex(key: &[u8], data: &[u8]) -> String {
    let mut mac = HmacSha512::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    hex::encode(mac.finalize().into_bytes())
}

/// Derive a 32-byte key from a password and salt via PBKDF2-HMAC-SHA256.
pub fn pbkdf2_derive(password: &[u8], salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut out = [0u8; 32];
    pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut out);
    out
}

/// Encrypt `plaintext` with AES-256-GCM under `key` (32 bytes). Returns
/// `nonce || ciphertext || tag` so the result is self-describing.
pub fn aes_gcm_encrypt(key: &[u8], nonce: &[u8; 12], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if key.len() != 32 {
        return Err(CryptoError::BadKeyLen(key.len()));
    }
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::Aead)?;
    let nonce = Nonce::from_slice(nonce);
    let ciphertext = cipher
        .encrypt(nonce, Payload { msg: plaintext, aad: &[] })
        .map_err(|_| CryptoError::Aead)?;
    let mut out = Vec::with_capacity(12 + ciphertext.len());
    out.extend_from_slice(nonce.as_slice());
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a buffer produced by [`aes_gcm_encrypt`].
pub fn aes_gcm_decrypt(key: &[u8], blob: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if key.len() != 32 {
        return Err(CryptoError::BadKeyLen(key.len()));
    }
    if blob.len() < 12 {
        return Err(CryptoError::CiphertextTooShort);
    }
    let (nonce, ciphertext) = blob.split_at(12);
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::Aead)?;
    cipher
        .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad: &[] })
        .map_err(|_| CryptoError::Aead)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_is_deterministic() {
        assert_eq!(sha256_hex(b"acme"), sha256_hex(b"acme"));
        assert_ne!(sha256_hex(b"acme"), sha256_hex(b"acmeX"));
    }

    #[test]
    fn hmac_matches_known_vector_shape() {
        let sig = hmac_sha256_hex(b"secret", b"{}");
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn aes_gcm_roundtrip() {
        let key = [7u8; 32];
        let nonce = [1u8; 12];
        let plaintext = b"top secret payment metadata";
        let ciphertext = aes_gcm_encrypt(&key, &nonce, plaintext).unwrap();
        let recovered = aes_gcm_decrypt(&key, &ciphertext).unwrap();
        assert_eq!(recovered, plaintext);
    }

    #[test]
    fn aes_gcm_rejects_short_ciphertext() {
        let key = [7u8; 32];
        assert!(matches!(
            aes_gcm_decrypt(&key, b"short"),
            Err(CryptoError::CiphertextTooShort)
        ));
    }

    #[test]
    fn pbkdf2_is_deterministic_per_salt() {
        let a = pbkdf2_derive(b"pw", b"salt1", 1000);
        let b = pbkdf2_derive(b"pw", b"salt1", 1000);
        let c = pbkdf2_derive(b"pw", b"salt2", 1000);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
