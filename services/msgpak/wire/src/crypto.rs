//! Hash and symmetric cipher primitives used by the envelope codec and the
//! handshake.
//!
//! Key material is always a string (the long-lived shared key, the
//! per-connection secret and a command digest concatenated); it is stretched
//! into a ChaCha20-Poly1305 key with HKDF-SHA256 before use.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256, Sha384, Sha512};
use subtle::ConstantTimeEq;

use crate::error::EnvelopeError;

/// ChaCha20-Poly1305 nonce length
pub const NONCE_SIZE: usize = 12;

/// Poly1305 tag length
pub const TAG_SIZE: usize = 16;

const ENVELOPE_KDF_INFO: &[u8] = b"msgpak/envelope/v1";

/// Lowercase hex SHA-256 digest
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Lowercase hex SHA-384 digest
pub fn sha384_hex(data: &[u8]) -> String {
    hex::encode(Sha384::digest(data))
}

/// Lowercase hex SHA-512 digest
pub fn sha512_hex(data: &[u8]) -> String {
    hex::encode(Sha512::digest(data))
}

/// Constant-time string equality
pub fn ct_eq(a: &str, b: &str) -> bool {
    a.len() == b.len() && bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

fn derive_key(key_material: &str) -> Result<[u8; 32], EnvelopeError> {
    let hk = Hkdf::<Sha256>::new(None, key_material.as_bytes());
    let mut key = [0u8; 32];
    hk.expand(ENVELOPE_KDF_INFO, &mut key)
        .map_err(|_| EnvelopeError::Crypto)?;
    Ok(key)
}

/// Encrypt `plaintext` under `key_material`, returning base64(nonce || sealed)
pub fn seal_text(plaintext: &str, key_material: &str) -> Result<String, EnvelopeError> {
    let key = derive_key(key_material)?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));

    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);

    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
        .map_err(|_| EnvelopeError::Crypto)?;

    let mut out = Vec::with_capacity(NONCE_SIZE + sealed.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(STANDARD.encode(out))
}

/// Decrypt a value produced by [`seal_text`]. Any failure (bad base64, short
/// input, tag mismatch, non UTF-8 plaintext) yields `None`.
pub fn open_text(sealed_b64: &str, key_material: &str) -> Option<String> {
    let raw = STANDARD.decode(sealed_b64.trim()).ok()?;
    if raw.len() < NONCE_SIZE {
        return None;
    }
    let (nonce, sealed) = raw.split_at(NONCE_SIZE);

    let key = derive_key(key_material).ok()?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    let plain = cipher.decrypt(Nonce::from_slice(nonce), sealed).ok()?;

    String::from_utf8(plain).ok()
}
