//! Envelope encoding and decoding.
//!
//! An envelope is `{cmd, data, checksum}` where `data` is the ciphertext of
//! the plaintext payload and `checksum` binds command, ciphertext and
//! plaintext together. The JSON form is deflated and base64 encoded into the
//! text blob carried by a transport text frame.

use std::io::{Read, Write};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::crypto::{ct_eq, open_text, seal_text, sha384_hex, sha512_hex, NONCE_SIZE, TAG_SIZE};
use crate::error::EnvelopeError;

/// Default cap on the archived blob (16 MB)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1000 * 1000;

/// Headroom allowed on top of the cap when inflating
pub const INFLATE_HEADROOM: usize = 1000 * 1000;

const ENVELOPE_JSON_FRAME: &str = r#"{"cmd":"","data":"","checksum":""}"#;
const CHECKSUM_HEX_LEN: usize = 128;

/// Wire envelope as serialized inside the archive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Command, never encrypted
    pub cmd: String,
    /// Ciphertext of the payload
    pub data: String,
    /// Integrity checksum
    pub checksum: String,
}

/// Envelope after successful verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedEnvelope {
    /// Command
    pub cmd: String,
    /// Decrypted payload
    pub data: String,
}

/// Keys an envelope codec operates with
#[derive(Clone)]
pub struct EnvelopeKeys<'a> {
    /// Long-lived operator key
    pub long_lived: &'a str,
    /// Per-connection secret, empty before the handshake completes
    pub shared_secret: &'a str,
}

impl<'a> EnvelopeKeys<'a> {
    /// Keys for pre-handshake traffic
    pub fn pre_handshake(long_lived: &'a str) -> Self {
        Self {
            long_lived,
            shared_secret: "",
        }
    }

    /// Keys for an established session
    pub fn session(long_lived: &'a str, shared_secret: &'a str) -> Self {
        Self {
            long_lived,
            shared_secret,
        }
    }

    fn message_key(&self, cmd: &str) -> String {
        format!(
            "{}{}:{}",
            self.long_lived,
            self.shared_secret,
            sha384_hex(cmd.as_bytes())
        )
    }
}

impl std::fmt::Debug for EnvelopeKeys<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeKeys")
            .field("shared_secret_set", &!self.shared_secret.is_empty())
            .finish_non_exhaustive()
    }
}

fn checksum(cmd: &str, ciphertext: &str, plaintext: &str) -> String {
    sha512_hex(format!("{}\n{}\n{}", cmd, ciphertext, plaintext).as_bytes())
}

/// Compose an envelope blob
pub fn compose(
    cmd: &str,
    plaintext: &str,
    keys: &EnvelopeKeys<'_>,
    max_size: usize,
) -> Result<String, EnvelopeError> {
    let cmd = cmd.trim();
    if cmd.is_empty() {
        return Err(EnvelopeError::EmptyCommand);
    }

    let ciphertext = seal_text(plaintext, &keys.message_key(cmd))?;
    let envelope = Envelope {
        cmd: cmd.to_string(),
        checksum: checksum(cmd, &ciphertext, plaintext),
        data: ciphertext,
    };

    let json = serde_json::to_vec(&envelope).map_err(|_| EnvelopeError::DecodeFailed)?;
    let blob = archive(&json)?;
    if blob.len() > max_size {
        return Err(EnvelopeError::OversizedMessage {
            size: blob.len(),
            limit: max_size,
        });
    }

    trace!("Composed {} envelope: {} bytes archived", cmd, blob.len());
    Ok(blob)
}

/// Largest blob [`compose`] can produce for a validated command and a
/// payload of `plaintext_len` bytes, whatever the keys and nonce.
///
/// The payload is encrypted before archiving, so deflate gains almost
/// nothing and the bound assumes it gains nothing at all.
pub fn envelope_size_bound(cmd: &str, plaintext_len: usize) -> usize {
    let sealed = base64_len(NONCE_SIZE + plaintext_len + TAG_SIZE);
    let json = ENVELOPE_JSON_FRAME.len() + cmd.trim().len() + sealed + CHECKSUM_HEX_LEN;
    base64_len(deflate_bound(json))
}

fn base64_len(n: usize) -> usize {
    n.div_ceil(3) * 4
}

/// Worst-case deflate output, stored blocks plus the encoder's slack
fn deflate_bound(n: usize) -> usize {
    (128 + n + n / 10).max(128 + n + (n / (31 * 1024) + 1) * 5)
}

/// Parse and verify an envelope blob
pub fn parse(
    blob: &str,
    keys: &EnvelopeKeys<'_>,
    max_size: usize,
) -> Result<ParsedEnvelope, EnvelopeError> {
    let envelope = unarchive_envelope(blob, max_size)?;

    // An undecryptable body cannot produce the plaintext the checksum covers.
    let plaintext = open_text(&envelope.data, &keys.message_key(&envelope.cmd))
        .ok_or(EnvelopeError::InvalidChecksum)?;

    let expected = checksum(&envelope.cmd, &envelope.data, &plaintext);
    if !ct_eq(&expected, &envelope.checksum) {
        return Err(EnvelopeError::InvalidChecksum);
    }

    Ok(ParsedEnvelope {
        cmd: envelope.cmd,
        data: plaintext,
    })
}

/// Decompress and structurally decode a blob without verifying it
pub fn unarchive_envelope(blob: &str, max_size: usize) -> Result<Envelope, EnvelopeError> {
    let blob = blob.trim();
    if blob.is_empty() {
        return Err(EnvelopeError::EmptyMessage);
    }

    let json = unarchive(blob, max_size + INFLATE_HEADROOM)?;
    if json.iter().all(u8::is_ascii_whitespace) {
        return Err(EnvelopeError::UnarchiveFailed);
    }

    let envelope: Envelope =
        serde_json::from_slice(&json).map_err(|_| EnvelopeError::DecodeFailed)?;
    if envelope.cmd.trim().is_empty() {
        return Err(EnvelopeError::DecodeFailed);
    }
    Ok(envelope)
}

/// Deflate then base64 encode
pub fn archive(raw: &[u8]) -> Result<String, EnvelopeError> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(raw)
        .map_err(|_| EnvelopeError::UnarchiveFailed)?;
    let compressed = encoder.finish().map_err(|_| EnvelopeError::UnarchiveFailed)?;
    Ok(STANDARD.encode(compressed))
}

/// Base64 decode then inflate, refusing output larger than `limit`
pub fn unarchive(blob: &str, limit: usize) -> Result<Vec<u8>, EnvelopeError> {
    let compressed = STANDARD
        .decode(blob.trim())
        .map_err(|_| EnvelopeError::UnarchiveFailed)?;

    let mut out = Vec::new();
    DeflateDecoder::new(compressed.as_slice())
        .take(limit as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|_| EnvelopeError::UnarchiveFailed)?;

    if out.len() > limit {
        return Err(EnvelopeError::UnarchiveFailed);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "0123456789abcdef-long-lived";
    const SECRET: &str = "9f1c2a";

    fn keys() -> EnvelopeKeys<'static> {
        EnvelopeKeys::session(KEY, SECRET)
    }

    fn tamper_field(blob: &str, field: &str) -> String {
        let mut env = unarchive_envelope(blob, DEFAULT_MAX_MESSAGE_SIZE).unwrap();
        let target = match field {
            "data" => &mut env.data,
            "checksum" => &mut env.checksum,
            _ => unreachable!(),
        };
        let mut bytes = target.clone().into_bytes();
        let idx = bytes.len() / 2;
        bytes[idx] = if bytes[idx] == b'A' { b'B' } else { b'A' };
        *target = String::from_utf8(bytes).unwrap();
        archive(&serde_json::to_vec(&env).unwrap()).unwrap()
    }

    #[test]
    fn test_roundtrip() {
        for (cmd, data) in [
            ("REPORT", "hello"),
            ("<PING>", ""),
            ("sync.files-v2", "multi\nline\npayload ✓"),
        ] {
            let blob = compose(cmd, data, &keys(), DEFAULT_MAX_MESSAGE_SIZE).unwrap();
            let parsed = parse(&blob, &keys(), DEFAULT_MAX_MESSAGE_SIZE).unwrap();
            assert_eq!(parsed.cmd, cmd);
            assert_eq!(parsed.data, data);
        }
    }

    #[test]
    fn test_command_is_not_encrypted() {
        let blob = compose("REPORT", "secret payload", &keys(), DEFAULT_MAX_MESSAGE_SIZE).unwrap();
        let env = unarchive_envelope(&blob, DEFAULT_MAX_MESSAGE_SIZE).unwrap();
        assert_eq!(env.cmd, "REPORT");
        assert!(!env.data.contains("secret payload"));
    }

    #[test]
    fn test_empty_command_rejected() {
        assert_eq!(
            compose("   ", "x", &keys(), DEFAULT_MAX_MESSAGE_SIZE),
            Err(EnvelopeError::EmptyCommand)
        );
    }

    #[test]
    fn test_empty_and_corrupt_blobs() {
        assert_eq!(
            parse("  ", &keys(), DEFAULT_MAX_MESSAGE_SIZE),
            Err(EnvelopeError::EmptyMessage)
        );
        assert_eq!(
            parse("not base64 at all!", &keys(), DEFAULT_MAX_MESSAGE_SIZE),
            Err(EnvelopeError::UnarchiveFailed)
        );
        let not_json = archive(b"{broken").unwrap();
        assert_eq!(
            parse(&not_json, &keys(), DEFAULT_MAX_MESSAGE_SIZE),
            Err(EnvelopeError::DecodeFailed)
        );
    }

    #[test]
    fn test_tampered_ciphertext_detected() {
        let blob = compose("REPORT", "hello", &keys(), DEFAULT_MAX_MESSAGE_SIZE).unwrap();
        let tampered = tamper_field(&blob, "data");
        assert_eq!(
            parse(&tampered, &keys(), DEFAULT_MAX_MESSAGE_SIZE),
            Err(EnvelopeError::InvalidChecksum)
        );
    }

    #[test]
    fn test_tampered_checksum_detected() {
        let blob = compose("REPORT", "hello", &keys(), DEFAULT_MAX_MESSAGE_SIZE).unwrap();
        let tampered = tamper_field(&blob, "checksum");
        assert_eq!(
            parse(&tampered, &keys(), DEFAULT_MAX_MESSAGE_SIZE),
            Err(EnvelopeError::InvalidChecksum)
        );
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let blob = compose("REPORT", "hello", &keys(), DEFAULT_MAX_MESSAGE_SIZE).unwrap();
        let other = EnvelopeKeys::session(KEY, "another-secret");
        assert_eq!(
            parse(&blob, &other, DEFAULT_MAX_MESSAGE_SIZE),
            Err(EnvelopeError::InvalidChecksum)
        );
    }

    #[test]
    fn test_size_bound_covers_compose() {
        let mut seed = 0x2545_f491_u32;
        for len in [0usize, 1, 17, 1000, 40_000, 200_000] {
            // xorshift filler so the payload itself does not compress
            let plaintext: String = (0..len)
                .map(|_| {
                    seed ^= seed << 13;
                    seed ^= seed >> 17;
                    seed ^= seed << 5;
                    char::from(b'!' + (seed % 90) as u8)
                })
                .collect();
            let blob = compose("REPORT", &plaintext, &keys(), usize::MAX).unwrap();
            let bound = envelope_size_bound("REPORT", len);
            assert!(blob.len() <= bound, "len {}: {} > {}", len, blob.len(), bound);
        }
        assert!(envelope_size_bound("REPORT", 10) < envelope_size_bound("REPORT", 11_000));
    }

    #[test]
    fn test_oversize_rejected() {
        // Random-looking payload so deflate cannot shrink it below the cap.
        let payload: String = (0..4096u32)
            .map(|i| char::from(b'!' + ((i.wrapping_mul(2654435761) >> 7) % 90) as u8))
            .collect();
        let err = compose("REPORT", &payload, &keys(), 1024).unwrap_err();
        assert!(matches!(err, EnvelopeError::OversizedMessage { limit: 1024, .. }));
    }

    #[test]
    fn test_inflate_limit() {
        let big = vec![b'a'; 10_000];
        let blob = archive(&big).unwrap();
        assert_eq!(unarchive(&blob, 10_000).unwrap().len(), 10_000);
        assert_eq!(unarchive(&blob, 9_999), Err(EnvelopeError::UnarchiveFailed));
    }
}
