//! Tagged text encoding for keys and signed payloads.
//!
//! Every encoded value is a short ASCII tag naming its role followed by a
//! URL-safe, padding-free base64 body. Decoding checks the tag first, so a
//! public key can never be read back as a private key or a signed envelope.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use thiserror::Error;

/// Ed25519 private key (seed).
pub const PRIVATE_KEY_TAG: &str = "k.";
/// Ed25519 public key.
pub const PUBLIC_KEY_TAG: &str = "p.";
/// Signed envelope: `s.<message>/<signature>`.
pub const SIGNED_TAG: &str = "s.";
/// X25519 ephemeral public key.
pub const EPHEMERAL_KEY_TAG: &str = "x.";
/// Session MAC on an application frame.
pub const MAC_TAG: &str = "m.";

/// Encode `bytes` as `<tag><base64url>`. An empty tag yields bare base64.
pub fn encode_bytes(tag: &str, bytes: &[u8]) -> String {
    let mut out = String::with_capacity(tag.len() + bytes.len() * 4 / 3 + 4);
    out.push_str(tag);
    URL_SAFE_NO_PAD.encode_string(bytes, &mut out);
    out
}

/// Decode a `<tag><base64url>` string, rejecting a missing or different tag.
pub fn decode_bytes(tag: &str, s: &str) -> Result<Vec<u8>, EncodingError> {
    let body = s.strip_prefix(tag).ok_or_else(|| EncodingError::WrongTag {
        expected: tag.to_string(),
        got: s.chars().take(tag.len().max(2)).collect(),
    })?;
    Ok(URL_SAFE_NO_PAD.decode(body)?)
}

/// Decode into a fixed-size array, as needed for keys.
pub fn decode_array<const N: usize>(tag: &str, s: &str) -> Result<[u8; N], EncodingError> {
    let bytes = decode_bytes(tag, s)?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| EncodingError::WrongLength { expected: N, got: len })
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum EncodingError {
    #[error("expected tag {expected:?}, found {got:?}")]
    WrongTag { expected: String, got: String },

    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("wrong decoded length: expected {expected} bytes, got {got}")]
    WrongLength { expected: usize, got: usize },
}
