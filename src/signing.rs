//! HMAC-SHA256 payload signing and verification.
//!
//! The signature covers the exact bytes transmitted as the request body.
//! Payload serialization is deterministic (serde_json orders object keys),
//! so re-serializing the same logical payload never changes the signature.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;

use crate::error::VerificationError;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the hex HMAC-SHA256 signature of the request body.
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

/// Entropy of generated signing secrets, in bytes.
const SECRET_BYTES: usize = 32;

/// Serialize a payload to the canonical bytes used for both the request
/// body and the signature.
pub fn payload_bytes(payload: &serde_json::Value) -> Vec<u8> {
    serde_json::to_vec(payload).unwrap_or_default()
}

/// Compute the lowercase hex HMAC-SHA256 signature of `payload` under
/// `secret`.
pub fn sign(secret: &str, payload: &[u8]) -> String {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a hex signature against `payload` in constant time.
pub fn verify(secret: &str, payload: &[u8], signature_hex: &str) -> bool {
    let Ok(raw) = hex::decode(signature_hex) else {
        return false;
    };
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(payload);
    mac.verify_slice(&raw).is_ok()
}

/// Verify an incoming webhook request from its headers and body.
///
/// Receivers can pass any iterable of header name/value pairs; the
/// signature header is matched case-insensitively.
pub fn verify_request<'a, I>(
    headers: I,
    body: &[u8],
    secret: &str,
) -> Result<(), VerificationError>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let signature = headers
        .into_iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(SIGNATURE_HEADER))
        .map(|(_, value)| value)
        .ok_or(VerificationError::MissingSignature)?;

    if verify(secret, body, signature) {
        Ok(())
    } else {
        Err(VerificationError::InvalidSignature)
    }
}

/// Generate a URL-safe signing secret from OS entropy.
pub fn generate_secret() -> String {
    let mut buf = [0u8; SECRET_BYTES];
    OsRng.fill_bytes(&mut buf);
    URL_SAFE_NO_PAD.encode(buf)
}
