//! Event signature verification using HMAC-SHA256.
//!
//! Emitters sign the raw request body with a shared secret and send the hex
//! digest in the `X-Signature` header. A GitHub-style `sha256=` prefix is
//! tolerated so the same emitters can be reused.
//!
//! Verification must run over the exact bytes received, before any JSON
//! parsing: re-serialising the body could let a re-encoded payload pass while
//! changing its meaning.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Optional algorithm prefix accepted in front of the hex digest.
const SIGNATURE_PREFIX: &str = "sha256=";

/// Parses a signature header value into raw digest bytes.
///
/// Returns `None` for malformed headers (empty, invalid hex, wrong algorithm
/// prefix). Never panics.
///
/// # Examples
///
/// ```
/// use workflow_dispatch::webhooks::parse_signature_header;
///
/// assert!(parse_signature_header("abcd1234").is_some());
/// assert!(parse_signature_header("sha256=abcd1234").is_some());
/// assert!(parse_signature_header("sha1=abcd1234").is_none());
/// assert!(parse_signature_header("xyz").is_none());
/// assert!(parse_signature_header("").is_none());
/// ```
pub fn parse_signature_header(header: &str) -> Option<Vec<u8>> {
    let hex_sig = header.trim();
    let hex_sig = hex_sig.strip_prefix(SIGNATURE_PREFIX).unwrap_or(hex_sig);

    if hex_sig.is_empty() {
        return None;
    }

    hex::decode(hex_sig).ok()
}

/// Computes the HMAC-SHA256 signature of a payload using the given secret.
pub fn compute_signature(payload: &[u8], secret: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(payload);
    mac.finalize().into_bytes().to_vec()
}

/// Formats a signature as an `X-Signature` header value (bare lowercase hex).
pub fn format_signature_header(signature: &[u8]) -> String {
    hex::encode(signature)
}

/// Verifies an event signature against the raw body and shared secret.
///
/// Returns `true` only if the header decodes to the HMAC-SHA256 of `payload`
/// under `secret`. The comparison is constant-time.
///
/// # Examples
///
/// ```
/// use workflow_dispatch::webhooks::{compute_signature, format_signature_header, verify_signature};
///
/// let body = br#"{"type":"StopDetected"}"#;
/// let header = format_signature_header(&compute_signature(body, b"secret"));
///
/// assert!(verify_signature(body, &header, b"secret"));
/// assert!(!verify_signature(body, &header, b"other"));
/// ```
pub fn verify_signature(payload: &[u8], signature_header: &str, secret: &[u8]) -> bool {
    let expected_signature = match parse_signature_header(signature_header) {
        Some(sig) => sig,
        None => return false,
    };

    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(payload);

    mac.verify_slice(&expected_signature).is_ok()
}
