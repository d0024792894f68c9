//! Inbound event authentication.
//!
//! Every event is signed by its emitter with HMAC-SHA256 over the raw body.

pub mod signature;

pub use signature::{
    compute_signature, format_signature_header, parse_signature_header, verify_signature,
};
