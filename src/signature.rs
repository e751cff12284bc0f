//! Webhook payload authentication.
//!
//! Pushed notifications carry an `X-Hub-Signature-256` header of the form
//! `sha256=<lowercase hex>`: an HMAC-SHA256 over the raw request body, keyed
//! by the shared secret agreed with the cloud service at registration time.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Header value prefix fixed by the provider's (GitHub-style) convention.
const SIGNATURE_PREFIX: &str = "sha256=";

/// Check a signature header against the raw request body.
///
/// Returns `false`, never panicking, on a missing prefix, malformed hex,
/// empty secret, or digest mismatch. The comparison is constant-time.
pub fn verify(raw_body: &[u8], signature_header: &str, secret: &str) -> bool {
    if secret.is_empty() {
        return false;
    }
    let Some(provided) = signature_header.strip_prefix(SIGNATURE_PREFIX) else {
        return false;
    };
    let expected = digest(raw_body, secret);
    expected.as_bytes().ct_eq(provided.as_bytes()).into()
}

/// Compute the signature header value for a body.
///
/// Counterpart of [`verify`]; used by tests and tooling that simulate the
/// cloud sender.
pub fn sign(raw_body: &[u8], secret: &str) -> String {
    format!("{SIGNATURE_PREFIX}{}", digest(raw_body, secret))
}

fn digest(raw_body: &[u8], secret: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(raw_body);
    hex::encode(&mac.finalize().into_bytes())
}

/// Encode bytes as hex (avoids adding a hex crate dependency).
mod hex {
    pub fn encode(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }
}
