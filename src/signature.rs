//! GitHub webhook signature verification

use hex::decode as hex_decode;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_PREFIX: &str = "sha256=";

/// Verify `X-Hub-Signature-256` against the raw request body.
///
/// An empty `secret` disables verification and always returns true; the
/// caller is responsible for warning about it. The digest comparison is
/// constant-time.
pub fn verify(payload: &[u8], provided_signature: &str, secret: &str) -> bool {
    if secret.is_empty() {
        return true;
    }

    let Some(hex_signature) = provided_signature.strip_prefix(SIGNATURE_PREFIX) else {
        debug!("Signature header missing '{}' prefix", SIGNATURE_PREFIX);
        return false;
    };

    let provided = match hex_decode(hex_signature) {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!("Signature is not valid hex: {}", e);
            return false;
        }
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(payload);
    mac.verify_slice(&provided).is_ok()
}

/// Compute the header value GitHub would send for `payload`.
pub fn sign(payload: &[u8], secret: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(payload);
    format!("{}{}", SIGNATURE_PREFIX, hex::encode(mac.finalize().into_bytes()))
}
