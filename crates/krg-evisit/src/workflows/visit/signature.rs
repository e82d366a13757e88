//! Keyed signing primitive behind the permit QR codes.

use std::fmt;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::config::SecurityConfig;

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 signer holding the process-wide permit key.
#[derive(Clone)]
pub struct SignatureService {
    keyed: HmacSha256,
}

impl SignatureService {
    pub fn new(key: &[u8]) -> Self {
        let keyed = match HmacSha256::new_from_slice(key) {
            Ok(mac) => mac,
            Err(_) => unreachable!("HMAC accepts keys of any length"),
        };
        Self { keyed }
    }

    pub fn from_config(config: &SecurityConfig) -> Self {
        Self::new(config.permit_secret())
    }

    /// Canonical string a permit signature covers.
    pub fn permit_message(application_id: &str, timestamp: &str) -> String {
        format!("{application_id}:{timestamp}")
    }

    /// Lowercase hex digest of `message`.
    pub fn sign(&self, message: &[u8]) -> String {
        let mut mac = self.keyed.clone();
        mac.update(message);
        hex::encode(mac.finalize().into_bytes())
    }

    /// Constant-time comparison of `digest` against a freshly computed signature.
    pub fn verify(&self, message: &[u8], digest: &str) -> bool {
        let expected = self.sign(message);
        expected.as_bytes().ct_eq(digest.as_bytes()).into()
    }
}

impl fmt::Debug for SignatureService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignatureService").finish_non_exhaustive()
    }
}
