//! Balance integrity code
//!
//! HMAC-SHA256 over `"<balance with 2 decimals>::<version>"`, hex encoded.
//! A row whose stored code does not match was written outside the ledger
//! protocol (or lost an update) and must not be trusted.

use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use sha2::Sha256;

use crate::money::to_cents;

type HmacSha256 = Hmac<Sha256>;

/// Signs and verifies balance rows with a shared secret.
#[derive(Clone)]
pub struct IntegritySigner {
    mac: HmacSha256,
}

impl IntegritySigner {
    pub fn new(secret: impl AsRef<[u8]>) -> Result<Self, hmac::digest::InvalidLength> {
        Ok(Self {
            mac: HmacSha256::new_from_slice(secret.as_ref())?,
        })
    }

    fn content(balance: Decimal, version: i64) -> String {
        format!("{}::{}", to_cents(balance), version)
    }

    /// Compute the integrity code for a (balance, version) pair.
    pub fn sign(&self, balance: Decimal, version: i64) -> String {
        let mut mac = self.mac.clone();
        mac.update(Self::content(balance, version).as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Constant-time check of a stored code.
    pub fn verify(&self, balance: Decimal, version: i64, code: &str) -> bool {
        let Ok(raw) = hex::decode(code) else {
            return false;
        };
        let mut mac = self.mac.clone();
        mac.update(Self::content(balance, version).as_bytes());
        mac.verify_slice(&raw).is_ok()
    }
}

impl std::fmt::Debug for IntegritySigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("IntegritySigner(..)")
    }
}
