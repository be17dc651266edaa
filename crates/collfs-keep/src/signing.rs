//! Locator signing with a shared key and TTL.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{KeepError, KeepResult};
use crate::locator::{Locator, Signature};

const SIGNING_CONTEXT: &str = "collfs 2024-06 block locator signature";

/// Seconds since the Unix epoch.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Signs and verifies locators for a given shared key.
#[derive(Clone)]
pub struct Signer {
    key: [u8; 32],
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer").finish_non_exhaustive()
    }
}

impl Signer {
    /// Derive a signer from arbitrary shared key material.
    pub fn new(shared_key: &[u8]) -> Self {
        Self {
            key: blake3::derive_key(SIGNING_CONTEXT, shared_key),
        }
    }

    fn mac(&self, locator: &Locator, token: &str, expires_at: u64) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new_keyed(&self.key);
        hasher.update(locator.hash_hex().as_bytes());
        hasher.update(b"@");
        hasher.update(token.as_bytes());
        hasher.update(b"@");
        hasher.update(format!("{:08x}", expires_at).as_bytes());
        *hasher.finalize().as_bytes()
    }

    /// Sign `locator` for `token`, valid until `expires_at`.
    pub fn sign(&self, locator: &Locator, token: &str, expires_at: u64) -> Locator {
        let mac = self.mac(locator, token, expires_at);
        locator
            .unsigned()
            .with_signature(Signature { mac, expires_at })
    }

    /// Sign `locator` for `token`, valid for `ttl` from `now`.
    pub fn sign_for(&self, locator: &Locator, token: &str, ttl: Duration, now: u64) -> Locator {
        self.sign(locator, token, now.saturating_add(ttl.as_secs()))
    }

    /// Check a signed locator.
    ///
    /// Fails with `PermissionDenied` when unsigned or the signature does not
    /// match `token`, and with `Expired` when the signature is valid but past
    /// its expiry.
    pub fn verify(&self, locator: &Locator, token: &str, now: u64) -> KeepResult<()> {
        let sig = locator
            .signature()
            .ok_or_else(|| KeepError::permission_denied(format!("unsigned locator {}", locator)))?;
        let expected = blake3::Hash::from(self.mac(locator, token, sig.expires_at));
        if expected != blake3::Hash::from(sig.mac) {
            return Err(KeepError::permission_denied(format!(
                "bad signature on {}",
                locator.unsigned()
            )));
        }
        if sig.expires_at <= now {
            return Err(KeepError::Expired(locator.unsigned().to_string()));
        }
        Ok(())
    }
}
