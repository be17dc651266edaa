//! Content-derived block locators.
//!
//! A locator names an immutable block by the BLAKE3 hash of its bytes and
//! its size, optionally followed by hints:
//!
//! ```text
//! 5d41402abc4b2a76b9719d911017c5925d41402abc4b2a76b9719d911017c592+5+A<sig>@65f1c2a0
//! └──────────────────────── hash ─────────────────────────────────┘ └size┘ └─signature hint─┘
//! ```
//!
//! The signature hint (`A<64 hex>@<hex unix expiry>`) authorizes the holder
//! to fetch the block until the expiry. Unknown hints are carried verbatim.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{KeepError, KeepResult};

/// BLAKE3 hash type (32 bytes).
pub type Blake3Hash = [u8; 32];

/// Signature attached to a locator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signature {
    /// Keyed hash over `hash@token@expiry`.
    pub mac: [u8; 32],
    /// Expiry, seconds since the Unix epoch.
    pub expires_at: u64,
}

/// Locator for an immutable block.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Locator {
    hash: Blake3Hash,
    size: u64,
    signature: Option<Signature>,
    hints: Vec<String>,
}

impl Locator {
    /// Build an unsigned locator from its parts.
    pub fn new(hash: Blake3Hash, size: u64) -> Self {
        Self {
            hash,
            size,
            signature: None,
            hints: Vec::new(),
        }
    }

    /// The locator for `data`.
    pub fn for_data(data: &[u8]) -> Self {
        Self::new(*blake3::hash(data).as_bytes(), data.len() as u64)
    }

    /// The locator of the zero-length block.
    pub fn empty() -> Self {
        Self::for_data(&[])
    }

    pub fn hash(&self) -> &Blake3Hash {
        &self.hash
    }

    /// Hex form of the content hash.
    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }

    /// Block size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn signature(&self) -> Option<&Signature> {
        self.signature.as_ref()
    }

    /// Hints other than the signature, in their original order.
    pub fn hints(&self) -> &[String] {
        &self.hints
    }

    /// Same block, without a signature.
    pub fn unsigned(&self) -> Locator {
        Locator {
            signature: None,
            ..self.clone()
        }
    }

    /// Same block, carrying `signature`.
    pub fn with_signature(mut self, signature: Signature) -> Locator {
        self.signature = Some(signature);
        self
    }

    /// True when the locator is signed and the signature has expired at `now`
    /// (seconds since the Unix epoch).
    pub fn is_expired(&self, now: u64) -> bool {
        self.signature
            .as_ref()
            .map(|s| s.expires_at <= now)
            .unwrap_or(false)
    }

    /// True if `data` is the content this locator names.
    pub fn matches(&self, data: &[u8]) -> bool {
        data.len() as u64 == self.size && blake3::hash(data) == blake3::Hash::from(self.hash)
    }

    /// Verify `data` against this locator.
    pub fn check(&self, data: &[u8]) -> KeepResult<()> {
        if self.matches(data) {
            Ok(())
        } else {
            Err(KeepError::HashMismatch {
                expected: format!("{}+{}", self.hash_hex(), self.size),
                actual: format!("{}+{}", blake3::hash(data).to_hex(), data.len()),
            })
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}", hex::encode(self.hash), self.size)?;
        for hint in &self.hints {
            write!(f, "+{}", hint)?;
        }
        if let Some(sig) = &self.signature {
            write!(f, "+A{}@{:08x}", hex::encode(sig.mac), sig.expires_at)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Locator({})", self)
    }
}

impl FromStr for Locator {
    type Err = KeepError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || KeepError::InvalidLocator(s.to_string());

        let mut parts = s.split('+');
        let hash_hex = parts.next().ok_or_else(invalid)?;
        if hash_hex.len() != 64 || !hash_hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        {
            return Err(invalid());
        }
        let mut hash = [0u8; 32];
        hex::decode_to_slice(hash_hex, &mut hash).map_err(|_| invalid())?;

        let size_str = parts.next().ok_or_else(invalid)?;
        if size_str.is_empty() || !size_str.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let size: u64 = size_str.parse().map_err(|_| invalid())?;

        let mut signature = None;
        let mut hints = Vec::new();
        for hint in parts {
            if hint.is_empty() {
                return Err(invalid());
            }
            if let Some(rest) = hint.strip_prefix('A') {
                let (mac_hex, exp_hex) = rest.split_once('@').ok_or_else(invalid)?;
                let mut mac = [0u8; 32];
                hex::decode_to_slice(mac_hex, &mut mac).map_err(|_| invalid())?;
                let expires_at = u64::from_str_radix(exp_hex, 16).map_err(|_| invalid())?;
                signature = Some(Signature { mac, expires_at });
            } else {
                hints.push(hint.to_string());
            }
        }

        Ok(Locator {
            hash,
            size,
            signature,
            hints,
        })
    }
}

impl Serialize for Locator {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Locator {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Rewrite every locator token in manifest text through `f`. Tokens for
/// which `f` returns `None`, and all non-locator tokens, are kept verbatim,
/// as is the whitespace layout.
pub fn rewrite_locators(
    manifest_text: &str,
    mut f: impl FnMut(&Locator) -> Option<Locator>,
) -> String {
    let mut out = String::with_capacity(manifest_text.len());
    for (i, line) in manifest_text.split('\n').enumerate() {
        if i > 0 {
            out.push('\n');
        }
        for (j, token) in line.split(' ').enumerate() {
            if j > 0 {
                out.push(' ');
            }
            match token.parse::<Locator>().ok().and_then(|loc| f(&loc)) {
                Some(loc) => out.push_str(&loc.to_string()),
                None => out.push_str(token),
            }
        }
    }
    out
}

/// Manifest text with every signed locator replaced by its unsigned form.
pub fn strip_signatures(manifest_text: &str) -> String {
    rewrite_locators(manifest_text, |loc| {
        loc.signature().is_some().then(|| loc.unsigned())
    })
}

/// Content identity of a manifest: hash of the signature-stripped text plus
/// its length.
pub fn portable_data_hash(manifest_text: &str) -> String {
    let stripped = strip_signatures(manifest_text);
    format!("{}+{}", blake3::hash(stripped.as_bytes()).to_hex(), stripped.len())
}
