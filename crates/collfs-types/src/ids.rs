//! Identifier classes embedded in site paths.
//!
//! Object UUIDs are `<cluster>-<infix>-<15 base36 chars>`, where the
//! five-character infix names the object kind. Portable data hashes name a
//! collection by content: the hex digest of its signature-stripped manifest
//! plus the manifest length.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static OBJECT_UUID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([0-9a-z]{5})-([0-9a-z]{5})-([0-9a-z]{15})$").expect("static regex")
});

static PORTABLE_DATA_HASH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9a-f]{64}\+[0-9]+$").expect("static regex"));

const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Kind of object an identifier refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectKind {
    Collection,
    Project,
    User,
}

impl ObjectKind {
    /// The five-character UUID infix for this kind.
    pub fn infix(&self) -> &'static str {
        match self {
            ObjectKind::Collection => "4zz18",
            ObjectKind::Project => "j7d0g",
            ObjectKind::User => "tpzed",
        }
    }

    fn from_infix(infix: &str) -> Option<Self> {
        match infix {
            "4zz18" => Some(ObjectKind::Collection),
            "j7d0g" => Some(ObjectKind::Project),
            "tpzed" => Some(ObjectKind::User),
            _ => None,
        }
    }
}

/// A classified path segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identifier {
    /// A collection UUID.
    Collection(String),
    /// A collection named by content (portable data hash).
    PortableDataHash(String),
    /// A project (group) UUID.
    Project(String),
    /// A user UUID.
    User(String),
    /// Anything else.
    Unrecognized(String),
}

impl Identifier {
    /// Classify a string.
    pub fn parse(s: &str) -> Self {
        if PORTABLE_DATA_HASH.is_match(s) {
            return Identifier::PortableDataHash(s.to_string());
        }
        if let Some(caps) = OBJECT_UUID.captures(s) {
            match ObjectKind::from_infix(&caps[2]) {
                Some(ObjectKind::Collection) => return Identifier::Collection(s.to_string()),
                Some(ObjectKind::Project) => return Identifier::Project(s.to_string()),
                Some(ObjectKind::User) => return Identifier::User(s.to_string()),
                None => {}
            }
        }
        Identifier::Unrecognized(s.to_string())
    }

    /// True for identifiers that name a collection (by UUID or by content).
    pub fn is_collection(&self) -> bool {
        matches!(
            self,
            Identifier::Collection(_) | Identifier::PortableDataHash(_)
        )
    }

    /// The identifier text.
    pub fn as_str(&self) -> &str {
        match self {
            Identifier::Collection(s)
            | Identifier::PortableDataHash(s)
            | Identifier::Project(s)
            | Identifier::User(s)
            | Identifier::Unrecognized(s) => s,
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returns true if `s` is shaped like a portable data hash.
pub fn is_portable_data_hash(s: &str) -> bool {
    PORTABLE_DATA_HASH.is_match(s)
}

/// Mint a new object UUID for the given cluster prefix.
///
/// The cluster prefix is lowercased and must be five characters; anything
/// else is padded or cut so the result always parses.
pub fn new_uuid(cluster: &str, kind: ObjectKind) -> String {
    let mut prefix: String = cluster
        .to_ascii_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(5)
        .collect();
    while prefix.len() < 5 {
        prefix.push('z');
    }

    let mut n = uuid::Uuid::new_v4().as_u128();
    let mut tail = [0u8; 15];
    for slot in tail.iter_mut().rev() {
        *slot = BASE36[(n % 36) as usize];
        n /= 36;
    }
    // BASE36 is ASCII, so this cannot fail.
    let tail = String::from_utf8_lossy(&tail);
    format!("{}-{}-{}", prefix, kind.infix(), tail)
}
