//! Metadata records exchanged with the metadata service.

use serde::{Deserialize, Serialize};

/// A collection as the metadata service describes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionRecord {
    /// Collection UUID. `None` when the record was fetched by content hash.
    #[serde(default)]
    pub uuid: Option<String>,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Owning project or user UUID.
    #[serde(default)]
    pub owner_uuid: String,
    /// Content identity of `manifest_text`.
    pub portable_data_hash: String,
    /// Serialized tree (see the manifest codec in `collfs-kernel`).
    #[serde(default)]
    pub manifest_text: String,
    /// Storage classes the owner asked for.
    #[serde(default)]
    pub storage_classes_desired: Vec<String>,
    /// Storage classes the backend has confirmed for every block.
    #[serde(default)]
    pub storage_classes_confirmed: Vec<String>,
    /// Last modification, seconds since the Unix epoch.
    #[serde(default)]
    pub modified_at: u64,
}

impl CollectionRecord {
    /// The identifier this record is addressed by: UUID when present,
    /// portable data hash otherwise.
    pub fn id(&self) -> &str {
        self.uuid.as_deref().unwrap_or(&self.portable_data_hash)
    }

    /// True when every desired storage class has been confirmed.
    pub fn classes_satisfied(&self) -> bool {
        self.storage_classes_desired
            .iter()
            .all(|c| self.storage_classes_confirmed.contains(c))
    }
}

/// A project (group) record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub uuid: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub owner_uuid: String,
}

/// A user record. A user's UUID doubles as their home project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub uuid: String,
    pub username: String,
    #[serde(default)]
    pub full_name: String,
}

/// Something owned by a project: a collection or a subproject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProjectItem {
    Collection(CollectionRecord),
    Project(ProjectRecord),
}

impl ProjectItem {
    /// Display name of the item.
    pub fn name(&self) -> &str {
        match self {
            ProjectItem::Collection(c) => &c.name,
            ProjectItem::Project(p) => &p.name,
        }
    }

    /// UUID of the item (a collection item always has one).
    pub fn uuid(&self) -> &str {
        match self {
            ProjectItem::Collection(c) => c.id(),
            ProjectItem::Project(p) => &p.uuid,
        }
    }

    /// Owner of the item.
    pub fn owner_uuid(&self) -> &str {
        match self {
            ProjectItem::Collection(c) => &c.owner_uuid,
            ProjectItem::Project(p) => &p.owner_uuid,
        }
    }
}
