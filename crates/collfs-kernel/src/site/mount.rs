//! Named mount points at the top of the site tree.

use std::collections::BTreeMap;

use tokio::sync::RwLock;

use crate::vfs::{VfsError, VfsResult};

/// Name of the id-indexed mount.
pub const BY_ID: &str = "by_id";
/// Name of the per-user mount.
pub const USERS: &str = "users";

/// What a mount point serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mount {
    /// `<collection-uuid | pdh | project-uuid>[/...]`, loaded on demand.
    ById,
    /// One directory per user, each the user's home project.
    Users,
    /// A project's collections and subprojects.
    Project(String),
}

/// Information about a mount point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfo {
    pub name: String,
    pub mount: Mount,
}

/// Mount points keyed by top-level name.
pub struct MountTable {
    mounts: RwLock<BTreeMap<String, Mount>>,
}

impl std::fmt::Debug for MountTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountTable")
            .field("mounts", &"<locked>")
            .finish()
    }
}

impl Default for MountTable {
    fn default() -> Self {
        Self::new()
    }
}

impl MountTable {
    /// A table with only the built-in `by_id` and `users` mounts.
    pub fn new() -> Self {
        let mut mounts = BTreeMap::new();
        mounts.insert(BY_ID.to_string(), Mount::ById);
        mounts.insert(USERS.to_string(), Mount::Users);
        Self {
            mounts: RwLock::new(mounts),
        }
    }

    /// Add a mount. Names are single path components and must be unused.
    pub async fn mount(&self, name: &str, mount: Mount) -> VfsResult<()> {
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            return Err(VfsError::invalid_argument(format!(
                "{:?} is not a valid mount name",
                name
            )));
        }
        let mut mounts = self.mounts.write().await;
        if mounts.contains_key(name) {
            return Err(VfsError::already_exists(format!("/{}", name)));
        }
        mounts.insert(name.to_string(), mount);
        Ok(())
    }

    /// Returns `true` if a mount was removed.
    pub async fn unmount(&self, name: &str) -> bool {
        self.mounts.write().await.remove(name).is_some()
    }

    pub async fn get(&self, name: &str) -> Option<Mount> {
        self.mounts.read().await.get(name).cloned()
    }

    /// All mounts, sorted by name.
    pub async fn list(&self) -> Vec<MountInfo> {
        self.mounts
            .read()
            .await
            .iter()
            .map(|(name, mount)| MountInfo {
                name: name.clone(),
                mount: mount.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_builtins_and_mount() {
        let table = MountTable::new();
        assert_eq!(table.get(BY_ID).await, Some(Mount::ById));
        table
            .mount("home", Mount::Project("zzzzz-tpzed-000000000000000".into()))
            .await
            .unwrap();
        let names: Vec<String> = table.list().await.into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["by_id", "home", "users"]);

        assert!(matches!(
            table.mount("home", Mount::Users).await,
            Err(VfsError::AlreadyExists(_))
        ));
        assert!(matches!(
            table.mount("a/b", Mount::Users).await,
            Err(VfsError::InvalidArgument(_))
        ));
        assert!(table.unmount("home").await);
        assert!(!table.unmount("home").await);
    }
}
