//! Capabilities the filesystem core consumes from the storage backend.
//!
//! `KeepClient` moves opaque blocks by locator. `ApiClient` fetches and
//! commits collection metadata. Both are object-safe and shared as
//! `Arc<dyn ...>` so one backend can serve many collection filesystems.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use collfs_types::{CollectionRecord, ProjectItem, ProjectRecord, UserRecord};

use crate::error::KeepResult;
use crate::locator::Locator;

/// Outcome of storing one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutReceipt {
    /// Signed, content-derived locator of the stored block.
    pub locator: Locator,
    /// Storage classes the backend actually placed the block in. May be a
    /// subset of what was asked for.
    pub classes_confirmed: Vec<String>,
}

impl PutReceipt {
    /// Desired classes the backend did not confirm.
    pub fn missing_classes<'a>(&self, desired: &'a [String]) -> Vec<&'a str> {
        desired
            .iter()
            .filter(|c| !self.classes_confirmed.contains(c))
            .map(String::as_str)
            .collect()
    }
}

/// Block transfer.
#[async_trait]
pub trait KeepClient: Send + Sync {
    /// Fetch the bytes named by `locator`.
    ///
    /// Fails with `NotFound`, `PermissionDenied` or `Expired`.
    async fn fetch_block(&self, locator: &Locator) -> KeepResult<Vec<u8>>;

    /// Store `data`, asking for `classes`. The returned receipt reports the
    /// classes actually confirmed.
    async fn put_block(&self, data: &[u8], classes: &[String]) -> KeepResult<PutReceipt>;

    /// Obtain a fresh signature for `locator`, valid for `ttl`.
    async fn sign_locator(&self, locator: &Locator, token: &str, ttl: Duration)
    -> KeepResult<Locator>;
}

/// Collection, project and user metadata.
#[async_trait]
pub trait ApiClient: Send + Sync {
    /// Auth token used when signing and verifying locators.
    fn token(&self) -> &str;

    /// Five-character cluster prefix for newly minted identifiers.
    fn cluster_id(&self) -> &str;

    /// Fetch a collection by UUID or portable data hash.
    async fn get_collection(&self, id: &str) -> KeepResult<CollectionRecord>;

    /// Replace a collection's manifest. All-or-nothing: on error the stored
    /// record is unchanged.
    ///
    /// Fails with `Conflict` or `StorageClassUnsatisfiable`.
    async fn commit_manifest(
        &self,
        uuid: &str,
        manifest_text: &str,
        classes: &[String],
    ) -> KeepResult<CollectionRecord>;

    /// Create an empty collection owned by `owner_uuid`.
    async fn create_collection(&self, name: &str, owner_uuid: &str)
    -> KeepResult<CollectionRecord>;

    /// Fetch a project by UUID.
    async fn get_project(&self, uuid: &str) -> KeepResult<ProjectRecord>;

    /// Collections and subprojects owned by a project or user.
    async fn list_project(&self, uuid: &str) -> KeepResult<Vec<ProjectItem>>;

    /// The user the token belongs to.
    async fn current_user(&self) -> KeepResult<UserRecord>;

    async fn list_users(&self) -> KeepResult<Vec<UserRecord>>;
}

/// Shared block client.
pub type SharedKeepClient = Arc<dyn KeepClient>;

/// Shared metadata client.
pub type SharedApiClient = Arc<dyn ApiClient>;
