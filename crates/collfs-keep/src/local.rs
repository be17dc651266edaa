//! Directory-backed store for the command-line tool.
//!
//! Layout under the root directory:
//!
//! ```text
//! signing.key              hex key material, created on first open
//! current_user             UUID of the owning user
//! blocks/<2 hex>/<64 hex>  block bytes
//! collections/<uuid>.json  CollectionRecord (unsigned manifest)
//! projects/<uuid>.json     ProjectRecord
//! users/<uuid>.json        UserRecord
//! ```
//!
//! Writes go to a temporary file that is renamed into place, so a crashed
//! writer never leaves a half-written record or block behind.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use collfs_types::{
    CollectionRecord, Identifier, ObjectKind, ProjectItem, ProjectRecord, UserRecord, new_uuid,
};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::client::{ApiClient, KeepClient, PutReceipt};
use crate::error::{KeepError, KeepResult};
use crate::locator::{Locator, portable_data_hash, rewrite_locators, strip_signatures};
use crate::signing::{Signer, unix_now};

const CLUSTER: &str = "local";
const TOKEN: &str = "local-store-token";
const SIGNATURE_TTL: Duration = Duration::from_secs(14 * 24 * 3600);

/// A store rooted at a local directory.
pub struct DirStore {
    root: PathBuf,
    signer: Signer,
    user: UserRecord,
    supported_classes: Vec<String>,
}

impl DirStore {
    /// Open (creating if needed) a store at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> KeepResult<Self> {
        let root = root.into();
        for sub in ["blocks", "collections", "projects", "users"] {
            tokio::fs::create_dir_all(root.join(sub)).await?;
        }

        let key_path = root.join("signing.key");
        let key = match tokio::fs::read_to_string(&key_path).await {
            Ok(text) => hex::decode(text.trim())
                .map_err(|e| KeepError::other(format!("corrupt signing key: {}", e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let key: [u8; 32] = rand::random();
                write_atomic(&key_path, hex::encode(key).as_bytes()).await?;
                key.to_vec()
            }
            Err(e) => return Err(e.into()),
        };

        let user_path = root.join("current_user");
        let user = match tokio::fs::read_to_string(&user_path).await {
            Ok(uuid) => read_json::<UserRecord>(&root.join("users").join(format!("{}.json", uuid.trim()))).await?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let username = std::env::var("USER").unwrap_or_else(|_| "user".to_string());
                let user = UserRecord {
                    uuid: new_uuid(CLUSTER, ObjectKind::User),
                    full_name: username.clone(),
                    username,
                };
                write_json(&root.join("users").join(format!("{}.json", user.uuid)), &user).await?;
                write_atomic(&user_path, user.uuid.as_bytes()).await?;
                tracing::info!(uuid = %user.uuid, root = %root.display(), "initialized local store");
                user
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            root,
            signer: Signer::new(&key),
            user,
            supported_classes: vec!["default".to_string()],
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn block_path(&self, locator: &Locator) -> PathBuf {
        let hex = locator.hash_hex();
        self.root.join("blocks").join(&hex[..2]).join(hex)
    }

    fn record_path(&self, kind: &str, uuid: &str) -> PathBuf {
        self.root.join(kind).join(format!("{}.json", uuid))
    }

    fn sign(&self, locator: &Locator) -> Locator {
        self.signer.sign_for(locator, TOKEN, SIGNATURE_TTL, unix_now())
    }

    fn signed_record(&self, record: CollectionRecord) -> CollectionRecord {
        CollectionRecord {
            manifest_text: rewrite_locators(&record.manifest_text, |loc| Some(self.sign(loc))),
            ..record
        }
    }

    async fn load_all<T: DeserializeOwned>(&self, kind: &str) -> KeepResult<Vec<T>> {
        let mut out = Vec::new();
        let mut entries = tokio::fs::read_dir(self.root.join(kind)).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "json") {
                out.push(read_json(&path).await?);
            }
        }
        Ok(out)
    }

    async fn load_collection(&self, uuid: &str) -> KeepResult<CollectionRecord> {
        read_json(&self.record_path("collections", uuid)).await
    }

    async fn owner_exists(&self, uuid: &str) -> bool {
        tokio::fs::try_exists(self.record_path("projects", uuid))
            .await
            .unwrap_or(false)
            || tokio::fs::try_exists(self.record_path("users", uuid))
                .await
                .unwrap_or(false)
    }

    /// Create a project owned by `owner_uuid`.
    pub async fn create_project(&self, name: &str, owner_uuid: &str) -> KeepResult<ProjectRecord> {
        if !self.owner_exists(owner_uuid).await {
            return Err(KeepError::not_found(owner_uuid));
        }
        let project = ProjectRecord {
            uuid: new_uuid(CLUSTER, ObjectKind::Project),
            name: name.to_string(),
            owner_uuid: owner_uuid.to_string(),
        };
        write_json(&self.record_path("projects", &project.uuid), &project).await?;
        Ok(project)
    }
}

#[async_trait]
impl KeepClient for DirStore {
    async fn fetch_block(&self, locator: &Locator) -> KeepResult<Vec<u8>> {
        self.signer.verify(locator, TOKEN, unix_now())?;
        match tokio::fs::read(self.block_path(locator)).await {
            Ok(data) => {
                locator.check(&data)?;
                Ok(data)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(KeepError::not_found(locator.unsigned().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn put_block(&self, data: &[u8], classes: &[String]) -> KeepResult<PutReceipt> {
        let loc = Locator::for_data(data);
        let path = self.block_path(&loc);
        if !tokio::fs::try_exists(&path).await? {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            write_atomic(&path, data).await?;
        }
        Ok(PutReceipt {
            locator: self.sign(&loc),
            classes_confirmed: classes
                .iter()
                .filter(|c| self.supported_classes.contains(c))
                .cloned()
                .collect(),
        })
    }

    async fn sign_locator(&self, locator: &Locator, token: &str, ttl: Duration) -> KeepResult<Locator> {
        if token != TOKEN {
            return Err(KeepError::permission_denied("unknown token"));
        }
        if !tokio::fs::try_exists(self.block_path(locator)).await? {
            return Err(KeepError::not_found(locator.unsigned().to_string()));
        }
        Ok(self.signer.sign_for(locator, token, ttl, unix_now()))
    }
}

#[async_trait]
impl ApiClient for DirStore {
    fn token(&self) -> &str {
        TOKEN
    }

    fn cluster_id(&self) -> &str {
        CLUSTER
    }

    async fn get_collection(&self, id: &str) -> KeepResult<CollectionRecord> {
        match Identifier::parse(id) {
            Identifier::Collection(uuid) => {
                let record = self.load_collection(&uuid).await?;
                Ok(self.signed_record(record))
            }
            Identifier::PortableDataHash(pdh) => {
                let all: Vec<CollectionRecord> = self.load_all("collections").await?;
                let found = all
                    .into_iter()
                    .find(|c| c.portable_data_hash == pdh)
                    .ok_or_else(|| KeepError::not_found(id))?;
                Ok(self.signed_record(CollectionRecord {
                    uuid: None,
                    name: pdh,
                    owner_uuid: String::new(),
                    ..found
                }))
            }
            _ => Err(KeepError::not_found(id)),
        }
    }

    async fn commit_manifest(
        &self,
        uuid: &str,
        manifest_text: &str,
        classes: &[String],
    ) -> KeepResult<CollectionRecord> {
        let mut bad = None;
        let now = unix_now();
        rewrite_locators(manifest_text, |loc| {
            if bad.is_none() && loc.size() > 0 {
                bad = self.signer.verify(loc, TOKEN, now).err();
            }
            None
        });
        if let Some(e) = bad {
            return Err(e);
        }
        if let Some(missing) = classes.iter().find(|c| !self.supported_classes.contains(c)) {
            return Err(KeepError::StorageClassUnsatisfiable(format!(
                "storage class {:?} is not available",
                missing
            )));
        }

        let mut record = self.load_collection(uuid).await?;
        let stripped = strip_signatures(manifest_text);
        record.portable_data_hash = portable_data_hash(&stripped);
        record.manifest_text = stripped;
        record.storage_classes_desired = classes.to_vec();
        record.storage_classes_confirmed = classes.to_vec();
        record.modified_at = now;
        write_json(&self.record_path("collections", uuid), &record).await?;
        Ok(self.signed_record(record))
    }

    async fn create_collection(&self, name: &str, owner_uuid: &str) -> KeepResult<CollectionRecord> {
        if !self.owner_exists(owner_uuid).await {
            return Err(KeepError::not_found(owner_uuid));
        }
        let existing: Vec<CollectionRecord> = self.load_all("collections").await?;
        if existing
            .iter()
            .any(|c| c.owner_uuid == owner_uuid && c.name == name)
        {
            return Err(KeepError::Conflict(format!(
                "{} already has a collection named {:?}",
                owner_uuid, name
            )));
        }
        let record = CollectionRecord {
            uuid: Some(new_uuid(CLUSTER, ObjectKind::Collection)),
            name: name.to_string(),
            owner_uuid: owner_uuid.to_string(),
            portable_data_hash: portable_data_hash(""),
            manifest_text: String::new(),
            storage_classes_desired: vec!["default".to_string()],
            storage_classes_confirmed: vec!["default".to_string()],
            modified_at: unix_now(),
        };
        write_json(&self.record_path("collections", record.id()), &record).await?;
        Ok(record)
    }

    async fn get_project(&self, uuid: &str) -> KeepResult<ProjectRecord> {
        match read_json::<ProjectRecord>(&self.record_path("projects", uuid)).await {
            Err(KeepError::NotFound(_)) => {
                let user: UserRecord = read_json(&self.record_path("users", uuid)).await?;
                Ok(ProjectRecord {
                    uuid: user.uuid,
                    name: user.username,
                    owner_uuid: String::new(),
                })
            }
            other => other,
        }
    }

    async fn list_project(&self, uuid: &str) -> KeepResult<Vec<ProjectItem>> {
        if !self.owner_exists(uuid).await {
            return Err(KeepError::not_found(uuid));
        }
        let collections: Vec<CollectionRecord> = self.load_all("collections").await?;
        let projects: Vec<ProjectRecord> = self.load_all("projects").await?;
        let mut items: Vec<ProjectItem> = collections
            .into_iter()
            .filter(|c| c.owner_uuid == uuid)
            .map(|c| ProjectItem::Collection(self.signed_record(c)))
            .chain(
                projects
                    .into_iter()
                    .filter(|p| p.owner_uuid == uuid)
                    .map(ProjectItem::Project),
            )
            .collect();
        items.sort_by(|a, b| a.uuid().cmp(b.uuid()));
        Ok(items)
    }

    async fn current_user(&self) -> KeepResult<UserRecord> {
        Ok(self.user.clone())
    }

    async fn list_users(&self) -> KeepResult<Vec<UserRecord>> {
        let mut users: Vec<UserRecord> = self.load_all("users").await?;
        users.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(users)
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> KeepResult<T> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(KeepError::not_found(path.display().to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> KeepResult<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &bytes).await
}

async fn write_atomic(path: &Path, data: &[u8]) -> KeepResult<()> {
    let tmp = path.with_extension(format!("tmp-{:08x}", rand::random::<u32>()));
    tokio::fs::write(&tmp, data).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}
