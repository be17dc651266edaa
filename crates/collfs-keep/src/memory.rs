//! In-memory backend implementing both `KeepClient` and `ApiClient`.
//!
//! Used as the test stub for the filesystem core: it signs and verifies
//! locators like a real cluster, supports a configurable set of storage
//! classes, and can inject commit conflicts, fetch expiry and latency.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use collfs_types::{
    CollectionRecord, Identifier, ObjectKind, ProjectItem, ProjectRecord, UserRecord, new_uuid,
};
use parking_lot::Mutex;

use crate::client::{ApiClient, KeepClient, PutReceipt};
use crate::error::{KeepError, KeepResult};
use crate::locator::{Locator, portable_data_hash, rewrite_locators, strip_signatures};
use crate::signing::{Signer, unix_now};

const DEFAULT_CLUSTER: &str = "zzzzz";
const DEFAULT_TOKEN: &str = "memory-store-token";
const DEFAULT_TTL: Duration = Duration::from_secs(14 * 24 * 3600);

#[derive(Default)]
struct State {
    blocks: HashMap<Locator, Vec<u8>>,
    collections: BTreeMap<String, CollectionRecord>,
    projects: BTreeMap<String, ProjectRecord>,
    users: BTreeMap<String, UserRecord>,
    current_user: Option<String>,
    supported_classes: Vec<String>,
    fail_next_commit: bool,
    expire_fetches: usize,
    latency: Duration,
}

/// Process-local backend.
pub struct MemoryStore {
    state: Mutex<State>,
    signer: Signer,
    token: String,
    cluster: String,
    ttl: Duration,
    require_signatures: bool,
    clock_offset: AtomicU64,
    fetches: AtomicUsize,
    puts: AtomicUsize,
    commits: AtomicUsize,
    collection_loads: AtomicUsize,
}

impl MemoryStore {
    /// A store with one current user (`active`) and the `default` class.
    pub fn new() -> Self {
        let store = Self {
            state: Mutex::new(State {
                supported_classes: vec!["default".to_string()],
                ..Default::default()
            }),
            signer: Signer::new(b"memory-store-signing-key"),
            token: DEFAULT_TOKEN.to_string(),
            cluster: DEFAULT_CLUSTER.to_string(),
            ttl: DEFAULT_TTL,
            require_signatures: true,
            clock_offset: AtomicU64::new(0),
            fetches: AtomicUsize::new(0),
            puts: AtomicUsize::new(0),
            commits: AtomicUsize::new(0),
            collection_loads: AtomicUsize::new(0),
        };
        let user = store.add_user("active");
        store.state.lock().current_user = Some(user.uuid);
        store
    }

    /// Accept unsigned locators on fetch and commit.
    pub fn without_signatures(mut self) -> Self {
        self.require_signatures = false;
        self
    }

    /// Store-side clock, seconds since the Unix epoch.
    pub fn now(&self) -> u64 {
        unix_now() + self.clock_offset.load(Ordering::Relaxed)
    }

    /// Move the store clock forward, expiring signatures.
    pub fn advance_clock(&self, by: Duration) {
        self.clock_offset.fetch_add(by.as_secs(), Ordering::Relaxed);
    }

    /// Sign a locator for this store's token with the default TTL.
    pub fn sign(&self, locator: &Locator) -> Locator {
        self.signer
            .sign_for(locator, &self.token, self.ttl, self.now())
    }

    fn sign_manifest(&self, manifest_text: &str) -> String {
        rewrite_locators(manifest_text, |loc| Some(self.sign(loc)))
    }

    fn signed_record(&self, record: &CollectionRecord) -> CollectionRecord {
        CollectionRecord {
            manifest_text: self.sign_manifest(&record.manifest_text),
            ..record.clone()
        }
    }

    // ------------------------------------------------------------------
    // Fixtures
    // ------------------------------------------------------------------

    /// Store a block directly. Returns its signed locator.
    pub fn store_block(&self, data: &[u8]) -> Locator {
        let loc = Locator::for_data(data);
        self.state.lock().blocks.insert(loc.clone(), data.to_vec());
        self.sign(&loc)
    }

    pub fn add_user(&self, username: &str) -> UserRecord {
        let user = UserRecord {
            uuid: new_uuid(&self.cluster, ObjectKind::User),
            username: username.to_string(),
            full_name: String::new(),
        };
        self.state
            .lock()
            .users
            .insert(user.uuid.clone(), user.clone());
        user
    }

    pub fn add_project(&self, name: &str, owner_uuid: &str) -> ProjectRecord {
        let project = ProjectRecord {
            uuid: new_uuid(&self.cluster, ObjectKind::Project),
            name: name.to_string(),
            owner_uuid: owner_uuid.to_string(),
        };
        self.state
            .lock()
            .projects
            .insert(project.uuid.clone(), project.clone());
        project
    }

    /// Add a collection whose manifest references blocks already stored.
    pub fn add_collection(&self, name: &str, owner_uuid: &str, manifest_text: &str) -> CollectionRecord {
        let stripped = strip_signatures(manifest_text);
        let mut state = self.state.lock();
        let classes = state.supported_classes.iter().take(1).cloned().collect::<Vec<_>>();
        let record = CollectionRecord {
            uuid: Some(new_uuid(&self.cluster, ObjectKind::Collection)),
            name: name.to_string(),
            owner_uuid: owner_uuid.to_string(),
            portable_data_hash: portable_data_hash(&stripped),
            manifest_text: stripped,
            storage_classes_desired: classes.clone(),
            storage_classes_confirmed: classes,
            modified_at: self.now(),
        };
        state
            .collections
            .insert(record.id().to_string(), record.clone());
        record
    }

    /// Set the storage classes a collection asks for on its next commit.
    pub fn set_desired_classes(&self, uuid: &str, classes: &[&str]) {
        if let Some(rec) = self.state.lock().collections.get_mut(uuid) {
            rec.storage_classes_desired = classes.iter().map(|c| c.to_string()).collect();
        }
    }

    /// Storage classes blocks can be placed in.
    pub fn set_supported_classes(&self, classes: &[&str]) {
        self.state.lock().supported_classes = classes.iter().map(|c| c.to_string()).collect();
    }

    /// The stored (unsigned) record for a collection UUID.
    pub fn collection(&self, uuid: &str) -> Option<CollectionRecord> {
        self.state.lock().collections.get(uuid).cloned()
    }

    pub fn has_block(&self, locator: &Locator) -> bool {
        self.state.lock().blocks.contains_key(&locator.unsigned())
    }

    // ------------------------------------------------------------------
    // Fault injection and counters
    // ------------------------------------------------------------------

    /// The next `commit_manifest` fails with `Conflict`.
    pub fn fail_next_commit(&self) {
        self.state.lock().fail_next_commit = true;
    }

    /// The next `n` fetches fail with `Expired`.
    pub fn expire_next_fetches(&self, n: usize) {
        self.state.lock().expire_fetches = n;
    }

    /// Delay every backend call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::Relaxed)
    }

    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::Relaxed)
    }

    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::Relaxed)
    }

    /// Number of `get_collection` calls answered.
    pub fn collection_load_count(&self) -> usize {
        self.collection_loads.load(Ordering::Relaxed)
    }

    async fn delay(&self) {
        let latency = self.state.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn check_signature(&self, locator: &Locator) -> KeepResult<()> {
        if self.require_signatures {
            self.signer.verify(locator, &self.token, self.now())
        } else {
            Ok(())
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeepClient for MemoryStore {
    async fn fetch_block(&self, locator: &Locator) -> KeepResult<Vec<u8>> {
        self.delay().await;
        self.fetches.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = self.state.lock();
            if state.expire_fetches > 0 {
                state.expire_fetches -= 1;
                return Err(KeepError::Expired(locator.unsigned().to_string()));
            }
        }
        self.check_signature(locator)?;
        self.state
            .lock()
            .blocks
            .get(&locator.unsigned())
            .cloned()
            .ok_or_else(|| KeepError::not_found(locator.unsigned().to_string()))
    }

    async fn put_block(&self, data: &[u8], classes: &[String]) -> KeepResult<PutReceipt> {
        self.delay().await;
        self.puts.fetch_add(1, Ordering::Relaxed);
        let loc = Locator::for_data(data);
        let classes_confirmed = {
            let mut state = self.state.lock();
            state.blocks.insert(loc.clone(), data.to_vec());
            classes
                .iter()
                .filter(|c| state.supported_classes.contains(c))
                .cloned()
                .collect()
        };
        Ok(PutReceipt {
            locator: self.sign(&loc),
            classes_confirmed,
        })
    }

    async fn sign_locator(&self, locator: &Locator, token: &str, ttl: Duration) -> KeepResult<Locator> {
        self.delay().await;
        if token != self.token {
            return Err(KeepError::permission_denied("unknown token"));
        }
        if !self.has_block(locator) {
            return Err(KeepError::not_found(locator.unsigned().to_string()));
        }
        Ok(self.signer.sign_for(locator, token, ttl, self.now()))
    }
}

#[async_trait]
impl ApiClient for MemoryStore {
    fn token(&self) -> &str {
        &self.token
    }

    fn cluster_id(&self) -> &str {
        &self.cluster
    }

    async fn get_collection(&self, id: &str) -> KeepResult<CollectionRecord> {
        self.delay().await;
        self.collection_loads.fetch_add(1, Ordering::Relaxed);
        let state = self.state.lock();
        let record = match Identifier::parse(id) {
            Identifier::Collection(uuid) => state.collections.get(&uuid).cloned(),
            Identifier::PortableDataHash(pdh) => state
                .collections
                .values()
                .find(|c| c.portable_data_hash == pdh)
                .map(|c| CollectionRecord {
                    uuid: None,
                    name: pdh.clone(),
                    owner_uuid: String::new(),
                    ..c.clone()
                }),
            _ => None,
        };
        drop(state);
        record
            .map(|r| self.signed_record(&r))
            .ok_or_else(|| KeepError::not_found(id))
    }

    async fn commit_manifest(
        &self,
        uuid: &str,
        manifest_text: &str,
        classes: &[String],
    ) -> KeepResult<CollectionRecord> {
        self.delay().await;

        let mut check_err = None;
        rewrite_locators(manifest_text, |loc| {
            if check_err.is_none() && loc.size() > 0 {
                if let Err(e) = self.check_signature(loc) {
                    check_err = Some(e);
                } else if !self.has_block(loc) {
                    check_err = Some(KeepError::not_found(loc.unsigned().to_string()));
                }
            }
            None
        });

        let mut state = self.state.lock();
        if std::mem::take(&mut state.fail_next_commit) {
            return Err(KeepError::Conflict(format!("{} was modified concurrently", uuid)));
        }
        if let Some(e) = check_err {
            return Err(e);
        }
        if let Some(missing) = classes.iter().find(|c| !state.supported_classes.contains(c)) {
            return Err(KeepError::StorageClassUnsatisfiable(format!(
                "storage class {:?} is not available",
                missing
            )));
        }

        let now = self.now();
        let record = state
            .collections
            .get_mut(uuid)
            .ok_or_else(|| KeepError::not_found(uuid))?;
        let stripped = strip_signatures(manifest_text);
        record.portable_data_hash = portable_data_hash(&stripped);
        record.manifest_text = stripped;
        record.storage_classes_desired = classes.to_vec();
        record.storage_classes_confirmed = classes.to_vec();
        record.modified_at = now;
        let record = record.clone();
        drop(state);

        self.commits.fetch_add(1, Ordering::Relaxed);
        Ok(self.signed_record(&record))
    }

    async fn create_collection(&self, name: &str, owner_uuid: &str) -> KeepResult<CollectionRecord> {
        self.delay().await;
        {
            let state = self.state.lock();
            if !state.projects.contains_key(owner_uuid) && !state.users.contains_key(owner_uuid) {
                return Err(KeepError::not_found(owner_uuid));
            }
            if state
                .collections
                .values()
                .any(|c| c.owner_uuid == owner_uuid && c.name == name)
            {
                return Err(KeepError::Conflict(format!(
                    "{} already has a collection named {:?}",
                    owner_uuid, name
                )));
            }
        }
        Ok(self.add_collection(name, owner_uuid, ""))
    }

    async fn get_project(&self, uuid: &str) -> KeepResult<ProjectRecord> {
        self.delay().await;
        let state = self.state.lock();
        if let Some(p) = state.projects.get(uuid) {
            return Ok(p.clone());
        }
        state
            .users
            .get(uuid)
            .map(|u| ProjectRecord {
                uuid: u.uuid.clone(),
                name: u.username.clone(),
                owner_uuid: String::new(),
            })
            .ok_or_else(|| KeepError::not_found(uuid))
    }

    async fn list_project(&self, uuid: &str) -> KeepResult<Vec<ProjectItem>> {
        self.delay().await;
        let state = self.state.lock();
        if !state.projects.contains_key(uuid) && !state.users.contains_key(uuid) {
            return Err(KeepError::not_found(uuid));
        }
        let mut items: Vec<ProjectItem> = state
            .collections
            .values()
            .filter(|c| c.owner_uuid == uuid)
            .map(|c| ProjectItem::Collection(self.signed_record(c)))
            .chain(
                state
                    .projects
                    .values()
                    .filter(|p| p.owner_uuid == uuid)
                    .cloned()
                    .map(ProjectItem::Project),
            )
            .collect();
        items.sort_by(|a, b| a.uuid().cmp(b.uuid()));
        Ok(items)
    }

    async fn current_user(&self) -> KeepResult<UserRecord> {
        let state = self.state.lock();
        state
            .current_user
            .as_ref()
            .and_then(|uuid| state.users.get(uuid))
            .cloned()
            .ok_or_else(|| KeepError::permission_denied("no current user"))
    }

    async fn list_users(&self) -> KeepResult<Vec<UserRecord>> {
        let mut users: Vec<UserRecord> = self.state.lock().users.values().cloned().collect();
        users.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(users)
    }
}
