//! Site namespace: mounts, by-id resolution, project directories and the
//! rules for operations that cross collection boundaries.

use std::sync::Arc;
use std::time::Duration;

use collfs_keep::{ApiClient, Locator, MemoryStore};
use collfs_kernel::{Backend, FsConfig, OpContext, OpenFlags, SiteFs, VfsError, VfsOps};
use collfs_types::{CollectionRecord, ProjectRecord, UserRecord};

// ============================================================================
// Shared test setup
// ============================================================================

/// ```text
/// home (active)
/// ├── A Project/
/// │   └── bar/dir/baz      "baz!"
/// └── foo/foo              "foo"
/// ```
struct Fixture {
    store: Arc<MemoryStore>,
    site: SiteFs,
    user: UserRecord,
    project: ProjectRecord,
    foo: CollectionRecord,
    bar: CollectionRecord,
}

fn manifest(stream: &str, loc: &Locator, name: &str) -> String {
    format!("{} {} 0:{}:{}\n", stream, loc, loc.size(), name)
}

async fn fixture_with(config: FsConfig) -> Fixture {
    let store = Arc::new(MemoryStore::new());
    let user = store.current_user().await.unwrap();
    let project = store.add_project("A Project", &user.uuid);

    let foo_loc = store.store_block(b"foo");
    let foo = store.add_collection("foo", &user.uuid, &manifest(".", &foo_loc, "foo"));
    let baz_loc = store.store_block(b"baz!");
    let bar = store.add_collection("bar", &project.uuid, &manifest("./dir", &baz_loc, "baz"));

    let site = SiteFs::new(Backend::from_store(store.clone(), &config), config);
    site.mount_project(&OpContext::background(), "home", "")
        .await
        .unwrap();
    Fixture {
        store,
        site,
        user,
        project,
        foo,
        bar,
    }
}

async fn fixture() -> Fixture {
    fixture_with(FsConfig {
        debug_locks: true,
        ..FsConfig::default()
    })
    .await
}

fn bg() -> OpContext {
    OpContext::background()
}

async fn names(site: &SiteFs, path: &str) -> Vec<String> {
    site.readdir(&bg(), path)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect()
}

async fn read(site: &SiteFs, path: &str) -> Vec<u8> {
    VfsOps::read_all(site, &bg(), path).await.unwrap()
}

// ============================================================================
// Namespace
// ============================================================================

#[tokio::test]
async fn test_top_level_and_home() {
    let f = fixture().await;
    assert_eq!(names(&f.site, "/").await, vec!["by_id", "home", "users"]);
    assert_eq!(names(&f.site, "/home").await, vec!["A Project", "foo"]);
    assert_eq!(names(&f.site, "/home/A Project").await, vec!["bar"]);
    assert_eq!(names(&f.site, "/home/A Project/bar").await, vec!["dir"]);
    assert_eq!(read(&f.site, "/home/A Project/bar/dir/baz").await, b"baz!");
    assert_eq!(read(&f.site, "/home/foo/foo").await, b"foo");

    assert!(f.site.stat(&bg(), "/home").await.unwrap().is_dir());
    assert!(f.site.stat(&bg(), "/home/foo").await.unwrap().is_dir());
    assert_eq!(f.site.stat(&bg(), "/home/foo/foo").await.unwrap().size, 3);
}

#[tokio::test]
async fn test_missing_paths() {
    let f = fixture().await;
    for path in [
        "/nope",
        "/home/nope",
        "/home/A Project/nope",
        "/by_id/zzzzz-4zz18-000000000000000",
        "/by_id/not-an-id",
        "/users/nobody",
    ] {
        let err = f.site.stat(&bg(), path).await.unwrap_err();
        assert!(matches!(err, VfsError::NotFound(_)), "{path}: {err}");
    }
    let err = f.site.readdir(&bg(), "/home/nope/deeper").await.unwrap_err();
    assert!(matches!(err, VfsError::NotFound(_)), "{err}");
}

#[tokio::test]
async fn test_by_id_loads_on_demand() {
    let f = fixture().await;
    assert!(names(&f.site, "/by_id").await.is_empty());
    assert_eq!(f.store.collection_load_count(), 0);

    let path = format!("/by_id/{}/dir/baz", f.bar.id());
    assert_eq!(read(&f.site, &path).await, b"baz!");
    assert_eq!(f.store.collection_load_count(), 1);
    assert_eq!(names(&f.site, "/by_id").await, vec![f.bar.id().to_string()]);

    read(&f.site, &path).await;
    assert_eq!(f.store.collection_load_count(), 1);

    // The same instance serves every path that reaches the collection.
    f.site
        .write_all(&bg(), &format!("/by_id/{}/new", f.bar.id()), b"x")
        .await
        .unwrap();
    assert_eq!(names(&f.site, "/home/A Project/bar").await, vec!["dir", "new"]);
}

#[tokio::test]
async fn test_by_id_portable_data_hash_is_read_only() {
    let f = fixture().await;
    let pdh = f.foo.portable_data_hash.clone();
    assert_eq!(read(&f.site, &format!("/by_id/{pdh}/foo")).await, b"foo");

    let err = f
        .site
        .write_all(&bg(), &format!("/by_id/{pdh}/bar"), b"x")
        .await
        .unwrap_err();
    assert!(matches!(err, VfsError::ReadOnly), "{err}");
    assert!(f.site.collection(&bg(), &pdh).await.unwrap().is_read_only());
}

#[tokio::test]
async fn test_by_id_project_and_users() {
    let f = fixture().await;
    assert_eq!(
        names(&f.site, &format!("/by_id/{}", f.project.uuid)).await,
        vec!["bar"]
    );
    assert_eq!(
        names(&f.site, &format!("/by_id/{}", f.user.uuid)).await,
        vec!["A Project", "foo"]
    );
    assert_eq!(names(&f.site, "/users").await, vec!["active"]);
    assert_eq!(
        read(&f.site, "/users/active/A Project/bar/dir/baz").await,
        b"baz!"
    );
}

#[tokio::test]
async fn test_mounts() {
    let f = fixture().await;
    let err = f
        .site
        .mount_project(&bg(), "home", &f.project.uuid)
        .await
        .unwrap_err();
    assert!(matches!(err, VfsError::AlreadyExists(_)), "{err}");

    f.site
        .mount_project(&bg(), "proj", &f.project.uuid)
        .await
        .unwrap();
    assert_eq!(names(&f.site, "/proj").await, vec!["bar"]);
    assert!(f.site.unmount("proj").await);
    assert!(matches!(
        f.site.stat(&bg(), "/proj").await,
        Err(VfsError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_project_listing_refresh() {
    let f = fixture().await;
    assert_eq!(names(&f.site, "/home/A Project").await, vec!["bar"]);

    // Created behind our back: not visible until the listing refreshes.
    f.store.add_collection("later", &f.project.uuid, "");
    assert_eq!(names(&f.site, "/home/A Project").await, vec!["bar"]);

    let g = fixture_with(FsConfig {
        project_refresh_secs: 0,
        ..FsConfig::default()
    })
    .await;
    assert_eq!(names(&g.site, "/home/A Project").await, vec!["bar"]);
    g.store.add_collection("later", &g.project.uuid, "");
    assert_eq!(names(&g.site, "/home/A Project").await, vec!["bar", "later"]);
}

// ============================================================================
// Metadata-only directories
// ============================================================================

#[tokio::test]
async fn test_meta_directories_reject_mutation() {
    let f = fixture().await;
    for path in ["/", "/by_id", "/home", "/home/A Project"] {
        let err = f.site.remove(&bg(), path).await.unwrap_err();
        assert!(matches!(err, VfsError::InvalidOperation(_)), "{path}: {err}");
        let err = f.site.remove_all(&bg(), path).await.unwrap_err();
        assert!(matches!(err, VfsError::InvalidOperation(_)), "{path}: {err}");
        let err = f.site.snapshot(&bg(), path).await.unwrap_err();
        assert!(matches!(err, VfsError::InvalidOperation(_)), "{path}: {err}");
        let err = f
            .site
            .open_file(&bg(), path, OpenFlags::write())
            .await
            .unwrap_err();
        assert!(matches!(err, VfsError::IsADirectory(_)), "{path}: {err}");
    }

    let err = f
        .site
        .open_file(&bg(), "/home/newfile", OpenFlags::create())
        .await
        .unwrap_err();
    assert!(matches!(err, VfsError::InvalidOperation(_)), "{err}");
    assert!(matches!(
        f.site.remove(&bg(), "/home/nope").await,
        Err(VfsError::NotFound(_))
    ));
    f.site.remove_all(&bg(), "/home/nope").await.unwrap();

    // Collection roots are fixed too.
    let err = f.site.remove_all(&bg(), "/home/foo").await.unwrap_err();
    assert!(matches!(err, VfsError::InvalidOperation(_)), "{err}");
}

#[tokio::test]
async fn test_meta_directory_handle_lists() {
    let f = fixture().await;
    let handle = f.site.open(&bg(), "/home").await.unwrap();
    assert!(handle.is_dir());
    let listed: Vec<String> = handle.readdir().unwrap().into_iter().map(|e| e.name).collect();
    assert_eq!(listed, vec!["A Project", "foo"]);
}

#[tokio::test]
async fn test_mkdir_in_project_creates_collection() {
    let f = fixture().await;
    f.site.mkdir(&bg(), "/home/A Project/fresh").await.unwrap();
    assert_eq!(names(&f.site, "/home/A Project").await, vec!["bar", "fresh"]);
    assert!(names(&f.site, "/home/A Project/fresh").await.is_empty());

    f.site
        .write_all(&bg(), "/home/A Project/fresh/hello", b"hi")
        .await
        .unwrap();
    f.site.sync(&bg()).await.unwrap();
    let fs = f.site.loaded_collections();
    assert!(fs.iter().all(|c| !c.is_dirty()));

    for path in ["/home/A Project/fresh", "/home/foo", "/home", "/by_id"] {
        let err = f.site.mkdir(&bg(), path).await.unwrap_err();
        assert!(matches!(err, VfsError::AlreadyExists(_)), "{path}: {err}");
    }
    let err = f.site.mkdir(&bg(), "/by_id/whatever").await.unwrap_err();
    assert!(matches!(err, VfsError::InvalidOperation(_)), "{err}");
    let err = f
        .site
        .mkdir(&bg(), "/by_id/zzzzz-4zz18-000000000000000")
        .await
        .unwrap_err();
    assert!(matches!(err, VfsError::AlreadyExists(_)), "{err}");
    f.site.mkdir(&bg(), "/home/foo/sub").await.unwrap();
}

// ============================================================================
// Rename
// ============================================================================

#[tokio::test]
async fn test_rename_within_collection() {
    let f = fixture().await;
    f.site
        .rename(&bg(), "/home/A Project/bar/dir/baz", "/home/A Project/bar/moved")
        .await
        .unwrap();
    assert_eq!(read(&f.site, "/home/A Project/bar/moved").await, b"baz!");

    // Both ends may be spelled through different mounts.
    let by_id = format!("/by_id/{}/moved", f.bar.id());
    f.site
        .rename(&bg(), &by_id, "/home/A Project/bar/dir/back")
        .await
        .unwrap();
    assert_eq!(read(&f.site, "/home/A Project/bar/dir/back").await, b"baz!");
}

#[tokio::test]
async fn test_rename_across_boundaries() {
    let f = fixture().await;
    let cases = [
        ("/home/foo/foo", "/home/A Project/bar/foo"),
        ("/home/foo", "/home/foo2"),
        ("/home/foo", "/home/A Project/foo"),
        ("/home/A Project", "/home/B Project"),
        ("/home/foo/foo", "/home/foo"),
        ("/home/foo/foo", "/home/newname"),
    ];
    for (from, to) in cases {
        let err = f.site.rename(&bg(), from, to).await.unwrap_err();
        assert!(
            matches!(err, VfsError::InvalidOperation(_)),
            "{from} -> {to}: {err}"
        );
    }
    let err = f
        .site
        .rename(&bg(), "/home/foo/nope", "/home/foo/other")
        .await
        .unwrap_err();
    assert!(matches!(err, VfsError::NotFound(_)), "{err}");
    assert_eq!(read(&f.site, "/home/foo/foo").await, b"foo");
}

// ============================================================================
// Snapshot and splice
// ============================================================================

#[tokio::test]
async fn test_splice_between_collections() {
    let f = fixture().await;
    let snap = f.site.snapshot(&bg(), "/home/A Project/bar/dir").await.unwrap();
    f.site.splice(&bg(), "/home/foo/copied", &snap).await.unwrap();
    assert_eq!(read(&f.site, "/home/foo/copied/baz").await, b"baz!");

    let file = f.site.snapshot(&bg(), "/home/foo/foo").await.unwrap();
    f.site
        .splice(&bg(), "/home/A Project/bar/dir/foo", &file)
        .await
        .unwrap();

    f.site.sync(&bg()).await.unwrap();
    let foo = f.store.collection(f.foo.id()).unwrap();
    assert!(foo.manifest_text.contains("./copied"), "{}", foo.manifest_text);
    let bar = f.store.collection(f.bar.id()).unwrap();
    assert!(bar.manifest_text.contains(":foo"), "{}", bar.manifest_text);
}

#[tokio::test]
async fn test_splice_target_rules() {
    let f = fixture().await;
    let file = f.site.snapshot(&bg(), "/home/foo/foo").await.unwrap();
    let dir = f.site.snapshot(&bg(), "/home/A Project/bar/dir").await.unwrap();

    for path in ["", "/home/foo/", "/home/foo/newdir/"] {
        let err = f.site.splice(&bg(), path, &file).await.unwrap_err();
        assert!(matches!(err, VfsError::InvalidArgument(_)), "{path:?}: {err}");
    }

    let err = f.site.splice(&bg(), "/home/foo", &file).await.unwrap_err();
    assert!(matches!(err, VfsError::InvalidOperation(_)), "{err}");
    assert!(
        err.to_string()
            .contains("cannot use Splice to attach a file at top level of"),
        "{err}"
    );

    let err = f
        .site
        .splice(&bg(), "/home/foo/missing/name", &file)
        .await
        .unwrap_err();
    assert!(matches!(err, VfsError::NotFound(_)), "{err}");

    for path in ["/home/newcollection", "/home", "/by_id"] {
        let err = f.site.splice(&bg(), path, &dir).await.unwrap_err();
        assert!(matches!(err, VfsError::InvalidOperation(_)), "{path}: {err}");
    }

    // A directory replaces a collection's entire contents.
    f.site.splice(&bg(), "/home/foo", &dir).await.unwrap();
    assert_eq!(names(&f.site, "/home/foo").await, vec!["baz"]);
}

// ============================================================================
// Sync and loading
// ============================================================================

#[tokio::test]
async fn test_sync_all_dirty_collections() {
    let f = fixture().await;
    f.site.write_all(&bg(), "/home/foo/a", b"A").await.unwrap();
    f.site
        .write_all(&bg(), "/home/A Project/bar/b", b"B")
        .await
        .unwrap();
    // Loaded but unchanged: not committed.
    f.site
        .stat(&bg(), &format!("/by_id/{}", f.foo.portable_data_hash))
        .await
        .unwrap();

    f.site.sync(&bg()).await.unwrap();
    assert_eq!(f.store.commit_count(), 2);
    assert!(f.site.loaded_collections().iter().all(|c| !c.is_dirty()));

    let config = FsConfig::default();
    let fresh = SiteFs::new(Backend::from_store(f.store.clone(), &config), config);
    fresh.mount_project(&bg(), "home", "").await.unwrap();
    assert_eq!(read(&fresh, "/home/foo/a").await, b"A");
    assert_eq!(read(&fresh, "/home/A Project/bar/b").await, b"B");
}

#[tokio::test]
async fn test_sync_reports_failure_and_keeps_going() {
    let f = fixture().await;
    let foo = f.site.collection(&bg(), f.foo.id()).await.unwrap();
    let bar = f.site.collection(&bg(), f.bar.id()).await.unwrap();
    foo.set_storage_classes(vec!["archive".to_string()]).unwrap();
    foo.mkdir("d").unwrap();
    bar.mkdir("d").unwrap();

    let err = f.site.sync(&bg()).await.unwrap_err();
    assert!(err.to_string().contains("storage class \"archive\""), "{err}");
    assert!(foo.is_dirty());
    assert!(!bar.is_dirty());
}

#[tokio::test]
async fn test_forget_requires_clean() {
    let f = fixture().await;
    assert_eq!(names(&f.site, "/home/foo").await, vec!["foo"]);
    let foo = f.site.collection(&bg(), f.foo.id()).await.unwrap();
    foo.mkdir("d").unwrap();
    assert!(f.site.forget(f.foo.id()).is_err());
    f.site.sync(&bg()).await.unwrap();
    assert!(f.site.forget(f.foo.id()).unwrap());
    assert!(names(&f.site, "/by_id").await.is_empty());

    // Reloading picks up the committed state.
    assert_eq!(names(&f.site, "/home/foo").await, vec!["d", "foo"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_access_loads_once() {
    let f = fixture().await;
    f.store.set_latency(Duration::from_millis(20));
    let site = Arc::new(f.site);
    let path = format!("/by_id/{}/dir/baz", f.bar.id());

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let site = site.clone();
        let path = path.clone();
        tasks.push(tokio::spawn(async move {
            site.stat(&OpContext::background(), &path).await.unwrap().size
        }));
    }
    for t in tasks {
        assert_eq!(t.await.unwrap(), 4);
    }
    assert_eq!(f.store.collection_load_count(), 1);
}

#[tokio::test]
async fn test_cancelled_load_leaves_nothing_behind() {
    let f = fixture().await;
    f.store.set_latency(Duration::from_millis(200));
    let site = Arc::new(f.site);
    let ctx = OpContext::background();
    let path = format!("/by_id/{}", f.bar.id());

    let pending = {
        let site = site.clone();
        let ctx = ctx.clone();
        let path = path.clone();
        tokio::spawn(async move { site.stat(&ctx, &path).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    ctx.cancel();
    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, VfsError::Cancelled), "{err}");
    assert!(site.loaded_collections().is_empty());

    f.store.set_latency(Duration::ZERO);
    assert!(site.stat(&bg(), &path).await.unwrap().is_dir());
}
