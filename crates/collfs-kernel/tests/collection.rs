//! Collection filesystem against an in-memory backend: persistence,
//! lazy loading, failure handling and concurrent access.

use std::sync::Arc;
use std::time::Duration;

use collfs_keep::MemoryStore;
use collfs_kernel::{Backend, CollectionFs, FsConfig, Manifest, OpContext, VfsError, VfsOps};
use collfs_types::CollectionRecord;

// ============================================================================
// Shared test setup
// ============================================================================

fn small_blocks() -> FsConfig {
    FsConfig {
        block_size: 16,
        debug_locks: true,
        ..FsConfig::default()
    }
}

/// A fresh backend each time, so nothing is served from a shared cache.
fn backend(store: &Arc<MemoryStore>, config: &FsConfig) -> Backend {
    Backend::from_store(store.clone(), config)
}

async fn load(store: &Arc<MemoryStore>, config: &FsConfig, id: &str) -> CollectionFs {
    CollectionFs::load(
        &OpContext::background(),
        backend(store, config),
        Arc::new(config.clone()),
        id,
    )
    .await
    .unwrap()
}

fn new_collection(store: &Arc<MemoryStore>, manifest: &str) -> CollectionRecord {
    let owner = store.add_project("fixtures", "");
    store.add_collection("c", &owner.uuid, manifest)
}

async fn read(fs: &CollectionFs, path: &str) -> Vec<u8> {
    VfsOps::read_all(fs, &OpContext::background(), path)
        .await
        .unwrap()
}

async fn write(fs: &CollectionFs, path: &str, data: &[u8]) {
    VfsOps::write_all(fs, &OpContext::background(), path, data)
        .await
        .unwrap()
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

// ============================================================================
// Persistence
// ============================================================================

#[tokio::test]
async fn test_round_trip_across_block_boundaries() {
    let store = Arc::new(MemoryStore::new());
    let config = small_blocks();
    let rec = new_collection(&store, "");
    let ctx = OpContext::background();
    let fs = load(&store, &config, rec.id()).await;

    fs.mkdir("dir").unwrap();
    fs.mkdir("dir/empty").unwrap();
    write(&fs, "zero", b"").await;
    write(&fs, "one_block", &pattern(16)).await;
    write(&fs, "dir/multi", &pattern(50)).await;
    assert!(fs.is_dirty());

    fs.sync(&ctx).await.unwrap();
    assert!(!fs.is_dirty());
    // 66 pending bytes pack into ceil(66 / 16) blocks.
    assert_eq!(store.put_count(), 5);

    let stored = store.collection(rec.id()).unwrap();
    assert_eq!(stored.portable_data_hash, fs.portable_data_hash());
    let manifest = Manifest::parse(&stored.manifest_text).unwrap();
    let files = manifest.inspect().files;
    assert!(files.contains(&("./dir".to_string(), "multi".to_string(), 50)));
    assert!(files.contains(&(".".to_string(), "zero".to_string(), 0)));

    let reloaded = load(&store, &config, rec.id()).await;
    assert_eq!(read(&reloaded, "zero").await, b"");
    assert_eq!(read(&reloaded, "one_block").await, pattern(16));
    assert_eq!(read(&reloaded, "dir/multi").await, pattern(50));
    assert!(reloaded.stat("dir/empty").unwrap().is_dir());
    assert_eq!(reloaded.stat("dir/multi").unwrap().size, 50);
}

#[tokio::test]
async fn test_sync_when_clean_is_noop() {
    let store = Arc::new(MemoryStore::new());
    let config = small_blocks();
    let rec = new_collection(&store, "");
    let fs = load(&store, &config, rec.id()).await;

    fs.sync(&OpContext::background()).await.unwrap();
    assert_eq!(store.commit_count(), 0);
    assert_eq!(store.put_count(), 0);
}

#[tokio::test]
async fn test_partial_overwrite_keeps_stored_ranges() {
    let store = Arc::new(MemoryStore::new());
    let config = small_blocks();
    let loc = store.store_block(b"0123456789");
    let rec = new_collection(&store, &format!(". {} 0:10:f\n", loc));
    let ctx = OpContext::background();
    let fs = load(&store, &config, rec.id()).await;

    let mut handle = fs
        .open_file("f", collfs_kernel::OpenFlags::write())
        .unwrap();
    handle.seek(std::io::SeekFrom::Start(3)).unwrap();
    handle.write(b"abc").unwrap();
    handle.close().unwrap();
    assert_eq!(read(&fs, "f").await, b"012abc6789");

    fs.sync(&ctx).await.unwrap();
    // Only the three overwritten bytes are uploaded.
    assert_eq!(store.put_count(), 1);
    let reloaded = load(&store, &config, rec.id()).await;
    assert_eq!(read(&reloaded, "f").await, b"012abc6789");
}

#[tokio::test]
async fn test_failed_commit_leaves_dirty() {
    let store = Arc::new(MemoryStore::new());
    let config = small_blocks();
    let rec = new_collection(&store, "");
    let ctx = OpContext::background();
    let fs = load(&store, &config, rec.id()).await;

    write(&fs, "f", b"data").await;
    store.fail_next_commit();
    let err = fs.sync(&ctx).await.unwrap_err();
    assert!(matches!(err, VfsError::Conflict(_)), "{err}");
    assert!(fs.is_dirty());
    assert_eq!(store.collection(rec.id()).unwrap().manifest_text, "");
    assert_eq!(read(&fs, "f").await, b"data");

    fs.sync(&ctx).await.unwrap();
    assert!(!fs.is_dirty());
    let reloaded = load(&store, &config, rec.id()).await;
    assert_eq!(read(&reloaded, "f").await, b"data");
}

#[tokio::test]
async fn test_unsatisfiable_storage_class() {
    let store = Arc::new(MemoryStore::new());
    let config = small_blocks();
    let rec = new_collection(&store, "");
    let ctx = OpContext::background();
    let fs = load(&store, &config, rec.id()).await;

    fs.set_storage_classes(vec!["archive".to_string()]).unwrap();
    write(&fs, "f", b"precious").await;
    let err = fs.sync(&ctx).await.unwrap_err();
    assert!(matches!(err, VfsError::StorageClassUnsatisfiable(_)), "{err}");
    assert!(err.to_string().contains("storage class \"archive\""), "{err}");
    assert!(fs.is_dirty());
    assert_eq!(store.commit_count(), 0);

    store.set_supported_classes(&["default", "archive"]);
    fs.sync(&ctx).await.unwrap();
    let stored = store.collection(rec.id()).unwrap();
    assert_eq!(stored.storage_classes_confirmed, vec!["archive".to_string()]);
}

#[tokio::test]
async fn test_desired_classes_come_from_record() {
    let store = Arc::new(MemoryStore::new());
    let config = small_blocks();
    let rec = new_collection(&store, "");
    store.set_desired_classes(rec.id(), &["archive"]);
    let fs = load(&store, &config, rec.id()).await;
    assert_eq!(fs.storage_classes(), vec!["archive".to_string()]);

    fs.mkdir("d").unwrap();
    let err = fs.sync(&OpContext::background()).await.unwrap_err();
    assert!(err.to_string().contains("storage class \"archive\""), "{err}");
    assert!(fs.is_dirty());
}

// ============================================================================
// Lazy loading and signatures
// ============================================================================

#[tokio::test]
async fn test_blocks_fetched_on_first_read_only() {
    let store = Arc::new(MemoryStore::new());
    let config = small_blocks();
    let a = store.store_block(b"aaaa");
    let b = store.store_block(b"bbbb");
    let rec = new_collection(&store, &format!(". {} {} 0:4:a 4:4:b\n", a, b));
    let fs = load(&store, &config, rec.id()).await;

    assert_eq!(fs.readdir("").unwrap().len(), 2);
    assert_eq!(fs.stat("b").unwrap().size, 4);
    assert_eq!(store.fetch_count(), 0);

    assert_eq!(read(&fs, "a").await, b"aaaa");
    assert_eq!(store.fetch_count(), 1);
    assert_eq!(read(&fs, "a").await, b"aaaa");
    assert_eq!(store.fetch_count(), 1);
    assert_eq!(read(&fs, "b").await, b"bbbb");
    assert_eq!(store.fetch_count(), 2);
}

#[tokio::test]
async fn test_expired_signature_is_refreshed() {
    let store = Arc::new(MemoryStore::new());
    let config = small_blocks();
    let loc = store.store_block(b"hello");
    let rec = new_collection(&store, &format!(". {} 0:5:f\n", loc));
    let fs = load(&store, &config, rec.id()).await;

    store.expire_next_fetches(1);
    assert_eq!(read(&fs, "f").await, b"hello");
    assert_eq!(store.fetch_count(), 2);
}

#[tokio::test]
async fn test_stale_signature_after_clock_moves() {
    let store = Arc::new(MemoryStore::new());
    let config = small_blocks();
    let loc = store.store_block(b"later");
    let rec = new_collection(&store, &format!(". {} 0:5:f\n", loc));
    let fs = load(&store, &config, rec.id()).await;

    store.advance_clock(Duration::from_secs(30 * 24 * 3600));
    assert_eq!(read(&fs, "f").await, b"later");
}

/// The signed form of the block with hash `hash_hex` in manifest text.
fn signed_token(manifest: &str, hash_hex: &str) -> String {
    manifest
        .split_whitespace()
        .find(|t| t.starts_with(hash_hex))
        .unwrap()
        .to_string()
}

#[tokio::test]
async fn test_sync_resigns_expired_stored_locators() {
    let store = Arc::new(MemoryStore::new());
    let config = small_blocks();
    let loc = store.store_block(b"hello");
    let rec = new_collection(&store, &format!(". {} 0:5:f\n", loc));
    let ctx = OpContext::background();
    let fs = load(&store, &config, rec.id()).await;
    let hash = loc.hash_hex();
    let before = signed_token(&fs.manifest_text().unwrap(), &hash);

    // Every signature handed out at load time is now stale on the store side.
    store.advance_clock(Duration::from_secs(30 * 24 * 3600));
    write(&fs, "new", b"new").await;
    fs.sync(&ctx).await.unwrap();
    assert!(!fs.is_dirty());

    // The live tree now carries the fresh signature.
    let after = signed_token(&fs.manifest_text().unwrap(), &hash);
    assert_ne!(before, after);
    let commits = store.commit_count();
    write(&fs, "newer", b"newer").await;
    fs.sync(&ctx).await.unwrap();
    assert_eq!(store.commit_count(), commits + 1);

    let reloaded = load(&store, &config, rec.id()).await;
    assert_eq!(read(&reloaded, "f").await, b"hello");
    assert_eq!(read(&reloaded, "new").await, b"new");
    assert_eq!(read(&reloaded, "newer").await, b"newer");
}

// ============================================================================
// Oversized writes
// ============================================================================

#[tokio::test]
async fn test_write_past_max_size_is_rejected() {
    let store = Arc::new(MemoryStore::new());
    let config = small_blocks();
    let rec = new_collection(&store, "");
    let fs = load(&store, &config, rec.id()).await;
    write(&fs, "f", b"abc").await;

    let h = fs
        .open_file("f", collfs_kernel::OpenFlags::write())
        .unwrap();
    assert!(matches!(
        h.write_at(u64::MAX, b"x"),
        Err(VfsError::InvalidArgument(_))
    ));
    assert!(matches!(h.truncate(u64::MAX), Err(VfsError::InvalidArgument(_))));
    // The file lock was released and the content is untouched.
    assert_eq!(read(&fs, "f").await, b"abc");
}

#[tokio::test]
async fn test_sparse_write_syncs_zeros() {
    let store = Arc::new(MemoryStore::new());
    let config = small_blocks();
    let rec = new_collection(&store, "");
    let ctx = OpContext::background();
    let fs = load(&store, &config, rec.id()).await;

    let h = fs
        .open_file("f", collfs_kernel::OpenFlags::create())
        .unwrap();
    h.write_at(40, b"end").unwrap();
    assert_eq!(fs.stat("f").unwrap().size, 43);
    fs.sync(&ctx).await.unwrap();

    let mut expected = vec![0u8; 40];
    expected.extend_from_slice(b"end");
    let reloaded = load(&store, &config, rec.id()).await;
    assert_eq!(read(&reloaded, "f").await, expected);
}

// ============================================================================
// Cancellation and deadlines
// ============================================================================

#[tokio::test]
async fn test_cancelled_read() {
    let store = Arc::new(MemoryStore::new());
    let config = small_blocks();
    let loc = store.store_block(b"slow");
    let rec = new_collection(&store, &format!(". {} 0:4:f\n", loc));
    let fs = load(&store, &config, rec.id()).await;
    store.set_latency(Duration::from_millis(200));

    let ctx = OpContext::background();
    let reader = {
        let fs = fs.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move { VfsOps::read_all(&fs, &ctx, "f").await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    ctx.cancel();
    let err = reader.await.unwrap().unwrap_err();
    assert!(matches!(err, VfsError::Cancelled), "{err}");

    // The tree is untouched and later reads work.
    store.set_latency(Duration::ZERO);
    assert_eq!(read(&fs, "f").await, b"slow");
}

#[tokio::test]
async fn test_sync_deadline() {
    let store = Arc::new(MemoryStore::new());
    let config = small_blocks();
    let rec = new_collection(&store, "");
    let fs = load(&store, &config, rec.id()).await;
    write(&fs, "f", b"data").await;
    store.set_latency(Duration::from_millis(200));

    let ctx = OpContext::with_timeout(Duration::from_millis(20));
    let err = fs.sync(&ctx).await.unwrap_err();
    assert!(matches!(err, VfsError::TimedOut), "{err}");
    assert!(fs.is_dirty());
    assert_eq!(store.commit_count(), 0);
}

// ============================================================================
// Snapshots
// ============================================================================

#[tokio::test]
async fn test_snapshot_copy_between_collections() {
    let store = Arc::new(MemoryStore::new());
    let config = small_blocks();
    let loc = store.store_block(b"stored-bytes");
    let src_rec = new_collection(&store, &format!("./d {} 0:12:f\n", loc));
    let dst_rec = new_collection(&store, "");
    let ctx = OpContext::background();
    let src = load(&store, &config, src_rec.id()).await;
    let dst = load(&store, &config, dst_rec.id()).await;

    write(&src, "d/pending", b"not yet stored").await;
    let snap = src.snapshot("d").unwrap();
    dst.splice("copy", &snap).unwrap();

    // Later edits on either side stay on that side.
    write(&src, "d/f", b"changed").await;
    write(&dst, "copy/pending", b"other").await;
    assert_eq!(read(&dst, "copy/f").await, b"stored-bytes");
    assert_eq!(read(&src, "d/pending").await, b"not yet stored");

    dst.sync(&ctx).await.unwrap();
    src.sync(&ctx).await.unwrap();
    let reloaded = load(&store, &config, dst_rec.id()).await;
    assert_eq!(read(&reloaded, "copy/f").await, b"stored-bytes");
    assert_eq!(read(&reloaded, "copy/pending").await, b"other");
    let reloaded = load(&store, &config, src_rec.id()).await;
    assert_eq!(read(&reloaded, "d/f").await, b"changed");
}

#[tokio::test]
async fn test_snapshot_of_pending_append_is_isolated() {
    let store = Arc::new(MemoryStore::new());
    let config = small_blocks();
    let rec = new_collection(&store, "");
    let fs = load(&store, &config, rec.id()).await;

    write(&fs, "log", b"one").await;
    let snap = fs.snapshot("log").unwrap();
    let mut handle = fs
        .open_file("log", collfs_kernel::OpenFlags::append())
        .unwrap();
    handle.write(b" two").unwrap();
    fs.splice("old", &snap).unwrap();

    assert_eq!(read(&fs, "log").await, b"one two");
    assert_eq!(read(&fs, "old").await, b"one");
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_write_during_sync_stays_dirty() {
    let store = Arc::new(MemoryStore::new());
    let config = small_blocks();
    let rec = new_collection(&store, "");
    let fs = load(&store, &config, rec.id()).await;
    write(&fs, "f", b"first").await;
    store.set_latency(Duration::from_millis(100));

    let syncing = {
        let fs = fs.clone();
        tokio::spawn(async move { fs.sync(&OpContext::background()).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    write(&fs, "f", b"second").await;
    syncing.await.unwrap().unwrap();

    assert!(fs.is_dirty());
    assert_eq!(read(&fs, "f").await, b"second");

    store.set_latency(Duration::ZERO);
    fs.sync(&OpContext::background()).await.unwrap();
    assert!(!fs.is_dirty());
    let reloaded = load(&store, &config, rec.id()).await;
    assert_eq!(read(&reloaded, "f").await, b"second");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_readdir_during_renames() {
    let store = Arc::new(MemoryStore::new());
    let config = small_blocks();
    let rec = new_collection(&store, "");
    let fs = load(&store, &config, rec.id()).await;
    fs.mkdir("d").unwrap();
    for i in 0..20 {
        write(&fs, &format!("d/f{i}"), b"x").await;
    }

    let mover = {
        let fs = fs.clone();
        tokio::spawn(async move {
            for i in 0..20 {
                fs.rename(&format!("d/f{i}"), &format!("d/g{i}")).unwrap();
                tokio::task::yield_now().await;
            }
        })
    };
    let mut listers = Vec::new();
    for _ in 0..4 {
        let fs = fs.clone();
        listers.push(tokio::spawn(async move {
            for _ in 0..50 {
                let entries = fs.readdir("d").unwrap();
                assert_eq!(entries.len(), 20, "{entries:?}");
                let mut seen = [0u32; 20];
                for e in &entries {
                    let i: usize = e.name[1..].parse().unwrap();
                    seen[i] += 1;
                }
                assert!(seen.iter().all(|&n| n == 1), "{entries:?}");
                tokio::task::yield_now().await;
            }
        }));
    }
    mover.await.unwrap();
    for l in listers {
        l.await.unwrap();
    }
    let names: Vec<String> = fs.readdir("d").unwrap().into_iter().map(|e| e.name).collect();
    assert!(names.iter().all(|n| n.starts_with('g')));
    assert_eq!(names.len(), 20);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers_to_distinct_files() {
    let store = Arc::new(MemoryStore::new());
    let config = small_blocks();
    let rec = new_collection(&store, "");
    let fs = load(&store, &config, rec.id()).await;

    let mut tasks = Vec::new();
    for i in 0..8 {
        let fs = fs.clone();
        tasks.push(tokio::spawn(async move {
            let data = vec![b'a' + i as u8; 40];
            VfsOps::write_all(&fs, &OpContext::background(), &format!("f{i}"), &data)
                .await
                .unwrap();
        }));
    }
    for t in tasks {
        t.await.unwrap();
    }
    fs.sync(&OpContext::background()).await.unwrap();

    let reloaded = load(&store, &config, rec.id()).await;
    for i in 0..8 {
        assert_eq!(read(&reloaded, &format!("f{i}")).await, vec![b'a' + i as u8; 40]);
    }
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_overwrite_with_and_without_truncate() {
    let store = Arc::new(MemoryStore::new());
    let config = small_blocks();
    let rec = new_collection(&store, "");
    let fs = load(&store, &config, rec.id()).await;
    write(&fs, "foo", b"ab").await;

    let mut handle = fs
        .open_file("foo", collfs_kernel::OpenFlags::create_truncate())
        .unwrap();
    handle.write(b"b").unwrap();
    handle.close().unwrap();
    assert_eq!(read(&fs, "foo").await, b"b");

    write(&fs, "bar", b"abcd").await;
    let mut handle = fs
        .open_file("bar", collfs_kernel::OpenFlags::write())
        .unwrap();
    handle.write(b"ba").unwrap();
    handle.close().unwrap();
    assert_eq!(read(&fs, "bar").await, b"bacd");
    assert_eq!(fs.stat("bar").unwrap().size, 4);
}

#[tokio::test]
async fn test_splice_same_snapshot_twice() {
    let store = Arc::new(MemoryStore::new());
    let config = small_blocks();
    let rec = new_collection(&store, "");
    let fs = load(&store, &config, rec.id()).await;
    fs.mkdir("src").unwrap();
    write(&fs, "src/foo", b"foo").await;
    write(&fs, "src/bar", b"bar").await;

    let snap = fs.snapshot("src").unwrap();
    fs.mkdir("copy").unwrap();
    fs.splice("copy/a", &snap).unwrap();
    fs.splice("copy/b", &snap).unwrap();

    write(&fs, "copy/a/foo", b"changed").await;
    fs.rename("copy/a/bar", "copy/a/baz").unwrap();
    fs.remove_all("src").unwrap();

    let listed: Vec<String> = fs.readdir("copy/b").unwrap().into_iter().map(|e| e.name).collect();
    assert_eq!(listed, vec!["bar", "foo"]);
    assert_eq!(read(&fs, "copy/b/foo").await, b"foo");
    assert_eq!(read(&fs, "copy/b/bar").await, b"bar");
}
