// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Lifecycle tests for the file inode state machine.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use repofs_core::testing::FakeObjectStore;
use repofs_core::{
    BlobCache, DiskOverlay, EntryType, FetchContext, FileInode, InodeNumber, InodeSnapshot,
    MaterializationSink, MountContext, ObjectId, Overlay, RepoPath, RepoPathBuf, SnapshotState,
    StoreError,
};
use tempfile::TempDir;

#[derive(Default)]
struct RecordingSink {
    notified: Mutex<Vec<RepoPathBuf>>,
}

impl MaterializationSink for RecordingSink {
    fn child_materialized(&self, path: &RepoPath) {
        self.notified.lock().unwrap().push(path.to_owned());
    }
}

struct Env {
    _dir: TempDir,
    mount: Arc<MountContext>,
    sink: Arc<RecordingSink>,
    store: Arc<FakeObjectStore>,
    cache: BlobCache,
    overlay: Arc<DiskOverlay>,
}

impl Env {
    fn new() -> Env {
        let _ = tracing_subscriber::fmt().with_env_filter("repofs=trace").try_init();
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let mount = Arc::new(MountContext::new(Some(sink.clone())));
        let store = Arc::new(FakeObjectStore::new());
        let overlay = Arc::new(DiskOverlay::new(dir.path().join("overlay")).unwrap());
        Env {
            _dir: dir,
            mount,
            sink,
            store,
            cache: BlobCache::new(),
            overlay,
        }
    }

    fn virtual_inode(&self, ino: u64, path: &str, id: ObjectId) -> Arc<FileInode> {
        FileInode::new_virtual(
            InodeNumber(ino),
            EntryType::Regular,
            RepoPathBuf::parse(path).unwrap(),
            id,
            None,
            self.mount.clone(),
            self.store.clone(),
            self.cache.clone(),
            self.overlay.clone(),
        )
    }

    fn notifications(&self) -> Vec<RepoPathBuf> {
        self.sink.notified.lock().unwrap().clone()
    }
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn cold_read_covers_blob_and_drops_handle() {
    let env = Env::new();
    let contents = vec![7u8; 300];
    let id = env.store.add_blob(contents.clone());
    let inode = env.virtual_inode(2, "src/small.bin", id.clone());
    let ctx = FetchContext::unknown();

    let (data, eof) = inode.read(0, 300, &ctx).await.unwrap();
    assert_eq!(&data[..], &contents[..]);
    assert!(eof);
    assert!(!inode.is_materialized());
    assert_eq!(env.store.fetch_count(&id), 1);

    // Full coverage released the in-memory handle, so once the shared cache
    // forgets the blob the next read has to fetch again.
    env.cache.invalidate(&id);
    let (data, _) = inode.read(0, 300, &ctx).await.unwrap();
    assert_eq!(&data[..], &contents[..]);
    assert_eq!(env.store.fetch_count(&id), 2);
}

#[tokio::test]
async fn partial_reads_keep_the_handle() {
    let env = Env::new();
    let contents: Vec<u8> = (0..=255).collect();
    let id = env.store.add_blob(contents.clone());
    let inode = env.virtual_inode(3, "src/partial.bin", id.clone());
    let ctx = FetchContext::unknown();

    let (data, eof) = inode.read(0, 100, &ctx).await.unwrap();
    assert_eq!(&data[..], &contents[..100]);
    assert!(!eof);

    // The handle pins the blob even after cache eviction.
    env.cache.invalidate(&id);
    let (data, eof) = inode.read(100, 156, &ctx).await.unwrap();
    assert_eq!(&data[..], &contents[100..]);
    assert!(eof);
    assert_eq!(env.store.fetch_count(&id), 1);
}

#[tokio::test]
async fn read_past_eof_returns_empty() {
    let env = Env::new();
    let id = env.store.add_blob(&b"tiny"[..]);
    let inode = env.virtual_inode(4, "tiny.txt", id);
    let ctx = FetchContext::unknown();

    let (data, eof) = inode.read(10, 8, &ctx).await.unwrap();
    assert!(data.is_empty());
    assert!(eof);
}

#[tokio::test]
async fn concurrent_readers_share_one_fetch() {
    let env = Env::new();
    let contents = b"shared blob contents".to_vec();
    let id = env.store.add_blob(contents.clone());
    let inode = env.virtual_inode(5, "shared.txt", id.clone());

    env.store.hold_fetches();

    let reader = |inode: Arc<FileInode>| async move {
        let ctx = FetchContext::unknown();
        inode.read(0, 64, &ctx).await.unwrap().0
    };
    let a = tokio::spawn(reader(inode.clone()));
    let b = tokio::spawn(reader(inode.clone()));

    let store = env.store.clone();
    wait_for(move || store.fetches_started() == 1).await;
    env.store.release_fetches();

    let (a, b) = (a.await.unwrap(), b.await.unwrap());
    assert_eq!(&a[..], &contents[..]);
    assert_eq!(a, b);
    assert_eq!(env.store.fetch_count(&id), 1);
}

#[tokio::test]
async fn truncate_during_load_fulfills_subscribers_with_null_blob() {
    let env = Env::new();
    let id = env.store.add_blob(&b"to be discarded"[..]);
    let inode = env.virtual_inode(6, "overwritten.txt", id.clone());

    env.store.hold_fetches();

    let observer = {
        let inode = inode.clone();
        tokio::spawn(async move {
            let ctx = FetchContext::unknown();
            inode
                .run_while_loaded(&ctx, |state, blob| Ok((state.is_materialized(), blob)))
                .await
                .unwrap()
        })
    };

    let store = env.store.clone();
    wait_for(move || store.fetches_started() == 1).await;

    // Writer truncates while the load is parked at the gate.
    let ctx = FetchContext::unknown();
    inode
        .truncate_and_run(&ctx, |state| {
            assert!(state.is_materialized());
            Ok(())
        })
        .await
        .unwrap();

    let (materialized, blob) = observer.await.unwrap();
    assert!(materialized);
    assert!(blob.is_none());

    // The discarded load completes quietly in the background.
    env.store.release_fetches();
    tokio::task::yield_now().await;
    assert_eq!(env.notifications(), vec![RepoPathBuf::parse("overwritten.txt").unwrap()]);
}

#[tokio::test]
async fn load_failure_reverts_to_not_loaded() {
    let env = Env::new();
    let id = env.store.add_blob(&b"eventually readable"[..]);
    let inode = env.virtual_inode(7, "flaky.txt", id.clone());
    env.store.inject_error(id.clone(), StoreError::Transient("backend hiccup".into()));

    let ctx = FetchContext::unknown();
    let err = inode.read(0, 16, &ctx).await.unwrap_err();
    assert!(err.to_string().contains("backend hiccup"));
    assert!(!inode.is_materialized());

    // A retry after the transient failure starts a fresh load.
    env.store.clear_errors();
    let (data, _) = inode.read(0, 64, &ctx).await.unwrap();
    assert_eq!(&data[..], b"eventually readable");
    assert_eq!(env.store.fetch_count(&id), 2);
}

#[tokio::test]
async fn write_materializes_and_notifies_parent() {
    let env = Env::new();
    let id = env.store.add_blob(&b"committed contents"[..]);
    let inode = env.virtual_inode(8, "src/modified.rs", id.clone());
    let ctx = FetchContext::unknown();

    let written = inode.write(10, b"CHANGED!", &ctx).await.unwrap();
    assert_eq!(written, 8);
    assert!(inode.is_materialized());
    assert!(inode.committed_id().is_none());
    assert_eq!(env.notifications(), vec![RepoPathBuf::parse("src/modified.rs").unwrap()]);

    let (data, _) = inode.read(0, 64, &ctx).await.unwrap();
    assert_eq!(&data[..], b"committed CHANGED!");
}

#[tokio::test]
async fn truncate_skips_the_blob_fetch() {
    let env = Env::new();
    let id = env.store.add_blob(vec![1u8; 1024 * 1024]);
    let inode = env.virtual_inode(9, "big.bin", id.clone());
    let ctx = FetchContext::unknown();

    inode.truncate_and_run(&ctx, |_state| Ok(())).await.unwrap();
    assert!(inode.is_materialized());
    assert_eq!(env.store.fetch_count(&id), 0);
    assert_eq!(inode.size(&ctx).await.unwrap(), 0);
}

#[tokio::test]
async fn already_materialized_runs_directly() {
    let env = Env::new();
    let inode = FileInode::new_materialized(
        InodeNumber(10),
        EntryType::Regular,
        RepoPathBuf::parse("local.txt").unwrap(),
        env.mount.clone(),
        env.store.clone(),
        env.cache.clone(),
        env.overlay.clone(),
    );
    env.overlay.create_empty_file(InodeNumber(10)).unwrap();

    let ctx = FetchContext::unknown();
    inode.write(0, b"purely local", &ctx).await.unwrap();
    let (data, _) = inode.read(0, 64, &ctx).await.unwrap();
    assert_eq!(&data[..], b"purely local");

    // No transition happened, so the parent was never notified.
    assert!(env.notifications().is_empty());
}

#[tokio::test]
async fn sha1_follows_materialization() {
    let env = Env::new();
    let contents = b"hash me";
    let id = env.store.add_blob(&contents[..]);
    let inode = env.virtual_inode(11, "hashed.txt", id.clone());
    let ctx = FetchContext::unknown();

    let committed = repofs_core::Hash20::sha1(contents);
    assert_eq!(inode.sha1(&ctx).await.unwrap(), committed);

    inode.write(0, b"HASH", &ctx).await.unwrap();
    assert_eq!(inode.sha1(&ctx).await.unwrap(), repofs_core::Hash20::sha1(b"HASH me"));
}

#[tokio::test]
async fn size_is_cached_after_first_lookup() {
    let env = Env::new();
    let id = env.store.add_blob(vec![0u8; 4096]);
    let inode = env.virtual_inode(12, "sized.bin", id);
    let ctx = FetchContext::unknown();

    assert_eq!(inode.size(&ctx).await.unwrap(), 4096);
    assert_eq!(inode.size(&ctx).await.unwrap(), 4096);
}

#[tokio::test]
async fn identity_fast_path() {
    let env = Env::new();
    let id = env.store.add_blob(&b"identity"[..]);
    let inode = env.virtual_inode(13, "same.txt", id.clone());
    let ctx = FetchContext::unknown();

    // Same committed id: equal without any fetch.
    assert!(inode.is_same_as_id(&id, EntryType::Regular, &ctx).await);
    assert_eq!(env.store.fetch_count(&id), 0);

    // Differing entry type loses on the fast path.
    assert!(!inode.is_same_as_id(&id, EntryType::Symlink, &ctx).await);
}

#[tokio::test]
async fn identity_slow_path_compares_content() {
    let env = Env::new();
    let contents = b"slow path contents";
    let id = env.store.add_blob(&contents[..]);
    let inode = env.virtual_inode(14, "slow.txt", id.clone());
    let ctx = FetchContext::unknown();

    // Materialize with identical bytes: ids are gone, content hashing says
    // unchanged.
    inode.run_while_materialized(&ctx, |_state| Ok(())).await.unwrap();
    assert!(inode.is_same_as_id(&id, EntryType::Regular, &ctx).await);

    inode.write(0, b"SLOW", &ctx).await.unwrap();
    assert!(!inode.is_same_as_id(&id, EntryType::Regular, &ctx).await);
}

#[tokio::test]
async fn identity_errors_mean_changed() {
    let env = Env::new();
    let id = env.store.add_blob(&b"unreachable"[..]);
    let inode = env.virtual_inode(15, "err.txt", id.clone());
    let ctx = FetchContext::unknown();

    let other = ObjectId::sha1(b"some other commit");
    assert!(!inode.is_same_as_id(&other, EntryType::Regular, &ctx).await);
}

#[tokio::test]
async fn snapshot_requires_quiescence() {
    let env = Env::new();
    let id = env.store.add_blob(&b"snapshot me"[..]);
    let inode = env.virtual_inode(16, "snap.txt", id.clone());

    match inode.snapshot().unwrap().state {
        SnapshotState::NonMaterialized { id: snap_id, size } => {
            assert_eq!(snap_id, id);
            assert_eq!(size, None);
        }
        other => panic!("unexpected snapshot state: {:?}", other),
    }

    env.store.hold_fetches();
    let loader = {
        let inode = inode.clone();
        tokio::spawn(async move {
            let ctx = FetchContext::unknown();
            inode.read(0, 16, &ctx).await.unwrap();
        })
    };
    let store = env.store.clone();
    wait_for(move || store.fetches_started() == 1).await;

    // A load is in flight: snapshotting must be refused until quiesced.
    assert!(inode.snapshot().is_err());

    env.store.release_fetches();
    inode.quiesce().await.unwrap();
    loader.await.unwrap();
    assert!(inode.snapshot().is_ok());
}

#[tokio::test]
async fn snapshot_restore_roundtrip() {
    let env = Env::new();
    let id = env.store.add_blob(&b"carried across"[..]);
    let inode = env.virtual_inode(17, "carried.txt", id.clone());
    let ctx = FetchContext::unknown();
    assert_eq!(inode.size(&ctx).await.unwrap(), 14);

    let snapshot = inode.snapshot().unwrap();
    assert_eq!(
        snapshot.state,
        SnapshotState::NonMaterialized {
            id: id.clone(),
            size: Some(14)
        }
    );

    // "New process": fresh cache and mount, same overlay and store.
    let restored: Arc<FileInode> = InodeSnapshot::restore(
        snapshot,
        Arc::new(MountContext::default()),
        env.store.clone(),
        BlobCache::new(),
        env.overlay.clone(),
    );
    let (data, _) = restored.read(0, 64, &ctx).await.unwrap();
    assert_eq!(&data[..], b"carried across");
}
