// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! End-to-end channel tests against the fake projection service.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use repofs_core::{MountConfig, RepoPathBuf};
use repofs_projfs_host::testing::{FakeProjectionOs, TestDispatcher, VecDirEntryBuffer};
use repofs_projfs_host::{
    CallbackData, EnumEntry, ErrorCode, Guid, NotificationKind, ProjfsChannel,
};

struct Env {
    dispatcher: Arc<TestDispatcher>,
    os: Arc<FakeProjectionOs>,
    channel: ProjfsChannel,
}

fn env() -> Env {
    env_with_config(MountConfig {
        mount_guid: *b"repofs-test-guid",
        timeout_ms: 5_000,
        use_negative_path_caching: true,
        read_only: false,
    })
}

fn env_with_config(config: MountConfig) -> Env {
    let _ = tracing_subscriber::fmt().with_env_filter("repofs=trace").try_init();
    let dispatcher = Arc::new(TestDispatcher::new());
    let os = Arc::new(FakeProjectionOs::new());
    let channel = ProjfsChannel::new(
        PathBuf::from("/mnt/repo"),
        dispatcher.clone(),
        os.clone(),
        config,
    );
    Env {
        dispatcher,
        os,
        channel,
    }
}

fn started() -> Env {
    let env = env();
    env.channel.start().unwrap();
    env
}

/// Callback data from a foreign process (never our own pid).
fn cb(command_id: i32, path: &str) -> CallbackData {
    CallbackData::new(
        command_id,
        std::process::id().wrapping_add(1),
        RepoPathBuf::parse(path).unwrap(),
    )
}

fn recursive_cb(command_id: i32, path: &str) -> CallbackData {
    CallbackData::new(command_id, std::process::id(), RepoPathBuf::parse(path).unwrap())
}

/// An OS-owned enumeration buffer with room for `entries` names of up to 16
/// bytes each.
fn dir_buffer(entries: usize) -> Arc<Mutex<VecDirEntryBuffer>> {
    Arc::new(Mutex::new(VecDirEntryBuffer::with_room_for(entries, 16)))
}

fn buffer_names(buffer: &Arc<Mutex<VecDirEntryBuffer>>) -> Vec<String> {
    buffer.lock().unwrap().entries().iter().map(|(name, _)| name.clone()).collect()
}

fn seed_src_listing(dispatcher: &TestDispatcher) {
    dispatcher.add_directory(
        "src",
        vec![
            EnumEntry {
                name: "lib.rs".to_string(),
                is_dir: false,
                size: 100,
            },
            EnumEntry {
                name: "notes.txt".to_string(),
                is_dir: false,
                size: 20,
            },
            EnumEntry {
                name: "tests".to_string(),
                is_dir: true,
                size: 0,
            },
        ],
    );
}

#[tokio::test]
async fn start_registers_with_the_os() {
    let env = env();
    env.os.set_negative_cache_entries(5);
    env.channel.start().unwrap();

    assert!(env.os.is_started());
    let options = env.os.start_options().unwrap();
    assert!(options.use_negative_path_caching);
    assert_eq!(options.notification_mask, NotificationKind::full_mask());

    // The mount root was converted to a placeholder and the negative path
    // cache flushed.
    assert_eq!(env.os.placeholder_dirs(), vec![None]);
    assert_eq!(env.channel.flush_negative_path_cache().unwrap(), 0);
}

#[tokio::test]
async fn read_only_mounts_are_not_implemented() {
    let env = env_with_config(MountConfig {
        read_only: true,
        ..MountConfig::default()
    });
    assert!(env.channel.start().is_err());
    assert!(!env.os.is_started());
}

#[tokio::test]
async fn callbacks_before_start_are_invalid() {
    let env = env();
    assert_eq!(
        env.channel.get_placeholder_info(cb(1, "src/lib.rs")),
        ErrorCode::INVALID_PARAMETER
    );
}

#[tokio::test]
async fn recursive_callbacks_are_denied() {
    let env = started();
    let session = Guid::from_u128(1);
    assert_eq!(
        env.channel.start_enumeration(recursive_cb(1, "src"), session),
        ErrorCode::ACCESS_DENIED
    );
    assert_eq!(
        env.channel.get_placeholder_info(recursive_cb(2, "src/lib.rs")),
        ErrorCode::ACCESS_DENIED
    );
    assert_eq!(
        env.channel.get_file_data(recursive_cb(3, "src/lib.rs"), 0, 16),
        ErrorCode::ACCESS_DENIED
    );
    assert_eq!(
        env.channel.notification(
            recursive_cb(4, "src/lib.rs"),
            false,
            NotificationKind::NewFileCreated.as_raw(),
            RepoPathBuf::root(),
        ),
        ErrorCode::ACCESS_DENIED
    );
}

#[tokio::test]
async fn enumeration_drains_in_buffer_sized_batches() {
    let env = started();
    seed_src_listing(&env.dispatcher);
    let session = Guid::from_u128(0xA);

    assert_eq!(
        env.channel.start_enumeration(cb(1, "src"), session),
        ErrorCode::IO_PENDING
    );
    assert_eq!(env.os.wait_for_completion(1).await.code, ErrorCode::SUCCESS);

    let buffer = dir_buffer(2);
    assert_eq!(
        env.channel.get_enumeration_data(cb(2, "src"), session, None, buffer.clone()),
        ErrorCode::IO_PENDING
    );
    assert_eq!(env.os.wait_for_completion(2).await.code, ErrorCode::SUCCESS);
    assert_eq!(buffer_names(&buffer), vec!["lib.rs", "notes.txt"]);

    // The wildcard defaulted to `*`.
    assert_eq!(
        env.channel.enumeration_search_expression(&session).as_deref(),
        Some("*")
    );

    // Next call picks up where the cursor left off.
    let buffer = dir_buffer(2);
    env.channel.get_enumeration_data(cb(3, "src"), session, None, buffer.clone());
    assert_eq!(env.os.wait_for_completion(3).await.code, ErrorCode::SUCCESS);
    {
        let buffer = buffer.lock().unwrap();
        let entries = buffer.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "tests");
        assert!(entries[0].1.is_dir);
    }

    // Fully drained: success with nothing added.
    let buffer = dir_buffer(2);
    env.channel.get_enumeration_data(cb(4, "src"), session, None, buffer.clone());
    assert_eq!(env.os.wait_for_completion(4).await.code, ErrorCode::SUCCESS);
    assert!(buffer_names(&buffer).is_empty());
}

#[tokio::test]
async fn enumeration_restart_resets_cursor_and_expression() {
    let env = started();
    seed_src_listing(&env.dispatcher);
    let session = Guid::from_u128(0xB);

    env.channel.start_enumeration(cb(1, "src"), session);
    env.os.wait_for_completion(1).await;

    let buffer = dir_buffer(2);
    env.channel.get_enumeration_data(cb(2, "src"), session, None, buffer.clone());
    env.os.wait_for_completion(2).await;
    assert_eq!(buffer_names(&buffer).len(), 2);

    // Restart with a new expression: the cursor goes back to the start and
    // the expression is replaced.
    let mut restart = cb(3, "src");
    restart.restart_scan = true;
    let buffer = dir_buffer(3);
    env.channel.get_enumeration_data(restart, session, Some("*.txt"), buffer.clone());
    env.os.wait_for_completion(3).await;
    assert_eq!(buffer_names(&buffer), vec!["lib.rs", "notes.txt", "tests"]);
    assert_eq!(
        env.channel.enumeration_search_expression(&session).as_deref(),
        Some("*.txt")
    );
}

#[tokio::test]
async fn unknown_enumeration_session_is_invalid() {
    let env = started();
    let buffer = dir_buffer(2);
    assert_eq!(
        env.channel.get_enumeration_data(cb(1, "src"), Guid::from_u128(0xC), None, buffer),
        ErrorCode::INVALID_PARAMETER
    );
}

#[tokio::test]
async fn first_entry_too_big_reports_insufficient_buffer() {
    let env = started();
    seed_src_listing(&env.dispatcher);
    let session = Guid::from_u128(0xD);
    env.channel.start_enumeration(cb(1, "src"), session);
    env.os.wait_for_completion(1).await;

    let buffer = Arc::new(Mutex::new(VecDirEntryBuffer::new(4)));
    env.channel.get_enumeration_data(cb(2, "src"), session, None, buffer);
    assert_eq!(
        env.os.wait_for_completion(2).await.code,
        ErrorCode::INSUFFICIENT_BUFFER
    );
}

#[tokio::test]
async fn end_enumeration_always_succeeds() {
    let env = started();
    seed_src_listing(&env.dispatcher);
    let session = Guid::from_u128(0xE);
    env.channel.start_enumeration(cb(1, "src"), session);
    env.os.wait_for_completion(1).await;

    assert_eq!(env.channel.end_enumeration(cb(2, "src"), session), ErrorCode::SUCCESS);
    // Closes may be retried; unknown sessions still succeed.
    assert_eq!(env.channel.end_enumeration(cb(3, "src"), session), ErrorCode::SUCCESS);
}

#[tokio::test]
async fn placeholder_for_known_file() {
    let env = started();
    env.dispatcher.add_file("src/lib.rs", &b"pub mod io;"[..]);
    let refcount = Arc::new(AtomicU32::new(0));
    {
        let refcount = refcount.clone();
        env.dispatcher.set_placeholder_callback(
            "src/lib.rs",
            Arc::new(move || {
                refcount.fetch_add(1, Ordering::SeqCst);
            }),
        );
    }

    assert_eq!(
        env.channel.get_placeholder_info(cb(1, "src/lib.rs")),
        ErrorCode::IO_PENDING
    );
    assert_eq!(env.os.wait_for_completion(1).await.code, ErrorCode::SUCCESS);

    let placeholders = env.os.placeholders_written();
    assert_eq!(placeholders.len(), 1);
    assert!(!placeholders[0].basic.is_dir);
    assert_eq!(placeholders[0].basic.size, 11);
    assert_eq!(placeholders[0].path.as_str(), "src/lib.rs");
    assert_eq!(refcount.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn placeholder_for_missing_file_is_not_found() {
    let env = started();
    env.channel.get_placeholder_info(cb(1, "no/such/file"));
    assert_eq!(env.os.wait_for_completion(1).await.code, ErrorCode::NOT_FOUND);
    assert!(env.os.placeholders_written().is_empty());
}

#[tokio::test]
async fn query_file_name_reports_existence() {
    let env = started();
    env.dispatcher.add_file("present.txt", &b"here"[..]);

    env.channel.query_file_name(cb(1, "present.txt"));
    assert_eq!(env.os.wait_for_completion(1).await.code, ErrorCode::SUCCESS);

    env.channel.query_file_name(cb(2, "absent.txt"));
    assert_eq!(env.os.wait_for_completion(2).await.code, ErrorCode::NOT_FOUND);
}

#[tokio::test]
async fn small_file_data_is_written_whole() {
    let env = started();
    let contents = vec![42u8; 300];
    env.dispatcher.add_file("small.bin", contents.clone());

    let mut data = cb(1, "small.bin");
    data.data_stream_id = Guid::from_u128(0x57);
    env.channel.get_file_data(data, 0, 300);
    assert_eq!(env.os.wait_for_completion(1).await.code, ErrorCode::SUCCESS);

    let writes = env.os.file_writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].offset, 0);
    assert_eq!(writes[0].data, contents);
    assert_eq!(writes[0].data_stream_id, Guid::from_u128(0x57));
}

#[tokio::test]
async fn large_read_is_split_at_aligned_boundaries() {
    let env = started();
    let contents: Vec<u8> = (0..8 * 1024 * 1024u32).map(|i| (i % 251) as u8).collect();
    env.dispatcher.add_file("large.bin", contents.clone());

    let length: u32 = 6 * 1024 * 1024;
    env.channel.get_file_data(cb(1, "large.bin"), 0, length);
    assert_eq!(env.os.wait_for_completion(1).await.code, ErrorCode::SUCCESS);

    let writes = env.os.file_writes();
    assert_eq!(writes.len(), 2);
    // Device alignment 4096: the first chunk is 5 MiB truncated to the
    // alignment boundary.
    assert_eq!(writes[0].offset, 0);
    assert_eq!(writes[0].data.len(), 0x0050_0000);
    assert_eq!(writes[1].offset, 0x0050_0000);
    assert_eq!(writes[1].data.len(), 0x0010_0000);
    let delivered: usize = writes.iter().map(|w| w.data.len()).sum();
    assert_eq!(delivered as u32, length);
    assert_eq!(writes[0].data[..], contents[..0x0050_0000]);
}

#[tokio::test]
async fn file_data_for_missing_path_fails() {
    let env = started();
    env.channel.get_file_data(cb(1, "gone.bin"), 0, 64);
    assert_eq!(env.os.wait_for_completion(1).await.code, ErrorCode::NOT_FOUND);
}

#[tokio::test]
async fn notifications_route_to_dispatcher() {
    let env = started();

    env.channel.notification(
        cb(1, "new.txt"),
        false,
        NotificationKind::NewFileCreated.as_raw(),
        RepoPathBuf::root(),
    );
    assert_eq!(env.os.wait_for_completion(1).await.code, ErrorCode::SUCCESS);

    env.channel.notification(
        cb(2, "newdir"),
        true,
        NotificationKind::NewFileCreated.as_raw(),
        RepoPathBuf::root(),
    );
    env.os.wait_for_completion(2).await;

    env.channel.notification(
        cb(3, "mutated.txt"),
        false,
        NotificationKind::FileOverwritten.as_raw(),
        RepoPathBuf::root(),
    );
    env.os.wait_for_completion(3).await;

    env.channel.notification(
        cb(4, "closed.txt"),
        false,
        NotificationKind::FileHandleClosedFileModified.as_raw(),
        RepoPathBuf::root(),
    );
    env.os.wait_for_completion(4).await;

    env.channel.notification(
        cb(5, "old.txt"),
        false,
        NotificationKind::FileRenamed.as_raw(),
        RepoPathBuf::parse("new-name.txt").unwrap(),
    );
    env.os.wait_for_completion(5).await;

    env.channel.notification(
        cb(6, "dropped.txt"),
        false,
        NotificationKind::FileHandleClosedFileDeleted.as_raw(),
        RepoPathBuf::root(),
    );
    env.os.wait_for_completion(6).await;

    assert_eq!(
        env.dispatcher.events(),
        vec![
            "fileCreated(new.txt)",
            "dirCreated(newdir)",
            "fileModified(mutated.txt)",
            "fileModified(closed.txt)",
            "fileRenamed(old.txt -> new-name.txt)",
            "fileDeleted(dropped.txt)",
        ]
    );
}

#[tokio::test]
async fn renames_across_the_mount_boundary_degrade() {
    let env = started();

    // Moved into the repo: the old path is empty.
    env.channel.notification(
        cb(1, ""),
        false,
        NotificationKind::FileRenamed.as_raw(),
        RepoPathBuf::parse("imported.txt").unwrap(),
    );
    env.os.wait_for_completion(1).await;

    // Moved out of the repo: the new path is empty.
    env.channel.notification(
        cb(2, "exported.txt"),
        false,
        NotificationKind::FileRenamed.as_raw(),
        RepoPathBuf::root(),
    );
    env.os.wait_for_completion(2).await;

    assert_eq!(
        env.dispatcher.events(),
        vec!["fileCreated(imported.txt)", "fileDeleted(exported.txt)"]
    );
}

#[tokio::test]
async fn hardlinks_are_refused() {
    let env = started();
    env.channel.notification(
        cb(1, "target.txt"),
        false,
        NotificationKind::PreSetHardlink.as_raw(),
        RepoPathBuf::parse("link.txt").unwrap(),
    );
    assert_eq!(
        env.os.wait_for_completion(1).await.code,
        ErrorCode::ACCESS_DENIED
    );
    assert!(env.dispatcher.events().is_empty());
}

#[tokio::test]
async fn pre_rename_is_advisory_success() {
    let env = started();
    env.channel.notification(
        cb(1, "a.txt"),
        false,
        NotificationKind::PreRename.as_raw(),
        RepoPathBuf::parse("b.txt").unwrap(),
    );
    assert_eq!(env.os.wait_for_completion(1).await.code, ErrorCode::SUCCESS);
    assert!(env.dispatcher.events().is_empty());
}

#[tokio::test]
async fn unknown_notification_kind_is_invalid() {
    let env = started();
    assert_eq!(
        env.channel.notification(cb(1, "x.txt"), false, 0x0001_0000, RepoPathBuf::root()),
        ErrorCode::INVALID_PARAMETER
    );
}

#[tokio::test]
async fn stats_count_callbacks() {
    let env = started();
    env.dispatcher.add_file("counted.txt", &b"1"[..]);

    env.channel.query_file_name(cb(1, "counted.txt"));
    env.os.wait_for_completion(1).await;
    env.channel.get_file_data(cb(2, "counted.txt"), 0, 1);
    env.os.wait_for_completion(2).await;
    env.channel.notification(
        cb(3, "counted.txt"),
        false,
        NotificationKind::FileOverwritten.as_raw(),
        RepoPathBuf::root(),
    );
    env.os.wait_for_completion(3).await;

    let stats = env.channel.stats().unwrap();
    assert_eq!(stats.access, 1);
    assert_eq!(stats.read, 1);
    assert_eq!(stats.file_overwritten, 1);
    assert_eq!(stats.lookup, 0);
}

#[tokio::test]
async fn stop_waits_for_outstanding_callbacks() {
    let env = started();
    env.dispatcher.add_file("slow.txt", &b"slow contents"[..]);
    env.dispatcher.set_read_delay(Duration::from_millis(100));

    env.channel.get_file_data(cb(1, "slow.txt"), 0, 13);
    env.channel.stop().await;

    // Teardown drained the in-flight read before completing.
    assert!(env.os.is_stopped());
    let completions = env.os.completions();
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].code, ErrorCode::SUCCESS);

    // The channel is retracted: later callbacks see no instance.
    assert_eq!(
        env.channel.query_file_name(cb(2, "slow.txt")),
        ErrorCode::INVALID_PARAMETER
    );
}

#[tokio::test]
async fn stop_fulfills_the_stop_future() {
    let env = started();
    let stop_future = env.channel.take_stop_future().unwrap();
    assert!(env.channel.take_stop_future().is_none());

    env.channel.stop().await;
    stop_future.await.unwrap();
}

#[tokio::test]
#[should_panic(expected = "notification was received while unmounting")]
async fn notification_during_unmount_is_fatal() {
    let env = started();
    env.channel.stop().await;
    env.channel.notification(
        cb(1, "late.txt"),
        false,
        NotificationKind::NewFileCreated.as_raw(),
        RepoPathBuf::root(),
    );
}

#[tokio::test]
async fn cache_invalidation_tolerances() {
    let env = started();
    let file = RepoPathBuf::parse("cached.txt").unwrap();
    let missing = RepoPathBuf::parse("missing.txt").unwrap();
    let dir = RepoPathBuf::parse("somedir").unwrap();
    let broken = RepoPathBuf::parse("broken.txt").unwrap();

    env.os.set_delete_result(missing.clone(), ErrorCode::NOT_FOUND);
    env.os.set_delete_result(dir.clone(), ErrorCode::REPARSE_POINT_ENCOUNTERED);
    env.os.set_delete_result(broken.clone(), ErrorCode::INTERNAL_ERROR);

    env.channel.remove_cached_file(&file).unwrap();
    env.channel.remove_cached_file(&missing).unwrap();
    env.channel.remove_cached_file(&dir).unwrap();
    env.channel.remove_cached_file(RepoPathBuf::root().as_repo_path()).unwrap();
    assert!(env.channel.remove_cached_file(&broken).is_err());

    assert_eq!(env.os.deleted_files(), vec![file]);
}

#[tokio::test]
async fn directory_placeholder_tolerances() {
    let env = started();
    let plain = RepoPathBuf::parse("plain").unwrap();
    let already = RepoPathBuf::parse("already").unwrap();
    let recursive = RepoPathBuf::parse("recursive").unwrap();
    let broken = RepoPathBuf::parse("broken").unwrap();

    env.os.set_mark_placeholder_result(already.clone(), ErrorCode::REPARSE_POINT_ENCOUNTERED);
    env.os.set_mark_placeholder_result(recursive.clone(), ErrorCode::ACCESS_DENIED);
    env.os.set_mark_placeholder_result(broken.clone(), ErrorCode::INTERNAL_ERROR);

    env.channel.add_directory_placeholder(&plain).unwrap();
    env.channel.add_directory_placeholder(&already).unwrap();
    env.channel.add_directory_placeholder(&recursive).unwrap();
    assert!(env.channel.add_directory_placeholder(&broken).is_err());
}
