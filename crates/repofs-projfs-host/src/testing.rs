// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Fakes for exercising the channel without an OS projection service

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;

use repofs_core::{FetchContext, FsError, FsResult, RepoPath, RepoPathBuf};

use crate::dispatcher::{Dispatcher, EnumEntry, LookupResult, MountStats};
use crate::os::{
    AlignedBuffer, CompletionExtra, DirEntryBuffer, ErrorCode, FileBasicInfo, Guid, InstanceInfo,
    OsResult, PlaceholderInfo, ProjectionOs, VirtualizationOptions,
};

/// One `write_file_data` call recorded by the fake OS.
#[derive(Clone, Debug)]
pub struct RecordedWrite {
    pub data_stream_id: Guid,
    pub offset: u64,
    pub data: Vec<u8>,
}

/// One `complete_command` call recorded by the fake OS.
#[derive(Clone, Debug)]
pub struct RecordedCompletion {
    pub command_id: i32,
    pub code: ErrorCode,
    pub extra: Option<CompletionExtra>,
}

/// In-memory stand-in for the OS projection service. Records everything the
/// channel does to it and lets tests inject failures.
pub struct FakeProjectionOs {
    started: Mutex<Option<VirtualizationOptions>>,
    stopped: Mutex<bool>,
    placeholders_written: Mutex<Vec<PlaceholderInfo>>,
    placeholder_dirs: Mutex<Vec<Option<RepoPathBuf>>>,
    file_writes: Mutex<Vec<RecordedWrite>>,
    completions: Mutex<Vec<RecordedCompletion>>,
    completion_signal: Notify,
    deleted_files: Mutex<Vec<RepoPathBuf>>,
    delete_results: Mutex<HashMap<RepoPathBuf, ErrorCode>>,
    mark_placeholder_results: Mutex<HashMap<RepoPathBuf, ErrorCode>>,
    write_failure: Mutex<Option<ErrorCode>>,
    negative_cache_entries: Mutex<u32>,
    write_alignment: u32,
}

impl FakeProjectionOs {
    pub fn new() -> FakeProjectionOs {
        Self::with_alignment(4096)
    }

    pub fn with_alignment(write_alignment: u32) -> FakeProjectionOs {
        FakeProjectionOs {
            started: Mutex::new(None),
            stopped: Mutex::new(false),
            placeholders_written: Mutex::new(Vec::new()),
            placeholder_dirs: Mutex::new(Vec::new()),
            file_writes: Mutex::new(Vec::new()),
            completions: Mutex::new(Vec::new()),
            completion_signal: Notify::new(),
            deleted_files: Mutex::new(Vec::new()),
            delete_results: Mutex::new(HashMap::new()),
            mark_placeholder_results: Mutex::new(HashMap::new()),
            write_failure: Mutex::new(None),
            negative_cache_entries: Mutex::new(0),
            write_alignment,
        }
    }

    pub fn file_writes(&self) -> Vec<RecordedWrite> {
        self.file_writes.lock().unwrap().clone()
    }

    pub fn placeholders_written(&self) -> Vec<PlaceholderInfo> {
        self.placeholders_written.lock().unwrap().clone()
    }

    pub fn placeholder_dirs(&self) -> Vec<Option<RepoPathBuf>> {
        self.placeholder_dirs.lock().unwrap().clone()
    }

    pub fn completions(&self) -> Vec<RecordedCompletion> {
        self.completions.lock().unwrap().clone()
    }

    pub fn deleted_files(&self) -> Vec<RepoPathBuf> {
        self.deleted_files.lock().unwrap().clone()
    }

    pub fn is_started(&self) -> bool {
        self.started.lock().unwrap().is_some()
    }

    pub fn start_options(&self) -> Option<VirtualizationOptions> {
        self.started.lock().unwrap().clone()
    }

    pub fn is_stopped(&self) -> bool {
        *self.stopped.lock().unwrap()
    }

    pub fn fail_writes_with(&self, code: ErrorCode) {
        *self.write_failure.lock().unwrap() = Some(code);
    }

    pub fn set_negative_cache_entries(&self, count: u32) {
        *self.negative_cache_entries.lock().unwrap() = count;
    }

    pub fn set_delete_result(&self, path: RepoPathBuf, code: ErrorCode) {
        self.delete_results.lock().unwrap().insert(path, code);
    }

    pub fn set_mark_placeholder_result(&self, path: RepoPathBuf, code: ErrorCode) {
        self.mark_placeholder_results.lock().unwrap().insert(path, code);
    }

    /// Wait until `command_id` has been completed and return the recorded
    /// completion.
    pub async fn wait_for_completion(&self, command_id: i32) -> RecordedCompletion {
        loop {
            let notified = self.completion_signal.notified();
            if let Some(found) = self
                .completions
                .lock()
                .unwrap()
                .iter()
                .find(|c| c.command_id == command_id)
            {
                return found.clone();
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(Duration::from_millis(50)) => {}
            }
        }
    }
}

impl Default for FakeProjectionOs {
    fn default() -> Self {
        Self::new()
    }
}

impl ProjectionOs for FakeProjectionOs {
    fn start_virtualizing(&self, options: &VirtualizationOptions) -> OsResult<()> {
        *self.started.lock().unwrap() = Some(options.clone());
        Ok(())
    }

    fn stop_virtualizing(&self) {
        *self.stopped.lock().unwrap() = true;
    }

    fn mark_directory_as_placeholder(
        &self,
        target: Option<&RepoPath>,
        _mount_id: &Guid,
    ) -> OsResult<()> {
        if let Some(target) = target {
            if let Some(code) = self.mark_placeholder_results.lock().unwrap().get(target) {
                return Err(*code);
            }
        }
        self.placeholder_dirs.lock().unwrap().push(target.map(|p| p.to_owned()));
        Ok(())
    }

    fn write_placeholder_info(&self, info: &PlaceholderInfo) -> OsResult<()> {
        self.placeholders_written.lock().unwrap().push(info.clone());
        Ok(())
    }

    fn write_file_data(&self, data_stream_id: &Guid, data: &[u8], offset: u64) -> OsResult<()> {
        if let Some(code) = *self.write_failure.lock().unwrap() {
            return Err(code);
        }
        self.file_writes.lock().unwrap().push(RecordedWrite {
            data_stream_id: *data_stream_id,
            offset,
            data: data.to_vec(),
        });
        Ok(())
    }

    fn allocate_aligned_buffer(&self, size: usize) -> Option<AlignedBuffer> {
        Some(AlignedBuffer::new(size))
    }

    fn instance_info(&self) -> OsResult<InstanceInfo> {
        Ok(InstanceInfo {
            write_alignment: self.write_alignment,
        })
    }

    fn complete_command(
        &self,
        command_id: i32,
        code: ErrorCode,
        extra: Option<CompletionExtra>,
    ) -> OsResult<()> {
        self.completions.lock().unwrap().push(RecordedCompletion {
            command_id,
            code,
            extra,
        });
        self.completion_signal.notify_waiters();
        Ok(())
    }

    fn clear_negative_path_cache(&self) -> OsResult<u32> {
        let mut entries = self.negative_cache_entries.lock().unwrap();
        let flushed = *entries;
        *entries = 0;
        Ok(flushed)
    }

    fn delete_cached_file(&self, path: &RepoPath) -> OsResult<()> {
        if let Some(code) = self.delete_results.lock().unwrap().get(path) {
            return Err(*code);
        }
        self.deleted_files.lock().unwrap().push(path.to_owned());
        Ok(())
    }
}

/// Byte-budgeted directory-entry buffer mirroring the OS-side one.
pub struct VecDirEntryBuffer {
    capacity_bytes: usize,
    used_bytes: usize,
    entries: Vec<(String, FileBasicInfo)>,
}

// Fixed per-entry cost on top of the name, matching the OS record header.
const DIR_ENTRY_OVERHEAD: usize = 24;

impl VecDirEntryBuffer {
    pub fn new(capacity_bytes: usize) -> VecDirEntryBuffer {
        VecDirEntryBuffer {
            capacity_bytes,
            used_bytes: 0,
            entries: Vec::new(),
        }
    }

    /// A buffer sized to hold exactly `count` entries of `name_len`-byte
    /// names.
    pub fn with_room_for(count: usize, name_len: usize) -> VecDirEntryBuffer {
        Self::new(count * (DIR_ENTRY_OVERHEAD + name_len))
    }

    pub fn entries(&self) -> &[(String, FileBasicInfo)] {
        &self.entries
    }
}

impl DirEntryBuffer for VecDirEntryBuffer {
    fn try_fill(&mut self, name: &str, info: &FileBasicInfo) -> OsResult<()> {
        let cost = DIR_ENTRY_OVERHEAD + name.len();
        if self.used_bytes + cost > self.capacity_bytes {
            return Err(ErrorCode::INSUFFICIENT_BUFFER);
        }
        self.used_bytes += cost;
        self.entries.push((name.to_string(), *info));
        Ok(())
    }
}

type LookupEntry = (FileBasicInfo, Option<Arc<dyn Fn() + Send + Sync>>);

/// Dispatcher over an in-memory tree, recording mutation notifications.
#[derive(Default)]
pub struct TestDispatcher {
    directories: Mutex<HashMap<RepoPathBuf, Vec<EnumEntry>>>,
    files: Mutex<HashMap<RepoPathBuf, Bytes>>,
    lookup_extras: Mutex<HashMap<RepoPathBuf, LookupEntry>>,
    read_delay: Mutex<Option<Duration>>,
    pub events: Mutex<Vec<String>>,
}

impl TestDispatcher {
    pub fn new() -> TestDispatcher {
        TestDispatcher::default()
    }

    pub fn add_directory(&self, path: &str, entries: Vec<EnumEntry>) {
        self.directories
            .lock()
            .unwrap()
            .insert(RepoPathBuf::parse(path).unwrap(), entries);
    }

    pub fn add_file(&self, path: &str, contents: impl Into<Bytes>) {
        let path = RepoPathBuf::parse(path).unwrap();
        let contents = contents.into();
        self.lookup_extras.lock().unwrap().insert(
            path.clone(),
            (
                FileBasicInfo {
                    is_dir: false,
                    size: contents.len() as u64,
                },
                None,
            ),
        );
        self.files.lock().unwrap().insert(path, contents);
    }

    pub fn set_placeholder_callback(&self, path: &str, callback: Arc<dyn Fn() + Send + Sync>) {
        let path = RepoPathBuf::parse(path).unwrap();
        let mut extras = self.lookup_extras.lock().unwrap();
        if let Some(entry) = extras.get_mut(&path) {
            entry.1 = Some(callback);
        }
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    /// Delay every read, so tests can observe teardown waiting on in-flight
    /// requests.
    pub fn set_read_delay(&self, delay: Duration) {
        *self.read_delay.lock().unwrap() = Some(delay);
    }

    fn record(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

#[async_trait]
impl Dispatcher for TestDispatcher {
    async fn opendir(&self, path: &RepoPath, _ctx: &FetchContext) -> FsResult<Vec<EnumEntry>> {
        self.directories
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or(FsError::NotFound)
    }

    async fn lookup(
        &self,
        path: &RepoPath,
        _ctx: &FetchContext,
    ) -> FsResult<Option<LookupResult>> {
        if self.directories.lock().unwrap().contains_key(path) {
            return Ok(Some(LookupResult {
                path: path.to_owned(),
                is_dir: true,
                size: 0,
                on_placeholder_written: None,
            }));
        }
        let extras = self.lookup_extras.lock().unwrap();
        Ok(extras.get(path).map(|(info, callback)| LookupResult {
            path: path.to_owned(),
            is_dir: info.is_dir,
            size: info.size,
            on_placeholder_written: callback.clone(),
        }))
    }

    async fn access(&self, path: &RepoPath, _ctx: &FetchContext) -> FsResult<bool> {
        Ok(self.files.lock().unwrap().contains_key(path)
            || self.directories.lock().unwrap().contains_key(path))
    }

    async fn read(&self, path: &RepoPath, _ctx: &FetchContext) -> FsResult<Bytes> {
        let delay = *self.read_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.files.lock().unwrap().get(path).cloned().ok_or(FsError::NotFound)
    }

    async fn file_created(&self, path: &RepoPath, _ctx: &FetchContext) -> FsResult<()> {
        self.record(format!("fileCreated({path})"));
        Ok(())
    }

    async fn dir_created(&self, path: &RepoPath, _ctx: &FetchContext) -> FsResult<()> {
        self.record(format!("dirCreated({path})"));
        Ok(())
    }

    async fn file_modified(&self, path: &RepoPath, _ctx: &FetchContext) -> FsResult<()> {
        self.record(format!("fileModified({path})"));
        Ok(())
    }

    async fn file_deleted(&self, path: &RepoPath, _ctx: &FetchContext) -> FsResult<()> {
        self.record(format!("fileDeleted({path})"));
        Ok(())
    }

    async fn dir_deleted(&self, path: &RepoPath, _ctx: &FetchContext) -> FsResult<()> {
        self.record(format!("dirDeleted({path})"));
        Ok(())
    }

    async fn file_renamed(
        &self,
        old_path: &RepoPath,
        new_path: &RepoPath,
        _ctx: &FetchContext,
    ) -> FsResult<()> {
        self.record(format!("fileRenamed({old_path} -> {new_path})"));
        Ok(())
    }

    async fn get_stats(&self) -> FsResult<MountStats> {
        Ok(MountStats {
            placeholder_files: self.files.lock().unwrap().len() as u64,
            materialized_files: 0,
        })
    }
}
