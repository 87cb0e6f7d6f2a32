// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! The projection channel
//!
//! `ProjfsChannel` owns the virtualization registration for one mount and
//! routes OS callbacks into the dispatcher. The dispatch state lives behind
//! an RCU-style pointer: every callback takes a snapshot that stays valid
//! for its whole lifetime even if teardown begins concurrently, and teardown
//! waits for all outstanding callbacks to drain before completing.

use std::ops::Deref;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use futures::channel::oneshot;
use tokio::sync::Notify;
use tracing::{debug, error, info, trace, warn};

use repofs_core::{FetchCause, FetchContext, FsError, FsResult, MountConfig, RepoPath, RepoPathBuf};

use crate::context::RequestContext;
use crate::dispatcher::Dispatcher;
use crate::enumeration::{EnumerationRegistry, Enumerator};
use crate::notifications::{handler_entry, NotificationKind};
use crate::os::{
    DirEntryBuffer, DirEntryBufferHandle, ErrorCode, FileBasicInfo, Guid, OsResult,
    PlaceholderInfo, ProjectionOs, VirtualizationOptions,
};
use crate::stats::{ChannelStats, ChannelStatsSnapshot};
use crate::writer::{block_align_truncate, write_file_chunks, write_single_chunk, MAX_CHUNK, MIN_CHUNK};

/// Everything the OS hands the channel with a callback.
#[derive(Clone, Debug)]
pub struct CallbackData {
    pub command_id: i32,
    /// Process that triggered the filesystem operation.
    pub triggering_pid: u32,
    pub path: RepoPathBuf,
    pub data_stream_id: Guid,
    /// Set on get-enumeration-data when the scan should restart.
    pub restart_scan: bool,
}

impl CallbackData {
    pub fn new(command_id: i32, triggering_pid: u32, path: RepoPathBuf) -> CallbackData {
        CallbackData {
            command_id,
            triggering_pid,
            path,
            data_stream_id: Guid([0u8; 16]),
            restart_scan: false,
        }
    }
}

/// Handed to the stop future once teardown has fully drained.
#[derive(Debug, Default)]
pub struct StopData {}

/// Dispatch state shared by all in-flight callbacks.
pub(crate) struct ChannelInner {
    pub(crate) dispatcher: Arc<dyn Dispatcher>,
    pub(crate) os: Arc<dyn ProjectionOs>,
    pub(crate) enumerations: EnumerationRegistry,
    pub(crate) stats: Arc<ChannelStats>,
    pub(crate) timeout: Duration,
    outstanding: AtomicU64,
    idle: Notify,
}

impl ChannelInner {
    fn new(
        dispatcher: Arc<dyn Dispatcher>,
        os: Arc<dyn ProjectionOs>,
        timeout: Duration,
    ) -> ChannelInner {
        ChannelInner {
            dispatcher,
            os,
            enumerations: EnumerationRegistry::new(),
            stats: Arc::new(ChannelStats::default()),
            timeout,
            outstanding: AtomicU64::new(0),
            idle: Notify::new(),
        }
    }
}

/// Snapshot of the inner state pinned for the duration of one callback.
pub(crate) struct InnerGuard {
    inner: Arc<ChannelInner>,
}

impl InnerGuard {
    fn new(inner: Arc<ChannelInner>) -> InnerGuard {
        inner.outstanding.fetch_add(1, Ordering::SeqCst);
        InnerGuard { inner }
    }
}

impl Deref for InnerGuard {
    type Target = ChannelInner;

    fn deref(&self) -> &ChannelInner {
        &self.inner
    }
}

impl Drop for InnerGuard {
    fn drop(&mut self) {
        if self.inner.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

pub struct ProjfsChannel {
    mount_path: PathBuf,
    mount_id: Guid,
    config: MountConfig,
    dispatcher: Arc<dyn Dispatcher>,
    os: Arc<dyn ProjectionOs>,
    inner: ArcSwapOption<ChannelInner>,
    stop_tx: Mutex<Option<oneshot::Sender<StopData>>>,
    stop_rx: Mutex<Option<oneshot::Receiver<StopData>>>,
    own_pid: u32,
}

impl ProjfsChannel {
    pub fn new(
        mount_path: PathBuf,
        dispatcher: Arc<dyn Dispatcher>,
        os: Arc<dyn ProjectionOs>,
        config: MountConfig,
    ) -> ProjfsChannel {
        let (stop_tx, stop_rx) = oneshot::channel();
        ProjfsChannel {
            mount_path,
            mount_id: Guid(config.mount_guid),
            config,
            dispatcher,
            os,
            inner: ArcSwapOption::const_empty(),
            stop_tx: Mutex::new(Some(stop_tx)),
            stop_rx: Mutex::new(Some(stop_rx)),
            own_pid: std::process::id(),
        }
    }

    /// Register the mount with the OS projection service and publish the
    /// inner dispatch state.
    pub fn start(&self) -> FsResult<()> {
        if self.config.read_only {
            return Err(FsError::NotImplemented);
        }

        info!(
            target: "repofs::projfs",
            "Starting ProjfsChannel for: {} with GUID: {}",
            self.mount_path.display(),
            self.mount_id
        );

        match self.os.mark_directory_as_placeholder(None, &self.mount_id) {
            Ok(()) | Err(ErrorCode::REPARSE_POINT_ENCOUNTERED) => {}
            Err(code) => {
                return Err(code.to_fs_error(&format!(
                    "failed to set up the mount point: {}",
                    self.mount_path.display()
                )))
            }
        }

        let options = VirtualizationOptions {
            use_negative_path_caching: self.config.use_negative_path_caching,
            notification_mask: NotificationKind::full_mask(),
        };
        self.os
            .start_virtualizing(&options)
            .map_err(|code| code.to_fs_error("failed to start the mount point"))?;

        // The OS keeps the negative path cache across channel restarts;
        // flushing at start gives users a way out of a stale negative
        // result without rebooting.
        self.flush_negative_path_cache()?;

        self.inner.store(Some(Arc::new(ChannelInner::new(
            self.dispatcher.clone(),
            self.os.clone(),
            self.config.timeout(),
        ))));

        info!(target: "repofs::projfs", "Started ProjfsChannel for: {}", self.mount_path.display());
        Ok(())
    }

    /// Tear down: unregister from the OS, retract the inner pointer, and
    /// wait for every outstanding callback to finish before fulfilling the
    /// stop future.
    pub async fn stop(&self) -> StopData {
        info!(target: "repofs::projfs", "Stopping ProjfsChannel for: {}", self.mount_path.display());
        self.os.stop_virtualizing();

        if let Some(inner) = self.inner.swap(None) {
            loop {
                let notified = inner.idle.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if inner.outstanding.load(Ordering::SeqCst) == 0 {
                    break;
                }
                notified.await;
            }
        }

        if let Some(tx) = self.stop_tx.lock().unwrap().take() {
            let _ = tx.send(StopData {});
        }
        StopData {}
    }

    /// The completion future for `stop`; may be claimed once.
    pub fn take_stop_future(&self) -> Option<oneshot::Receiver<StopData>> {
        self.stop_rx.lock().unwrap().take()
    }

    /// Counters for the running channel, when started.
    pub fn stats(&self) -> Option<ChannelStatsSnapshot> {
        self.inner.load().as_ref().map(|inner| inner.stats.snapshot())
    }

    /// Saved wildcard expression of an open enumeration session (for
    /// testing).
    pub fn enumeration_search_expression(&self, session_id: &Guid) -> Option<String> {
        let inner = self.inner.load_full()?;
        let session = inner.enumerations.find(session_id)?;
        let expression = session.lock().unwrap().search_expression().map(str::to_string);
        expression
    }

    /// Drop all OS-level negative path-cache entries for this mount.
    pub fn flush_negative_path_cache(&self) -> FsResult<u32> {
        if !self.config.use_negative_path_caching {
            return Ok(0);
        }
        debug!(target: "repofs::projfs", "Flushing negative path cache");
        let flushed = self
            .os
            .clear_negative_path_cache()
            .map_err(|code| code.to_fs_error("couldn't flush the negative path cache"))?;
        debug!(target: "repofs::projfs", "Flushed {flushed} entries");
        Ok(flushed)
    }

    /// Invalidate the cached on-disk state for `path`. Missing files,
    /// missing parents, and directories (reparse points) are fine.
    pub fn remove_cached_file(&self, path: &RepoPath) -> FsResult<()> {
        if path.is_root() {
            return Ok(());
        }
        debug!(target: "repofs::projfs", "Invalidating: {path}");
        match self.os.delete_cached_file(path) {
            Ok(())
            | Err(ErrorCode::REPARSE_POINT_ENCOUNTERED)
            | Err(ErrorCode::NOT_FOUND)
            | Err(ErrorCode::PATH_NOT_FOUND) => Ok(()),
            Err(code) => Err(code.to_fs_error(&format!("couldn't delete file {path}"))),
        }
    }

    /// Convert `path` into a directory placeholder. Already-placeholder
    /// directories and recursively-denied attempts are both success: either
    /// way the directory is not materialized and no work is needed.
    pub fn add_directory_placeholder(&self, path: &RepoPath) -> FsResult<()> {
        if path.is_root() {
            return Ok(());
        }
        debug!(target: "repofs::projfs", "Adding a placeholder for: {path}");
        match self.os.mark_directory_as_placeholder(Some(path), &self.mount_id) {
            Ok(()) | Err(ErrorCode::REPARSE_POINT_ENCOUNTERED) => Ok(()),
            Err(ErrorCode::ACCESS_DENIED) => {
                warn!(
                    target: "repofs::projfs",
                    "Couldn't add a placeholder for: {path}, as it triggered a recursive call"
                );
                Ok(())
            }
            Err(code) => Err(code.to_fs_error(&format!("couldn't add a placeholder for {path}"))),
        }
    }

    /// Cancellation is currently a no-op: in-flight loads run to completion
    /// and subscribers that no longer care discard the results.
    pub fn cancel_command(&self, data: &CallbackData) {
        debug!(
            target: "repofs::projfs",
            command_id = data.command_id,
            "cancel requested; command will complete normally"
        );
    }

    fn inner_guard(&self) -> Option<InnerGuard> {
        self.inner.load_full().map(InnerGuard::new)
    }

    /// Common callback entry: recursive-call guard, live-channel check,
    /// request-context creation.
    fn begin(&self, data: &CallbackData) -> Result<(InnerGuard, Arc<RequestContext>), ErrorCode> {
        if data.triggering_pid == self.own_pid {
            error!(
                target: "repofs::projfs",
                "Recursive repofs call disallowed for: {}",
                data.path
            );
            return Err(ErrorCode::ACCESS_DENIED);
        }
        let Some(inner) = self.inner_guard() else {
            return Err(ErrorCode::INVALID_PARAMETER);
        };
        let context = RequestContext::new(
            inner.os.clone(),
            data.command_id,
            inner.stats.clone(),
            inner.timeout,
        );
        Ok((inner, context))
    }

    /// Open a directory enumeration session.
    pub fn start_enumeration(&self, data: CallbackData, enumeration_id: Guid) -> ErrorCode {
        let (guard, context) = match self.begin(&data) {
            Ok(entry) => entry,
            Err(code) => return code,
        };
        ChannelStats::record(&guard.stats.open_dir);
        trace!(target: "repofs::projfs", "opendir({}, guid={})", data.path, enumeration_id);

        let path = data.path;
        tokio::spawn(async move {
            let inner_context = context.clone();
            let fut = async {
                let ctx = FetchContext::with_detail(FetchCause::Fs, "opendir");
                let entries = guard.dispatcher.opendir(&path, &ctx).await?;
                guard.enumerations.insert(enumeration_id, Enumerator::new(entries));
                inner_context.send_success();
                Ok(())
            };
            context.catch_errors(fut).await;
        });
        ErrorCode::IO_PENDING
    }

    /// Close an enumeration session. Always succeeds, even for unknown
    /// sessions, since closes may be retried.
    pub fn end_enumeration(&self, data: CallbackData, enumeration_id: Guid) -> ErrorCode {
        if data.triggering_pid == self.own_pid {
            return ErrorCode::ACCESS_DENIED;
        }
        let Some(guard) = self.inner_guard() else {
            return ErrorCode::INVALID_PARAMETER;
        };
        trace!(target: "repofs::projfs", "closedir({})", enumeration_id);
        guard.enumerations.remove(&enumeration_id);
        ErrorCode::SUCCESS
    }

    /// Fill the OS buffer with as many pending entries as fit.
    pub fn get_enumeration_data(
        &self,
        data: CallbackData,
        enumeration_id: Guid,
        search_expression: Option<&str>,
        buffer: DirEntryBufferHandle,
    ) -> ErrorCode {
        let (guard, context) = match self.begin(&data) {
            Ok(entry) => entry,
            Err(code) => return code,
        };
        trace!(
            target: "repofs::projfs",
            "readdir({}, searchExpression={})",
            enumeration_id,
            search_expression.unwrap_or("<none>")
        );

        let Some(session) = guard.enumerations.find(&enumeration_id) else {
            debug!(target: "repofs::projfs", "Directory enumeration not found: {enumeration_id}");
            return ErrorCode::INVALID_PARAMETER;
        };
        {
            let mut enumerator = session.lock().unwrap();
            if enumerator.is_search_expression_empty() || data.restart_scan {
                enumerator.save_expression(search_expression.unwrap_or("*"));
            }
            if data.restart_scan {
                enumerator.restart();
            }
        }

        ChannelStats::record(&guard.stats.read_dir);

        // The buffer handle stays valid until the command completes, so the
        // fill happens after this callback has gone pending, like every
        // other callback.
        tokio::spawn(async move {
            let result = {
                let mut enumerator = session.lock().unwrap();
                let mut buffer = buffer.lock().unwrap();
                fill_enumeration_buffer(&mut enumerator, &mut *buffer)
            };
            match result {
                Ok(()) => context.send_enumeration_success(),
                Err(code) => context.send_error(code),
            }
            drop(guard);
        });
        ErrorCode::IO_PENDING
    }

    /// Resolve one path and hand the OS a placeholder record for it.
    pub fn get_placeholder_info(&self, data: CallbackData) -> ErrorCode {
        let (guard, context) = match self.begin(&data) {
            Ok(entry) => entry,
            Err(code) => return code,
        };
        ChannelStats::record(&guard.stats.lookup);

        let path = data.path;
        tokio::spawn(async move {
            let inner_context = context.clone();
            let fut = async {
                let ctx = FetchContext::with_detail(FetchCause::Fs, "lookup");
                trace!(target: "repofs::projfs", "lookup({path})");
                let Some(lookup) = guard.dispatcher.lookup(&path, &ctx).await? else {
                    inner_context.send_error(ErrorCode::NOT_FOUND);
                    return Ok(());
                };

                let info = PlaceholderInfo {
                    basic: FileBasicInfo {
                        is_dir: lookup.is_dir,
                        size: lookup.size,
                    },
                    path: lookup.path.clone(),
                };
                if let Err(code) = guard.os.write_placeholder_info(&info) {
                    return Err(
                        code.to_fs_error(&format!("writing placeholder for {}", lookup.path))
                    );
                }
                inner_context.send_success();

                // The OS now holds a reference to the placeholder.
                if let Some(callback) = &lookup.on_placeholder_written {
                    callback();
                }
                Ok(())
            };
            context.catch_errors(fut).await;
        });
        ErrorCode::IO_PENDING
    }

    /// Existence probe for a single path.
    pub fn query_file_name(&self, data: CallbackData) -> ErrorCode {
        let (guard, context) = match self.begin(&data) {
            Ok(entry) => entry,
            Err(code) => return code,
        };
        ChannelStats::record(&guard.stats.access);

        let path = data.path;
        tokio::spawn(async move {
            let inner_context = context.clone();
            let fut = async {
                let ctx = FetchContext::with_detail(FetchCause::Fs, "access");
                trace!(target: "repofs::projfs", "access({path})");
                if guard.dispatcher.access(&path, &ctx).await? {
                    inner_context.send_success();
                } else {
                    inner_context.send_error(ErrorCode::NOT_FOUND);
                }
                Ok(())
            };
            context.catch_errors(fut).await;
        });
        ErrorCode::IO_PENDING
    }

    /// Fetch blob contents and deliver the requested range back to the OS.
    pub fn get_file_data(&self, data: CallbackData, byte_offset: u64, length: u32) -> ErrorCode {
        let (guard, context) = match self.begin(&data) {
            Ok(entry) => entry,
            Err(code) => return code,
        };
        ChannelStats::record(&guard.stats.read);

        let path = data.path;
        let data_stream_id = data.data_stream_id;
        tokio::spawn(async move {
            let inner_context = context.clone();
            let fut = async {
                let ctx = FetchContext::with_detail(FetchCause::Fs, "read");
                trace!(
                    target: "repofs::projfs",
                    "read({path}, off={byte_offset}, len={length})"
                );
                let content = guard.dispatcher.read(&path, &ctx).await?;
                let os = guard.os.as_ref();

                let result = if content.len() as u64 <= MIN_CHUNK {
                    // Small file: copy the whole thing in one shot.
                    write_single_chunk(os, &data_stream_id, &content, 0, content.len() as u64)
                } else if u64::from(length) <= MAX_CHUNK {
                    // The request itself fits in one bounded write.
                    write_single_chunk(os, &data_stream_id, &content, byte_offset, length.into())
                } else {
                    // Split into chunks whose offsets respect the device's
                    // write alignment.
                    match os.instance_info() {
                        Ok(instance) => {
                            let end_offset = block_align_truncate(
                                byte_offset + MAX_CHUNK,
                                instance.write_alignment,
                            );
                            write_file_chunks(
                                os,
                                &data_stream_id,
                                &content,
                                byte_offset,
                                length.into(),
                                end_offset - byte_offset,
                            )
                        }
                        Err(code) => Err(code),
                    }
                };

                match result {
                    Ok(()) => inner_context.send_success(),
                    Err(code) => inner_context.send_error(code),
                }
                Ok(())
            };
            context.catch_errors(fut).await;
        });
        ErrorCode::IO_PENDING
    }

    /// Route a post-mutation notification to its handler.
    ///
    /// A notification arriving while the inner pointer is retracted means
    /// the working copy is being mutated during unmount; there is no way to
    /// recover the bookkeeping, so this is fatal.
    pub fn notification(
        &self,
        data: CallbackData,
        is_directory: bool,
        raw_kind: u32,
        destination: RepoPathBuf,
    ) -> ErrorCode {
        if data.triggering_pid == self.own_pid {
            error!(
                target: "repofs::projfs",
                "Recursive repofs call disallowed for: {}",
                data.path
            );
            return ErrorCode::ACCESS_DENIED;
        }
        let Some(guard) = self.inner_guard() else {
            panic!("a notification was received while unmounting");
        };

        let Some(entry) = handler_entry(raw_kind) else {
            warn!(target: "repofs::projfs", "Unrecognized notification: {raw_kind:#x}");
            return ErrorCode::INVALID_PARAMETER;
        };
        ChannelStats::record((entry.stat)(guard.stats.as_ref()));

        let context = RequestContext::new(
            guard.os.clone(),
            data.command_id,
            guard.stats.clone(),
            guard.timeout,
        );
        let path = data.path;
        tokio::spawn(async move {
            trace!(
                target: "repofs::projfs",
                "{}",
                (entry.renderer)(&path, &destination, is_directory)
            );
            let ctx = FetchContext::with_detail(FetchCause::Fs, "notification");
            let handler = (entry.handler)(
                guard.dispatcher.clone(),
                path,
                destination,
                is_directory,
                ctx,
            );
            match tokio::time::timeout(guard.timeout, handler).await {
                Ok(Ok(())) => context.send_notification_success(),
                Ok(Err(err)) if entry.advisory => {
                    debug!(target: "repofs::projfs", %err, "advisory notification refused");
                    context.send_error(ErrorCode::from_fs_error(&err));
                }
                Ok(Err(err)) => {
                    // The OS already committed the mutation; nothing useful
                    // can be reported back.
                    warn!(target: "repofs::projfs", %err, "notification handler failed");
                    context.send_notification_success();
                }
                Err(_elapsed) => context.send_error(ErrorCode::TIMEOUT),
            }
            drop(guard);
        });
        ErrorCode::IO_PENDING
    }
}

/// Copy pending entries into the OS buffer until it runs out of room.
fn fill_enumeration_buffer(
    enumerator: &mut Enumerator,
    buffer: &mut dyn DirEntryBuffer,
) -> OsResult<()> {
    let mut added = false;
    loop {
        let Some(entry) = enumerator.pending_entries().first().cloned() else {
            return Ok(());
        };
        let info = FileBasicInfo {
            is_dir: entry.is_dir,
            size: entry.size,
        };
        trace!(
            target: "repofs::projfs",
            "Directory entry: {}, {}, size={}",
            if entry.is_dir { "Dir" } else { "File" },
            entry.name,
            entry.size
        );
        match buffer.try_fill(&entry.name, &info) {
            Ok(()) => {
                added = true;
                enumerator.advance();
            }
            Err(code) if code == ErrorCode::INSUFFICIENT_BUFFER && added => {
                // Out of buffer space; this entry didn't make it, so the
                // cursor stays put for the next call.
                return Ok(());
            }
            Err(code) => {
                error!(
                    target: "repofs::projfs",
                    "Adding directory entry {}: {}",
                    entry.name,
                    code
                );
                return Err(code);
            }
        }
    }
}
