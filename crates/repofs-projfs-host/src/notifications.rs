// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Post-mutation notification routing
//!
//! The OS reports every mutation it has committed to the working copy. Each
//! kind maps to a handler, a stat counter, and a trace renderer through one
//! static table. Pre-notifications (`PreRename`, `PreSetHardlink`) are
//! advisory: their errors veto the operation. For everything else the
//! mutation already happened, so handler failures are logged and the OS
//! still gets a success reply.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use futures::future::BoxFuture;

use repofs_core::{FetchContext, FsError, FsResult, RepoPath, RepoPathBuf};

use crate::dispatcher::Dispatcher;
use crate::stats::ChannelStats;

/// Notification kinds delivered by the projection service. Raw values match
/// the OS notification bitmask.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotificationKind {
    NewFileCreated,
    FileOverwritten,
    PreRename,
    PreSetHardlink,
    FileRenamed,
    FileHandleClosedFileModified,
    FileHandleClosedFileDeleted,
}

impl NotificationKind {
    pub fn from_raw(raw: u32) -> Option<NotificationKind> {
        match raw {
            0x0000_0002 => Some(Self::NewFileCreated),
            0x0000_0004 => Some(Self::FileOverwritten),
            0x0000_0020 => Some(Self::PreRename),
            0x0000_0040 => Some(Self::PreSetHardlink),
            0x0000_0080 => Some(Self::FileRenamed),
            0x0000_0400 => Some(Self::FileHandleClosedFileModified),
            0x0000_0800 => Some(Self::FileHandleClosedFileDeleted),
            _ => None,
        }
    }

    pub fn as_raw(self) -> u32 {
        match self {
            Self::NewFileCreated => 0x0000_0002,
            Self::FileOverwritten => 0x0000_0004,
            Self::PreRename => 0x0000_0020,
            Self::PreSetHardlink => 0x0000_0040,
            Self::FileRenamed => 0x0000_0080,
            Self::FileHandleClosedFileModified => 0x0000_0400,
            Self::FileHandleClosedFileDeleted => 0x0000_0800,
        }
    }

    /// The bitmask registered with the OS at start.
    pub fn full_mask() -> u32 {
        NOTIFICATION_TABLE.iter().map(|entry| entry.kind.as_raw()).sum()
    }
}

pub type NotificationHandler = fn(
    Arc<dyn Dispatcher>,
    RepoPathBuf,
    RepoPathBuf,
    bool,
    FetchContext,
) -> BoxFuture<'static, FsResult<()>>;

pub type NotificationRenderer = fn(&RepoPath, &RepoPath, bool) -> String;

pub type StatSelector = fn(&ChannelStats) -> &AtomicU64;

pub struct NotificationHandlerEntry {
    pub kind: NotificationKind,
    pub handler: NotificationHandler,
    pub renderer: NotificationRenderer,
    pub stat: StatSelector,
    /// Advisory notifications may veto; the rest are post-facto.
    pub advisory: bool,
}

pub static NOTIFICATION_TABLE: &[NotificationHandlerEntry] = &[
    NotificationHandlerEntry {
        kind: NotificationKind::NewFileCreated,
        handler: new_file_created,
        renderer: render_new_file_created,
        stat: |stats| &stats.new_file_created,
        advisory: false,
    },
    NotificationHandlerEntry {
        kind: NotificationKind::FileOverwritten,
        handler: file_overwritten,
        renderer: render_file_overwritten,
        stat: |stats| &stats.file_overwritten,
        advisory: false,
    },
    NotificationHandlerEntry {
        kind: NotificationKind::FileHandleClosedFileModified,
        handler: file_handle_closed_file_modified,
        renderer: render_file_modified,
        stat: |stats| &stats.file_handle_closed_file_modified,
        advisory: false,
    },
    NotificationHandlerEntry {
        kind: NotificationKind::FileRenamed,
        handler: file_renamed,
        renderer: render_file_renamed,
        stat: |stats| &stats.file_renamed,
        advisory: false,
    },
    NotificationHandlerEntry {
        kind: NotificationKind::PreRename,
        handler: pre_rename,
        renderer: render_pre_rename,
        stat: |stats| &stats.pre_renamed,
        advisory: true,
    },
    NotificationHandlerEntry {
        kind: NotificationKind::FileHandleClosedFileDeleted,
        handler: file_handle_closed_file_deleted,
        renderer: render_file_deleted,
        stat: |stats| &stats.file_handle_closed_file_deleted,
        advisory: false,
    },
    NotificationHandlerEntry {
        kind: NotificationKind::PreSetHardlink,
        handler: pre_set_hardlink,
        renderer: render_pre_set_hardlink,
        stat: |stats| &stats.pre_set_hardlink,
        advisory: true,
    },
];

/// Table lookup by raw notification value; `None` for unknown kinds.
pub fn handler_entry(raw: u32) -> Option<&'static NotificationHandlerEntry> {
    let kind = NotificationKind::from_raw(raw)?;
    NOTIFICATION_TABLE.iter().find(|entry| entry.kind == kind)
}

fn new_file_created(
    dispatcher: Arc<dyn Dispatcher>,
    rel_path: RepoPathBuf,
    _dest_path: RepoPathBuf,
    is_directory: bool,
    ctx: FetchContext,
) -> BoxFuture<'static, FsResult<()>> {
    Box::pin(async move {
        if is_directory {
            dispatcher.dir_created(&rel_path, &ctx).await
        } else {
            dispatcher.file_created(&rel_path, &ctx).await
        }
    })
}

fn file_overwritten(
    dispatcher: Arc<dyn Dispatcher>,
    rel_path: RepoPathBuf,
    _dest_path: RepoPathBuf,
    _is_directory: bool,
    ctx: FetchContext,
) -> BoxFuture<'static, FsResult<()>> {
    Box::pin(async move { dispatcher.file_modified(&rel_path, &ctx).await })
}

fn file_handle_closed_file_modified(
    dispatcher: Arc<dyn Dispatcher>,
    rel_path: RepoPathBuf,
    _dest_path: RepoPathBuf,
    _is_directory: bool,
    ctx: FetchContext,
) -> BoxFuture<'static, FsResult<()>> {
    Box::pin(async move { dispatcher.file_modified(&rel_path, &ctx).await })
}

fn file_renamed(
    dispatcher: Arc<dyn Dispatcher>,
    old_path: RepoPathBuf,
    new_path: RepoPathBuf,
    is_directory: bool,
    ctx: FetchContext,
) -> BoxFuture<'static, FsResult<()>> {
    Box::pin(async move {
        // Moves in and out of the repository arrive with one side empty;
        // treat those as creations and deletions.
        if old_path.is_root() {
            if is_directory {
                dispatcher.dir_created(&new_path, &ctx).await
            } else {
                dispatcher.file_created(&new_path, &ctx).await
            }
        } else if new_path.is_root() {
            if is_directory {
                dispatcher.dir_deleted(&old_path, &ctx).await
            } else {
                dispatcher.file_deleted(&old_path, &ctx).await
            }
        } else {
            dispatcher.file_renamed(&old_path, &new_path, &ctx).await
        }
    })
}

fn pre_rename(
    _dispatcher: Arc<dyn Dispatcher>,
    _old_path: RepoPathBuf,
    _new_path: RepoPathBuf,
    _is_directory: bool,
    _ctx: FetchContext,
) -> BoxFuture<'static, FsResult<()>> {
    Box::pin(async { Ok(()) })
}

fn file_handle_closed_file_deleted(
    dispatcher: Arc<dyn Dispatcher>,
    old_path: RepoPathBuf,
    _dest_path: RepoPathBuf,
    is_directory: bool,
    ctx: FetchContext,
) -> BoxFuture<'static, FsResult<()>> {
    Box::pin(async move {
        if is_directory {
            dispatcher.dir_deleted(&old_path, &ctx).await
        } else {
            dispatcher.file_deleted(&old_path, &ctx).await
        }
    })
}

fn pre_set_hardlink(
    _dispatcher: Arc<dyn Dispatcher>,
    rel_path: RepoPathBuf,
    _new_path: RepoPathBuf,
    _is_directory: bool,
    _ctx: FetchContext,
) -> BoxFuture<'static, FsResult<()>> {
    Box::pin(async move {
        Err(FsError::AccessDenied(format!(
            "Hardlinks are not supported: {rel_path}"
        )))
    })
}

fn render_new_file_created(rel_path: &RepoPath, _dest: &RepoPath, is_directory: bool) -> String {
    format!(
        "{}Created({rel_path})",
        if is_directory { "dir" } else { "file" }
    )
}

fn render_file_overwritten(rel_path: &RepoPath, _dest: &RepoPath, _is_directory: bool) -> String {
    format!("fileOverwritten({rel_path})")
}

fn render_file_modified(rel_path: &RepoPath, _dest: &RepoPath, _is_directory: bool) -> String {
    format!("fileModified({rel_path})")
}

fn render_file_renamed(old_path: &RepoPath, new_path: &RepoPath, _is_directory: bool) -> String {
    format!("fileRenamed({old_path} -> {new_path})")
}

fn render_pre_rename(old_path: &RepoPath, new_path: &RepoPath, _is_directory: bool) -> String {
    format!("preRename({old_path} -> {new_path})")
}

fn render_file_deleted(rel_path: &RepoPath, _dest: &RepoPath, is_directory: bool) -> String {
    format!(
        "{}Deleted({rel_path})",
        if is_directory { "dir" } else { "file" }
    )
}

fn render_pre_set_hardlink(old_path: &RepoPath, new_path: &RepoPath, _is_directory: bool) -> String {
    format!("link({old_path} -> {new_path})")
}
