// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Mount-wide shared state consumed by file inodes
//!
//! Inodes do not own their parents; transitions that must be visible to the
//! parent directory go through the mount's materialization sink, under the
//! rename lock so the child's location cannot shift mid-notification.

use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};
use tracing::trace;

use crate::inode::InodeNumber;
use crate::path::RepoPath;

/// Why an object fetch is happening, for access logging and telemetry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchCause {
    Unknown,
    Fs,
    Prefetch,
    Takeover,
}

/// Per-request fetch context threaded through every suspension point.
#[derive(Clone, Debug)]
pub struct FetchContext {
    cause: FetchCause,
    detail: Option<Arc<str>>,
}

impl FetchContext {
    pub fn new(cause: FetchCause) -> FetchContext {
        FetchContext {
            cause,
            detail: None,
        }
    }

    pub fn with_detail(cause: FetchCause, detail: impl Into<Arc<str>>) -> FetchContext {
        FetchContext {
            cause,
            detail: Some(detail.into()),
        }
    }

    pub fn unknown() -> FetchContext {
        Self::new(FetchCause::Unknown)
    }

    pub fn cause(&self) -> FetchCause {
        self.cause
    }

    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }
}

/// Receives child-materialized events, typically implemented by the
/// directory layer above the core.
pub trait MaterializationSink: Send + Sync {
    fn child_materialized(&self, path: &RepoPath);
}

/// Shared per-mount state handed to every inode.
pub struct MountContext {
    rename_lock: Mutex<()>,
    sink: Option<Arc<dyn MaterializationSink>>,
}

impl MountContext {
    pub fn new(sink: Option<Arc<dyn MaterializationSink>>) -> MountContext {
        MountContext {
            rename_lock: Mutex::new(()),
            sink,
        }
    }

    /// The mount-wide rename lock. Held while notifying a parent of a child
    /// materialization so the child cannot be renamed away mid-update.
    pub async fn acquire_rename_lock(&self) -> MutexGuard<'_, ()> {
        self.rename_lock.lock().await
    }

    pub fn notify_child_materialized(&self, path: &RepoPath) {
        if let Some(sink) = &self.sink {
            sink.child_materialized(path);
        }
    }

    /// Process-access log hook. Root accesses are not recorded.
    pub fn log_access(&self, ino: InodeNumber, path: &RepoPath, ctx: &FetchContext) {
        if ino == InodeNumber::ROOT {
            return;
        }
        trace!(
            target: "repofs::access",
            ino = ino.0,
            %path,
            cause = ?ctx.cause(),
            detail = ctx.detail(),
            "file access"
        );
    }
}

impl Default for MountContext {
    fn default() -> Self {
        Self::new(None)
    }
}
