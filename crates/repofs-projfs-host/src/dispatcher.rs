// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Dispatcher seam
//!
//! The dispatcher knows how to answer filesystem questions from the backing
//! object store and inode tree. It is a flat capability set; implementations
//! are variants behind this trait, not an inheritance tree.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use repofs_core::{FetchContext, FsResult, RepoPath, RepoPathBuf};

/// One entry of a directory listing, sizes already resolved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnumEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
}

/// Result of resolving a single path.
pub struct LookupResult {
    /// The canonical path of the entry (case corrected when the lookup was
    /// case-insensitive).
    pub path: RepoPathBuf,
    pub is_dir: bool,
    pub size: u64,
    /// Invoked once the OS has accepted the placeholder, so the dispatcher
    /// can account for the OS-side reference.
    pub on_placeholder_written: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl std::fmt::Debug for LookupResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LookupResult")
            .field("path", &self.path)
            .field("is_dir", &self.is_dir)
            .field("size", &self.size)
            .finish()
    }
}

/// Mount-level counters reported through the channel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MountStats {
    pub placeholder_files: u64,
    pub materialized_files: u64,
}

#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// List a directory for enumeration.
    async fn opendir(&self, path: &RepoPath, ctx: &FetchContext) -> FsResult<Vec<EnumEntry>>;

    /// Resolve one path; `None` when it does not exist.
    async fn lookup(&self, path: &RepoPath, ctx: &FetchContext)
        -> FsResult<Option<LookupResult>>;

    /// Existence check only.
    async fn access(&self, path: &RepoPath, ctx: &FetchContext) -> FsResult<bool>;

    /// Full contents of a projected file.
    async fn read(&self, path: &RepoPath, ctx: &FetchContext) -> FsResult<Bytes>;

    async fn file_created(&self, path: &RepoPath, ctx: &FetchContext) -> FsResult<()>;

    async fn dir_created(&self, path: &RepoPath, ctx: &FetchContext) -> FsResult<()>;

    async fn file_modified(&self, path: &RepoPath, ctx: &FetchContext) -> FsResult<()>;

    async fn file_deleted(&self, path: &RepoPath, ctx: &FetchContext) -> FsResult<()>;

    async fn dir_deleted(&self, path: &RepoPath, ctx: &FetchContext) -> FsResult<()>;

    async fn file_renamed(
        &self,
        old_path: &RepoPath,
        new_path: &RepoPath,
        ctx: &FetchContext,
    ) -> FsResult<()>;

    async fn get_stats(&self) -> FsResult<MountStats>;
}
