// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Core object model for repofs
//!
//! This crate owns everything below the projection channel: validated
//! repository paths, content hashes, the object-store seam, the in-memory
//! blob cache, the on-disk overlay for materialized files, and the per-file
//! inode state machine that decides whether a file is still a virtual
//! placeholder or a real local file.

pub mod blob;
pub mod cache;
pub mod config;
pub mod coverage;
pub mod error;
pub mod hash;
pub mod inode;
pub mod mount;
pub mod overlay;
pub mod path;
pub mod store;
pub mod testing;

pub use blob::Blob;
pub use cache::BlobCache;
pub use config::MountConfig;
pub use coverage::CoverageSet;
pub use error::{FsError, FsResult};
pub use hash::{Hash20, ObjectId};
pub use inode::{EntryType, FileInode, InodeNumber, InodeSnapshot, SnapshotState};
pub use mount::{FetchCause, FetchContext, MaterializationSink, MountContext};
pub use overlay::{DiskOverlay, Overlay};
pub use path::{PathError, RepoPath, RepoPathBuf};
pub use store::{ObjectStore, StoreError, TreeEntry};
