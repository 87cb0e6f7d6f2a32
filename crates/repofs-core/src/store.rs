// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Object store seam
//!
//! The object store is an external collaborator: a content-addressed source
//! of blobs and trees. The core only consumes this interface; concrete
//! implementations (remote stores, pack files, local caches) live elsewhere.

use std::sync::Arc;

use async_trait::async_trait;

use crate::blob::Blob;
use crate::hash::{Hash20, ObjectId};
use crate::mount::FetchContext;

/// Failures surfaced by the object store.
///
/// Clone-able so a single failed fetch can be fanned out to every subscriber
/// of a shared loading promise.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("object {0} not found")]
    NotFound(ObjectId),
    #[error("transient store failure: {0}")]
    Transient(String),
    #[error("corrupt object {id}: {reason}")]
    Corrupt { id: ObjectId, reason: String },
}

/// One entry of a committed tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeEntry {
    pub name: String,
    pub id: ObjectId,
    pub is_dir: bool,
    pub size: u64,
}

/// Content-addressed blob and tree retrieval with SHA-1 metadata.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get_blob(&self, id: &ObjectId, ctx: &FetchContext) -> Result<Arc<Blob>, StoreError>;

    /// SHA-1 of the blob contents, served from metadata when possible.
    async fn get_blob_sha1(&self, id: &ObjectId, ctx: &FetchContext)
        -> Result<Hash20, StoreError>;

    /// Blob size in bytes, served from metadata when possible.
    async fn get_blob_size(&self, id: &ObjectId, ctx: &FetchContext) -> Result<u64, StoreError>;

    async fn get_tree_entries(
        &self,
        id: &ObjectId,
        ctx: &FetchContext,
    ) -> Result<Vec<TreeEntry>, StoreError>;
}
