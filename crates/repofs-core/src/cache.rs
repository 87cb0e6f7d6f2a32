// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! In-memory blob cache
//!
//! A concurrent multi-reader cache keyed by content hash. Inodes that have
//! fully delivered a blob to the kernel drop their handle so eviction can
//! reclaim the memory.

use std::sync::Arc;

use moka::sync::Cache;

use crate::blob::Blob;
use crate::hash::ObjectId;

/// Default cache budget. Weighted by blob size.
const DEFAULT_MAX_BYTES: u64 = 256 * 1024 * 1024;

#[derive(Clone)]
pub struct BlobCache {
    blobs: Cache<ObjectId, Arc<Blob>>,
}

impl BlobCache {
    pub fn new() -> BlobCache {
        Self::with_max_bytes(DEFAULT_MAX_BYTES)
    }

    pub fn with_max_bytes(max_bytes: u64) -> BlobCache {
        BlobCache {
            blobs: Cache::builder()
                .max_capacity(max_bytes)
                .weigher(|_id, blob: &Arc<Blob>| {
                    blob.size().try_into().unwrap_or(u32::MAX)
                })
                .build(),
        }
    }

    pub fn get(&self, id: &ObjectId) -> Option<Arc<Blob>> {
        self.blobs.get(id)
    }

    pub fn insert(&self, blob: Arc<Blob>) {
        self.blobs.insert(blob.id().clone(), blob);
    }

    pub fn invalidate(&self, id: &ObjectId) {
        self.blobs.invalidate(id);
    }

    pub fn entry_count(&self) -> u64 {
        self.blobs.run_pending_tasks();
        self.blobs.entry_count()
    }
}

impl Default for BlobCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BlobCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobCache").field("entries", &self.blobs.entry_count()).finish()
    }
}
