// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Fake object store for tests
//!
//! Seeded with blobs and trees up front; records per-object fetch counts and
//! can hold fetches at a gate so tests can deterministically observe the
//! `Loading` state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;

use crate::blob::Blob;
use crate::hash::{Hash20, ObjectId};
use crate::mount::FetchContext;
use crate::store::{ObjectStore, StoreError, TreeEntry};

pub struct FakeObjectStore {
    blobs: Mutex<HashMap<ObjectId, Arc<Blob>>>,
    trees: Mutex<HashMap<ObjectId, Vec<TreeEntry>>>,
    errors: Mutex<HashMap<ObjectId, StoreError>>,
    fetch_counts: Mutex<HashMap<ObjectId, u64>>,
    fetches_started: AtomicU64,
    gate: watch::Sender<bool>,
}

impl FakeObjectStore {
    pub fn new() -> FakeObjectStore {
        FakeObjectStore::default()
    }

    /// Seed a blob and return its identifier.
    pub fn add_blob(&self, contents: impl Into<Bytes>) -> ObjectId {
        let contents = contents.into();
        let id = ObjectId::sha1(&contents);
        let blob = Arc::new(Blob::new(id.clone(), contents));
        self.blobs.lock().unwrap().insert(id.clone(), blob);
        id
    }

    pub fn add_tree(&self, entries: Vec<TreeEntry>) -> ObjectId {
        let id = ObjectId::sha1(format!("tree:{}", entries.len()).as_bytes());
        self.trees.lock().unwrap().insert(id.clone(), entries);
        id
    }

    /// Make every fetch of `id` fail with `error`.
    pub fn inject_error(&self, id: ObjectId, error: StoreError) {
        self.errors.lock().unwrap().insert(id, error);
    }

    pub fn clear_errors(&self) {
        self.errors.lock().unwrap().clear();
    }

    /// Block fetches until `release_fetches` is called.
    pub fn hold_fetches(&self) {
        let _ = self.gate.send(false);
    }

    pub fn release_fetches(&self) {
        let _ = self.gate.send(true);
    }

    pub fn fetch_count(&self, id: &ObjectId) -> u64 {
        self.fetch_counts.lock().unwrap().get(id).copied().unwrap_or(0)
    }

    /// Total fetches that have begun, including those parked at the gate.
    pub fn fetches_started(&self) -> u64 {
        self.fetches_started.load(Ordering::SeqCst)
    }

    async fn pass_gate(&self) {
        let mut rx = self.gate.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    fn record_fetch(&self, id: &ObjectId) -> Result<(), StoreError> {
        *self.fetch_counts.lock().unwrap().entry(id.clone()).or_insert(0) += 1;
        if let Some(err) = self.errors.lock().unwrap().get(id) {
            return Err(err.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for FakeObjectStore {
    async fn get_blob(&self, id: &ObjectId, _ctx: &FetchContext) -> Result<Arc<Blob>, StoreError> {
        self.fetches_started.fetch_add(1, Ordering::SeqCst);
        self.pass_gate().await;
        self.record_fetch(id)?;
        self.blobs
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    async fn get_blob_sha1(
        &self,
        id: &ObjectId,
        _ctx: &FetchContext,
    ) -> Result<Hash20, StoreError> {
        let blob = self
            .blobs
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        Ok(blob.content_sha1())
    }

    async fn get_blob_size(&self, id: &ObjectId, _ctx: &FetchContext) -> Result<u64, StoreError> {
        let blob = self
            .blobs
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        Ok(blob.size())
    }

    async fn get_tree_entries(
        &self,
        id: &ObjectId,
        _ctx: &FetchContext,
    ) -> Result<Vec<TreeEntry>, StoreError> {
        self.trees
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }
}

impl Default for FakeObjectStore {
    fn default() -> Self {
        let (gate, _) = watch::channel(true);
        FakeObjectStore {
            blobs: Mutex::new(HashMap::new()),
            trees: Mutex::new(HashMap::new()),
            errors: Mutex::new(HashMap::new()),
            fetch_counts: Mutex::new(HashMap::new()),
            fetches_started: AtomicU64::new(0),
            gate,
        }
    }
}
