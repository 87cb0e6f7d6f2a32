// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! File inode state machine
//!
//! Every projected file is in exactly one of three states:
//!
//! - `NotLoaded`: still a placeholder; the committed hash (and maybe a cached
//!   size) is known, but no load is in flight.
//! - `Loading`: a blob fetch is in flight; concurrent readers latch onto one
//!   shared promise so at most one fetch runs per inode per episode.
//! - `Materialized`: the authoritative bytes live in the overlay; the inode
//!   never returns to a non-materialized state.
//!
//! The state is guarded by a synchronous lock that is never held across a
//! suspension point. Every release of the lock re-checks the tag invariants;
//! a violation is a bug and aborts rather than limping on.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use bytes::Bytes;
use futures::channel::oneshot;
use futures::future::Shared;
use futures::FutureExt;
use tracing::{debug, error, trace};

use crate::blob::Blob;
use crate::cache::BlobCache;
use crate::coverage::CoverageSet;
use crate::error::{FsError, FsResult};
use crate::hash::{Hash20, ObjectId};
use crate::mount::{FetchContext, MountContext};
use crate::overlay::Overlay;
use crate::path::RepoPathBuf;
use crate::store::{ObjectStore, StoreError};

/// Mount-local inode number.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InodeNumber(pub u64);

impl InodeNumber {
    pub const ROOT: InodeNumber = InodeNumber(1);
}

impl std::fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Committed tree-entry type, used by the identity fast path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryType {
    Regular,
    Executable,
    Symlink,
    Directory,
}

/// Everything remembered about a file that is still backed by a commit.
#[derive(Clone, Debug)]
struct NonMaterializedState {
    id: ObjectId,
    size: Option<u64>,
}

type LoadOutcome = Result<Option<Arc<Blob>>, StoreError>;
type LoadFuture = Shared<oneshot::Receiver<LoadOutcome>>;

struct LoadingState {
    sender: oneshot::Sender<LoadOutcome>,
    future: LoadFuture,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StateTag {
    NotLoaded,
    Loading,
    Materialized,
}

/// Inode state guarded by the per-inode lock.
pub struct State {
    tag: StateTag,
    non_materialized: Option<NonMaterializedState>,
    loading: Option<LoadingState>,
    // Pin on the cached blob while the kernel may still ask for more of it.
    cache_handle: Option<Arc<Blob>>,
    read_coverage: CoverageSet,
}

impl State {
    fn new_virtual(id: ObjectId, size: Option<u64>) -> State {
        State {
            tag: StateTag::NotLoaded,
            non_materialized: Some(NonMaterializedState { id, size }),
            loading: None,
            cache_handle: None,
            read_coverage: CoverageSet::new(),
        }
    }

    fn new_materialized() -> State {
        State {
            tag: StateTag::Materialized,
            non_materialized: None,
            loading: None,
            cache_handle: None,
            read_coverage: CoverageSet::new(),
        }
    }

    pub fn is_materialized(&self) -> bool {
        self.tag == StateTag::Materialized
    }

    /// Tag invariants, re-checked at every lock release.
    fn check_invariants(&self) {
        match self.tag {
            StateTag::NotLoaded => {
                if self.non_materialized.is_none() || self.loading.is_some() {
                    invariant_bug("NotLoaded inode must keep its committed state and no promise");
                }
            }
            StateTag::Loading => {
                if self.non_materialized.is_none()
                    || self.loading.is_none()
                    || self.cache_handle.is_some()
                    || !self.read_coverage.is_empty()
                {
                    invariant_bug("Loading inode must hold exactly a promise and committed state");
                }
            }
            StateTag::Materialized => {
                if self.non_materialized.is_some()
                    || self.loading.is_some()
                    || self.cache_handle.is_some()
                    || !self.read_coverage.is_empty()
                {
                    invariant_bug("Materialized inode must not retain non-materialized state");
                }
            }
        }
    }

    /// Move into `Materialized`, clearing all non-materialized bookkeeping.
    fn set_materialized(&mut self) {
        self.non_materialized = None;
        self.tag = StateTag::Materialized;
        self.cache_handle = None;
        self.read_coverage.clear();
    }

    /// If this inode still has access to a cached blob, return it. Only
    /// meaningful while not materialized.
    fn cached_blob(&mut self, cache: &BlobCache) -> Option<Arc<Blob>> {
        if let Some(blob) = &self.cache_handle {
            return Some(blob.clone());
        }
        let id = match &self.non_materialized {
            Some(nm) => nm.id.clone(),
            None => invariant_bug("cached_blob called on a materialized inode"),
        };
        if let Some(blob) = cache.get(&id) {
            self.cache_handle = Some(blob.clone());
            return Some(blob);
        }
        // The blob was evicted behind our back, so the coverage set no
        // longer reflects what the kernel actually has cached.
        self.cache_handle = None;
        self.read_coverage.clear();
        None
    }

    fn loading_future(&self) -> LoadFuture {
        match &self.loading {
            Some(loading) => loading.future.clone(),
            None => invariant_bug("loading_future called without an in-flight load"),
        }
    }
}

/// Lock guard over the inode state; verifies the tag invariants when
/// released.
pub struct LockedState<'a> {
    guard: MutexGuard<'a, State>,
}

impl Deref for LockedState<'_> {
    type Target = State;

    fn deref(&self) -> &State {
        &self.guard
    }
}

impl DerefMut for LockedState<'_> {
    fn deref_mut(&mut self) -> &mut State {
        &mut self.guard
    }
}

impl Drop for LockedState<'_> {
    fn drop(&mut self) {
        self.guard.check_invariants();
    }
}

fn invariant_bug(msg: &str) -> ! {
    error!(target: "repofs::inode", "{msg}");
    panic!("{msg}");
}

async fn await_load(future: LoadFuture) -> FsResult<Option<Arc<Blob>>> {
    match future.await {
        Ok(Ok(blob)) => Ok(blob),
        Ok(Err(err)) => Err(err.into()),
        Err(_cancelled) => invariant_bug("loading promise dropped without being fulfilled"),
    }
}

/// A single projected file.
///
/// Created either from a committed tree entry (`new_virtual`, placeholder
/// with a known hash) or from an existing overlay file (`new_materialized`).
pub struct FileInode {
    ino: InodeNumber,
    entry_type: EntryType,
    path: RwLock<RepoPathBuf>,
    mount: Arc<MountContext>,
    store: Arc<dyn ObjectStore>,
    cache: BlobCache,
    overlay: Arc<dyn Overlay>,
    state: Mutex<State>,
}

impl FileInode {
    #[allow(clippy::too_many_arguments)]
    pub fn new_virtual(
        ino: InodeNumber,
        entry_type: EntryType,
        path: RepoPathBuf,
        id: ObjectId,
        size: Option<u64>,
        mount: Arc<MountContext>,
        store: Arc<dyn ObjectStore>,
        cache: BlobCache,
        overlay: Arc<dyn Overlay>,
    ) -> Arc<FileInode> {
        Arc::new(FileInode {
            ino,
            entry_type,
            path: RwLock::new(path),
            mount,
            store,
            cache,
            overlay,
            state: Mutex::new(State::new_virtual(id, size)),
        })
    }

    pub fn new_materialized(
        ino: InodeNumber,
        entry_type: EntryType,
        path: RepoPathBuf,
        mount: Arc<MountContext>,
        store: Arc<dyn ObjectStore>,
        cache: BlobCache,
        overlay: Arc<dyn Overlay>,
    ) -> Arc<FileInode> {
        Arc::new(FileInode {
            ino,
            entry_type,
            path: RwLock::new(path),
            mount,
            store,
            cache,
            overlay,
            state: Mutex::new(State::new_materialized()),
        })
    }

    pub fn ino(&self) -> InodeNumber {
        self.ino
    }

    pub fn entry_type(&self) -> EntryType {
        self.entry_type
    }

    pub fn path(&self) -> RepoPathBuf {
        self.path.read().unwrap().clone()
    }

    /// Update the recorded location after a rename. The caller holds the
    /// mount rename lock.
    pub fn set_path(&self, path: RepoPathBuf) {
        *self.path.write().unwrap() = path;
    }

    /// The committed hash, while one still exists.
    pub fn committed_id(&self) -> Option<ObjectId> {
        self.lock_state().non_materialized.as_ref().map(|nm| nm.id.clone())
    }

    pub fn is_materialized(&self) -> bool {
        self.lock_state().is_materialized()
    }

    fn lock_state(&self) -> LockedState<'_> {
        LockedState {
            guard: self.state.lock().unwrap(),
        }
    }

    fn log_access(&self, ctx: &FetchContext) {
        let path = self.path.read().unwrap();
        self.mount.log_access(self.ino, &path, ctx);
    }

    /// Run `f` with blob bytes available, or in the materialized state (in
    /// which case the blob argument is `None` and the overlay is
    /// authoritative).
    pub async fn run_while_loaded<R, F>(self: &Arc<Self>, ctx: &FetchContext, f: F) -> FsResult<R>
    where
        F: for<'a> FnOnce(LockedState<'a>, Option<Arc<Blob>>) -> FsResult<R>,
    {
        let mut preloaded: Option<Arc<Blob>> = None;
        let (state, blob) = loop {
            let mut state = self.lock_state();
            match state.tag {
                StateTag::NotLoaded => {
                    match preloaded.take().or_else(|| state.cached_blob(&self.cache)) {
                        Some(blob) => break (state, Some(blob)),
                        None => {
                            let future = self.start_loading(state, ctx);
                            preloaded = await_load(future).await?;
                        }
                    }
                }
                StateTag::Loading => {
                    let future = state.loading_future();
                    drop(state);
                    preloaded = await_load(future).await?;
                }
                StateTag::Materialized => break (state, None),
            }
        };
        self.log_access(ctx);
        f(state, blob)
    }

    /// Run `f` with the file materialized in the overlay.
    pub async fn run_while_materialized<R, F>(
        self: &Arc<Self>,
        ctx: &FetchContext,
        f: F,
    ) -> FsResult<R>
    where
        F: for<'a> FnOnce(LockedState<'a>) -> FsResult<R>,
    {
        let mut preloaded: Option<Arc<Blob>> = None;
        let (state, materialized_now) = loop {
            let mut state = self.lock_state();
            match state.tag {
                StateTag::NotLoaded => {
                    match preloaded.take().or_else(|| state.cached_blob(&self.cache)) {
                        Some(blob) => {
                            self.materialize_now(&mut state, &blob)?;
                            break (state, true);
                        }
                        None => {
                            let future = self.start_loading(state, ctx);
                            preloaded = await_load(future).await?;
                        }
                    }
                }
                StateTag::Loading => {
                    let future = state.loading_future();
                    drop(state);
                    preloaded = await_load(future).await?;
                }
                StateTag::Materialized => break (state, false),
            }
        };
        self.log_access(ctx);
        let result = f(state);
        if materialized_now {
            // The parent learns about the transition only after the state
            // lock is released. A crash in this window reverts the most
            // recent change, which is acceptable.
            self.materialize_in_parent().await;
        }
        result
    }

    /// Fast path for callers that will overwrite the entire contents:
    /// materialize with an empty overlay file instead of fetching the blob.
    pub async fn truncate_and_run<R, F>(self: &Arc<Self>, _ctx: &FetchContext, f: F) -> FsResult<R>
    where
        F: for<'a> FnOnce(LockedState<'a>) -> FsResult<R>,
    {
        let mut state = self.lock_state();
        match state.tag {
            StateTag::NotLoaded | StateTag::Loading => {
                self.overlay.create_empty_file(self.ino)?;
                let loading = state.loading.take();
                state.set_materialized();
                trace!(target: "repofs::inode", ino = self.ino.0, "materialized by truncation");
                let result = f(state);
                self.materialize_in_parent().await;
                if let Some(loading) = loading {
                    // Subscribers of the aborted load observe a null blob and
                    // find the inode materialized when they re-enter.
                    let _ = loading.sender.send(Ok(None));
                }
                result
            }
            StateTag::Materialized => {
                self.overlay.truncate(self.ino, 0)?;
                f(state)
            }
        }
    }

    /// Start a blob fetch and transition to `Loading`. Consumes the state
    /// lock; the returned future resolves once the fetch completes.
    fn start_loading(
        self: &Arc<Self>,
        mut state: LockedState<'_>,
        ctx: &FetchContext,
    ) -> LoadFuture {
        let id = match &state.non_materialized {
            Some(nm) => nm.id.clone(),
            None => invariant_bug("start_loading requires a committed hash"),
        };
        let (sender, receiver) = oneshot::channel();
        let future = receiver.shared();
        state.loading = Some(LoadingState {
            sender,
            future: future.clone(),
        });
        state.tag = StateTag::Loading;
        drop(state);

        trace!(target: "repofs::inode", ino = self.ino.0, id = %id, "starting blob load");
        let inode = Arc::clone(self);
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let result = inode.store.get_blob(&id, &ctx).await;
            inode.finish_load(result);
        });
        future
    }

    fn finish_load(&self, result: Result<Arc<Blob>, StoreError>) {
        let mut state = self.lock_state();
        match state.tag {
            StateTag::NotLoaded => {
                invariant_bug("a blob load finished while the inode was not loading")
            }
            StateTag::Loading => {
                let Some(loading) = state.loading.take() else {
                    invariant_bug("Loading inode lost its promise");
                };
                state.tag = StateTag::NotLoaded;
                let outcome = match result {
                    Ok(blob) => {
                        self.cache.insert(blob.clone());
                        state.cache_handle = Some(blob.clone());
                        Ok(Some(blob))
                    }
                    Err(err) => {
                        debug!(target: "repofs::inode", ino = self.ino.0, %err, "blob load failed");
                        Err(err)
                    }
                };
                // Fulfill subscribers outside the lock.
                drop(state);
                let _ = loading.sender.send(outcome);
            }
            StateTag::Materialized => {
                // The load raced with a truncation; the truncating path
                // already fulfilled the promise with a null blob.
                if state.loading.is_some() {
                    invariant_bug("materialized inode still holds a loading promise");
                }
            }
        }
    }

    /// Copy the blob into the overlay and flip to `Materialized`. Runs
    /// synchronously under the state lock.
    fn materialize_now(&self, state: &mut LockedState<'_>, blob: &Arc<Blob>) -> FsResult<()> {
        if state.tag != StateTag::NotLoaded {
            invariant_bug("materialize_now requires the NotLoaded state");
        }
        let sha1 = blob.content_sha1();
        self.overlay.create_file(self.ino, blob, Some(sha1))?;
        state.set_materialized();
        trace!(target: "repofs::inode", ino = self.ino.0, "materialized");
        Ok(())
    }

    /// Tell the parent directory this child is now materialized. Must be
    /// called after the state lock has been released.
    async fn materialize_in_parent(&self) {
        let _rename = self.mount.acquire_rename_lock().await;
        let path = self.path.read().unwrap().clone();
        self.mount.notify_child_materialized(&path);
    }

    /// Read file contents; returns the bytes and an EOF flag.
    pub async fn read(
        self: &Arc<Self>,
        offset: u64,
        len: usize,
        ctx: &FetchContext,
    ) -> FsResult<(Bytes, bool)> {
        let ino = self.ino;
        let overlay = self.overlay.clone();
        self.run_while_loaded(ctx, move |mut state, blob| {
            if state.is_materialized() {
                // EOF is only reported when the read comes back empty, which
                // forces a second read at the end of the file.
                let data = overlay.read(ino, offset, len)?;
                let eof = len != 0 && data.is_empty();
                return Ok((Bytes::from(data), eof));
            }

            let Some(blob) = blob else {
                invariant_bug("neither materialized nor loaded in run_while_loaded");
            };
            state.read_coverage.add(offset, offset + len as u64);
            if state.read_coverage.covers(0, blob.size()) {
                debug!(
                    target: "repofs::inode",
                    ino = ino.0,
                    id = %blob.id(),
                    "fully read; dropping blob interest"
                );
                state.cache_handle = None;
                state.read_coverage.clear();
            }

            let contents = blob.contents();
            if offset >= contents.len() as u64 {
                return Ok((Bytes::new(), true));
            }
            let start = offset as usize;
            let end = usize::min(start + len, contents.len());
            Ok((contents.slice(start..end), end == contents.len()))
        })
        .await
    }

    /// Write into the overlay, materializing first if needed.
    pub async fn write(
        self: &Arc<Self>,
        offset: u64,
        data: &[u8],
        ctx: &FetchContext,
    ) -> FsResult<usize> {
        let ino = self.ino;
        let overlay = self.overlay.clone();
        self.run_while_materialized(ctx, move |state| {
            let written = overlay.write(ino, offset, data)?;
            drop(state);
            Ok(written)
        })
        .await
    }

    /// SHA-1 of the current file contents.
    pub async fn sha1(self: &Arc<Self>, ctx: &FetchContext) -> FsResult<Hash20> {
        self.log_access(ctx);
        let committed = {
            let state = self.lock_state();
            state.non_materialized.as_ref().map(|nm| nm.id.clone())
        };
        match committed {
            Some(id) => Ok(self.store.get_blob_sha1(&id, ctx).await?),
            None => self.overlay.sha1(self.ino),
        }
    }

    /// Current file size. For placeholders the size is served from the
    /// cached committed size when known, refreshing it from the store
    /// otherwise.
    pub async fn size(self: &Arc<Self>, ctx: &FetchContext) -> FsResult<u64> {
        enum Source {
            Overlay,
            Known(u64),
            Fetch(ObjectId),
        }

        let source = {
            let state = self.lock_state();
            if state.is_materialized() {
                Source::Overlay
            } else {
                let Some(nm) = &state.non_materialized else {
                    invariant_bug("non-materialized inode lost its committed state");
                };
                match nm.size {
                    Some(size) => Source::Known(size),
                    None => Source::Fetch(nm.id.clone()),
                }
            }
        };

        match source {
            Source::Overlay => self.overlay.file_size(self.ino),
            Source::Known(size) => Ok(size),
            Source::Fetch(id) => {
                let size = self.store.get_blob_size(&id, ctx).await?;
                let mut state = self.lock_state();
                if let Some(nm) = state.non_materialized.as_mut() {
                    nm.size = Some(size);
                }
                Ok(size)
            }
        }
    }

    /// Entry-type and hash comparison; `None` means the fast path cannot
    /// decide.
    fn is_same_as_fast(&self, id: &ObjectId, entry_type: EntryType) -> Option<bool> {
        if entry_type != self.entry_type {
            return Some(false);
        }
        let state = self.lock_state();
        if let Some(nm) = &state.non_materialized {
            // Equal object ids imply equal contents. The converse does not
            // hold: ids may embed history, so differing ids prove nothing.
            if &nm.id == id {
                return Some(true);
            }
        }
        None
    }

    async fn is_same_as_slow(self: &Arc<Self>, expected_sha1: Hash20, ctx: &FetchContext) -> bool {
        match self.sha1(ctx).await {
            Ok(ours) => ours == expected_sha1,
            Err(err) => {
                debug!(target: "repofs::inode", ino = self.ino.0, %err, "assuming changed");
                false
            }
        }
    }

    /// Compare against a blob whose contents are already in hand.
    pub async fn is_same_as_blob(
        self: &Arc<Self>,
        blob: &Blob,
        entry_type: EntryType,
        ctx: &FetchContext,
    ) -> bool {
        if let Some(result) = self.is_same_as_fast(blob.id(), entry_type) {
            return result;
        }
        self.is_same_as_slow(blob.content_sha1(), ctx).await
    }

    /// Compare against a committed entry whose content SHA-1 is known.
    pub async fn is_same_as_with_sha1(
        self: &Arc<Self>,
        id: &ObjectId,
        sha1: Hash20,
        entry_type: EntryType,
        ctx: &FetchContext,
    ) -> bool {
        if let Some(result) = self.is_same_as_fast(id, entry_type) {
            return result;
        }
        self.is_same_as_slow(sha1, ctx).await
    }

    /// Compare against a committed entry known only by id; both SHA-1s are
    /// resolved concurrently.
    pub async fn is_same_as_id(
        self: &Arc<Self>,
        id: &ObjectId,
        entry_type: EntryType,
        ctx: &FetchContext,
    ) -> bool {
        if let Some(result) = self.is_same_as_fast(id, entry_type) {
            return result;
        }
        let theirs = self.store.get_blob_sha1(id, ctx);
        let (ours, theirs) = tokio::join!(self.sha1(ctx), theirs);
        match (ours, theirs) {
            (Ok(a), Ok(b)) => a == b,
            (Err(err), _) => {
                debug!(target: "repofs::inode", ino = self.ino.0, %err, "assuming changed");
                false
            }
            (_, Err(err)) => {
                debug!(target: "repofs::inode", ino = self.ino.0, %err, "assuming changed");
                false
            }
        }
    }

    /// Wait for any in-flight load to settle, surfacing its error. Required
    /// before `snapshot`.
    pub async fn quiesce(self: &Arc<Self>) -> FsResult<()> {
        let future = {
            let state = self.lock_state();
            match state.tag {
                StateTag::Loading => Some(state.loading_future()),
                _ => None,
            }
        };
        if let Some(future) = future {
            await_load(future).await?;
        }
        Ok(())
    }

    /// Capture this inode for takeover serialization. Only the
    /// non-materialized and materialized tags survive a process handoff;
    /// a load still in flight must be quiesced first.
    pub fn snapshot(&self) -> FsResult<InodeSnapshot> {
        let state = self.lock_state();
        let snapshot_state = match state.tag {
            StateTag::NotLoaded => {
                let Some(nm) = &state.non_materialized else {
                    invariant_bug("non-materialized inode lost its committed state");
                };
                SnapshotState::NonMaterialized {
                    id: nm.id.clone(),
                    size: nm.size,
                }
            }
            StateTag::Loading => {
                return Err(FsError::Validation(
                    "inode has a load in flight; quiesce before snapshotting".to_string(),
                ))
            }
            StateTag::Materialized => SnapshotState::Materialized,
        };
        Ok(InodeSnapshot {
            ino: self.ino,
            path: self.path.read().unwrap().clone(),
            entry_type: self.entry_type,
            state: snapshot_state,
        })
    }
}

impl std::fmt::Debug for FileInode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("FileInode")
            .field("ino", &self.ino)
            .field("path", &*self.path.read().unwrap())
            .field("tag", &state.tag)
            .finish()
    }
}

/// Transportable view of one inode's state for process takeover.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InodeSnapshot {
    pub ino: InodeNumber,
    pub path: RepoPathBuf,
    pub entry_type: EntryType,
    pub state: SnapshotState,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SnapshotState {
    NonMaterialized { id: ObjectId, size: Option<u64> },
    Materialized,
}

impl InodeSnapshot {
    /// Rebuild an inode in a new process from its snapshot.
    pub fn restore(
        self,
        mount: Arc<MountContext>,
        store: Arc<dyn ObjectStore>,
        cache: BlobCache,
        overlay: Arc<dyn Overlay>,
    ) -> Arc<FileInode> {
        match self.state {
            SnapshotState::NonMaterialized { id, size } => FileInode::new_virtual(
                self.ino,
                self.entry_type,
                self.path,
                id,
                size,
                mount,
                store,
                cache,
                overlay,
            ),
            SnapshotState::Materialized => FileInode::new_materialized(
                self.ino,
                self.entry_type,
                self.path,
                mount,
                store,
                cache,
                overlay,
            ),
        }
    }
}

