// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Overlay storage for materialized files
//!
//! Once a file is materialized its authoritative bytes live here rather than
//! in the object store. The disk implementation keeps one content file per
//! inode number under the mount's state directory. File access is serialized
//! per inode by the implementation.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use sha1::{Digest, Sha1};

use crate::blob::Blob;
use crate::error::FsResult;
use crate::hash::Hash20;
use crate::inode::InodeNumber;

/// Local persistent storage for materialized file contents.
pub trait Overlay: Send + Sync {
    /// Create the overlay file for `ino` from blob contents. A SHA-1 already
    /// known for the contents is recorded so later identity checks can skip
    /// rehashing.
    fn create_file(&self, ino: InodeNumber, blob: &Blob, sha1: Option<Hash20>) -> FsResult<()>;

    /// Create an empty overlay file for `ino` (the truncating fast path).
    fn create_empty_file(&self, ino: InodeNumber) -> FsResult<()>;

    fn read(&self, ino: InodeNumber, offset: u64, len: usize) -> FsResult<Vec<u8>>;

    fn write(&self, ino: InodeNumber, offset: u64, data: &[u8]) -> FsResult<usize>;

    fn truncate(&self, ino: InodeNumber, len: u64) -> FsResult<()>;

    fn file_size(&self, ino: InodeNumber) -> FsResult<u64>;

    /// SHA-1 of the current overlay contents.
    fn sha1(&self, ino: InodeNumber) -> FsResult<Hash20>;

    fn remove(&self, ino: InodeNumber) -> FsResult<()>;
}

/// Overlay backed by a directory of per-inode content files.
pub struct DiskOverlay {
    root: PathBuf,
    // Hashes known to match current contents; invalidated on write/truncate.
    sha1_cache: Mutex<HashMap<InodeNumber, Hash20>>,
}

impl DiskOverlay {
    pub fn new(root: PathBuf) -> FsResult<DiskOverlay> {
        std::fs::create_dir_all(&root)?;
        Ok(DiskOverlay {
            root,
            sha1_cache: Mutex::new(HashMap::new()),
        })
    }

    fn content_path(&self, ino: InodeNumber) -> PathBuf {
        self.root.join(format!("{:016x}", ino.0))
    }

    fn open(&self, ino: InodeNumber) -> FsResult<File> {
        Ok(OpenOptions::new().read(true).write(true).open(self.content_path(ino))?)
    }

    fn invalidate_sha1(&self, ino: InodeNumber) {
        self.sha1_cache.lock().unwrap().remove(&ino);
    }
}

impl Overlay for DiskOverlay {
    fn create_file(&self, ino: InodeNumber, blob: &Blob, sha1: Option<Hash20>) -> FsResult<()> {
        std::fs::write(self.content_path(ino), blob.contents())?;
        if let Some(hash) = sha1 {
            self.sha1_cache.lock().unwrap().insert(ino, hash);
        }
        Ok(())
    }

    fn create_empty_file(&self, ino: InodeNumber) -> FsResult<()> {
        std::fs::write(self.content_path(ino), b"")?;
        self.invalidate_sha1(ino);
        Ok(())
    }

    fn read(&self, ino: InodeNumber, offset: u64, len: usize) -> FsResult<Vec<u8>> {
        let mut file = self.open(ino)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = file.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }

    fn write(&self, ino: InodeNumber, offset: u64, data: &[u8]) -> FsResult<usize> {
        let mut file = self.open(ino)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        self.invalidate_sha1(ino);
        Ok(data.len())
    }

    fn truncate(&self, ino: InodeNumber, len: u64) -> FsResult<()> {
        let file = self.open(ino)?;
        file.set_len(len)?;
        self.invalidate_sha1(ino);
        Ok(())
    }

    fn file_size(&self, ino: InodeNumber) -> FsResult<u64> {
        Ok(std::fs::metadata(self.content_path(ino))?.len())
    }

    fn sha1(&self, ino: InodeNumber) -> FsResult<Hash20> {
        if let Some(hash) = self.sha1_cache.lock().unwrap().get(&ino) {
            return Ok(*hash);
        }
        let mut file = File::open(self.content_path(ino))?;
        let mut hasher = Sha1::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        let hash = Hash20(hasher.finalize().into());
        self.sha1_cache.lock().unwrap().insert(ino, hash);
        Ok(hash)
    }

    fn remove(&self, ino: InodeNumber) -> FsResult<()> {
        self.invalidate_sha1(ino);
        std::fs::remove_file(self.content_path(ino))?;
        Ok(())
    }
}
