// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Serialized inode map carried inside takeover records

use std::sync::Arc;

use ssz::{Decode, Encode};
use ssz_derive::{Decode, Encode};

use repofs_core::{
    EntryType, FileInode, FsResult, InodeNumber, InodeSnapshot, ObjectId, RepoPathBuf,
    SnapshotState,
};

use crate::takeover::TakeoverError;

const ENTRY_TYPE_REGULAR: u8 = 0;
const ENTRY_TYPE_EXECUTABLE: u8 = 1;
const ENTRY_TYPE_SYMLINK: u8 = 2;
const ENTRY_TYPE_DIRECTORY: u8 = 3;

/// One inode captured for process handoff. Only the non-materialized and
/// materialized tags cross the process boundary; `hash` is absent for
/// materialized inodes.
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct SerializedInode {
    pub ino: u64,
    pub path: Vec<u8>,
    pub entry_type: u8,
    pub hash: Option<Vec<u8>>,
    pub size: Option<u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Encode, Decode)]
pub struct SerializedInodeMap {
    pub inodes: Vec<SerializedInode>,
}

impl SerializedInodeMap {
    pub fn from_snapshots(snapshots: impl IntoIterator<Item = InodeSnapshot>) -> Self {
        SerializedInodeMap {
            inodes: snapshots.into_iter().map(SerializedInode::from).collect(),
        }
    }

    pub fn into_snapshots(self) -> Result<Vec<InodeSnapshot>, TakeoverError> {
        self.inodes.into_iter().map(InodeSnapshot::try_from).collect()
    }

    pub fn encode(&self) -> Vec<u8> {
        self.as_ssz_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<SerializedInodeMap, TakeoverError> {
        Self::from_ssz_bytes(bytes)
            .map_err(|err| TakeoverError::Decode(format!("inode map: {err:?}")))
    }

    /// Capture a whole mount's inodes for handoff. Inodes with a load in
    /// flight are quiesced first; any pending load error is surfaced to the
    /// caller. Loads started after this point begin in the new process.
    pub async fn capture(inodes: &[Arc<FileInode>]) -> FsResult<SerializedInodeMap> {
        let mut snapshots = Vec::with_capacity(inodes.len());
        for inode in inodes {
            inode.quiesce().await?;
            snapshots.push(inode.snapshot()?);
        }
        Ok(Self::from_snapshots(snapshots))
    }
}

impl From<InodeSnapshot> for SerializedInode {
    fn from(snapshot: InodeSnapshot) -> SerializedInode {
        let entry_type = match snapshot.entry_type {
            EntryType::Regular => ENTRY_TYPE_REGULAR,
            EntryType::Executable => ENTRY_TYPE_EXECUTABLE,
            EntryType::Symlink => ENTRY_TYPE_SYMLINK,
            EntryType::Directory => ENTRY_TYPE_DIRECTORY,
        };
        let (hash, size) = match snapshot.state {
            SnapshotState::NonMaterialized { id, size } => {
                (Some(id.as_bytes().to_vec()), size)
            }
            SnapshotState::Materialized => (None, None),
        };
        SerializedInode {
            ino: snapshot.ino.0,
            path: snapshot.path.as_str().as_bytes().to_vec(),
            entry_type,
            hash,
            size,
        }
    }
}

impl TryFrom<SerializedInode> for InodeSnapshot {
    type Error = TakeoverError;

    fn try_from(inode: SerializedInode) -> Result<InodeSnapshot, TakeoverError> {
        let path = String::from_utf8(inode.path)
            .map_err(|_| TakeoverError::Decode("inode path is not UTF-8".to_string()))
            .and_then(|s| {
                RepoPathBuf::parse(s)
                    .map_err(|err| TakeoverError::Decode(format!("inode path: {err}")))
            })?;
        let entry_type = match inode.entry_type {
            ENTRY_TYPE_REGULAR => EntryType::Regular,
            ENTRY_TYPE_EXECUTABLE => EntryType::Executable,
            ENTRY_TYPE_SYMLINK => EntryType::Symlink,
            ENTRY_TYPE_DIRECTORY => EntryType::Directory,
            other => {
                return Err(TakeoverError::Decode(format!(
                    "unknown inode entry type {other}"
                )))
            }
        };
        let state = match inode.hash {
            Some(hash) => SnapshotState::NonMaterialized {
                id: ObjectId::from_bytes(hash),
                size: inode.size,
            },
            None => SnapshotState::Materialized,
        };
        Ok(InodeSnapshot {
            ino: InodeNumber(inode.ino),
            path,
            entry_type,
            state,
        })
    }
}
