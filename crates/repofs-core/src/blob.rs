// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Blob value type

use bytes::Bytes;

use crate::hash::{Hash20, ObjectId};

/// An immutable file-content object fetched from the object store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Blob {
    id: ObjectId,
    contents: Bytes,
}

impl Blob {
    pub fn new(id: ObjectId, contents: impl Into<Bytes>) -> Blob {
        Blob {
            id,
            contents: contents.into(),
        }
    }

    pub fn id(&self) -> &ObjectId {
        &self.id
    }

    pub fn contents(&self) -> &Bytes {
        &self.contents
    }

    pub fn size(&self) -> u64 {
        self.contents.len() as u64
    }

    /// SHA-1 of the blob contents (not of the object identifier).
    pub fn content_sha1(&self) -> Hash20 {
        Hash20::sha1(&self.contents)
    }
}
