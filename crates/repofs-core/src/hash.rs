// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Content hashes and object identifiers

use std::fmt;

use bytes::Bytes;
use sha1::{Digest, Sha1};

/// A fixed-size 20-byte content hash (SHA-1 width).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hash20(pub [u8; Hash20::RAW_SIZE]);

impl Hash20 {
    pub const RAW_SIZE: usize = 20;

    /// The all-zero hash, used as the revision hash of an empty proxy record.
    pub const ZERO: Hash20 = Hash20([0u8; Self::RAW_SIZE]);

    pub fn sha1(data: &[u8]) -> Hash20 {
        let mut hasher = Sha1::new();
        hasher.update(data);
        Hash20(hasher.finalize().into())
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Hash20> {
        let raw: [u8; Self::RAW_SIZE] = bytes.try_into().ok()?;
        Some(Hash20(raw))
    }

    pub fn from_hex(hex: &str) -> Option<Hash20> {
        if hex.len() != Self::RAW_SIZE * 2 {
            return None;
        }
        let mut raw = [0u8; Self::RAW_SIZE];
        for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
            let s = std::str::from_utf8(chunk).ok()?;
            raw[i] = u8::from_str_radix(s, 16).ok()?;
        }
        Some(Hash20(raw))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(Self::RAW_SIZE * 2);
        for byte in self.0 {
            s.push_str(&format!("{:02x}", byte));
        }
        s
    }
}

impl fmt::Display for Hash20 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Hash20 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash20({})", self.to_hex())
    }
}

/// Variable-length object identifier.
///
/// The common form is a bare 20-byte content hash. Longer forms carry a
/// type-tagged proxy record; the codec for those lives in `repofs-proto`.
/// This type treats the bytes as opaque.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(Bytes);

impl ObjectId {
    pub fn from_bytes(bytes: impl Into<Bytes>) -> ObjectId {
        ObjectId(bytes.into())
    }

    pub fn from_hash(hash: Hash20) -> ObjectId {
        ObjectId(Bytes::copy_from_slice(hash.as_bytes()))
    }

    /// SHA-1 of arbitrary content, wrapped as an identifier.
    pub fn sha1(data: &[u8]) -> ObjectId {
        ObjectId::from_hash(Hash20::sha1(data))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The bare-hash form, when this identifier is exactly one Hash20 wide.
    pub fn as_hash20(&self) -> Option<Hash20> {
        Hash20::from_bytes(&self.0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.iter() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self)
    }
}
