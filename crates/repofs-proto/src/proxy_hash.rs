// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Proxy-hash codec
//!
//! A proxy hash names a source-control object by the `(path, revision hash)`
//! pair the backing repository actually understands. Two encodings coexist:
//!
//! - *Embedded*: a one-byte type marker followed by the bare 20-byte revision
//!   hash, used when no path is associated. The whole record travels inside
//!   the object identifier itself.
//! - *Legacy*: `hash(20) || path_len(u32 BE) || path`, stored in a key-value
//!   store under [`ProxyHash::COLUMN_FAMILY`] and keyed by the SHA-1 of the
//!   record.

use async_trait::async_trait;
use bytes::Bytes;
use tracing::error;

use repofs_core::path::PathError;
use repofs_core::{Hash20, ObjectId, RepoPath, RepoPathBuf, StoreError};

/// Type marker for an embedded revision hash with no associated path.
pub const TYPE_REV_HASH_NO_PATH: u8 = 0x01;

const HEADER_LEN: usize = Hash20::RAW_SIZE + 4;

#[derive(thiserror::Error, Debug)]
pub enum ProxyHashError {
    #[error("unknown proxy hash type: size {size}, type {type_byte}")]
    UnknownType { size: usize, type_byte: u8 },
    #[error("proxy hash record for {id} is too short ({len} bytes)")]
    TooShort { id: ObjectId, len: usize },
    #[error("proxy hash record for {id} has inconsistent path length")]
    LengthMismatch { id: ObjectId },
    #[error("proxy hash record for {id} carries an invalid path: {source}")]
    InvalidPath {
        id: ObjectId,
        #[source]
        source: PathError,
    },
    #[error("received unknown proxy hash {0}")]
    Missing(ObjectId),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Key-value storage for legacy proxy-hash records.
#[async_trait]
pub trait ProxyHashStore: Send + Sync {
    async fn get(&self, id: &ObjectId) -> Result<Option<Bytes>, StoreError>;
    async fn get_batch(&self, ids: &[ObjectId]) -> Result<Vec<Option<Bytes>>, StoreError>;
    async fn put(&self, id: &ObjectId, record: Bytes) -> Result<(), StoreError>;
}

/// A decoded `(path, revision hash)` record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProxyHash {
    path: RepoPathBuf,
    rev_hash: Hash20,
}

impl ProxyHash {
    /// Column family holding legacy records in the local key-value store.
    pub const COLUMN_FAMILY: &'static str = "proxyhash";

    pub fn new(path: RepoPathBuf, rev_hash: Hash20) -> ProxyHash {
        ProxyHash { path, rev_hash }
    }

    pub fn path(&self) -> &RepoPath {
        &self.path
    }

    pub fn rev_hash(&self) -> Hash20 {
        self.rev_hash
    }

    /// The legacy on-disk record: `hash_bytes || path_len (u32 BE) || path`.
    pub fn serialize(path: &RepoPath, rev_hash: &Hash20) -> Vec<u8> {
        let path_bytes = path.as_str().as_bytes();
        let mut buf = Vec::with_capacity(HEADER_LEN + path_bytes.len());
        buf.extend_from_slice(rev_hash.as_bytes());
        buf.extend_from_slice(&(path_bytes.len() as u32).to_be_bytes());
        buf.extend_from_slice(path_bytes);
        buf
    }

    /// The embedded form: a type byte followed by the bare hash. Used when no
    /// path is associated with the object.
    pub fn embed(rev_hash: Hash20) -> ObjectId {
        let mut buf = Vec::with_capacity(Hash20::RAW_SIZE + 1);
        buf.push(TYPE_REV_HASH_NO_PATH);
        buf.extend_from_slice(rev_hash.as_bytes());
        ObjectId::from_bytes(buf)
    }

    /// Recognize an embedded proxy hash inside an object identifier.
    ///
    /// Identifiers no longer than a bare hash are legacy keys and yield
    /// `None`; longer identifiers must carry a known type marker.
    pub fn try_parse_embedded(id: &ObjectId) -> Result<Option<ProxyHash>, ProxyHashError> {
        let bytes = id.as_bytes();
        if bytes.len() <= Hash20::RAW_SIZE {
            return Ok(None);
        }
        let type_byte = bytes[0];
        if bytes.len() == Hash20::RAW_SIZE + 1 && type_byte == TYPE_REV_HASH_NO_PATH {
            let rev_hash = Hash20::from_bytes(&bytes[1..])
                .unwrap_or_else(|| unreachable!("length checked above"));
            Ok(Some(ProxyHash::new(RepoPathBuf::root(), rev_hash)))
        } else {
            Err(ProxyHashError::UnknownType {
                size: bytes.len(),
                type_byte,
            })
        }
    }

    /// Decode and validate a legacy record fetched from the store.
    ///
    /// Any mismatch between the declared and actual path length is a hard
    /// validation failure.
    pub fn from_record(id: &ObjectId, record: &[u8]) -> Result<ProxyHash, ProxyHashError> {
        if record.len() < HEADER_LEN {
            let err = ProxyHashError::TooShort {
                id: id.clone(),
                len: record.len(),
            };
            error!(target: "repofs::proxyhash", "{err}");
            return Err(err);
        }
        let rev_hash = Hash20::from_bytes(&record[..Hash20::RAW_SIZE])
            .unwrap_or_else(|| unreachable!("length checked above"));
        let declared =
            u32::from_be_bytes(record[Hash20::RAW_SIZE..HEADER_LEN].try_into().unwrap()) as usize;
        let path_bytes = &record[HEADER_LEN..];
        if path_bytes.len() != declared {
            let err = ProxyHashError::LengthMismatch { id: id.clone() };
            error!(target: "repofs::proxyhash", "{err}");
            return Err(err);
        }
        let path = std::str::from_utf8(path_bytes)
            .map_err(|_| ProxyHashError::InvalidPath {
                id: id.clone(),
                source: PathError::NotUtf8,
            })
            .and_then(|s| {
                RepoPathBuf::parse(s).map_err(|source| ProxyHashError::InvalidPath {
                    id: id.clone(),
                    source,
                })
            })?;
        Ok(ProxyHash { path, rev_hash })
    }

    /// SHA-1 of the serialized record; this is the identifier legacy records
    /// are stored under.
    pub fn sha1(&self) -> Hash20 {
        Hash20::sha1(&Self::serialize(&self.path, &self.rev_hash))
    }

    /// Store a record, returning the identifier to address it by. Without a
    /// write batch the embedded form is used and nothing is persisted.
    pub async fn store(
        path: &RepoPath,
        rev_hash: Hash20,
        store: Option<&dyn ProxyHashStore>,
    ) -> Result<ObjectId, ProxyHashError> {
        let Some(store) = store else {
            return Ok(Self::embed(rev_hash));
        };
        let record = Self::serialize(path, &rev_hash);
        let id = ObjectId::sha1(&record);
        store.put(&id, Bytes::from(record)).await?;
        Ok(id)
    }

    /// Load a single proxy hash, resolving the embedded form locally.
    pub async fn load(
        store: &dyn ProxyHashStore,
        id: &ObjectId,
    ) -> Result<ProxyHash, ProxyHashError> {
        if let Some(embedded) = Self::try_parse_embedded(id)? {
            return Ok(embedded);
        }
        match store.get(id).await? {
            Some(record) => Self::from_record(id, &record),
            None => {
                error!(target: "repofs::proxyhash", id = %id, "record missing from store");
                Err(ProxyHashError::Missing(id.clone()))
            }
        }
    }

    /// Batch lookup. Embedded identifiers are resolved locally; the rest are
    /// fetched from the store in one round trip. Results come back in input
    /// order.
    pub async fn get_batch(
        store: &dyn ProxyHashStore,
        ids: &[ObjectId],
    ) -> Result<Vec<ProxyHash>, ProxyHashError> {
        let mut slots: Vec<Option<ProxyHash>> = Vec::with_capacity(ids.len());
        let mut legacy_ids = Vec::new();
        let mut legacy_slots = Vec::new();
        for (index, id) in ids.iter().enumerate() {
            match Self::try_parse_embedded(id)? {
                Some(embedded) => slots.push(Some(embedded)),
                None => {
                    slots.push(None);
                    legacy_ids.push(id.clone());
                    legacy_slots.push(index);
                }
            }
        }

        if !legacy_ids.is_empty() {
            let records = store.get_batch(&legacy_ids).await?;
            for ((slot, id), record) in legacy_slots.iter().zip(&legacy_ids).zip(records) {
                let record = record.ok_or_else(|| ProxyHashError::Missing(id.clone()))?;
                slots[*slot] = Some(Self::from_record(id, &record)?);
            }
        }

        Ok(slots
            .into_iter()
            .map(|slot| slot.unwrap_or_else(|| unreachable!("every slot is filled above")))
            .collect())
    }
}

impl Default for ProxyHash {
    /// The empty record: zero hash, no path.
    fn default() -> Self {
        ProxyHash {
            path: RepoPathBuf::root(),
            rev_hash: Hash20::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryStore {
        records: Mutex<HashMap<ObjectId, Bytes>>,
    }

    #[async_trait]
    impl ProxyHashStore for MemoryStore {
        async fn get(&self, id: &ObjectId) -> Result<Option<Bytes>, StoreError> {
            Ok(self.records.lock().unwrap().get(id).cloned())
        }

        async fn get_batch(&self, ids: &[ObjectId]) -> Result<Vec<Option<Bytes>>, StoreError> {
            let records = self.records.lock().unwrap();
            Ok(ids.iter().map(|id| records.get(id).cloned()).collect())
        }

        async fn put(&self, id: &ObjectId, record: Bytes) -> Result<(), StoreError> {
            self.records.lock().unwrap().insert(id.clone(), record);
            Ok(())
        }
    }

    fn rev(data: &[u8]) -> Hash20 {
        Hash20::sha1(data)
    }

    #[test]
    fn serialize_parse_roundtrip() {
        let path = RepoPathBuf::parse("dir/file.txt").unwrap();
        let hash = rev(b"revision one");
        let record = ProxyHash::serialize(&path, &hash);
        let id = ObjectId::sha1(&record);

        let parsed = ProxyHash::from_record(&id, &record).unwrap();
        assert_eq!(parsed.path(), path.as_repo_path());
        assert_eq!(parsed.rev_hash(), hash);
        assert_eq!(parsed.sha1().as_bytes(), id.as_bytes());
    }

    #[test]
    fn declared_length_must_match() {
        let path = RepoPathBuf::parse("a/b").unwrap();
        let hash = rev(b"rev");
        let mut record = ProxyHash::serialize(&path, &hash);
        record.push(b'x');
        let id = ObjectId::sha1(&record);
        assert!(matches!(
            ProxyHash::from_record(&id, &record),
            Err(ProxyHashError::LengthMismatch { .. })
        ));

        let record = ProxyHash::serialize(&path, &hash);
        let id = ObjectId::sha1(&record);
        assert!(matches!(
            ProxyHash::from_record(&id, &record[..record.len() - 1]),
            Err(ProxyHashError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn short_records_are_rejected() {
        let id = ObjectId::sha1(b"whatever");
        assert!(matches!(
            ProxyHash::from_record(&id, &[0u8; 10]),
            Err(ProxyHashError::TooShort { .. })
        ));
    }

    #[test]
    fn embedded_roundtrip() {
        let hash = rev(b"no path");
        let id = ProxyHash::embed(hash);
        assert_eq!(id.len(), Hash20::RAW_SIZE + 1);

        let parsed = ProxyHash::try_parse_embedded(&id).unwrap().unwrap();
        assert!(parsed.path().is_root());
        assert_eq!(parsed.rev_hash(), hash);

        // Bare-hash identifiers are legacy keys, not embedded records.
        let bare = ObjectId::from_hash(hash);
        assert!(ProxyHash::try_parse_embedded(&bare).unwrap().is_none());

        // Longer identifiers with an unknown marker are rejected.
        let bogus = ObjectId::from_bytes(vec![0x7f; 21]);
        assert!(matches!(
            ProxyHash::try_parse_embedded(&bogus),
            Err(ProxyHashError::UnknownType { .. })
        ));
    }

    #[test]
    fn empty_proxy_hash_sha1_literal() {
        assert_eq!(
            ProxyHash::default().sha1(),
            Hash20::from_hex("d3399b7262fb56cb9ed053d68db9291c410839c4").unwrap()
        );
    }

    #[tokio::test]
    async fn batch_preserves_input_order() {
        let store = MemoryStore::default();

        let legacy_a = ProxyHash::store(
            RepoPathBuf::parse("a.txt").unwrap().as_repo_path(),
            rev(b"a"),
            Some(&store),
        )
        .await
        .unwrap();
        let embedded = ProxyHash::embed(rev(b"embedded"));
        let legacy_b = ProxyHash::store(
            RepoPathBuf::parse("b.txt").unwrap().as_repo_path(),
            rev(b"b"),
            Some(&store),
        )
        .await
        .unwrap();

        let ids = vec![legacy_a, embedded, legacy_b];
        let results = ProxyHash::get_batch(&store, &ids).await.unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].path().as_str(), "a.txt");
        assert!(results[1].path().is_root());
        assert_eq!(results[1].rev_hash(), rev(b"embedded"));
        assert_eq!(results[2].path().as_str(), "b.txt");
    }

    #[tokio::test]
    async fn store_without_batch_embeds() {
        let id = ProxyHash::store(
            RepoPathBuf::parse("ignored").unwrap().as_repo_path(),
            rev(b"r"),
            None,
        )
        .await
        .unwrap();
        assert!(ProxyHash::try_parse_embedded(&id).unwrap().is_some());
    }

    #[tokio::test]
    async fn missing_record_is_an_error() {
        let store = MemoryStore::default();
        let id = ObjectId::sha1(b"nowhere");
        assert!(matches!(
            ProxyHash::load(&store, &id).await,
            Err(ProxyHashError::Missing(_))
        ));
    }
}
