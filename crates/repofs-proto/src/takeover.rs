// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Takeover wire protocol
//!
//! When a repofs process hands its mounts to a successor, the open state
//! travels as a `TakeoverData` payload. Two serialization dialects coexist:
//! the original hand-rolled big-endian framing ("custom") and the
//! schema-based SSZ encoding. Which one is used is negotiated through a
//! capability bitset; a legacy integer protocol version is derived from the
//! bitset for wire compatibility with older peers.

use std::path::PathBuf;

use bytes::{BufMut, Bytes, BytesMut};
use ssz::{Decode, Encode};
use ssz_derive::{Decode, Encode};
use tracing::debug;

/// Width of the opaque connection-info blob. The bytes are copied verbatim;
/// a handoff never crosses machines, so endianness is the current host's.
pub const CONN_INFO_LEN: usize = 40;

/// Capability bits advertised during takeover negotiation.
pub struct TakeoverCapabilities;

impl TakeoverCapabilities {
    pub const CUSTOM_SERIALIZATION: u64 = 1 << 0;
    pub const PROJECTION: u64 = 1 << 1;
    pub const SCHEMA_SERIALIZATION: u64 = 1 << 2;
    pub const PING: u64 = 1 << 3;

    const SERIALIZATION_MASK: u64 = Self::CUSTOM_SERIALIZATION | Self::SCHEMA_SERIALIZATION;
}

/// Legacy protocol version numbers. There was never a version two: version
/// one used the word values 1 and 2 as message types.
pub const VERSION_NEVER_SUPPORTED: u32 = 0;
pub const VERSION_ONE: u32 = 1;
pub const VERSION_THREE: u32 = 3;
pub const VERSION_FOUR: u32 = 4;

pub const SUPPORTED_VERSIONS: [u32; 3] = [VERSION_ONE, VERSION_THREE, VERSION_FOUR];

mod message_type {
    pub const ERROR: u32 = 1;
    pub const MOUNTS: u32 = 2;
    pub const PING: u32 = 3;
}

#[derive(thiserror::Error, Debug)]
pub enum TakeoverError {
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u32),
    #[error("unsupported combination of capabilities: {0:#x}")]
    UnsupportedCapabilities(u64),
    #[error("unrecognized takeover payload starting with {0:#x}")]
    UnrecognizedPayload(u32),
    #[error("truncated takeover payload")]
    Truncated,
    #[error("takeover payload is malformed: {0}")]
    Decode(String),
    #[error("takeover failed on the remote side: {0}")]
    Remote(String),
}

/// Map a legacy version number to the capabilities it implies.
pub fn version_to_capabilities(version: u32) -> Result<u64, TakeoverError> {
    match version {
        VERSION_NEVER_SUPPORTED => Ok(0),
        VERSION_ONE => {
            Ok(TakeoverCapabilities::CUSTOM_SERIALIZATION | TakeoverCapabilities::PROJECTION)
        }
        VERSION_THREE => {
            Ok(TakeoverCapabilities::PROJECTION | TakeoverCapabilities::SCHEMA_SERIALIZATION)
        }
        VERSION_FOUR => Ok(TakeoverCapabilities::PROJECTION
            | TakeoverCapabilities::SCHEMA_SERIALIZATION
            | TakeoverCapabilities::PING),
        other => Err(TakeoverError::UnsupportedVersion(other)),
    }
}

/// Map a capability set back to the legacy version number advertised on the
/// wire. Exact inverse of [`version_to_capabilities`] on supported versions.
pub fn capabilities_to_version(capabilities: u64) -> Result<u32, TakeoverError> {
    if capabilities == 0 {
        return Ok(VERSION_NEVER_SUPPORTED);
    }
    if capabilities
        == TakeoverCapabilities::CUSTOM_SERIALIZATION | TakeoverCapabilities::PROJECTION
    {
        return Ok(VERSION_ONE);
    }
    if capabilities
        == TakeoverCapabilities::PROJECTION | TakeoverCapabilities::SCHEMA_SERIALIZATION
    {
        return Ok(VERSION_THREE);
    }
    if capabilities
        == TakeoverCapabilities::PROJECTION
            | TakeoverCapabilities::SCHEMA_SERIALIZATION
            | TakeoverCapabilities::PING
    {
        return Ok(VERSION_FOUR);
    }
    Err(TakeoverError::UnsupportedCapabilities(capabilities))
}

/// Pick the best version both sides support.
pub fn compute_compatible_version(offered: &[u32], supported: &[u32]) -> Option<u32> {
    let mut best = None;
    for &version in offered {
        if let Some(current) = best {
            if current > version {
                continue;
            }
        }
        if !supported.contains(&version) {
            continue;
        }
        best = Some(version);
    }
    best
}

/// Opaque kernel connection descriptor for one mount.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnInfo(pub [u8; CONN_INFO_LEN]);

impl ConnInfo {
    pub fn zeroed() -> ConnInfo {
        ConnInfo([0u8; CONN_INFO_LEN])
    }
}

impl Default for ConnInfo {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl std::fmt::Debug for ConnInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ConnInfo({} bytes)", CONN_INFO_LEN)
    }
}

/// Everything a successor process needs to adopt one mount.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountHandoff {
    pub mount_path: PathBuf,
    pub state_directory: PathBuf,
    pub bind_mounts: Vec<PathBuf>,
    pub conn_info: ConnInfo,
    /// Serialized inode map; see [`crate::inode_map::SerializedInodeMap`].
    pub inode_map: Bytes,
}

/// The full takeover payload: one record per mount.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TakeoverData {
    pub mounts: Vec<MountHandoff>,
}

// Schema-dialect records.
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
#[ssz(enum_behaviour = "union")]
enum SerializedTakeover {
    Mounts(Vec<SerializedMountRecord>),
    ErrorReason(Vec<u8>),
}

#[derive(Clone, Debug, PartialEq, Encode, Decode)]
struct SerializedMountRecord {
    mount_path: Vec<u8>,
    state_directory: Vec<u8>,
    bind_mount_paths: Vec<Vec<u8>>,
    conn_info: Vec<u8>,
    inode_map: Vec<u8>,
}

impl TakeoverData {
    /// Serialize in whichever dialect the negotiated capabilities call for.
    pub fn serialize(&self, capabilities: u64) -> Result<Bytes, TakeoverError> {
        match capabilities & TakeoverCapabilities::SERIALIZATION_MASK {
            TakeoverCapabilities::CUSTOM_SERIALIZATION => self.serialize_custom(),
            TakeoverCapabilities::SCHEMA_SERIALIZATION => self.serialize_schema(capabilities),
            _ => Err(TakeoverError::UnsupportedCapabilities(capabilities)),
        }
    }

    /// Serialize an error reply. Capabilities of zero are allowed so a
    /// version-mismatch failure can still be reported.
    pub fn serialize_error(capabilities: u64, reason: &str) -> Result<Bytes, TakeoverError> {
        let method = capabilities & TakeoverCapabilities::SERIALIZATION_MASK;
        if method == TakeoverCapabilities::CUSTOM_SERIALIZATION || capabilities == 0 {
            let mut buf = BytesMut::new();
            buf.put_u32(message_type::ERROR);
            put_str(&mut buf, reason);
            Ok(buf.freeze())
        } else if method == TakeoverCapabilities::SCHEMA_SERIALIZATION {
            let mut buf = BytesMut::new();
            buf.put_u32(VERSION_THREE);
            let record = SerializedTakeover::ErrorReason(reason.as_bytes().to_vec());
            buf.put_slice(&record.as_ssz_bytes());
            Ok(buf.freeze())
        } else {
            Err(TakeoverError::UnsupportedCapabilities(capabilities))
        }
    }

    /// Probe the payload and decode with the matching dialect.
    pub fn deserialize(buf: &[u8]) -> Result<TakeoverData, TakeoverError> {
        let (version, rest) = Self::read_protocol_version(buf)?;
        let capabilities = version_to_capabilities(version)?;
        match capabilities & TakeoverCapabilities::SERIALIZATION_MASK {
            TakeoverCapabilities::CUSTOM_SERIALIZATION => Self::deserialize_custom(rest),
            TakeoverCapabilities::SCHEMA_SERIALIZATION => Self::deserialize_schema(rest),
            _ => Err(TakeoverError::UnsupportedCapabilities(capabilities)),
        }
    }

    /// Read the leading protocol-version word.
    ///
    /// The custom-dialect message types double as version-one markers and are
    /// preserved for the dialect decoder; a bare numeric version is consumed.
    pub fn read_protocol_version(buf: &[u8]) -> Result<(u32, &[u8]), TakeoverError> {
        let word = peek_u32(buf)?;
        match word {
            message_type::ERROR | message_type::MOUNTS => Ok((VERSION_ONE, buf)),
            VERSION_THREE | VERSION_FOUR => Ok((word, &buf[4..])),
            other => Err(TakeoverError::UnrecognizedPayload(other)),
        }
    }

    /// A ping is a four-byte body equal to the ping tag.
    pub fn serialize_ping() -> Bytes {
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u32(message_type::PING);
        buf.freeze()
    }

    pub fn is_ping(buf: &[u8]) -> bool {
        buf.len() == 4 && matches!(peek_u32(buf), Ok(word) if word == message_type::PING)
    }

    fn serialize_custom(&self) -> Result<Bytes, TakeoverError> {
        let mut buf = BytesMut::new();
        buf.put_u32(message_type::MOUNTS);
        buf.put_u32(self.mounts.len() as u32);
        for mount in &self.mounts {
            put_path(&mut buf, &mount.mount_path)?;
            put_path(&mut buf, &mount.state_directory)?;
            buf.put_u32(mount.bind_mounts.len() as u32);
            for bind in &mount.bind_mounts {
                put_path(&mut buf, bind)?;
            }
            buf.put_slice(&mount.conn_info.0);
            // The file-handle map was retired; its length is always zero.
            buf.put_u32(0);
            buf.put_u32(mount.inode_map.len() as u32);
            buf.put_slice(&mount.inode_map);
        }
        Ok(buf.freeze())
    }

    fn deserialize_custom(mut buf: &[u8]) -> Result<TakeoverData, TakeoverError> {
        let word = read_u32(&mut buf)?;
        if word == message_type::ERROR {
            let reason = read_prefixed(&mut buf)?;
            return Err(TakeoverError::Remote(
                String::from_utf8_lossy(reason).into_owned(),
            ));
        }
        if word != message_type::MOUNTS {
            return Err(TakeoverError::UnrecognizedPayload(word));
        }

        let mount_count = read_u32(&mut buf)?;
        let mut mounts = Vec::with_capacity(mount_count as usize);
        for _ in 0..mount_count {
            let mount_path = read_path(&mut buf)?;
            let state_directory = read_path(&mut buf)?;
            let bind_count = read_u32(&mut buf)?;
            let mut bind_mounts = Vec::with_capacity(bind_count as usize);
            for _ in 0..bind_count {
                bind_mounts.push(read_path(&mut buf)?);
            }
            let conn_bytes = read_bytes(&mut buf, CONN_INFO_LEN)?;
            let mut conn_info = ConnInfo::zeroed();
            conn_info.0.copy_from_slice(conn_bytes);
            let legacy_len = read_u32(&mut buf)? as usize;
            read_bytes(&mut buf, legacy_len)?;
            let inode_map = read_prefixed(&mut buf)?;
            mounts.push(MountHandoff {
                mount_path,
                state_directory,
                bind_mounts,
                conn_info,
                inode_map: Bytes::copy_from_slice(inode_map),
            });
        }
        debug!(target: "repofs::takeover", mounts = mounts.len(), "decoded custom payload");
        Ok(TakeoverData { mounts })
    }

    fn serialize_schema(&self, capabilities: u64) -> Result<Bytes, TakeoverError> {
        let mut version = capabilities_to_version(capabilities)?;
        // Predecessors assume protocol four uses protocol-three
        // serialization, so a version-four record must advertise itself as
        // version three for rollback safety. The ping capability is
        // negotiated out-of-band.
        if version == VERSION_FOUR {
            version = VERSION_THREE;
        }

        let records: Vec<SerializedMountRecord> = self
            .mounts
            .iter()
            .map(|mount| {
                Ok(SerializedMountRecord {
                    mount_path: path_bytes(&mount.mount_path)?.to_vec(),
                    state_directory: path_bytes(&mount.state_directory)?.to_vec(),
                    bind_mount_paths: mount
                        .bind_mounts
                        .iter()
                        .map(|p| Ok(path_bytes(p)?.to_vec()))
                        .collect::<Result<_, TakeoverError>>()?,
                    conn_info: mount.conn_info.0.to_vec(),
                    inode_map: mount.inode_map.to_vec(),
                })
            })
            .collect::<Result<_, TakeoverError>>()?;

        let mut buf = BytesMut::new();
        buf.put_u32(version);
        buf.put_slice(&SerializedTakeover::Mounts(records).as_ssz_bytes());
        Ok(buf.freeze())
    }

    fn deserialize_schema(buf: &[u8]) -> Result<TakeoverData, TakeoverError> {
        let record = SerializedTakeover::from_ssz_bytes(buf)
            .map_err(|err| TakeoverError::Decode(format!("{err:?}")))?;
        match record {
            SerializedTakeover::ErrorReason(reason) => Err(TakeoverError::Remote(
                String::from_utf8_lossy(&reason).into_owned(),
            )),
            SerializedTakeover::Mounts(records) => {
                let mut mounts = Vec::with_capacity(records.len());
                for record in records {
                    let conn_info: [u8; CONN_INFO_LEN] =
                        record.conn_info.as_slice().try_into().map_err(|_| {
                            TakeoverError::Decode(format!(
                                "conn info must be {CONN_INFO_LEN} bytes, got {}",
                                record.conn_info.len()
                            ))
                        })?;
                    mounts.push(MountHandoff {
                        mount_path: bytes_to_path(record.mount_path)?,
                        state_directory: bytes_to_path(record.state_directory)?,
                        bind_mounts: record
                            .bind_mount_paths
                            .into_iter()
                            .map(bytes_to_path)
                            .collect::<Result<_, _>>()?,
                        conn_info: ConnInfo(conn_info),
                        inode_map: Bytes::from(record.inode_map),
                    });
                }
                debug!(target: "repofs::takeover", mounts = mounts.len(), "decoded schema payload");
                Ok(TakeoverData { mounts })
            }
        }
    }
}

fn path_bytes(path: &std::path::Path) -> Result<&[u8], TakeoverError> {
    path.to_str()
        .map(str::as_bytes)
        .ok_or_else(|| TakeoverError::Decode(format!("path {} is not UTF-8", path.display())))
}

fn bytes_to_path(bytes: Vec<u8>) -> Result<PathBuf, TakeoverError> {
    String::from_utf8(bytes)
        .map(PathBuf::from)
        .map_err(|_| TakeoverError::Decode("path is not UTF-8".to_string()))
}

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn put_path(buf: &mut BytesMut, path: &std::path::Path) -> Result<(), TakeoverError> {
    let bytes = path_bytes(path)?;
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(bytes);
    Ok(())
}

fn peek_u32(buf: &[u8]) -> Result<u32, TakeoverError> {
    let word: [u8; 4] = buf.get(..4).and_then(|b| b.try_into().ok()).ok_or(TakeoverError::Truncated)?;
    Ok(u32::from_be_bytes(word))
}

fn read_u32(buf: &mut &[u8]) -> Result<u32, TakeoverError> {
    let value = peek_u32(buf)?;
    *buf = &buf[4..];
    Ok(value)
}

fn read_bytes<'a>(buf: &mut &'a [u8], len: usize) -> Result<&'a [u8], TakeoverError> {
    if buf.len() < len {
        return Err(TakeoverError::Truncated);
    }
    let (head, tail) = buf.split_at(len);
    *buf = tail;
    Ok(head)
}

fn read_prefixed<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8], TakeoverError> {
    let len = read_u32(buf)? as usize;
    read_bytes(buf, len)
}

fn read_path(buf: &mut &[u8]) -> Result<PathBuf, TakeoverError> {
    let bytes = read_prefixed(buf)?;
    bytes_to_path(bytes.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inode_map::SerializedInodeMap;

    fn caps(version: u32) -> u64 {
        version_to_capabilities(version).unwrap()
    }

    fn sample_mount() -> MountHandoff {
        MountHandoff {
            mount_path: PathBuf::from("/m"),
            state_directory: PathBuf::from("/s"),
            bind_mounts: vec![],
            conn_info: ConnInfo::zeroed(),
            inode_map: Bytes::from_static(b"X"),
        }
    }

    #[test]
    fn version_capability_mapping_is_inverse() {
        for version in [VERSION_NEVER_SUPPORTED, VERSION_ONE, VERSION_THREE, VERSION_FOUR] {
            let capabilities = version_to_capabilities(version).unwrap();
            assert_eq!(capabilities_to_version(capabilities).unwrap(), version);
        }
        assert!(version_to_capabilities(2).is_err());
        assert!(capabilities_to_version(TakeoverCapabilities::PING).is_err());
    }

    #[test]
    fn compatible_version_picks_best_supported() {
        assert_eq!(
            compute_compatible_version(&[VERSION_ONE, VERSION_THREE], &SUPPORTED_VERSIONS),
            Some(VERSION_THREE)
        );
        assert_eq!(
            compute_compatible_version(&[VERSION_ONE, 7], &SUPPORTED_VERSIONS),
            Some(VERSION_ONE)
        );
        assert_eq!(compute_compatible_version(&[], &SUPPORTED_VERSIONS), None);
        assert_eq!(compute_compatible_version(&[9], &SUPPORTED_VERSIONS), None);
    }

    #[test]
    fn custom_roundtrip_single_mount() {
        let data = TakeoverData {
            mounts: vec![sample_mount()],
        };
        let wire = data.serialize(caps(VERSION_ONE)).unwrap();
        let decoded = TakeoverData::deserialize(&wire).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn custom_roundtrip_rich_mount_list() {
        let mut conn_info = ConnInfo::zeroed();
        conn_info.0[0] = 0xAB;
        conn_info.0[CONN_INFO_LEN - 1] = 0xCD;
        let data = TakeoverData {
            mounts: vec![
                MountHandoff {
                    mount_path: PathBuf::from("/work/repo"),
                    state_directory: PathBuf::from("/var/repofs/repo"),
                    bind_mounts: vec![PathBuf::from("/work/repo/buck-out")],
                    conn_info,
                    inode_map: Bytes::from(SerializedInodeMap::default().encode()),
                },
                sample_mount(),
            ],
        };
        let wire = data.serialize(caps(VERSION_ONE)).unwrap();
        assert_eq!(TakeoverData::deserialize(&wire).unwrap(), data);
    }

    #[test]
    fn custom_roundtrip_empty_mount_list() {
        let data = TakeoverData::default();
        let wire = data.serialize(caps(VERSION_ONE)).unwrap();
        assert_eq!(TakeoverData::deserialize(&wire).unwrap(), data);
    }

    #[test]
    fn schema_roundtrip() {
        let data = TakeoverData {
            mounts: vec![sample_mount()],
        };
        let wire = data.serialize(caps(VERSION_THREE)).unwrap();
        assert_eq!(TakeoverData::deserialize(&wire).unwrap(), data);

        let empty = TakeoverData::default();
        let wire = empty.serialize(caps(VERSION_THREE)).unwrap();
        assert_eq!(TakeoverData::deserialize(&wire).unwrap(), empty);
    }

    #[test]
    fn version_four_advertises_version_three() {
        let data = TakeoverData {
            mounts: vec![sample_mount()],
        };
        let wire = data.serialize(caps(VERSION_FOUR)).unwrap();
        assert_eq!(peek_u32(&wire).unwrap(), VERSION_THREE);
        assert_eq!(TakeoverData::deserialize(&wire).unwrap(), data);
    }

    #[test]
    fn error_roundtrip_both_dialects() {
        for capabilities in [caps(VERSION_ONE), caps(VERSION_THREE), 0] {
            let wire = TakeoverData::serialize_error(capabilities, "mount busy").unwrap();
            match TakeoverData::deserialize(&wire) {
                Err(TakeoverError::Remote(reason)) => assert_eq!(reason, "mount busy"),
                other => panic!("expected remote error, got {other:?}"),
            }
        }
    }

    #[test]
    fn ping_roundtrip() {
        let ping = TakeoverData::serialize_ping();
        assert_eq!(ping.len(), 4);
        assert!(TakeoverData::is_ping(&ping));
        assert!(!TakeoverData::is_ping(b"ping"));
        assert!(!TakeoverData::is_ping(
            &TakeoverData::default().serialize(caps(VERSION_ONE)).unwrap()
        ));
    }

    #[test]
    fn protocol_version_detection() {
        let custom = TakeoverData::default().serialize(caps(VERSION_ONE)).unwrap();
        let (version, rest) = TakeoverData::read_protocol_version(&custom).unwrap();
        assert_eq!(version, VERSION_ONE);
        // The word doubles as the custom message type, so it is preserved.
        assert_eq!(rest.len(), custom.len());

        let schema = TakeoverData::default().serialize(caps(VERSION_THREE)).unwrap();
        let (version, rest) = TakeoverData::read_protocol_version(&schema).unwrap();
        assert_eq!(version, VERSION_THREE);
        assert_eq!(rest.len(), schema.len() - 4);

        assert!(matches!(
            TakeoverData::read_protocol_version(&[0xFF, 0, 0, 0]),
            Err(TakeoverError::UnrecognizedPayload(_))
        ));
        assert!(matches!(
            TakeoverData::read_protocol_version(&[0, 0]),
            Err(TakeoverError::Truncated)
        ));
    }

    #[test]
    fn truncated_custom_payload_fails() {
        let data = TakeoverData {
            mounts: vec![sample_mount()],
        };
        let wire = data.serialize(caps(VERSION_ONE)).unwrap();
        assert!(matches!(
            TakeoverData::deserialize(&wire[..wire.len() - 3]),
            Err(TakeoverError::Truncated)
        ));
    }

    #[test]
    fn inode_map_blob_nests_in_takeover() {
        use repofs_core::{EntryType, InodeNumber, InodeSnapshot, RepoPathBuf, SnapshotState};

        let map = SerializedInodeMap::from_snapshots(vec![InodeSnapshot {
            ino: InodeNumber(42),
            path: RepoPathBuf::parse("nested.txt").unwrap(),
            entry_type: EntryType::Regular,
            state: SnapshotState::Materialized,
        }]);
        let mut mount = sample_mount();
        mount.inode_map = Bytes::from(map.encode());
        let data = TakeoverData { mounts: vec![mount] };

        let wire = data.serialize(caps(VERSION_THREE)).unwrap();
        let decoded = TakeoverData::deserialize(&wire).unwrap();
        let decoded_map = SerializedInodeMap::decode(&decoded.mounts[0].inode_map).unwrap();
        assert_eq!(decoded_map, map);
    }
}
