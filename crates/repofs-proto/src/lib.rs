// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! repofs wire formats
//!
//! Two families of serialized data live here: the proxy-hash codec used to
//! address source-control objects by (path, revision hash), and the takeover
//! protocol that hands open mounts from one repofs process to its successor.

pub mod inode_map;
pub mod proxy_hash;
pub mod takeover;

pub use inode_map::{SerializedInode, SerializedInodeMap};
pub use proxy_hash::{ProxyHash, ProxyHashError, ProxyHashStore, TYPE_REV_HASH_NO_PATH};
pub use takeover::{
    ConnInfo, MountHandoff, TakeoverCapabilities, TakeoverData, TakeoverError,
};
