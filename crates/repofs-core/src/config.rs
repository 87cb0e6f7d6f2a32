// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Mount configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

/// Configuration for one projected mount.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MountConfig {
    /// Stable identifier the OS associates with the virtualization instance.
    pub mount_guid: [u8; 16],
    /// Per-request deadline; exceeding it fails the request with a
    /// timed-out error while the underlying load continues in the
    /// background.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Ask the OS to cache negative path lookups for this mount.
    #[serde(default = "default_true")]
    pub use_negative_path_caching: bool,
    /// Read-only mounts are not supported yet; must be false.
    #[serde(default)]
    pub read_only: bool,
}

impl MountConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for MountConfig {
    fn default() -> Self {
        MountConfig {
            mount_guid: [0u8; 16],
            timeout_ms: default_timeout_ms(),
            use_negative_path_caching: true,
            read_only: false,
        }
    }
}
