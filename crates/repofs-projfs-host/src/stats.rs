// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Per-channel callback counters

use std::sync::atomic::{AtomicU64, Ordering};

/// One counter per callback and notification kind, updated lock-free from
/// the OS worker threads.
#[derive(Default)]
pub struct ChannelStats {
    pub open_dir: AtomicU64,
    pub read_dir: AtomicU64,
    pub lookup: AtomicU64,
    pub access: AtomicU64,
    pub read: AtomicU64,
    pub new_file_created: AtomicU64,
    pub file_overwritten: AtomicU64,
    pub file_handle_closed_file_modified: AtomicU64,
    pub file_renamed: AtomicU64,
    pub pre_renamed: AtomicU64,
    pub file_handle_closed_file_deleted: AtomicU64,
    pub pre_set_hardlink: AtomicU64,
    /// Cumulative wall-clock microseconds spent completing requests.
    pub total_request_us: AtomicU64,
}

impl ChannelStats {
    pub fn record(stat: &AtomicU64) {
        stat.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ChannelStatsSnapshot {
        ChannelStatsSnapshot {
            open_dir: self.open_dir.load(Ordering::Relaxed),
            read_dir: self.read_dir.load(Ordering::Relaxed),
            lookup: self.lookup.load(Ordering::Relaxed),
            access: self.access.load(Ordering::Relaxed),
            read: self.read.load(Ordering::Relaxed),
            new_file_created: self.new_file_created.load(Ordering::Relaxed),
            file_overwritten: self.file_overwritten.load(Ordering::Relaxed),
            file_handle_closed_file_modified: self
                .file_handle_closed_file_modified
                .load(Ordering::Relaxed),
            file_renamed: self.file_renamed.load(Ordering::Relaxed),
            pre_renamed: self.pre_renamed.load(Ordering::Relaxed),
            file_handle_closed_file_deleted: self
                .file_handle_closed_file_deleted
                .load(Ordering::Relaxed),
            pre_set_hardlink: self.pre_set_hardlink.load(Ordering::Relaxed),
            total_request_us: self.total_request_us.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChannelStatsSnapshot {
    pub open_dir: u64,
    pub read_dir: u64,
    pub lookup: u64,
    pub access: u64,
    pub read: u64,
    pub new_file_created: u64,
    pub file_overwritten: u64,
    pub file_handle_closed_file_modified: u64,
    pub file_renamed: u64,
    pub pre_renamed: u64,
    pub file_handle_closed_file_deleted: u64,
    pub pre_set_hardlink: u64,
    pub total_request_us: u64,
}
