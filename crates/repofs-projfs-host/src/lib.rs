// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Projection channel for repofs
//!
//! The channel sits between the OS projection service and the dispatcher: it
//! owns the virtualization registration, translates OS callbacks into
//! dispatcher calls, delivers file data back with aligned chunked writes,
//! and routes post-mutation notifications into the mount. Callbacks return a
//! pending sentinel to the OS and complete asynchronously through a request
//! context.

pub mod channel;
pub mod context;
pub mod dispatcher;
pub mod enumeration;
pub mod notifications;
pub mod os;
pub mod stats;
pub mod testing;
pub mod writer;

pub use channel::{CallbackData, ProjfsChannel, StopData};
pub use context::RequestContext;
pub use dispatcher::{Dispatcher, EnumEntry, LookupResult, MountStats};
pub use enumeration::{EnumerationRegistry, Enumerator};
pub use notifications::NotificationKind;
pub use os::{
    AlignedBuffer, CompletionExtra, DirEntryBuffer, DirEntryBufferHandle, ErrorCode,
    FileBasicInfo, Guid, InstanceInfo, OsResult, PlaceholderInfo, ProjectionOs,
    VirtualizationOptions,
};
pub use stats::{ChannelStats, ChannelStatsSnapshot};
pub use writer::{block_align_truncate, write_file_chunks, MAX_CHUNK, MIN_CHUNK};
