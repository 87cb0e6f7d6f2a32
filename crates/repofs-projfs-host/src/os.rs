// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! OS projection-service seam
//!
//! Everything the channel asks of the operating system goes through
//! [`ProjectionOs`]. Production builds bind this to the platform
//! virtualization API; tests use the fake in [`crate::testing`].

use std::fmt;
use std::sync::{Arc, Mutex};

use repofs_core::{FsError, RepoPath, RepoPathBuf, StoreError};

/// 128-bit identifier used for mounts, enumeration sessions and data
/// streams. Values are supplied by the OS and treated as opaque.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Guid(pub [u8; 16]);

impl Guid {
    pub fn from_u128(value: u128) -> Guid {
        Guid(value.to_be_bytes())
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Guid({})", self)
    }
}

/// Result code crossing the OS boundary. Values follow the Win32 error
/// space the projection service speaks natively.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode(pub i32);

impl ErrorCode {
    pub const SUCCESS: ErrorCode = ErrorCode(0);
    pub const NOT_FOUND: ErrorCode = ErrorCode(2);
    pub const PATH_NOT_FOUND: ErrorCode = ErrorCode(3);
    pub const ACCESS_DENIED: ErrorCode = ErrorCode(5);
    pub const OUT_OF_MEMORY: ErrorCode = ErrorCode(14);
    pub const INVALID_PARAMETER: ErrorCode = ErrorCode(87);
    pub const CALL_NOT_IMPLEMENTED: ErrorCode = ErrorCode(120);
    pub const INSUFFICIENT_BUFFER: ErrorCode = ErrorCode(122);
    pub const IO_PENDING: ErrorCode = ErrorCode(997);
    pub const INTERNAL_ERROR: ErrorCode = ErrorCode(1359);
    pub const TIMEOUT: ErrorCode = ErrorCode(1460);
    pub const REPARSE_POINT_ENCOUNTERED: ErrorCode = ErrorCode(4390);

    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }

    /// Translate a core error into the code reported to the OS.
    pub fn from_fs_error(err: &FsError) -> ErrorCode {
        match err {
            FsError::NotFound => Self::NOT_FOUND,
            FsError::InvalidParameter => Self::INVALID_PARAMETER,
            FsError::AccessDenied(_) => Self::ACCESS_DENIED,
            FsError::InsufficientBuffer => Self::INSUFFICIENT_BUFFER,
            FsError::OutOfMemory => Self::OUT_OF_MEMORY,
            FsError::TimedOut => Self::TIMEOUT,
            FsError::NotImplemented => Self::CALL_NOT_IMPLEMENTED,
            FsError::Store(StoreError::NotFound(_)) => Self::NOT_FOUND,
            FsError::Validation(_) | FsError::Store(_) | FsError::Io(_) => Self::INTERNAL_ERROR,
        }
    }

    /// Lift an OS failure back into the core error space, for channel entry
    /// points that return `FsResult`.
    pub fn to_fs_error(self, what: &str) -> FsError {
        match self {
            Self::NOT_FOUND | Self::PATH_NOT_FOUND => FsError::NotFound,
            Self::ACCESS_DENIED => FsError::AccessDenied(what.to_string()),
            Self::INVALID_PARAMETER => FsError::InvalidParameter,
            Self::INSUFFICIENT_BUFFER => FsError::InsufficientBuffer,
            Self::OUT_OF_MEMORY => FsError::OutOfMemory,
            Self::TIMEOUT => FsError::TimedOut,
            other => FsError::Io(std::io::Error::other(format!("{what}: {other}"))),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "os error {}", self.0)
    }
}

impl fmt::Debug for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ErrorCode({})", self.0)
    }
}

pub type OsResult<T> = Result<T, ErrorCode>;

/// The `{is_dir, size}` pair the OS wants for every projected entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileBasicInfo {
    pub is_dir: bool,
    pub size: u64,
}

/// Placeholder record handed to the OS for a single path. The path crosses
/// the boundary in wide-character form; conversion happens in the binding
/// layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlaceholderInfo {
    pub basic: FileBasicInfo,
    pub path: RepoPathBuf,
}

/// Properties of the virtualization instance, fetched once per large read.
#[derive(Clone, Copy, Debug)]
pub struct InstanceInfo {
    /// Required write alignment of the backing storage device; a power of
    /// two.
    pub write_alignment: u32,
}

/// Buffer satisfying the device's write-alignment requirements.
pub struct AlignedBuffer {
    data: Vec<u8>,
}

impl AlignedBuffer {
    pub fn new(size: usize) -> AlignedBuffer {
        AlignedBuffer {
            data: vec![0u8; size],
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// Extended parameters attached to a command completion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompletionExtra {
    /// Completion of a directory-enumeration request.
    Enumeration,
}

/// Output buffer for directory enumeration; filling stops when the OS-side
/// capacity is exhausted.
pub trait DirEntryBuffer: Send {
    /// Append one entry. Fails with [`ErrorCode::INSUFFICIENT_BUFFER`] when
    /// the entry does not fit.
    fn try_fill(&mut self, name: &str, info: &FileBasicInfo) -> OsResult<()>;
}

/// Handle to an OS-owned enumeration buffer. The OS keeps the buffer valid
/// until the command it belongs to completes, so the channel can fill it
/// after the callback has already gone pending.
pub type DirEntryBufferHandle = Arc<Mutex<dyn DirEntryBuffer>>;

/// Options passed when registering the virtualization instance.
#[derive(Clone, Debug)]
pub struct VirtualizationOptions {
    pub use_negative_path_caching: bool,
    /// Bitmask of the notification kinds the channel wants delivered.
    pub notification_mask: u32,
}

/// The projection-service API surface consumed by the channel.
#[cfg_attr(test, mockall::automock)]
pub trait ProjectionOs: Send + Sync {
    fn start_virtualizing(&self, options: &VirtualizationOptions) -> OsResult<()>;

    fn stop_virtualizing(&self);

    /// Convert a directory into a placeholder. `None` targets the mount
    /// root.
    fn mark_directory_as_placeholder<'a>(
        &self,
        target: Option<&'a RepoPath>,
        mount_id: &Guid,
    ) -> OsResult<()>;

    fn write_placeholder_info(&self, info: &PlaceholderInfo) -> OsResult<()>;

    /// Deliver file contents for an outstanding data request. `data` starts
    /// at `offset` within the file.
    fn write_file_data(&self, data_stream_id: &Guid, data: &[u8], offset: u64) -> OsResult<()>;

    /// Allocate a buffer aligned for `write_file_data`. `None` means the
    /// allocation failed.
    fn allocate_aligned_buffer(&self, size: usize) -> Option<AlignedBuffer>;

    fn instance_info(&self) -> OsResult<InstanceInfo>;

    /// Complete a previously-pending command. Failures are logged by the
    /// caller but never retried.
    fn complete_command(
        &self,
        command_id: i32,
        code: ErrorCode,
        extra: Option<CompletionExtra>,
    ) -> OsResult<()>;

    /// Drop all negative path-lookup cache entries; returns how many were
    /// flushed.
    fn clear_negative_path_cache(&self) -> OsResult<u32>;

    /// Remove the on-disk cache state for a projected file.
    fn delete_cached_file(&self, path: &RepoPath) -> OsResult<()>;
}
