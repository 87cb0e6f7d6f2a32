// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for repofs-core

use std::io;

use crate::store::StoreError;

/// Core filesystem error type
#[derive(thiserror::Error, Debug)]
pub enum FsError {
    #[error("not found")]
    NotFound,
    #[error("invalid parameter")]
    InvalidParameter,
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("insufficient buffer")]
    InsufficientBuffer,
    #[error("out of memory")]
    OutOfMemory,
    #[error("timed out")]
    TimedOut,
    #[error("not implemented")]
    NotImplemented,
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("object store failure: {0}")]
    Store(#[from] StoreError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type FsResult<T> = Result<T, FsError>;
