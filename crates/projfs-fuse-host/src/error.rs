// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use projfs_core::{ConfigError, DenyReason, DispatchError, PathError};
use std::io;
use std::path::PathBuf;

/// Failure of a single controller operation; each maps to one errno
#[derive(thiserror::Error, Debug)]
pub enum ControllerError {
    #[error("denied by provider: {0}")]
    Denied(DenyReason),
    #[error(transparent)]
    InvalidPath(#[from] PathError),
    #[error("unsafe provider path: {}", .0.display())]
    UnsafePath(PathBuf),
    #[error("unknown file handle {0}")]
    BadHandle(u64),
    #[error("reserved extended attribute: {0}")]
    ReservedXattr(String),
    #[error("dispatch failed: {0}")]
    Dispatch(DispatchError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<DispatchError> for ControllerError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::InvalidPath(path) => ControllerError::InvalidPath(path),
            other => ControllerError::Dispatch(other),
        }
    }
}

impl ControllerError {
    pub fn errno(&self) -> i32 {
        match self {
            ControllerError::Denied(reason) => reason.errno(),
            ControllerError::InvalidPath(_) => libc::EACCES,
            ControllerError::UnsafePath(_) => libc::EINVAL,
            ControllerError::BadHandle(_) => libc::EBADF,
            ControllerError::ReservedXattr(_) => libc::EPERM,
            ControllerError::Dispatch(_) => libc::EIO,
            ControllerError::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

pub type ControllerResult<T> = Result<T, ControllerError>;

/// Mount lifecycle failures, reported to the operator
#[derive(thiserror::Error, Debug)]
pub enum MountError {
    #[error("invalid lower path {}: {reason}", .path.display())]
    InvalidLowerPath { path: PathBuf, reason: String },
    #[error("invalid mount path {}: {reason}", .path.display())]
    InvalidMountPath { path: PathBuf, reason: String },
    #[error("mount point {} is already in use", .0.display())]
    MountPointBusy(PathBuf),
    #[error("lower and mount paths overlap: {}", .0.display())]
    SamePath(PathBuf),
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to open event log: {0}")]
    EventLog(#[source] io::Error),
    #[error("failed to start dispatcher: {0}")]
    Dispatcher(#[from] DispatchError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("kernel transport unavailable: {0}")]
    Unsupported(String),
}
