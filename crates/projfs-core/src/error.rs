// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for the projfs dispatch engine

use std::io;
use std::path::PathBuf;

use crate::result_code::Convention;
use crate::types::{OperationId, OperationKind};

/// Path resolution failures raised by the path mapper
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("path escapes the lower root: {}", .0.display())]
    PathEscape(PathBuf),
}

/// Result code translation failures
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TranslateError {
    #[error("decision {decision} has no {convention} representation")]
    UnsupportedConvention {
        decision: String,
        convention: Convention,
    },
    #[error("unknown {convention} result code {code}")]
    UnknownCode { code: i32, convention: Convention },
    #[error("null result marker is not a live decision ({convention})")]
    NullMarker { convention: Convention },
    #[error("unknown result symbol: {0}")]
    UnknownSymbol(String),
}

/// Handler registration failures
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("cannot register {0} handler: mount already started")]
    AlreadyStarted(OperationKind),
}

/// Callback scheduler failures
#[derive(thiserror::Error, Debug)]
pub enum SchedulerError {
    #[error("callback scheduler is stopped")]
    Stopped,
    #[error("callback task ended without posting a result")]
    Lost,
    #[error("failed to spawn callback worker: {0}")]
    Spawn(#[source] io::Error),
    #[error("callback pool needs at least one worker thread")]
    NoWorkers,
}

/// Dispatch-level failures that cannot be expressed as a decision
#[derive(thiserror::Error, Debug)]
pub enum DispatchError {
    #[error("invalid path: {0}")]
    InvalidPath(#[from] PathError),
    #[error("operation {0} has no pending decision")]
    NotPending(OperationId),
    #[error("operation {0} completed with another pending result")]
    PendingNotAllowed(OperationId),
    #[error("dispatcher has been shut down")]
    ShutDown,
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

/// Configuration loading and validation failures
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

pub type DispatchResult<T> = Result<T, DispatchError>;
