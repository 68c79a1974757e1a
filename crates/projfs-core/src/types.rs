// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Operation and event data model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use strum::{EnumIter, IntoStaticStr};

/// Filesystem actions intercepted on the mount
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, EnumIter, IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OperationKind {
    CreateFile,
    CreateDir,
    DeleteFile,
    DeleteDir,
    Rename,
    Open,
    CloseNoModify,
    CloseModify,
    Link,
}

/// Whether a handler's result can change the outcome of an operation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// Handler runs; the operation always proceeds.
    Notification,
    /// Handler result decides whether the operation proceeds.
    Permission,
}

impl OperationKind {
    /// Static classification; never changes at runtime.
    pub const fn classification(self) -> Classification {
        match self {
            OperationKind::DeleteFile | OperationKind::DeleteDir | OperationKind::Rename => {
                Classification::Permission
            }
            OperationKind::CreateFile
            | OperationKind::CreateDir
            | OperationKind::Open
            | OperationKind::CloseNoModify
            | OperationKind::CloseModify
            | OperationKind::Link => Classification::Notification,
        }
    }

    pub const fn is_permission(self) -> bool {
        matches!(self.classification(), Classification::Permission)
    }

    /// Kinds that carry a destination path
    pub const fn has_target(self) -> bool {
        matches!(self, OperationKind::Rename | OperationKind::Link)
    }

    pub fn as_str(self) -> &'static str {
        self.into()
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a single intercepted operation, used to key pending completions
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationId(pub u64);

impl OperationId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

/// A single intercepted request as delivered by the mount controller
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Operation {
    id: OperationId,
    kind: OperationKind,
    path: PathBuf,
    target: Option<PathBuf>,
    pid: u32,
}

impl Operation {
    pub fn new(kind: OperationKind, path: impl Into<PathBuf>, pid: u32) -> Self {
        Self {
            id: OperationId::next(),
            kind,
            path: path.into(),
            target: None,
            pid,
        }
    }

    /// Operation with a destination path (rename, link)
    pub fn with_target(
        kind: OperationKind,
        path: impl Into<PathBuf>,
        target: impl Into<PathBuf>,
        pid: u32,
    ) -> Self {
        Self {
            target: Some(target.into()),
            ..Self::new(kind, path, pid)
        }
    }

    /// Close of a file handle; `modified` selects `close_modify`
    pub fn close(path: impl Into<PathBuf>, modified: bool, pid: u32) -> Self {
        let kind = if modified {
            OperationKind::CloseModify
        } else {
            OperationKind::CloseNoModify
        };
        Self::new(kind, path, pid)
    }

    pub fn id(&self) -> OperationId {
        self.id
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn target(&self) -> Option<&Path> {
        self.target.as_deref()
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }
}

/// Event record handed to provider handlers
///
/// Paths are normalized mount-relative paths (`.` for the mount root);
/// `lower_path` is the resolved location in the lower store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    pub id: OperationId,
    pub kind: OperationKind,
    pub path: PathBuf,
    pub target: Option<PathBuf>,
    pub lower_path: PathBuf,
    pub pid: u32,
}

impl Event {
    pub fn is_dir(&self) -> bool {
        matches!(self.kind, OperationKind::CreateDir | OperationKind::DeleteDir)
    }
}
