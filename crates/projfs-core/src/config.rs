// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Mount configuration

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::ConfigError;
use crate::path_map::PathMapper;
use crate::result_code::Convention;

/// Workers serving blocking requests, matching libfuse's idle thread
/// budget for a multi-threaded session
pub const DEFAULT_REQUEST_THREADS: usize = 10;

/// How handler callbacks are executed
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DispatchMode {
    /// On the transport thread that delivered the request
    #[default]
    Inline,
    /// On a fixed pool of callback workers
    Pooled { threads: usize },
}

impl DispatchMode {
    pub fn is_pooled(&self) -> bool {
        matches!(self, DispatchMode::Pooled { .. })
    }
}

/// Transport-level mount options
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountOptions {
    pub allow_other: bool,
    pub auto_unmount: bool,
    /// Threads that carry deletions and renames while their permission
    /// handler decides
    pub request_threads: usize,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            allow_other: false,
            auto_unmount: false,
            request_threads: DEFAULT_REQUEST_THREADS,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjfsConfig {
    pub lower_root: Option<PathBuf>,
    pub mount_root: Option<PathBuf>,
    pub convention: Convention,
    pub dispatch: DispatchMode,
    /// File that receives one line per dispatched operation
    pub event_log: Option<PathBuf>,
    /// Mark the lower root as an empty projection root at start
    pub initial: bool,
    pub mount: MountOptions,
}

impl ProjfsConfig {
    /// Read a JSON config file; `None` yields the defaults
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => {
                let content = fs::read_to_string(path)?;
                serde_json::from_str(&content)?
            }
            None => ProjfsConfig::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let DispatchMode::Pooled { threads: 0 } = self.dispatch {
            return Err(ConfigError::Invalid(
                "pooled dispatch needs at least one thread".to_string(),
            ));
        }
        if self.mount.request_threads == 0 {
            return Err(ConfigError::Invalid(
                "at least one request thread is required".to_string(),
            ));
        }
        if self.dispatch == DispatchMode::Inline && self.convention == Convention::ProviderApi {
            debug!("provider_api convention with inline dispatch; pending results will be denied");
        }
        Ok(())
    }
}

/// Per-mount settings threaded through every dispatch call
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountContext {
    paths: PathMapper,
    convention: Convention,
    mode: DispatchMode,
}

impl MountContext {
    pub fn new(paths: PathMapper, convention: Convention, mode: DispatchMode) -> Self {
        Self {
            paths,
            convention,
            mode,
        }
    }

    pub fn paths(&self) -> &PathMapper {
        &self.paths
    }

    pub fn convention(&self) -> Convention {
        self.convention
    }

    pub fn mode(&self) -> DispatchMode {
        self.mode
    }
}
