// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Projfs mount host
//!
//! Applies intercepted filesystem operations to a lower directory after
//! routing them through the projfs-core dispatcher.

#[cfg(all(feature = "fuse", target_os = "linux"))]
pub mod adapter;
pub mod controller;
pub mod error;
pub mod fdtable;
pub mod fixture;
pub mod mount;
pub mod proc_info;
pub mod request_pool;
pub mod xattr;

pub use controller::{mark_projection_root, DirEntryInfo, MountController};
pub use error::{ControllerError, ControllerResult, MountError};
pub use fixture::{fixed_result_registry, registry_for, FixedResult};
pub use mount::{validate_paths, MountHandle};
pub use request_pool::RequestPool;
