// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Event dispatch and permission-decision engine for projected filesystems
//!
//! The mount controller hands every intercepted operation to a
//! [`Dispatcher`], which classifies it, runs the provider's handler and
//! turns the handler's raw result into a [`Decision`]. Permission kinds
//! (deletions, renames) block on the handler; everything else is a
//! notification that always proceeds.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod event_log;
pub mod path_map;
pub mod registry;
pub mod result_code;
pub mod scheduler;
pub mod types;

pub use config::{DispatchMode, MountContext, MountOptions, ProjfsConfig, DEFAULT_REQUEST_THREADS};
pub use dispatch::{Dispatched, Dispatcher, DrainedState};
pub use error::{
    ConfigError, DispatchError, DispatchResult, PathError, RegistryError, SchedulerError,
    TranslateError,
};
pub use event_log::{EventLog, EventRecord};
pub use path_map::{check_safe_rel_path, PathMapper};
pub use registry::{EventHandler, HandlerContext, HandlerRegistry, Registration, UserContext};
pub use result_code::{Convention, Decision, DenyReason, ProviderResult};
pub use scheduler::{CallbackScheduler, PoolStats};
pub use types::{Classification, Event, Operation, OperationId, OperationKind};
