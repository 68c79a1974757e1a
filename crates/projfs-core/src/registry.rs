// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Handler registry
//!
//! Registrations are staged under a lock until the mount starts; starting
//! seals the table into a write-once cell that dispatch reads without
//! locking.

use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};
use tracing::debug;

use crate::error::RegistryError;
use crate::types::{Event, OperationKind};

/// Opaque provider value handed back to handlers on every call
pub type UserContext = Arc<dyn Any + Send + Sync>;

/// User context bound to a registration
#[derive(Clone, Default)]
pub struct HandlerContext(Option<UserContext>);

impl HandlerContext {
    pub fn new(context: UserContext) -> Self {
        Self(Some(context))
    }

    pub fn empty() -> Self {
        Self(None)
    }

    pub fn get(&self) -> Option<&UserContext> {
        self.0.as_ref()
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.as_deref().and_then(|ctx| ctx.downcast_ref::<T>())
    }
}

impl fmt::Debug for HandlerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(_) => f.write_str("HandlerContext(Some(..))"),
            None => f.write_str("HandlerContext(None)"),
        }
    }
}

/// Provider callback. Returns a raw result code interpreted in the
/// convention bound to the mount.
#[cfg_attr(test, mockall::automock)]
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &Event, context: &HandlerContext) -> i32;
}

impl<F> EventHandler for F
where
    F: Fn(&Event, &HandlerContext) -> i32 + Send + Sync,
{
    fn handle(&self, event: &Event, context: &HandlerContext) -> i32 {
        self(event, context)
    }
}

/// One callback plus its user context
#[derive(Clone)]
pub struct Registration {
    pub handler: Arc<dyn EventHandler>,
    pub context: HandlerContext,
}

impl Registration {
    pub fn invoke(&self, event: &Event) -> i32 {
        self.handler.handle(event, &self.context)
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

/// Table of at most one callback per operation kind
#[derive(Default)]
pub struct HandlerRegistry {
    staged: Mutex<HashMap<OperationKind, Registration>>,
    sealed: OnceLock<HashMap<OperationKind, Registration>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `handler` to `kind`, replacing any earlier registration.
    /// Fails once the mount has started.
    pub fn register(
        &self,
        kind: OperationKind,
        handler: Arc<dyn EventHandler>,
        context: HandlerContext,
    ) -> Result<(), RegistryError> {
        let mut staged = self.staged.lock();
        if self.sealed.get().is_some() {
            return Err(RegistryError::AlreadyStarted(kind));
        }
        let replaced = staged.insert(kind, Registration { handler, context }).is_some();
        debug!(%kind, replaced, "handler registered");
        Ok(())
    }

    /// Bind one handler to several kinds
    pub fn register_all(
        &self,
        kinds: impl IntoIterator<Item = OperationKind>,
        handler: Arc<dyn EventHandler>,
        context: HandlerContext,
    ) -> Result<(), RegistryError> {
        for kind in kinds {
            self.register(kind, Arc::clone(&handler), context.clone())?;
        }
        Ok(())
    }

    /// Freeze the table. Idempotent.
    pub fn seal(&self) {
        let mut staged = self.staged.lock();
        if self.sealed.get().is_none() {
            let table = std::mem::take(&mut *staged);
            debug!(handlers = table.len(), "handler registry sealed");
            let _ = self.sealed.set(table);
        }
    }

    pub fn is_started(&self) -> bool {
        self.sealed.get().is_some()
    }

    /// Registered callback for `kind`. Only the sealed table is visible.
    pub fn lookup(&self, kind: OperationKind) -> Option<&Registration> {
        self.sealed.get().and_then(|table| table.get(&kind))
    }
}
