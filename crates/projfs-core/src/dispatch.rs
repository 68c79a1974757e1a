// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Event dispatch and permission decisions
//!
//! Every intercepted operation passes through [`Dispatcher::dispatch`]
//! before the controller touches the lower store. Notification kinds
//! always come back `Allow`; permission kinds block until their handler
//! has answered and the answer has been translated. Anything the
//! translator cannot interpret resolves to a denial.

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

use crate::config::{DispatchMode, MountContext};
use crate::error::{DispatchError, DispatchResult, TranslateError};
use crate::event_log::{EventLog, EventRecord};
use crate::registry::{HandlerRegistry, Registration};
use crate::result_code::{self, Convention, Decision, DenyReason};
use crate::scheduler::{CallbackScheduler, PoolStats};
use crate::types::{Event, Operation, OperationId, OperationKind};

/// Outcome of a single dispatch
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dispatched {
    pub id: OperationId,
    pub decision: Decision,
    /// A handler was invoked (or queued) for this operation
    pub notified: bool,
    pub lower_path: PathBuf,
    pub lower_target: Option<PathBuf>,
}

/// What `shutdown` found and settled
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrainedState {
    pub pool: Option<PoolStats>,
    /// Pending permissions force-resolved to `Deny(IoError)`
    pub abandoned: usize,
    pub events_logged: usize,
}

struct PendingSlot {
    record: EventRecord,
    tx: Sender<Decision>,
    rx: Receiver<Decision>,
    /// The handler answered `Pending`; only parked slots are abandoned
    parked: bool,
    resolved: bool,
}

pub struct Dispatcher {
    context: MountContext,
    registry: Arc<HandlerRegistry>,
    log: Arc<EventLog>,
    pool: Option<CallbackScheduler>,
    pending: Mutex<HashMap<OperationId, PendingSlot>>,
    stopped: AtomicBool,
}

impl Dispatcher {
    /// Seal the registry and, in pooled mode, start the callback workers
    pub fn new(
        context: MountContext,
        registry: Arc<HandlerRegistry>,
        log: Arc<EventLog>,
    ) -> DispatchResult<Self> {
        registry.seal();
        let pool = match context.mode() {
            DispatchMode::Inline => None,
            DispatchMode::Pooled { threads } => Some(CallbackScheduler::new(threads)?),
        };
        debug!(
            convention = %context.convention(),
            mode = ?context.mode(),
            lower = %context.paths().lower_root().display(),
            mount = %context.paths().mount_root().display(),
            "dispatcher ready"
        );
        Ok(Self {
            context,
            registry,
            log,
            pool,
            pending: Mutex::new(HashMap::new()),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn context(&self) -> &MountContext {
        &self.context
    }

    pub fn log(&self) -> &Arc<EventLog> {
        &self.log
    }

    /// Classify, invoke the registered handler and resolve a decision.
    ///
    /// Returns `Pending` only in pooled mode; the caller then parks on
    /// [`Dispatcher::wait`] until [`Dispatcher::complete`] is called.
    pub fn dispatch(&self, op: &Operation) -> DispatchResult<Dispatched> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(DispatchError::ShutDown);
        }

        let paths = self.context.paths();
        let path = paths.normalize(op.path())?;
        let lower_path = paths.to_lower(&path)?;
        let (target, lower_target) = match op.target() {
            Some(target) => {
                let target = paths.normalize(target)?;
                let lower = paths.to_lower(&target)?;
                (Some(target), Some(lower))
            }
            None => (None, None),
        };

        let event = Event {
            id: op.id(),
            kind: op.kind(),
            path,
            target,
            lower_path: lower_path.clone(),
            pid: op.pid(),
        };
        let registration = self.registry.lookup(op.kind()).cloned();

        let (decision, notified) = if op.kind().is_permission() {
            self.dispatch_permission(event, registration)
        } else {
            self.dispatch_notification(event, registration)
        };

        Ok(Dispatched {
            id: op.id(),
            decision,
            notified,
            lower_path,
            lower_target,
        })
    }

    /// Dispatch and, if the handler deferred, block until completion
    pub fn dispatch_and_wait(&self, op: &Operation) -> DispatchResult<Dispatched> {
        let mut dispatched = self.dispatch(op)?;
        if dispatched.decision == Decision::Pending {
            dispatched.decision = self.wait(dispatched.id)?;
        }
        Ok(dispatched)
    }

    /// Supply the final result for a pending permission
    pub fn complete(&self, id: OperationId, code: i32) -> DispatchResult<Decision> {
        let mut pending = self.pending.lock();
        let slot = match pending.get_mut(&id) {
            Some(slot) if !slot.resolved => slot,
            _ => return Err(DispatchError::NotPending(id)),
        };
        let decision = match result_code::from_code(code, self.context.convention()) {
            Ok(Decision::Pending) => return Err(DispatchError::PendingNotAllowed(id)),
            Ok(decision) => decision,
            Err(err) => deny_untranslatable(slot.record.kind, &err),
        };
        slot.resolved = true;
        let _ = slot.tx.try_send(decision);
        let mut record = slot.record.clone();
        record.decision = decision;
        drop(pending);

        debug!(%id, %decision, "pending operation completed");
        self.log.append(record);
        Ok(decision)
    }

    /// Block until a pending permission has been completed
    pub fn wait(&self, id: OperationId) -> DispatchResult<Decision> {
        let rx = match self.pending.lock().get(&id) {
            Some(slot) => slot.rx.clone(),
            None => return Err(DispatchError::NotPending(id)),
        };
        let decision = rx.recv().unwrap_or(Decision::Deny(DenyReason::IoError));
        self.pending.lock().remove(&id);
        Ok(decision)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Operations currently parked on a pending decision
    pub fn pending_count(&self) -> usize {
        self.pending
            .lock()
            .values()
            .filter(|slot| slot.parked && !slot.resolved)
            .count()
    }

    /// Wait for queued pool callbacks to finish; no-op inline
    pub fn quiesce(&self) {
        if let Some(pool) = &self.pool {
            pool.wait_idle();
        }
    }

    /// Stop accepting operations, drain the pool and release every
    /// operation still waiting on a pending decision.
    pub fn shutdown(&self) -> DrainedState {
        self.stopped.store(true, Ordering::Release);
        let pool = self.pool.as_ref().map(CallbackScheduler::shutdown);

        let mut abandoned = Vec::new();
        {
            let mut pending = self.pending.lock();
            for (id, slot) in pending
                .iter_mut()
                .filter(|(_, slot)| slot.parked && !slot.resolved)
            {
                let decision = Decision::Deny(DenyReason::IoError);
                slot.resolved = true;
                let _ = slot.tx.try_send(decision);
                let mut record = slot.record.clone();
                record.decision = decision;
                warn!(%id, kind = %record.kind, "pending operation abandoned at shutdown");
                abandoned.push(record);
            }
        }
        let abandoned_count = abandoned.len();
        for record in abandoned {
            self.log.append(record);
        }

        let state = DrainedState {
            pool,
            abandoned: abandoned_count,
            events_logged: self.log.len(),
        };
        debug!(?state, "dispatcher drained");
        state
    }

    fn dispatch_notification(
        &self,
        event: Event,
        registration: Option<Registration>,
    ) -> (Decision, bool) {
        self.log.append(record_for(&event, Decision::Allow));

        let Some(registration) = registration else {
            trace!(kind = %event.kind, path = %event.path.display(), "no handler registered");
            return (Decision::Allow, false);
        };

        let convention = self.context.convention();
        match &self.pool {
            None => {
                report_notification(&event, invoke_guarded(&registration, &event), convention);
                (Decision::Allow, true)
            }
            Some(pool) => {
                let lane = event.path.clone();
                let kind = event.kind;
                let submitted = pool.submit_async(lane, move || {
                    report_notification(&event, invoke_guarded(&registration, &event), convention);
                });
                match submitted {
                    Ok(()) => (Decision::Allow, true),
                    Err(err) => {
                        warn!(%kind, error = %err, "notification dropped");
                        (Decision::Allow, false)
                    }
                }
            }
        }
    }

    fn dispatch_permission(
        &self,
        event: Event,
        registration: Option<Registration>,
    ) -> (Decision, bool) {
        let mut record = record_for(&event, Decision::Allow);
        let Some(registration) = registration else {
            self.log.append(record);
            return (Decision::Allow, false);
        };

        let id = event.id;
        let kind = event.kind;
        let convention = self.context.convention();

        let decision = match &self.pool {
            None => resolve(kind, invoke_guarded(&registration, &event), convention, false),
            Some(pool) => {
                // the slot must exist before the handler can hand out the id
                let (tx, rx) = crossbeam_channel::bounded(1);
                self.pending.lock().insert(
                    id,
                    PendingSlot {
                        record: record.clone(),
                        tx,
                        rx,
                        parked: false,
                        resolved: false,
                    },
                );

                let lane = event.path.clone();
                let outcome = pool.submit_sync(lane, move || invoke_guarded(&registration, &event));
                let decision = match outcome {
                    Ok(code) => resolve(kind, code, convention, true),
                    Err(err) => {
                        error!(%kind, error = %err, "permission callback did not complete");
                        Decision::Deny(DenyReason::IoError)
                    }
                };
                match self.settle_slot(id, decision) {
                    Settled::Parked => {
                        debug!(%id, %kind, "permission deferred");
                        return (Decision::Pending, true);
                    }
                    Settled::AlreadyLogged(decision) => return (decision, true),
                    Settled::Final(decision) => decision,
                }
            }
        };

        record.decision = decision;
        self.log.append(record);
        (decision, true)
    }

    /// Park or retire a pool slot under one lock, so `shutdown` and
    /// `complete` never log an operation the dispatch thread also logs.
    fn settle_slot(&self, id: OperationId, decision: Decision) -> Settled {
        let mut pending = self.pending.lock();
        if decision == Decision::Pending {
            match pending.get_mut(&id) {
                // completed from inside the handler; `wait` collects it
                Some(slot) if slot.resolved => return Settled::Parked,
                Some(slot) if !self.stopped.load(Ordering::Acquire) => {
                    slot.parked = true;
                    return Settled::Parked;
                }
                _ => {
                    pending.remove(&id);
                    warn!(%id, "permission deferred during shutdown; denying");
                    return Settled::Final(Decision::Deny(DenyReason::IoError));
                }
            }
        }
        match pending.remove(&id) {
            Some(slot) if slot.resolved => {
                Settled::AlreadyLogged(slot.rx.try_recv().unwrap_or(decision))
            }
            _ => Settled::Final(decision),
        }
    }
}

enum Settled {
    Parked,
    AlreadyLogged(Decision),
    Final(Decision),
}

fn record_for(event: &Event, decision: Decision) -> EventRecord {
    EventRecord {
        kind: event.kind,
        path: event.path.clone(),
        target: event.target.clone(),
        pid: event.pid,
        decision,
    }
}

/// Run a handler, turning a panic into `None`
fn invoke_guarded(registration: &Registration, event: &Event) -> Option<i32> {
    match panic::catch_unwind(AssertUnwindSafe(|| registration.invoke(event))) {
        Ok(code) => Some(code),
        Err(_) => {
            error!(kind = %event.kind, path = %event.path.display(), "event handler panicked");
            None
        }
    }
}

/// Translate a permission handler's answer; ambiguity always denies
fn resolve(kind: OperationKind, code: Option<i32>, convention: Convention, pooled: bool) -> Decision {
    let Some(code) = code else {
        return Decision::Deny(DenyReason::IoError);
    };
    match result_code::from_code(code, convention) {
        Ok(Decision::Pending) if !pooled => {
            warn!(%kind, "pending result requires pooled dispatch; denying");
            Decision::Deny(DenyReason::InvalidArgument)
        }
        Ok(decision) => decision,
        Err(err) => deny_untranslatable(kind, &err),
    }
}

fn deny_untranslatable(kind: OperationKind, err: &TranslateError) -> Decision {
    warn!(%kind, error = %err, "untranslatable handler result; denying");
    Decision::Deny(DenyReason::InvalidArgument)
}

fn report_notification(event: &Event, code: Option<i32>, convention: Convention) {
    let Some(code) = code else {
        return;
    };
    match result_code::from_code(code, convention) {
        Ok(Decision::Allow) => {}
        Ok(decision) => warn!(
            kind = %event.kind,
            path = %event.path.display(),
            %decision,
            "event handler failed"
        ),
        Err(err) => warn!(
            kind = %event.kind,
            path = %event.path.display(),
            error = %err,
            "event handler returned an unknown result"
        ),
    }
}
