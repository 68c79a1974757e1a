// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Worker threads for requests that may block on a provider
//!
//! The FUSE session serves one request at a time. Deletions and renames
//! wait on a permission handler (possibly on a pending decision), so the
//! adapter hands them, together with their reply, to these workers and
//! goes back to reading the channel.

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

pub type Request = Box<dyn FnOnce() + Send + 'static>;

pub struct RequestPool {
    sender: Mutex<Option<Sender<Request>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl RequestPool {
    /// Spawn up to `threads` workers named `projfs-req-N`
    pub fn new(threads: usize) -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded::<Request>();
        let mut handles = Vec::with_capacity(threads);
        for index in 0..threads.max(1) {
            let receiver = receiver.clone();
            let spawned = thread::Builder::new()
                .name(format!("projfs-req-{index}"))
                .spawn(move || worker_loop(&receiver));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(err) => error!(index, error = %err, "failed to spawn request worker"),
            }
        }
        debug!(threads = handles.len(), "request workers started");
        Self {
            sender: Mutex::new(Some(sender)),
            handles: Mutex::new(handles),
        }
    }

    pub fn workers(&self) -> usize {
        self.handles.lock().len()
    }

    /// Queue a request; hands it back when no worker can take it so the
    /// caller runs it in place
    pub fn submit(&self, request: Request) -> Result<(), Request> {
        if self.workers() == 0 {
            return Err(request);
        }
        match self.sender.lock().as_ref() {
            Some(sender) => sender.send(request).map_err(|err| err.into_inner()),
            None => Err(request),
        }
    }

    /// Let queued requests finish, then join the workers
    pub fn shutdown(&self) {
        self.sender.lock().take();
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                error!("request worker exited abnormally");
            }
        }
    }
}

impl Drop for RequestPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(receiver: &Receiver<Request>) {
    // ends once the pool drops its sender and the queue is empty
    for request in receiver.iter() {
        if panic::catch_unwind(AssertUnwindSafe(request)).is_err() {
            error!("request worker caught a panic");
        }
    }
}
