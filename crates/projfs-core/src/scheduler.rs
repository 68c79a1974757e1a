// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Callback scheduler for pooled dispatch
//!
//! A fixed set of worker threads runs handler callbacks so that slow
//! providers do not tie up transport threads. Jobs are grouped into lanes
//! (one per normalized path); a lane runs at most one job at a time and in
//! submission order, while distinct lanes proceed in parallel.

use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, trace};

use crate::error::SchedulerError;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Counters reported when the pool is drained
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub executed: u64,
    pub panicked: u64,
}

#[derive(Default)]
struct Queue {
    /// Lanes with queued work that no worker currently owns
    ready: VecDeque<PathBuf>,
    /// Queued jobs per lane; a key stays present while its lane is running
    lanes: HashMap<PathBuf, VecDeque<Job>>,
    shutdown: bool,
    active: usize,
    stats: PoolStats,
}

struct Shared {
    queue: Mutex<Queue>,
    available: Condvar,
    idle: Condvar,
}

pub struct CallbackScheduler {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl CallbackScheduler {
    /// Spawn `threads` workers named `projfs-cb-N`
    pub fn new(threads: usize) -> Result<Self, SchedulerError> {
        if threads == 0 {
            return Err(SchedulerError::NoWorkers);
        }
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue::default()),
            available: Condvar::new(),
            idle: Condvar::new(),
        });

        let mut workers = Vec::with_capacity(threads);
        for index in 0..threads {
            let shared_clone = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(format!("projfs-cb-{index}"))
                .spawn(move || worker_loop(&shared_clone));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(err) => {
                    // tear down whatever already started
                    shared.queue.lock().shutdown = true;
                    shared.available.notify_all();
                    for handle in workers {
                        let _ = handle.join();
                    }
                    return Err(SchedulerError::Spawn(err));
                }
            }
        }
        debug!(threads, "callback pool started");

        Ok(Self {
            shared,
            workers: Mutex::new(workers),
        })
    }

    /// Queue a job and return immediately
    pub fn submit_async<F>(&self, lane: PathBuf, job: F) -> Result<(), SchedulerError>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut queue = self.shared.queue.lock();
        if queue.shutdown {
            return Err(SchedulerError::Stopped);
        }
        match queue.lanes.get_mut(&lane) {
            Some(jobs) => jobs.push_back(Box::new(job)),
            None => {
                queue.lanes.insert(lane.clone(), VecDeque::from([Box::new(job) as Job]));
                queue.ready.push_back(lane);
                self.shared.available.notify_one();
            }
        }
        Ok(())
    }

    /// Queue a job and block until a worker has run it
    pub fn submit_sync<F, R>(&self, lane: PathBuf, job: F) -> Result<R, SchedulerError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.submit_async(lane, move || {
            let _ = tx.send(job());
        })?;
        // a panicking job drops the sender without posting
        rx.recv().map_err(|_| SchedulerError::Lost)
    }

    /// Block until every queued job has run
    pub fn wait_idle(&self) {
        let mut queue = self.shared.queue.lock();
        while !queue.lanes.is_empty() || queue.active > 0 {
            self.shared.idle.wait(&mut queue);
        }
    }

    /// Refuse new work, run what is queued, then join the workers
    pub fn shutdown(&self) -> PoolStats {
        {
            let mut queue = self.shared.queue.lock();
            queue.shutdown = true;
        }
        self.shared.available.notify_all();

        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in workers {
            if handle.join().is_err() {
                error!("callback worker exited abnormally");
            }
        }
        let stats = self.shared.queue.lock().stats;
        debug!(executed = stats.executed, panicked = stats.panicked, "callback pool drained");
        stats
    }
}

impl Drop for CallbackScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let (lane, job) = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(lane) = queue.ready.pop_front() {
                    let job = queue.lanes.get_mut(&lane).and_then(VecDeque::pop_front);
                    if let Some(job) = job {
                        queue.active += 1;
                        break (lane, job);
                    }
                    queue.lanes.remove(&lane);
                    continue;
                }
                if queue.shutdown {
                    return;
                }
                shared.available.wait(&mut queue);
            }
        };

        trace!(lane = %lane.display(), "running callback");
        let panicked = panic::catch_unwind(AssertUnwindSafe(job)).is_err();
        if panicked {
            error!(lane = %lane.display(), "callback panicked");
        }

        let mut queue = shared.queue.lock();
        queue.active -= 1;
        queue.stats.executed += 1;
        if panicked {
            queue.stats.panicked += 1;
        }
        let lane_done = queue.lanes.get(&lane).map_or(true, VecDeque::is_empty);
        if lane_done {
            queue.lanes.remove(&lane);
        } else {
            queue.ready.push_back(lane);
            shared.available.notify_one();
        }
        if queue.lanes.is_empty() && queue.active == 0 {
            shared.idle.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn zero_threads_is_rejected() {
        assert!(matches!(CallbackScheduler::new(0), Err(SchedulerError::NoWorkers)));
    }

    #[test]
    fn submit_sync_returns_job_result() {
        let pool = CallbackScheduler::new(2).unwrap();
        let value = pool.submit_sync(PathBuf::from("a"), || 40 + 2).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn same_lane_runs_in_submission_order() {
        let pool = CallbackScheduler::new(4).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..32 {
            let seen = Arc::clone(&seen);
            pool.submit_async(PathBuf::from("f1.txt"), move || {
                if i % 3 == 0 {
                    thread::sleep(Duration::from_millis(1));
                }
                seen.lock().push(i);
            })
            .unwrap();
        }
        pool.wait_idle();
        assert_eq!(*seen.lock(), (0..32).collect::<Vec<_>>());
    }

    #[test]
    fn distinct_lanes_run_concurrently() {
        let pool = CallbackScheduler::new(2).unwrap();
        let (tx, rx) = crossbeam_channel::bounded::<()>(0);
        // first lane blocks until the second lane has run
        pool.submit_async(PathBuf::from("a"), move || {
            let _ = rx.recv_timeout(Duration::from_secs(5));
        })
        .unwrap();
        let ran = pool
            .submit_sync(PathBuf::from("b"), move || tx.send(()).is_ok())
            .unwrap();
        assert!(ran);
    }

    #[test]
    fn panicking_job_is_reported_lost_and_pool_survives() {
        let pool = CallbackScheduler::new(1).unwrap();
        let lost = pool.submit_sync(PathBuf::from("x"), || -> i32 { panic!("handler bug") });
        assert!(matches!(lost, Err(SchedulerError::Lost)));
        assert_eq!(pool.submit_sync(PathBuf::from("x"), || 7).unwrap(), 7);
        let stats = pool.shutdown();
        assert_eq!(stats.panicked, 1);
        assert_eq!(stats.executed, 2);
    }

    #[test]
    fn shutdown_drains_queued_work() {
        let pool = CallbackScheduler::new(1).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let counter = Arc::clone(&counter);
            pool.submit_async(PathBuf::from("d"), move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        let stats = pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 10);
        assert_eq!(stats.executed, 10);
        assert!(matches!(
            pool.submit_async(PathBuf::from("d"), || {}),
            Err(SchedulerError::Stopped)
        ));
    }
}
