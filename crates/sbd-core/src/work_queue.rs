//! Deferred-callback work queue.
//!
//! Stands in for the image's shared op work queue: stages that must complete
//! without an object-store round trip (object-map updates, short-circuited
//! requests) enqueue their callback here instead of invoking it inline,
//! which keeps lock acquisition non-recursive.

use parking_lot::{Condvar, Mutex};
use sbd_store::StatusCallback;
use sbd_types::Status;
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::trace;

struct QueueState {
    jobs: VecDeque<(StatusCallback, Status)>,
    active: usize,
    stop: bool,
}

struct QueueShared {
    state: Mutex<QueueState>,
    work_cond: Condvar,
    idle_cond: Condvar,
}

/// Fixed pool of worker threads delivering deferred status callbacks.
pub struct OpWorkQueue {
    shared: Arc<QueueShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl OpWorkQueue {
    /// Spawn a queue with `threads` workers.
    #[must_use]
    pub fn new(threads: usize) -> Self {
        assert!(threads > 0, "work queue needs at least one thread");
        let shared = Arc::new(QueueShared {
            state: Mutex::new(QueueState {
                jobs: VecDeque::new(),
                active: 0,
                stop: false,
            }),
            work_cond: Condvar::new(),
            idle_cond: Condvar::new(),
        });
        let workers = (0..threads)
            .map(|_| {
                let shared = Arc::clone(&shared);
                std::thread::spawn(move || worker_loop(&shared))
            })
            .collect();
        Self {
            shared,
            workers: Mutex::new(workers),
        }
    }

    /// Enqueue `callback` for delivery with `status`.
    pub fn queue(&self, callback: StatusCallback, status: Status) {
        trace!(target: "sbd::queue", status, "queueing deferred callback");
        let mut state = self.shared.state.lock();
        state.jobs.push_back((callback, status));
        self.shared.work_cond.notify_one();
    }

    /// Block until no job is queued or running.
    pub fn wait_idle(&self) {
        let mut state = self.shared.state.lock();
        while !state.jobs.is_empty() || state.active > 0 {
            self.shared.idle_cond.wait(&mut state);
        }
    }
}

impl Drop for OpWorkQueue {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.stop = true;
        }
        self.shared.work_cond.notify_all();
        for handle in self.workers.lock().drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(shared: &Arc<QueueShared>) {
    loop {
        let job = {
            let mut state = shared.state.lock();
            loop {
                if let Some(job) = state.jobs.pop_front() {
                    state.active += 1;
                    break Some(job);
                }
                if state.stop {
                    break None;
                }
                shared.work_cond.wait(&mut state);
            }
        };
        let Some((callback, status)) = job else {
            break;
        };
        callback.complete(status);
        let mut state = shared.state.lock();
        state.active -= 1;
        if state.jobs.is_empty() && state.active == 0 {
            shared.idle_cond.notify_all();
        }
    }
}
