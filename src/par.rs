//! A bounded work queue with idle detection, and the cooperative
//! cancellation token threaded through every suspending operation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use crate::errors::{Cancelled, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct State {
    pending: Mutex<usize>,
    idle: Condvar,
}

/// A fixed-width pool of worker threads fed through a channel.
///
/// `idle` only returns once every submitted job has completed, including
/// jobs submitted by other jobs: the pending count is raised before a
/// job is enqueued and lowered only after it has run. Workers exit when
/// the last queue handle is dropped and the channel disconnects.
#[derive(Clone)]
pub struct Queue {
    tx: crossbeam_channel::Sender<Job>,
    state: Arc<State>,
}

impl Queue {
    /// A queue sized to the available parallelism.
    pub fn new() -> Queue {
        Queue::with_workers(num_cpus::get())
    }

    pub fn with_workers(workers: usize) -> Queue {
        let (tx, rx) = crossbeam_channel::unbounded::<Job>();
        let state = Arc::new(State {
            pending: Mutex::new(0),
            idle: Condvar::new(),
        });
        for _ in 0..workers.max(1) {
            let rx = rx.clone();
            let state = Arc::clone(&state);
            thread::spawn(move || {
                while let Ok(job) = rx.recv() {
                    job();
                    let mut pending = state.pending.lock().unwrap();
                    *pending -= 1;
                    if *pending == 0 {
                        state.idle.notify_all();
                    }
                }
            });
        }
        Queue { tx, state }
    }

    pub fn add(&self, job: impl FnOnce() + Send + 'static) {
        {
            let mut pending = self.state.pending.lock().unwrap();
            *pending += 1;
        }
        self.tx
            .send(Box::new(job))
            .expect("work queue channel closed with live handles");
    }

    /// Blocks until all outstanding jobs have completed.
    pub fn idle(&self) {
        let mut pending = self.state.pending.lock().unwrap();
        while *pending > 0 {
            pending = self.state.idle.wait(pending).unwrap();
        }
    }
}

impl Default for Queue {
    fn default() -> Queue {
        Queue::new()
    }
}

/// A clonable cancellation token checked at suspension points.
#[derive(Clone, Debug, Default)]
pub struct Cancellation {
    flag: Arc<AtomicBool>,
}

impl Cancellation {
    pub fn new() -> Cancellation {
        Cancellation::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Cancelled.into());
        }
        Ok(())
    }
}
