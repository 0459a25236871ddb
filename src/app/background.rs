//! Single-worker background job queue
//!
//! Defers codec work off the main loop. Jobs run strictly in submission
//! order on one worker thread; `wait_for_idle` is the join point used
//! before destructive pipeline reconfiguration (decoder reset, upgrade).

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::{Condvar, Mutex};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use crate::constants::BACKGROUND_QUEUE_CAPACITY;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct IdleState {
    /// Jobs queued or executing
    pending: Mutex<usize>,
    idle: Condvar,
}

/// Bounded single-worker asynchronous executor
pub struct BackgroundTask {
    tx: Option<Sender<Job>>,
    state: Arc<IdleState>,
    worker: Option<JoinHandle<()>>,
    worker_id: ThreadId,
}

impl BackgroundTask {
    /// Spawn the worker thread
    pub fn new() -> Self {
        let (tx, rx) = bounded::<Job>(BACKGROUND_QUEUE_CAPACITY);
        let state = Arc::new(IdleState {
            pending: Mutex::new(0),
            idle: Condvar::new(),
        });

        let worker_state = state.clone();
        let worker = thread::Builder::new()
            .name("background".to_string())
            .spawn(move || Self::worker_loop(rx, worker_state))
            .expect("failed to spawn background worker");
        let worker_id = worker.thread().id();

        Self {
            tx: Some(tx),
            state,
            worker: Some(worker),
            worker_id,
        }
    }

    fn worker_loop(rx: Receiver<Job>, state: Arc<IdleState>) {
        for job in rx.iter() {
            if catch_unwind(AssertUnwindSafe(job)).is_err() {
                tracing::error!("background job panicked, worker continues");
            }
            Self::finish_one(&state);
        }
    }

    fn finish_one(state: &IdleState) {
        let mut pending = state.pending.lock();
        *pending -= 1;
        if *pending == 0 {
            state.idle.notify_all();
        }
    }

    /// Enqueue a job for sequential execution on the worker
    ///
    /// Submission from within a running job succeeds without deadlock:
    /// if the queue is full, the worker runs the job in place instead of
    /// blocking on its own channel.
    pub fn schedule<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(tx) = self.tx.as_ref() else { return };

        *self.state.pending.lock() += 1;

        if thread::current().id() == self.worker_id {
            match tx.try_send(Box::new(job)) {
                Ok(()) => {}
                Err(TrySendError::Full(job)) => {
                    tracing::debug!("background queue full, running job inline on worker");
                    if catch_unwind(AssertUnwindSafe(job)).is_err() {
                        tracing::error!("background job panicked, worker continues");
                    }
                    Self::finish_one(&self.state);
                }
                Err(TrySendError::Disconnected(_)) => Self::finish_one(&self.state),
            }
        } else if tx.send(Box::new(job)).is_err() {
            Self::finish_one(&self.state);
        }
    }

    /// Block until zero jobs are queued and none is executing
    ///
    /// Calling this from the worker itself is a contract violation; it
    /// logs and returns immediately instead of deadlocking.
    pub fn wait_for_idle(&self) {
        if thread::current().id() == self.worker_id {
            tracing::error!("wait_for_idle called from the background worker itself");
            return;
        }

        let mut pending = self.state.pending.lock();
        while *pending > 0 {
            self.state.idle.wait(&mut pending);
        }
    }

    /// Jobs queued or executing right now
    pub fn pending(&self) -> usize {
        *self.state.pending.lock()
    }
}

impl Default for BackgroundTask {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BackgroundTask {
    fn drop(&mut self) {
        // Closing the channel ends the worker loop after queued jobs run
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
