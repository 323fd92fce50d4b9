//! Deferred task queue
//!
//! Every state-transition and observer notification in the runtime goes
//! through a [`TaskQueue`]: the mutating call enqueues a job and returns, and
//! the job runs once the current unit of work has finished. Nothing is ever
//! invoked re-entrantly from inside `create`, `track`, `observe` or `freeze`.
//!
//! Jobs queued while the queue is being drained run in the same drain, after
//! everything that was queued before them (FIFO, like a microtask queue).

use std::collections::VecDeque;
use std::fmt;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// A unit of deferred work
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// FIFO queue of deferred jobs
#[derive(Default)]
pub struct TaskQueue {
    jobs: Mutex<VecDeque<Job>>,
    wake: Notify,
}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueue")
            .field("pending", &self.len())
            .finish()
    }
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a job to run after the current unit of work
    pub fn defer<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.jobs.lock().push_back(Box::new(job));
        self.wake.notify_one();
    }

    /// Number of queued jobs
    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }

    /// Run queued jobs until the queue is empty, returning how many ran.
    ///
    /// The lock is released before each job runs, so jobs may defer more work.
    /// A panicking job unwinds out of this call; the remaining jobs stay queued.
    pub fn run_pending(&self) -> usize {
        let mut count = 0;
        loop {
            let job = self.jobs.lock().pop_front();
            match job {
                Some(job) => {
                    job();
                    count += 1;
                }
                None => return count,
            }
        }
    }

    /// Drain the queue whenever work arrives, until `cancel` fires
    pub async fn drive(&self, cancel: CancellationToken) {
        loop {
            self.run_pending();
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.wake.notified() => {}
            }
        }

        tracing::debug!("task queue driver stopped");
    }
}
