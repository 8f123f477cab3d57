//! Ordered dispatch queue backing one actor instance.
//!
//! Every actor owns exactly one [`Strand`]: a FIFO queue of jobs
//! drained by the actor's thread. All mutation of actor state happens
//! inside jobs, which is what gives each instance its single-threaded
//! execution guarantee. Cross-thread wake-ups are always fresh
//! [`Strand::post`] calls, never synchronous calls into the peer.
//!
//! A [`WorkGuard`] keeps the actor loop from exiting: as long as any
//! guard lives, the loop blocks waiting for more jobs instead of
//! declaring the instance starved.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

use crate::vm::Actor;

pub(crate) type Job = Box<dyn FnOnce(&Actor) + Send + 'static>;

pub(crate) enum NextJob {
    Run(Job),
    /// Queue is empty and no guard lives: nothing can ever be posted
    /// again. The owner decides between a quiet stop and a deadlock
    /// report.
    Starved,
    /// The strand was closed; the loop must stop.
    Shutdown,
}

#[derive(Default)]
struct Queue {
    jobs: VecDeque<Job>,
    guards: usize,
    open: bool,
}

struct StrandInner {
    queue: Mutex<Queue>,
    cond: Condvar,
}

/// Handle to an actor's dispatch queue. Cheap to clone and safe to use
/// from any thread.
#[derive(Clone)]
pub(crate) struct Strand {
    inner: Arc<StrandInner>,
}

impl Strand {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StrandInner {
                queue: Mutex::new(Queue {
                    jobs: VecDeque::new(),
                    guards: 0,
                    open: true,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Enqueues a job. Returns `false` if the strand is already closed,
    /// in which case the job is dropped on the caller's thread (drop
    /// glue of captured state still runs, which is what delivers
    /// `channel_closed` wake-ups for messages that raced with a
    /// shutdown).
    pub fn post(&self, job: Job) -> bool {
        let mut queue = self.inner.queue.lock().unwrap();
        if !queue.open {
            return false;
        }
        queue.jobs.push_back(job);
        self.inner.cond.notify_one();
        true
    }

    /// Enqueues at the back of the queue like [`post`](Self::post), but
    /// spelled separately where the caller's intent is to yield the
    /// current slot to already-queued work.
    #[inline(always)]
    pub fn defer(&self, job: Job) -> bool {
        self.post(job)
    }

    pub fn work_guard(&self) -> WorkGuard {
        let mut queue = self.inner.queue.lock().unwrap();
        queue.guards += 1;
        WorkGuard {
            inner: self.inner.clone(),
        }
    }

    /// Blocks until a job is available or the queue state decides the
    /// loop's fate. Only the owning thread calls this.
    pub fn next(&self) -> NextJob {
        let mut queue = self.inner.queue.lock().unwrap();
        loop {
            if let Some(job) = queue.jobs.pop_front() {
                return NextJob::Run(job);
            }
            if !queue.open {
                return NextJob::Shutdown;
            }
            if queue.guards == 0 {
                return NextJob::Starved;
            }
            queue = self.inner.cond.wait(queue).unwrap();
        }
    }

    /// Stops accepting jobs and discards the ones still queued. The
    /// discarded jobs never run; their captured state is dropped right
    /// here, on the owning thread.
    pub fn close(&self) {
        let dropped = {
            let mut queue = self.inner.queue.lock().unwrap();
            queue.open = false;
            self.inner.cond.notify_all();
            std::mem::take(&mut queue.jobs)
        };
        // Dropped outside the lock: drop glue may post to other strands.
        drop(dropped);
    }

}

/// Keep-alive token for an actor loop.
pub(crate) struct WorkGuard {
    inner: Arc<StrandInner>,
}

impl Clone for WorkGuard {
    fn clone(&self) -> Self {
        let mut queue = self.inner.queue.lock().unwrap();
        queue.guards += 1;
        drop(queue);
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        let mut queue = self.inner.queue.lock().unwrap();
        queue.guards -= 1;
        if queue.guards == 0 {
            self.inner.cond.notify_all();
        }
    }
}

impl std::fmt::Debug for Strand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Strand").finish_non_exhaustive()
    }
}

impl std::fmt::Debug for WorkGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkGuard").finish_non_exhaustive()
    }
}
