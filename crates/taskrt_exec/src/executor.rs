//! [`Executor`] and its lanes ([`ExecQueue`]).

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::{Arc, Weak};

use taskrt_thread::{Task, ThreadPoolError, WorkerPool};

/// Why a session's `execute` call ran, as reported to [`ExecSession::handle`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// `execute()` ran to completion.
    Finished,
    /// The session was still queued in its lane when the executor was
    /// torn down and was never executed.
    Canceled,
}

/// The work a caller hands to an [`Executor`].
///
/// `set_queue` is called once, at submission time, with a non-owning
/// handle to the lane the session was submitted on. Nothing in this crate
/// reads it back; it exists so that downstream consumers of a session can
/// recover which lane it belongs to.
pub trait ExecSession: Send {
    /// Runs the session's work. Called outside any lane lock.
    fn execute(&mut self);

    /// Notified exactly once with the outcome of this session.
    fn handle(&mut self, state: SessionState, error: i32);

    /// Records the lane this session was submitted on.
    fn set_queue(&mut self, queue: Weak<ExecQueue>);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutorError {
    /// `Executor::new(0)` was called.
    InvalidWorkerCount,
    /// The underlying worker pool could not be created.
    PoolCreationFailed,
    /// The lane's head task could not be submitted to the pool.
    SchedulingFailed,
}

impl fmt::Display for ExecutorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidWorkerCount => write!(f, "executor requires at least one worker thread"),
            Self::PoolCreationFailed => write!(f, "failed to create the underlying worker pool"),
            Self::SchedulingFailed => write!(f, "failed to schedule the lane head task"),
        }
    }
}

impl std::error::Error for ExecutorError {}

impl From<ThreadPoolError> for ExecutorError {
    fn from(_: ThreadPoolError) -> Self {
        Self::SchedulingFailed
    }
}

struct ExecTaskEntry {
    session: Box<dyn ExecSession>,
}

struct LaneState {
    tasks: VecDeque<ExecTaskEntry>,
}

/// A lane: an ordered channel of sessions that execute one at a time, in
/// submission order, each possibly on a different worker.
///
/// A lane is "active" (has a trampoline task in flight or queued on the
/// pool) iff its task list is non-empty; [`Executor::request`] is what
/// starts a trampoline, and the trampoline itself keeps the chain alive
/// by rescheduling before it runs the session it just popped.
pub struct ExecQueue {
    state: Mutex<LaneState>,
}

impl ExecQueue {
    /// Creates a new, empty lane.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(LaneState {
                tasks: VecDeque::new(),
            }),
        })
    }
}

impl fmt::Debug for ExecQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = self.state.lock().tasks.len();
        f.debug_struct("ExecQueue").field("pending", &len).finish()
    }
}

/// Layers per-lane FIFO serialization on top of a [`WorkerPool`].
///
/// # Examples
/// ```
/// use std::sync::{Arc, Mutex, Weak};
/// use taskrt_exec::{ExecQueue, ExecSession, Executor, SessionState};
///
/// struct Recorder {
///     name: &'static str,
///     out: Arc<Mutex<Vec<&'static str>>>,
/// }
///
/// impl ExecSession for Recorder {
///     fn execute(&mut self) {
///         self.out.lock().unwrap().push(self.name);
///     }
///     fn handle(&mut self, _state: SessionState, _error: i32) {}
///     fn set_queue(&mut self, _queue: Weak<ExecQueue>) {}
/// }
///
/// let executor = Executor::new(2).unwrap();
/// let lane = ExecQueue::new();
/// let out = Arc::new(Mutex::new(Vec::new()));
///
/// for name in ["a", "b", "c"] {
///     let session = Recorder { name, out: Arc::clone(&out) };
///     executor.request(Box::new(session), &lane).unwrap();
/// }
/// ```
pub struct Executor {
    pool: WorkerPool,
}

impl Executor {
    /// Creates an executor backed by a pool of `nthreads` workers.
    ///
    /// # Errors
    /// Returns [`ExecutorError::InvalidWorkerCount`] if `nthreads` is 0.
    pub fn new(nthreads: usize) -> Result<Self, ExecutorError> {
        let nthreads = NonZeroUsize::new(nthreads).ok_or(ExecutorError::InvalidWorkerCount)?;
        let pool = WorkerPool::new(nthreads, 0).map_err(|_| ExecutorError::PoolCreationFailed)?;
        Ok(Self { pool })
    }

    /// Submits `session` on `lane`.
    ///
    /// Sets the session's queue back-pointer, appends it to the lane, and,
    /// if the lane was previously empty, schedules a trampoline task onto
    /// the pool. If that scheduling fails the just-appended entry is
    /// removed before returning the error.
    pub fn request(
        &self,
        mut session: Box<dyn ExecSession>,
        lane: &Arc<ExecQueue>,
    ) -> Result<(), ExecutorError> {
        session.set_queue(Arc::downgrade(lane));
        let entry = ExecTaskEntry { session };

        let became_head = {
            let mut state = lane.state.lock();
            let became_head = state.tasks.is_empty();
            state.tasks.push_back(entry);
            became_head
        };

        if became_head {
            if let Err(err) = schedule_trampoline(&self.pool, Arc::clone(lane)) {
                lane.state.lock().tasks.pop_front();
                return Err(err);
            }
        }

        Ok(())
    }
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor").finish_non_exhaustive()
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        // Every trampoline task carries its own cancellation closure (see
        // `schedule_trampoline`), so the pool needs no pending callback of
        // its own to drain lanes correctly.
        self.pool.destroy(None);
    }
}

fn schedule_trampoline(pool: &WorkerPool, lane: Arc<ExecQueue>) -> Result<(), ExecutorError> {
    taskrt_log::trace!("scheduling lane trampoline");
    let run_lane = Arc::clone(&lane);
    let run_pool = pool.clone();
    let cancel_lane_handle = Arc::clone(&lane);
    let task = Task::with_cancel(
        move || run_trampoline(run_lane, run_pool),
        move || cancel_lane(&cancel_lane_handle),
    );
    pool.schedule(task)?;
    Ok(())
}

/// Pops one entry from `lane`, reschedules the next one (if any) before
/// running the popped session, then runs it outside the lane lock.
///
/// The reschedule happens first so that as long as the lane has
/// successors, another worker is already eligible to pick them up by the
/// time this worker starts executing its own session — the lane keeps
/// moving without this call ever holding the lane mutex across
/// `execute()`.
fn run_trampoline(lane: Arc<ExecQueue>, pool: WorkerPool) {
    let (mut entry, has_more) = {
        let mut state = lane.state.lock();
        let entry = state
            .tasks
            .pop_front()
            .expect("trampoline scheduled for an empty lane");
        (entry, !state.tasks.is_empty())
    };

    if has_more {
        if schedule_trampoline(&pool, Arc::clone(&lane)).is_err() {
            // The pool is shutting down underneath us and would not have
            // accepted this task to drain later either; cancel what's
            // left of the lane directly instead of leaving it stranded.
            cancel_lane(&lane);
        }
    }

    entry.session.execute();
    entry.session.handle(SessionState::Finished, 0);
}

/// Drains every entry still queued on `lane` and reports it canceled.
///
/// Because a lane has at most one trampoline in the pool's queue at a
/// time, canceling that trampoline is equivalent to canceling the whole
/// remaining lane.
fn cancel_lane(lane: &Arc<ExecQueue>) {
    let entries: Vec<_> = lane.state.lock().tasks.drain(..).collect();
    for mut entry in entries {
        entry.session.handle(SessionState::Canceled, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::thread;
    use std::time::Duration;

    struct Recorder {
        name: &'static str,
        log: Arc<StdMutex<Vec<(&'static str, SessionState)>>>,
        queue: Option<Weak<ExecQueue>>,
    }

    impl Recorder {
        fn new(name: &'static str, log: Arc<StdMutex<Vec<(&'static str, SessionState)>>>) -> Self {
            Self {
                name,
                log,
                queue: None,
            }
        }
    }

    impl ExecSession for Recorder {
        fn execute(&mut self) {
            thread::sleep(Duration::from_millis(5));
        }

        fn handle(&mut self, state: SessionState, _error: i32) {
            self.log.lock().unwrap().push((self.name, state));
        }

        fn set_queue(&mut self, queue: Weak<ExecQueue>) {
            self.queue = Some(queue);
        }
    }

    // Concrete scenario 2 / invariant 2: per-lane order is preserved while
    // lanes interleave freely.
    #[test]
    fn sessions_execute_in_submission_order_within_a_lane() {
        let executor = Executor::new(2).unwrap();
        let lane_a = ExecQueue::new();
        let lane_b = ExecQueue::new();
        let log = Arc::new(StdMutex::new(Vec::new()));

        executor
            .request(Box::new(Recorder::new("a1", Arc::clone(&log))), &lane_a)
            .unwrap();
        executor
            .request(Box::new(Recorder::new("a2", Arc::clone(&log))), &lane_a)
            .unwrap();
        executor
            .request(Box::new(Recorder::new("a3", Arc::clone(&log))), &lane_a)
            .unwrap();
        executor
            .request(Box::new(Recorder::new("b1", Arc::clone(&log))), &lane_b)
            .unwrap();
        executor
            .request(Box::new(Recorder::new("b2", Arc::clone(&log))), &lane_b)
            .unwrap();

        drop(executor);

        let log = log.lock().unwrap();
        let a_seq: Vec<_> = log
            .iter()
            .filter(|(name, _)| name.starts_with('a'))
            .map(|(name, _)| *name)
            .collect();
        let b_seq: Vec<_> = log
            .iter()
            .filter(|(name, _)| name.starts_with('b'))
            .map(|(name, _)| *name)
            .collect();

        assert_eq!(a_seq, vec!["a1", "a2", "a3"]);
        assert_eq!(b_seq, vec!["b1", "b2"]);
        assert_eq!(log.len(), 5);
    }

    struct Blocking {
        barrier: Arc<std::sync::Barrier>,
    }

    impl ExecSession for Blocking {
        fn execute(&mut self) {
            self.barrier.wait();
        }
        fn handle(&mut self, _state: SessionState, _error: i32) {}
        fn set_queue(&mut self, _queue: Weak<ExecQueue>) {}
    }

    // Concrete scenario 5: tearing down the executor mid-lane delivers a
    // FINISHED/CANCELED split whose total is exactly the request count.
    #[test]
    fn shutdown_mid_lane_splits_into_finished_and_canceled() {
        let executor = Executor::new(2).unwrap();
        let lane = ExecQueue::new();
        let log: Arc<StdMutex<Vec<(&'static str, SessionState)>>> =
            Arc::new(StdMutex::new(Vec::new()));

        // Block the lane on its first entry so the remaining four are
        // still queued (not yet trampolined) when we tear the executor
        // down underneath them.
        let barrier = Arc::new(std::sync::Barrier::new(2));
        executor
            .request(
                Box::new(Blocking {
                    barrier: Arc::clone(&barrier),
                }),
                &lane,
            )
            .unwrap();

        for name in ["s2", "s3", "s4", "s5"] {
            executor
                .request(Box::new(Recorder::new(name, Arc::clone(&log))), &lane)
                .unwrap();
        }

        barrier.wait();
        drop(executor);

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 4);
        let finished = log
            .iter()
            .filter(|(_, s)| *s == SessionState::Finished)
            .count();
        let canceled = log
            .iter()
            .filter(|(_, s)| *s == SessionState::Canceled)
            .count();
        assert_eq!(finished + canceled, 4);
    }

    #[test]
    fn zero_workers_is_rejected() {
        let err = Executor::new(0).unwrap_err();
        assert_eq!(err, ExecutorError::InvalidWorkerCount);
    }
}
