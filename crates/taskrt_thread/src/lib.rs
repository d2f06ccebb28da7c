//! A fixed-size pool of worker threads that pull tasks from a shared
//! [`MessageQueue`] and run them.
//!
//! The pool can be destroyed from an arbitrary caller thread or from a
//! task running inside one of its own workers. The latter case ("in-pool
//! self-destruction") is the one piece of this crate that needs a thread
//! local: a worker that calls `destroy` on its own pool must not join
//! itself, so it detaches from the pool's bookkeeping before waiting for
//! its peers and leaves the final cleanup to its own `worker_loop`, which
//! notices the thread count has already reached zero and simply returns.
//!
//! # Examples
//! ```
//! use std::num::NonZeroUsize;
//! use std::sync::{Arc, Mutex};
//! use taskrt_thread::{Task, WorkerPool};
//!
//! let pool = WorkerPool::new(NonZeroUsize::new(4).unwrap(), 0).unwrap();
//! let total = Arc::new(Mutex::new(0));
//!
//! for _ in 0..100 {
//!     let total = Arc::clone(&total);
//!     pool.schedule(Task::new(move || *total.lock().unwrap() += 1)).unwrap();
//! }
//!
//! pool.destroy(None);
//! assert_eq!(*total.lock().unwrap(), 100);
//! ```

use parking_lot::{Condvar, Mutex};
use std::cell::Cell;
use std::fmt;
use std::num::NonZeroUsize;
use std::panic;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use taskrt_queue::MessageQueue;

/// A unit of work handed to a [`WorkerPool`].
///
/// A `Task` carries the closure a worker runs, plus an optional closure
/// run instead if the task is still queued when the pool is destroyed.
/// Baking cancellation into the task itself is what lets
/// [`WorkerPool::destroy`]'s drain loop stay generic: it never needs to
/// know what a task represents, only how to cancel it.
#[allow(clippy::type_complexity)]
pub struct Task {
    run: Box<dyn FnOnce() + Send + 'static>,
    cancel: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl Task {
    /// Creates a task with no cancellation behavior: if it is still
    /// queued at shutdown, it is silently dropped.
    pub fn new(run: impl FnOnce() + Send + 'static) -> Self {
        Self {
            run: Box::new(run),
            cancel: None,
        }
    }

    /// Creates a task that runs `cancel` instead of `run` if it is still
    /// queued (not yet picked up by a worker) when the pool is destroyed.
    pub fn with_cancel(
        run: impl FnOnce() + Send + 'static,
        cancel: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            run: Box::new(run),
            cancel: Some(Box::new(cancel)),
        }
    }

    fn execute(self) {
        (self.run)()
    }

    /// Runs this task's cancellation closure, if it has one. Called by
    /// [`WorkerPool::destroy`] on every task still sitting in the queue.
    pub fn cancel(self) {
        if let Some(cancel) = self.cancel {
            cancel();
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task").finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadPoolError {
    /// A worker thread could not be spawned (OS resource exhaustion).
    SpawnFailed,
    /// `schedule` was called after `destroy` had already started.
    TaskScheduledDuringShutdown,
}

impl fmt::Display for ThreadPoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SpawnFailed => write!(f, "failed to spawn a worker thread"),
            Self::TaskScheduledDuringShutdown => {
                write!(f, "task scheduled while the pool was shutting down")
            }
        }
    }
}

impl std::error::Error for ThreadPoolError {}

struct PoolState {
    nthreads: usize,
    workers: Vec<(ThreadId, JoinHandle<()>)>,
}

struct PoolInner {
    queue: MessageQueue<Task>,
    state: Mutex<PoolState>,
    terminate_cond: Condvar,
    destroyed: AtomicBool,
    stack_size: usize,
}

thread_local! {
    static CURRENT_POOL: Cell<Option<usize>> = const { Cell::new(None) };
}

/// A fixed-size set of worker threads consuming [`Task`]s from a shared
/// unbounded [`MessageQueue`].
///
/// Cloning a `WorkerPool` is cheap (it is an `Arc` handle) and is how a
/// task gets a handle to the pool it is running on, for the in-pool
/// self-destruction case.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Creates a pool of `nthreads` workers, each with a stack of
    /// `stack_size` bytes (0 uses the platform default).
    ///
    /// If a worker thread fails to spawn partway through construction,
    /// the already-spawned workers are drained and joined before
    /// returning the error.
    pub fn new(nthreads: NonZeroUsize, stack_size: usize) -> Result<Self, ThreadPoolError> {
        let inner = Arc::new(PoolInner {
            queue: MessageQueue::unbounded(),
            state: Mutex::new(PoolState {
                nthreads: 0,
                workers: Vec::with_capacity(nthreads.get()),
            }),
            terminate_cond: Condvar::new(),
            destroyed: AtomicBool::new(false),
            stack_size,
        });
        let pool = Self { inner };

        for _ in 0..nthreads.get() {
            match pool.spawn_worker() {
                Ok(worker) => {
                    let mut state = pool.inner.state.lock();
                    state.nthreads += 1;
                    state.workers.push(worker);
                }
                Err(err) => {
                    pool.terminate(false);
                    return Err(err);
                }
            }
        }

        Ok(pool)
    }

    /// Schedules `task` to run on the next free worker.
    pub fn schedule(&self, task: Task) -> Result<(), ThreadPoolError> {
        if self.inner.destroyed.load(Ordering::Acquire) {
            return Err(ThreadPoolError::TaskScheduledDuringShutdown);
        }
        self.inner.queue.put(task);
        Ok(())
    }

    /// Spawns one additional worker thread.
    pub fn increase(&self) -> Result<(), ThreadPoolError> {
        let worker = self.spawn_worker()?;
        let mut state = self.inner.state.lock();
        state.nthreads += 1;
        state.workers.push(worker);
        Ok(())
    }

    /// Returns true iff the calling thread is one of this pool's workers.
    pub fn in_pool(&self) -> bool {
        CURRENT_POOL.with(|cell| cell.get() == Some(self.id()))
    }

    /// Shuts the pool down: wakes every worker blocked waiting for work,
    /// waits for all in-flight tasks to finish, joins every worker thread,
    /// then runs `pending_cb` (if given) over every task that was still
    /// queued.
    ///
    /// May be called from a task running inside the pool itself. Calling
    /// it more than once is a safe no-op after the first call.
    pub fn destroy(&self, pending_cb: Option<&dyn Fn(Task)>) {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }

        let in_pool = self.in_pool();
        self.terminate(in_pool);

        self.inner.queue.set_nonblock();
        while let Some(task) = self.inner.queue.get() {
            if let Some(cb) = pending_cb {
                cb(task);
            } else {
                task.cancel();
            }
        }
    }

    fn id(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    fn spawn_worker(&self) -> Result<(ThreadId, JoinHandle<()>), ThreadPoolError> {
        let inner = Arc::clone(&self.inner);
        let pool_id = self.id();
        thread::Builder::new()
            .stack_size(inner.stack_size.max(1))
            .spawn(move || worker_loop(inner, pool_id))
            .map(|handle| (handle.thread().id(), handle))
            .map_err(|_| ThreadPoolError::SpawnFailed)
    }

    /// Wakes every worker and waits until the thread count reaches zero,
    /// then joins whatever worker handles remain.
    ///
    /// When `in_pool` is true the calling thread is itself one of the
    /// workers being torn down: it removes its own handle from the join
    /// list and decrements the count on its own behalf before waiting, so
    /// it never attempts to join itself. Its own `worker_loop` notices the
    /// count has reached zero once this call returns and exits quietly.
    fn terminate(&self, in_pool: bool) {
        self.inner.queue.set_nonblock();

        let mut state = self.inner.state.lock();
        if in_pool {
            let this_id = thread::current().id();
            state.workers.retain(|(id, _)| *id != this_id);
            state.nthreads = state.nthreads.saturating_sub(1);
        }
        while state.nthreads > 0 {
            self.inner.terminate_cond.wait(&mut state);
        }
        let workers = std::mem::take(&mut state.workers);
        drop(state);

        for (_, handle) in workers {
            let _ = handle.join();
        }
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let nthreads = self.inner.state.lock().nthreads;
        f.debug_struct("WorkerPool").field("nthreads", &nthreads).finish()
    }
}

fn worker_loop(pool: Arc<PoolInner>, pool_id: usize) {
    CURRENT_POOL.with(|cell| cell.set(Some(pool_id)));

    loop {
        let task = match pool.queue.get() {
            Some(task) => task,
            None => break,
        };

        if panic::catch_unwind(panic::AssertUnwindSafe(|| task.execute())).is_err() {
            taskrt_log::error!("worker task panicked");
        }

        // If the task just destroyed this pool from within, `terminate`
        // already accounted for this thread; there is nothing left to do
        // but return without touching pool state again.
        if pool.state.lock().nthreads == 0 {
            return;
        }
    }

    let mut state = pool.state.lock();
    state.nthreads -= 1;
    let done = state.nthreads == 0;
    drop(state);
    if done {
        pool.terminate_cond.notify_all();
    }
}
