//! Per-session FIFO "lane" serialization layered over a `taskrt_thread`
//! worker pool.
//!
//! Callers submit `(session, lane)` pairs through [`Executor::request`].
//! Within one lane, sessions execute in strict submission order; across
//! lanes, order is unconstrained and every worker in the underlying pool
//! may be busy with a different lane at once. A lane only ever occupies
//! one worker at a time — enqueueing its head is enough to guarantee
//! forward progress, because the head task reschedules the lane's next
//! entry onto the pool before it starts running its own session.

mod executor;
mod subtask;

pub use executor::{ExecQueue, ExecSession, Executor, ExecutorError, SessionState};
pub use subtask::{ParallelTask, SubTask};
