//! A bounded, blocking, multi-producer/multi-consumer queue built on a
//! two-list swap discipline.
//!
//! Producers and consumers each have their own mutex and condition
//! variable. In steady state a producer only ever touches the put side
//! and a consumer only ever touches the get side, so the two never
//! contend on the same lock. Contention is confined to the moment the
//! consumer side drains and the two sides must be swapped.
//!
//! # Examples
//! ```
//! use std::num::NonZeroUsize;
//! use taskrt_queue::MessageQueue;
//!
//! let queue = MessageQueue::new(NonZeroUsize::new(4).unwrap());
//! queue.put(1);
//! queue.put(2);
//! assert_eq!(queue.get(), Some(1));
//! assert_eq!(queue.get(), Some(2));
//! ```

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::cell::Cell;
use std::collections::VecDeque;
use std::mem;
use std::num::NonZeroUsize;

/// The cause of a failed, non-blocking [`MessageQueue::get`].
///
/// Mirrors the errno-style out-of-band error channel used throughout this
/// crate family: functions return a plain `Option`/`Result`, and the more
/// specific cause (when there is one) is left in thread-local storage for
/// the caller to inspect if it cares.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueError {
    /// `get` was called in non-blocking mode and there was nothing to
    /// return.
    NoEntry,
}

thread_local! {
    static LAST_ERROR: Cell<Option<QueueError>> = const { Cell::new(None) };
}

/// Returns and clears the error left behind by the most recent failed call
/// to [`MessageQueue::get`] on this thread.
pub fn take_last_error() -> Option<QueueError> {
    LAST_ERROR.with(Cell::take)
}

fn set_last_error(err: QueueError) {
    LAST_ERROR.with(|cell| cell.set(Some(err)));
}

/// Put-side state: the producer chain plus the non-blocking flag. Both are
/// protected by the same mutex, since a swap must observe them together.
struct PutSide<T> {
    queue: VecDeque<T>,
    nonblock: bool,
}

/// A bounded, blocking FIFO queue meant to be shared between many
/// producer and consumer threads.
///
/// `T` is the message type. Unlike the intrusive, embedded-link queue this
/// design is descended from, `MessageQueue<T>` owns its storage directly
/// (see `DESIGN.md` for why the embedded-link/`linkoff` mechanism does not
/// carry over to safe Rust): the two chains are plain [`VecDeque`]s and the
/// "swap" is a `mem::swap`, which is the same O(1) handover the original
/// intrusive pointer shuffle achieved, just without raw pointers.
pub struct MessageQueue<T> {
    get_side: Mutex<VecDeque<T>>,
    put_side: Mutex<PutSide<T>>,
    /// Signaled by `put` (and `set_nonblock`); waited on by `swap`, which
    /// runs on the consumer's behalf but takes the *put* mutex to do so.
    get_cond: Condvar,
    /// Signaled by `swap` (when it just freed up capacity) and by
    /// `set_nonblock`; waited on by `put` when the queue is full.
    put_cond: Condvar,
    max: usize,
}

impl<T> MessageQueue<T> {
    /// Creates a queue that blocks producers once `max` messages are
    /// buffered.
    pub fn new(max: NonZeroUsize) -> Self {
        Self::with_max(max.get())
    }

    /// Creates a queue with no effective upper bound. Used internally by
    /// the worker pool, whose task queue should never make a caller block
    /// on `schedule`.
    pub fn unbounded() -> Self {
        Self::with_max(usize::MAX)
    }

    fn with_max(max: usize) -> Self {
        Self {
            get_side: Mutex::new(VecDeque::new()),
            put_side: Mutex::new(PutSide {
                queue: VecDeque::new(),
                nonblock: false,
            }),
            get_cond: Condvar::new(),
            put_cond: Condvar::new(),
            max,
        }
    }

    /// Appends `msg` to the queue, blocking while it is at capacity unless
    /// the queue has been set non-blocking, in which case capacity is
    /// ignored and the message is always accepted (this is the shutdown
    /// path: producers must never be made to wait forever while a pool is
    /// draining).
    pub fn put(&self, msg: T) {
        let mut put_side = self.put_side.lock();
        while put_side.queue.len() >= self.max && !put_side.nonblock {
            self.put_cond.wait(&mut put_side);
        }
        put_side.queue.push_back(msg);
        drop(put_side);
        self.get_cond.notify_one();
    }

    /// Removes and returns the message at the head of the queue, blocking
    /// until one is available unless the queue is non-blocking.
    ///
    /// Returns `None` if the queue is non-blocking and empty; in that case
    /// [`take_last_error`] will return `Some(QueueError::NoEntry)`.
    pub fn get(&self) -> Option<T> {
        let mut get_side = self.get_side.lock();
        if let Some(msg) = get_side.pop_front() {
            return Some(msg);
        }
        if self.swap(&mut get_side) > 0 {
            get_side.pop_front()
        } else {
            set_last_error(QueueError::NoEntry);
            None
        }
    }

    /// Promotes the producer chain to become the consumer chain. Called
    /// only while `get_side` is held; internally takes the put mutex,
    /// which is the sole point where the two sides meet.
    ///
    /// Returns the number of messages now available to the consumer.
    fn swap(&self, get_side: &mut MutexGuard<'_, VecDeque<T>>) -> usize {
        let mut put_side = self.put_side.lock();
        while put_side.queue.is_empty() && !put_side.nonblock {
            self.get_cond.wait(&mut put_side);
        }

        let cnt = put_side.queue.len();
        if cnt > self.max.saturating_sub(1) {
            // The producer side was saturated; draining it just freed up
            // capacity, so wake everyone blocked in `put`.
            self.put_cond.notify_all();
        }

        mem::swap(&mut **get_side, &mut put_side.queue);
        cnt
    }

    /// Puts the queue into non-blocking mode: `put` never waits for
    /// capacity and `get` never waits for a message, returning `None`
    /// instead. Used to unblock every thread stuck in `get` or `put`
    /// during shutdown.
    pub fn set_nonblock(&self) {
        taskrt_log::trace!("Setting message queue to non-blocking mode");
        let mut put_side = self.put_side.lock();
        put_side.nonblock = true;
        self.get_cond.notify_one();
        self.put_cond.notify_all();
    }

    /// Restores blocking mode.
    ///
    /// # Restrictions
    /// Not safe to call concurrently with other operations on the same
    /// queue; call only when quiescent (no in-flight `get`/`put`).
    pub fn set_block(&self) {
        self.put_side.lock().nonblock = false;
    }
}

impl<T> std::fmt::Debug for MessageQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageQueue").field("max", &self.max).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn put_then_get_round_trips_in_order() {
        let q = MessageQueue::new(NonZeroUsize::new(8).unwrap());
        q.put(1);
        q.put(2);
        q.put(3);
        assert_eq!(q.get(), Some(1));
        assert_eq!(q.get(), Some(2));
        assert_eq!(q.get(), Some(3));
    }

    #[test]
    fn nonblocking_get_on_empty_unbounded_queue_returns_none_with_no_entry() {
        let q: MessageQueue<i32> = MessageQueue::unbounded();
        q.set_nonblock();
        assert_eq!(q.get(), None);
        assert_eq!(take_last_error(), Some(QueueError::NoEntry));
    }

    #[test]
    fn quiescent_put_get_balance_holds() {
        let q = Arc::new(MessageQueue::new(NonZeroUsize::new(100).unwrap()));
        for i in 0..50 {
            q.put(i);
        }
        let mut received = Vec::new();
        while let Some(v) = {
            q.set_nonblock();
            let v = q.get();
            q.set_block();
            v
        } {
            received.push(v);
        }
        assert_eq!(received, (0..50).collect::<Vec<_>>());
    }

    // Scenario 3 from the testable-properties list: bounded queue with
    // concurrent producers that block on capacity, drained by a single
    // consumer after a delay.
    #[test]
    fn blocked_producers_all_eventually_succeed() {
        let q = Arc::new(MessageQueue::new(NonZeroUsize::new(2).unwrap()));

        let producers: Vec<_> = (0..3)
            .map(|i| {
                let q = Arc::clone(&q);
                thread::spawn(move || q.put(i))
            })
            .collect();

        thread::sleep(Duration::from_millis(100));

        let mut received = Vec::new();
        for _ in 0..3 {
            received.push(q.get().unwrap());
        }

        for producer in producers {
            producer.join().unwrap();
        }

        received.sort_unstable();
        assert_eq!(received, vec![0, 1, 2]);
    }

    #[test]
    fn one_blocked_producer_proceeds_after_a_single_drain() {
        let q = Arc::new(MessageQueue::new(NonZeroUsize::new(1).unwrap()));
        q.put(0);

        let q2 = Arc::clone(&q);
        let producer = thread::spawn(move || q2.put(1));

        // Give the producer a chance to block on capacity.
        thread::sleep(Duration::from_millis(50));

        assert_eq!(q.get(), Some(0));
        producer.join().unwrap();
        assert_eq!(q.get(), Some(1));
    }

    #[test]
    fn set_nonblock_wakes_a_get_blocked_in_swap() {
        let q = Arc::new(MessageQueue::<i32>::unbounded());
        let q2 = Arc::clone(&q);
        let getter = thread::spawn(move || q2.get());

        thread::sleep(Duration::from_millis(50));
        q.set_nonblock();

        assert_eq!(getter.join().unwrap(), None);
    }

    #[test]
    fn single_producer_single_consumer_preserves_order() {
        let q = Arc::new(MessageQueue::new(NonZeroUsize::new(16).unwrap()));
        let q2 = Arc::clone(&q);

        let producer = thread::spawn(move || {
            for i in 0..200 {
                q2.put(i);
            }
        });

        let mut received = Vec::with_capacity(200);
        while received.len() < 200 {
            if let Some(v) = q.get() {
                received.push(v);
            }
        }

        producer.join().unwrap();
        assert_eq!(received, (0..200).collect::<Vec<_>>());
    }
}
