//! A bounded, byte-budgeted LIFO work queue.

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

/// Errors from [`LifoQueue::push`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PushError {
    /// The queue has been closed and the push did not opt into it.
    #[error("queue is closed")]
    Closed,

    /// The entry does not fit, and eviction was either disabled or could not
    /// make enough room.
    #[error("entry does not fit in the queue")]
    Full,
}

/// Error from [`LifoQueue::get`] once the queue is closed and drained.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("queue is closed")]
pub struct Closed;

struct Shared<T> {
    items: VecDeque<(T, usize)>,
    used: usize,
    closed: bool,
}

/// A bounded work queue that hands out the freshest entry first.
///
/// Capacity is accounted in caller-declared bytes rather than entry counts.
/// When a pushed entry does not fit, the *oldest* entries are evicted to make
/// room: for telemetry-shaped workloads the newest data is the most valuable,
/// so a slow consumer sheds the stalest work. Evicted and otherwise discarded
/// payloads are released by their `Drop` impl.
pub struct LifoQueue<T> {
    shared: Mutex<Shared<T>>,
    available: Condvar,
    capacity: usize,
}

impl<T> LifoQueue<T> {
    /// Creates a new `LifoQueue` holding at most `capacity` bytes.
    pub fn new(capacity: usize) -> LifoQueue<T> {
        LifoQueue {
            shared: Mutex::new(Shared { items: VecDeque::new(), used: 0, closed: false }),
            available: Condvar::new(),
            capacity,
        }
    }

    /// Pushes an entry of the declared `size`.
    ///
    /// When the entry does not fit and `evict_if_full` is set, the oldest
    /// entries are dropped until it does. `allow_when_closed` lets in-flight
    /// producers re-queue work after [`close`](Self::close); ordinary pushes
    /// to a closed queue are rejected.
    pub fn push(
        &self,
        payload: T,
        size: usize,
        evict_if_full: bool,
        allow_when_closed: bool,
    ) -> Result<(), PushError> {
        let mut shared = self.shared.lock();

        if shared.closed && !allow_when_closed {
            return Err(PushError::Closed);
        }
        if size > self.capacity {
            return Err(PushError::Full);
        }

        if shared.used + size > self.capacity {
            if !evict_if_full {
                return Err(PushError::Full);
            }
            while shared.used + size > self.capacity {
                let (stale, stale_size) =
                    shared.items.pop_front().expect("used bytes imply queued entries");
                shared.used -= stale_size;
                drop(stale);
            }
        }

        shared.items.push_back((payload, size));
        shared.used += size;
        drop(shared);

        self.available.notify_one();
        Ok(())
    }

    /// Blocks until an entry is available and returns it with its size.
    ///
    /// After [`close`](Self::close), remaining entries are drained in LIFO
    /// order before every subsequent call reports [`Closed`].
    pub fn get(&self) -> Result<(T, usize), Closed> {
        let mut shared = self.shared.lock();
        loop {
            if let Some((payload, size)) = shared.items.pop_back() {
                shared.used -= size;
                return Ok((payload, size));
            }
            if shared.closed {
                return Err(Closed);
            }
            self.available.wait(&mut shared);
        }
    }

    /// Closes the queue and wakes all blocked consumers.
    pub fn close(&self) {
        let mut shared = self.shared.lock();
        shared.closed = true;
        drop(shared);

        self.available.notify_all();
    }

    /// Whether the queue has been closed.
    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Bytes currently queued.
    pub fn used_bytes(&self) -> usize {
        self.shared.lock().used
    }
}
