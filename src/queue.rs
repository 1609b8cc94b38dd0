//! Bounded packet queue between the receiver and the decode worker
//!
//! A FIFO guarded by a mutex and a condition variable. Producers never block:
//! once the queue holds `capacity` items, every new item evicts the oldest one.
//! Consumers block in [`PacketQueue::dequeue`] until an item arrives or the queue
//! is stopped.
//!
//! ## Usage Example
//!
//! ```rust
//! use lidarcap::queue::PacketQueue;
//! use std::sync::Arc;
//!
//! let queue = Arc::new(PacketQueue::with_capacity(2));
//! queue.enqueue(1);
//! queue.enqueue(2);
//! queue.enqueue(3); // evicts 1
//! assert_eq!(queue.dropped(), 1);
//! assert_eq!(queue.dequeue(), Some(2));
//!
//! queue.stop();
//! assert_eq!(queue.dequeue(), None);
//! queue.enqueue(4); // ignored
//! assert!(queue.is_empty());
//! ```

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

/// Default capacity of live packet queues.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100_000;

const DROP_LOG_INTERVAL: u64 = 10_000;

#[derive(Debug)]
struct State<T> {
    items: VecDeque<T>,
    stopped: bool,
    dropped: u64,
}

/// Thread-safe bounded FIFO with drop-oldest overflow.
#[derive(Debug)]
pub struct PacketQueue<T> {
    state: Mutex<State<T>>,
    available: Condvar,
    capacity: usize,
}

impl<T> Default for PacketQueue<T> {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }
}

impl<T> PacketQueue<T> {
    /// Create a queue holding at most `capacity` items (at least one).
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Mutex::new(State { items: VecDeque::new(), stopped: false, dropped: 0 }),
            available: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    // A panicking holder cannot leave the deque half-modified, so poisoning is ignored.
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append an item without blocking.
    ///
    /// Silently ignored after [`stop`](Self::stop). At capacity the oldest item is
    /// discarded first.
    pub fn enqueue(&self, item: T) {
        let mut state = self.lock();
        if state.stopped {
            return;
        }
        if state.items.len() >= self.capacity {
            state.items.pop_front();
            state.dropped += 1;
            if state.dropped % DROP_LOG_INTERVAL == 1 {
                warn!(
                    dropped = state.dropped,
                    capacity = self.capacity,
                    "Decoder is falling behind, dropping oldest queued packets"
                );
            }
        }
        state.items.push_back(item);
        drop(state);
        self.available.notify_one();
    }

    /// Block until an item is available, or return `None` once stopped.
    pub fn dequeue(&self) -> Option<T> {
        let mut state = self.lock();
        loop {
            if state.stopped {
                return None;
            }
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            state = self.available.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Non-blocking variant of [`dequeue`](Self::dequeue).
    pub fn try_dequeue(&self) -> Option<T> {
        let mut state = self.lock();
        if state.stopped { None } else { state.items.pop_front() }
    }

    /// Enter the terminal state: discard pending items and wake every waiter.
    ///
    /// Calling it again has no effect.
    pub fn stop(&self) {
        let mut state = self.lock();
        if state.stopped {
            return;
        }
        state.stopped = true;
        let discarded = state.items.len();
        state.items.clear();
        drop(state);
        self.available.notify_all();
        debug!(discarded, "Packet queue stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.lock().stopped
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    /// Number of items evicted by the overflow policy so far.
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }
}
