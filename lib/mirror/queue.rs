use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{trace, warn};

use super::MirrorOperation;

struct State {
    ops: VecDeque<MirrorOperation>,
    closed: bool,
    /// Whether the depth warning has fired since the queue last dropped below the threshold.
    warned: bool,
}

/// Unbounded, multi-producer multi-consumer FIFO of [`MirrorOperation`]s.
///
/// Producers never block on consumers and `enqueue` never fails. Consumers block in
/// [`dequeue_blocking`](Self::dequeue_blocking) until an operation is available. The queue lives
/// in memory only: whatever is still queued when the process exits is lost.
///
/// Growth is unbounded. When the depth reaches `warn_depth` a warning is logged once per
/// crossing so a stalled slow tier is visible in the logs.
pub struct MirrorQueue {
    state: Mutex<State>,
    available: Condvar,
    warn_depth: usize,
}

impl MirrorQueue {
    /// Depth at which a queue built with [`MirrorQueue::new`] starts warning.
    pub const DEFAULT_WARN_DEPTH: usize = 10_000;

    /// Empty queue warning at [`MirrorQueue::DEFAULT_WARN_DEPTH`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_warn_depth(Self::DEFAULT_WARN_DEPTH)
    }

    /// Empty queue warning once `warn_depth` operations are pending.
    #[must_use]
    pub fn with_warn_depth(warn_depth: usize) -> Self {
        Self {
            state: Mutex::new(State {
                ops: VecDeque::new(),
                closed: false,
                warned: false,
            }),
            available: Condvar::new(),
            warn_depth,
        }
    }

    /// Append an operation to the tail and wake one waiting consumer.
    ///
    /// Operations enqueued after [`close`](Self::close) are still accepted and delivered to any
    /// consumer that keeps draining.
    pub fn enqueue(&self, op: MirrorOperation) {
        let mut state = self.state.lock();
        trace!(%op, depth = state.ops.len() + 1, "enqueue");
        state.ops.push_back(op);

        let depth = state.ops.len();
        if depth >= self.warn_depth && !state.warned {
            state.warned = true;
            warn!(
                depth,
                "mirror queue is backing up; the slow tier may be unavailable"
            );
        }
        drop(state);

        self.available.notify_one();
    }

    /// Put an operation that was dequeued but not applied back at the head.
    ///
    /// The head is used, not the tail, so that operations queued after it still run after it.
    pub fn requeue_front(&self, op: MirrorOperation) {
        let mut state = self.state.lock();
        trace!(%op, "requeue");
        state.ops.push_front(op);
        drop(state);

        self.available.notify_one();
    }

    /// Block until an operation is available and remove it from the head.
    ///
    /// Returns `None` only once the queue has been closed and fully drained.
    pub fn dequeue_blocking(&self) -> Option<MirrorOperation> {
        let mut state = self.state.lock();
        loop {
            if let Some(op) = Self::pop(&mut state, self.warn_depth) {
                return Some(op);
            }
            if state.closed {
                return None;
            }
            self.available.wait(&mut state);
        }
    }

    /// Like [`dequeue_blocking`](Self::dequeue_blocking), but gives up after `timeout`.
    pub fn dequeue_timeout(&self, timeout: Duration) -> Option<MirrorOperation> {
        let mut state = self.state.lock();
        loop {
            if let Some(op) = Self::pop(&mut state, self.warn_depth) {
                return Some(op);
            }
            if state.closed || self.available.wait_for(&mut state, timeout).timed_out() {
                return Self::pop(&mut state, self.warn_depth);
            }
        }
    }

    /// Remove the head without blocking.
    pub fn try_dequeue(&self) -> Option<MirrorOperation> {
        Self::pop(&mut self.state.lock(), self.warn_depth)
    }

    fn pop(state: &mut State, warn_depth: usize) -> Option<MirrorOperation> {
        let op = state.ops.pop_front()?;
        if state.ops.len() < warn_depth {
            state.warned = false;
        }
        Some(op)
    }

    /// Close the queue. Every blocked consumer wakes up, and once the queue is empty
    /// [`dequeue_blocking`](Self::dequeue_blocking) returns `None`.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        drop(state);

        self.available.notify_all();
    }

    /// Whether [`MirrorQueue::close`] was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Pending operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().ops.len()
    }

    /// No operation is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().ops.is_empty()
    }

    /// Copy of the pending operations, head first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<MirrorOperation> {
        self.state.lock().ops.iter().cloned().collect()
    }
}

impl Default for MirrorQueue {
    fn default() -> Self {
        Self::new()
    }
}
