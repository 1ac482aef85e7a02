//! Outbound replication buffer.
//!
//! Holds locally-originated operations while the publish connection is
//! unusable. The queue is only ever drained whole, oldest first.

use std::collections::VecDeque;
use synset_protocol::Operation;
use tracing::warn;

/// FIFO of operations waiting to be forwarded.
pub struct OutboundBuffer<T> {
    queue: VecDeque<Operation<T>>,
    warn_threshold: usize,
}

impl<T> OutboundBuffer<T> {
    /// Creates an empty buffer.
    pub fn new(warn_threshold: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            warn_threshold,
        }
    }

    /// Appends an operation to the tail.
    pub fn push(&mut self, op: Operation<T>) {
        self.queue.push_back(op);
        if self.queue.len() == self.warn_threshold {
            warn!(queued = self.queue.len(), "outbound queue is growing while disconnected");
        }
    }

    /// Takes every queued operation, leaving the buffer empty.
    pub fn drain(&mut self) -> Vec<Operation<T>> {
        self.queue.drain(..).collect()
    }

    /// Puts operations back at the head, keeping their order.
    pub fn requeue_front(&mut self, ops: Vec<Operation<T>>) {
        for op in ops.into_iter().rev() {
            self.queue.push_front(op);
        }
    }

    /// Returns the number of queued operations.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Returns true once the queue has grown to the warning threshold.
    pub fn reached_warn_threshold(&self) -> bool {
        self.queue.len() >= self.warn_threshold
    }
}
