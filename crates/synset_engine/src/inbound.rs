//! Inbound replication buffer and seed-load phase.
//!
//! After every confirmed (re)subscription the full membership is fetched
//! from the store. Broadcasts that arrive while the fetch is in flight are
//! held here and replayed after the fetched baseline has been applied.

use std::collections::VecDeque;
use synset_protocol::Operation;
use tracing::warn;

/// Seed-load phase of the inbound path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedPhase {
    /// Remote operations are applied as they arrive.
    Idle,
    /// A membership fetch is in flight; remote operations are queued.
    LoadingSeed {
        /// Identifies the subscription confirmation that started the load.
        epoch: u64,
    },
}

/// FIFO of remote operations received during a seed load.
pub struct InboundBuffer<T> {
    phase: SeedPhase,
    queue: VecDeque<Operation<T>>,
    last_epoch: u64,
    warn_threshold: usize,
}

impl<T> InboundBuffer<T> {
    /// Creates an idle buffer.
    pub fn new(warn_threshold: usize) -> Self {
        Self {
            phase: SeedPhase::Idle,
            queue: VecDeque::new(),
            last_epoch: 0,
            warn_threshold,
        }
    }

    /// Returns the current phase.
    pub fn phase(&self) -> SeedPhase {
        self.phase
    }

    /// Returns true while a seed load is in flight.
    pub fn is_loading(&self) -> bool {
        matches!(self.phase, SeedPhase::LoadingSeed { .. })
    }

    /// Starts a new seed load, superseding any load in flight.
    ///
    /// Operations already queued stay queued; they are replayed after the
    /// new baseline.
    pub fn begin_seed(&mut self) -> u64 {
        self.last_epoch += 1;
        self.phase = SeedPhase::LoadingSeed {
            epoch: self.last_epoch,
        };
        self.last_epoch
    }

    /// Returns true if `epoch` is the seed load currently in flight.
    pub fn is_current(&self, epoch: u64) -> bool {
        self.phase == SeedPhase::LoadingSeed { epoch }
    }

    /// Accepts a remote operation.
    ///
    /// Returns the operation back if it should be applied now, or `None`
    /// if it was queued behind the seed load.
    pub fn accept(&mut self, op: Operation<T>) -> Option<Operation<T>> {
        if !self.is_loading() {
            return Some(op);
        }
        self.queue.push_back(op);
        if self.queue.len() == self.warn_threshold {
            warn!(queued = self.queue.len(), "inbound queue is growing during seed load");
        }
        None
    }

    /// Ends the seed load and returns the queued operations, oldest first.
    pub fn finish(&mut self) -> Vec<Operation<T>> {
        self.phase = SeedPhase::Idle;
        self.queue.drain(..).collect()
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
