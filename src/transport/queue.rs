//! Bounded outbound FIFOs
//!
//! Producers and the drain task never block on these queues: a full queue
//! refuses the entry and an empty queue yields nothing.

use crate::observability::{metrics, QueueKind};
use crate::protocol::{GenericPayload, LocationFix};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use tracing::warn;

/// Default depth of each outbound queue
pub const DEFAULT_QUEUE_DEPTH: usize = 20;

/// Fixed-capacity FIFO safe to share between tasks
#[derive(Debug)]
pub struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
}

impl<T: Clone> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    fn guard(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Append `item`; returns false and drops it when the queue is full
    pub fn try_enqueue(&self, item: T) -> bool {
        let mut items = self.guard();
        if items.len() >= self.capacity {
            return false;
        }
        items.push_back(item);
        true
    }

    pub fn try_dequeue(&self) -> Option<T> {
        self.guard().pop_front()
    }

    /// Copy of the head entry, left in place
    pub fn peek(&self) -> Option<T> {
        self.guard().front().cloned()
    }

    pub fn len(&self) -> usize {
        self.guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// The two outbound queues drained by the publish task
#[derive(Debug)]
pub struct OutboundQueues {
    pub location: BoundedQueue<LocationFix>,
    pub generic: BoundedQueue<GenericPayload>,
}

impl OutboundQueues {
    pub fn new(depth: usize) -> Self {
        Self {
            location: BoundedQueue::new(depth),
            generic: BoundedQueue::new(depth),
        }
    }

    /// Enqueue a fix, logging and counting a drop when full
    pub fn push_location(&self, fix: LocationFix) -> bool {
        let meas_id = fix.meas_id;
        let accepted = self.location.try_enqueue(fix);
        if accepted {
            metrics().item_enqueued(QueueKind::Location);
        } else {
            metrics().item_dropped(QueueKind::Location);
            warn!(
                meas_id,
                capacity = self.location.capacity(),
                "Location queue full, dropping fix"
            );
        }
        accepted
    }

    /// Enqueue a payload, logging and counting a drop when full
    pub fn push_generic(&self, payload: GenericPayload) -> bool {
        let len = payload.len();
        let accepted = self.generic.try_enqueue(payload);
        if accepted {
            metrics().item_enqueued(QueueKind::Generic);
        } else {
            metrics().item_dropped(QueueKind::Generic);
            warn!(
                len,
                capacity = self.generic.capacity(),
                "Generic payload queue full, dropping payload"
            );
        }
        accepted
    }

    pub fn is_empty(&self) -> bool {
        self.location.is_empty() && self.generic.is_empty()
    }
}

impl Default for OutboundQueues {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_DEPTH)
    }
}
