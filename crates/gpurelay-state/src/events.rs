//! Bounded ring buffer of node lifecycle events.
//!
//! Diagnostic only: the registry is the source of truth, and the log keeps
//! just the most recent `capacity` events, evicting the oldest first.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use crate::types::NodeEvent;

/// Default number of retained events.
pub const DEFAULT_EVENT_CAPACITY: usize = 500;

pub struct EventLog {
    capacity: usize,
    events: Mutex<VecDeque<NodeEvent>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    /// A log retaining at most `capacity` events (minimum one).
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            events: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Append an event, evicting the oldest when full.
    pub fn push(&self, event: NodeEvent) {
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// The most recent `limit` events, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<NodeEvent> {
        let events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        let skip = events.len().saturating_sub(limit);
        events.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}
