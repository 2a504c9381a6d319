//! Round-robin cursor.
//!
//! An atomic counter that advances by one on every pick, wrapping modulo
//! the number of items offered. Lock-free, so a monitor can share one
//! cursor between its API and its background ticks.

use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Default)]
pub struct RoundRobinCursor {
    position: AtomicUsize,
}

impl RoundRobinCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick the next item and advance. `None` for an empty slice, in
    /// which case the cursor does not move.
    pub fn pick<'a, T>(&self, items: &'a [T]) -> Option<&'a T> {
        if items.is_empty() {
            return None;
        }
        let turn = self.position.fetch_add(1, Ordering::Relaxed);
        items.get(turn % items.len())
    }

    /// Number of picks made so far.
    pub fn position(&self) -> usize {
        self.position.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.position.store(0, Ordering::Relaxed);
    }
}
