use std::time::Duration;
use tokio::time::Instant;

/// Fixed-capacity ring of recent transient-error instants.
///
/// The window trips when it is full and the oldest recorded error is no more
/// than `threshold` older than the newest, i.e. a burst of `capacity` errors.
/// Sparse errors keep pushing the oldest entry out and never trip it.
#[derive(Debug)]
pub struct ErrorWindow {
    slots: Vec<Instant>,
    capacity: usize,
    next: usize,
    threshold: Duration,
}

impl ErrorWindow {
    pub fn new(capacity: usize, threshold: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Vec::with_capacity(capacity),
            capacity,
            next: 0,
            threshold,
        }
    }

    /// Records an error seen at `now`. Returns true if the window tripped.
    pub fn record(&mut self, now: Instant) -> bool {
        let capacity = self.capacity;
        if self.slots.len() < capacity {
            self.slots.push(now);
        } else {
            self.slots[self.next] = now;
        }
        self.next = (self.next + 1) % capacity;

        if self.slots.len() < capacity {
            return false;
        }
        // With a full ring, `next` points at the oldest entry.
        let oldest = self.slots[self.next];
        now.saturating_duration_since(oldest) <= self.threshold
    }

    /// Errors currently held.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
