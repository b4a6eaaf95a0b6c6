//! Intra-queue events: happens-before edges between command buffers on
//! the same queue.

use std::sync::atomic::{AtomicBool, Ordering};

use tensile_base::ref_object;

/// A binary event signaled and reset by recorded commands.
pub struct Event {
    signaled: AtomicBool,
}

ref_object!(Event);

impl Event {
    pub fn new() -> Self {
        Self {
            signaled: AtomicBool::new(false),
        }
    }

    pub fn signal(&self) {
        self.signaled.store(true, Ordering::Release);
    }

    pub fn reset(&self) {
        self.signaled.store(false, Ordering::Release);
    }

    pub fn is_signaled(&self) -> bool {
        self.signaled.load(Ordering::Acquire)
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_reset() {
        let event = Event::new();
        assert!(!event.is_signaled());
        event.signal();
        assert!(event.is_signaled());
        event.reset();
        assert!(!event.is_signaled());
    }
}
