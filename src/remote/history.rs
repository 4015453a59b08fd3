//! Bounded record of received control packet ids

use std::collections::VecDeque;

use crate::constants::CONTROL_HISTORY;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeenControl {
    pub packet_id: u64,
    pub processed: bool,
}

/// Ring of the most recent control ids; the oldest falls out first
#[derive(Debug, Clone)]
pub struct ControlHistory {
    entries: VecDeque<SeenControl>,
    capacity: usize,
}

impl ControlHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Record `packet_id`; returns true when it has not been processed yet
    pub fn record(&mut self, packet_id: u64) -> bool {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.packet_id == packet_id) {
            let first = !entry.processed;
            entry.processed = true;
            return first;
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(SeenControl {
            packet_id,
            processed: true,
        });
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ControlHistory {
    fn default() -> Self {
        Self::new(CONTROL_HISTORY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicates_suppressed() {
        let mut history = ControlHistory::default();
        assert!(history.record(4));
        assert!(!history.record(4));
        assert!(!history.record(4));
        assert!(history.record(5));
    }

    #[test]
    fn test_bounded_to_capacity() {
        let mut history = ControlHistory::new(30);
        for id in 0..40 {
            assert!(history.record(id));
        }
        assert_eq!(history.len(), 30);
        // Oldest ids fell out and count as new again
        assert!(history.record(0));
        assert!(!history.record(39));
    }
}
