//! Expiration bookkeeping.
//!
//! One queue per timeout class. Each (re)arming of a session's timer
//! appends a marker stamped with a fresh epoch; the session remembers
//! only its latest epoch, so stale markers from earlier arms fall out
//! of the queues without a search. Within a queue the timeout is a
//! single fixed duration and update times are monotonic, which keeps
//! every queue deadline-ordered by construction.

use std::collections::VecDeque;
use std::time::Instant;

#[derive(Debug, Clone, Copy)]
pub(super) struct Marker {
    pub sid: u64,
    pub epoch: u64,
    pub deadline: Instant,
}

#[derive(Debug, Default)]
pub(super) struct ExpireQueue {
    entries: VecDeque<Marker>,
}

impl ExpireQueue {
    pub fn arm(&mut self, sid: u64, epoch: u64, deadline: Instant) {
        self.entries.push_back(Marker { sid, epoch, deadline });
    }

    /// Next marker whose deadline has passed, if any. Stale-epoch
    /// filtering is the caller's job; it owns the session records.
    pub fn pop_expired(&mut self, now: Instant) -> Option<Marker> {
        if self.entries.front()?.deadline <= now {
            self.entries.pop_front()
        } else {
            None
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn pops_in_deadline_order_and_respects_now() {
        let mut q = ExpireQueue::default();
        let t0 = Instant::now();
        q.arm(1, 10, t0 + Duration::from_secs(1));
        q.arm(2, 11, t0 + Duration::from_secs(2));

        assert!(q.pop_expired(t0).is_none());
        let first = q.pop_expired(t0 + Duration::from_secs(1)).unwrap();
        assert_eq!((first.sid, first.epoch), (1, 10));
        assert!(q.pop_expired(t0 + Duration::from_secs(1)).is_none());
        assert_eq!(q.len(), 1);
    }
}
