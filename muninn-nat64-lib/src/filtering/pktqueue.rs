//! Retention queue for v4-side SYNs that arrived before their binding.
//!
//! RFC 6146 section 5.3: instead of answering an externally-initiated
//! SYN right away, hold it briefly; a v6-side SYN in the meantime means
//! a simultaneous open, and the stored packet can then be translated
//! after all. Expired entries drop and the source gets an ICMP error.

use std::sync::Mutex;
use std::time::Instant;

use ahash::AHashMap;

use crate::types::TransportAddr4;

#[derive(Debug, Clone)]
pub struct StoredPkt {
    pub frame: Vec<u8>,
    pub mark: u32,
    deadline: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    /// Something is already queued for this key.
    Exists,
    /// The queue is at capacity.
    Full,
}

/// Keyed by the pool4 transport address the SYN targeted.
#[derive(Default)]
pub struct PktQueue {
    inner: Mutex<AHashMap<TransportAddr4, StoredPkt>>,
}

impl PktQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(
        &self,
        key: TransportAddr4,
        frame: Vec<u8>,
        mark: u32,
        deadline: Instant,
        capacity: usize,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.contains_key(&key) {
            return Err(StoreError::Exists);
        }
        if inner.len() >= capacity {
            return Err(StoreError::Full);
        }
        inner.insert(key, StoredPkt { frame, mark, deadline });
        Ok(())
    }

    /// Called when a v6-side SYN creates the binding the stored packet
    /// was waiting for.
    pub fn drain(&self, key: &TransportAddr4) -> Option<StoredPkt> {
        self.lock().remove(key)
    }

    /// Timer tick: every expired entry, handed back so the caller can
    /// answer with ICMP outside the lock.
    pub fn expire(&self, now: Instant) -> Vec<StoredPkt> {
        let mut inner = self.lock();
        let doomed: Vec<TransportAddr4> = inner
            .iter()
            .filter(|(_, stored)| stored.deadline <= now)
            .map(|(&key, _)| key)
            .collect();
        doomed
            .into_iter()
            .filter_map(|key| inner.remove(&key))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AHashMap<TransportAddr4, StoredPkt>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn key(port: u16) -> TransportAddr4 {
        TransportAddr4::new("198.51.100.1".parse().unwrap(), port)
    }

    #[test]
    fn store_drain_round_trip() {
        let q = PktQueue::new();
        let deadline = Instant::now() + Duration::from_secs(6);
        q.store(key(40000), vec![1, 2, 3], 7, deadline, 10).unwrap();

        assert_eq!(q.store(key(40000), vec![4], 0, deadline, 10), Err(StoreError::Exists));

        let stored = q.drain(&key(40000)).unwrap();
        assert_eq!(stored.frame, vec![1, 2, 3]);
        assert_eq!(stored.mark, 7);
        assert!(q.is_empty());
    }

    #[test]
    fn capacity_is_enforced() {
        let q = PktQueue::new();
        let deadline = Instant::now() + Duration::from_secs(6);
        q.store(key(1), vec![], 0, deadline, 1).unwrap();
        assert_eq!(q.store(key(2), vec![], 0, deadline, 1), Err(StoreError::Full));
    }

    #[test]
    fn expire_only_takes_the_overdue() {
        let q = PktQueue::new();
        let now = Instant::now();
        q.store(key(1), vec![], 0, now + Duration::from_secs(1), 10).unwrap();
        q.store(key(2), vec![], 0, now + Duration::from_secs(60), 10).unwrap();

        let expired = q.expire(now + Duration::from_secs(2));
        assert_eq!(expired.len(), 1);
        assert_eq!(q.len(), 1);
    }
}
