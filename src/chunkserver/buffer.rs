use std::num::NonZeroUsize;

use lru::LruCache;

use crate::core::DataIdent;

struct Pushed {
    data: Vec<u8>,
    pushed_at_ms: u64,
}

/// Data pushed by clients, waiting for the mutation that consumes it.
///
/// Bounded by an LRU so a flood of abandoned pushes cannot exhaust memory,
/// and swept by [`PushBuffer::collect_garbage`] for entries idle past the TTL.
pub struct PushBuffer {
    entries: LruCache<DataIdent, Pushed>,
    ttl_ms: u64,
}

impl PushBuffer {
    pub fn new(capacity: usize, ttl_ms: u64) -> PushBuffer {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        PushBuffer { entries: LruCache::new(capacity), ttl_ms }
    }

    /// Receive a datum pushed by a client. Pushing the same ident again replaces it.
    pub fn put(&mut self, ident: DataIdent, data: Vec<u8>, now_ms: u64) {
        self.entries.put(ident, Pushed { data, pushed_at_ms: now_ms });
    }

    /// Remove and return the datum, if it is still buffered.
    pub fn take(&mut self, ident: DataIdent) -> Option<Vec<u8>> {
        self.entries.pop(&ident).map(|p| p.data)
    }

    pub fn contains(&self, ident: DataIdent) -> bool {
        self.entries.contains(&ident)
    }

    /// A copy of the datum, leaving it buffered.
    pub fn peek(&self, ident: DataIdent) -> Option<Vec<u8>> {
        self.entries.peek(&ident).map(|p| p.data.clone())
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Drop every datum pushed more than the TTL ago. Returns how many were dropped.
    pub fn collect_garbage(&mut self, now_ms: u64) -> usize {
        let expired: Vec<DataIdent> = self
            .entries
            .iter()
            .filter(|(_, p)| now_ms.saturating_sub(p.pushed_at_ms) > self.ttl_ms)
            .map(|(ident, _)| *ident)
            .collect();
        for ident in &expired {
            self.entries.pop(ident);
        }
        expired.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_consumes_once() {
        let mut buffer = PushBuffer::new(4, 1_000);
        buffer.put(7, b"hello".to_vec(), 0);

        assert_eq!(buffer.take(7).unwrap(), b"hello");
        assert!(buffer.take(7).is_none());
    }

    #[test]
    fn repush_overwrites() {
        let mut buffer = PushBuffer::new(4, 1_000);
        buffer.put(7, b"one".to_vec(), 0);
        buffer.put(7, b"two".to_vec(), 5);

        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.peek(7).unwrap(), b"two");
    }

    #[test]
    fn idle_entries_are_collected() {
        let mut buffer = PushBuffer::new(4, 1_000);
        buffer.put(1, b"old".to_vec(), 0);
        buffer.put(2, b"new".to_vec(), 900);

        assert_eq!(buffer.collect_garbage(1_500), 1);
        assert!(!buffer.contains(1));
        assert!(buffer.contains(2));
    }

    #[test]
    fn capacity_evicts_least_recent() {
        let mut buffer = PushBuffer::new(2, 1_000);
        buffer.put(1, vec![1], 0);
        buffer.put(2, vec![2], 0);
        buffer.put(3, vec![3], 0);

        assert!(!buffer.contains(1));
        assert_eq!(buffer.len(), 2);
    }
}
