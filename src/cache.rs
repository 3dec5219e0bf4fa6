//! Bounded cache of report payloads whose delivery failed.

use std::collections::VecDeque;

/// Failed payloads of one profile, oldest first.
///
/// When full, a push drops the entry at index `capacity - 3` rather than the
/// oldest one: the oldest entry and the two newest survive an outage.
#[derive(Debug, Clone)]
pub struct ReportCache {
    entries: VecDeque<Vec<u8>>,
    capacity: usize,
}

/// Smallest capacity the eviction rule works with
pub const MIN_CACHE_CAPACITY: usize = 3;

/// Result of [`ReportCache::flush`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushSummary<E> {
    /// Payloads delivered and removed
    pub delivered: usize,
    /// Payloads still cached after the flush
    pub remaining: usize,
    /// The failure that stopped the flush
    pub error: Option<E>,
}

impl ReportCache {
    /// Capacities below [`MIN_CACHE_CAPACITY`] are raised to it
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(MIN_CACHE_CAPACITY);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &[u8]> {
        self.entries.iter().map(Vec::as_slice)
    }

    /// Cache a payload, returning the evicted entry if the cache was full
    pub fn push_failed(&mut self, payload: Vec<u8>) -> Option<Vec<u8>> {
        let evicted = if self.entries.len() >= self.capacity {
            self.entries.remove(self.capacity - MIN_CACHE_CAPACITY)
        } else {
            None
        };
        self.entries.push_back(payload);
        evicted
    }

    /// Deliver cached payloads oldest-first, stopping at the first failure.
    ///
    /// Delivered payloads are removed; the failed one and everything after it
    /// stay cached in their original order.
    pub fn flush<E, F>(&mut self, mut deliver: F) -> FlushSummary<E>
    where
        F: FnMut(&[u8]) -> Result<(), E>,
    {
        let mut delivered = 0;
        let mut error = None;
        while let Some(front) = self.entries.front() {
            if let Err(e) = deliver(front) {
                error = Some(e);
                break;
            }
            self.entries.pop_front();
            delivered += 1;
        }
        FlushSummary {
            delivered,
            remaining: self.entries.len(),
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn payload(i: usize) -> Vec<u8> {
        format!("R{}", i).into_bytes()
    }

    fn contents(cache: &ReportCache) -> Vec<String> {
        cache
            .iter()
            .map(|p| String::from_utf8_lossy(p).into_owned())
            .collect()
    }

    #[test]
    fn test_push_below_capacity_keeps_order() {
        let mut cache = ReportCache::new(5);
        for i in 0..3 {
            assert!(cache.push_failed(payload(i)).is_none());
        }
        assert_eq!(contents(&cache), vec!["R0", "R1", "R2"]);
    }

    #[test]
    fn test_full_cache_evicts_third_newest() {
        let mut cache = ReportCache::new(5);
        for i in 0..5 {
            cache.push_failed(payload(i));
        }

        let evicted = cache.push_failed(payload(5));
        assert_eq!(evicted, Some(payload(2)));
        assert_eq!(contents(&cache), vec!["R0", "R1", "R3", "R4", "R5"]);
    }

    #[test]
    fn test_flush_stops_at_first_failure() {
        let mut cache = ReportCache::new(5);
        for i in 0..4 {
            cache.push_failed(payload(i));
        }

        let mut attempts = 0;
        let summary = cache.flush(|p| {
            attempts += 1;
            if p == b"R2" {
                Err("unreachable")
            } else {
                Ok(())
            }
        });

        assert_eq!(
            summary,
            FlushSummary {
                delivered: 2,
                remaining: 2,
                error: Some("unreachable")
            }
        );
        assert_eq!(attempts, 3);
        assert_eq!(contents(&cache), vec!["R2", "R3"]);
    }

    #[test]
    fn test_flush_all_delivered() {
        let mut cache = ReportCache::new(5);
        cache.push_failed(payload(0));
        cache.push_failed(payload(1));

        let summary = cache.flush(|_| Ok::<(), ()>(()));
        assert_eq!(
            summary,
            FlushSummary {
                delivered: 2,
                remaining: 0,
                error: None
            }
        );
        assert!(cache.is_empty());
    }

    #[test]
    fn test_small_capacity_is_raised() {
        let mut cache = ReportCache::new(0);
        assert_eq!(cache.capacity(), MIN_CACHE_CAPACITY);

        for i in 0..10 {
            cache.push_failed(payload(i));
        }
        assert_eq!(cache.len(), MIN_CACHE_CAPACITY);
        assert_eq!(contents(&cache), vec!["R7", "R8", "R9"]);
    }

    proptest! {
        #[test]
        fn prop_full_cache_eviction_order(capacity in 3usize..12) {
            let mut cache = ReportCache::new(capacity);
            for i in 0..capacity {
                cache.push_failed(payload(i));
            }
            cache.push_failed(payload(capacity));

            let mut expected: Vec<String> = (0..capacity)
                .filter(|i| *i != capacity - 3)
                .map(|i| format!("R{}", i))
                .collect();
            expected.push(format!("R{}", capacity));

            prop_assert_eq!(contents(&cache), expected);
            prop_assert_eq!(cache.len(), capacity);
        }

        #[test]
        fn prop_cache_never_exceeds_capacity(capacity in 3usize..10, pushes in 0usize..40) {
            let mut cache = ReportCache::new(capacity);
            for i in 0..pushes {
                cache.push_failed(payload(i));
                prop_assert!(cache.len() <= capacity);
            }
        }

        #[test]
        fn prop_flush_keeps_suffix(count in 1usize..6, fail_at in 0usize..6) {
            let mut cache = ReportCache::new(6);
            for i in 0..count {
                cache.push_failed(payload(i));
            }

            let mut index = 0;
            let _ = cache.flush(|_| {
                let current = index;
                index += 1;
                if current == fail_at { Err(()) } else { Ok(()) }
            });

            let kept = if fail_at < count { fail_at..count } else { count..count };
            let expected: Vec<String> = kept.map(|i| format!("R{}", i)).collect();
            prop_assert_eq!(contents(&cache), expected);
        }
    }
}
