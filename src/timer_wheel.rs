use std::collections::BTreeMap;

/// A coarse software timer wheel keyed by absolute millisecond deadline
/// (§4.6, §9). Real timer-wheel implementations hash into fixed-size tick
/// buckets; this crate has at most a few thousand live connections, so a
/// `BTreeMap` keyed by deadline gives the same O(log n) register/cancel and
/// O(1) "what's due" query without the bucket-rotation bookkeeping a
/// millions-of-timers server would need.
#[derive(Debug, Default)]
pub struct TimerWheel<K: Ord + Copy> {
    by_deadline: BTreeMap<u64, Vec<K>>,
    deadline_of: std::collections::HashMap<K, u64>,
}

impl<K: Ord + Copy + std::hash::Hash> TimerWheel<K> {
    pub fn new() -> Self {
        Self {
            by_deadline: BTreeMap::new(),
            deadline_of: std::collections::HashMap::new(),
        }
    }

    /// Arms (or re-arms) `key`'s timer to fire at `deadline_ms`, replacing
    /// any previously registered deadline for the same key.
    pub fn arm(&mut self, key: K, deadline_ms: u64) {
        self.cancel(key);
        self.by_deadline.entry(deadline_ms).or_default().push(key);
        self.deadline_of.insert(key, deadline_ms);
    }

    pub fn cancel(&mut self, key: K) {
        if let Some(deadline) = self.deadline_of.remove(&key) {
            if let Some(bucket) = self.by_deadline.get_mut(&deadline) {
                bucket.retain(|&k| k != key);
                if bucket.is_empty() {
                    self.by_deadline.remove(&deadline);
                }
            }
        }
    }

    /// The next absolute deadline due, if any, for the embedder to size a
    /// blocking `rx_ready` wait against.
    pub fn next_deadline(&self) -> Option<u64> {
        self.by_deadline.keys().next().copied()
    }

    /// Removes and returns every key whose deadline is `<= now_ms`.
    pub fn expire_due(&mut self, now_ms: u64) -> Vec<K> {
        let due_deadlines: Vec<u64> = self.by_deadline.range(..=now_ms).map(|(&d, _)| d).collect();
        let mut due = Vec::new();
        for deadline in due_deadlines {
            if let Some(keys) = self.by_deadline.remove(&deadline) {
                for k in &keys {
                    self.deadline_of.remove(k);
                }
                due.extend(keys);
            }
        }
        due
    }

    pub fn is_empty(&self) -> bool {
        self.by_deadline.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn expires_only_due_keys_in_deadline_order() {
        let mut wheel: TimerWheel<u64> = TimerWheel::new();
        wheel.arm(1, 100);
        wheel.arm(2, 50);
        wheel.arm(3, 200);

        assert_eq!(wheel.next_deadline(), Some(50));
        assert_eq!(wheel.expire_due(100), vec![2, 1]);
        assert_eq!(wheel.next_deadline(), Some(200));
    }

    #[test]
    fn rearming_replaces_previous_deadline() {
        let mut wheel: TimerWheel<u64> = TimerWheel::new();
        wheel.arm(1, 100);
        wheel.arm(1, 300);
        assert_eq!(wheel.expire_due(100), Vec::<u64>::new());
        assert_eq!(wheel.expire_due(300), vec![1]);
    }

    #[test]
    fn cancel_removes_pending_timer() {
        let mut wheel: TimerWheel<u64> = TimerWheel::new();
        wheel.arm(1, 100);
        wheel.cancel(1);
        assert!(wheel.is_empty());
    }
}
