//! Duplicate-event suppression ledger (§4.4.4): a bounded, time-boxed set of
//! recently-seen event identities, keyed on `(type, siteId, alarm, ts)` per
//! the timestamps-as-identity design note in §9.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

type Key = (&'static str, String, String, String);

struct Inner {
    seen: HashMap<Key, Instant>,
    order: VecDeque<Key>,
}

/// Tracks event identities seen within a TTL window, evicting the oldest
/// entries once either the TTL or the entry-count budget is exceeded.
pub struct DuplicateLedger {
    inner: Mutex<Inner>,
    max_entries: usize,
    ttl: Duration,
}

impl DuplicateLedger {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner { seen: HashMap::new(), order: VecDeque::new() }),
            max_entries,
            ttl,
        }
    }

    /// Returns `true` if this is the first time `key` has been observed
    /// within the TTL window (i.e. it should be processed), `false` if it's
    /// a duplicate that should be suppressed.
    pub fn observe(&self, key: Key) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("duplicate ledger mutex poisoned");

        Self::evict_expired(&mut inner, now, self.ttl);

        if let Some(seen_at) = inner.seen.get(&key) {
            if now.duration_since(*seen_at) <= self.ttl {
                return false;
            }
        }

        inner.seen.insert(key.clone(), now);
        inner.order.push_back(key);

        while inner.order.len() > self.max_entries {
            if let Some(oldest) = inner.order.pop_front() {
                inner.seen.remove(&oldest);
            }
        }

        true
    }

    fn evict_expired(inner: &mut Inner, now: Instant, ttl: Duration) {
        while let Some(front) = inner.order.front() {
            match inner.seen.get(front) {
                Some(seen_at) if now.duration_since(*seen_at) > ttl => {
                    let key = inner.order.pop_front().unwrap();
                    inner.seen.remove(&key);
                }
                _ => break,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("duplicate ledger mutex poisoned").order.len()
    }
}
