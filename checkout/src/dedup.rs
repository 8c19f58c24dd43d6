//! Bounded memory of processed idempotency keys.

use moka::sync::Cache;
use std::fmt;
use std::time::Duration;

/// Keys processed recently, bounded in count and age.
///
/// Redeliveries arrive close to the original delivery, so a bounded window is
/// enough to absorb them without growing forever.
#[derive(Clone)]
pub struct SeenKeys {
    cache: Cache<String, ()>,
}

impl SeenKeys {
    /// Default number of keys remembered.
    pub const DEFAULT_CAPACITY: u64 = 10_000;

    /// How long a key is remembered by default.
    pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

    /// Empty set remembering at most `capacity` keys for `ttl` each.
    #[must_use]
    pub fn new(capacity: u64, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(capacity.max(1))
            .time_to_live(ttl)
            .build();

        Self { cache }
    }

    /// Record `key`. Returns `false` if it was already present.
    pub fn insert(&self, key: &str) -> bool {
        self.cache.entry_by_ref(key).or_insert(()).is_fresh()
    }

    /// Forget `key`, so a later delivery is processed again.
    pub fn remove(&self, key: &str) {
        self.cache.invalidate(key);
    }

    /// Whether `key` is remembered.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.cache.contains_key(key)
    }
}

impl Default for SeenKeys {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY, Self::DEFAULT_TTL)
    }
}

impl fmt::Debug for SeenKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SeenKeys")
            .field("entries", &self.cache.entry_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_insert_is_a_duplicate() {
        let seen = SeenKeys::default();
        assert!(seen.insert("L1"));
        assert!(!seen.insert("L1"));
        assert!(seen.contains("L1"));
    }

    #[test]
    fn memory_is_bounded_by_capacity() {
        let seen = SeenKeys::new(2, SeenKeys::DEFAULT_TTL);
        for key in ["L1", "L2", "L3", "L4"] {
            seen.insert(key);
        }
        seen.cache.run_pending_tasks();

        assert!(seen.cache.entry_count() <= 2);
    }

    #[test]
    fn removed_keys_can_be_inserted_again() {
        let seen = SeenKeys::default();
        seen.insert("L1");
        seen.remove("L1");

        assert!(!seen.contains("L1"));
        assert!(seen.insert("L1"));
    }

    #[test]
    fn keys_expire_after_their_ttl() {
        let seen = SeenKeys::new(10, Duration::from_millis(20));
        seen.insert("L1");
        std::thread::sleep(Duration::from_millis(50));

        assert!(!seen.contains("L1"));
        assert!(seen.insert("L1"));
    }
}
