use crate::domain_model::Clock;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::hash_map::RandomState;
use std::hash::BuildHasher;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Live entries compared when choosing a victim.
const EVICTION_SAMPLE: usize = 5;
/// Entries inspected per eviction round, expired ones are reclaimed first.
const SCAN_WINDOW: usize = 32;
/// Victims evicted for one incoming item before giving up.
const MAX_EVICTIONS_PER_SET: usize = 16;

struct CacheEntry {
    value: Vec<u8>,
    cost: u64,
    expires_at: DateTime<Utc>,
}

/// Bounded, TTL-aware, cost-based in-process cache.
///
/// `set` may refuse an item when the cache is full and the newcomer is
/// colder than the entry it would replace. Callers treat a refused `set` as
/// "written but not readable".
pub struct LocalCache {
    entries: DashMap<String, CacheEntry>,
    sketch: FrequencySketch,
    max_cost: u64,
    used: AtomicU64,
    scan_cursor: AtomicUsize,
    clock: Arc<dyn Clock>,
}

impl LocalCache {
    pub fn new(max_cost: u64, clock: Arc<dyn Clock>) -> Self {
        LocalCache {
            entries: DashMap::new(),
            sketch: FrequencySketch::with_capacity(max_cost),
            max_cost,
            used: AtomicU64::new(0),
            scan_cursor: AtomicUsize::new(0),
            clock,
        }
    }

    /// Returns `false` when the item was not kept.
    pub fn set(&self, key: &str, value: Vec<u8>, cost: u64, ttl: Duration) -> bool {
        self.write(key, value, cost, ttl, WriteMode::Admit)
    }

    /// Like `set`, but leaves a live entry for `key` untouched.
    pub fn set_if_absent(&self, key: &str, value: Vec<u8>, cost: u64, ttl: Duration) -> bool {
        self.write(key, value, cost, ttl, WriteMode::IfAbsent)
    }

    /// Like `set`, but admission cannot refuse the item. The cache may run
    /// over budget when no victim can be found.
    pub fn force_set(&self, key: &str, value: Vec<u8>, cost: u64, ttl: Duration) -> bool {
        self.write(key, value, cost, ttl, WriteMode::Force)
    }

    fn write(&self, key: &str, value: Vec<u8>, cost: u64, ttl: Duration, mode: WriteMode) -> bool {
        if ttl.is_zero() || cost > self.max_cost {
            return false;
        }
        let Ok(ttl) = chrono::Duration::from_std(ttl) else {
            return false;
        };
        self.sketch.increment(key);
        let now = self.clock.now();

        if mode == WriteMode::IfAbsent {
            self.remove_expired(key, now);
            if self.entries.contains_key(key) {
                return false;
            }
        }

        let force = mode == WriteMode::Force;
        if !self.entries.contains_key(key) && !self.make_room(key, cost, force) {
            tracing::debug!(key, cost, "local cache rejected item");
            return false;
        }

        let entry = CacheEntry {
            value,
            cost,
            expires_at: now + ttl,
        };
        // Charged before the entry is visible so a concurrent eviction can
        // never release more than was added.
        self.used.fetch_add(cost, Ordering::AcqRel);
        match mode {
            WriteMode::IfAbsent => match self.entries.entry(key.to_string()) {
                Entry::Occupied(_) => {
                    self.release(cost);
                    false
                }
                Entry::Vacant(slot) => {
                    slot.insert(entry);
                    true
                }
            },
            WriteMode::Admit | WriteMode::Force => {
                if let Some(old) = self.entries.insert(key.to_string(), entry) {
                    self.release(old.cost);
                }
                true
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.sketch.increment(key);
        let now = self.clock.now();
        {
            let entry = self.entries.get(key)?;
            if entry.expires_at > now {
                return Some(entry.value.clone());
            }
        }
        self.remove_expired(key, now);
        None
    }

    pub fn get_ttl(&self, key: &str) -> Option<Duration> {
        let now = self.clock.now();
        let ttl = {
            let entry = self.entries.get(key)?;
            (entry.expires_at - now).to_std().ok().filter(|d| !d.is_zero())
        };
        if ttl.is_none() {
            self.remove_expired(key, now);
        }
        ttl
    }

    pub fn del(&self, key: &str) {
        if let Some((_, old)) = self.entries.remove(key) {
            self.release(old.cost);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Approximate sum of the costs of resident entries.
    pub fn cost(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    fn release(&self, cost: u64) {
        let _ = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                Some(used.saturating_sub(cost))
            });
    }

    fn remove_expired(&self, key: &str, now: DateTime<Utc>) {
        if let Some((_, old)) = self.entries.remove_if(key, |_, e| e.expires_at <= now) {
            self.release(old.cost);
        }
    }

    /// Collects expired keys and up to `EVICTION_SAMPLE` live keys from a
    /// window that starts where the previous one ended.
    fn scan(&self, now: DateTime<Utc>) -> (Vec<String>, Vec<String>) {
        let mut expired = Vec::new();
        let mut sample = Vec::with_capacity(EVICTION_SAMPLE);
        let mut classify = |key: &String, expires_at: DateTime<Utc>| {
            if expires_at <= now {
                expired.push(key.clone());
            } else if sample.len() < EVICTION_SAMPLE {
                sample.push(key.clone());
            }
        };

        let start = self.scan_cursor.fetch_add(SCAN_WINDOW, Ordering::Relaxed)
            % self.entries.len().max(1);
        let mut visited = 0;
        // Collect first, the shard locks must be released before removal.
        for entry in self.entries.iter().skip(start).take(SCAN_WINDOW) {
            classify(entry.key(), entry.expires_at);
            visited += 1;
        }
        // Wrap around to the front.
        for entry in self.entries.iter().take((SCAN_WINDOW - visited).min(start)) {
            classify(entry.key(), entry.expires_at);
        }
        (expired, sample)
    }

    fn make_room(&self, key: &str, cost: u64, force: bool) -> bool {
        let incoming = self.sketch.estimate(key);
        for _ in 0..MAX_EVICTIONS_PER_SET {
            if self.cost() + cost <= self.max_cost {
                return true;
            }
            let now = self.clock.now();
            let (expired, sample) = self.scan(now);

            if !expired.is_empty() {
                for victim in expired {
                    self.remove_expired(&victim, now);
                }
                continue;
            }

            let Some((victim, victim_freq)) = sample
                .into_iter()
                .map(|k| {
                    let f = self.sketch.estimate(&k);
                    (k, f)
                })
                .min_by_key(|(_, f)| *f)
            else {
                return force;
            };

            if !force && incoming < victim_freq {
                return false;
            }
            self.del(&victim);
        }
        force || self.cost() + cost <= self.max_cost
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    Admit,
    IfAbsent,
    Force,
}

/// Count-min sketch of 4-bit counters, halved periodically so old popularity
/// fades.
struct FrequencySketch {
    rows: [RandomState; 4],
    counters: Vec<AtomicU8>,
    mask: usize,
    additions: AtomicU64,
    reset_at: u64,
}

impl FrequencySketch {
    fn with_capacity(capacity: u64) -> Self {
        let width = (capacity / 64).clamp(256, 1 << 20).next_power_of_two() as usize;
        FrequencySketch {
            rows: [
                RandomState::new(),
                RandomState::new(),
                RandomState::new(),
                RandomState::new(),
            ],
            counters: (0..width * 4).map(|_| AtomicU8::new(0)).collect(),
            mask: width - 1,
            additions: AtomicU64::new(0),
            reset_at: width as u64 * 10,
        }
    }

    fn slot(&self, row: usize, key: &str) -> usize {
        let width = self.mask + 1;
        row * width + (self.rows[row].hash_one(key) as usize & self.mask)
    }

    fn increment(&self, key: &str) {
        for row in 0..self.rows.len() {
            let counter = &self.counters[self.slot(row, key)];
            let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                (c < 15).then_some(c + 1)
            });
        }
        if self.additions.fetch_add(1, Ordering::AcqRel) + 1 >= self.reset_at {
            self.additions.store(0, Ordering::Release);
            for counter in &self.counters {
                let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| Some(c / 2));
            }
        }
    }

    fn estimate(&self, key: &str) -> u8 {
        (0..self.rows.len())
            .map(|row| self.counters[self.slot(row, key)].load(Ordering::Acquire))
            .min()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain_model::ManualClock;

    fn cache(max_cost: u64) -> (Arc<ManualClock>, LocalCache) {
        let clock = Arc::new(ManualClock::default());
        let cache = LocalCache::new(max_cost, clock.clone());
        (clock, cache)
    }

    #[test]
    fn entries_expire_with_their_ttl() {
        let (clock, cache) = cache(1024);
        assert!(cache.set("k", b"v".to_vec(), 1, Duration::from_secs(10)));
        assert_eq!(cache.get("k"), Some(b"v".to_vec()));
        assert_eq!(cache.get_ttl("k"), Some(Duration::from_secs(10)));

        clock.advance(Duration::from_secs(4));
        assert_eq!(cache.get_ttl("k"), Some(Duration::from_secs(6)));

        clock.advance(Duration::from_secs(6));
        assert_eq!(cache.get("k"), None);
        assert_eq!(cache.get_ttl("k"), None);
        assert!(cache.is_empty());
        assert_eq!(cache.cost(), 0);
    }

    #[test]
    fn del_and_overwrite_track_cost() {
        let (_, cache) = cache(100);
        cache.set("a", vec![0; 10], 10, Duration::from_secs(60));
        cache.set("a", vec![0; 30], 30, Duration::from_secs(60));
        assert_eq!(cache.cost(), 30);
        assert_eq!(cache.len(), 1);
        cache.del("a");
        assert_eq!(cache.cost(), 0);
        assert_eq!(cache.get("a"), None);
        cache.del("a");
    }

    #[test]
    fn rejects_zero_ttl_and_oversized_items() {
        let (_, cache) = cache(8);
        assert!(!cache.set("a", vec![1], 1, Duration::ZERO));
        assert!(!cache.set("b", vec![0; 9], 9, Duration::from_secs(1)));
        assert!(cache.is_empty());
    }

    #[test]
    fn evicts_the_coldest_entry_under_pressure() {
        let (_, cache) = cache(3);
        let ttl = Duration::from_secs(60);
        for key in ["a", "b", "c"] {
            assert!(cache.set(key, vec![1], 1, ttl));
        }
        for _ in 0..4 {
            cache.get("a");
            cache.get("b");
        }

        assert!(cache.set("d", vec![1], 1, ttl));
        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_some());
        assert!(cache.get("c").is_none());
        assert!(cache.get("d").is_some());
        assert!(cache.cost() <= 3);
    }

    #[test]
    fn cold_newcomer_is_not_admitted_over_hot_entries() {
        let (_, cache) = cache(2);
        let ttl = Duration::from_secs(60);
        cache.set("a", vec![1], 1, ttl);
        cache.set("b", vec![1], 1, ttl);
        for _ in 0..5 {
            cache.get("a");
            cache.get("b");
        }

        assert!(!cache.set("c", vec![1], 1, ttl));
        assert!(cache.get("c").is_none());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn expired_entries_are_reclaimed_before_live_ones() {
        let (clock, cache) = cache(2);
        cache.set("short", vec![1], 1, Duration::from_secs(1));
        cache.set("long", vec![1], 1, Duration::from_secs(600));
        for _ in 0..5 {
            cache.get("short");
            cache.get("long");
        }
        clock.advance(Duration::from_secs(2));

        assert!(cache.set("new", vec![1], 1, Duration::from_secs(600)));
        assert!(cache.get("long").is_some());
        assert!(cache.get("new").is_some());
    }

    #[test]
    fn set_if_absent_leaves_live_entries_alone() {
        let (clock, cache) = cache(100);
        let ttl = Duration::from_secs(10);
        assert!(cache.set_if_absent("k", b"first".to_vec(), 5, ttl));
        assert!(!cache.set_if_absent("k", b"second".to_vec(), 6, ttl));
        assert_eq!(cache.get("k"), Some(b"first".to_vec()));
        assert_eq!(cache.cost(), 5);

        clock.advance(Duration::from_secs(11));
        assert!(cache.set_if_absent("k", b"third".to_vec(), 5, ttl));
        assert_eq!(cache.get("k"), Some(b"third".to_vec()));
        assert_eq!(cache.cost(), 5);
    }

    #[test]
    fn force_set_is_not_refused_by_admission() {
        let (_, cache) = cache(2);
        let ttl = Duration::from_secs(60);
        cache.set("a", vec![1], 1, ttl);
        cache.set("b", vec![1], 1, ttl);
        for _ in 0..5 {
            cache.get("a");
            cache.get("b");
        }

        assert!(!cache.set("c", vec![1], 1, ttl));
        assert!(cache.force_set("c", vec![1], 1, ttl));
        assert!(cache.get("c").is_some());
        assert!(cache.cost() <= 2);
    }

    #[test]
    fn eviction_scan_moves_across_the_map() {
        let (clock, cache) = cache(1000);
        for i in 0..100 {
            cache.set(&format!("k{i}"), vec![1], 1, Duration::from_secs(60));
        }
        let mut seen = std::collections::HashSet::new();
        for _ in 0..3 {
            let (expired, sample) = cache.scan(clock.now());
            assert!(expired.is_empty());
            assert_eq!(sample.len(), EVICTION_SAMPLE);
            seen.extend(sample);
        }
        assert_eq!(seen.len(), 3 * EVICTION_SAMPLE);
    }

    #[test]
    fn concurrent_access_keeps_cost_accounting_exact() {
        let (_, cache) = cache(64);
        let cache = Arc::new(cache);
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let key = format!("{t}-{i}");
                        cache.set(&key, vec![0; 4], 4, Duration::from_secs(60));
                        cache.get(&key);
                        if i % 3 == 0 {
                            cache.del(&key);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let resident: u64 = cache.len() as u64 * 4;
        assert_eq!(cache.cost(), resident);
    }
}
