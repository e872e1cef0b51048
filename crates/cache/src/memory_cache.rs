use std::collections::HashMap;
use tracing::debug;
use wayfind_core::SelectorEntry;

/// Bounded map of url pattern to ranked selector entries.
///
/// Eviction works at key granularity: when the map grows past `capacity`,
/// the key whose most recently used entry is oldest goes first.
#[derive(Debug, Clone)]
pub struct MemoryCache {
    entries: HashMap<String, Vec<SelectorEntry>>,
    capacity: usize,
}

impl MemoryCache {
    pub const DEFAULT_CAPACITY: usize = 1000;

    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of url patterns held.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry_count(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    /// Unexpired entries for `url_pattern`. A key left empty by expiry is dropped.
    pub fn get(&mut self, url_pattern: &str, now_ms: i64) -> Option<Vec<SelectorEntry>> {
        let list = self.entries.get(url_pattern)?;
        let live: Vec<SelectorEntry> = list.iter().filter(|e| !e.is_expired(now_ms)).cloned().collect();

        if live.is_empty() {
            self.entries.remove(url_pattern);
            return None;
        }
        if live.len() != list.len() {
            self.entries.insert(url_pattern.to_string(), live.clone());
        }
        Some(live)
    }

    /// Best unexpired entry with `test_id`, scoped to one pattern or across all.
    pub fn find_by_test_id(
        &mut self,
        test_id: &str,
        url_pattern: Option<&str>,
        now_ms: i64,
    ) -> Option<SelectorEntry> {
        match url_pattern {
            Some(pattern) => self
                .get(pattern, now_ms)?
                .into_iter()
                .find(|e| e.test_id == test_id),
            None => self
                .entries
                .values()
                .flatten()
                .filter(|e| e.test_id == test_id && !e.is_expired(now_ms))
                .max_by(|a, b| {
                    a.confidence
                        .partial_cmp(&b.confidence)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| a.last_updated_at.cmp(&b.last_updated_at))
                })
                .cloned(),
        }
    }

    pub fn contains(&self, url_pattern: &str) -> bool {
        self.entries.contains_key(url_pattern)
    }

    /// Replace the whole list for `url_pattern`.
    pub fn insert(&mut self, url_pattern: &str, mut entries: Vec<SelectorEntry>) {
        if entries.is_empty() {
            self.entries.remove(url_pattern);
            return;
        }
        entries.sort_by(SelectorEntry::rank_cmp);
        self.entries.insert(url_pattern.to_string(), entries);
        self.evict_over_capacity(url_pattern);
    }

    /// Replace the entry with the same id under its url pattern, or add it.
    pub fn upsert(&mut self, entry: SelectorEntry) {
        let key = entry.url_pattern.clone();
        let list = self.entries.entry(key.clone()).or_default();
        match list.iter_mut().find(|e| e.id == entry.id) {
            Some(slot) => *slot = entry,
            None => list.push(entry),
        }
        list.sort_by(SelectorEntry::rank_cmp);
        self.evict_over_capacity(&key);
    }

    pub fn remove_entry(&mut self, id: &str) -> bool {
        let mut removed = false;
        self.entries.retain(|_, list| {
            let before = list.len();
            list.retain(|e| e.id != id);
            removed |= list.len() != before;
            !list.is_empty()
        });
        removed
    }

    pub fn remove_pattern(&mut self, url_pattern: &str) -> bool {
        self.entries.remove(url_pattern).is_some()
    }

    /// Drop expired entries. Builds a filtered copy and swaps it in.
    pub fn sweep_expired(&mut self, now_ms: i64) -> usize {
        let before = self.entry_count();
        let swept: HashMap<String, Vec<SelectorEntry>> = self
            .entries
            .iter()
            .filter_map(|(k, list)| {
                let live: Vec<SelectorEntry> =
                    list.iter().filter(|e| !e.is_expired(now_ms)).cloned().collect();
                (!live.is_empty()).then(|| (k.clone(), live))
            })
            .collect();
        self.entries = swept;
        before - self.entry_count()
    }

    pub fn all_entries(&self) -> impl Iterator<Item = &SelectorEntry> {
        self.entries.values().flatten()
    }

    /// Evict least-recently-used keys until within capacity, never the key just written.
    fn evict_over_capacity(&mut self, keep: &str) {
        while self.entries.len() > self.capacity {
            let victim = self
                .entries
                .iter()
                .filter(|(k, _)| k.as_str() != keep)
                .min_by_key(|(_, list)| list.iter().map(|e| e.last_used_at).max().unwrap_or(i64::MIN))
                .map(|(k, _)| k.clone());

            match victim {
                Some(key) => {
                    debug!(url_pattern = %key, "Evicting url pattern from memory cache");
                    self.entries.remove(&key);
                }
                None => break,
            }
        }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wayfind_core::NewSelector;

    fn entry(id: &str, pattern: &str, used_at: i64) -> SelectorEntry {
        let mut e = NewSelector::new(id, pattern, "#el").into_entry(id.to_string(), used_at, 60_000, 5);
        e.last_used_at = used_at;
        e
    }

    #[test]
    fn test_evicts_oldest_key() {
        let mut cache = MemoryCache::new(2);
        cache.insert("/x", vec![entry("x1", "/x", 1)]);
        cache.insert("/y", vec![entry("y1", "/y", 2)]);
        cache.insert("/z", vec![entry("z1", "/z", 3)]);

        assert_eq!(cache.len(), 2);
        assert!(!cache.contains("/x"));
        assert!(cache.contains("/y"));
        assert!(cache.contains("/z"));
    }

    #[test]
    fn test_eviction_uses_most_recent_entry_of_key() {
        let mut cache = MemoryCache::new(2);
        cache.insert("/x", vec![entry("x1", "/x", 1), entry("x2", "/x", 10)]);
        cache.insert("/y", vec![entry("y1", "/y", 5)]);
        cache.insert("/z", vec![entry("z1", "/z", 6)]);

        assert!(cache.contains("/x"));
        assert!(!cache.contains("/y"));
    }

    #[test]
    fn test_never_evicts_key_just_written() {
        let mut cache = MemoryCache::new(1);
        cache.insert("/new", vec![entry("n", "/new", 100)]);
        cache.insert("/old", vec![entry("o", "/old", 1)]);
        assert!(cache.contains("/old"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_get_filters_expired_and_drops_empty_key() {
        let mut cache = MemoryCache::new(10);
        let mut stale = entry("s", "/p", 0);
        stale.last_updated_at = 0;
        stale.ttl_ms = 10;
        let fresh = entry("f", "/p", 0);
        cache.insert("/p", vec![stale.clone(), fresh]);

        let live = cache.get("/p", 1_000).unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, "f");

        cache.insert("/q", vec![NewSelector::new("s", "/q", "#s").into_entry("q".into(), 0, 10, 5)]);
        assert!(cache.get("/q", 1_000).is_none());
        assert!(!cache.contains("/q"));
    }

    #[test]
    fn test_upsert_replaces_by_id_and_reranks() {
        let mut cache = MemoryCache::new(10);
        cache.insert("/p", vec![entry("a", "/p", 1), entry("b", "/p", 1)]);

        let mut b = entry("b", "/p", 2);
        b.success_count = 4;
        b.recompute_confidence();
        cache.upsert(b);

        let list = cache.get("/p", 0).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, "b");
        assert_eq!(list[0].success_count, 4);
    }

    #[test]
    fn test_find_by_test_id_global() {
        let mut cache = MemoryCache::new(10);
        let mut strong = entry("login", "/a", 1);
        strong.success_count = 5;
        strong.recompute_confidence();
        cache.insert("/a", vec![strong]);
        cache.insert("/b", vec![entry("login", "/b", 1)]);

        let best = cache.find_by_test_id("login", None, 0).unwrap();
        assert_eq!(best.url_pattern, "/a");
        let scoped = cache.find_by_test_id("login", Some("/b"), 0).unwrap();
        assert_eq!(scoped.url_pattern, "/b");
        assert!(cache.find_by_test_id("nope", None, 0).is_none());
    }

    #[test]
    fn test_sweep_and_remove() {
        let mut cache = MemoryCache::new(10);
        let mut stale = entry("s", "/p", 0);
        stale.ttl_ms = 1;
        cache.insert("/p", vec![stale, entry("f", "/p", 0)]);
        cache.insert("/q", vec![entry("g", "/q", 0)]);

        assert_eq!(cache.sweep_expired(5_000), 1);
        assert_eq!(cache.entry_count(), 2);
        assert!(cache.remove_entry("g"));
        assert!(!cache.contains("/q"));
        assert!(cache.remove_pattern("/p"));
        assert!(cache.is_empty());
    }
}
