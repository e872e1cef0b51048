use std::collections::HashMap;
use wayfind_core::SelectorEntry;

/// Staging area for entries loaded ahead of navigation.
///
/// Only the prefetch path writes here. A hit removes the pattern so the
/// entries live in exactly one in-memory tier after promotion.
#[derive(Debug, Clone, Default)]
pub struct PrefetchQueue {
    staged: HashMap<String, Vec<SelectorEntry>>,
}

impl PrefetchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.staged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    pub fn contains(&self, url_pattern: &str) -> bool {
        self.staged.contains_key(url_pattern)
    }

    pub fn stage(&mut self, url_pattern: &str, entries: Vec<SelectorEntry>) {
        if entries.is_empty() {
            return;
        }
        self.staged.insert(url_pattern.to_string(), entries);
    }

    /// Remove and return the unexpired entries staged for `url_pattern`.
    pub fn take(&mut self, url_pattern: &str, now_ms: i64) -> Option<Vec<SelectorEntry>> {
        let entries = self.staged.remove(url_pattern)?;
        let live: Vec<SelectorEntry> = entries.into_iter().filter(|e| !e.is_expired(now_ms)).collect();
        (!live.is_empty()).then_some(live)
    }

    /// Pattern of the best staged entry carrying `test_id`.
    pub fn pattern_for_test_id(&self, test_id: &str, now_ms: i64) -> Option<String> {
        self.staged
            .iter()
            .flat_map(|(k, list)| list.iter().map(move |e| (k, e)))
            .filter(|(_, e)| e.test_id == test_id && !e.is_expired(now_ms))
            .max_by(|(_, a), (_, b)| {
                a.confidence
                    .partial_cmp(&b.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(k, _)| k.clone())
    }

    /// Replace a staged copy of `entry` so a later promotion does not resurrect stale state.
    pub fn refresh(&mut self, entry: &SelectorEntry) {
        if let Some(list) = self.staged.get_mut(&entry.url_pattern) {
            if let Some(slot) = list.iter_mut().find(|e| e.id == entry.id) {
                *slot = entry.clone();
            }
        }
    }

    pub fn remove_entry(&mut self, id: &str) {
        self.staged.retain(|_, list| {
            list.retain(|e| e.id != id);
            !list.is_empty()
        });
    }

    pub fn remove_pattern(&mut self, url_pattern: &str) -> bool {
        self.staged.remove(url_pattern).is_some()
    }

    /// Drop expired entries via a filtered copy.
    pub fn sweep_expired(&mut self, now_ms: i64) -> usize {
        let before: usize = self.staged.values().map(Vec::len).sum();
        let swept: HashMap<String, Vec<SelectorEntry>> = self
            .staged
            .iter()
            .filter_map(|(k, list)| {
                let live: Vec<SelectorEntry> =
                    list.iter().filter(|e| !e.is_expired(now_ms)).cloned().collect();
                (!live.is_empty()).then(|| (k.clone(), live))
            })
            .collect();
        self.staged = swept;
        before - self.staged.values().map(Vec::len).sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wayfind_core::NewSelector;

    fn entry(test_id: &str, pattern: &str, ttl: i64) -> SelectorEntry {
        NewSelector::new(test_id, pattern, "#el").into_entry(format!("{}-{}", test_id, pattern), 0, ttl, 5)
    }

    #[test]
    fn test_take_removes_pattern() {
        let mut queue = PrefetchQueue::new();
        queue.stage("/b", vec![entry("buy", "/b", 1_000)]);
        assert!(queue.contains("/b"));

        let taken = queue.take("/b", 10).unwrap();
        assert_eq!(taken.len(), 1);
        assert!(queue.is_empty());
        assert!(queue.take("/b", 10).is_none());
    }

    #[test]
    fn test_take_skips_expired() {
        let mut queue = PrefetchQueue::new();
        queue.stage("/b", vec![entry("buy", "/b", 5)]);
        assert!(queue.take("/b", 100).is_none());
        assert!(!queue.contains("/b"));
    }

    #[test]
    fn test_pattern_for_test_id_and_sweep() {
        let mut queue = PrefetchQueue::new();
        queue.stage("/b", vec![entry("buy", "/b", 1_000), entry("old", "/b", 1)]);
        queue.stage("/c", vec![entry("old", "/c", 1)]);

        assert_eq!(queue.pattern_for_test_id("buy", 10).as_deref(), Some("/b"));
        assert!(queue.pattern_for_test_id("old", 10).is_none());

        assert_eq!(queue.sweep_expired(10), 2);
        assert_eq!(queue.len(), 1);
    }
}
