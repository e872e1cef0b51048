//! Outcome bookkeeping and auto-heal for selector entries.
//!
//! Every function returns a new entry; callers swap it in whole so readers
//! never observe a half-updated record.

use wayfind_core::types::{dedup_alternatives, INITIAL_CONFIDENCE};
use wayfind_core::SelectorEntry;

/// Result of recording a failure.
#[derive(Debug, Clone)]
pub struct FailureOutcome {
    /// The failing entry with its counter bumped and, when healed, one
    /// alternative consumed.
    pub updated: SelectorEntry,
    /// Replacement built from the first usable alternative, if any was left.
    pub healed: Option<SelectorEntry>,
    /// Locators removed from `updated.alternatives`, in order. Sibling
    /// entries for the same element must drop these too.
    pub consumed: Vec<String>,
}

pub fn apply_success(entry: &SelectorEntry, now_ms: i64) -> SelectorEntry {
    let mut next = entry.clone();
    next.success_count = next.success_count.saturating_add(1);
    next.recompute_confidence();
    next.last_used_at = now_ms;
    next.last_updated_at = now_ms;
    next
}

/// Bump the failure counter and try to heal from the alternatives list.
///
/// Alternatives are consumed front to back and never replenished here.
/// A locator that is already the primary of a live sibling (`live_primaries`)
/// is consumed without producing a heal.
pub fn apply_failure(
    entry: &SelectorEntry,
    now_ms: i64,
    healed_id: String,
    live_primaries: &[String],
) -> FailureOutcome {
    let mut updated = entry.clone();
    updated.failure_count = updated.failure_count.saturating_add(1);
    updated.recompute_confidence();
    updated.last_updated_at = now_ms;

    let mut consumed = Vec::new();
    let mut usable = None;
    while !updated.alternatives.is_empty() {
        let candidate = updated.alternatives.remove(0);
        consumed.push(candidate.clone());
        if !live_primaries.iter().any(|p| *p == candidate) {
            usable = Some(candidate);
            break;
        }
    }

    let Some(locator) = usable else {
        return FailureOutcome {
            updated,
            healed: None,
            consumed,
        };
    };
    let healed = SelectorEntry {
        id: healed_id,
        domain: updated.domain.clone(),
        url_pattern: updated.url_pattern.clone(),
        test_id: updated.test_id.clone(),
        css_selector: locator.clone(),
        xpath_selector: None,
        element_type: updated.element_type,
        description: updated.description.clone(),
        confidence: INITIAL_CONFIDENCE,
        success_count: 0,
        failure_count: 0,
        last_used_at: now_ms,
        last_updated_at: now_ms,
        ttl_ms: updated.ttl_ms,
        alternatives: dedup_alternatives(&locator, &updated.alternatives, updated.alternatives.len()),
    };

    FailureOutcome {
        updated,
        healed: Some(healed),
        consumed,
    }
}

/// Drop already-consumed locators from a sibling's alternatives.
/// Returns `None` when the sibling carries none of them.
pub fn strip_alternatives(entry: &SelectorEntry, consumed: &[String]) -> Option<SelectorEntry> {
    if !entry.alternatives.iter().any(|a| consumed.contains(a)) {
        return None;
    }
    let mut next = entry.clone();
    next.alternatives.retain(|a| !consumed.contains(a));
    Some(next)
}

/// Merge `additions` after the existing alternatives, dedupe, and cap at `max`.
pub fn merge_alternatives(
    entry: &SelectorEntry,
    additions: &[String],
    max: usize,
    now_ms: i64,
) -> SelectorEntry {
    let mut combined = entry.alternatives.clone();
    combined.extend(additions.iter().cloned());

    let mut next = entry.clone();
    next.alternatives = dedup_alternatives(&entry.css_selector, &combined, max);
    next.last_updated_at = now_ms;
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use wayfind_core::{NewSelector, SelectorHealth};

    fn entry(alts: &[&str]) -> SelectorEntry {
        NewSelector::new("x", "/p", "#a")
            .with_alternatives(alts)
            .into_entry("orig".to_string(), 0, 60_000, 5)
    }

    fn assert_invariant(e: &SelectorEntry) {
        let expected = e.success_count as f64 / (e.success_count + e.failure_count + 1) as f64;
        assert!((e.confidence - expected).abs() < 1e-12);
        assert!((0.0..=1.0).contains(&e.confidence));
    }

    #[test]
    fn test_success_updates_counters_and_usage() {
        let e = apply_success(&entry(&[]), 77);
        assert_eq!(e.success_count, 1);
        assert_eq!(e.last_used_at, 77);
        assert_invariant(&e);
    }

    #[test]
    fn test_failure_without_alternatives_is_exhausted() {
        let outcome = apply_failure(&entry(&[]), 10, "new".to_string(), &[]);
        assert!(outcome.healed.is_none());
        assert_eq!(outcome.updated.confidence, 0.0);
        assert_eq!(outcome.updated.health(), SelectorHealth::Exhausted);
        assert_invariant(&outcome.updated);
    }

    #[test]
    fn test_failure_heals_from_first_alternative() {
        let outcome = apply_failure(&entry(&["#b", "#c"]), 10, "healed".to_string(), &[]);
        let healed = outcome.healed.unwrap();

        assert_eq!(healed.css_selector, "#b");
        assert_eq!(healed.confidence, 0.5);
        assert_eq!(healed.success_count, 0);
        assert_eq!(healed.failure_count, 0);
        assert_eq!(healed.test_id, "x");
        assert_eq!(healed.id, "healed");
        assert_eq!(outcome.updated.alternatives, vec!["#c"]);
        assert_eq!(outcome.updated.failure_count, 1);
    }

    #[test]
    fn test_heal_count_matches_alternatives() {
        let mut current = entry(&["#b", "#c", "#d"]);
        let mut heals = 0;
        for i in 0..4 {
            let outcome = apply_failure(&current, i, format!("h{}", i), &[]);
            assert_invariant(&outcome.updated);
            match outcome.healed {
                Some(_) => heals += 1,
                None => {
                    assert_eq!(i, 3);
                }
            }
            current = outcome.updated;
        }
        assert_eq!(heals, 3);
        assert!(current.alternatives.is_empty());
    }

    #[test]
    fn test_failure_skips_locators_already_in_use() {
        let live = vec!["#b".to_string()];
        let outcome = apply_failure(&entry(&["#b", "#c", "#d"]), 10, "h".to_string(), &live);

        assert_eq!(outcome.healed.unwrap().css_selector, "#c");
        assert_eq!(outcome.consumed, vec!["#b", "#c"]);
        assert_eq!(outcome.updated.alternatives, vec!["#d"]);

        let all_live = vec!["#d".to_string()];
        let exhausted = apply_failure(&outcome.updated, 11, "h2".to_string(), &all_live);
        assert!(exhausted.healed.is_none());
        assert_eq!(exhausted.consumed, vec!["#d"]);
        assert!(exhausted.updated.alternatives.is_empty());
    }

    #[test]
    fn test_strip_alternatives_only_touches_consumed() {
        let sibling = entry(&["#b", "#c"]);
        let stripped = strip_alternatives(&sibling, &["#b".to_string()]).unwrap();
        assert_eq!(stripped.alternatives, vec!["#c"]);
        assert!(strip_alternatives(&sibling, &["#z".to_string()]).is_none());
    }

    #[test]
    fn test_merge_alternatives_dedupes_and_caps() {
        let base = entry(&["#b"]);
        let additions: Vec<String> = ["#b", "#a", "#c", "#d", "#e", "#f", "#g"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let merged = merge_alternatives(&base, &additions, 5, 3);
        assert_eq!(merged.alternatives, vec!["#b", "#c", "#d", "#e", "#f"]);
        assert_eq!(merged.last_updated_at, 3);
    }
}
