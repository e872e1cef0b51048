use std::collections::HashMap;
use tracing::debug;
use wayfind_core::{NavigationEdge, Prediction};

/// In-memory record of observed page transitions.
///
/// Durable history is merged in at prediction time by the caller; edges seen
/// in this process take precedence over stored ones for the same destination.
/// At most `capacity` source pages are tracked; the page seen least recently
/// is dropped first and falls back to stored history.
#[derive(Debug, Clone)]
pub struct NavigationModel {
    edges: HashMap<String, HashMap<String, NavigationEdge>>,
    capacity: usize,
}

impl NavigationModel {
    pub const DEFAULT_CAPACITY: usize = 1000;

    pub fn new(capacity: usize) -> Self {
        Self {
            edges: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Number of source pages tracked.
    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Increment the `(from, to)` edge and return its updated state.
    pub fn record_transition(&mut self, from_url: &str, to_url: &str, now_ms: i64) -> NavigationEdge {
        let edge = self
            .edges
            .entry(from_url.to_string())
            .or_default()
            .entry(to_url.to_string())
            .or_insert_with(|| NavigationEdge {
                from_url: from_url.to_string(),
                to_url: to_url.to_string(),
                count: 0,
                last_seen_at: now_ms,
            });
        edge.count = edge.count.saturating_add(1);
        edge.last_seen_at = edge.last_seen_at.max(now_ms);
        let edge = edge.clone();

        self.evict_over_capacity(from_url);
        edge
    }

    pub fn edges_from(&self, from_url: &str) -> Vec<NavigationEdge> {
        self.edges
            .get(from_url)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.values().map(HashMap::len).sum()
    }

    pub fn clear(&mut self) {
        self.edges.clear();
    }

    fn evict_over_capacity(&mut self, keep: &str) {
        while self.edges.len() > self.capacity {
            let victim = self
                .edges
                .iter()
                .filter(|(k, _)| k.as_str() != keep)
                .min_by_key(|(_, to)| to.values().map(|e| e.last_seen_at).max().unwrap_or(i64::MIN))
                .map(|(k, _)| k.clone());

            match victim {
                Some(key) => {
                    debug!(from_url = %key, "Evicting source page from navigation model");
                    self.edges.remove(&key);
                }
                None => break,
            }
        }
    }

    /// Destinations from `from_url` ranked by probability.
    pub fn predict(&self, from_url: &str, historical: &[NavigationEdge]) -> Vec<Prediction> {
        let mut counts: HashMap<&str, u64> = HashMap::new();
        if let Some(fresh) = self.edges.get(from_url) {
            for edge in fresh.values() {
                counts.insert(edge.to_url.as_str(), edge.count);
            }
        }
        for edge in historical.iter().filter(|e| e.from_url == from_url) {
            counts.entry(edge.to_url.as_str()).or_insert(edge.count);
        }

        rank(counts)
    }
}

impl Default for NavigationModel {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

fn rank(counts: HashMap<&str, u64>) -> Vec<Prediction> {
    let total: u64 = counts.values().sum();
    if total == 0 {
        return Vec::new();
    }

    let mut predictions: Vec<Prediction> = counts
        .into_iter()
        .filter(|(_, count)| *count > 0)
        .map(|(to_url, count)| Prediction {
            to_url: to_url.to_string(),
            probability: count as f64 / total as f64,
        })
        .collect();
    predictions.sort_by(|a, b| {
        b.probability
            .partial_cmp(&a.probability)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.to_url.cmp(&b.to_url))
    });
    predictions
}
