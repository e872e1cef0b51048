use serde::{Deserialize, Serialize};

/// Confidence at or above which an entry is considered fresh.
pub const FRESH_CONFIDENCE: f64 = 0.7;
/// Confidence below which an entry without alternatives is exhausted.
pub const DEGRADED_CONFIDENCE: f64 = 0.3;
/// Confidence assigned to newly created and healed entries before any outcome.
pub const INITIAL_CONFIDENCE: f64 = 0.5;

/// Kind of UI element a selector points at.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ElementType {
    Button,
    Input,
    Select,
    Link,
    Form,
    #[default]
    Other,
}

impl ElementType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ElementType::Button => "button",
            ElementType::Input => "input",
            ElementType::Select => "select",
            ElementType::Link => "link",
            ElementType::Form => "form",
            ElementType::Other => "other",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "button" => Some(ElementType::Button),
            "input" => Some(ElementType::Input),
            "select" => Some(ElementType::Select),
            "link" => Some(ElementType::Link),
            "form" => Some(ElementType::Form),
            "other" => Some(ElementType::Other),
            _ => None,
        }
    }
}

/// Laplace-smoothed success ratio: `success / (success + failure + 1)`.
pub fn laplace_confidence(success_count: u64, failure_count: u64) -> f64 {
    success_count as f64 / (success_count as f64 + failure_count as f64 + 1.0)
}

/// Deduplicate `candidates` (keeping first occurrence), drop blanks and the
/// entry's own primary locator, and cap the result at `max`.
pub fn dedup_alternatives(primary: &str, candidates: &[String], max: usize) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(candidates.len().min(max));
    for candidate in candidates {
        let candidate = candidate.trim();
        if candidate.is_empty() || candidate == primary {
            continue;
        }
        if out.iter().any(|c| c == candidate) {
            continue;
        }
        if out.len() >= max {
            break;
        }
        out.push(candidate.to_string());
    }
    out
}

/// Health of an entry, derived from its confidence and remaining alternatives.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SelectorHealth {
    Fresh,
    Degraded,
    Exhausted,
}

impl std::fmt::Display for SelectorHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SelectorHealth::Fresh => write!(f, "fresh"),
            SelectorHealth::Degraded => write!(f, "degraded"),
            SelectorHealth::Exhausted => write!(f, "exhausted"),
        }
    }
}

/// One known way to find one logical element on one class of page.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SelectorEntry {
    pub id: String,
    pub domain: String,
    pub url_pattern: String,
    pub test_id: String,
    pub css_selector: String,
    pub xpath_selector: Option<String>,
    pub element_type: ElementType,
    pub description: String,
    pub confidence: f64,
    pub success_count: u64,
    pub failure_count: u64,
    /// Milliseconds since the Unix epoch.
    pub last_used_at: i64,
    pub last_updated_at: i64,
    pub ttl_ms: i64,
    pub alternatives: Vec<String>,
}

impl SelectorEntry {
    pub fn recompute_confidence(&mut self) {
        self.confidence = laplace_confidence(self.success_count, self.failure_count);
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.last_updated_at.saturating_add(self.ttl_ms) < now_ms
    }

    pub fn health(&self) -> SelectorHealth {
        if self.confidence >= FRESH_CONFIDENCE {
            SelectorHealth::Fresh
        } else if self.confidence >= DEGRADED_CONFIDENCE || !self.alternatives.is_empty() {
            SelectorHealth::Degraded
        } else {
            SelectorHealth::Exhausted
        }
    }

    /// Ranking used by every tier: confidence desc, then success count desc.
    pub fn rank_cmp(a: &SelectorEntry, b: &SelectorEntry) -> std::cmp::Ordering {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.success_count.cmp(&a.success_count))
    }
}

/// A selector as supplied by the caller, before an id is assigned.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NewSelector {
    /// Left empty to derive it from `url_pattern`.
    #[serde(default)]
    pub domain: String,
    pub url_pattern: String,
    pub test_id: String,
    pub css_selector: String,
    #[serde(default)]
    pub xpath_selector: Option<String>,
    #[serde(default)]
    pub element_type: ElementType,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub alternatives: Vec<String>,
    #[serde(default)]
    pub ttl_ms: Option<i64>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

impl NewSelector {
    pub fn new(test_id: &str, url_pattern: &str, css_selector: &str) -> Self {
        Self {
            url_pattern: url_pattern.to_string(),
            test_id: test_id.to_string(),
            css_selector: css_selector.to_string(),
            ..Default::default()
        }
    }

    pub fn with_alternatives(mut self, alternatives: &[&str]) -> Self {
        self.alternatives = alternatives.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Materialize into a stored entry with fresh counters.
    pub fn into_entry(
        self,
        id: String,
        now_ms: i64,
        default_ttl_ms: i64,
        max_alternatives: usize,
    ) -> SelectorEntry {
        let domain = if self.domain.trim().is_empty() {
            domain_of(&self.url_pattern).unwrap_or_default()
        } else {
            self.domain
        };
        let alternatives = dedup_alternatives(&self.css_selector, &self.alternatives, max_alternatives);
        SelectorEntry {
            id,
            domain,
            url_pattern: self.url_pattern,
            test_id: self.test_id,
            css_selector: self.css_selector,
            xpath_selector: self.xpath_selector.filter(|x| !x.trim().is_empty()),
            element_type: self.element_type,
            description: self.description,
            confidence: self
                .confidence
                .map(|c| c.clamp(0.0, 1.0))
                .unwrap_or(INITIAL_CONFIDENCE),
            success_count: 0,
            failure_count: 0,
            last_used_at: now_ms,
            last_updated_at: now_ms,
            ttl_ms: self.ttl_ms.filter(|t| *t > 0).unwrap_or(default_ttl_ms),
            alternatives,
        }
    }
}

/// Host of an absolute URL; `None` for relative patterns such as `/login`.
pub fn domain_of(url_pattern: &str) -> Option<String> {
    url::Url::parse(url_pattern)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_string()))
}

/// One observed page-to-page transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NavigationEdge {
    pub from_url: String,
    pub to_url: String,
    pub count: u64,
    pub last_seen_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Prediction {
    pub to_url: String,
    pub probability: f64,
}

/// Tier that answered a lookup. Cold reads from the durable store report
/// `Cache`, since they land in the memory tier before being returned.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum LookupSource {
    Cache,
    Prefetch,
    DiscoveryMiss,
}

impl LookupSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            LookupSource::Cache => "cache",
            LookupSource::Prefetch => "prefetch",
            LookupSource::DiscoveryMiss => "discovery-miss",
        }
    }
}

/// Result of a url-pattern lookup. An empty lookup means "run live discovery".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Lookup {
    pub source: LookupSource,
    pub entries: Vec<SelectorEntry>,
}

impl Lookup {
    pub fn miss() -> Self {
        Self {
            source: LookupSource::DiscoveryMiss,
            entries: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StoreAggregate {
    pub count: usize,
    pub avg_confidence: f64,
    pub total_success: u64,
    pub total_failure: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CacheStats {
    pub total_selectors: usize,
    pub memory_cache_size: usize,
    pub prefetch_queue_size: usize,
    pub avg_confidence: f64,
    pub hit_rate: f64,
    pub hits: u64,
    pub misses: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(success: u64, failure: u64, alts: &[&str]) -> SelectorEntry {
        let mut e = NewSelector::new("btn", "/p", "#a")
            .with_alternatives(alts)
            .into_entry("id-1".to_string(), 1_000, 60_000, 5);
        e.success_count = success;
        e.failure_count = failure;
        e.recompute_confidence();
        e
    }

    #[test]
    fn test_laplace_confidence() {
        assert_eq!(laplace_confidence(0, 0), 0.0);
        assert_eq!(laplace_confidence(0, 1), 0.0);
        assert!((laplace_confidence(3, 0) - 0.75).abs() < 1e-9);
        assert!((laplace_confidence(5, 4) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_dedup_alternatives_caps_and_skips_primary() {
        let input: Vec<String> = ["#a", "#b", "#b", " ", "#c", "#d", "#e"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let out = dedup_alternatives("#a", &input, 3);
        assert_eq!(out, vec!["#b", "#c", "#d"]);
    }

    #[test]
    fn test_into_entry_defaults() {
        let e = NewSelector::new("login-btn", "https://shop.example.com/login", "#login")
            .into_entry("x".to_string(), 42, 1_000, 5);
        assert_eq!(e.domain, "shop.example.com");
        assert_eq!(e.confidence, INITIAL_CONFIDENCE);
        assert_eq!(e.ttl_ms, 1_000);
        assert_eq!(e.last_updated_at, 42);

        let relative = NewSelector::new("a", "/login", "#a").into_entry("y".to_string(), 0, 1, 5);
        assert_eq!(relative.domain, "");
    }

    #[test]
    fn test_expiry_boundary() {
        let e = entry(0, 0, &[]);
        assert!(!e.is_expired(61_000));
        assert!(e.is_expired(61_001));
    }

    #[test]
    fn test_health_states() {
        assert_eq!(entry(9, 0, &[]).health(), SelectorHealth::Fresh);
        assert_eq!(entry(1, 1, &[]).health(), SelectorHealth::Degraded);
        assert_eq!(entry(0, 3, &["#b"]).health(), SelectorHealth::Degraded);
        assert_eq!(entry(0, 3, &[]).health(), SelectorHealth::Exhausted);
    }

    #[test]
    fn test_lookup_source_serializes_kebab() {
        let json = serde_json::to_string(&LookupSource::DiscoveryMiss).unwrap();
        assert_eq!(json, "\"discovery-miss\"");
        assert_eq!(LookupSource::Prefetch.as_str(), "prefetch");
    }
}
