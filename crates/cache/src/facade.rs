use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use wayfind_core::{
    CacheConfig, CacheStats, Lookup, LookupSource, NewSelector, Prediction, Result,
    SelectorEntry, SelectorHealth, TelemetryEvent, TelemetrySink,
};
use wayfind_storage::SelectorStore;

use crate::memory_cache::MemoryCache;
use crate::navigation::NavigationModel;
use crate::prefetch::PrefetchQueue;
use crate::reliability;
use crate::writer::{StoreOp, StoreWriter};

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Tier that produced a result. Store reads surface to callers as `cache`;
/// the distinction is kept for telemetry only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tier {
    Memory,
    Prefetch,
    Store,
}

impl Tier {
    fn source(self) -> LookupSource {
        match self {
            Tier::Memory | Tier::Store => LookupSource::Cache,
            Tier::Prefetch => LookupSource::Prefetch,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Tier::Memory => "cache",
            Tier::Prefetch => "prefetch",
            Tier::Store => "store",
        }
    }
}

/// Poisoned locks still hold consistent data: every mutation swaps whole entries.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Tiered selector cache: memory, prefetch staging, then the durable store.
///
/// Reads are synchronous and never wait for a pending store write. Store
/// mutations are queued to a background writer. When the store cannot be
/// opened the cache keeps serving from memory alone.
pub struct SelectorCache {
    config: CacheConfig,
    store: Option<SelectorStore>,
    writer: Option<StoreWriter>,
    writer_handle: Mutex<Option<JoinHandle<()>>>,
    memory: Mutex<MemoryCache>,
    prefetch: Mutex<PrefetchQueue>,
    navigation: Mutex<NavigationModel>,
    telemetry: Arc<dyn TelemetrySink>,
    hits: AtomicU64,
    misses: AtomicU64,
    shutdown_tx: broadcast::Sender<()>,
    closed: AtomicBool,
}

impl SelectorCache {
    /// Build the cache, opening the store at `db_path` when persistence is on.
    /// Must be called from within a tokio runtime.
    pub async fn init(
        config: CacheConfig,
        db_path: Option<&Path>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Arc<Self> {
        let store = match db_path {
            Some(path) if config.persistent => match SelectorStore::open(path) {
                Ok(store) => Some(store),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Selector store unavailable, running memory-only");
                    None
                }
            },
            _ => None,
        };

        let (writer, writer_handle) = match &store {
            Some(store) => {
                let (writer, handle) = StoreWriter::spawn(store.clone(), config.write_queue_size);
                (Some(writer), Some(handle))
            }
            None => (None, None),
        };

        let (shutdown_tx, _) = broadcast::channel(1);
        info!(
            persistent = store.is_some(),
            capacity = config.memory_capacity,
            "Selector cache initialized"
        );

        Arc::new(Self {
            memory: Mutex::new(MemoryCache::new(config.memory_capacity)),
            prefetch: Mutex::new(PrefetchQueue::new()),
            navigation: Mutex::new(NavigationModel::new(config.navigation_capacity)),
            config,
            store,
            writer,
            writer_handle: Mutex::new(writer_handle),
            telemetry,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            shutdown_tx,
            closed: AtomicBool::new(false),
        })
    }

    pub async fn in_memory(config: CacheConfig, telemetry: Arc<dyn TelemetrySink>) -> Arc<Self> {
        Self::init(config, None, telemetry).await
    }

    pub fn is_persistent(&self) -> bool {
        self.store.is_some()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    // ── Lookups ─────────────────────────────────────────────────────────

    /// Ranked entries for a url pattern. An empty result means "discover live".
    pub fn get_selectors(&self, url_pattern: &str) -> Lookup {
        let started = Instant::now();
        let (lookup, tier) = self.lookup_pattern(url_pattern, now_ms());
        let source = tier.map_or(LookupSource::DiscoveryMiss.as_str(), Tier::as_str);

        if lookup.is_empty() {
            self.misses.fetch_add(1, Ordering::Relaxed);
        } else {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        debug!(
            url_pattern,
            source,
            count = lookup.entries.len(),
            "get_selectors"
        );
        self.emit("get_selectors", url_pattern, lookup.entries.len(), started, source);
        lookup
    }

    /// Single best entry for `test_id`, scoped to `url_pattern` when given.
    pub fn get_selector_by_test_id(
        &self,
        test_id: &str,
        url_pattern: Option<&str>,
    ) -> Option<SelectorEntry> {
        let started = Instant::now();
        let found = self.locate(test_id, url_pattern, now_ms());

        let source = match &found {
            Some((_, source)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                source.as_str()
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                LookupSource::DiscoveryMiss.as_str()
            }
        };
        self.emit("get_selector_by_test_id", test_id, found.is_some() as usize, started, source);
        found.map(|(entry, _)| entry)
    }

    fn lookup_pattern(&self, url_pattern: &str, now: i64) -> (Lookup, Option<Tier>) {
        let min = self.config.min_confidence;
        let ranked = |entries: Vec<SelectorEntry>| -> Vec<SelectorEntry> {
            entries.into_iter().filter(|e| e.confidence >= min).collect()
        };

        if let Some(entries) = lock(&self.memory).get(url_pattern, now) {
            let entries = ranked(entries);
            if !entries.is_empty() {
                return (Lookup { source: Tier::Memory.source(), entries }, Some(Tier::Memory));
            }
        }

        let staged = lock(&self.prefetch).take(url_pattern, now);
        if let Some(entries) = staged {
            lock(&self.memory).insert(url_pattern, entries.clone());
            let mut entries = ranked(entries);
            entries.sort_by(SelectorEntry::rank_cmp);
            if !entries.is_empty() {
                return (Lookup { source: Tier::Prefetch.source(), entries }, Some(Tier::Prefetch));
            }
        }

        let loaded = self.load_from_store(url_pattern, now);
        if !loaded.is_empty() {
            lock(&self.memory).insert(url_pattern, loaded.clone());
            let entries = ranked(loaded);
            if !entries.is_empty() {
                return (Lookup { source: Tier::Store.source(), entries }, Some(Tier::Store));
            }
        }

        (Lookup::miss(), None)
    }

    /// Memory, then prefetch (promoting), then store (populating memory).
    fn locate(
        &self,
        test_id: &str,
        url_pattern: Option<&str>,
        now: i64,
    ) -> Option<(SelectorEntry, Tier)> {
        if let Some(entry) = lock(&self.memory).find_by_test_id(test_id, url_pattern, now) {
            return Some((entry, Tier::Memory));
        }

        let staged_pattern = {
            let queue = lock(&self.prefetch);
            match url_pattern {
                Some(p) if queue.contains(p) => Some(p.to_string()),
                Some(_) => None,
                None => queue.pattern_for_test_id(test_id, now),
            }
        };
        if let Some(pattern) = staged_pattern {
            let promoted = lock(&self.prefetch).take(&pattern, now);
            if let Some(entries) = promoted {
                let best = entries
                    .iter()
                    .filter(|e| e.test_id == test_id)
                    .min_by(|a, b| SelectorEntry::rank_cmp(a, b))
                    .cloned();
                lock(&self.memory).insert(&pattern, entries);
                if let Some(entry) = best {
                    return Some((entry, Tier::Prefetch));
                }
            }
        }

        let store = self.store.as_ref()?;
        let entry = match store.get_by_test_id(test_id, url_pattern) {
            Ok(Some(entry)) if !entry.is_expired(now) => entry,
            Ok(_) => return None,
            Err(e) => {
                warn!(test_id, error = %e, "Selector store lookup failed");
                return None;
            }
        };

        let mut siblings = self.load_from_store(&entry.url_pattern, now);
        if !siblings.iter().any(|e| e.id == entry.id) {
            siblings.push(entry.clone());
        }
        lock(&self.memory).insert(&entry.url_pattern, siblings);
        Some((entry, Tier::Store))
    }

    fn load_from_store(&self, url_pattern: &str, now: i64) -> Vec<SelectorEntry> {
        let Some(store) = &self.store else {
            return Vec::new();
        };
        match store.query(url_pattern, self.config.min_confidence, self.config.query_limit) {
            Ok(entries) => entries.into_iter().filter(|e| !e.is_expired(now)).collect(),
            Err(e) => {
                warn!(url_pattern, error = %e, "Selector store query failed");
                Vec::new()
            }
        }
    }

    /// Make sure memory holds the full list for `url_pattern` before a partial write.
    fn warm_pattern(&self, url_pattern: &str, now: i64) {
        if lock(&self.memory).contains(url_pattern) {
            return;
        }
        let staged = lock(&self.prefetch).take(url_pattern, now);
        let entries = match staged {
            Some(entries) => entries,
            None => self.load_from_store(url_pattern, now),
        };
        if !entries.is_empty() {
            lock(&self.memory).insert(url_pattern, entries);
        }
    }

    // ── Writes ──────────────────────────────────────────────────────────

    /// Assign an id and write the selector through both tiers.
    pub fn cache_selector(&self, selector: NewSelector) -> Result<String> {
        let started = Instant::now();
        if selector.test_id.trim().is_empty()
            || selector.url_pattern.trim().is_empty()
            || selector.css_selector.trim().is_empty()
        {
            return Err(wayfind_core::Error::Validation(
                "testId, urlPattern and cssSelector are required".to_string(),
            ));
        }

        let now = now_ms();
        let id = uuid::Uuid::new_v4().to_string();
        let entry = selector.into_entry(
            id.clone(),
            now,
            self.config.default_ttl_ms,
            self.config.max_alternatives,
        );

        self.warm_pattern(&entry.url_pattern, now);
        lock(&self.memory).upsert(entry.clone());
        debug!(id = %id, test_id = %entry.test_id, url_pattern = %entry.url_pattern, "Selector cached");
        self.emit("cache_selector", &entry.url_pattern, 1, started, LookupSource::Cache.as_str());
        self.enqueue(StoreOp::Put(entry));
        Ok(id)
    }

    /// Count a successful use. Returns the updated entry, or `None` if unknown.
    pub fn record_success(&self, test_id: &str, url_pattern: &str) -> Option<SelectorEntry> {
        let started = Instant::now();
        let now = now_ms();
        let Some((current, source)) = self.locate(test_id, Some(url_pattern), now) else {
            debug!(test_id, url_pattern, "record_success for unknown selector");
            return None;
        };

        let updated = reliability::apply_success(&current, now);
        self.replace(&updated);
        self.emit("record_success", test_id, 1, started, source.as_str());
        self.enqueue(StoreOp::Outcome { entry: updated.clone(), success: true });
        Some(updated)
    }

    /// Count a failure and try to heal. Returns the replacement entry, or
    /// `None` when no alternative is left (or the selector is unknown).
    pub fn record_failure(&self, test_id: &str, url_pattern: &str) -> Option<SelectorEntry> {
        let started = Instant::now();
        let now = now_ms();
        let Some((current, source)) = self.locate(test_id, Some(url_pattern), now) else {
            debug!(test_id, url_pattern, "record_failure for unknown selector");
            return None;
        };

        // Alternatives are shared by every entry for this element; a locator
        // consumed through one entry is gone for all of them.
        let siblings: Vec<SelectorEntry> = lock(&self.memory)
            .get(url_pattern, now)
            .unwrap_or_default()
            .into_iter()
            .filter(|e| e.test_id == test_id && e.id != current.id)
            .collect();
        let live_primaries: Vec<String> = siblings.iter().map(|e| e.css_selector.clone()).collect();

        let healed_id = uuid::Uuid::new_v4().to_string();
        let outcome = reliability::apply_failure(&current, now, healed_id, &live_primaries);
        self.replace(&outcome.updated);
        self.emit("record_failure", test_id, 1, started, source.as_str());
        self.enqueue(StoreOp::Outcome { entry: outcome.updated.clone(), success: false });

        if !outcome.consumed.is_empty() {
            self.enqueue(StoreOp::Alternatives(outcome.updated.clone()));
            for sibling in &siblings {
                if let Some(stripped) = reliability::strip_alternatives(sibling, &outcome.consumed) {
                    self.replace(&stripped);
                    self.enqueue(StoreOp::Alternatives(stripped));
                }
            }
        }

        match outcome.healed {
            Some(healed) => {
                lock(&self.memory).upsert(healed.clone());
                self.enqueue(StoreOp::Put(healed.clone()));
                info!(
                    test_id,
                    url_pattern,
                    from = %current.css_selector,
                    to = %healed.css_selector,
                    remaining = outcome.updated.alternatives.len(),
                    "Selector auto-healed"
                );
                self.emit("heal", test_id, 1, started, source.as_str());
                Some(healed)
            }
            None => {
                debug!(
                    test_id,
                    url_pattern,
                    health = %outcome.updated.health(),
                    "No alternative left to heal selector"
                );
                None
            }
        }
    }

    /// Merge extra fallback locators into the best entry for `(test_id, url_pattern)`.
    pub fn add_alternatives(
        &self,
        test_id: &str,
        url_pattern: &str,
        alternatives: &[String],
    ) -> Option<SelectorEntry> {
        let now = now_ms();
        let (current, _) = self.locate(test_id, Some(url_pattern), now)?;
        let updated = reliability::merge_alternatives(
            &current,
            alternatives,
            self.config.max_alternatives,
            now,
        );
        self.replace(&updated);
        self.enqueue(StoreOp::Alternatives(updated.clone()));
        Some(updated)
    }

    pub fn delete_selector(&self, id: &str) {
        lock(&self.memory).remove_entry(id);
        lock(&self.prefetch).remove_entry(id);
        self.enqueue(StoreOp::Delete(id.to_string()));
    }

    /// Drop the in-memory copies for one pattern; the store is untouched.
    pub fn invalidate(&self, url_pattern: &str) {
        lock(&self.memory).remove_pattern(url_pattern);
        lock(&self.prefetch).remove_pattern(url_pattern);
    }

    pub fn health(&self, test_id: &str, url_pattern: &str) -> Option<SelectorHealth> {
        self.locate(test_id, Some(url_pattern), now_ms())
            .map(|(entry, _)| entry.health())
    }

    fn replace(&self, entry: &SelectorEntry) {
        lock(&self.memory).upsert(entry.clone());
        lock(&self.prefetch).refresh(entry);
    }

    fn enqueue(&self, op: StoreOp) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if let Some(writer) = &self.writer {
            writer.enqueue(op);
        }
    }

    // ── Navigation & prefetch ───────────────────────────────────────────

    /// Record a page transition and warm the cache for likely next pages
    /// in the background. Never waits on the prefetch.
    pub fn record_navigation(self: &Arc<Self>, from_url: &str, to_url: &str) {
        let now = now_ms();
        lock(&self.navigation).record_transition(from_url, to_url, now);
        self.enqueue(StoreOp::Transition {
            from_url: from_url.to_string(),
            to_url: to_url.to_string(),
            at_ms: now,
        });

        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                debug!(to_url, "No runtime available, skipping prefetch");
                return;
            }
        };

        let cache = Arc::clone(self);
        let target = to_url.to_string();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        runtime.spawn(async move {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!(url = %target, "Prefetch abandoned on shutdown");
                }
                staged = cache.prefetch_for_navigation(&target) => {
                    debug!(url = %target, staged, "Background prefetch finished");
                }
            }
        });
    }

    /// Ranked next destinations from `from_url`.
    pub fn predict(&self, from_url: &str) -> Vec<Prediction> {
        let historical = match &self.store {
            Some(store) => store.transitions_from(from_url).unwrap_or_else(|e| {
                warn!(from_url, error = %e, "Failed to read navigation history");
                Vec::new()
            }),
            None => Vec::new(),
        };
        lock(&self.navigation).predict(from_url, &historical)
    }

    /// Stage entries for every likely destination of `current_url`.
    /// Returns the number of url patterns staged.
    pub async fn prefetch_for_navigation(&self, current_url: &str) -> usize {
        let started = Instant::now();
        let threshold = self.config.prefetch_confidence_threshold;
        let targets: Vec<String> = self
            .predict(current_url)
            .into_iter()
            .filter(|p| p.probability >= threshold)
            .map(|p| p.to_url)
            .collect();

        let mut staged = 0usize;
        let mut staged_entries = 0usize;
        for target in targets {
            let now = now_ms();
            if lock(&self.memory).get(&target, now).is_some() || lock(&self.prefetch).contains(&target) {
                continue;
            }
            let Some(store) = self.store.clone() else {
                break;
            };

            let query_target = target.clone();
            let min = self.config.min_confidence;
            let limit = self.config.query_limit;
            let loaded = tokio::task::spawn_blocking(move || store.query(&query_target, min, limit)).await;
            let entries: Vec<SelectorEntry> = match loaded {
                Ok(Ok(entries)) => entries.into_iter().filter(|e| !e.is_expired(now)).collect(),
                Ok(Err(e)) => {
                    warn!(url = %target, error = %e, "Prefetch query failed");
                    continue;
                }
                Err(e) => {
                    warn!(url = %target, error = %e, "Prefetch task failed");
                    continue;
                }
            };

            if entries.is_empty() {
                continue;
            }
            staged_entries += entries.len();
            staged += 1;
            lock(&self.prefetch).stage(&target, entries);
        }

        if staged > 0 {
            debug!(current_url, staged, staged_entries, "Prefetched selectors");
        }
        self.emit("prefetch", current_url, staged_entries, started, LookupSource::Prefetch.as_str());
        staged
    }

    pub fn reset_navigation(&self) {
        lock(&self.navigation).clear();
        self.enqueue(StoreOp::ResetNavigation);
    }

    // ── Maintenance ─────────────────────────────────────────────────────

    /// Sweep TTL-expired entries from every tier. Returns the number removed.
    pub async fn cleanup(&self) -> usize {
        let started = Instant::now();
        let now = now_ms();

        let from_memory = lock(&self.memory).sweep_expired(now);
        let from_prefetch = lock(&self.prefetch).sweep_expired(now);
        let from_store = match self.store.clone() {
            Some(store) => match tokio::task::spawn_blocking(move || store.delete_expired(now)).await {
                Ok(Ok(removed)) => removed,
                Ok(Err(e)) => {
                    warn!(error = %e, "Store cleanup failed");
                    0
                }
                Err(e) => {
                    warn!(error = %e, "Store cleanup task failed");
                    0
                }
            },
            None => 0,
        };

        let total = from_memory + from_prefetch + from_store;
        info!(from_memory, from_prefetch, from_store, "Selector cache cleanup completed");
        self.emit("cleanup", "*", total, started, "cleanup");
        total
    }

    pub fn get_stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let (memory_cache_size, memory_entries, memory_conf_sum) = {
            let memory = lock(&self.memory);
            let sum: f64 = memory.all_entries().map(|e| e.confidence).sum();
            (memory.len(), memory.entry_count(), sum)
        };
        let prefetch_queue_size = lock(&self.prefetch).len();

        let durable = self.store.as_ref().and_then(|store| match store.aggregate() {
            Ok(agg) => Some(agg),
            Err(e) => {
                warn!(error = %e, "Failed to aggregate selector store");
                None
            }
        });
        let (total_selectors, avg_confidence) = match durable {
            Some(agg) => (agg.count, agg.avg_confidence),
            None if memory_entries > 0 => (memory_entries, memory_conf_sum / memory_entries as f64),
            None => (0, 0.0),
        };

        CacheStats {
            total_selectors,
            memory_cache_size,
            prefetch_queue_size,
            avg_confidence,
            hit_rate: if hits + misses == 0 {
                0.0
            } else {
                hits as f64 / (hits + misses) as f64
            },
            hits,
            misses,
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Wait until every queued store mutation has been applied.
    pub async fn flush(&self) {
        if let Some(writer) = &self.writer {
            writer.flush().await;
        }
    }

    /// Abandon running prefetches, drain pending writes and stop the writer.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.shutdown_tx.send(());
        self.flush().await;
        if let Some(handle) = lock(&self.writer_handle).take() {
            handle.abort();
        }
        info!("Selector cache closed");
    }

    fn emit(&self, action: &str, key: &str, count: usize, started: Instant, source: &str) {
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.telemetry
            .emit(TelemetryEvent::new(action, key, count, elapsed_ms, source));
    }
}
