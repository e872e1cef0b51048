use wayfind_core::types::{laplace_confidence, ElementType, NavigationEdge, SelectorEntry, StoreAggregate};
use wayfind_core::{Error, Result};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SELECTOR_COLUMNS: &str = "id, domain, url_pattern, test_id, css_selector, xpath_selector, \
     element_type, description, confidence, success_count, failure_count, last_used, \
     last_updated, ttl_ms, alternatives";

/// SQLite-backed durable store for selector records and navigation edges.
///
/// Writes go through `inner`; reads use a separate read-only connection so
/// a lookup never queues behind a write in progress (WAL readers see the
/// last committed state).
#[derive(Clone)]
pub struct SelectorStore {
    inner: Arc<Mutex<Connection>>,
    reader: Arc<Mutex<Connection>>,
    db_path: PathBuf,
}

impl SelectorStore {
    /// Open (or create) the selector database at the given path.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::StorageUnavailable(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(db_path).map_err(|e| {
            Error::StorageUnavailable(format!("Failed to open selector db: {}", e))
        })?;

        // Enable WAL mode for better concurrent read performance
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        conn.busy_timeout(BUSY_TIMEOUT).ok();
        init_schema(&conn, db_path)?;

        let reader = Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| {
            Error::StorageUnavailable(format!("Failed to open selector db for reading: {}", e))
        })?;
        reader.busy_timeout(BUSY_TIMEOUT).ok();

        Ok(Self {
            inner: Arc::new(Mutex::new(conn)),
            reader: Arc::new(Mutex::new(reader)),
            db_path: db_path.to_path_buf(),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.inner
            .lock()
            .map_err(|e| Error::Storage(format!("Lock error: {}", e)))
    }

    fn read_conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.reader
            .lock()
            .map_err(|e| Error::Storage(format!("Lock error: {}", e)))
    }

    /// Insert or fully replace an entry by id.
    pub fn put(&self, entry: &SelectorEntry) -> Result<()> {
        let conn = self.conn()?;
        let alternatives = serde_json::to_string(&entry.alternatives)?;

        conn.execute(
            "INSERT OR REPLACE INTO selectors (id, domain, url_pattern, test_id, css_selector,
                xpath_selector, element_type, description, confidence, success_count,
                failure_count, last_used, last_updated, ttl_ms, alternatives)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                entry.id,
                entry.domain,
                entry.url_pattern,
                entry.test_id,
                entry.css_selector,
                entry.xpath_selector,
                entry.element_type.as_str(),
                entry.description,
                entry.confidence,
                entry.success_count as i64,
                entry.failure_count as i64,
                entry.last_used_at,
                entry.last_updated_at,
                entry.ttl_ms,
                alternatives
            ],
        )
        .map_err(|e| Error::Storage(format!("Insert error: {}", e)))?;

        debug!(id = %entry.id, test_id = %entry.test_id, "Selector stored");
        Ok(())
    }

    /// Entries whose url pattern equals `pattern_or_domain` or whose domain
    /// matches it, ranked by confidence then success count.
    pub fn query(
        &self,
        pattern_or_domain: &str,
        min_confidence: f64,
        limit: usize,
    ) -> Result<Vec<SelectorEntry>> {
        let conn = self.read_conn()?;
        let sql = format!(
            "SELECT {} FROM selectors
             WHERE (url_pattern = ?1 OR domain = ?1) AND confidence >= ?2
             ORDER BY confidence DESC, success_count DESC
             LIMIT ?3",
            SELECTOR_COLUMNS
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| Error::Storage(format!("Prepare error: {}", e)))?;
        let rows = stmt
            .query_map(params![pattern_or_domain, min_confidence, limit as i64], decode_row)
            .map_err(|e| Error::Storage(format!("Query error: {}", e)))?;

        Ok(collect_rows(rows))
    }

    /// Best entry for a test id, scoped to `url_pattern` when given.
    pub fn get_by_test_id(
        &self,
        test_id: &str,
        url_pattern: Option<&str>,
    ) -> Result<Option<SelectorEntry>> {
        let conn = self.read_conn()?;
        let result = match url_pattern {
            Some(pattern) => {
                let sql = format!(
                    "SELECT {} FROM selectors WHERE test_id = ?1 AND url_pattern = ?2
                     ORDER BY confidence DESC, success_count DESC, last_updated DESC LIMIT 1",
                    SELECTOR_COLUMNS
                );
                conn.query_row(&sql, params![test_id, pattern], decode_row).optional()
            }
            None => {
                let sql = format!(
                    "SELECT {} FROM selectors WHERE test_id = ?1
                     ORDER BY confidence DESC, last_updated DESC LIMIT 1",
                    SELECTOR_COLUMNS
                );
                conn.query_row(&sql, params![test_id], decode_row).optional()
            }
        };

        match result {
            Ok(Some(Ok(entry))) => Ok(Some(entry)),
            Ok(Some(Err(e))) => {
                warn!(test_id, error = %e, "Skipping malformed selector row");
                Ok(None)
            }
            Ok(None) => Ok(None),
            Err(e) => Err(Error::Storage(format!("Query error: {}", e))),
        }
    }

    pub fn get_by_id(&self, id: &str) -> Result<Option<SelectorEntry>> {
        let conn = self.read_conn()?;
        let sql = format!("SELECT {} FROM selectors WHERE id = ?1", SELECTOR_COLUMNS);
        let row = conn
            .query_row(&sql, params![id], decode_row)
            .optional()
            .map_err(|e| Error::Storage(format!("Query error: {}", e)))?;
        row.transpose()
    }

    /// Record an outcome against the best row for `(test_id, url_pattern)`.
    /// Counter increment and confidence recomputation happen in one statement.
    pub fn update_outcome(
        &self,
        test_id: &str,
        url_pattern: &str,
        success: bool,
        now_ms: i64,
    ) -> Result<bool> {
        let id: Option<String> = {
            let conn = self.conn()?;
            conn.query_row(
                "SELECT id FROM selectors WHERE test_id = ?1 AND url_pattern = ?2
                 ORDER BY confidence DESC, success_count DESC LIMIT 1",
                params![test_id, url_pattern],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| Error::Storage(format!("Query error: {}", e)))?
        };

        match id {
            Some(id) => self.update_outcome_by_id(&id, success, now_ms),
            None => Ok(false),
        }
    }

    /// Returns false when no row has this id.
    pub fn update_outcome_by_id(&self, id: &str, success: bool, now_ms: i64) -> Result<bool> {
        let conn = self.conn()?;
        let (s, f) = if success { (1i64, 0i64) } else { (0i64, 1i64) };

        // All right-hand sides see the pre-update row.
        let affected = conn
            .execute(
                "UPDATE selectors SET
                    success_count = success_count + ?1,
                    failure_count = failure_count + ?2,
                    confidence = CAST(success_count + ?1 AS REAL)
                        / (success_count + ?1 + failure_count + ?2 + 1),
                    last_used = CASE WHEN ?1 = 1 THEN ?3 ELSE last_used END,
                    last_updated = ?3
                 WHERE id = ?4",
                params![s, f, now_ms, id],
            )
            .map_err(|e| Error::Storage(format!("Update error: {}", e)))?;

        Ok(affected > 0)
    }

    pub fn set_alternatives(&self, id: &str, alternatives: &[String]) -> Result<bool> {
        let conn = self.conn()?;
        let encoded = serde_json::to_string(alternatives)?;
        let affected = conn
            .execute(
                "UPDATE selectors SET alternatives = ?1 WHERE id = ?2",
                params![encoded, id],
            )
            .map_err(|e| Error::Storage(format!("Update error: {}", e)))?;
        Ok(affected > 0)
    }

    pub fn delete(&self, id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let affected = conn
            .execute("DELETE FROM selectors WHERE id = ?1", params![id])
            .map_err(|e| Error::Storage(format!("Delete error: {}", e)))?;
        Ok(affected > 0)
    }

    /// Remove rows whose `last_updated + ttl_ms` lies before `now_ms`.
    pub fn delete_expired(&self, now_ms: i64) -> Result<usize> {
        let conn = self.conn()?;
        let removed = conn
            .execute(
                "DELETE FROM selectors WHERE last_updated + ttl_ms < ?1",
                params![now_ms],
            )
            .map_err(|e| Error::Storage(format!("Delete error: {}", e)))?;

        if removed > 0 {
            info!(removed, "Expired selectors removed from store");
        }
        Ok(removed)
    }

    pub fn aggregate(&self) -> Result<StoreAggregate> {
        let conn = self.read_conn()?;
        conn.query_row(
            "SELECT COUNT(*), COALESCE(AVG(confidence), 0.0),
                    COALESCE(SUM(success_count), 0), COALESCE(SUM(failure_count), 0)
             FROM selectors",
            [],
            |row| {
                Ok(StoreAggregate {
                    count: row.get::<_, i64>(0)? as usize,
                    avg_confidence: row.get(1)?,
                    total_success: row.get::<_, i64>(2)? as u64,
                    total_failure: row.get::<_, i64>(3)? as u64,
                })
            },
        )
        .map_err(|e| Error::Storage(format!("Aggregate error: {}", e)))
    }

    /// Increment the `(from, to)` edge, creating it on first sight.
    pub fn record_transition(&self, from_url: &str, to_url: &str, now_ms: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO navigation_patterns (from_url, to_url, count, last_seen)
             VALUES (?1, ?2, 1, ?3)
             ON CONFLICT(from_url, to_url) DO UPDATE SET
                count = count + 1,
                last_seen = MAX(last_seen, excluded.last_seen)",
            params![from_url, to_url, now_ms],
        )
        .map_err(|e| Error::Storage(format!("Upsert error: {}", e)))?;
        Ok(())
    }

    pub fn transitions_from(&self, from_url: &str) -> Result<Vec<NavigationEdge>> {
        let conn = self.read_conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT from_url, to_url, count, last_seen FROM navigation_patterns
                 WHERE from_url = ?1 ORDER BY count DESC",
            )
            .map_err(|e| Error::Storage(format!("Prepare error: {}", e)))?;
        let rows = stmt
            .query_map(params![from_url], |row| {
                Ok(NavigationEdge {
                    from_url: row.get(0)?,
                    to_url: row.get(1)?,
                    count: row.get::<_, i64>(2)?.max(0) as u64,
                    last_seen_at: row.get(3)?,
                })
            })
            .map_err(|e| Error::Storage(format!("Query error: {}", e)))?;

        let mut edges = Vec::new();
        for row in rows {
            match row {
                Ok(edge) => edges.push(edge),
                Err(e) => warn!(error = %e, "Error reading navigation row"),
            }
        }
        Ok(edges)
    }

    /// Wipe every navigation edge.
    pub fn reset_navigation(&self) -> Result<usize> {
        let conn = self.conn()?;
        let removed = conn
            .execute("DELETE FROM navigation_patterns", [])
            .map_err(|e| Error::Storage(format!("Delete error: {}", e)))?;
        info!(removed, "Navigation patterns reset");
        Ok(removed)
    }
}

fn init_schema(conn: &Connection, db_path: &Path) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS selectors (
            id TEXT PRIMARY KEY,
            domain TEXT NOT NULL DEFAULT '',
            url_pattern TEXT NOT NULL,
            test_id TEXT NOT NULL,
            css_selector TEXT NOT NULL,
            xpath_selector TEXT,
            element_type TEXT NOT NULL DEFAULT 'other',
            description TEXT NOT NULL DEFAULT '',
            confidence REAL NOT NULL DEFAULT 0.5,
            success_count INTEGER NOT NULL DEFAULT 0,
            failure_count INTEGER NOT NULL DEFAULT 0,
            last_used INTEGER NOT NULL,
            last_updated INTEGER NOT NULL,
            ttl_ms INTEGER NOT NULL,
            alternatives TEXT NOT NULL DEFAULT '[]'
        );

        CREATE INDEX IF NOT EXISTS idx_selectors_domain ON selectors(domain);
        CREATE INDEX IF NOT EXISTS idx_selectors_url_pattern ON selectors(url_pattern);
        CREATE INDEX IF NOT EXISTS idx_selectors_test_id ON selectors(test_id);
        CREATE INDEX IF NOT EXISTS idx_selectors_confidence ON selectors(confidence DESC);

        CREATE TABLE IF NOT EXISTS navigation_patterns (
            from_url TEXT NOT NULL,
            to_url TEXT NOT NULL,
            count INTEGER NOT NULL DEFAULT 0,
            last_seen INTEGER NOT NULL,
            UNIQUE(from_url, to_url)
        );

        CREATE INDEX IF NOT EXISTS idx_navigation_from ON navigation_patterns(from_url);
        ",
    )
    .map_err(|e| Error::StorageUnavailable(format!("Failed to init selector schema: {}", e)))?;

    debug!(path = %db_path.display(), "Selector store schema initialized");
    Ok(())
}

/// Decode one row. The outer error is a transport error from rusqlite; the
/// inner one marks a row that was read but could not be turned into an entry.
fn decode_row(row: &Row<'_>) -> rusqlite::Result<Result<SelectorEntry>> {
    let id: String = row.get(0)?;
    let decoded = (|| -> rusqlite::Result<SelectorEntry> {
        let element_type: String = row.get(6)?;
        let success_count = row.get::<_, i64>(9)?.max(0) as u64;
        let failure_count = row.get::<_, i64>(10)?.max(0) as u64;
        let alternatives_raw: Option<String> = row.get(14)?;
        Ok(SelectorEntry {
            id: id.clone(),
            domain: row.get(1)?,
            url_pattern: row.get(2)?,
            test_id: row.get(3)?,
            css_selector: row.get(4)?,
            xpath_selector: row.get(5)?,
            element_type: ElementType::from_str(&element_type).unwrap_or_default(),
            description: row.get(7)?,
            // Never trust a stored ratio that disagrees with its counters.
            confidence: if success_count + failure_count == 0 {
                row.get::<_, f64>(8)?.clamp(0.0, 1.0)
            } else {
                laplace_confidence(success_count, failure_count)
            },
            success_count,
            failure_count,
            last_used_at: row.get(11)?,
            last_updated_at: row.get(12)?,
            ttl_ms: row.get(13)?,
            alternatives: decode_alternatives(&id, alternatives_raw.as_deref()),
        })
    })();

    Ok(decoded.map_err(|e| Error::MalformedRecord(format!("selector {}: {}", id, e))))
}

/// Invalid encodings decode as an empty list.
fn decode_alternatives(id: &str, raw: Option<&str>) -> Vec<String> {
    let Some(raw) = raw else {
        return Vec::new();
    };
    if raw.trim().is_empty() {
        return Vec::new();
    }
    match serde_json::from_str::<Vec<String>>(raw) {
        Ok(list) => list,
        Err(e) => {
            warn!(id, error = %e, "Malformed alternatives column, treating as empty");
            Vec::new()
        }
    }
}

fn collect_rows<I>(rows: I) -> Vec<SelectorEntry>
where
    I: Iterator<Item = rusqlite::Result<Result<SelectorEntry>>>,
{
    let mut entries = Vec::new();
    for row in rows {
        match row {
            Ok(Ok(entry)) => entries.push(entry),
            Ok(Err(e)) => warn!(error = %e, "Skipping malformed selector row"),
            Err(e) => warn!(error = %e, "Error reading selector row"),
        }
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use wayfind_core::NewSelector;

    fn test_store() -> (SelectorStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("selectors.db");
        let store = SelectorStore::open(&db_path).unwrap();
        (store, dir)
    }

    fn entry(id: &str, test_id: &str, pattern: &str, css: &str) -> SelectorEntry {
        NewSelector::new(test_id, pattern, css).into_entry(id.to_string(), 1_000, 60_000, 5)
    }

    #[test]
    fn test_put_and_query_ranked() {
        let (store, _dir) = test_store();

        let mut low = entry("a", "search", "/home", "#q");
        low.success_count = 1;
        low.failure_count = 3;
        low.recompute_confidence();
        let mut high = entry("b", "submit", "/home", "#go");
        high.success_count = 8;
        high.recompute_confidence();
        let mut other = entry("c", "submit", "/cart", "#buy");
        other.domain = "shop.example.com".to_string();

        store.put(&low).unwrap();
        store.put(&high).unwrap();
        store.put(&other).unwrap();

        let results = store.query("/home", 0.0, 100).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].id, "b");
        assert_eq!(results[1].id, "a");

        let filtered = store.query("/home", 0.5, 100).unwrap();
        assert_eq!(filtered.len(), 1);

        let by_domain = store.query("shop.example.com", 0.0, 100).unwrap();
        assert_eq!(by_domain.len(), 1);
        assert_eq!(by_domain[0].id, "c");
    }

    #[test]
    fn test_put_replaces_by_id() {
        let (store, _dir) = test_store();
        let mut e = entry("a", "login", "/login", "#login");
        store.put(&e).unwrap();
        e.css_selector = "#sign-in".to_string();
        e.alternatives = vec!["#x".to_string()];
        store.put(&e).unwrap();

        let loaded = store.get_by_id("a").unwrap().unwrap();
        assert_eq!(loaded.css_selector, "#sign-in");
        assert_eq!(loaded.alternatives, vec!["#x"]);
        assert_eq!(store.aggregate().unwrap().count, 1);
    }

    #[test]
    fn test_get_by_test_id_scoping() {
        let (store, _dir) = test_store();
        let mut global_best = entry("a", "login", "/signin", "#a");
        global_best.success_count = 9;
        global_best.recompute_confidence();
        store.put(&global_best).unwrap();
        store.put(&entry("b", "login", "/login", "#b")).unwrap();

        let scoped = store.get_by_test_id("login", Some("/login")).unwrap().unwrap();
        assert_eq!(scoped.id, "b");
        let global = store.get_by_test_id("login", None).unwrap().unwrap();
        assert_eq!(global.id, "a");
        assert!(store.get_by_test_id("missing", None).unwrap().is_none());
    }

    #[test]
    fn test_update_outcome_recomputes_confidence() {
        let (store, _dir) = test_store();
        store.put(&entry("a", "login", "/login", "#login")).unwrap();

        assert!(store.update_outcome("login", "/login", true, 5_000).unwrap());
        assert!(store.update_outcome("login", "/login", true, 6_000).unwrap());
        assert!(store.update_outcome("login", "/login", false, 7_000).unwrap());

        let e = store.get_by_id("a").unwrap().unwrap();
        assert_eq!(e.success_count, 2);
        assert_eq!(e.failure_count, 1);
        assert!((e.confidence - 0.5).abs() < 1e-9);
        assert_eq!(e.last_used_at, 6_000);
        assert_eq!(e.last_updated_at, 7_000);

        assert!(!store.update_outcome("login", "/elsewhere", true, 8_000).unwrap());
    }

    #[test]
    fn test_delete_expired() {
        let (store, _dir) = test_store();
        store.put(&entry("a", "x", "/p", "#a")).unwrap();
        let mut fresh = entry("b", "y", "/p", "#b");
        fresh.last_updated_at = 100_000;
        store.put(&fresh).unwrap();

        assert_eq!(store.delete_expired(61_000).unwrap(), 0);
        assert_eq!(store.delete_expired(61_001).unwrap(), 1);
        assert!(store.get_by_id("a").unwrap().is_none());
        assert!(store.get_by_id("b").unwrap().is_some());
    }

    #[test]
    fn test_malformed_alternatives_decode_empty() {
        let (store, _dir) = test_store();
        store.put(&entry("a", "x", "/p", "#a")).unwrap();
        {
            let conn = store.inner.lock().unwrap();
            conn.execute(
                "UPDATE selectors SET alternatives = 'not json' WHERE id = 'a'",
                [],
            )
            .unwrap();
        }
        let e = store.get_by_id("a").unwrap().unwrap();
        assert!(e.alternatives.is_empty());
        assert_eq!(store.query("/p", 0.0, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_navigation_edges() {
        let (store, _dir) = test_store();
        for i in 0..3 {
            store.record_transition("/a", "/b", 10 + i).unwrap();
        }
        store.record_transition("/a", "/c", 50).unwrap();

        let edges = store.transitions_from("/a").unwrap();
        assert_eq!(edges.len(), 2);
        assert_eq!(edges[0].to_url, "/b");
        assert_eq!(edges[0].count, 3);
        assert_eq!(edges[0].last_seen_at, 12);

        assert_eq!(store.reset_navigation().unwrap(), 2);
        assert!(store.transitions_from("/a").unwrap().is_empty());
    }

    #[test]
    fn test_aggregate() {
        let (store, _dir) = test_store();
        let agg = store.aggregate().unwrap();
        assert_eq!(agg.count, 0);
        assert_eq!(agg.avg_confidence, 0.0);

        let mut a = entry("a", "x", "/p", "#a");
        a.success_count = 3;
        a.recompute_confidence();
        let mut b = entry("b", "y", "/p", "#b");
        b.failure_count = 2;
        b.recompute_confidence();
        store.put(&a).unwrap();
        store.put(&b).unwrap();

        let agg = store.aggregate().unwrap();
        assert_eq!(agg.count, 2);
        assert_eq!(agg.total_success, 3);
        assert_eq!(agg.total_failure, 2);
        assert!((agg.avg_confidence - 0.375).abs() < 1e-9);
    }

    #[test]
    fn test_reads_do_not_wait_on_writer_lock() {
        let (store, _dir) = test_store();
        store.put(&entry("a", "x", "/p", "#a")).unwrap();

        let _write_guard = store.conn().unwrap();
        let reader = store.clone();
        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let rows = reader.query("/p", 0.0, 10).map(|rows| rows.len());
            let by_id = reader.get_by_id("a").map(|e| e.is_some());
            tx.send((rows, by_id)).ok();
        });

        let (rows, by_id) = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("reads should not block on the write connection");
        assert_eq!(rows.unwrap(), 1);
        assert!(by_id.unwrap());
    }

    #[test]
    fn test_reader_connection_is_read_only() {
        let (store, _dir) = test_store();
        let conn = store.read_conn().unwrap();
        assert!(conn.execute("DELETE FROM selectors", []).is_err());
    }
}
