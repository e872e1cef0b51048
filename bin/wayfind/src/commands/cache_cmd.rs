use std::sync::Arc;

use chrono::{TimeZone, Utc};
use wayfind_cache::SelectorCache;
use wayfind_core::{Config, NoopTelemetry, Paths, SelectorEntry, TelemetrySink};
use wayfind_storage::{SelectorStore, TelemetryLog};

fn open_store(paths: &Paths) -> anyhow::Result<Option<SelectorStore>> {
    let db_path = paths.selector_db();
    if !db_path.exists() {
        println!("(Selector database not created yet: {})", db_path.display());
        return Ok(None);
    }
    let store = SelectorStore::open(&db_path)
        .map_err(|e| anyhow::anyhow!("Failed to open selector db: {}", e))?;
    Ok(Some(store))
}

async fn open_cache(paths: &Paths) -> anyhow::Result<Arc<SelectorCache>> {
    let config = Config::load_or_default(paths)?;
    let telemetry: Arc<dyn TelemetrySink> = if config.telemetry.enabled {
        Arc::new(TelemetryLog::new(paths.clone()))
    } else {
        Arc::new(NoopTelemetry)
    };
    Ok(SelectorCache::init(config.cache, Some(&paths.selector_db()), telemetry).await)
}

fn format_time(ms: i64) -> String {
    Utc.timestamp_millis_opt(ms)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn describe_entry(entry: &SelectorEntry) -> String {
    let mut out = format!(
        "{} [{}] {}  conf={:.2} ok={} fail={} health={}",
        entry.test_id,
        entry.element_type.as_str(),
        entry.css_selector,
        entry.confidence,
        entry.success_count,
        entry.failure_count,
        entry.health()
    );
    if !entry.alternatives.is_empty() {
        out.push_str(&format!("  alts={}", entry.alternatives.join(" | ")));
    }
    out
}

fn print_entries(entries: &[SelectorEntry]) {
    for (i, entry) in entries.iter().enumerate() {
        println!("  {}. {}", i + 1, describe_entry(entry));
        println!(
            "     id={} url={} updated={}",
            entry.id,
            entry.url_pattern,
            format_time(entry.last_updated_at)
        );
    }
}

/// Show cache statistics.
pub async fn stats() -> anyhow::Result<()> {
    let paths = Paths::new();
    let Some(store) = open_store(&paths)? else {
        return Ok(());
    };
    let agg = store
        .aggregate()
        .map_err(|e| anyhow::anyhow!("Failed to aggregate: {}", e))?;

    println!();
    println!("🧭 Selector Cache Statistics");
    println!("  Database:        {}", store.db_path().display());
    println!("  Total selectors: {}", agg.count);
    println!("  Avg confidence:  {:.3}", agg.avg_confidence);
    println!("  Successes:       {}", agg.total_success);
    println!("  Failures:        {}", agg.total_failure);
    println!();
    Ok(())
}

/// List stored selectors for a url pattern or domain.
pub async fn query(target: &str, min_confidence: f64, limit: usize) -> anyhow::Result<()> {
    let paths = Paths::new();
    let Some(store) = open_store(&paths)? else {
        return Ok(());
    };
    let entries = store
        .query(target, min_confidence, limit)
        .map_err(|e| anyhow::anyhow!("Failed to query: {}", e))?;

    println!();
    if entries.is_empty() {
        println!("(No selectors stored for {})", target);
    } else {
        println!("🔍 {} selector(s) for {}", entries.len(), target);
        print_entries(&entries);
    }
    println!();
    Ok(())
}

/// Resolve the best selector for a test id through the cache.
pub async fn lookup(test_id: &str, url: Option<&str>) -> anyhow::Result<()> {
    let paths = Paths::new();
    let cache = open_cache(&paths).await?;
    let found = cache.get_selector_by_test_id(test_id, url);
    cache.close().await;

    match found {
        Some(entry) => {
            println!("✓ {}", describe_entry(&entry));
            println!("  id={} url={}", entry.id, entry.url_pattern);
            if let Some(xpath) = &entry.xpath_selector {
                println!("  xpath={}", xpath);
            }
        }
        None => println!("(No selector for {}, run live discovery)", test_id),
    }
    Ok(())
}

/// Print predicted next pages.
pub async fn predict(url: &str) -> anyhow::Result<()> {
    let paths = Paths::new();
    let cache = open_cache(&paths).await?;
    let predictions = cache.predict(url);
    let threshold = cache.config().prefetch_confidence_threshold;
    cache.close().await;

    if predictions.is_empty() {
        println!("(No navigation recorded from {})", url);
        return Ok(());
    }
    println!("🔮 Next pages after {}", url);
    for p in predictions {
        let marker = if p.probability >= threshold { "prefetch" } else { "" };
        println!("  {:>5.1}%  {} {}", p.probability * 100.0, p.to_url, marker);
    }
    Ok(())
}

/// Remove expired selectors.
pub async fn cleanup() -> anyhow::Result<()> {
    let paths = Paths::new();
    if !paths.selector_db().exists() {
        println!("(Selector database not created yet)");
        return Ok(());
    }
    let cache = open_cache(&paths).await?;
    let removed = cache.cleanup().await;
    cache.close().await;
    println!("✅ Cleanup complete: {} expired selector(s) removed", removed);
    Ok(())
}

/// Delete one selector by id.
pub async fn delete(id: &str) -> anyhow::Result<()> {
    let paths = Paths::new();
    let Some(store) = open_store(&paths)? else {
        return Ok(());
    };
    let removed = store
        .delete(id)
        .map_err(|e| anyhow::anyhow!("Failed to delete: {}", e))?;
    if removed {
        println!("✓ Deleted selector {}", id);
    } else {
        println!("No selector with id {}", id);
    }
    Ok(())
}

/// Forget every recorded page transition.
pub async fn reset_navigation() -> anyhow::Result<()> {
    let paths = Paths::new();
    let Some(store) = open_store(&paths)? else {
        return Ok(());
    };
    let removed = store
        .reset_navigation()
        .map_err(|e| anyhow::anyhow!("Failed to reset navigation: {}", e))?;
    println!("✓ Removed {} navigation edge(s)", removed);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wayfind_core::NewSelector;

    #[test]
    fn test_describe_entry_lists_alternatives() {
        let entry = NewSelector::new("login-btn", "/login", "#login")
            .with_alternatives(&["button[type=submit]"])
            .into_entry("id-1".to_string(), 0, 1_000, 5);
        let line = describe_entry(&entry);
        assert!(line.starts_with("login-btn [other] #login"));
        assert!(line.contains("health=degraded"));
        assert!(line.contains("alts=button[type=submit]"));
    }

    #[test]
    fn test_format_time() {
        assert_eq!(format_time(0), "1970-01-01 00:00");
    }
}
