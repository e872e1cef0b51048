use chrono::Utc;
use wayfind_core::{Paths, Result, TelemetryEvent, TelemetrySink};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{error, warn};

/// A telemetry event as written to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub timestamp_ms: i64,
    #[serde(flatten)]
    pub event: TelemetryEvent,
}

/// Appends telemetry events to `<telemetry_dir>/<YYYY-MM-DD>.jsonl`.
pub struct TelemetryLog {
    paths: Paths,
    write_lock: Mutex<()>,
}

impl TelemetryLog {
    pub fn new(paths: Paths) -> Self {
        Self {
            paths,
            write_lock: Mutex::new(()),
        }
    }

    fn log_file_for(&self, date: &str) -> PathBuf {
        self.paths.telemetry_dir().join(format!("{}.jsonl", date))
    }

    fn today() -> String {
        Utc::now().format("%Y-%m-%d").to_string()
    }

    fn write_record(&self, record: &TelemetryRecord) -> Result<()> {
        let log_file = self.log_file_for(&Self::today());

        if let Some(parent) = log_file.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string(record)?;
        let _guard = self
            .write_lock
            .lock()
            .map_err(|e| wayfind_core::Error::Other(format!("Lock error: {}", e)))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)?;
        writeln!(file, "{}", json)?;

        Ok(())
    }

    /// Read telemetry records from a specific date.
    pub fn read_events(&self, date: &str) -> Result<Vec<TelemetryRecord>> {
        let log_file = self.log_file_for(date);

        if !log_file.exists() {
            return Ok(Vec::new());
        }

        let content = std::fs::read_to_string(&log_file)?;
        let mut records = Vec::new();

        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<TelemetryRecord>(line) {
                Ok(record) => records.push(record),
                Err(e) => {
                    error!(error = %e, line = %line, "Failed to parse telemetry record");
                }
            }
        }

        Ok(records)
    }

    pub fn read_today(&self) -> Result<Vec<TelemetryRecord>> {
        self.read_events(&Self::today())
    }
}

impl TelemetrySink for TelemetryLog {
    fn emit(&self, event: TelemetryEvent) {
        let record = TelemetryRecord {
            timestamp_ms: Utc::now().timestamp_millis(),
            event,
        };
        if let Err(e) = self.write_record(&record) {
            warn!(error = %e, "Failed to write telemetry record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_emit_and_read_back() {
        let temp_dir = TempDir::new().unwrap();
        let paths = Paths::with_base(temp_dir.path().to_path_buf());
        let log = TelemetryLog::new(paths);

        log.emit(TelemetryEvent::new("get_selectors", "/login", 2, 0.4, "cache"));
        log.emit(TelemetryEvent::new("record_failure", "login-btn", 1, 0.1, "cache"));

        let records = log.read_today().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].event.action, "get_selectors");
        assert_eq!(records[0].event.count, 2);
        assert_eq!(records[1].event.key, "login-btn");
    }

    #[test]
    fn test_missing_day_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let log = TelemetryLog::new(Paths::with_base(temp_dir.path().to_path_buf()));
        assert!(log.read_events("1999-01-01").unwrap().is_empty());
    }
}
