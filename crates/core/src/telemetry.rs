use serde::{Deserialize, Serialize};

/// One telemetry record emitted by the selector cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryEvent {
    pub action: String,
    pub key: String,
    pub count: usize,
    pub time_ms: f64,
    pub source: String,
}

impl TelemetryEvent {
    pub fn new(action: &str, key: &str, count: usize, time_ms: f64, source: &str) -> Self {
        Self {
            action: action.to_string(),
            key: key.to_string(),
            count,
            time_ms,
            source: source.to_string(),
        }
    }
}

/// Fire-and-forget consumer of cache telemetry.
///
/// Implementations must not block and must swallow their own failures.
pub trait TelemetrySink: Send + Sync {
    fn emit(&self, event: TelemetryEvent);
}

/// Sink that discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTelemetry;

impl TelemetrySink for NoopTelemetry {
    fn emit(&self, _event: TelemetryEvent) {}
}
