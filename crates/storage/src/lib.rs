pub mod selector_store;
pub mod telemetry_log;

pub use selector_store::SelectorStore;
pub use telemetry_log::{TelemetryLog, TelemetryRecord};
