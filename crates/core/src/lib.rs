pub mod config;
pub mod error;
pub mod paths;
pub mod telemetry;
pub mod types;

pub use config::{CacheConfig, Config, TelemetryConfig};
pub use error::{Error, Result};
pub use paths::Paths;
pub use telemetry::{NoopTelemetry, TelemetryEvent, TelemetrySink};
pub use types::{
    CacheStats, ElementType, Lookup, LookupSource, NavigationEdge, NewSelector, Prediction,
    SelectorEntry, SelectorHealth, StoreAggregate,
};
