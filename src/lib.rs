// Crime / Weather / Transit Accumulator - Core Library
// Exposes all modules for the accumulation binary, the API server and tests

pub mod accumulation;
pub mod adapters;
pub mod analysis;
pub mod config;
pub mod db;
pub mod error;
pub mod http;
pub mod linkage;
pub mod migration;
pub mod rate_limit;
pub mod seed;

#[cfg(test)]
mod testutil;

// Re-export commonly used types
pub use accumulation::{
    plan_request, AccumulationEngine, LinkageSummary, RefreshPolicy, RunReport, Stage, StageReport, StageStatus,
};
pub use adapters::{fetch_at_boundary, AdapterSet, SourceAdapter, SourceKind};
pub use analysis::{export_csv, run_analysis, AnalysisReport};
pub use config::{AdapterStatus, Config, CrimeArea, Credential, TableTargets};
pub use db::{
    setup_database, CrimeRecord, LocationRecord, Table, TableCounts, TransitStop, WeatherRecord,
};
pub use error::{ConfigError, FetchError};
pub use linkage::{derive_date, DEFAULT_LOCATION_LABEL};
pub use migration::{run_backfill, BackfillReport};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
