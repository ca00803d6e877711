//! Live multi-sensor telemetry: ingestion, storage, windowed aggregation and
//! dashboard refresh for mobile sensor producers.

pub mod agent;
pub mod aggregate;
pub mod codec;
pub mod config;
pub mod dashboard;
pub mod export;
pub mod ingest;
pub mod refresh;
pub mod store;
pub mod version;
