//! tally-core library.
//!
//! Records metric events into per-category raw tables and rolls them up into
//! hourly and daily buckets.
//!
//! # Conventions
//!
//! - **Errors**: [`error::TallyError`] for recorder, aggregator, and registry
//!   paths; `anyhow::Result` for setup and reporting queries.
//! - **Logging**: `tracing` macros (`info!` per run, `debug!` per category,
//!   `warn!` per failure).

pub mod aggregate;
pub mod bucket;
pub mod config;
pub mod db;
pub mod error;
pub mod intake;
pub mod lock;
pub mod projection;
pub mod recorder;
pub mod registry;
pub mod scheduler;

pub use aggregate::RollupReport;
pub use bucket::Tier;
pub use error::{ErrorCode, Result, TallyError};
pub use recorder::{MetricEvent, Recorder};
pub use registry::{CategoryDescriptor, Registry};
pub use scheduler::{CategoryOutcome, Granularity, RunReport, run_daily, run_hourly};
