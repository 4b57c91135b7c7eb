pub mod categories;
pub mod completions;
pub mod ingest;
pub mod init;
pub mod record;
pub mod rollup;
pub mod runs;
pub mod stats;

use anyhow::{Context as _, Result};
use rusqlite::Connection;
use tally_core::config::EffectiveConfig;
use tally_core::db;
use tally_core::registry::Registry;

use crate::output::OutputMode;

/// State shared by every command after flags and config are resolved.
#[derive(Debug)]
pub struct Context {
    pub output: OutputMode,
    pub config: EffectiveConfig,
    pub registry: Registry,
}

impl Context {
    /// Open the database, creating and migrating it if needed.
    pub fn open_db(&self) -> Result<Connection> {
        db::open(
            &self.config.db_path,
            self.config.config.database.busy_timeout(),
            &self.registry,
        )
        .with_context(|| format!("open {}", self.config.db_path.display()))
    }
}

/// Current wall clock in epoch seconds, unless overridden with `--now`.
pub fn now_or(override_secs: Option<i64>) -> i64 {
    override_secs.unwrap_or_else(|| chrono::Utc::now().timestamp())
}
