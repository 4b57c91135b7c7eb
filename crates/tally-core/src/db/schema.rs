//! Storage schema for tally.
//!
//! Every category owns three tables sharing one row shape:
//! - raw (`<table>`): one row per recorded event
//! - hourly (`<table>_hourly`) and daily (`<table>_daily`): one row per
//!   `(actor, action, bucket start)` with a `count`, enforced by a UNIQUE
//!   constraint that the aggregator's upsert targets
//!
//! Table DDL is generated from the registry; the static `rollup_runs` history
//! table is created by the versioned migrations.

use rusqlite::Connection;

use crate::bucket::Tier;
use crate::error::{Result, TallyError};
use crate::registry::{CategoryDescriptor, Registry};

/// Migration v1: rollup run history.
pub const MIGRATION_V1_SQL: &str = r"
CREATE TABLE IF NOT EXISTS rollup_runs (
    run_id INTEGER PRIMARY KEY AUTOINCREMENT,
    granularity TEXT NOT NULL CHECK (granularity IN ('hourly', 'daily')),
    category TEXT NOT NULL,
    started_at INTEGER NOT NULL,
    run_now INTEGER NOT NULL,
    status TEXT NOT NULL CHECK (status IN ('ok', 'failed', 'cancelled')),
    rows_consumed INTEGER NOT NULL DEFAULT 0,
    buckets_written INTEGER NOT NULL DEFAULT 0,
    error_code TEXT,
    error_message TEXT
);

CREATE INDEX IF NOT EXISTS idx_rollup_runs_category_started
    ON rollup_runs(category, started_at DESC);
";

/// DDL for the three tier tables of one category.
#[must_use]
pub fn category_ddl(descriptor: &CategoryDescriptor) -> String {
    let actor = descriptor.actor_column;
    let subject = descriptor.subject_column;
    let raw = descriptor.table_for(Tier::Raw);

    let mut sql = format!(
        r#"
CREATE TABLE IF NOT EXISTS {raw} (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    {actor} INTEGER NOT NULL,
    {subject} INTEGER NOT NULL,
    action TEXT NOT NULL CHECK (length(trim(action)) > 0),
    attributes TEXT NOT NULL DEFAULT '{{}}',
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_{raw}_created_at
    ON {raw}(created_at);
"#
    );

    for tier in [Tier::Hourly, Tier::Daily] {
        let table = descriptor.table_for(tier);
        sql.push_str(&format!(
            r#"
CREATE TABLE IF NOT EXISTS {table} (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    {actor} INTEGER NOT NULL,
    {subject} INTEGER,
    action TEXT NOT NULL CHECK (length(trim(action)) > 0),
    attributes TEXT NOT NULL DEFAULT '{{}}',
    created_at INTEGER NOT NULL,
    "count" INTEGER NOT NULL CHECK ("count" >= 1),
    UNIQUE ({actor}, action, created_at)
);

CREATE INDEX IF NOT EXISTS idx_{table}_created_at
    ON {table}(created_at);
"#
        ));
    }

    sql
}

/// Create any missing tier tables for every registered category.
///
/// # Errors
///
/// Returns an error if any DDL statement fails.
pub fn ensure_category_tables(conn: &Connection, registry: &Registry) -> Result<()> {
    for descriptor in registry.iter() {
        conn.execute_batch(&category_ddl(descriptor))?;
        tracing::debug!(category = descriptor.category, "category tables ensured");
    }
    Ok(())
}

/// Columns every table of the given tier must have.
#[must_use]
pub fn required_columns(descriptor: &CategoryDescriptor, tier: Tier) -> Vec<&'static str> {
    let mut columns = vec![
        "id",
        descriptor.actor_column,
        descriptor.subject_column,
        "action",
        "attributes",
        "created_at",
    ];
    if tier.has_count() {
        columns.push("count");
    }
    columns
}

/// Check that a tier table exists and carries the descriptor's columns.
///
/// # Errors
///
/// Returns [`TallyError::Configuration`] naming the table and the missing
/// columns, or a storage error if `PRAGMA table_info` fails.
pub fn verify_tier_columns(
    conn: &Connection,
    descriptor: &CategoryDescriptor,
    tier: Tier,
) -> Result<()> {
    let table = descriptor.table_for(tier);
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1)")?;
    let present = stmt
        .query_map([&table], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    if present.is_empty() {
        return Err(TallyError::Configuration(format!(
            "{}: table '{table}' does not exist",
            descriptor.category
        )));
    }

    let missing: Vec<_> = required_columns(descriptor, tier)
        .into_iter()
        .filter(|column| !present.iter().any(|p| p == column))
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(TallyError::Configuration(format!(
            "{}: table '{table}' is missing columns {}",
            descriptor.category,
            missing.join(", ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    fn source() -> CategoryDescriptor {
        crate::registry::BUILTIN_CATEGORIES[0]
    }

    #[test]
    fn ddl_creates_all_three_tiers() -> Result<()> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(&category_ddl(&source()))?;

        for tier in Tier::ALL {
            verify_tier_columns(&conn, &source(), tier)?;
        }
        Ok(())
    }

    #[test]
    fn ddl_is_idempotent() -> Result<()> {
        let conn = Connection::open_in_memory()?;
        let registry = Registry::builtin()?;
        ensure_category_tables(&conn, &registry)?;
        ensure_category_tables(&conn, &registry)?;
        Ok(())
    }

    #[test]
    fn rollup_tables_reject_duplicate_buckets() -> Result<()> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(&category_ddl(&source()))?;

        let insert = "INSERT INTO source_metrics_hourly \
             (credential_id, source_id, action, created_at, \"count\") \
             VALUES (1, 2, 'created', 3600, 1)";
        conn.execute(insert, [])?;
        let err = TallyError::from(conn.execute(insert, []).expect_err("unique bucket"));
        assert_eq!(err.code(), ErrorCode::ConstraintViolation);
        Ok(())
    }

    #[test]
    fn rollup_tables_reject_zero_counts() -> Result<()> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(&category_ddl(&source()))?;

        let result = conn.execute(
            "INSERT INTO source_metrics_daily \
             (credential_id, source_id, action, created_at, \"count\") \
             VALUES (1, 2, 'created', 0, 0)",
            [],
        );
        assert!(result.is_err());
        Ok(())
    }

    #[test]
    fn missing_table_is_a_configuration_error() -> Result<()> {
        let conn = Connection::open_in_memory()?;
        let err = verify_tier_columns(&conn, &source(), Tier::Raw).expect_err("no tables yet");
        assert_eq!(err.code(), ErrorCode::ConfigurationError);
        Ok(())
    }

    #[test]
    fn missing_count_column_is_a_configuration_error() -> Result<()> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "CREATE TABLE source_metrics_hourly (
                id INTEGER PRIMARY KEY,
                credential_id INTEGER,
                source_id INTEGER,
                action TEXT,
                attributes TEXT,
                created_at INTEGER
            )",
        )?;

        let err = verify_tier_columns(&conn, &source(), Tier::Hourly).expect_err("no count");
        assert!(err.to_string().contains("count"), "{err}");
        Ok(())
    }
}
