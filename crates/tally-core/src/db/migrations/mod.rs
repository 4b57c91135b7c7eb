//! Versioned schema for the static tables (`PRAGMA user_version`).
//!
//! Category tier tables are not versioned here; they are derived from the
//! registry and created with `IF NOT EXISTS` by
//! [`schema::ensure_category_tables`](super::schema::ensure_category_tables).

use super::schema;
use crate::error::{Result, TallyError};
use rusqlite::Connection;

struct Step {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

const STEPS: &[Step] = &[Step {
    version: 1,
    name: "rollup run history",
    sql: schema::MIGRATION_V1_SQL,
}];

/// Latest schema version understood by this binary.
pub const LATEST_SCHEMA_VERSION: u32 = 1;

/// Current `user_version` of the database. A fresh file reports 0.
///
/// # Errors
///
/// Fails if the pragma cannot be read or holds a negative value.
pub fn current_schema_version(conn: &Connection) -> Result<u32> {
    let raw: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    u32::try_from(raw)
        .map_err(|_| TallyError::Configuration(format!("invalid schema version {raw}")))
}

/// Bring the database up to [`LATEST_SCHEMA_VERSION`] and return the version
/// it ends at. Each step commits on its own.
///
/// # Errors
///
/// Returns [`TallyError::Configuration`] for a database written by a newer
/// binary, or the storage error of the step that failed.
pub fn migrate(conn: &mut Connection) -> Result<u32> {
    let found = current_schema_version(conn)?;
    if found > LATEST_SCHEMA_VERSION {
        return Err(TallyError::Configuration(format!(
            "database schema v{found} is newer than this binary (v{LATEST_SCHEMA_VERSION})"
        )));
    }

    for step in STEPS.iter().filter(|step| step.version > found) {
        let tx = conn.transaction()?;
        tx.execute_batch(step.sql)?;
        tx.pragma_update(None, "user_version", step.version)?;
        tx.commit()?;
        tracing::info!(version = step.version, step = step.name, "migrated schema");
    }

    current_schema_version(conn)
}
