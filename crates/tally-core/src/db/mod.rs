//! SQLite storage utilities.
//!
//! Runtime defaults:
//! - `journal_mode = WAL` so intake workers can read while a rollup writes
//! - `busy_timeout` (default 5s) to absorb short write contention between
//!   concurrent recorder connections
//! - `synchronous = NORMAL`

pub mod migrations;
pub mod query;
pub mod schema;

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::{path::Path, time::Duration};

use crate::registry::Registry;

/// Busy timeout used when the config does not override it.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open (or create) the metrics database, apply runtime pragmas, migrate the
/// static schema, and ensure every registered category has its tier tables.
///
/// # Errors
///
/// Returns an error if opening, configuring, or migrating the database fails.
pub fn open(path: &Path, busy_timeout: Duration, registry: &Registry) -> Result<Connection> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create database directory {}", parent.display()))?;
    }

    let mut conn = Connection::open(path)
        .with_context(|| format!("open metrics database {}", path.display()))?;

    configure_connection(&conn, busy_timeout).context("configure sqlite pragmas")?;
    prepare(&mut conn, registry)?;

    Ok(conn)
}

/// Open a connection to an existing database without touching the schema.
///
/// Used by intake workers after the main thread has run [`open`] once.
///
/// # Errors
///
/// Returns an error if the database cannot be opened or configured.
pub fn connect(path: &Path, busy_timeout: Duration) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("open metrics database {}", path.display()))?;
    configure_connection(&conn, busy_timeout).context("configure sqlite pragmas")?;
    Ok(conn)
}

/// Run migrations and create category tables on an already-open connection.
///
/// # Errors
///
/// Returns an error if a migration or table creation fails.
pub fn prepare(conn: &mut Connection, registry: &Registry) -> Result<()> {
    migrations::migrate(conn).context("apply schema migrations")?;
    schema::ensure_category_tables(conn, registry).context("create category tables")?;
    Ok(())
}

fn configure_connection(conn: &Connection, busy_timeout: Duration) -> rusqlite::Result<()> {
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    let _journal_mode: String =
        conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    conn.busy_timeout(busy_timeout)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migrations;
    use crate::registry::Registry;

    fn pragma_text(conn: &Connection, name: &str) -> String {
        conn.pragma_query_value(None, name, |row| row.get::<_, String>(0))
            .expect("read pragma")
    }

    #[test]
    fn open_creates_parent_dirs_and_every_tier_table() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("var/lib/tally.sqlite3");
        let registry = Registry::builtin().expect("registry");

        let conn = open(&path, Duration::from_millis(750), &registry).expect("open db");

        assert_eq!(pragma_text(&conn, "journal_mode").to_lowercase(), "wal");
        let busy_ms: i64 = conn
            .pragma_query_value(None, "busy_timeout", |row| row.get(0))
            .expect("busy_timeout");
        assert_eq!(busy_ms, 750);
        assert_eq!(
            migrations::current_schema_version(&conn).expect("version"),
            migrations::LATEST_SCHEMA_VERSION
        );
        let tier_tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name LIKE '%_metrics%'",
                [],
                |row| row.get(0),
            )
            .expect("count tables");
        assert_eq!(tier_tables, 9);
    }

    #[test]
    fn reopening_is_a_no_op() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("tally.sqlite3");
        let registry = Registry::builtin().expect("registry");

        let first = open(&path, DEFAULT_BUSY_TIMEOUT, &registry).expect("first open");
        first
            .execute(
                "INSERT INTO flag_metrics (credential_id, flag_id, action, attributes, created_at)
                 VALUES (1, 2, 'set', '{}', 60)",
                [],
            )
            .expect("insert");
        drop(first);

        let again = open(&path, DEFAULT_BUSY_TIMEOUT, &registry).expect("second open");
        let rows: i64 = again
            .query_row("SELECT COUNT(*) FROM flag_metrics", [], |row| row.get(0))
            .expect("count");
        assert_eq!(rows, 1);
    }

    #[test]
    fn connect_skips_schema_setup() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("bare.sqlite3");

        let conn = connect(&path, DEFAULT_BUSY_TIMEOUT).expect("connect");
        assert_eq!(migrations::current_schema_version(&conn).expect("version"), 0);
        assert!(conn.query_row("SELECT COUNT(*) FROM gate_metrics", [], |_| Ok(())).is_err());
    }
}
