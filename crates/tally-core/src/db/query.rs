//! Read-side queries for reporting commands and the run history table.
//!
//! All functions take a shared `&Connection` and return typed structs.

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;

use crate::bucket::Tier;
use crate::registry::{CategoryDescriptor, Registry};

// ---------------------------------------------------------------------------
// Tier statistics
// ---------------------------------------------------------------------------

/// Row and event totals of one tier table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TierStats {
    pub category: String,
    pub tier: Tier,
    pub table: String,
    pub rows: u64,
    /// Events represented: equal to `rows` for raw tables.
    pub events: i64,
    pub oldest: Option<i64>,
    pub newest: Option<i64>,
}

/// Totals for one category's tier table.
///
/// # Errors
///
/// Returns an error if the table is missing or the query fails.
pub fn tier_stats(
    conn: &Connection,
    descriptor: &CategoryDescriptor,
    tier: Tier,
) -> Result<TierStats> {
    let table = descriptor.table_for(tier);
    let events_expr = if tier.has_count() {
        "COALESCE(SUM(\"count\"), 0)"
    } else {
        "COUNT(*)"
    };
    let sql = format!(
        "SELECT COUNT(*), {events_expr}, MIN(created_at), MAX(created_at) FROM {table}"
    );

    let (rows, events, oldest, newest): (i64, i64, Option<i64>, Option<i64>) = conn
        .query_row(&sql, [], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
        })
        .with_context(|| format!("stats for {table}"))?;

    Ok(TierStats {
        category: descriptor.category.to_string(),
        tier,
        table,
        rows: u64::try_from(rows).unwrap_or(0),
        events,
        oldest,
        newest,
    })
}

/// Totals for every registered category in registry order, for one tier or
/// all of them.
///
/// # Errors
///
/// Returns an error if any tier table is missing or a query fails.
pub fn all_tier_stats(
    conn: &Connection,
    registry: &Registry,
    only: Option<Tier>,
) -> Result<Vec<TierStats>> {
    let tiers: &[Tier] = match &only {
        Some(tier) => std::slice::from_ref(tier),
        None => &Tier::ALL,
    };
    let mut stats = Vec::with_capacity(registry.len() * tiers.len());
    for descriptor in registry.iter() {
        for &tier in tiers {
            stats.push(tier_stats(conn, descriptor, tier)?);
        }
    }
    Ok(stats)
}

// ---------------------------------------------------------------------------
// Run history
// ---------------------------------------------------------------------------

/// A row of `rollup_runs` about to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRun<'a> {
    pub granularity: &'a str,
    pub category: &'a str,
    /// Wall clock when the category's rollup started.
    pub started_at: i64,
    /// The `now` the run computed its cutoff from.
    pub run_now: i64,
    pub status: &'a str,
    pub rows_consumed: usize,
    pub buckets_written: usize,
    pub error_code: Option<&'a str>,
    pub error_message: Option<&'a str>,
}

/// A stored row of `rollup_runs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunRecord {
    pub run_id: i64,
    pub granularity: String,
    pub category: String,
    pub started_at: i64,
    pub run_now: i64,
    pub status: String,
    pub rows_consumed: i64,
    pub buckets_written: i64,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

/// Append one outcome to the run history.
///
/// # Errors
///
/// Returns an error if the insert fails.
pub fn record_run(conn: &Connection, run: &NewRun<'_>) -> Result<i64> {
    conn.prepare_cached(
        "INSERT INTO rollup_runs (
            granularity, category, started_at, run_now, status,
            rows_consumed, buckets_written, error_code, error_message
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
    )?
    .execute(params![
        run.granularity,
        run.category,
        run.started_at,
        run.run_now,
        run.status,
        i64::try_from(run.rows_consumed).unwrap_or(i64::MAX),
        i64::try_from(run.buckets_written).unwrap_or(i64::MAX),
        run.error_code,
        run.error_message,
    ])
    .with_context(|| format!("record {} run for {}", run.granularity, run.category))?;
    Ok(conn.last_insert_rowid())
}

/// Most recent runs first, optionally for a single category or granularity.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn recent_runs(
    conn: &Connection,
    category: Option<&str>,
    granularity: Option<&str>,
    limit: u32,
) -> Result<Vec<RunRecord>> {
    let mut stmt = conn.prepare(
        "SELECT run_id, granularity, category, started_at, run_now, status,
                rows_consumed, buckets_written, error_code, error_message
         FROM rollup_runs
         WHERE (?1 IS NULL OR category = ?1)
           AND (?2 IS NULL OR granularity = ?2)
         ORDER BY run_id DESC
         LIMIT ?3",
    )?;

    let runs = stmt
        .query_map(params![category, granularity, limit], |row| {
            Ok(RunRecord {
                run_id: row.get(0)?,
                granularity: row.get(1)?,
                category: row.get(2)?,
                started_at: row.get(3)?,
                run_now: row.get(4)?,
                status: row.get(5)?,
                rows_consumed: row.get(6)?,
                buckets_written: row.get(7)?,
                error_code: row.get(8)?,
                error_message: row.get(9)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("read rollup history")?;
    Ok(runs)
}

/// The latest successful run for a category and granularity, if any.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn last_success(conn: &Connection, category: &str, granularity: &str) -> Result<Option<i64>> {
    conn.query_row(
        "SELECT MAX(started_at) FROM rollup_runs
         WHERE category = ?1 AND granularity = ?2 AND status = 'ok'",
        params![category, granularity],
        |row| row.get::<_, Option<i64>>(0),
    )
    .optional()
    .map(Option::flatten)
    .context("read last successful run")
}
