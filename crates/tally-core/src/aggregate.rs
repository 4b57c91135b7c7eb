//! Bucket aggregator: folds one tier of rows into the next-coarser tier.
//!
//! A run reads every eligible source row (`created_at <= now - width`),
//! groups them by `(actor, action, bucket start)`, upserts one destination row
//! per group, and deletes exactly the source rows it read. All of that happens
//! inside one `BEGIN IMMEDIATE` transaction, so a failure at any step leaves
//! both tiers as they were.
//!
//! # Merge policy
//!
//! - Raw rows contribute 1 each; rollup rows contribute their `count`.
//! - The earliest row of a group (by `created_at`, then `id`) seeds the
//!   destination row's subject and attributes. Later rows only add to the
//!   count.
//! - Attributes are not part of the key. A bucket whose events disagree on
//!   them (a gate that both passed and failed within the hour, or two source
//!   providers) reports the seed row's attributes for its whole count.
//! - If the destination already holds a row for the bucket (events that
//!   arrived after the bucket was first rolled up), the upsert adds to its
//!   count instead of inserting a second row.

use std::collections::BTreeMap;

use rusqlite::{Connection, Transaction, TransactionBehavior, params, params_from_iter};
use serde::Serialize;

use crate::bucket::{self, Tier};
use crate::db::schema;
use crate::error::{Result, TallyError};
use crate::registry::CategoryDescriptor;

/// Upper bound on ids bound into one `DELETE ... IN (...)` statement.
const DELETE_CHUNK: usize = 500;

// ---------------------------------------------------------------------------
// Pure grouping
// ---------------------------------------------------------------------------

/// One row read from a source tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRow {
    pub id: i64,
    pub actor_id: i64,
    pub subject_id: Option<i64>,
    pub action: String,
    /// Serialized attribute map, carried through verbatim.
    pub attributes: String,
    pub created_at: i64,
    /// Events represented by this row: 1 for raw rows.
    pub count: i64,
}

/// Grouping key of a rollup row.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BucketKey {
    pub actor_id: i64,
    pub action: String,
    pub bucket_start: i64,
}

/// Merge result for one bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketGroup {
    pub key: BucketKey,
    pub subject_id: Option<i64>,
    pub attributes: String,
    pub count: i64,
    /// `(created_at, id)` of the row that seeded subject and attributes.
    seeded_by: (i64, i64),
}

/// Group rows into buckets of `width` seconds, summing counts.
///
/// The result is ordered by key and does not depend on input order.
#[must_use]
pub fn group_rows(rows: &[SourceRow], width: i64) -> Vec<BucketGroup> {
    let mut groups: BTreeMap<BucketKey, BucketGroup> = BTreeMap::new();

    for row in rows {
        let key = BucketKey {
            actor_id: row.actor_id,
            action: row.action.clone(),
            bucket_start: bucket::bucket_start(row.created_at, width),
        };
        let order = (row.created_at, row.id);

        let group = groups.entry(key).or_insert_with_key(|key| BucketGroup {
            key: key.clone(),
            subject_id: row.subject_id,
            attributes: row.attributes.clone(),
            count: 0,
            seeded_by: order,
        });

        if order < group.seeded_by {
            group.subject_id = row.subject_id;
            group.attributes.clone_from(&row.attributes);
            group.seeded_by = order;
        }
        group.count = group.count.saturating_add(row.count);
    }

    groups.into_values().collect()
}

// ---------------------------------------------------------------------------
// Storage-bound rollup
// ---------------------------------------------------------------------------

/// Outcome of one category's rollup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RollupReport {
    pub category: String,
    pub source_table: String,
    pub destination_table: String,
    /// Rows with `created_at` at or before this were eligible.
    pub cutoff: i64,
    pub rows_consumed: usize,
    pub buckets_written: usize,
    /// Sum of counts moved into the destination tier.
    pub events_folded: i64,
}

/// Roll `source` rows of one category up into `destination`.
///
/// # Errors
///
/// - [`TallyError::Configuration`] if `width_secs` is not positive, the
///   destination is not coarser than the source, the width does not align
///   with the source tier's own buckets, or a tier table lacks a required
///   column.
/// - Storage errors (`StorageUnavailable`, `ConstraintViolation`, `Storage`)
///   if any statement fails; the transaction is rolled back in that case.
/// - [`TallyError::Storage`] if fewer source rows were deleted than read.
pub fn rollup(
    conn: &Connection,
    descriptor: &CategoryDescriptor,
    source: Tier,
    destination: Tier,
    width_secs: i64,
    now: i64,
) -> Result<RollupReport> {
    validate_plan(descriptor, source, destination, width_secs)?;
    schema::verify_tier_columns(conn, descriptor, source)?;
    schema::verify_tier_columns(conn, descriptor, destination)?;

    let cutoff = bucket::cutoff(now, width_secs);
    let mut report = RollupReport {
        category: descriptor.category.to_string(),
        source_table: descriptor.table_for(source),
        destination_table: descriptor.table_for(destination),
        cutoff,
        rows_consumed: 0,
        buckets_written: 0,
        events_folded: 0,
    };

    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;

    let rows = read_eligible(&tx, descriptor, source, cutoff)?;
    if rows.is_empty() {
        tracing::debug!(
            category = descriptor.category,
            source = %source,
            cutoff,
            "no eligible rows"
        );
        return Ok(report);
    }

    let groups = group_rows(&rows, width_secs);
    for group in &groups {
        upsert_group(&tx, descriptor, destination, group)?;
    }

    let ids: Vec<i64> = rows.iter().map(|row| row.id).collect();
    let deleted = delete_rows(&tx, &report.source_table, &ids)?;
    if deleted != ids.len() {
        tracing::warn!(
            category = descriptor.category,
            table = %report.source_table,
            expected = ids.len(),
            deleted,
            "source rows changed under the rollup; rolling back"
        );
        return Err(TallyError::Storage(rusqlite::Error::StatementChangedRows(
            deleted,
        )));
    }

    tx.commit()?;

    report.rows_consumed = rows.len();
    report.buckets_written = groups.len();
    report.events_folded = groups.iter().map(|g| g.count).sum();

    tracing::debug!(
        category = descriptor.category,
        source = %report.source_table,
        destination = %report.destination_table,
        rows = report.rows_consumed,
        buckets = report.buckets_written,
        "rolled up category"
    );
    Ok(report)
}

fn validate_plan(
    descriptor: &CategoryDescriptor,
    source: Tier,
    destination: Tier,
    width_secs: i64,
) -> Result<()> {
    if width_secs <= 0 {
        return Err(TallyError::Configuration(format!(
            "{}: bucket width must be positive, got {width_secs}",
            descriptor.category
        )));
    }
    if destination <= source {
        return Err(TallyError::Configuration(format!(
            "{}: cannot roll {source} rows into {destination}",
            descriptor.category
        )));
    }
    match source.bucket_width() {
        Some(source_width) if width_secs % source_width != 0 => {
            Err(TallyError::Configuration(format!(
                "{}: width {width_secs}s does not align with {source} buckets of {source_width}s",
                descriptor.category
            )))
        }
        _ => Ok(()),
    }
}

fn read_eligible(
    conn: &Connection,
    descriptor: &CategoryDescriptor,
    source: Tier,
    cutoff: i64,
) -> Result<Vec<SourceRow>> {
    let count_expr = if source.has_count() { "\"count\"" } else { "1" };
    let sql = format!(
        "SELECT id, {actor}, {subject}, action, attributes, created_at, {count_expr} \
         FROM {table} \
         WHERE created_at <= ?1 \
         ORDER BY created_at ASC, id ASC",
        actor = descriptor.actor_column,
        subject = descriptor.subject_column,
        table = descriptor.table_for(source),
    );

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([cutoff], |row| {
            Ok(SourceRow {
                id: row.get(0)?,
                actor_id: row.get(1)?,
                subject_id: row.get(2)?,
                action: row.get(3)?,
                attributes: row.get(4)?,
                created_at: row.get(5)?,
                count: row.get(6)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn upsert_group(
    conn: &Connection,
    descriptor: &CategoryDescriptor,
    destination: Tier,
    group: &BucketGroup,
) -> Result<()> {
    let sql = format!(
        "INSERT INTO {table} ({actor}, {subject}, action, attributes, created_at, \"count\") \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
         ON CONFLICT ({actor}, action, created_at) \
         DO UPDATE SET \"count\" = \"count\" + excluded.\"count\"",
        table = descriptor.table_for(destination),
        actor = descriptor.actor_column,
        subject = descriptor.subject_column,
    );

    conn.prepare_cached(&sql)?.execute(params![
        group.key.actor_id,
        group.subject_id,
        group.key.action,
        group.attributes,
        group.key.bucket_start,
        group.count,
    ])?;
    Ok(())
}

fn delete_rows(conn: &Connection, table: &str, ids: &[i64]) -> Result<usize> {
    let mut deleted = 0;
    for chunk in ids.chunks(DELETE_CHUNK) {
        let placeholders = vec!["?"; chunk.len()].join(", ");
        let sql = format!("DELETE FROM {table} WHERE id IN ({placeholders})");
        deleted += conn.execute(&sql, params_from_iter(chunk.iter()))?;
    }
    Ok(deleted)
}
