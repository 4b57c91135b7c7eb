//! Rollup scheduler adapter: runs the aggregator over every category.
//!
//! Each category is rolled up on its own; a failure in one is captured as a
//! [`CategoryOutcome::Failed`] and the loop moves on. Outcomes are appended to
//! `rollup_runs` on a best-effort basis.
//!
//! Callers must serialize runs (the CLI holds a [`RunLock`](crate::lock::RunLock)
//! for the duration).

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

use rusqlite::Connection;
use serde::Serialize;

use crate::aggregate::{self, RollupReport};
use crate::bucket::{DAILY_WIDTH_SECS, HOURLY_WIDTH_SECS, Tier};
use crate::db::query::{self, NewRun};
use crate::error::{ErrorCode, Result};
use crate::registry::{CategoryDescriptor, Registry};

/// Which scheduled job is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    /// Raw events into hourly buckets.
    Hourly,
    /// Hourly buckets into daily buckets.
    Daily,
}

impl Granularity {
    pub const ALL: [Self; 2] = [Self::Hourly, Self::Daily];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Hourly => "hourly",
            Self::Daily => "daily",
        }
    }

    #[must_use]
    pub const fn source(self) -> Tier {
        match self {
            Self::Hourly => Tier::Raw,
            Self::Daily => Tier::Hourly,
        }
    }

    #[must_use]
    pub const fn destination(self) -> Tier {
        match self {
            Self::Hourly => Tier::Hourly,
            Self::Daily => Tier::Daily,
        }
    }

    #[must_use]
    pub const fn width_secs(self) -> i64 {
        match self {
            Self::Hourly => HOURLY_WIDTH_SECS,
            Self::Daily => DAILY_WIDTH_SECS,
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Granularity {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hourly" => Ok(Self::Hourly),
            "daily" => Ok(Self::Daily),
            other => Err(format!("unknown granularity '{other}'")),
        }
    }
}

/// Result of one category within a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum CategoryOutcome {
    Ok(RollupReport),
    Failed { code: ErrorCode, message: String },
    /// The run was cancelled before this category started.
    Cancelled,
}

impl CategoryOutcome {
    #[must_use]
    pub const fn status(&self) -> &'static str {
        match self {
            Self::Ok(_) => "ok",
            Self::Failed { .. } => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CategoryRun {
    pub category: String,
    pub outcome: CategoryOutcome,
}

/// Everything one scheduled invocation did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub granularity: Granularity,
    pub now: i64,
    pub categories: Vec<CategoryRun>,
}

impl RunReport {
    /// Number of categories whose rollup failed.
    #[must_use]
    pub fn failures(&self) -> usize {
        self.categories
            .iter()
            .filter(|run| matches!(run.outcome, CategoryOutcome::Failed { .. }))
            .count()
    }

    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.failures() > 0
    }

    #[must_use]
    pub fn was_cancelled(&self) -> bool {
        self.categories
            .iter()
            .any(|run| run.outcome == CategoryOutcome::Cancelled)
    }

    /// Sum of raw or hourly rows retired across successful categories.
    #[must_use]
    pub fn rows_consumed(&self) -> usize {
        self.categories
            .iter()
            .filter_map(|run| match &run.outcome {
                CategoryOutcome::Ok(report) => Some(report.rows_consumed),
                _ => None,
            })
            .sum()
    }
}

/// Roll raw events into hourly buckets for every (or one) category.
///
/// # Errors
///
/// Only [`TallyError::UnknownCategory`](crate::error::TallyError::UnknownCategory)
/// when `filter` names an unregistered category. Per-category failures are
/// reported in the returned [`RunReport`].
pub fn run_hourly(
    conn: &Connection,
    registry: &Registry,
    now: i64,
    filter: Option<&str>,
    cancel: &AtomicBool,
) -> Result<RunReport> {
    run(conn, registry, Granularity::Hourly, now, filter, cancel)
}

/// Roll hourly buckets into daily buckets for every (or one) category.
///
/// # Errors
///
/// Same as [`run_hourly`].
pub fn run_daily(
    conn: &Connection,
    registry: &Registry,
    now: i64,
    filter: Option<&str>,
    cancel: &AtomicBool,
) -> Result<RunReport> {
    run(conn, registry, Granularity::Daily, now, filter, cancel)
}

/// Run one granularity over the selected categories.
///
/// # Errors
///
/// Same as [`run_hourly`].
pub fn run(
    conn: &Connection,
    registry: &Registry,
    granularity: Granularity,
    now: i64,
    filter: Option<&str>,
    cancel: &AtomicBool,
) -> Result<RunReport> {
    let targets: Vec<&CategoryDescriptor> = match filter {
        Some(category) => vec![registry.lookup(category)?],
        None => registry.iter().collect(),
    };

    tracing::info!(
        %granularity,
        now,
        categories = targets.len(),
        "starting rollup run"
    );

    let mut categories = Vec::with_capacity(targets.len());
    for descriptor in targets {
        let started_at = chrono::Utc::now().timestamp();
        let outcome = if cancel.load(Ordering::SeqCst) {
            CategoryOutcome::Cancelled
        } else {
            rollup_category(conn, descriptor, granularity, now)
        };

        record_history(conn, granularity, descriptor.category, started_at, now, &outcome);
        categories.push(CategoryRun {
            category: descriptor.category.to_string(),
            outcome,
        });
    }

    let report = RunReport {
        granularity,
        now,
        categories,
    };
    tracing::info!(
        %granularity,
        rows = report.rows_consumed(),
        failures = report.failures(),
        cancelled = report.was_cancelled(),
        "rollup run finished"
    );
    Ok(report)
}

fn rollup_category(
    conn: &Connection,
    descriptor: &CategoryDescriptor,
    granularity: Granularity,
    now: i64,
) -> CategoryOutcome {
    match aggregate::rollup(
        conn,
        descriptor,
        granularity.source(),
        granularity.destination(),
        granularity.width_secs(),
        now,
    ) {
        Ok(report) => CategoryOutcome::Ok(report),
        Err(err) => {
            tracing::warn!(
                category = descriptor.category,
                %granularity,
                code = %err.code(),
                error = %err,
                "category rollup failed"
            );
            CategoryOutcome::Failed {
                code: err.code(),
                message: err.to_string(),
            }
        }
    }
}

fn record_history(
    conn: &Connection,
    granularity: Granularity,
    category: &str,
    started_at: i64,
    now: i64,
    outcome: &CategoryOutcome,
) {
    let (rows_consumed, buckets_written) = match outcome {
        CategoryOutcome::Ok(report) => (report.rows_consumed, report.buckets_written),
        _ => (0, 0),
    };
    let (error_code, error_message) = match outcome {
        CategoryOutcome::Failed { code, message } => (Some(code.code()), Some(message.as_str())),
        _ => (None, None),
    };

    let run = NewRun {
        granularity: granularity.as_str(),
        category,
        started_at,
        run_now: now,
        status: outcome.status(),
        rows_consumed,
        buckets_written,
        error_code,
        error_message,
    };
    if let Err(err) = query::record_run(conn, &run) {
        tracing::warn!(category, %granularity, error = %err, "could not record rollup history");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::recorder::Recorder;

    fn setup() -> (Connection, Registry) {
        let registry = Registry::builtin().expect("registry");
        let mut conn = Connection::open_in_memory().expect("in-memory db");
        db::prepare(&mut conn, &registry).expect("schema");
        (conn, registry)
    }

    fn seed(conn: &Connection, registry: &Registry) -> Result<()> {
        let recorder = Recorder::new(conn, registry);
        for category in ["profile:source", "profile:gate", "profile:flag"] {
            recorder.record(category, 1, 1, "created", 100)?;
            recorder.record(category, 1, 1, "created", 200)?;
        }
        Ok(())
    }

    fn count(conn: &Connection, table: &str) -> i64 {
        conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
            .expect("count")
    }

    #[test]
    fn hourly_run_covers_every_category() -> Result<()> {
        let (conn, registry) = setup();
        seed(&conn, &registry)?;

        let report = run_hourly(&conn, &registry, 4_000, None, &AtomicBool::new(false))?;
        assert_eq!(report.categories.len(), 3);
        assert!(!report.has_failures());
        assert_eq!(report.rows_consumed(), 6);

        for table in ["source_metrics", "gate_metrics", "flag_metrics"] {
            assert_eq!(count(&conn, table), 0, "{table}");
            assert_eq!(count(&conn, &format!("{table}_hourly")), 1, "{table}");
        }
        Ok(())
    }

    #[test]
    fn filter_limits_run_to_one_category() -> Result<()> {
        let (conn, registry) = setup();
        seed(&conn, &registry)?;

        let report = run_hourly(
            &conn,
            &registry,
            4_000,
            Some("profile:gate"),
            &AtomicBool::new(false),
        )?;
        assert_eq!(report.categories.len(), 1);
        assert_eq!(report.categories[0].category, "profile:gate");
        assert_eq!(count(&conn, "gate_metrics"), 0);
        assert_eq!(count(&conn, "source_metrics"), 2);
        Ok(())
    }

    #[test]
    fn unknown_filter_fails_the_whole_call() {
        let (conn, registry) = setup();
        let err = run_daily(&conn, &registry, 0, Some("bogus"), &AtomicBool::new(false))
            .expect_err("unknown category");
        assert_eq!(err.code(), ErrorCode::UnknownCategory);
    }

    #[test]
    fn one_failing_category_does_not_stop_the_others() -> Result<()> {
        let (conn, registry) = setup();
        seed(&conn, &registry)?;
        conn.execute_batch("DROP TABLE gate_metrics_hourly")?;

        let report = run_hourly(&conn, &registry, 4_000, None, &AtomicBool::new(false))?;
        assert_eq!(report.failures(), 1);

        let gate = report
            .categories
            .iter()
            .find(|run| run.category == "profile:gate")
            .expect("gate outcome");
        assert!(matches!(
            gate.outcome,
            CategoryOutcome::Failed {
                code: ErrorCode::ConfigurationError,
                ..
            }
        ));
        assert_eq!(count(&conn, "gate_metrics"), 2);
        assert_eq!(count(&conn, "source_metrics"), 0);
        assert_eq!(count(&conn, "flag_metrics"), 0);

        let history = query::recent_runs(&conn, Some("profile:gate"), None, 1).expect("history");
        assert_eq!(history[0].status, "failed");
        assert_eq!(history[0].error_code.as_deref(), Some("E3001"));
        Ok(())
    }

    #[test]
    fn cancelled_run_leaves_data_untouched() -> Result<()> {
        let (conn, registry) = setup();
        seed(&conn, &registry)?;

        let report = run_hourly(&conn, &registry, 4_000, None, &AtomicBool::new(true))?;
        assert!(report.was_cancelled());
        assert!(
            report
                .categories
                .iter()
                .all(|run| run.outcome == CategoryOutcome::Cancelled)
        );
        assert_eq!(count(&conn, "source_metrics"), 2);
        Ok(())
    }

    #[test]
    fn daily_run_folds_hourly_buckets() -> Result<()> {
        let (conn, registry) = setup();
        seed(&conn, &registry)?;
        let cancel = AtomicBool::new(false);

        run_hourly(&conn, &registry, 4_000, None, &cancel)?;
        let report = run_daily(&conn, &registry, 200_000, None, &cancel)?;
        assert_eq!(report.rows_consumed(), 3);

        let total: i64 = conn.query_row(
            "SELECT \"count\" FROM flag_metrics_daily WHERE created_at = 0",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(total, 2);
        assert_eq!(count(&conn, "flag_metrics_hourly"), 0);
        Ok(())
    }

    #[test]
    fn history_is_written_per_category() -> Result<()> {
        let (conn, registry) = setup();
        seed(&conn, &registry)?;

        run_hourly(&conn, &registry, 4_000, None, &AtomicBool::new(false))?;
        let history = query::recent_runs(&conn, None, None, 10).expect("history");
        assert_eq!(history.len(), 3);
        assert!(history.iter().all(|run| run.status == "ok" && run.run_now == 4_000));
        assert!(history.iter().all(|run| run.rows_consumed == 2));
        Ok(())
    }

    #[test]
    fn history_failures_do_not_change_outcomes() -> Result<()> {
        let (conn, registry) = setup();
        seed(&conn, &registry)?;
        conn.execute_batch("DROP TABLE rollup_runs")?;

        let report = run_hourly(&conn, &registry, 4_000, None, &AtomicBool::new(false))?;
        assert!(!report.has_failures());
        assert_eq!(report.rows_consumed(), 6);
        Ok(())
    }

    #[test]
    fn outcomes_serialize_with_status_tag() {
        let failed = CategoryOutcome::Failed {
            code: ErrorCode::ConstraintViolation,
            message: "boom".to_string(),
        };
        let value = serde_json::to_value(&failed).expect("serialize");
        assert_eq!(
            value,
            serde_json::json!({"status": "failed", "code": "E2002", "message": "boom"})
        );
    }

    #[test]
    fn granularity_parses_case_insensitively() {
        assert_eq!("Hourly".parse::<Granularity>(), Ok(Granularity::Hourly));
        assert_eq!(" daily ".parse::<Granularity>(), Ok(Granularity::Daily));
        assert!("weekly".parse::<Granularity>().is_err());
    }
}
