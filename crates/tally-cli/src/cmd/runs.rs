use anyhow::Result;
use clap::Args;
use rusqlite::Connection;
use serde::Serialize;
use tally_core::db::query;
use tally_core::registry::Registry;
use tally_core::scheduler::Granularity;

use super::Context;
use crate::output::{format_epoch, render};

#[derive(Args, Debug)]
pub struct RunsArgs {
    /// Only show runs for this category.
    #[arg(long)]
    pub category: Option<String>,

    /// Only show hourly or daily runs.
    #[arg(long, value_name = "GRANULARITY")]
    pub granularity: Option<Granularity>,

    #[arg(long, default_value_t = 20)]
    pub limit: u32,

    /// Show the last successful run per category instead of the history.
    #[arg(long, conflicts_with = "limit")]
    pub last_success: bool,
}

#[derive(Debug, Serialize)]
struct LastSuccess {
    category: String,
    granularity: Granularity,
    started_at: Option<i64>,
}

fn last_successes(
    conn: &Connection,
    registry: &Registry,
    category: Option<&str>,
    granularity: Option<Granularity>,
) -> Result<Vec<LastSuccess>> {
    let granularities = granularity.map_or_else(|| Granularity::ALL.to_vec(), |g| vec![g]);
    let mut rows = Vec::new();
    for descriptor in registry.iter() {
        if category.is_some_and(|c| c != descriptor.category) {
            continue;
        }
        for &granularity in &granularities {
            rows.push(LastSuccess {
                category: descriptor.category.to_string(),
                granularity,
                started_at: query::last_success(conn, descriptor.category, granularity.as_str())?,
            });
        }
    }
    Ok(rows)
}

/// Execute `tally runs`: recent rollup history, newest first, or the last
/// successful run of each category.
///
/// # Errors
///
/// Returns an error if the category is unknown or the history cannot be read.
pub fn run_runs(args: &RunsArgs, ctx: &Context) -> Result<()> {
    if let Some(category) = args.category.as_deref() {
        ctx.registry.lookup(category)?;
    }
    let conn = ctx.open_db()?;

    if args.last_success {
        let rows = last_successes(
            &conn,
            &ctx.registry,
            args.category.as_deref(),
            args.granularity,
        )?;
        return render(ctx.output, &rows, |rows, w| {
            for row in rows {
                let when = row
                    .started_at
                    .map_or_else(|| "never".to_string(), format_epoch);
                writeln!(w, "{:<18} {:<7} {when}", row.category, row.granularity)?;
            }
            Ok(())
        });
    }

    let runs = query::recent_runs(
        &conn,
        args.category.as_deref(),
        args.granularity.map(Granularity::as_str),
        args.limit,
    )?;

    render(ctx.output, &runs, |runs, w| {
        if runs.is_empty() {
            return writeln!(w, "no rollup runs recorded");
        }
        for run in runs {
            write!(
                w,
                "#{:<5} {} {:<7} {:<18} {:<9}",
                run.run_id,
                format_epoch(run.started_at),
                run.granularity,
                run.category,
                run.status
            )?;
            match (&run.error_code, &run.error_message) {
                (Some(code), Some(message)) => writeln!(w, " {code} {message}")?,
                _ => writeln!(
                    w,
                    " {} rows -> {} buckets",
                    run.rows_consumed, run.buckets_written
                )?,
            }
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::db::{self, query::NewRun};

    #[test]
    fn last_successes_list_every_category_and_granularity() {
        let registry = Registry::builtin().expect("registry");
        let mut conn = Connection::open_in_memory().expect("in-memory db");
        db::prepare(&mut conn, &registry).expect("schema");
        query::record_run(
            &conn,
            &NewRun {
                granularity: "daily",
                category: "profile:gate",
                started_at: 500,
                run_now: 500,
                status: "ok",
                rows_consumed: 1,
                buckets_written: 1,
                error_code: None,
                error_message: None,
            },
        )
        .expect("record run");

        let all = last_successes(&conn, &registry, None, None).expect("query");
        assert_eq!(all.len(), 6);

        let gate = last_successes(
            &conn,
            &registry,
            Some("profile:gate"),
            Some(Granularity::Daily),
        )
        .expect("query");
        assert_eq!(gate.len(), 1);
        assert_eq!(gate[0].started_at, Some(500));
    }
}
