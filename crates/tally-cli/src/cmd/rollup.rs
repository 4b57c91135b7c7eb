//! `tally hourly` / `tally daily`: scheduled rollup entry points.
//!
//! The run holds an exclusive advisory lock next to the database so two
//! schedulers never fold the same rows concurrently.

use anyhow::Result;
use clap::Args;
use std::io::Write;
use std::sync::atomic::AtomicBool;
use std::time::Duration;
use tally_core::TallyError;
use tally_core::lock::RunLock;
use tally_core::scheduler::{self, CategoryOutcome, Granularity, RunReport};

use super::{Context, now_or};
use crate::output::{format_epoch, render, section};

#[derive(Args, Debug)]
pub struct RollupArgs {
    /// Roll up a single category instead of all of them.
    pub category: Option<String>,

    /// Pretend the run happens at this epoch second.
    #[arg(long, allow_hyphen_values = true)]
    pub now: Option<i64>,

    /// How long to wait for a concurrent run to finish.
    #[arg(long, default_value_t = 10_000)]
    pub lock_timeout_ms: u64,
}

fn render_human(report: &RunReport, w: &mut dyn Write) -> std::io::Result<()> {
    section(
        w,
        &format!("{} rollup at {}", report.granularity, format_epoch(report.now)),
    )?;
    for run in &report.categories {
        match &run.outcome {
            CategoryOutcome::Ok(rollup) => writeln!(
                w,
                "{:<18} ok        {} rows -> {} buckets ({} events) up to {}",
                run.category,
                rollup.rows_consumed,
                rollup.buckets_written,
                rollup.events_folded,
                format_epoch(rollup.cutoff)
            )?,
            CategoryOutcome::Failed { code, message } => {
                writeln!(w, "{:<18} failed    {code} {message}", run.category)?;
            }
            CategoryOutcome::Cancelled => writeln!(w, "{:<18} cancelled", run.category)?,
        }
    }
    Ok(())
}

/// Execute one scheduled rollup.
///
/// # Errors
///
/// Returns an error if the run lock cannot be taken, the category filter is
/// unknown, or any category failed. The report is printed before a
/// per-category failure is returned.
pub fn run_rollup(granularity: Granularity, args: &RollupArgs, ctx: &Context) -> Result<()> {
    let conn = ctx.open_db()?;
    let lock = RunLock::acquire(
        &RunLock::path_for(&ctx.config.db_path),
        Duration::from_millis(args.lock_timeout_ms),
    )
    .map_err(TallyError::from)?;

    let now = now_or(args.now);
    let cancel = AtomicBool::new(false);
    let filter = args.category.as_deref();
    let report = match granularity {
        Granularity::Hourly => scheduler::run_hourly(&conn, &ctx.registry, now, filter, &cancel)?,
        Granularity::Daily => scheduler::run_daily(&conn, &ctx.registry, now, filter, &cancel)?,
    };
    lock.release();

    render(ctx.output, &report, |report, w| render_human(report, w))?;

    if report.has_failures() {
        anyhow::bail!(
            "{} of {} categories failed during the {} rollup",
            report.failures(),
            report.categories.len(),
            granularity
        );
    }
    Ok(())
}
