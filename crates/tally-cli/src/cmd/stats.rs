//! `tally stats`: row and event totals per category and tier.

use anyhow::Result;
use clap::Args;
use serde::Serialize;
use tally_core::bucket::Tier;
use tally_core::config::ConfigSource;
use tally_core::db::query::{self, TierStats};

use super::Context;
use crate::output::{format_epoch, kv, render, section};

#[derive(Args, Debug, Default)]
pub struct StatsArgs {
    /// Only show one tier: raw, hourly, or daily.
    #[arg(long, value_name = "TIER")]
    pub tier: Option<Tier>,
}

#[derive(Debug, Serialize)]
struct StatsReport<'a> {
    db_path: String,
    config: &'a ConfigSource,
    tiers: Vec<TierStats>,
}

fn span(stats: &TierStats) -> String {
    match (stats.oldest, stats.newest) {
        (Some(oldest), Some(newest)) => {
            format!("{} .. {}", format_epoch(oldest), format_epoch(newest))
        }
        _ => "-".to_string(),
    }
}

/// Execute `tally stats`.
///
/// # Errors
///
/// Returns an error if the database cannot be opened or queried.
pub fn run_stats(args: &StatsArgs, ctx: &Context) -> Result<()> {
    let conn = ctx.open_db()?;
    let report = StatsReport {
        db_path: ctx.config.db_path.display().to_string(),
        config: &ctx.config.source,
        tiers: query::all_tier_stats(&conn, &ctx.registry, args.tier)?,
    };

    render(ctx.output, &report, |report, w| {
        kv(w, "database", &report.db_path)?;
        writeln!(w)?;
        section(w, "tier tables")?;
        for stats in &report.tiers {
            writeln!(
                w,
                "{:<24} {:>8} rows {:>10} events  {}",
                stats.table,
                stats.rows,
                stats.events,
                span(stats)
            )?;
        }
        Ok(())
    })
}
