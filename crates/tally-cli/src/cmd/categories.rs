use anyhow::Result;
use clap::Args;
use serde::Serialize;
use tally_core::Tier;

use super::Context;
use crate::output::render;

#[derive(Args, Debug, Default)]
pub struct CategoriesArgs {}

#[derive(Debug, Serialize)]
struct CategoryRow {
    category: &'static str,
    actor_column: &'static str,
    subject_column: &'static str,
    raw_table: String,
    hourly_table: String,
    daily_table: String,
}

/// Execute `tally categories`: list the registry. Does not touch the database.
pub fn run_categories(_args: &CategoriesArgs, ctx: &Context) -> Result<()> {
    let rows: Vec<CategoryRow> = ctx
        .registry
        .iter()
        .map(|descriptor| CategoryRow {
            category: descriptor.category,
            actor_column: descriptor.actor_column,
            subject_column: descriptor.subject_column,
            raw_table: descriptor.table_for(Tier::Raw),
            hourly_table: descriptor.table_for(Tier::Hourly),
            daily_table: descriptor.table_for(Tier::Daily),
        })
        .collect();

    render(ctx.output, &rows, |rows, w| {
        for row in rows {
            writeln!(
                w,
                "{:<18} {} ({}, {}) -> {}, {}",
                row.category,
                row.raw_table,
                row.actor_column,
                row.subject_column,
                row.hourly_table,
                row.daily_table
            )?;
        }
        Ok(())
    })
}
