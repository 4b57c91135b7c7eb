//! `tally record`: insert one event directly, bypassing the intake queue.

use anyhow::Result;
use clap::Args;
use serde::Serialize;
use tally_core::recorder::{Recorder, RowId};

use super::{Context, now_or};
use crate::output::{format_epoch, render};

#[derive(Args, Debug)]
pub struct RecordArgs {
    /// Registered category, e.g. `profile:source`.
    pub category: String,

    /// Actor id (the credential that performed the action).
    #[arg(long)]
    pub actor: i64,

    /// Subject id (the source, gate, or flag acted on).
    #[arg(long)]
    pub subject: i64,

    #[arg(long)]
    pub action: String,

    /// Event time in epoch seconds. Defaults to now.
    #[arg(long, allow_hyphen_values = true)]
    pub at: Option<i64>,
}

#[derive(Debug, Serialize)]
struct Recorded {
    id: RowId,
    category: String,
    created_at: i64,
}

/// Execute `tally record`.
///
/// # Errors
///
/// Returns the recorder's error for unknown categories, invalid fields, or
/// storage failures.
pub fn run_record(args: &RecordArgs, ctx: &Context) -> Result<()> {
    let conn = ctx.open_db()?;
    let created_at = now_or(args.at);

    let id = Recorder::new(&conn, &ctx.registry).record(
        &args.category,
        args.actor,
        args.subject,
        &args.action,
        created_at,
    )?;

    let recorded = Recorded {
        id,
        category: args.category.clone(),
        created_at,
    };
    render(ctx.output, &recorded, |r, w| {
        writeln!(
            w,
            "recorded {} #{} at {}",
            r.category,
            r.id,
            format_epoch(r.created_at)
        )
    })
}
