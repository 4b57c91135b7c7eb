//! `tally ingest`: drain newline-delimited intake payloads.
//!
//! Each non-blank input line is one job. Acks are written one per line in
//! input order; in JSON mode each ack is a compact JSON object.

use anyhow::{Context as _, Result};
use clap::Args;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::PathBuf;
use tally_core::intake::{self, Ack, AckSummary, JobAck};

use super::Context;

#[derive(Args, Debug)]
pub struct IngestArgs {
    /// File with one JSON payload per line. Reads stdin when omitted or `-`.
    pub input: Option<PathBuf>,

    /// Worker threads, each with its own database connection.
    #[arg(long)]
    pub workers: Option<usize>,
}

/// Raw input lines. Decoding is left to the intake jobs so that one bad
/// line is acked on its own.
fn read_lines(input: Option<&PathBuf>) -> Result<Vec<Vec<u8>>> {
    let reader: Box<dyn BufRead> = match input {
        Some(path) if path.as_os_str() != "-" => Box::new(BufReader::new(
            File::open(path).with_context(|| format!("Failed to open {}", path.display()))?,
        )),
        _ => Box::new(io::stdin().lock()),
    };
    split_lines(reader).context("read intake payloads")
}

fn split_lines(reader: impl BufRead) -> io::Result<Vec<Vec<u8>>> {
    reader
        .split(b'\n')
        .map(|line| {
            line.map(|mut bytes| {
                if bytes.last() == Some(&b'\r') {
                    bytes.pop();
                }
                bytes
            })
        })
        .collect()
}

fn write_ack(w: &mut dyn Write, job: &JobAck, json: bool) -> Result<()> {
    if json {
        serde_json::to_writer(&mut *w, job)?;
        writeln!(w)?;
        return Ok(());
    }
    match &job.ack {
        Ack::Ok { id } => writeln!(w, "line {}: ok #{id}", job.line)?,
        Ack::Invalid { code, message }
        | Ack::Retry { code, message }
        | Ack::Failed { code, message } => {
            writeln!(w, "line {}: {} {code} {message}", job.line, job.ack.label())?;
        }
    }
    Ok(())
}

/// Execute `tally ingest`.
///
/// Invalid payloads are acknowledged and skipped. The command fails only
/// when some job could not be stored (`retry` or `failed` acks).
///
/// # Errors
///
/// Returns an error if input cannot be read, the database cannot be opened,
/// or any job was acknowledged with `retry` or `failed`.
pub fn run_ingest(args: &IngestArgs, ctx: &Context) -> Result<()> {
    // Workers only connect; schema setup happens once here.
    drop(ctx.open_db()?);

    let lines = read_lines(args.input.as_ref())?;
    let workers = args.workers.unwrap_or(ctx.config.config.intake.workers);

    let acks = intake::run_workers(
        &ctx.config.db_path,
        ctx.config.config.database.busy_timeout(),
        &ctx.registry,
        workers,
        intake::jobs_from_lines(lines),
    )?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    for job in &acks {
        write_ack(&mut out, job, ctx.output.is_json())?;
    }

    let summary = AckSummary::from_acks(&acks);
    tracing::info!(
        ok = summary.ok,
        invalid = summary.invalid,
        retry = summary.retry,
        failed = summary.failed,
        "ingest finished"
    );

    if summary.retry + summary.failed > 0 {
        anyhow::bail!(
            "{} job(s) need redelivery and {} failed",
            summary.retry,
            summary.failed
        );
    }
    Ok(())
}
