//! Intake: turns queued payloads into recorded rows and acknowledgements.
//!
//! Every job gets exactly one [`Ack`]. A bad payload produces a negative ack
//! and never stops the worker.
//!
//! | ack       | when                                         |
//! |-----------|----------------------------------------------|
//! | `ok`      | row inserted                                 |
//! | `invalid` | unknown endpoint or malformed payload        |
//! | `retry`   | database busy, locked, or not openable       |
//! | `failed`  | any other storage or configuration failure   |

use std::path::Path;
use std::sync::Mutex;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::db;
use crate::error::{ErrorCode, TallyError};
use crate::recorder::{Recorder, RowId};
use crate::registry::Registry;

/// Jobs buffered per worker before the reader blocks.
const QUEUE_DEPTH_PER_WORKER: usize = 16;

/// Completion status reported back to the queue for one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "ack", rename_all = "lowercase")]
pub enum Ack {
    Ok { id: RowId },
    /// Do not redeliver: the payload will never succeed.
    Invalid { code: ErrorCode, message: String },
    /// Transient storage failure: redeliver later.
    Retry { code: ErrorCode, message: String },
    Failed { code: ErrorCode, message: String },
}

impl Ack {
    #[must_use]
    pub fn from_result(result: Result<RowId, TallyError>) -> Self {
        match result {
            Ok(id) => Self::Ok { id },
            Err(err) => {
                let code = err.code();
                let message = err.to_string();
                match code {
                    ErrorCode::UnknownCategory | ErrorCode::MalformedPayload => {
                        Self::Invalid { code, message }
                    }
                    ErrorCode::StorageUnavailable => Self::Retry { code, message },
                    _ => Self::Failed { code, message },
                }
            }
        }
    }

    #[must_use]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }

    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Ok { .. } => "ok",
            Self::Invalid { .. } => "invalid",
            Self::Retry { .. } => "retry",
            Self::Failed { .. } => "failed",
        }
    }
}

/// Record one raw payload and acknowledge it. Bytes that are not UTF-8 are
/// a malformed payload like any other.
#[must_use]
pub fn handle_job(recorder: &Recorder<'_>, raw: &[u8]) -> Ack {
    let result = std::str::from_utf8(raw)
        .map_err(|err| TallyError::MalformedPayload(format!("payload is not UTF-8: {err}")))
        .and_then(|text| recorder.record_payload(text));
    let ack = Ack::from_result(result);
    match &ack {
        Ack::Ok { id } => tracing::debug!(row_id = id, "job acknowledged"),
        Ack::Invalid { code, message } => {
            tracing::warn!(%code, %message, "rejected invalid job");
        }
        Ack::Retry { code, message } | Ack::Failed { code, message } => {
            tracing::warn!(%code, %message, ack = ack.label(), "job not recorded");
        }
    }
    ack
}

/// One line of input, undecoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    /// 1-based input line number.
    pub line: usize,
    pub payload: Vec<u8>,
}

/// An ack tagged with the line it answers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobAck {
    pub line: usize,
    #[serde(flatten)]
    pub ack: Ack,
}

/// Tallies of an intake batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AckSummary {
    pub ok: usize,
    pub invalid: usize,
    pub retry: usize,
    pub failed: usize,
}

impl AckSummary {
    #[must_use]
    pub fn from_acks(acks: &[JobAck]) -> Self {
        let mut summary = Self::default();
        for job in acks {
            match job.ack {
                Ack::Ok { .. } => summary.ok += 1,
                Ack::Invalid { .. } => summary.invalid += 1,
                Ack::Retry { .. } => summary.retry += 1,
                Ack::Failed { .. } => summary.failed += 1,
            }
        }
        summary
    }
}

/// Record `jobs` with a pool of `workers` threads, each on its own connection.
///
/// Blank payloads are skipped without an ack. The returned acks are sorted
/// by line number.
///
/// # Errors
///
/// Returns an error if a worker connection cannot be opened. No job is
/// processed in that case.
pub fn run_workers(
    db_path: &Path,
    busy_timeout: Duration,
    registry: &Registry,
    workers: usize,
    jobs: impl IntoIterator<Item = Job>,
) -> Result<Vec<JobAck>> {
    let workers = workers.max(1);
    let connections = (0..workers)
        .map(|worker| {
            db::connect(db_path, busy_timeout)
                .with_context(|| format!("open connection for intake worker {worker}"))
        })
        .collect::<Result<Vec<_>>>()?;

    let (job_tx, job_rx) = mpsc::sync_channel::<Job>(workers * QUEUE_DEPTH_PER_WORKER);
    let job_rx = Mutex::new(job_rx);
    let (ack_tx, ack_rx) = mpsc::channel::<JobAck>();

    thread::scope(|scope| {
        for (worker, conn) in connections.into_iter().enumerate() {
            let ack_tx = ack_tx.clone();
            let job_rx = &job_rx;
            scope.spawn(move || {
                let recorder = Recorder::new(&conn, registry);
                let mut handled = 0_usize;
                loop {
                    let next = match job_rx.lock() {
                        Ok(rx) => rx.recv(),
                        Err(_) => break,
                    };
                    let Ok(job) = next else { break };

                    let ack = handle_job(&recorder, &job.payload);
                    handled += 1;
                    if ack_tx.send(JobAck { line: job.line, ack }).is_err() {
                        break;
                    }
                }
                tracing::debug!(worker, handled, "intake worker finished");
            });
        }
        drop(ack_tx);

        for job in jobs {
            if job.payload.trim_ascii().is_empty() {
                continue;
            }
            if job_tx.send(job).is_err() {
                tracing::warn!("intake workers exited early; remaining jobs not queued");
                break;
            }
        }
        drop(job_tx);
    });

    let mut acks: Vec<JobAck> = ack_rx.into_iter().collect();
    acks.sort_by_key(|ack| ack.line);
    Ok(acks)
}

/// Number each line from 1 for [`run_workers`].
#[must_use]
pub fn jobs_from_lines<I, L>(lines: I) -> impl Iterator<Item = Job>
where
    I: IntoIterator<Item = L>,
    L: Into<Vec<u8>>,
{
    lines
        .into_iter()
        .enumerate()
        .map(|(index, payload)| Job {
            line: index + 1,
            payload: payload.into(),
        })
}
