//! Human and JSON rendering shared by every command.
//!
//! Results go to stdout, errors to stderr. In JSON mode a result is one
//! pretty-printed document and an error is `{"error": {...}}`.

use serde::Serialize;
use std::io::{self, Write};
use tally_core::error::TallyError;

const RULE: &str = "------------------------------------------------------------------------";

/// Heading underlined with a rule.
pub fn section(w: &mut dyn Write, heading: &str) -> io::Result<()> {
    writeln!(w, "{heading}\n{RULE}")
}

/// `key:` padded to a fixed column, then the value.
pub fn kv(w: &mut dyn Write, key: &str, value: impl AsRef<str>) -> io::Result<()> {
    writeln!(w, "{:<16} {}", format!("{key}:"), value.as_ref())
}

/// Bucket starts and run timestamps, in UTC.
pub fn format_epoch(secs: i64) -> String {
    chrono::DateTime::from_timestamp(secs, 0).map_or_else(
        || secs.to_string(),
        |at| at.format("%Y-%m-%d %H:%M:%SZ").to_string(),
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Human,
    Json,
}

impl OutputMode {
    pub const fn is_json(self) -> bool {
        matches!(self, Self::Json)
    }
}

/// Error as shown to the operator.
#[derive(Debug, Serialize)]
pub struct CliError {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    /// Whether rerunning the same command may succeed.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub transient: bool,
}

impl CliError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_code: None,
            suggestion: None,
            transient: false,
        }
    }

    /// Keep the full context chain as the message and take code and hint
    /// from the first [`TallyError`] in it.
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        let message = format!("{err:#}");
        match err.chain().find_map(|cause| cause.downcast_ref::<TallyError>()) {
            Some(tally) => Self {
                message,
                ..Self::from(tally)
            },
            None => Self::new(message),
        }
    }
}

impl From<&TallyError> for CliError {
    fn from(err: &TallyError) -> Self {
        let code = err.code();
        Self {
            message: err.to_string(),
            error_code: Some(code.code().to_string()),
            suggestion: Some(err.suggestion()),
            transient: code.is_transient(),
        }
    }
}

fn write_value<T: Serialize>(
    out: &mut dyn Write,
    mode: OutputMode,
    value: &T,
    human: impl FnOnce(&T, &mut dyn Write) -> io::Result<()>,
) -> anyhow::Result<()> {
    if mode.is_json() {
        serde_json::to_writer_pretty(&mut *out, value)?;
        writeln!(out)?;
    } else {
        human(value, out)?;
    }
    Ok(())
}

fn write_error(out: &mut dyn Write, mode: OutputMode, error: &CliError) -> anyhow::Result<()> {
    if mode.is_json() {
        serde_json::to_writer_pretty(&mut *out, &serde_json::json!({ "error": error }))?;
        writeln!(out)?;
        return Ok(());
    }
    match &error.error_code {
        Some(code) => writeln!(out, "error[{code}]: {}", error.message)?,
        None => writeln!(out, "error: {}", error.message)?,
    }
    if let Some(hint) = &error.suggestion {
        writeln!(out, "  hint: {hint}")?;
    }
    Ok(())
}

/// Print `value` to stdout as JSON or through `human`.
pub fn render<T: Serialize>(
    mode: OutputMode,
    value: &T,
    human: impl FnOnce(&T, &mut dyn Write) -> io::Result<()>,
) -> anyhow::Result<()> {
    write_value(&mut io::stdout().lock(), mode, value, human)
}

/// Print `error` to stderr.
pub fn render_error(mode: OutputMode, error: &CliError) -> anyhow::Result<()> {
    write_error(&mut io::stderr().lock(), mode, error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    fn human_error(error: &CliError) -> String {
        let mut buf = Vec::new();
        write_error(&mut buf, OutputMode::Human, error).expect("write");
        String::from_utf8(buf).expect("utf8")
    }

    #[test]
    fn tally_errors_keep_code_hint_and_retry_flag() {
        let cli = CliError::from(&TallyError::UnknownCategory("profile:nope".into()));
        assert_eq!(cli.error_code.as_deref(), Some("E1001"));
        assert!(cli.suggestion.is_some());
        assert!(!cli.transient);

        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(CliError::from(&TallyError::from(busy)).transient);
    }

    #[test]
    fn context_chain_is_kept_in_the_message() {
        let err = Err::<(), _>(TallyError::Configuration("bad table".into()))
            .context("run hourly rollup")
            .expect_err("error");
        let cli = CliError::from_anyhow(&err);
        assert_eq!(cli.error_code.as_deref(), Some("E3001"));
        assert_eq!(cli.message, "run hourly rollup: configuration error: bad table");
    }

    #[test]
    fn plain_errors_have_no_code() {
        let cli = CliError::from_anyhow(&anyhow::anyhow!("plain failure"));
        assert_eq!(human_error(&cli), "error: plain failure\n");
        assert_eq!(
            serde_json::to_value(&cli).expect("serialize"),
            serde_json::json!({"message": "plain failure"})
        );
    }

    #[test]
    fn human_errors_show_code_and_hint() {
        let text = human_error(&CliError::from(&TallyError::MalformedPayload("no id".into())));
        assert!(text.starts_with("error[E1002]: malformed payload: no id\n"), "{text}");
        assert!(text.contains("  hint: "), "{text}");
    }

    #[test]
    fn json_mode_wraps_errors() {
        let mut buf = Vec::new();
        write_error(&mut buf, OutputMode::Json, &CliError::new("boom")).expect("write");
        let value: serde_json::Value = serde_json::from_slice(&buf).expect("json");
        assert_eq!(value["error"]["message"], "boom");
    }

    #[test]
    fn values_render_through_the_human_closure() {
        let mut buf = Vec::new();
        write_value(&mut buf, OutputMode::Human, &3_u32, |n, w| kv(w, "rows", n.to_string()))
            .expect("write");
        assert_eq!(String::from_utf8(buf).expect("utf8"), "rows:            3\n");
    }

    #[test]
    fn epochs_render_as_utc() {
        assert_eq!(format_epoch(0), "1970-01-01 00:00:00Z");
        assert_eq!(format_epoch(90_000), "1970-01-02 01:00:00Z");
    }
}
