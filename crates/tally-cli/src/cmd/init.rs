use anyhow::{Context as _, Result};
use clap::Args;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tally_core::config::LOCAL_CONFIG_FILE;
use tally_core::db::migrations;

use super::Context;
use crate::output::{kv, render};

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Also write a `tally.toml` template into the working directory.
    #[arg(long)]
    pub write_config: bool,

    /// Overwrite an existing `tally.toml`.
    #[arg(long, requires = "write_config")]
    pub force: bool,
}

#[derive(Debug, Serialize)]
struct InitReport {
    db_path: PathBuf,
    schema_version: u32,
    categories: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    config_written: Option<PathBuf>,
}

fn config_template(db_path: &Path) -> String {
    format!(
        "[database]\n\
         path = \"{}\"\n\
         busy_timeout_ms = 5000\n\
         \n\
         [intake]\n\
         workers = 4\n",
        db_path.display()
    )
}

/// Execute `tally init`: create the database, apply migrations, and create
/// every category's tier tables.
///
/// # Errors
///
/// Returns an error if the database cannot be prepared, or if `tally.toml`
/// exists and `--force` was not given.
pub fn run_init(args: &InitArgs, ctx: &Context, cwd: &Path) -> Result<()> {
    let config_written = if args.write_config {
        let path = cwd.join(LOCAL_CONFIG_FILE);
        if path.exists() && !args.force {
            anyhow::bail!(
                "{} already exists. Use `tally init --write-config --force` to overwrite.",
                path.display()
            );
        }
        std::fs::write(&path, config_template(&ctx.config.db_path))
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Some(path)
    } else {
        None
    };

    let conn = ctx.open_db()?;
    let report = InitReport {
        db_path: ctx.config.db_path.clone(),
        schema_version: migrations::current_schema_version(&conn)?,
        categories: ctx
            .registry
            .iter()
            .map(|descriptor| descriptor.category.to_string())
            .collect(),
        config_written,
    };
    tracing::info!(db = %report.db_path.display(), "database initialized");

    render(ctx.output, &report, |report, w| {
        kv(w, "database", report.db_path.display().to_string())?;
        kv(w, "schema", format!("v{}", report.schema_version))?;
        kv(w, "categories", report.categories.join(", "))?;
        if let Some(path) = &report.config_written {
            kv(w, "config", path.display().to_string())?;
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_round_trips_through_config_parser() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join(LOCAL_CONFIG_FILE);
        std::fs::write(&path, config_template(Path::new("/srv/tally/metrics.db")))
            .expect("write template");

        let config = tally_core::config::load_config_file(&path).expect("valid config");
        assert_eq!(config.database.path, PathBuf::from("/srv/tally/metrics.db"));
        assert_eq!(config.intake.workers, 4);
    }
}
