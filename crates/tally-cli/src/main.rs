#![forbid(unsafe_code)]

mod cmd;
mod output;

use clap::{CommandFactory, Parser, Subcommand};
use output::{CliError, OutputMode, render_error};
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use tally_core::config;
use tally_core::registry::Registry;
use tally_core::scheduler::Granularity;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(
    name = "tally",
    author,
    version,
    about = "tally: metric event intake with hourly and daily rollups",
    long_about = None
)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON output instead of human-readable text.
    #[arg(long, global = true)]
    json: bool,

    /// Database path (overrides TALLY_DB and the config file).
    #[arg(long, global = true, value_name = "PATH")]
    db: Option<PathBuf>,

    /// Config file to use instead of tally.toml / the user config.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    const fn output_mode(&self) -> OutputMode {
        if self.json {
            OutputMode::Json
        } else {
            OutputMode::Human
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        next_help_heading = "Setup",
        about = "Create and migrate the metrics database",
        after_help = "EXAMPLES:\n    # Create tally.sqlite3 in the current directory\n    tally init\n\n    # Also write a tally.toml template\n    tally init --write-config"
    )]
    Init(cmd::init::InitArgs),

    #[command(
        next_help_heading = "Intake",
        about = "Record one event",
        after_help = "EXAMPLES:\n    # Record a gate pass for credential 12\n    tally record profile:gate --actor 12 --subject 3 --action pass"
    )]
    Record(cmd::record::RecordArgs),

    #[command(
        next_help_heading = "Intake",
        about = "Record newline-delimited intake payloads",
        long_about = "Read one JSON payload per line and print one ack per line: ok, invalid, retry, or failed.",
        after_help = "EXAMPLES:\n    # Drain a spool file with 8 workers\n    tally ingest spool.jsonl --workers 8\n\n    # Read from stdin\n    queue-dump | tally ingest --json"
    )]
    Ingest(cmd::ingest::IngestArgs),

    #[command(
        next_help_heading = "Rollup",
        about = "Roll raw events up into hourly buckets",
        after_help = "EXAMPLES:\n    # All categories\n    tally hourly\n\n    # One category at a fixed time\n    tally hourly profile:source --now 1700000000"
    )]
    Hourly(cmd::rollup::RollupArgs),

    #[command(
        next_help_heading = "Rollup",
        about = "Roll hourly buckets up into daily buckets",
        after_help = "EXAMPLES:\n    # All categories\n    tally daily"
    )]
    Daily(cmd::rollup::RollupArgs),

    #[command(next_help_heading = "Read", about = "List registered categories")]
    Categories(cmd::categories::CategoriesArgs),

    #[command(next_help_heading = "Read", about = "Show row and event totals per tier")]
    Stats(cmd::stats::StatsArgs),

    #[command(next_help_heading = "Read", about = "Show recent rollup runs")]
    Runs(cmd::runs::RunsArgs),

    #[command(
        next_help_heading = "Setup",
        about = "Generate shell completion scripts",
        after_help = "EXAMPLES:\n    # Generate bash completions\n    tally completions bash"
    )]
    Completions(cmd::completions::CompletionsArgs),
}

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_env("TALLY_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if verbose || env::var("DEBUG").is_ok() {
            "tally=debug,info"
        } else {
            "tally=info,warn"
        })
    });

    let format = env::var("TALLY_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);

    match format.as_str() {
        "json" => {
            registry
                .with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr))
                .init();
        }
        _ => {
            registry
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .init();
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    if let Commands::Completions(args) = &cli.command {
        let mut command = Cli::command();
        return cmd::completions::run_completions(args, &mut command);
    }

    let cwd = env::current_dir()?;
    let ctx = cmd::Context {
        output: cli.output_mode(),
        config: config::resolve_config(cli.config.as_deref(), &cwd, cli.db.as_deref())?,
        registry: Registry::builtin()?,
    };
    if cli.verbose {
        info!(db = %ctx.config.db_path.display(), "verbose mode enabled");
    }

    match &cli.command {
        Commands::Init(args) => cmd::init::run_init(args, &ctx, &cwd),
        Commands::Record(args) => cmd::record::run_record(args, &ctx),
        Commands::Ingest(args) => cmd::ingest::run_ingest(args, &ctx),
        Commands::Hourly(args) => cmd::rollup::run_rollup(Granularity::Hourly, args, &ctx),
        Commands::Daily(args) => cmd::rollup::run_rollup(Granularity::Daily, args, &ctx),
        Commands::Categories(args) => cmd::categories::run_categories(args, &ctx),
        Commands::Stats(args) => cmd::stats::run_stats(args, &ctx),
        Commands::Runs(args) => cmd::runs::run_runs(args, &ctx),
        Commands::Completions(_) => Ok(()),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let output = cli.output_mode();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if render_error(output, &CliError::from_anyhow(&err)).is_err() {
                eprintln!("error: {err:#}");
            }
            ExitCode::FAILURE
        }
    }
}
