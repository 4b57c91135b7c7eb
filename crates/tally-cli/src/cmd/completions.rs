use anyhow::{Context, Result};
use clap::Args;
use clap_complete::{Shell, generate};
use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct CompletionsArgs {
    #[arg(value_enum)]
    pub shell: Shell,

    /// Write the script here instead of stdout.
    #[arg(long, short = 'o', value_name = "PATH")]
    pub output: Option<PathBuf>,
}

/// Print the completion script for `command`, named after its binary.
///
/// # Errors
///
/// Returns an error if the output file cannot be created or written.
pub fn run_completions(args: &CompletionsArgs, command: &mut clap::Command) -> Result<()> {
    let bin = command.get_name().to_string();
    match &args.output {
        Some(path) => {
            let mut file = File::create(path)
                .with_context(|| format!("create completion script {}", path.display()))?;
            generate(args.shell, command, bin, &mut file);
            file.flush()?;
        }
        None => generate(args.shell, command, bin, &mut io::stdout()),
    }
    Ok(())
}
