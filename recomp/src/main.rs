// ppc2rs command-line interface.
//
// Usage:
//   ppc2rs codegen --config game.json
//   ppc2rs codegen --config game.json --force --enable-exception-handlers
//
// Exit codes: 0 success, 1 validation failure, 2 I/O error.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use ppc2rs::ValidationFailed;

#[derive(Parser, Debug)]
#[command(name = "ppc2rs")]
#[command(about = "Xbox 360 PowerPC to Rust AOT recompiler")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate host source from a guest image.
    Codegen {
        /// Path to the JSON recompiler config.
        #[arg(long)]
        config: PathBuf,

        /// Emit even when analysis reported validation errors.
        #[arg(long)]
        force: bool,

        /// Wrap every function in a structured-exception prologue.
        #[arg(long)]
        enable_exception_handlers: bool,
    },
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.command {
        Command::Codegen {
            config,
            force,
            enable_exception_handlers,
        } => match ppc2rs::codegen(&config, force, enable_exception_handlers) {
            Ok(summary) => {
                log::info!(
                    "done: {} functions, {} files",
                    summary.function_count,
                    summary.file_count
                );
                ExitCode::SUCCESS
            }
            Err(err) => {
                if let Some(validation) = err.downcast_ref::<ValidationFailed>() {
                    for msg in &validation.errors {
                        log::error!("{msg}");
                    }
                    log::error!("{validation}");
                    ExitCode::from(1)
                } else if err.chain().any(|c| c.is::<std::io::Error>()) {
                    log::error!("{err:#}");
                    ExitCode::from(2)
                } else {
                    log::error!("{err:#}");
                    ExitCode::from(1)
                }
            }
        },
    }
}
