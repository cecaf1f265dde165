use std::fs;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use ember::{CheckResult, check_module, emit_diagnostics, emit_mir, load_module};
use ember_codegen::{BackendConfig, TailGuardPolicy};
use ember_infer::TypingOptions;
use tracing_subscriber::EnvFilter;

/// Effect typing and lowering for HIR modules stored as JSON.
#[derive(Debug, Parser)]
#[command(name = "ember", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Type a module and report diagnostics.
    Check {
        input: PathBuf,
        /// Print the handler typing trace as JSON.
        #[arg(long)]
        trace: bool,
    },
    /// Type a module and print the lowered MIR.
    Lower {
        input: PathBuf,
        #[arg(long, default_value = "wasm32")]
        target: String,
        /// Check the continuation count of every `tail` clause at runtime.
        #[arg(long)]
        always_guard: bool,
        #[arg(long)]
        no_export_wrappers: bool,
        /// Print per-function pass stats as JSON.
        #[arg(long)]
        stats: bool,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() {
    init_logging();
    if let Err(message) = run() {
        eprintln!("{message}");
        std::process::exit(1);
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("EMBER_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run() -> Result<(), String> {
    let cli = Cli::parse();

    match cli.command {
        Command::Check { input, trace } => {
            let checked = check_module(load_module(&input)?, &TypingOptions { trace });
            emit_diagnostics(&checked.diagnostics);
            if trace {
                let json = serde_json::to_string_pretty(checked.traces())
                    .map_err(|err| format!("failed to render trace: {err}"))?;
                println!("{json}");
            }
            finish_check(&checked)
        }
        Command::Lower {
            input,
            target,
            always_guard,
            no_export_wrappers,
            stats,
            output,
        } => {
            let config = BackendConfig {
                target,
                tail_guards: if always_guard {
                    TailGuardPolicy::AlwaysRuntime
                } else {
                    TailGuardPolicy::AsAnalyzed
                },
                export_wrappers: !no_export_wrappers,
            };
            let checked = check_module(load_module(&input)?, &TypingOptions::default());
            let result = emit_mir(&checked, &config)?;
            emit_diagnostics(&result.diagnostics);

            let rendered = result.mir.to_string();
            match output {
                Some(path) => {
                    fs::write(&path, &rendered)
                        .map_err(|err| format!("failed to write `{}`: {err}", path.display()))?;
                    println!("wrote `{}`", path.display());
                }
                None => print!("{rendered}"),
            }
            if stats {
                let json = serde_json::to_string_pretty(&result.stats)
                    .map_err(|err| format!("failed to render stats: {err}"))?;
                println!("{json}");
            }
            if !result.failed.is_empty() {
                return Err(format!(
                    "not lowered because of typing errors: {}",
                    result.failed.join(", ")
                ));
            }
            Ok(())
        }
    }
}

fn finish_check(checked: &CheckResult) -> Result<(), String> {
    let errors = checked.diagnostics.iter().filter(|d| d.is_error()).count();
    if errors > 0 {
        return Err(format!("typing failed with {errors} errors"));
    }
    println!("checked {} functions", checked.hir.functions.len());
    Ok(())
}
