use aggregate_commands::logger::{logs_tracing, LineLogger};
use aggregate_commands::parse::parser;
use aggregate_commands::{run_commands, RunOptions};
use clap::Parser;
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use tracing::error;

#[derive(Debug, Parser)]
#[command(
    name = "aggregate-commands",
    version,
    about = "Run several commands at once, tag their output, and stop them together"
)]
struct Cli {
    /// Key under "aggregate-commands" in ./package.json, or a JSON/YAML config file.
    config: String,
    /// Seconds to wait after SIGTERM before sending SIGKILL during shutdown.
    #[arg(long, default_value_t = 10)]
    kill_timeout: u64,
    /// Write diagnostics to a daily-rotated file in this directory instead of stderr.
    #[arg(long)]
    log_dir: Option<PathBuf>,
    /// Log supervisor diagnostics at INFO instead of WARN.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let guard = match logs_tracing(cli.log_dir.as_deref(), cli.verbose) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("failed to set up logging: {:#}", e);
            process::exit(1);
        }
    };

    let commands = match parser(&cli.config) {
        Ok(commands) => commands,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(e.exit_code());
        }
    };

    let options = RunOptions {
        kill_timeout: Duration::from_secs(cli.kill_timeout),
        forward_signals: true,
        ..RunOptions::default()
    };

    let code = match run_commands(&commands, LineLogger::stdio(), &options).await {
        Ok(disposition) => disposition.code(),
        Err(e) => {
            error!(error = %e, "aborting");
            eprintln!("{:#}", e);
            1
        }
    };

    // process::exit skips destructors; flush the file appender first.
    drop(guard);
    process::exit(code);
}
