mod cmd;
mod collector;
mod config;
mod error;
mod executor;
mod http;
mod metrics;
mod pool;
#[cfg(test)]
mod testing;
mod types;

use std::fmt;
use std::process::ExitCode;
use std::time::Instant;

use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::fmt::time::FormatTime;

struct Elapsed(Instant);

impl FormatTime for Elapsed {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let d = self.0.elapsed();
        let total_secs = d.as_secs();
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        let millis = d.subsec_millis();
        write!(w, "[{mins:02}:{secs:02}:{millis:03}]")
    }
}

#[derive(Parser)]
#[command(name = "code-executor", version)]
struct Cli {
    /// Maximum log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: Level,
    /// Start even when running as root
    #[arg(long, env = "ALLOW_ROOT", global = true)]
    allow_root: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve execution requests and metrics until SIGTERM/SIGINT
    Serve(Box<config::ServeArgs>),
    /// Execute one file in a sandbox and print the response envelope
    Run(Box<cmd::RunArgs>),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_timer(Elapsed(Instant::now()))
        .with_max_level(cli.log_level)
        .init();

    if nix::unistd::geteuid().is_root() && !cli.allow_root {
        eprintln!("error: code-executor must not be run as root (pass --allow-root to override)");
        return ExitCode::FAILURE;
    }

    let result = match cli.command {
        Command::Serve(args) => cmd::run_serve(*args).await.map(|()| ExitCode::SUCCESS),
        Command::Run(args) => cmd::run_once(*args).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
