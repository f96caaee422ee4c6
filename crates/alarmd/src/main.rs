//! alarmd — the alarm daemon binary.
//!
//! # Usage
//!
//! ```text
//! alarmd run --config /etc/alarmd.toml
//! KV_ADDR=redis://127.0.0.1:6379 WORKER_COUNT=8 alarmd run
//! ```

use std::path::PathBuf;

use alarm_core::AlarmConfig;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "alarmd", about = "Alarm pipeline daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run access, detect and assign in this process.
    Run {
        /// TOML config file; environment variables override it.
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,alarmd=debug,alarm=debug"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Run { config } => {
            let config = AlarmConfig::load(config.as_deref())?;
            alarmd::run(config).await
        }
    }
}
