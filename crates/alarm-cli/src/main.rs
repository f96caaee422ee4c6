use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use alarm_access::TokenBucket;
use alarm_core::clock::epoch_secs;
use alarm_core::AlarmConfig;
use alarm_detect::CheckResultStore;
use alarm_kv::CacheNode;
use alarm_strategy::{FileStrategySource, KvStrategySource, StrategyCache, StrategySource};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

use commands::token::TokenFilter;

#[derive(Parser)]
#[command(
    name = "alarmctl",
    about = "Operator tool for the alarm pipeline's shared state",
    version,
    propagate_version = true,
)]
struct Cli {
    /// TOML config file; environment variables override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect per-query token counters
    Token {
        #[command(subcommand)]
        action: TokenAction,
    },
    /// Inspect or edit the strategy → KV node route table
    CacheRouter {
        #[command(subcommand)]
        action: CacheRouterAction,
    },
    /// Maintain stored check results
    CheckResults {
        #[command(subcommand)]
        action: CheckResultsAction,
    },
}

#[derive(Subcommand)]
enum TokenAction {
    /// List exhausted counters
    List {
        /// Only counters used by strategies of this business
        #[arg(long)]
        biz: Option<i64>,
        /// Include counters that still have tokens left
        #[arg(long)]
        all: bool,
    },
}

#[derive(Subcommand)]
enum CacheRouterAction {
    /// Print the route intervals
    List,
    /// Route the strategy ids in [floor, ceil) to a node
    Add {
        #[arg(long)]
        node: String,
        #[arg(long)]
        floor: u64,
        #[arg(long)]
        ceil: u64,
        /// Register the node at this address (redis://host:port)
        #[arg(long)]
        addr: Option<String>,
        #[arg(long, requires = "addr")]
        password: Option<String>,
        #[arg(long, requires = "addr", default_value = "0")]
        db: i64,
    },
    /// Remove a node and hand its intervals to the next one
    RemoveNode {
        #[arg(long)]
        node: String,
    },
}

#[derive(Subcommand)]
enum CheckResultsAction {
    /// Apply the size and age bounds to every check-result key
    Trim {
        /// Only keys of this strategy
        #[arg(long)]
        strategy: Option<u64>,
    },
}

fn strategy_source(config: &AlarmConfig, kv: alarm_kv::SharedKv) -> Arc<dyn StrategySource> {
    match &config.strategy_file {
        Some(path) => Arc::new(FileStrategySource::new(path.clone())),
        None => Arc::new(KvStrategySource::new(kv)),
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = AlarmConfig::load(cli.config.as_deref())?;
    let backend = commands::open(&config).await?;
    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    match cli.command {
        Commands::Token {
            action: TokenAction::List { biz, all },
        } => {
            let strategies = StrategyCache::new(strategy_source(&config, backend.kv.clone()));
            strategies.refresh().await?;
            let bucket = TokenBucket::new(backend.kv.clone(), &config.token);
            let filter = TokenFilter { bk_biz_id: biz, all };
            commands::token::list(&bucket, &strategies.snapshot(), filter, &mut out).await?;
        }
        Commands::CacheRouter { action } => match action {
            CacheRouterAction::List => {
                commands::cache_router::list(backend.kv.as_ref(), &mut out).await?;
            }
            CacheRouterAction::Add {
                node,
                floor,
                ceil,
                addr,
                password,
                db,
            } => {
                let register = addr.map(|addr| CacheNode { addr, password, db });
                commands::cache_router::add(backend.kv.as_ref(), &node, floor, ceil, register, &mut out)
                    .await?;
            }
            CacheRouterAction::RemoveNode { node } => {
                commands::cache_router::remove_node(backend.kv.as_ref(), &node, &mut out).await?;
            }
        },
        Commands::CheckResults {
            action: CheckResultsAction::Trim { strategy },
        } => {
            let store = CheckResultStore::new(backend.route.clone(), &config.check_result);
            commands::check_results::trim(&store, strategy, epoch_secs() as i64, &mut out).await?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn,alarm=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::from(commands::EXIT_OK),
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(commands::exit_code(&e))
        }
    }
}
