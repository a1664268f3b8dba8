// ABOUTME: CLI entry point for replica-router
// ABOUTME: Parses commands, loads endpoint config and dispatches to command handlers

use anyhow::Context;
use clap::{Parser, Subcommand};
use replica_router::commands;
use replica_router::{RouterConfig, SalesStore};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "replica-router")]
#[command(about = "Sales transactions over a primary and a CDC-fed read replica", long_about = None)]
#[command(version)]
struct Cli {
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    /// Path to a TOML config file (PRIMARY_DB_* / REPLICA_DB_* env vars override it)
    #[arg(long, global = true, env = "REPLICA_ROUTER_CONFIG")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the sales tables on the primary
    Schema {
        /// Print the replica-side DDL for the sink instead of applying anything
        #[arg(long)]
        replica_ddl: bool,
    },
    /// Ping both endpoints and show pool counters
    Status,
    /// Record a transaction with its items (primary)
    Create(commands::CreateArgs),
    /// List transactions, newest first (replica)
    List(commands::ListArgs),
    /// Show a transaction and its items (replica)
    Show { transaction_id: i64 },
    /// Change header fields of a transaction (primary)
    Update(commands::UpdateArgs),
    /// Delete a transaction and its items (primary)
    Delete { transaction_id: i64 },
    /// Sales stats, top products and daily trend (replica)
    Analytics {
        /// Look back this many days; 0 for all time
        #[arg(long, default_value_t = 30)]
        days: u32,
    },
    /// Poll the replica until a write shows up (or a delete disappears)
    WaitVisible(commands::WaitArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // We need to parse CLI args early to get the log level
    let cli = Cli::parse();

    // Initialize logging
    // 1. RUST_LOG environment variable has highest precedence
    // 2. --log flag is used if RUST_LOG is not set
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let config = RouterConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    let store = SalesStore::open(config).context("Failed to open sales store")?;

    let result = match cli.command {
        Commands::Schema { replica_ddl } => commands::schema(&store, replica_ddl).await,
        Commands::Status => commands::status(&store).await,
        Commands::Create(args) => commands::create(&store, args).await,
        Commands::List(args) => commands::list(&store, args).await,
        Commands::Show { transaction_id } => commands::show(&store, transaction_id).await,
        Commands::Update(args) => commands::update(&store, args).await,
        Commands::Delete { transaction_id } => commands::delete(&store, transaction_id).await,
        Commands::Analytics { days } => commands::analytics(&store, days).await,
        Commands::WaitVisible(args) => commands::wait_visible(&store, args).await,
    };

    store.close();
    result
}
