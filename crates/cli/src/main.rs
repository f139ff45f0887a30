//! Cart CLI - migrations and background maintenance for the cart engine.
//!
//! # Usage
//!
//! ```bash
//! # Apply cart and catalog schema migrations
//! cart-cli migrate
//!
//! # Reconcile every active cart with the catalog once
//! cart-cli sweep
//!
//! # Keep reconciling on a schedule until interrupted
//! cart-cli sweeper --interval-secs 300
//!
//! # Expire idle guest carts
//! cart-cli expire
//! ```
//!
//! # Commands
//!
//! - `migrate` - Run database migrations
//! - `sweep` - One reconciliation pass over all active carts
//! - `sweeper` - Scheduled reconciliation
//! - `expire` - Guest cart expiry

#![cfg_attr(not(test), forbid(unsafe_code))]

use clap::{Parser, Subcommand};

mod commands;
mod logging;

#[derive(Parser)]
#[command(name = "cart-cli")]
#[command(author, version, about = "Cart engine CLI tools")]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "CART_LOG_JSON")]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run database migrations
    Migrate,
    /// Reconcile all active carts with the catalog once
    Sweep,
    /// Reconcile all active carts periodically until Ctrl-C
    Sweeper {
        /// Seconds between sweeps (defaults to `CART_SYNC_INTERVAL_SECS`)
        #[arg(long)]
        interval_secs: Option<u64>,
    },
    /// Expire guest carts idle past `CART_GUEST_EXPIRY_DAYS`
    Expire,
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let _sentry_guard = logging::init(cli.json_logs);

    let result: Result<(), commands::CommandError> = run(cli).await;

    if let Err(e) = result {
        tracing::error!("Command failed: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), commands::CommandError> {
    match cli.command {
        Commands::Migrate => commands::migrate::run().await?,
        Commands::Sweep => commands::sweep::once().await?,
        Commands::Sweeper { interval_secs } => {
            commands::sweep::scheduled(interval_secs.map(std::time::Duration::from_secs)).await?;
        }
        Commands::Expire => commands::expire::run().await?,
    }
    Ok(())
}
