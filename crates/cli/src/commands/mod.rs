//! CLI subcommands.

pub mod expire;
pub mod migrate;
pub mod sweep;

use cart_engine::{CartEngine, CartError, ConfigError, EngineConfig, StartupError};
use serde::Serialize;
use thiserror::Error;

/// Errors that can occur while running a command.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Startup error: {0}")]
    Startup(#[from] StartupError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Cart error: {0}")]
    Cart(#[from] CartError),

    #[error("Cannot encode report: {0}")]
    Output(#[from] serde_json::Error),
}

/// Load configuration and connect the engine.
async fn connect() -> Result<CartEngine, CommandError> {
    let config = EngineConfig::from_env()?;
    tracing::debug!(?config, "Configuration loaded");
    Ok(CartEngine::connect(&config).await?)
}

/// Print a report as pretty JSON on stdout.
fn print_report<T: Serialize>(report: &T) -> Result<(), CommandError> {
    let json = serde_json::to_string_pretty(report)?;
    #[allow(clippy::print_stdout)]
    {
        println!("{json}");
    }
    Ok(())
}
