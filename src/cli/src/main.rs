//! Atelier CLI - Command-line interface for operating the job & payment
//! engine.
//!
//! Provides commands for account, job, order, health, and configuration
//! management.

mod client;
mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{account, config, health, job, order};
use output::OutputFormat;

/// Atelier - job & payment engine CLI
#[derive(Parser)]
#[command(
    name = "atelier",
    version = "0.1.0",
    about = "Atelier - job & payment engine CLI",
    long_about = "CLI tool for operating Atelier: accounts, generation jobs, payment orders, and system health.",
    propagate_version = true
)]
pub struct Cli {
    /// Output format
    #[arg(short, long, global = true, default_value = "table")]
    output: OutputFormat,

    /// API server URL
    #[arg(long, global = true, env = "ATELIER_API_URL")]
    api_url: Option<String>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Account operations
    #[command(subcommand)]
    Account(account::AccountCommands),

    /// Generation job operations
    #[command(subcommand)]
    Job(job::JobCommands),

    /// Payment order operations
    #[command(subcommand)]
    Order(order::OrderCommands),

    /// Check system health
    Health(health::HealthArgs),

    /// Configuration management
    #[command(subcommand)]
    Config(config::ConfigCommands),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    let api_url = cli
        .api_url
        .clone()
        .or_else(config::load_api_url)
        .unwrap_or_else(|| "http://localhost:8080".to_string());

    let client = client::ApiClient::new(&api_url)?;
    let format = cli.output;

    let result = match cli.command {
        Commands::Account(cmd) => account::execute(cmd, &client, format).await,
        Commands::Job(cmd) => job::execute(cmd, &client, format).await,
        Commands::Order(cmd) => order::execute(cmd, &client, format).await,
        Commands::Health(args) => health::execute(args, &client, format).await,
        Commands::Config(cmd) => config::execute(cmd, format).await,
    };

    if let Err(e) = result {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }

    Ok(())
}
