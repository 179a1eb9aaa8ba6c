use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cache;
mod commands;
mod config;
mod errors;
mod google_calendar;
mod rate_limit;
mod server;
mod store;
mod sync;

use cache::CalendarCache;
use commands::{
    agenda::AgendaCommand,
    auth::AuthGoogleCommand,
    serve::ServeCommand,
    sync_ops::{StatusCommand, SyncCommand},
    Command, CommandContext,
};
use config::Config;
use sync::SyncOrchestrator;

#[derive(Parser)]
#[command(name = "calsyncd")]
#[command(about = "Calendar cache daemon - syncs Google Calendar into Redis and serves it over HTTP")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API and background sync (default)
    Serve {
        /// Override the configured port
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run one manual sync pass
    Sync {
        /// Discard sync tokens and re-fetch everything
        #[arg(long)]
        fresh: bool,
    },
    /// Show sync diagnostics
    Status,
    /// Set up Google Calendar integration
    AuthGoogle,
    /// Print upcoming events from a running server
    Agenda {
        /// How many days ahead to show
        #[arg(long, default_value_t = 7)]
        days: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("calsyncd={}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("calsyncd starting up");

    // Load configuration
    let config = Config::load()
        .await
        .context("Failed to load application configuration")?;
    info!("Configuration loaded successfully");

    // Connect the persistent event cache
    let redis_url = config.read().redis.url.clone();
    let cache = CalendarCache::connect(&redis_url)
        .await
        .with_context(|| format!("Failed to connect to Redis at {}", redis_url))?;
    info!("Persistent cache connected");

    let orchestrator = SyncOrchestrator::new(config.clone(), cache.clone());

    let context = CommandContext::new(config, cache, orchestrator);

    let mut command: Box<dyn Command> = match cli.command.unwrap_or(Commands::Serve { port: None }) {
        Commands::Serve { port } => Box::new(ServeCommand { port }),
        Commands::Sync { fresh } => Box::new(SyncCommand { fresh }),
        Commands::Status => Box::new(StatusCommand),
        Commands::AuthGoogle => Box::new(AuthGoogleCommand),
        Commands::Agenda { days } => Box::new(AgendaCommand { days }),
    };

    command
        .execute(&context)
        .await
        .context("Failed to execute command")?;

    Ok(())
}
