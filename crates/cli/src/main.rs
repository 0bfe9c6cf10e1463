//! Reflector CLI: the main entry point.
//!
//! Commands:
//! - `init`    Write a default config file
//! - `ask`     Run one query through the reflection loop
//! - `serve`   Start the HTTP gateway
//! - `status`  Show the effective configuration

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "reflector",
    about = "Reflector: generate, critique, improve",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config file
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },

    /// Answer a single query
    Ask {
        /// The question to answer
        query: String,

        /// Override the iteration cap
        #[arg(short, long)]
        max_iterations: Option<u32>,

        /// Print the full outcome as JSON
        #[arg(long)]
        json: bool,

        /// Stream loop events to stderr as JSON lines
        #[arg(long)]
        events: bool,
    },

    /// Start the HTTP gateway server
    Serve {
        /// Override the bind address
        #[arg(long)]
        host: Option<String>,

        /// Override the port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Show the effective configuration
    Status,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));
    if cli.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .init();
    }

    match cli.command {
        Commands::Init { force } => commands::init::run(force).await?,
        Commands::Ask {
            query,
            max_iterations,
            json,
            events,
        } => commands::ask::run(query, max_iterations, json, events).await?,
        Commands::Serve { host, port } => commands::serve::run(host, port).await?,
        Commands::Status => commands::status::run().await?,
    }

    Ok(())
}
