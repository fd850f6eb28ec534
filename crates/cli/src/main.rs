//! swerve CLI: the main entry point.
//!
//! Commands:
//! - `chat`      Interactive local worker for one session
//! - `send`      Append one message and run a single turn
//! - `resume`    Finish a turn that was interrupted
//! - `history`   List sessions or dump one session's log
//! - `cost`      Show a session's usage and cost

use clap::{Parser, Subcommand};

mod commands;
mod runtime;

#[derive(Parser)]
#[command(
    name = "swerve",
    about = "swerve: an autonomous coding agent worker",
    version
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
    /// Chat with the agent interactively
    Chat {
        /// Continue an existing session instead of starting a new one
        #[arg(short, long)]
        session: Option<String>,
    },

    /// Send a single message and wait for the turn to finish
    Send {
        message: String,

        #[arg(short, long)]
        session: Option<String>,
    },

    /// Resume a session whose last turn was interrupted
    Resume { session: String },

    /// List sessions, or print the log of one session
    History {
        session: Option<String>,

        /// Print records as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Show token usage and cost of a session
    Cost { session: String },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize tracing
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    if cli.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }

    match cli.command {
        Commands::Chat { session } => commands::chat::run(session).await?,
        Commands::Send { message, session } => commands::send::run(message, session).await?,
        Commands::Resume { session } => commands::resume::run(session).await?,
        Commands::History { session, json } => commands::history::run(session, json).await?,
        Commands::Cost { session } => commands::cost::run(session).await?,
    }

    Ok(())
}
