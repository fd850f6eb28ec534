//! `swerve chat`: interactive local worker.

use std::io::Write;
use swerve_config::AppConfig;
use swerve_core::cancel::CancellationToken;
use swerve_core::message::SessionId;
use tokio::io::AsyncBufReadExt;

use super::{append_user_message, print_outcome, spawn_printer, with_interrupt};
use crate::runtime::Runtime;

pub async fn run(session: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    let runtime = Runtime::open(&config).await?;
    let session = session.map(SessionId).unwrap_or_default();

    println!();
    println!("  swerve: interactive mode");
    println!();
    println!("  Session:   {session}");
    println!("  Models:    {}", config.model.preferences.join(", "));
    println!("  Workspace: {}", config.tools.working_directory.display());
    println!();
    println!("  Type your message and press Enter.");
    println!("  Ctrl+C cancels the running turn; type 'exit' to quit.");
    println!();

    let printer = spawn_printer(&runtime.events, session.clone());
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("  You > ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if matches!(line, "exit" | "quit") {
            break;
        }

        append_user_message(&runtime, &session, line).await?;
        let cancel = CancellationToken::new();
        match with_interrupt(&cancel, runtime.turn.on_message_received(&session, &cancel)).await {
            Ok(outcome) => print_outcome(&outcome),
            Err(e) => {
                eprintln!("  [Error] {e}");
                println!();
            }
        }
    }

    printer.abort();
    runtime.shutdown().await;
    println!();
    println!("  Session {session} saved. Resume it with `swerve chat --session {session}`.");
    Ok(())
}
