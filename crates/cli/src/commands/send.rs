//! `swerve send`: one message, one turn.

use swerve_config::AppConfig;
use swerve_core::cancel::CancellationToken;
use swerve_core::message::SessionId;

use super::{append_user_message, print_outcome, spawn_printer, with_interrupt};
use crate::runtime::Runtime;

pub async fn run(message: String, session: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    let runtime = Runtime::open(&config).await?;
    let session = session.map(SessionId).unwrap_or_default();
    eprintln!("  Session: {session}");

    let printer = spawn_printer(&runtime.events, session.clone());
    append_user_message(&runtime, &session, &message).await?;

    let cancel = CancellationToken::new();
    let outcome = with_interrupt(&cancel, runtime.turn.on_message_received(&session, &cancel)).await;

    printer.abort();
    runtime.shutdown().await;
    print_outcome(&outcome?);
    Ok(())
}
