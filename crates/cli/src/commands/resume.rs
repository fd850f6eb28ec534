//! `swerve resume`: finish an interrupted turn.

use swerve_config::AppConfig;
use swerve_core::cancel::CancellationToken;
use swerve_core::message::SessionId;

use super::{print_outcome, spawn_printer, with_interrupt};
use crate::runtime::Runtime;

pub async fn run(session: String) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    let runtime = Runtime::open(&config).await?;
    let session = SessionId(session);

    let printer = spawn_printer(&runtime.events, session.clone());
    let cancel = CancellationToken::new();
    let outcome = with_interrupt(&cancel, runtime.turn.resume(&session, &cancel)).await;

    printer.abort();
    runtime.shutdown().await;
    match outcome? {
        Some(outcome) => print_outcome(&outcome),
        None => println!("  Session {session} has no interrupted turn."),
    }
    Ok(())
}
