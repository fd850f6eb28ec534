pub mod chat;
pub mod cost;
pub mod history;
pub mod resume;
pub mod send;

use std::sync::Arc;
use swerve_agent::TurnOutcome;
use swerve_core::cancel::CancellationToken;
use swerve_core::event::{EventBus, TurnEvent};
use swerve_core::message::{NewMessage, SessionId};
use swerve_core::Result;
use swerve_core::store::ConversationStore;
use tokio::task::JoinHandle;

use crate::runtime::Runtime;

/// Wrap text typed by the user the way the agent expects user input.
pub fn wrap_user_message(message: &str) -> String {
    format!(
        "<user_message>\n{message}\n</user_message>\n<command>\n\
         User sent you a message. Please use sendMessageToUser tool to send a response asap.\n\
         </command>"
    )
}

/// Append a user message to the session log.
pub async fn append_user_message(runtime: &Runtime, session: &SessionId, message: &str) -> Result<()> {
    runtime
        .backend
        .conversation()
        .append(session, NewMessage::user_text(wrap_user_message(message)))
        .await?;
    Ok(())
}

/// Run `turn` to completion; the first Ctrl-C cancels it.
pub async fn with_interrupt<F>(cancel: &CancellationToken, turn: F) -> F::Output
where
    F: std::future::Future,
{
    tokio::pin!(turn);
    loop {
        tokio::select! {
            outcome = &mut turn => return outcome,
            _ = tokio::signal::ctrl_c(), if !cancel.is_cancelled() => {
                cancel.cancel_with(|| async {
                    eprintln!("  [Cancelled]");
                });
            }
        }
    }
}

/// Print progress reports and tool activity while turns run.
pub fn spawn_printer(events: &Arc<EventBus>, session: SessionId) -> JoinHandle<()> {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            };
            if event.session_id() != &session {
                continue;
            }
            match event.as_ref() {
                TurnEvent::ProgressReported { message, .. } => {
                    for line in message.lines() {
                        println!("  Agent > {line}");
                    }
                }
                TurnEvent::ToolRequested { tool_name, .. } => {
                    eprintln!("  ⚙ {tool_name}");
                }
                _ => {}
            }
        }
    })
}

/// Print what a turn produced.
pub fn print_outcome(outcome: &TurnOutcome) {
    match outcome {
        TurnOutcome::Completed { text } => {
            println!();
            for line in text.lines() {
                println!("  Assistant > {line}");
            }
            println!();
        }
        TurnOutcome::Empty => println!("  (no reply)"),
        TurnOutcome::Cancelled => {}
    }
}
