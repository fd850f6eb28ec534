//! `swerve history`: list sessions or dump one session's log.

use swerve_config::AppConfig;
use swerve_core::message::{ContentBlock, MessageRecord, SessionId};
use swerve_core::store::ConversationStore;

use crate::runtime::Backend;

pub async fn run(session: Option<String>, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    let backend = Backend::open(&config.store).await?;

    let Some(session) = session else {
        let sessions = backend.sessions().await?;
        if sessions.is_empty() {
            println!("No sessions yet. Start one with `swerve chat`.");
        }
        for session in sessions {
            println!("{session}");
        }
        return Ok(());
    };

    let records = backend
        .conversation()
        .read_all(&SessionId(session.clone()))
        .await?;
    if records.is_empty() {
        println!("Session {session} has no records.");
        return Ok(());
    }

    for record in &records {
        if json {
            println!("{}", serde_json::to_string(record)?);
        } else {
            print_record(record);
        }
    }
    Ok(())
}

fn print_record(record: &MessageRecord) {
    println!(
        "── {} {} ({} tokens)",
        record.key.sort_key,
        record.message_type.as_str(),
        record.token_count
    );
    for block in &record.content {
        println!("{}", render_block(block));
    }
    println!();
}

fn render_block(block: &ContentBlock) -> String {
    match block {
        ContentBlock::Text { text } => text.clone(),
        ContentBlock::ToolUse {
            call_id,
            name,
            input,
        } => format!("[tool {name} #{call_id}] {input}"),
        ContentBlock::ToolResult { call_id, content } => {
            let body = content
                .iter()
                .map(render_block)
                .collect::<Vec<_>>()
                .join("\n");
            format!("[result #{call_id}]\n{body}")
        }
        ContentBlock::Image { format, data } => format!("[image/{format}, {} bytes]", data.len()),
        ContentBlock::CachePoint => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_blocks_render_compactly() {
        let block = ContentBlock::ToolResult {
            call_id: "c1".into(),
            content: vec![
                ContentBlock::text("3 passed"),
                ContentBlock::Image {
                    format: "png".into(),
                    data: vec![0; 4],
                },
            ],
        };
        assert_eq!(render_block(&block), "[result #c1]\n3 passed\n[image/png, 4 bytes]");

        let call = ContentBlock::ToolUse {
            call_id: "c1".into(),
            name: "executeCommand".into(),
            input: serde_json::json!({"command": "ls"}),
        };
        assert_eq!(render_block(&call), r#"[tool executeCommand #c1] {"command":"ls"}"#);
    }
}
