//! `swerve cost`: usage and cost of one session.

use std::sync::Arc;
use swerve_config::AppConfig;
use swerve_core::message::SessionId;
use swerve_core::store::UsageLedger;
use swerve_telemetry::CostAccountant;

use crate::runtime::{Backend, pricing};

pub async fn run(session: String) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    let backend = Backend::open(&config.store).await?;
    let session = SessionId(session);

    let accountant = CostAccountant::new(backend.ledger()).with_pricing(Arc::new(pricing(&config)));
    let report = accountant.report(&session).await?;
    let persisted = backend.ledger().session_cost(&session).await?;

    if report.lines.is_empty() {
        println!("No usage recorded for session {session}.");
        return Ok(());
    }

    println!("Usage for session {session}");
    println!("─────────────────────────────────────────────────────────────────────────────");
    println!(
        "{:<32} {:>10} {:>10} {:>11} {:>11} {:>10}",
        "Model", "Input", "Output", "Cache read", "Cache write", "Cost"
    );
    for line in &report.lines {
        println!(
            "{:<32} {:>10} {:>10} {:>11} {:>11} ${:>9.4}",
            line.model,
            line.usage.input_tokens,
            line.usage.output_tokens,
            line.usage.cache_read_tokens,
            line.usage.cache_write_tokens,
            line.cost
        );
    }
    println!();
    println!("  Total:            ${:.4}", report.total);
    if (persisted - report.total).abs() > 1e-9 {
        println!("  Last recorded:    ${persisted:.4} (pricing changed since)");
    }
    Ok(())
}
