//! Session cost accounting.
//!
//! Usage is appended to the ledger after every model call; the session cost
//! is then re-derived from every persisted usage record, never from an
//! in-memory running sum, so a restarted worker reports the same total.

use std::sync::Arc;
use swerve_core::error::StoreError;
use swerve_core::message::SessionId;
use swerve_core::provider::TokenUsage;
use swerve_core::store::{UsageLedger, UsageRecord};
use tracing::{debug, info};

use crate::pricing::PricingTable;

/// Records usage and keeps the persisted session cost current.
pub struct CostAccountant {
    ledger: Arc<dyn UsageLedger>,
    pricing: Arc<PricingTable>,
}

impl CostAccountant {
    pub fn new(ledger: Arc<dyn UsageLedger>) -> Self {
        Self {
            ledger,
            pricing: Arc::new(PricingTable::with_defaults()),
        }
    }

    pub fn with_pricing(mut self, pricing: Arc<PricingTable>) -> Self {
        self.pricing = pricing;
        self
    }

    pub fn pricing(&self) -> &PricingTable {
        &self.pricing
    }

    /// Add one call's usage to the ledger.
    pub async fn record(
        &self,
        session_id: &SessionId,
        model: &str,
        usage: &TokenUsage,
    ) -> Result<(), StoreError> {
        debug!(
            session_id = %session_id,
            model = %model,
            input = usage.input_tokens,
            output = usage.output_tokens,
            cache_read = usage.cache_read_tokens,
            cache_write = usage.cache_write_tokens,
            "Recording token usage"
        );
        self.ledger.record_usage(session_id, model, usage).await
    }

    /// Sum the cost of the given usage records.
    pub fn total_cost(&self, records: &[UsageRecord]) -> f64 {
        records
            .iter()
            .map(|r| {
                self.pricing.cost(
                    &r.model,
                    r.usage.input_tokens,
                    r.usage.output_tokens,
                    r.usage.cache_read_tokens,
                    r.usage.cache_write_tokens,
                )
            })
            .sum()
    }

    /// Recompute the session cost from the ledger and persist it.
    pub async fn update_session_cost(&self, session_id: &SessionId) -> Result<f64, StoreError> {
        let records = self.ledger.usage_records(session_id).await?;
        let cost = self.total_cost(&records);
        self.ledger.set_session_cost(session_id, cost).await?;
        info!(session_id = %session_id, cost_usd = cost, "Session cost updated");
        Ok(cost)
    }

    /// Per-model breakdown lines plus the total, for reports.
    pub async fn report(&self, session_id: &SessionId) -> Result<CostReport, StoreError> {
        let records = self.ledger.usage_records(session_id).await?;
        let lines = records
            .iter()
            .map(|r| CostLine {
                model: r.model.clone(),
                usage: r.usage,
                cost: self.total_cost(std::slice::from_ref(r)),
            })
            .collect::<Vec<_>>();
        let total = lines.iter().map(|l| l.cost).sum();
        Ok(CostReport { lines, total })
    }
}

/// Cost of one model within a session.
#[derive(Debug, Clone)]
pub struct CostLine {
    pub model: String,
    pub usage: TokenUsage,
    pub cost: f64,
}

#[derive(Debug, Clone)]
pub struct CostReport {
    pub lines: Vec<CostLine>,
    pub total: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct LedgerStub {
        records: Mutex<Vec<UsageRecord>>,
        cost: Mutex<f64>,
    }

    #[async_trait]
    impl UsageLedger for LedgerStub {
        async fn record_usage(
            &self,
            _session_id: &SessionId,
            model: &str,
            usage: &TokenUsage,
        ) -> Result<(), StoreError> {
            let mut records = self.records.lock().unwrap();
            match records.iter_mut().find(|r| r.model == model) {
                Some(r) => r.usage.add(usage),
                None => records.push(UsageRecord {
                    model: model.into(),
                    usage: *usage,
                }),
            }
            Ok(())
        }

        async fn usage_records(&self, _session_id: &SessionId) -> Result<Vec<UsageRecord>, StoreError> {
            Ok(self.records.lock().unwrap().clone())
        }

        async fn set_session_cost(&self, _session_id: &SessionId, cost: f64) -> Result<(), StoreError> {
            *self.cost.lock().unwrap() = cost;
            Ok(())
        }

        async fn session_cost(&self, _session_id: &SessionId) -> Result<f64, StoreError> {
            Ok(*self.cost.lock().unwrap())
        }
    }

    fn usage(input: u64, output: u64) -> TokenUsage {
        TokenUsage {
            input_tokens: input,
            output_tokens: output,
            ..TokenUsage::default()
        }
    }

    #[tokio::test]
    async fn cost_is_rederived_from_ledger() {
        let ledger = Arc::new(LedgerStub::default());
        let accountant = CostAccountant::new(ledger.clone());
        let session = SessionId::from("s1");

        accountant.record(&session, "claude-sonnet-4", &usage(1000, 500)).await.unwrap();
        let first = accountant.update_session_cost(&session).await.unwrap();
        assert!((first - 0.0105).abs() < 1e-12);

        accountant.record(&session, "claude-sonnet-4", &usage(1000, 500)).await.unwrap();
        let second = accountant.update_session_cost(&session).await.unwrap();
        assert!((second - 0.021).abs() < 1e-12);
        assert_eq!(ledger.session_cost(&session).await.unwrap(), second);
    }

    #[tokio::test]
    async fn fresh_accountant_sees_prior_usage() {
        let ledger = Arc::new(LedgerStub::default());
        let session = SessionId::from("s1");
        CostAccountant::new(ledger.clone())
            .record(&session, "claude-opus-4", &usage(1000, 0))
            .await
            .unwrap();

        // A new accountant, as after a process restart
        let cost = CostAccountant::new(ledger)
            .update_session_cost(&session)
            .await
            .unwrap();
        assert!((cost - 0.015).abs() < 1e-12);
    }

    #[tokio::test]
    async fn report_breaks_down_by_model() {
        let ledger = Arc::new(LedgerStub::default());
        let accountant = CostAccountant::new(ledger);
        let session = SessionId::from("s1");
        accountant.record(&session, "claude-sonnet-4", &usage(1000, 0)).await.unwrap();
        accountant.record(&session, "mystery-model", &usage(1000, 0)).await.unwrap();

        let report = accountant.report(&session).await.unwrap();
        assert_eq!(report.lines.len(), 2);
        assert_eq!(report.lines[1].cost, 0.0);
        assert!((report.total - 0.003).abs() < 1e-12);
    }
}
