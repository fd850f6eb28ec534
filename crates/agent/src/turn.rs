//! The turn loop: the heart of swerve.
//!
//! A turn follows an **Invoke → Dispatch → Invoke** cycle:
//!
//! 1. **Read** the session log (waiting briefly for a lagging replica)
//! 2. **Compact** it and place the prompt-cache markers
//! 3. **Invoke** the model, retrying on throttling and truncated output
//! 4. **If tool use**: run the tools, append the toolUse/toolResult pair
//!    atomically, loop back to step 2
//! 5. **Otherwise**: append the final answer and notify listeners
//!
//! Cancellation is checked before every invocation and cuts backoff waits
//! short; a cancelled turn makes no further model call and writes nothing
//! more.

use chrono::Utc;
use regex_lite::Regex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, LazyLock};
use swerve_core::cancel::CancellationToken;
use swerve_core::error::{Error, Result};
use swerve_core::event::{AgentStatus, EventBus, TurnEvent};
use swerve_core::message::{
    ContentBlock, MessageRecord, MessageType, ModelMessage, NewMessage, Role, SessionId,
};
use swerve_core::provider::{ConverseRequest, ConverseResponse, ModelClient, StopReason, SystemPrompt};
use swerve_core::store::ConversationStore;
use swerve_telemetry::CostAccountant;
use tracing::{debug, info, warn};

use crate::cache::CacheBoundaries;
use crate::compaction::Compactor;
use crate::dispatcher::{ProgressClock, ToolCall, ToolDispatcher};
use crate::prompt::PromptBuilder;
use crate::retry::{Attempt, RetryPolicy, RetryReason};

static THINKING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<thinking>.*?</thinking>").expect("thinking pattern is valid")
});

/// Remove private `<thinking>` sections from user-visible text.
pub fn strip_thinking(text: &str) -> String {
    THINKING.replace_all(text, "").into_owned()
}

/// How a turn ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The model answered; `text` is what the user sees
    Completed { text: String },
    /// The model ended the turn with no content; nothing was persisted
    Empty,
    /// The cancellation token was set
    Cancelled,
}

/// Drives turns for any number of sessions. Holds no per-turn state.
pub struct TurnLoop {
    store: Arc<dyn ConversationStore>,
    model: Arc<dyn ModelClient>,
    models: Vec<String>,
    dispatcher: ToolDispatcher,
    prompt: PromptBuilder,
    accountant: CostAccountant,
    events: Arc<EventBus>,
    compactor: Compactor,
    retry: RetryPolicy,
    lag_retry: RetryPolicy,
}

impl TurnLoop {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        model: Arc<dyn ModelClient>,
        dispatcher: ToolDispatcher,
        prompt: PromptBuilder,
        accountant: CostAccountant,
        events: Arc<EventBus>,
    ) -> Self {
        let retry = swerve_config::RetryConfig::default();
        Self {
            store,
            model,
            models: swerve_config::ModelConfig::default().preferences,
            dispatcher,
            prompt,
            accountant,
            events,
            compactor: Compactor::from_config(&swerve_config::CompactionConfig::default()),
            retry: RetryPolicy::from_config(&retry),
            lag_retry: RetryPolicy::lagging_read(&retry),
        }
    }

    /// Model ids to try, in order of preference.
    pub fn with_models(mut self, models: Vec<String>) -> Self {
        self.models = models;
        self
    }

    pub fn with_compactor(mut self, compactor: Compactor) -> Self {
        self.compactor = compactor;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_lag_retry(mut self, lag_retry: RetryPolicy) -> Self {
        self.lag_retry = lag_retry;
        self
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    // ── Triggers ──

    /// Start a turn for a newly received message.
    ///
    /// Publishes `working` first. Afterwards, a cancelled turn runs the
    /// token's completion callback; any other turn publishes `pending`.
    pub async fn on_message_received(
        &self,
        session_id: &SessionId,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome> {
        self.set_status(session_id, AgentStatus::Working);

        let outcome = self.run(session_id, cancel).await;

        if cancel.is_cancelled() {
            cancel.complete().await;
        } else {
            self.set_status(session_id, AgentStatus::Pending);
        }
        outcome
    }

    /// Restart an interrupted turn. Does nothing unless the log ends with
    /// a user message or a tool result.
    pub async fn resume(
        &self,
        session_id: &SessionId,
        cancel: &CancellationToken,
    ) -> Result<Option<TurnOutcome>> {
        let records = self.store.read_all(session_id).await?;
        let interrupted = matches!(
            records.last().map(|r| r.message_type),
            Some(MessageType::UserMessage | MessageType::ToolResult)
        );
        if !interrupted {
            debug!(session_id = %session_id, "Nothing to resume");
            return Ok(None);
        }
        info!(session_id = %session_id, "Resuming interrupted turn");
        self.on_message_received(session_id, cancel).await.map(Some)
    }

    // ── The loop ──

    /// Run one turn to completion, cancellation, or failure.
    pub async fn run(
        &self,
        session_id: &SessionId,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome> {
        if cancel.is_cancelled() {
            return Ok(TurnOutcome::Cancelled);
        }

        let records = self.read_settled(session_id).await?;
        info!(
            session_id = %session_id,
            records = records.len(),
            model_client = %self.model.name(),
            "Starting turn"
        );

        let mut system = self.prompt.build(session_id).await;
        let tool_config = self.dispatcher.toolset().tool_config();

        let initial = self.compactor.middle_out(&records);
        let mut window: Vec<MessageRecord> =
            initial.kept.iter().map(|&i| records[i].clone()).collect();
        let mut cache = CacheBoundaries::initial(window.len());

        // Shared by every invocation of this turn, never reset
        let expansion = AtomicU32::new(0);
        let progress = ProgressClock::new();
        let mut iteration = 0u32;

        loop {
            if cancel.is_cancelled() {
                info!(session_id = %session_id, "Turn cancelled");
                return Ok(TurnOutcome::Cancelled);
            }
            iteration += 1;

            let compacted = self.compactor.compact(&window);
            if compacted.elided() {
                cache.reset(compacted.len());
            }
            let total_token_count = compacted.total_token_count;
            let mut messages = compacted.messages;
            let marked = cache.place(&mut messages);
            debug!(
                session_id = %session_id,
                iteration,
                messages = messages.len(),
                tokens = total_token_count,
                cache_points = ?marked,
                "Invoking model"
            );

            let request = ConverseRequest {
                messages,
                system: SystemPrompt {
                    text: system.clone(),
                    cache_point: true,
                },
                tool_config: tool_config.clone(),
            };

            let Some(response) = self
                .invoke(session_id, &request, &expansion, cancel)
                .await?
            else {
                info!(session_id = %session_id, "Turn cancelled during invocation");
                return Ok(TurnOutcome::Cancelled);
            };

            self.backfill(&mut window, &response, total_token_count)
                .await?;
            self.update_cost(session_id).await;

            let output_tokens = i64::try_from(response.usage.output_tokens).unwrap_or(i64::MAX);

            if response.stop_reason == StopReason::ToolUse {
                let output = response.output.ok_or_else(|| {
                    Error::MalformedResponse("tool_use stop reason without an output message".into())
                })?;
                let calls = ToolCall::from_blocks(&output.content);
                validate_calls(&calls)?;

                let outcome = self.dispatcher.dispatch(session_id, &calls, &progress).await;
                validate_results(&calls, &outcome.results)?;

                let saved = self
                    .store
                    .append_atomic(
                        session_id,
                        vec![
                            NewMessage::new(MessageType::ToolUse, output.content, output_tokens),
                            NewMessage::new(MessageType::ToolResult, outcome.results, 0),
                        ],
                    )
                    .await?;
                window.extend(saved);

                if outcome.refresh_prompt {
                    debug!(session_id = %session_id, "Rebuilding system prompt");
                    system = self.prompt.build(session_id).await;
                }
                continue;
            }

            return self.finish(session_id, response.output, output_tokens).await;
        }
    }

    /// Read the log; if it does not end with a user-side record, the read
    /// may have hit a lagging replica, so try again a few times.
    async fn read_settled(&self, session_id: &SessionId) -> Result<Vec<MessageRecord>> {
        let settled =
            |records: &[MessageRecord]| records.last().is_some_and(|r| r.role == Role::User);

        let mut records = self.store.read_all(session_id).await?;
        let mut retry = 0;
        while !settled(&records) && retry < self.lag_retry.max_retries() {
            let delay = self.lag_retry.delay_for(retry);
            debug!(
                session_id = %session_id,
                attempt = retry + 1,
                delay_ms = delay.as_millis() as u64,
                "Last record is not from the user, re-reading"
            );
            tokio::time::sleep(delay).await;
            records = self.store.read_all(session_id).await?;
            retry += 1;
        }

        if !settled(&records) {
            warn!(session_id = %session_id, "Log still does not end with a user record, proceeding");
        }
        Ok(records)
    }

    /// One model call under the retry policy. `None` means the turn was
    /// cancelled before an attempt or during a backoff wait.
    async fn invoke(
        &self,
        session_id: &SessionId,
        request: &ConverseRequest,
        expansion: &AtomicU32,
        cancel: &CancellationToken,
    ) -> Result<Option<ConverseResponse>> {
        let this = self;
        self.retry
            .run(cancel, move |attempt| async move {
                let level = expansion.load(Ordering::SeqCst);
                let result = this
                    .model
                    .converse(session_id, &this.models, request, level)
                    .await;

                match result {
                    Ok(response) => {
                        this.record_usage(session_id, &response).await;
                        if response.stop_reason == StopReason::MaxTokens {
                            let level = expansion.fetch_add(1, Ordering::SeqCst) + 1;
                            info!(
                                session_id = %session_id,
                                attempt,
                                expansion = level,
                                "Output truncated, doubling output budget"
                            );
                            Attempt::Retry(RetryReason::OutputTruncated)
                        } else {
                            Attempt::Success(response)
                        }
                    }
                    Err(e) if e.is_retryable() => {
                        debug!(session_id = %session_id, attempt, error = %e, "Model throttled");
                        Attempt::Retry(RetryReason::RateLimited)
                    }
                    Err(e) => Attempt::Fatal(Error::Provider(e)),
                }
            })
            .await
    }

    /// Correct the token count of the newest user-side record so the window
    /// sums to what the endpoint actually counted. The adjustment is signed:
    /// content the endpoint drops between turns makes it negative.
    async fn backfill(
        &self,
        window: &mut [MessageRecord],
        response: &ConverseResponse,
        total_token_count: i64,
    ) -> Result<()> {
        let Some(last) = window.last_mut() else {
            return Ok(());
        };
        if last.role != Role::User {
            return Ok(());
        }

        let prompt_tokens = i64::try_from(response.usage.prompt_tokens()).unwrap_or(i64::MAX);
        let token_count = last.token_count + (prompt_tokens - total_token_count);
        self.store
            .backfill_token_count(&last.key, token_count)
            .await?;
        debug!(
            record = %last.key,
            before = last.token_count,
            after = token_count,
            "Backfilled token count"
        );
        last.token_count = token_count;
        Ok(())
    }

    async fn record_usage(&self, session_id: &SessionId, response: &ConverseResponse) {
        if let Err(e) = self
            .accountant
            .record(session_id, &response.model, &response.usage)
            .await
        {
            warn!(session_id = %session_id, error = %e, "Failed to record token usage");
        }
    }

    async fn update_cost(&self, session_id: &SessionId) {
        match self.accountant.update_session_cost(session_id).await {
            Ok(cost) => debug!(session_id = %session_id, cost, "Session cost updated"),
            Err(e) => warn!(session_id = %session_id, error = %e, "Failed to update session cost"),
        }
    }

    async fn finish(
        &self,
        session_id: &SessionId,
        output: Option<ModelMessage>,
        output_tokens: i64,
    ) -> Result<TurnOutcome> {
        let Some(message) = output.filter(|m| !m.content.is_empty()) else {
            info!(session_id = %session_id, "Final message is empty, ignoring");
            return Ok(TurnOutcome::Empty);
        };

        // With reasoning enabled the answer is the last text block
        let text = message
            .content
            .iter()
            .rev()
            .find_map(ContentBlock::as_text)
            .unwrap_or_default();
        let text = strip_thinking(text).trim().to_string();

        self.store
            .append(
                session_id,
                NewMessage::new(MessageType::Assistant, message.content, output_tokens),
            )
            .await?;

        self.events.publish(TurnEvent::TurnCompleted {
            session_id: session_id.clone(),
            text: text.clone(),
            timestamp: Utc::now(),
        });
        info!(session_id = %session_id, "Turn completed");

        Ok(TurnOutcome::Completed { text })
    }

    fn set_status(&self, session_id: &SessionId, status: AgentStatus) {
        self.events.publish(TurnEvent::StatusChanged {
            session_id: session_id.clone(),
            status,
            timestamp: Utc::now(),
        });
    }
}

/// A tool-use response must request at least one call, each with a
/// distinct, non-empty id.
fn validate_calls(calls: &[ToolCall]) -> Result<()> {
    if calls.is_empty() {
        return Err(Error::MalformedResponse(
            "tool_use stop reason without tool-use blocks".into(),
        ));
    }
    let mut seen = std::collections::HashSet::new();
    for call in calls {
        if call.call_id.is_empty() {
            return Err(Error::MalformedResponse(format!(
                "tool call '{}' has no id",
                call.name
            )));
        }
        if !seen.insert(call.call_id.as_str()) {
            return Err(Error::MalformedResponse(format!(
                "duplicate tool call id '{}'",
                call.call_id
            )));
        }
    }
    Ok(())
}

fn validate_results(calls: &[ToolCall], results: &[ContentBlock]) -> Result<()> {
    let result_ids: Vec<&str> = results
        .iter()
        .filter_map(|b| match b {
            ContentBlock::ToolResult { call_id, .. } => Some(call_id.as_str()),
            _ => None,
        })
        .collect();
    let call_ids: Vec<&str> = calls.iter().map(|c| c.call_id.as_str()).collect();
    if result_ids != call_ids {
        return Err(Error::Internal(format!(
            "tool results {result_ids:?} do not answer calls {call_ids:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::*;
    use swerve_core::error::ProviderError;
    use swerve_core::store::UsageLedger;

    #[test]
    fn thinking_is_stripped_across_lines() {
        assert_eq!(
            strip_thinking("<thinking>\nplan\nmore</thinking>Done. <thinking>x</thinking>Bye"),
            "Done. Bye"
        );
        assert_eq!(strip_thinking("plain"), "plain");
        // An unclosed section is left alone
        assert_eq!(strip_thinking("<thinking>half"), "<thinking>half");
    }

    #[test]
    fn malformed_tool_calls_are_rejected() {
        assert!(validate_calls(&[]).is_err());
        let dup = vec![tool_call("a", "x"), tool_call("a", "y")];
        assert!(matches!(validate_calls(&dup), Err(Error::MalformedResponse(_))));
        assert!(validate_calls(&[tool_call("", "x")]).is_err());
    }

    #[tokio::test]
    async fn tool_round_then_answer() {
        let harness = Harness::new(vec![
            Ok(tool_use_response(vec![("c1", "runTests")], usage(100, 20))),
            Ok(text_response("All green.", usage(160, 10))),
        ]);
        let session = harness.seed("fix bug").await;

        let outcome = harness.turn().run(&session, &CancellationToken::new()).await.unwrap();
        assert_eq!(
            outcome,
            TurnOutcome::Completed {
                text: "All green.".into()
            }
        );

        let log = harness.store.read_all(&session).await.unwrap();
        let types: Vec<MessageType> = log.iter().map(|r| r.message_type).collect();
        assert_eq!(
            types,
            vec![
                MessageType::UserMessage,
                MessageType::ToolUse,
                MessageType::ToolResult,
                MessageType::Assistant
            ]
        );
        assert!(log[1].is_answered_by(&log[2]));
        match &log[2].content[0] {
            ContentBlock::ToolResult { call_id, content } => {
                assert_eq!(call_id, "c1");
                assert!(content[0].as_text().unwrap().contains("3 passed"));
            }
            other => panic!("unexpected block: {other:?}"),
        }
        assert_eq!(log[1].token_count, 20);
        assert_eq!(log[3].token_count, 10);

        // Second request saw the appended pair
        let requests = harness.model.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].request.messages.len(), 3);
        assert!(requests[1].request.tool_config.cache_point);
        assert!(requests[1].request.system.cache_point);
    }

    #[tokio::test]
    async fn backfill_makes_window_match_reported_usage() {
        let harness = Harness::new(vec![
            Ok(tool_use_response(vec![("c1", "runTests")], usage(100, 20))),
            Ok(tool_use_response(vec![("c2", "runTests")], usage(150, 5))),
            Ok(text_response("ok", usage(140, 3))),
        ]);
        let session = harness.seed("fix bug").await;
        harness.turn().run(&session, &CancellationToken::new()).await.unwrap();

        let log = harness.store.read_all(&session).await.unwrap();
        // First call: the user message absorbs all 100 prompt tokens
        assert_eq!(log[0].token_count, 100);
        // Second call: 150 reported over a window summing to 100 + 20 + 0
        assert_eq!(log[2].token_count, 30);
        // Third call: fewer tokens than stored, so the adjustment is negative
        assert_eq!(log[4].token_count, -15);
        assert_eq!(log[..5].iter().map(|r| r.token_count).sum::<i64>(), 140);
    }

    #[tokio::test]
    async fn backfill_tracks_usage_over_many_rounds() {
        for rounds in 1..8u64 {
            let mut script = Vec::new();
            for i in 0..rounds {
                let call_id = format!("c{i}");
                script.push(Ok(tool_use_response(
                    vec![(call_id.as_str(), "runTests")],
                    usage(1_000 + i * 37 % 11 * 90, 10 + i),
                )));
            }
            let final_prompt = 900 + rounds * 13;
            script.push(Ok(text_response("done", usage(final_prompt, 4))));

            let harness = Harness::new(script);
            let session = harness.seed("go").await;
            harness.turn().run(&session, &CancellationToken::new()).await.unwrap();

            let log = harness.store.read_all(&session).await.unwrap();
            let window_before_answer: i64 =
                log[..log.len() - 1].iter().map(|r| r.token_count).sum();
            assert_eq!(window_before_answer, final_prompt as i64, "rounds = {rounds}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn truncated_output_expands_budget_without_duplicates() {
        let harness = Harness::new(vec![
            Ok(truncated_response(usage(100, 8192))),
            Ok(text_response("finished", usage(100, 9000))),
        ]);
        let session = harness.seed("write a lot").await;
        let outcome = harness.turn().run(&session, &CancellationToken::new()).await.unwrap();
        assert!(matches!(outcome, TurnOutcome::Completed { .. }));

        let expansions: Vec<u32> = harness.model.requests().iter().map(|r| r.expansion).collect();
        assert_eq!(expansions, vec![0, 1]);

        let log = harness.store.read_all(&session).await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].message_type, MessageType::Assistant);

        // Both calls were billed
        let usage = harness.store.usage_records(&session).await.unwrap();
        assert_eq!(usage[0].usage.output_tokens, 8192 + 9000);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limits_are_retried() {
        let harness = Harness::new(vec![
            Err(ProviderError::RateLimited { retry_after_secs: 1 }),
            Err(ProviderError::RateLimited { retry_after_secs: 1 }),
            Ok(text_response("ok", usage(10, 1))),
        ]);
        let session = harness.seed("hi").await;
        let outcome = harness.turn().run(&session, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, TurnOutcome::Completed { text: "ok".into() });
        assert_eq!(harness.model.requests().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_budget_is_fatal() {
        let harness = Harness::new(vec![
            Err(ProviderError::RateLimited { retry_after_secs: 1 }),
            Err(ProviderError::RateLimited { retry_after_secs: 1 }),
            Err(ProviderError::RateLimited { retry_after_secs: 1 }),
        ]);
        let session = harness.seed("hi").await;
        let err = harness
            .turn()
            .with_retry(RetryPolicy::new(
                2,
                std::time::Duration::from_millis(10),
                std::time::Duration::from_millis(20),
            ))
            .run(&session, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(harness.store.read_all(&session).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn non_retryable_errors_abort() {
        let harness = Harness::new(vec![Err(ProviderError::AuthenticationFailed("bad key".into()))]);
        let session = harness.seed("hi").await;
        let err = harness
            .turn()
            .run(&session, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Provider(ProviderError::AuthenticationFailed(_))));
        assert_eq!(harness.model.requests().len(), 1);
    }

    #[tokio::test]
    async fn tool_use_without_output_is_malformed() {
        let mut response = text_response("", usage(10, 1));
        response.stop_reason = StopReason::ToolUse;
        response.output = None;
        let harness = Harness::new(vec![Ok(response)]);
        let session = harness.seed("hi").await;
        let err = harness
            .turn()
            .run(&session, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MalformedResponse(_)));
        // No orphaned toolUse
        assert_eq!(harness.store.read_all(&session).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancellation_before_second_invocation() {
        let cancel = CancellationToken::new();
        let harness = Harness::with_cancel_tool(
            vec![
                Ok(tool_use_response(vec![("c1", "cancelTurn")], usage(50, 5))),
                Ok(text_response("never sent", usage(60, 5))),
            ],
            cancel.clone(),
        );
        let session = harness.seed("start").await;

        let completions = Arc::new(AtomicU32::new(0));
        let counter = completions.clone();
        cancel.set_completion(move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let mut rx = harness.events.subscribe();
        let outcome = harness
            .turn()
            .on_message_received(&session, &cancel)
            .await
            .unwrap();
        assert_eq!(outcome, TurnOutcome::Cancelled);
        assert_eq!(harness.model.requests().len(), 1);
        assert_eq!(completions.load(Ordering::SeqCst), 1);

        // Only the first round was persisted
        let log = harness.store.read_all(&session).await.unwrap();
        assert_eq!(log.len(), 3);

        // A second completion attempt is a no-op
        assert!(!cancel.complete().await);

        // working was published, pending was not
        let mut statuses = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let TurnEvent::StatusChanged { status, .. } = event.as_ref() {
                statuses.push(*status);
            }
        }
        assert_eq!(statuses, vec![AgentStatus::Working]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_backoff_skips_the_retry() {
        let cancel = CancellationToken::new();
        let harness = Harness::new(vec![
            Err(ProviderError::RateLimited { retry_after_secs: 1 }),
            Ok(text_response("never sent", usage(10, 1))),
        ]);
        let session = harness.seed("hi").await;

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = tokio::time::Instant::now();
        let outcome = harness
            .turn()
            .with_retry(RetryPolicy::new(
                5,
                std::time::Duration::from_secs(1),
                std::time::Duration::from_secs(5),
            ))
            .run(&session, &cancel)
            .await
            .unwrap();

        assert_eq!(outcome, TurnOutcome::Cancelled);
        assert_eq!(harness.model.requests().len(), 1);
        assert!(started.elapsed() < std::time::Duration::from_secs(1));
        assert_eq!(harness.store.read_all(&session).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_final_message_persists_nothing() {
        let mut response = text_response("", usage(10, 0));
        response.output = Some(ModelMessage {
            role: Role::Assistant,
            content: vec![],
        });
        let harness = Harness::new(vec![Ok(response)]);
        let session = harness.seed("hi").await;
        let mut rx = harness.events.subscribe();

        let outcome = harness
            .turn()
            .on_message_received(&session, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, TurnOutcome::Empty);
        assert_eq!(harness.store.read_all(&session).await.unwrap().len(), 1);

        let mut saw_completed = false;
        let mut statuses = Vec::new();
        while let Ok(event) = rx.try_recv() {
            match event.as_ref() {
                TurnEvent::TurnCompleted { .. } => saw_completed = true,
                TurnEvent::StatusChanged { status, .. } => statuses.push(*status),
                _ => {}
            }
        }
        assert!(!saw_completed);
        assert_eq!(statuses, vec![AgentStatus::Working, AgentStatus::Pending]);
    }

    #[tokio::test]
    async fn completion_event_carries_visible_text() {
        let harness = Harness::new(vec![Ok(text_response(
            "<thinking>secret</thinking>Here you go.",
            usage(10, 3),
        ))]);
        let session = harness.seed("hi").await;
        let mut rx = harness.events.subscribe();
        harness.turn().run(&session, &CancellationToken::new()).await.unwrap();

        let event = rx.recv().await.unwrap();
        match event.as_ref() {
            TurnEvent::TurnCompleted { text, .. } => assert_eq!(text, "Here you go."),
            other => panic!("unexpected event: {other:?}"),
        }
        // The stored message keeps the full text
        let log = harness.store.read_all(&session).await.unwrap();
        assert!(log[1].content[0].as_text().unwrap().contains("secret"));
    }

    #[tokio::test]
    async fn resume_only_after_user_side_records() {
        let harness = Harness::new(vec![Ok(text_response("resumed", usage(10, 2)))]);
        let session = harness.seed("hi").await;

        let outcome = harness
            .turn()
            .resume(&session, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            Some(TurnOutcome::Completed {
                text: "resumed".into()
            })
        );

        // Now the log ends with the assistant answer
        let again = harness
            .turn()
            .resume(&session, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(again, None);
        assert_eq!(harness.model.requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn lagging_read_is_retried() {
        let harness = Harness::new(vec![Ok(text_response("ok", usage(10, 2)))]);
        let session = SessionId::from("lagging");
        harness
            .store
            .append(
                &session,
                NewMessage::new(MessageType::Assistant, vec![ContentBlock::text("old answer")], 3),
            )
            .await
            .unwrap();

        // The user message lands while the loop is waiting
        let store = harness.store.clone();
        let writer_session = session.clone();
        let writer = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(150)).await;
            store
                .append(&writer_session, NewMessage::user_text("new request"))
                .await
                .unwrap();
        });

        let outcome = harness.turn().run(&session, &CancellationToken::new()).await.unwrap();
        writer.await.unwrap();
        assert!(matches!(outcome, TurnOutcome::Completed { .. }));

        let request = &harness.model.requests()[0].request;
        assert_eq!(request.messages.last().unwrap().role, Role::User);
    }

    #[tokio::test(start_paused = true)]
    async fn trailing_tool_result_is_not_treated_as_lagging() {
        let harness = Harness::new(vec![Ok(text_response("done", usage(30, 2)))]);
        let session = harness.seed("run the tests").await;
        harness
            .store
            .append_atomic(
                &session,
                vec![
                    NewMessage::new(
                        MessageType::ToolUse,
                        vec![ContentBlock::ToolUse {
                            call_id: "c1".into(),
                            name: "runTests".into(),
                            input: serde_json::json!({}),
                        }],
                        4,
                    ),
                    NewMessage::new(
                        MessageType::ToolResult,
                        vec![ContentBlock::ToolResult {
                            call_id: "c1".into(),
                            content: vec![ContentBlock::text("3 passed")],
                        }],
                        0,
                    ),
                ],
            )
            .await
            .unwrap();

        let started = tokio::time::Instant::now();
        let outcome = harness.turn().run(&session, &CancellationToken::new()).await.unwrap();
        assert!(matches!(outcome, TurnOutcome::Completed { .. }));

        // No re-read backoff was taken before the first invocation
        assert!(started.elapsed() < std::time::Duration::from_millis(100));
        let request = &harness.model.requests()[0].request;
        assert_eq!(request.messages.len(), 3);
        assert!(matches!(
            request.messages[2].content[0],
            ContentBlock::ToolResult { .. }
        ));
    }

    #[tokio::test]
    async fn oversized_log_is_compacted_and_cache_stays_in_bounds() {
        let mut script = Vec::new();
        for i in 0..6 {
            let id = format!("c{i}");
            script.push(Ok(tool_use_response(
                vec![(id.as_str(), "runTests")],
                usage(200 * (i + 1), 40),
            )));
        }
        script.push(Ok(text_response("done", usage(0, 1))));

        let harness = Harness::new(script);
        let session = harness.seed("big job").await;
        let outcome = harness
            .turn()
            .with_compactor(Compactor::new(100, 0.5))
            .run(&session, &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, TurnOutcome::Completed { .. }));

        for recorded in harness.model.requests() {
            let messages = &recorded.request.messages;
            assert_eq!(messages[0].role, Role::User, "head is kept");
            let marked = messages.iter().filter(|m| m.has_cache_point()).count();
            assert!((1..=2).contains(&marked));
            assert!(messages.last().unwrap().has_cache_point());
            for (i, m) in messages.iter().enumerate() {
                let uses = m
                    .content
                    .iter()
                    .filter(|b| matches!(b, ContentBlock::ToolUse { .. }))
                    .count();
                if uses > 0 {
                    assert!(
                        messages.get(i + 1).is_some_and(|next| next
                            .content
                            .iter()
                            .any(|b| matches!(b, ContentBlock::ToolResult { .. }))),
                        "toolUse at {i} has no result"
                    );
                }
            }
        }
        // Later requests are shorter than the full log
        let log_len = harness.store.read_all(&session).await.unwrap().len();
        let last_request = harness.model.requests().last().unwrap().request.messages.len();
        assert!(last_request < log_len - 1);
    }

    #[tokio::test]
    async fn cost_is_derived_from_persisted_usage() {
        let harness = Harness::new(vec![
            Ok(tool_use_response(vec![("c1", "runTests")], usage(1000, 500))),
            Ok(text_response("done", usage(1000, 500))),
        ]);
        let session = harness.seed("hi").await;
        harness.turn().run(&session, &CancellationToken::new()).await.unwrap();

        let cost = harness.store.session_cost(&session).await.unwrap();
        assert!((cost - 2.0 * 0.0105).abs() < 1e-9, "cost = {cost}");
    }
}
