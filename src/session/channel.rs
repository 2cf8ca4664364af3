//! Per-channel session: single-flight turn execution over a durable journal.
//!
//! A `ChannelSession` owns one channel's journal, active turn list, and
//! request queue. Turn execution is strictly serialized by the queue's busy
//! flag; channels are independent and run concurrently with each other.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::agent::{AgentEvent, AgentExecutor, AgentRun, ModelConfig, ModelResolver};
use crate::config::Config;
use crate::context::{needs_compaction, plan_compaction, trim_to_budget};
use crate::dispatch::QuickDispatch;
use crate::journal::{JournalError, SessionJournal, Turn, TurnPart};
use crate::transport::Transport;

use super::queue::{DrainResult, RequestQueue, SubmitDisposition, TurnRequest};

/// Shared collaborators handed to every channel session.
#[derive(Clone)]
pub struct SessionDeps {
    pub executor: Arc<dyn AgentExecutor>,
    pub transport: Arc<dyn Transport>,
    pub resolver: Arc<dyn ModelResolver>,
    pub dispatch: Arc<QuickDispatch>,
    pub config: Arc<Config>,
}

impl std::fmt::Debug for SessionDeps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionDeps").finish_non_exhaustive()
    }
}

/// Terminal result of one turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The agent produced a reply.
    Completed,
    /// A quick-dispatch rule produced the reply without the executor.
    QuickReply { rule: String },
    /// Execution exceeded the turn timeout and the run was aborted.
    TimedOut,
    /// The turn failed terminally (agent or journal error).
    Failed { error: String },
}

/// Mutable per-channel state, touched only by the single-flight turn runner.
struct SessionState {
    /// Lazily opened on the first turn.
    journal: Option<SessionJournal>,
    /// Active turns: what the next prompt is built from.
    active: Vec<Turn>,
    /// Increments once per accepted turn; monotonic and gapless.
    turn_index: u64,
}

/// One channel's conversation session.
pub struct ChannelSession {
    channel_id: String,
    deps: SessionDeps,
    queue: RequestQueue,
    state: Mutex<SessionState>,
}

impl ChannelSession {
    pub fn new(channel_id: impl Into<String>, deps: SessionDeps) -> Arc<Self> {
        let max_pending = deps.config.queue.max_pending;
        Arc::new(Self {
            channel_id: channel_id.into(),
            deps,
            queue: RequestQueue::new(max_pending),
            state: Mutex::new(SessionState {
                journal: None,
                active: Vec::new(),
                turn_index: 0,
            }),
        })
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// Submit a request. Returns `ProcessNow` when the caller should spawn
    /// `run_loop` for it; otherwise the request waits in the queue and will
    /// be drained by the in-flight runner.
    pub async fn submit(&self, request: TurnRequest) -> SubmitDisposition {
        self.queue.try_enqueue(request).await
    }

    /// Whether a turn is currently in flight.
    pub async fn is_busy(&self) -> bool {
        self.queue.is_busy().await
    }

    /// The current active turn list (for inspection and tests).
    pub async fn active_turns(&self) -> Vec<Turn> {
        self.state.lock().await.active.clone()
    }

    /// The number of turns accepted so far.
    pub async fn turn_index(&self) -> u64 {
        self.state.lock().await.turn_index
    }

    /// Reset the session: truncate the journal, issue a new session
    /// identifier, and clear the active history.
    ///
    /// Caller is responsible for quiescence (no turn in flight).
    pub async fn reset(&self) -> Result<(), JournalError> {
        let mut state = self.state.lock().await;
        match state.journal.as_mut() {
            Some(journal) => {
                let model_id = journal.model_id().to_string();
                journal.reset(&model_id).await?;
            }
            // Not opened this process: destroy any on-disk history so the
            // next turn starts a fresh session.
            None => {
                SessionJournal::remove(&self.deps.config.journals_dir(), &self.channel_id).await?;
            }
        }
        state.active.clear();
        info!(channel_id = %self.channel_id, "channel session reset");
        Ok(())
    }

    /// Run the first turn, then keep draining queued requests until the
    /// queue is empty. This is the channel's entire `Running -> Draining ->
    /// Idle` lifecycle; the caller spawns it once per `ProcessNow`.
    pub async fn run_loop(self: Arc<Self>, first: TurnRequest) {
        let mut next = Some(first);
        while let Some(request) = next.take() {
            let outcome = self.run_turn(&request).await;
            debug!(
                channel_id = %self.channel_id,
                request_id = %request.request_id,
                outcome = ?outcome,
                "turn finished"
            );

            match self.queue.drain().await {
                DrainResult::Next(request) => next = Some(*request),
                DrainResult::Idle => {}
            }
        }
    }

    // ------------------------------------------------------------------------
    // Turn execution
    // ------------------------------------------------------------------------

    async fn run_turn(&self, request: &TurnRequest) -> TurnOutcome {
        let model = self.deps.resolver.resolve(&request.sender_id);

        // Phase 1 (state locked): accept the turn, persist the user message,
        // and build the prompt.
        let prompt = {
            let mut state = self.state.lock().await;

            if let Err(error) = self.ensure_journal(&mut state, &model).await {
                error!(channel_id = %self.channel_id, %error, "failed to open journal");
                self.deliver_final("Failed to open the conversation journal.")
                    .await;
                return TurnOutcome::Failed {
                    error: error.to_string(),
                };
            }

            state.turn_index += 1;

            // Count-based compaction check on acceptance: a journal that
            // grew past the ceiling (config change, recovered state) is
            // folded before the new turn lands.
            if let Err(error) = self.maybe_compact(&mut state).await {
                warn!(channel_id = %self.channel_id, %error, "compaction failed, continuing uncompacted");
            }

            // Quick dispatch: a hit produces the reply without the executor.
            if let Some(hit) = self.deps.dispatch.dispatch(&request.text) {
                debug!(channel_id = %self.channel_id, rule = %hit.rule, "request handled by quick dispatch");
                let user_turn = Turn::user(request.text.as_str());
                let reply_turn = Turn::assistant_text(hit.reply.as_str());
                for turn in [&user_turn, &reply_turn] {
                    if let Err(error) = Self::append_to_state(&mut state, turn).await {
                        error!(channel_id = %self.channel_id, %error, "failed to persist quick-dispatch turn");
                        drop(state);
                        self.deliver_final("Failed to persist the conversation turn.")
                            .await;
                        return TurnOutcome::Failed {
                            error: error.to_string(),
                        };
                    }
                }
                drop(state);
                self.deliver_final(&hit.reply).await;
                return TurnOutcome::QuickReply { rule: hit.rule };
            }

            let user_turn = Turn::user(request.text.as_str());
            if let Err(error) = Self::append_to_state(&mut state, &user_turn).await {
                error!(channel_id = %self.channel_id, %error, "failed to persist user turn");
                drop(state);
                self.deliver_final("Failed to persist your message; please try again.")
                    .await;
                return TurnOutcome::Failed {
                    error: error.to_string(),
                };
            }

            let budget = model
                .max_history_tokens
                .unwrap_or(self.deps.config.context.max_history_tokens);
            trim_to_budget(&state.active, budget, self.deps.config.context.keep_recent)
        };

        // Phase 2 (unlocked): start the run with bounded retry, then consume
        // the event stream under the turn timeout.
        let mut run = match self.start_run_with_retry(&prompt, &model).await {
            Ok(run) => run,
            Err(error) => {
                error!(channel_id = %self.channel_id, %error, "agent run failed");
                self.append_marker(format!("Agent error: {error}")).await;
                self.deliver_final(&format!("The agent failed to respond: {error}"))
                    .await;
                return TurnOutcome::Failed {
                    error: error.to_string(),
                };
            }
        };

        let timeout = self.deps.config.turn.timeout();
        let mut collector = StreamCollector::new(self.deps.config.turn.edit_interval());

        let collected = tokio::time::timeout(
            timeout,
            self.consume_stream(&mut run, &mut collector),
        )
        .await;

        match collected {
            // Timed out: abort the in-flight run (exactly once) and journal
            // a timeout error turn so history stays consistent.
            Err(_elapsed) => {
                warn!(
                    channel_id = %self.channel_id,
                    timeout_secs = timeout.as_secs(),
                    "turn execution timed out, aborting agent run"
                );
                run.abort();
                let text = format!(
                    "Turn aborted: agent execution exceeded {}s.",
                    timeout.as_secs()
                );
                self.append_marker(text.clone()).await;
                self.deliver_final(&text).await;
                TurnOutcome::TimedOut
            }
            Ok(Err(message)) => {
                warn!(channel_id = %self.channel_id, error = %message, "agent stream failed");
                self.append_marker(format!("Agent error: {message}")).await;
                self.deliver_final(&format!("The agent failed to respond: {message}"))
                    .await;
                TurnOutcome::Failed { error: message }
            }
            Ok(Ok(parts)) => self.finish_turn(parts, &collector.preview().to_string()).await,
        }
    }

    /// Persist the assistant turn, run the compaction check, and deliver the
    /// terminal reply.
    async fn finish_turn(&self, parts: Vec<TurnPart>, reply: &str) -> TurnOutcome {
        {
            let mut state = self.state.lock().await;
            let assistant = Turn::assistant(parts);
            if let Err(error) = Self::append_to_state(&mut state, &assistant).await {
                error!(channel_id = %self.channel_id, %error, "failed to persist assistant turn");
                drop(state);
                self.deliver_final("Failed to persist the reply; the conversation may be incomplete.")
                    .await;
                return TurnOutcome::Failed {
                    error: error.to_string(),
                };
            }

            if let Err(error) = self.maybe_compact(&mut state).await {
                warn!(channel_id = %self.channel_id, %error, "compaction failed, continuing uncompacted");
            }
        }

        if reply.is_empty() {
            debug!(channel_id = %self.channel_id, "agent produced no reply text");
        } else {
            self.deliver_final(reply).await;
        }
        TurnOutcome::Completed
    }

    /// Start the agent run, retrying transient transport failures with
    /// exponential backoff. Independent from the turn timeout, which bounds
    /// stream consumption.
    async fn start_run_with_retry(
        &self,
        prompt: &[Turn],
        model: &ModelConfig,
    ) -> Result<AgentRun, crate::agent::AgentError> {
        let retry = &self.deps.config.retry;
        let mut attempt: u8 = 0;

        loop {
            match self.deps.executor.run(prompt, model).await {
                Ok(run) => return Ok(run),
                Err(error) if error.is_transient() && attempt < retry.max_retries => {
                    warn!(
                        channel_id = %self.channel_id,
                        attempt = attempt + 1,
                        max_retries = retry.max_retries,
                        %error,
                        "transient agent transport failure, retrying"
                    );
                    tokio::time::sleep(retry.delay_for_attempt(attempt)).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Consume agent events until a terminal event, driving throttled
    /// incremental edits.
    async fn consume_stream(
        &self,
        run: &mut AgentRun,
        collector: &mut StreamCollector,
    ) -> Result<Vec<TurnPart>, String> {
        loop {
            match run.next_event().await {
                Some(AgentEvent::TextDelta { text }) => {
                    collector.push_text(&text);
                    if collector.should_edit() {
                        // Best-effort live update; failures never fail the turn.
                        if let Err(error) = self
                            .deps
                            .transport
                            .send_incremental_edit(&self.channel_id, collector.preview())
                            .await
                        {
                            debug!(channel_id = %self.channel_id, %error, "incremental edit failed");
                        }
                        collector.mark_edited();
                    }
                }
                Some(AgentEvent::ToolStart {
                    call_id,
                    name,
                    arguments,
                }) => collector.push_tool_call(call_id, name, arguments),
                Some(AgentEvent::ToolEnd {
                    call_id,
                    name: _,
                    success,
                    content,
                }) => collector.push_tool_result(call_id, success, content),
                Some(AgentEvent::Done) => return Ok(collector.take_parts()),
                Some(AgentEvent::Error { message }) => return Err(message),
                None => return Err("agent event stream closed before completion".to_string()),
            }
        }
    }

    // ------------------------------------------------------------------------
    // State helpers
    // ------------------------------------------------------------------------

    /// Open the journal on first use; record a model change when the
    /// resolved model differs from the journaled one.
    async fn ensure_journal(
        &self,
        state: &mut SessionState,
        model: &ModelConfig,
    ) -> Result<(), JournalError> {
        match state.journal.as_mut() {
            Some(journal) => {
                if journal.model_id() != model.model_id {
                    journal.append_model_change(&model.model_id).await?;
                }
                Ok(())
            }
            None => {
                let (journal, active) = SessionJournal::open(
                    &self.deps.config.journals_dir(),
                    &self.channel_id,
                    &model.model_id,
                )
                .await?;
                state.journal = Some(journal);
                state.active = active;
                Ok(())
            }
        }
    }

    /// Durably append a turn, then mirror it into the active list. The
    /// journal write happens first so the on-disk log remains a prefix of
    /// the in-memory state.
    async fn append_to_state(state: &mut SessionState, turn: &Turn) -> Result<(), JournalError> {
        let Some(journal) = state.journal.as_mut() else {
            return Ok(());
        };
        journal.append_turn(turn).await?;
        state.active.push(turn.clone());
        Ok(())
    }

    /// Journal a marker turn (timeout/error), best effort.
    async fn append_marker(&self, text: String) {
        let mut state = self.state.lock().await;
        let marker = Turn::system_marker(text);
        if let Err(error) = Self::append_to_state(&mut state, &marker).await {
            error!(channel_id = %self.channel_id, %error, "failed to journal marker turn");
        }
    }

    async fn maybe_compact(&self, state: &mut SessionState) -> Result<(), JournalError> {
        let context = &self.deps.config.context;
        if !needs_compaction(&state.active, context.compaction_ceiling) {
            return Ok(());
        }
        let Some(plan) = plan_compaction(&state.active, context.keep_recent) else {
            return Ok(());
        };
        let Some(journal) = state.journal.as_mut() else {
            return Ok(());
        };

        // Durable first: the active list is only replaced once the summary
        // record is on disk.
        journal
            .append_compaction(&plan.summary, plan.recent.len())
            .await?;
        info!(
            channel_id = %self.channel_id,
            folded = plan.folded,
            retained = plan.recent.len(),
            "channel history compacted"
        );
        state.active = plan.into_active();
        Ok(())
    }

    /// Deliver the terminal message for a turn, best effort.
    async fn deliver_final(&self, text: &str) {
        if let Err(error) = self.deps.transport.send_final(&self.channel_id, text).await {
            error!(channel_id = %self.channel_id, %error, "failed to deliver final reply");
        }
    }
}

impl std::fmt::Debug for ChannelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSession")
            .field("channel_id", &self.channel_id)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Stream Collector
// ============================================================================

/// Accumulates agent events into turn parts and paces incremental edits.
struct StreamCollector {
    parts: Vec<TurnPart>,
    text_buf: String,
    preview: String,
    edit_interval: Duration,
    last_edit: Option<Instant>,
}

impl StreamCollector {
    fn new(edit_interval: Duration) -> Self {
        Self {
            parts: Vec::new(),
            text_buf: String::new(),
            preview: String::new(),
            edit_interval,
            last_edit: None,
        }
    }

    fn push_text(&mut self, text: &str) {
        self.text_buf.push_str(text);
        self.preview.push_str(text);
    }

    fn push_tool_call(&mut self, call_id: String, name: String, arguments: serde_json::Value) {
        self.flush_text();
        self.parts.push(TurnPart::ToolCall {
            call_id,
            name,
            arguments,
        });
    }

    fn push_tool_result(&mut self, call_id: String, success: bool, content: String) {
        self.parts.push(TurnPart::ToolResult {
            call_id,
            success,
            content,
        });
    }

    fn flush_text(&mut self) {
        if !self.text_buf.is_empty() {
            self.parts.push(TurnPart::Text {
                text: std::mem::take(&mut self.text_buf),
            });
        }
    }

    fn take_parts(&mut self) -> Vec<TurnPart> {
        self.flush_text();
        std::mem::take(&mut self.parts)
    }

    /// At most one outbound edit per interval.
    fn should_edit(&self) -> bool {
        match self.last_edit {
            None => true,
            Some(at) => at.elapsed() >= self.edit_interval,
        }
    }

    fn mark_edited(&mut self) {
        self.last_edit = Some(Instant::now());
    }

    fn preview(&self) -> &str {
        &self.preview
    }
}
