//! The council orchestrator: one loop that owns the session.
//!
//! The orchestrator is the single writer of [`CouncilState`].  Every
//! mutation — transcript appends, cost accrual, fairness recording,
//! conflict bookkeeping, lifecycle flips — happens under one mutex, and
//! provider streaming runs with the lock released so host controls
//! (`pause`, `stop`, whispers, credential updates) stay responsive
//! mid-turn.  Subscribers observe the session exclusively through
//! [`CouncilEvent`] snapshots.
//!
//! # Driving a session
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use socratic_council::{Council, CouncilConfig, CredentialStore, ProviderKind};
//!
//! # async {
//! let mut credentials = CredentialStore::default();
//! credentials.set_api_key(ProviderKind::Anthropic, std::env::var("ANTHROPIC_KEY").unwrap());
//! credentials.set_api_key(ProviderKind::DeepSeek, std::env::var("DEEPSEEK_KEY").unwrap());
//!
//! let council = Arc::new(Council::new(CouncilConfig::default(), credentials));
//! council.start("Should cities ban private cars?", None).await.unwrap();
//!
//! let runner = council.clone();
//! tokio::spawn(async move { runner.run().await });
//! // ... render events, then eventually:
//! council.stop().await;
//! # };
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::council::bidding::{pick_winner, BiddingEngine};
use crate::council::config::{CouncilConfig, CredentialPatch, CredentialStore};
use crate::council::conflict::{ConflictDetector, DyadicExchange};
use crate::council::event::{BidScore, CouncilEvent, EventHandler};
use crate::council::fairness::FairnessManager;
use crate::council::oracle::{
    dispatch_all, extract_directives, render_result, NullOracle, OracleTool, ToolName,
};
use crate::council::providers::anthropic::{is_opus_family, OPUS_FALLBACK_MODEL};
use crate::council::providers::{
    adapter_for, ChatRole, ChatTurn, CompletionOptions, CompletionResult, ProviderAdapter,
    ProviderError, ProviderKind,
};
use crate::council::state::{
    AgentId, AgentPatch, AgentProfile, CouncilState, Lifecycle, Message, MessageMeta, Source,
    TokenUsage,
};
use crate::council::transport::{HttpTransport, Transport};
use crate::council::whisper::WhisperPayload;

/// Errors surfaced by the host control surface.
#[derive(Debug, Error)]
pub enum CouncilError {
    #[error("unknown agent: {0}")]
    UnknownAgent(AgentId),

    #[error("no providers configured for any eligible agent")]
    NoEligibleProviders,

    #[error("operation requires status {expected:?}, session is {actual:?}")]
    BadLifecycle {
        expected: Lifecycle,
        actual: Lifecycle,
    },

    #[error("state serialisation failed: {0}")]
    Serde(#[from] serde_json::Error),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Whether the autonomous loop keeps going after a turn.
enum TurnOutcome {
    Continue,
    Halt,
}

struct Inner {
    state: CouncilState,
    credentials: CredentialStore,
    fairness: FairnessManager,
    handler: Option<Arc<dyn EventHandler>>,
    cancel: CancellationToken,
    rng: StdRng,
}

/// The engine handle.  Cheap to share (`Arc` it) — every method takes
/// `&self` and serialises through the inner mutex.
pub struct Council {
    inner: Mutex<Inner>,
    transport: Arc<dyn Transport>,
    oracle: Arc<dyn OracleTool>,
}

impl Council {
    pub fn new(config: CouncilConfig, credentials: CredentialStore) -> Self {
        Self::with_roster(config, credentials, AgentProfile::default_roster())
    }

    pub fn with_roster(
        config: CouncilConfig,
        credentials: CredentialStore,
        roster: Vec<AgentProfile>,
    ) -> Self {
        let fairness = FairnessManager::new(config.fairness_window, config.fairness_cap);
        Self {
            inner: Mutex::new(Inner {
                state: CouncilState::new(config, roster),
                credentials,
                fairness,
                handler: None,
                cancel: CancellationToken::new(),
                rng: StdRng::from_entropy(),
            }),
            transport: Arc::new(HttpTransport::new()),
            oracle: Arc::new(NullOracle),
        }
    }

    /// Swap the HTTP layer (proxied transport, scripted test transport).
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    /// Wire a real oracle backend.
    pub fn with_oracle(mut self, oracle: Arc<dyn OracleTool>) -> Self {
        self.oracle = oracle;
        self
    }

    pub async fn set_event_handler(&self, handler: Arc<dyn EventHandler>) {
        self.inner.lock().await.handler = Some(handler);
    }

    async fn emit(handler: &Option<Arc<dyn EventHandler>>, event: CouncilEvent) {
        if let Some(handler) = handler {
            handler.on_event(&event).await;
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    /// Begin a session: records the topic as a system message and flips
    /// the status to running.  Pass `options` to replace the configuration
    /// wholesale; the topic argument always wins.
    pub async fn start(
        &self,
        topic: impl Into<String>,
        options: Option<CouncilConfig>,
    ) -> Result<(), CouncilError> {
        let topic = topic.into();
        let mut inner = self.inner.lock().await;
        if inner.state.status != Lifecycle::Idle {
            return Err(CouncilError::BadLifecycle {
                expected: Lifecycle::Idle,
                actual: inner.state.status,
            });
        }

        if let Some(options) = options {
            inner.state.config = options;
            inner.fairness = FairnessManager::new(
                inner.state.config.fairness_window,
                inner.state.config.fairness_cap,
            );
        }
        inner.state.config.topic = topic.clone();
        inner.state.status = Lifecycle::Running;
        inner.state.started_at = Some(chrono::Utc::now());
        inner.cancel = CancellationToken::new();

        let message = Message::system(&topic);
        inner.state.messages.push(message.clone());

        let handler = inner.handler.clone();
        let session_id = inner.state.session_id;
        drop(inner);

        Self::emit(
            &handler,
            CouncilEvent::CouncilStarted {
                session_id,
                topic,
            },
        )
        .await;
        Self::emit(&handler, CouncilEvent::MessageComplete { message }).await;
        Ok(())
    }

    /// Drive the loop until the turn budget, the monetary ceiling, a
    /// terminal error, `pause`, or `stop`.  With `auto` off, one call
    /// produces exactly one turn.  Returns immediately if the session is
    /// not running; after `resume` just call it again.
    pub async fn run(&self) -> Result<(), CouncilError> {
        loop {
            let auto = {
                let inner = self.inner.lock().await;
                match inner.state.status {
                    Lifecycle::Running => {}
                    // Paused: halt without finalising.
                    Lifecycle::Paused => return Ok(()),
                    _ => return Ok(()),
                }
                if inner.state.turn >= inner.state.config.max_turns {
                    drop(inner);
                    self.complete("turn budget reached").await;
                    return Ok(());
                }
                if let Some(ceiling) = inner.state.config.budget_usd {
                    if inner.state.cost.total_usd >= ceiling {
                        drop(inner);
                        self.complete("budget ceiling reached").await;
                        return Ok(());
                    }
                }
                inner.state.config.auto
            };

            match self.run_turn(None).await {
                TurnOutcome::Continue => {}
                TurnOutcome::Halt => return Ok(()),
            }
            if !auto {
                return Ok(());
            }

            let pacing = {
                let inner = self.inner.lock().await;
                Duration::from_millis(inner.state.config.turn_pacing_ms)
            };
            tokio::time::sleep(pacing).await;
        }
    }

    /// Halt the loop after the in-flight turn without finalising.
    pub async fn pause(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state.status != Lifecycle::Running {
            return;
        }
        inner.state.status = Lifecycle::Paused;
        let handler = inner.handler.clone();
        drop(inner);
        Self::emit(&handler, CouncilEvent::CouncilPaused).await;
    }

    /// Return a paused session to running; call [`Council::run`] again to
    /// continue producing turns.
    pub async fn resume(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state.status == Lifecycle::Paused {
            inner.state.status = Lifecycle::Running;
        }
    }

    /// Abort the in-flight stream and finalise the session.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state.status == Lifecycle::Completed {
            return;
        }
        inner.cancel.cancel();
        inner.state.status = Lifecycle::Completed;
        inner.state.completed_at = Some(chrono::Utc::now());
        let handler = inner.handler.clone();
        drop(inner);
        Self::emit(
            &handler,
            CouncilEvent::CouncilCompleted {
                reason: "stopped".to_string(),
            },
        )
        .await;
    }

    async fn complete(&self, reason: &str) {
        let mut inner = self.inner.lock().await;
        if inner.state.status == Lifecycle::Completed {
            return;
        }
        inner.state.status = Lifecycle::Completed;
        inner.state.completed_at = Some(chrono::Utc::now());
        let handler = inner.handler.clone();
        drop(inner);
        Self::emit(
            &handler,
            CouncilEvent::CouncilCompleted {
                reason: reason.to_string(),
            },
        )
        .await;
    }

    // ── One turn ─────────────────────────────────────────────────────────

    /// Execute a single turn.  `forced` bypasses eligibility with a
    /// host-chosen speaker.
    async fn run_turn(&self, forced: Option<AgentId>) -> TurnOutcome {
        // Phase 1 (locked): eligibility, bidding, context assembly.
        let mut inner = self.inner.lock().await;
        if inner.state.status == Lifecycle::Completed
            || (inner.state.status != Lifecycle::Running && forced.is_none())
        {
            return TurnOutcome::Halt;
        }

        let exchange_was_active = inner
            .state
            .exchange
            .as_ref()
            .map(DyadicExchange::is_active)
            .unwrap_or(false);

        let eligible: Vec<AgentId> = match forced {
            Some(id) => vec![id],
            None => {
                let base: Vec<AgentId> = if exchange_was_active {
                    inner
                        .state
                        .exchange
                        .as_ref()
                        .map(|e| e.participants().to_vec())
                        .unwrap_or_default()
                } else {
                    inner.state.agents.iter().map(|a| a.id).collect()
                };
                base.into_iter()
                    .filter(|id| {
                        inner
                            .state
                            .agent(*id)
                            .map(|a| inner.credentials.is_configured(a.provider))
                            .unwrap_or(false)
                    })
                    .collect()
            }
        };

        if eligible.is_empty() {
            let handler = inner.handler.clone();
            drop(inner);
            Self::emit(
                &handler,
                CouncilEvent::Error {
                    agent: None,
                    code: Some("no_eligible_providers".to_string()),
                    message: CouncilError::NoEligibleProviders.to_string(),
                },
            )
            .await;
            self.complete("no eligible providers").await;
            return TurnOutcome::Halt;
        }

        let turn_number = inner.state.turn + 1;
        let bonuses = inner.state.whisper.consume_bonuses();
        let engine = BiddingEngine::new(inner.state.config.bid_random_max);
        let topic = inner.state.config.topic.clone();
        let Inner {
            state,
            fairness,
            rng,
            ..
        } = &mut *inner;
        let bids = engine.collect(&eligible, &state.messages, &topic, &bonuses, rng);
        let adjustments = fairness.adjustments(&eligible);

        let adjusted: Vec<(AgentId, f64)> = bids
            .iter()
            .map(|b| {
                let adjustment = adjustments.get(&b.agent).copied().unwrap_or(0.0);
                (b.agent, b.score + adjustment)
            })
            .collect();
        let Some(winner) = pick_winner(&adjusted) else {
            return TurnOutcome::Halt;
        };
        let winning_score = adjusted
            .iter()
            .find(|(agent, _)| *agent == winner)
            .map(|(_, score)| *score)
            .unwrap_or(0.0);

        let scores: HashMap<AgentId, BidScore> = bids
            .iter()
            .map(|b| {
                let adjustment = adjustments.get(&b.agent).copied().unwrap_or(0.0);
                (
                    b.agent,
                    BidScore {
                        raw: b.score,
                        adjustment,
                        adjusted: b.score + adjustment,
                    },
                )
            })
            .collect();

        let Some(profile) = inner.state.agent(winner).cloned() else {
            return TurnOutcome::Halt;
        };
        let conversation = Self::build_context(&inner.state, &profile);
        let options = Self::completion_options(&inner.state.config, &profile);
        let handler = inner.handler.clone();
        let cancel = inner.cancel.clone();
        let credentials = inner.credentials.clone();
        let config = inner.state.config.clone();
        let message_id = Uuid::new_v4();
        drop(inner);

        Self::emit(
            &handler,
            CouncilEvent::BiddingComplete {
                turn: turn_number,
                scores,
                winner,
            },
        )
        .await;
        Self::emit(
            &handler,
            CouncilEvent::TurnStarted {
                turn: turn_number,
                agent: winner,
                message_id,
            },
        )
        .await;

        // Phase 2 (unlocked): provider streaming plus the tool loop.
        let turn_started = std::time::Instant::now();
        let completion = self
            .generate_with_tools(
                &profile,
                &credentials,
                conversation,
                options,
                &config,
                &handler,
                &cancel,
                message_id,
            )
            .await;
        let turn_latency_ms = turn_started.elapsed().as_millis() as u64;

        let (final_text, usage, model_used) = match completion {
            Ok(output) => output,
            Err(err) if err.is_aborted() => {
                // stop() already finalised the session; cancellation is
                // terminal and silent, and no partial is appended.
                return TurnOutcome::Halt;
            }
            Err(err) => {
                if log::log_enabled!(log::Level::Error) {
                    log::error!("turn {} ({}) failed: {}", turn_number, winner, err);
                }
                Self::emit(
                    &handler,
                    CouncilEvent::Error {
                        agent: Some(winner),
                        code: None,
                        message: err.to_string(),
                    },
                )
                .await;
                return TurnOutcome::Continue;
            }
        };

        if final_text.is_empty() {
            Self::emit(
                &handler,
                CouncilEvent::Error {
                    agent: Some(winner),
                    code: Some("empty_completion".to_string()),
                    message: "provider returned an empty reply".to_string(),
                },
            )
            .await;
            return TurnOutcome::Continue;
        }

        // Phase 3 (locked): append, account, re-evaluate conflict.
        let mut inner = self.inner.lock().await;
        let mut message = Message::from_agent(winner, &final_text).with_meta(MessageMeta {
            model: model_used,
            latency_ms: Some(turn_latency_ms),
            bid_score: Some(winning_score),
        });
        message.id = message_id;
        message.usage = Some(usage);
        inner.state.messages.push(message.clone());
        inner.state.turn += 1;
        inner.fairness.record(winner);

        let model = inner
            .state
            .agent(winner)
            .map(|a| a.model.clone())
            .unwrap_or_default();
        inner.state.cost.record(winner, &model, usage);
        let cost = inner.state.cost.clone();

        let detector = ConflictDetector::new(
            inner.state.config.conflict_window,
            inner.state.config.conflict_threshold,
        );
        let roster: Vec<AgentId> = inner.state.agents.iter().map(|a| a.id).collect();
        let scan = detector.evaluate_all(&inner.state.messages, &roster);
        let strongest = scan.strongest.clone();

        let mut opened = None;
        if !exchange_was_active {
            if let Some(record) = strongest.as_ref().filter(|r| r.is_active()) {
                let exchange =
                    DyadicExchange::new(record.pair, inner.state.config.exchange_turns);
                opened = Some((record.clone(), exchange.clone()));
                inner.state.conflict = Some(record.clone());
                inner.state.exchange = Some(exchange);
            }
        }

        let mut ended = None;
        if exchange_was_active {
            if let Some(exchange) = &mut inner.state.exchange {
                if exchange.decrement() == 0 {
                    ended = Some(exchange.pair);
                    inner.state.exchange = None;
                    inner.state.conflict = None;
                }
            }
        }

        let handler = inner.handler.clone();
        let over_budget = inner
            .state
            .config
            .budget_usd
            .map(|ceiling| inner.state.cost.total_usd >= ceiling)
            .unwrap_or(false);
        drop(inner);

        Self::emit(&handler, CouncilEvent::MessageComplete { message }).await;
        Self::emit(&handler, CouncilEvent::CostUpdated { cost }).await;
        Self::emit(
            &handler,
            CouncilEvent::ConflictUpdated {
                strongest: strongest.clone(),
            },
        )
        .await;
        if let Some((record, exchange)) = opened {
            Self::emit(&handler, CouncilEvent::ConflictDetected { conflict: record }).await;
            Self::emit(
                &handler,
                CouncilEvent::DuologueStarted {
                    pair: exchange.pair,
                    remaining_turns: exchange.remaining_turns,
                },
            )
            .await;
        }
        if let Some(pair) = ended {
            Self::emit(&handler, CouncilEvent::DuologueEnded { pair }).await;
        }

        if over_budget {
            self.complete("budget ceiling reached").await;
            return TurnOutcome::Halt;
        }
        TurnOutcome::Continue
    }

    /// Streaming completion plus the bounded tool-call loop, with the
    /// single Anthropic opus model fallback.
    #[allow(clippy::too_many_arguments)]
    async fn generate_with_tools(
        &self,
        profile: &AgentProfile,
        credentials: &CredentialStore,
        conversation: Vec<ChatTurn>,
        options: CompletionOptions,
        config: &CouncilConfig,
        handler: &Option<Arc<dyn EventHandler>>,
        cancel: &CancellationToken,
        message_id: Uuid,
    ) -> Result<(String, TokenUsage, Option<String>), ProviderError> {
        let Some(adapter) = adapter_for(profile.provider, credentials, self.transport.clone())
        else {
            return Err(ProviderError::Http {
                provider: profile.provider,
                status: 401,
                message: "provider not configured".to_string(),
            });
        };

        let mut profile = profile.clone();
        let first = self
            .stream_once(&*adapter, &profile, &conversation, &options, handler, cancel, message_id)
            .await;

        let mut result = match first {
            Ok(result) => result,
            Err(err)
                if err.is_model_not_found()
                    && profile.provider == ProviderKind::Anthropic
                    && is_opus_family(&profile.model)
                    && profile.model != OPUS_FALLBACK_MODEL =>
            {
                if log::log_enabled!(log::Level::Warn) {
                    log::warn!(
                        "model {} not found; retrying {} with {}",
                        profile.model,
                        profile.id,
                        OPUS_FALLBACK_MODEL
                    );
                }
                profile.model = OPUS_FALLBACK_MODEL.to_string();
                {
                    let mut inner = self.inner.lock().await;
                    if let Some(entry) = inner.state.agent_mut(profile.id) {
                        entry.model = OPUS_FALLBACK_MODEL.to_string();
                    }
                }
                self.stream_once(
                    &*adapter,
                    &profile,
                    &conversation,
                    &options,
                    handler,
                    cancel,
                    message_id,
                )
                .await?
            }
            Err(err) => return Err(err),
        };

        let mut usage = result.usage;
        let mut accumulated = String::new();
        let mut segment = result.content.clone();
        let mut iterations = 0usize;
        let mut base_context = conversation;

        loop {
            let (cleaned, invocations) = extract_directives(&segment);
            let cleaned = cleaned.trim().to_string();
            if !cleaned.is_empty() {
                if !accumulated.is_empty() {
                    accumulated.push_str("\n\n");
                }
                accumulated.push_str(&cleaned);
            }

            let iteration_cap = config
                .max_tool_iterations
                .min(crate::council::oracle::MAX_TOOL_ITERATIONS);
            if invocations.is_empty() || iterations >= iteration_cap {
                break;
            }
            iterations += 1;

            Self::emit(
                handler,
                CouncilEvent::MessageReplace {
                    message_id,
                    content: accumulated.clone(),
                },
            )
            .await;

            let capped = config
                .max_tool_calls_per_iteration
                .min(crate::council::oracle::MAX_TOOL_CALLS_PER_ITERATION);
            let results = dispatch_all(
                self.oracle.clone(),
                &invocations[..invocations.len().min(capped)],
                config.tool_timeout(),
            )
            .await;

            let mut tool_turns = Vec::new();
            for (name, outcome) in &results {
                let rendered = render_result(*name, outcome);
                let tool_message = Message::tool(&rendered);
                {
                    let mut inner = self.inner.lock().await;
                    inner.state.messages.push(tool_message.clone());
                }
                Self::emit(
                    handler,
                    CouncilEvent::MessageComplete {
                        message: tool_message,
                    },
                )
                .await;
                Self::emit(
                    handler,
                    CouncilEvent::OracleResult {
                        tool: name.as_str().to_string(),
                        content: rendered.clone(),
                    },
                )
                .await;
                tool_turns.push(ChatTurn::user(&rendered));
            }

            // Re-issue the completion with this round's cleaned reply plus
            // the tool results as extra user-role context.
            if !cleaned.is_empty() {
                base_context.push(ChatTurn::assistant(&cleaned));
            }
            base_context.extend(tool_turns);

            result = self
                .stream_once(&*adapter, &profile, &base_context, &options, handler, cancel, message_id)
                .await?;
            usage.input_tokens += result.usage.input_tokens;
            usage.output_tokens += result.usage.output_tokens;
            usage.reasoning_tokens += result.usage.reasoning_tokens;
            segment = result.content.clone();
        }

        Ok((
            normalize_whitespace(&accumulated),
            usage,
            Some(profile.model.clone()),
        ))
    }

    /// One streaming completion with chunk events forwarded in order.
    async fn stream_once(
        &self,
        adapter: &dyn ProviderAdapter,
        profile: &AgentProfile,
        conversation: &[ChatTurn],
        options: &CompletionOptions,
        handler: &Option<Arc<dyn EventHandler>>,
        cancel: &CancellationToken,
        message_id: Uuid,
    ) -> Result<CompletionResult, ProviderError> {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
        let forwarder = {
            let handler = handler.clone();
            tokio::spawn(async move {
                while let Some(delta) = rx.recv().await {
                    Self::emit(&handler, CouncilEvent::MessageChunk { message_id, delta }).await;
                }
            })
        };

        let result = {
            let mut on_chunk = |delta: &str| {
                let _ = tx.send(delta.to_string());
            };
            adapter
                .complete_stream(profile, conversation, options, &mut on_chunk, cancel)
                .await
        };
        drop(tx);
        let _ = forwarder.await;
        result
    }

    /// Agent system prompt, a topic framing line, then the trailing
    /// transcript with the speaker's own turns as assistant and everyone
    /// else attributed by name in the user role.
    fn build_context(state: &CouncilState, profile: &AgentProfile) -> Vec<ChatTurn> {
        let mut conversation = vec![ChatTurn::system(&profile.system_prompt)];
        conversation.push(ChatTurn::user(format!(
            "Current topic: {}",
            state.config.topic
        )));

        let tail: Vec<&Message> = state
            .messages
            .iter()
            .filter(|m| {
                // The topic-intro system message is already framed above.
                !(m.source == Source::System && m.content.as_ref() == state.config.topic)
            })
            .collect();
        let start = tail.len().saturating_sub(state.config.context_tail);
        for message in &tail[start..] {
            if message.source.agent() == Some(profile.id) {
                conversation.push(ChatTurn::new(ChatRole::Assistant, &message.content));
            } else {
                conversation.push(ChatTurn::user(format!(
                    "{}: {}",
                    message.source.label(),
                    message.content
                )));
            }
        }
        conversation
    }

    fn completion_options(config: &CouncilConfig, profile: &AgentProfile) -> CompletionOptions {
        CompletionOptions {
            temperature: profile.temperature,
            max_output_tokens: profile.max_output_tokens,
            overall_timeout: config.overall_timeout(),
            idle_timeout: config.idle_timeout(),
            ..Default::default()
        }
    }

    // ── Host control surface ─────────────────────────────────────────────

    /// Append a user message to the transcript.
    pub async fn add_user_message(&self, text: impl AsRef<str>) {
        let message = Message::user(text.as_ref());
        let mut inner = self.inner.lock().await;
        inner.state.messages.push(message.clone());
        let handler = inner.handler.clone();
        drop(inner);
        Self::emit(&handler, CouncilEvent::MessageComplete { message }).await;
    }

    /// Append an externally produced record verbatim.  Agent-sourced
    /// records count as turns so the transcript invariants keep holding.
    pub async fn add_external_message(&self, message: Message) {
        let mut inner = self.inner.lock().await;
        if let Some(agent) = message.source.agent() {
            inner.state.turn += 1;
            inner.fairness.record(agent);
        }
        inner.state.messages.push(message.clone());
        let handler = inner.handler.clone();
        drop(inner);
        Self::emit(&handler, CouncilEvent::MessageComplete { message }).await;
    }

    /// Make a specific agent take one turn immediately.
    pub async fn trigger_agent(&self, id: AgentId) -> Result<(), CouncilError> {
        {
            let inner = self.inner.lock().await;
            let Some(profile) = inner.state.agent(id) else {
                return Err(CouncilError::UnknownAgent(id));
            };
            if !inner.credentials.is_configured(profile.provider) {
                return Err(CouncilError::NoEligibleProviders);
            }
        }
        self.run_turn(Some(id)).await;
        Ok(())
    }

    /// Record a private whisper, depositing any bid bonus it carries.
    pub async fn send_whisper(&self, from: AgentId, to: AgentId, payload: WhisperPayload) {
        let mut inner = self.inner.lock().await;
        inner.state.whisper.send(from, to, payload);
        let handler = inner.handler.clone();
        drop(inner);
        Self::emit(&handler, CouncilEvent::WhisperSent { from, to }).await;
    }

    /// Ask the oracle directly; the result lands in the transcript as a
    /// tool message.
    pub async fn query_oracle(&self, query: impl AsRef<str>) {
        let timeout = {
            let inner = self.inner.lock().await;
            inner.state.config.tool_timeout()
        };
        let call = self.oracle.search(query.as_ref());
        let outcome = tokio::time::timeout(timeout, call)
            .await
            .unwrap_or(Err(crate::council::oracle::OracleError::Timeout(timeout)));
        let rendered = render_result(ToolName::Search, &outcome);

        let message = Message::tool(&rendered);
        let mut inner = self.inner.lock().await;
        inner.state.messages.push(message.clone());
        let handler = inner.handler.clone();
        drop(inner);
        Self::emit(
            &handler,
            CouncilEvent::OracleResult {
                tool: ToolName::Search.as_str().to_string(),
                content: rendered,
            },
        )
        .await;
        Self::emit(&handler, CouncilEvent::MessageComplete { message }).await;
    }

    /// Patch one roster entry.
    pub async fn update_agent(&self, id: AgentId, patch: AgentPatch) -> Result<(), CouncilError> {
        let mut inner = self.inner.lock().await;
        match inner.state.agent_mut(id) {
            Some(profile) => {
                patch.apply(profile);
                Ok(())
            }
            None => Err(CouncilError::UnknownAgent(id)),
        }
    }

    /// Merge a credential patch; consumed from the next turn on.
    pub async fn update_credentials(&self, patch: CredentialPatch) {
        self.inner.lock().await.credentials.apply(patch);
    }

    /// Probe one provider with a minimal completion.
    pub async fn test_connection(&self, provider: ProviderKind) -> bool {
        let credentials = self.inner.lock().await.credentials.clone();
        match adapter_for(provider, &credentials, self.transport.clone()) {
            Some(adapter) => adapter.test_connection().await,
            None => false,
        }
    }

    /// Immutable snapshot for host rendering.
    pub async fn snapshot(&self) -> CouncilState {
        self.inner.lock().await.state.clone()
    }

    /// Serialise the whole session as JSON.
    pub async fn export_state(&self) -> Result<String, CouncilError> {
        let inner = self.inner.lock().await;
        Ok(serde_json::to_string(&inner.state)?)
    }

    /// Replace the session with an exported blob.  Derived managers are
    /// rebuilt from the embedded state; missing fields default.
    pub async fn import_state(&self, blob: &str) -> Result<(), CouncilError> {
        let state: CouncilState = serde_json::from_str(blob)?;
        let mut inner = self.inner.lock().await;
        inner.fairness = FairnessManager::rebuild(
            state.config.fairness_window,
            state.config.fairness_cap,
            &state.messages,
        );
        inner.cancel = CancellationToken::new();
        inner.state = state;
        Ok(())
    }
}

/// CRLF to LF, collapse runs of blank lines, trim the ends.
pub fn normalize_whitespace(text: &str) -> String {
    let unified = text.replace("\r\n", "\n");
    let mut collapsed = String::with_capacity(unified.len());
    let mut blank_run = 0usize;
    for line in unified.split('\n') {
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        collapsed.push_str(line);
        collapsed.push('\n');
    }
    collapsed.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitespace_normalisation_collapses_blank_runs() {
        let raw = "First line\r\n\r\n\r\n\r\nSecond line\n\n\nThird\n\n";
        assert_eq!(
            normalize_whitespace(raw),
            "First line\n\nSecond line\n\nThird"
        );
    }

    #[test]
    fn whitespace_normalisation_trims_edges() {
        assert_eq!(normalize_whitespace("\n\n  \nhello\n \n"), "hello");
        assert_eq!(normalize_whitespace(""), "");
    }
}
