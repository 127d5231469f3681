//! The event stream a host shell renders.
//!
//! Events are emitted synchronously from the orchestrator loop and hand
//! subscribers immutable snapshots; nothing received through a
//! [`CouncilEvent`] is ever mutated afterwards.  The union is serialisable
//! (internally tagged, snake_case) so a host can forward events over IPC
//! verbatim.
//!
//! # Per-turn ordering
//!
//! ```text
//! bidding_complete
//! turn_started
//!   └─ message_replace* / message_chunk*
//!   └─ message_complete (source = tool)*        — oracle round-trips
//!   └─ message_complete (agent)
//! cost_updated
//! conflict_updated [conflict_detected] [duologue_started | duologue_ended]
//! ```

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::council::conflict::ConflictRecord;
use crate::council::cost::CostBreakdown;
use crate::council::state::{AgentId, Message};

/// Raw and adjusted bid numbers for one agent in one round.
#[derive(Debug, Clone, Serialize)]
pub struct BidScore {
    pub raw: f64,
    pub adjustment: f64,
    pub adjusted: f64,
}

/// Everything the engine reports to its host.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CouncilEvent {
    CouncilStarted {
        session_id: Uuid,
        topic: String,
    },
    CouncilPaused,
    CouncilCompleted {
        reason: String,
    },
    BiddingComplete {
        turn: usize,
        scores: HashMap<AgentId, BidScore>,
        winner: AgentId,
    },
    TurnStarted {
        turn: usize,
        agent: AgentId,
        message_id: Uuid,
    },
    MessageChunk {
        message_id: Uuid,
        delta: String,
    },
    /// The in-progress buffer was rewritten (tool directives stripped).
    MessageReplace {
        message_id: Uuid,
        content: String,
    },
    MessageComplete {
        message: Message,
    },
    CostUpdated {
        cost: CostBreakdown,
    },
    ConflictUpdated {
        strongest: Option<ConflictRecord>,
    },
    ConflictDetected {
        conflict: ConflictRecord,
    },
    DuologueStarted {
        pair: (AgentId, AgentId),
        remaining_turns: u32,
    },
    DuologueEnded {
        pair: (AgentId, AgentId),
    },
    OracleResult {
        tool: String,
        content: String,
    },
    WhisperSent {
        from: AgentId,
        to: AgentId,
    },
    Error {
        agent: Option<AgentId>,
        code: Option<String>,
        message: String,
    },
}

/// Trait for receiving council events.
///
/// The default implementation is a no-op, so hosts override only what they
/// render.  Handlers are shared as `Arc<dyn EventHandler>` across the
/// orchestrator's tasks; internal state needs its own synchronisation.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_event(&self, _event: &CouncilEvent) {}
}

/// Handler that records every event; ships with the crate because both the
/// test-suite and simple hosts want it.
#[derive(Default)]
pub struct RecordingHandler {
    events: tokio::sync::Mutex<Vec<CouncilEvent>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<CouncilEvent> {
        self.events.lock().await.clone()
    }

    /// Just the tag names, in emission order.
    pub async fn kinds(&self) -> Vec<&'static str> {
        self.events.lock().await.iter().map(event_kind).collect()
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn on_event(&self, event: &CouncilEvent) {
        self.events.lock().await.push(event.clone());
    }
}

/// Stable tag name of an event, matching its serialised `type` field.
pub fn event_kind(event: &CouncilEvent) -> &'static str {
    match event {
        CouncilEvent::CouncilStarted { .. } => "council_started",
        CouncilEvent::CouncilPaused => "council_paused",
        CouncilEvent::CouncilCompleted { .. } => "council_completed",
        CouncilEvent::BiddingComplete { .. } => "bidding_complete",
        CouncilEvent::TurnStarted { .. } => "turn_started",
        CouncilEvent::MessageChunk { .. } => "message_chunk",
        CouncilEvent::MessageReplace { .. } => "message_replace",
        CouncilEvent::MessageComplete { .. } => "message_complete",
        CouncilEvent::CostUpdated { .. } => "cost_updated",
        CouncilEvent::ConflictUpdated { .. } => "conflict_updated",
        CouncilEvent::ConflictDetected { .. } => "conflict_detected",
        CouncilEvent::DuologueStarted { .. } => "duologue_started",
        CouncilEvent::DuologueEnded { .. } => "duologue_ended",
        CouncilEvent::OracleResult { .. } => "oracle_result",
        CouncilEvent::WhisperSent { .. } => "whisper_sent",
        CouncilEvent::Error { .. } => "error",
    }
}
