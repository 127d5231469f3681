//! Speaker selection: the bidding round.
//!
//! Each eligible agent produces an ephemeral [`Bid`] from transcript
//! signals — how long it has been quiet, how often it was just mentioned,
//! a stable per-(agent, topic) disposition — plus the whisper bonus
//! deposited by its peers.  The weighted total, after fairness
//! adjustments, decides who speaks.
//!
//! The per-session disposition comes from hashing the (agent, topic) pair:
//! the same agent keeps the same assertiveness for a whole debate without
//! any role being hard-coded.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::council::state::{AgentId, Message};

const URGENCY_WEIGHT: f64 = 0.4;
const RELEVANCE_WEIGHT: f64 = 0.3;
const CONFIDENCE_WEIGHT: f64 = 0.2;
const WHISPER_WEIGHT: f64 = 0.1;

/// How many trailing transcript messages count as "recent" for mention
/// and question scanning.
const RECENT_SPAN: usize = 5;

/// One agent's signals for a single round.  Ephemeral; never serialised.
#[derive(Debug, Clone)]
pub struct Bid {
    pub urgency: f64,
    pub relevance: f64,
    pub confidence: f64,
    pub whisper_bonus: f64,
    pub timestamp: DateTime<Utc>,
}

/// A bid together with its weighted raw score.
#[derive(Debug, Clone)]
pub struct ScoredBid {
    pub agent: AgentId,
    pub bid: Bid,
    pub score: f64,
}

/// Deterministic 0..1 disposition for an (agent, topic) pair.
pub fn stable_jitter(agent: AgentId, topic: &str) -> f64 {
    let digest = Sha256::digest(format!("{}:{}", agent.as_str(), topic).as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head) as f64 / u64::MAX as f64
}

/// Count mentions of `agent` in one message, case-insensitively: nickname
/// substrings plus the bare symbol as a standalone token.
fn mentions_in(text: &str, agent: AgentId) -> usize {
    let lowered = text.to_lowercase();
    let nickname = agent.nickname().to_lowercase();
    let by_name = lowered.matches(&nickname).count();
    let symbol = agent.as_str().to_lowercase();
    let by_symbol = lowered
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| *token == symbol)
        .count();
    by_name + by_symbol
}

pub struct BiddingEngine {
    random_max: f64,
}

impl BiddingEngine {
    pub fn new(random_max: f64) -> Self {
        Self {
            random_max: random_max.max(0.0),
        }
    }

    /// Produce raw scored bids for every eligible agent.
    pub fn collect<R: Rng>(
        &self,
        eligible: &[AgentId],
        messages: &[Message],
        topic: &str,
        bonuses: &HashMap<AgentId, f64>,
        rng: &mut R,
    ) -> Vec<ScoredBid> {
        let agent_messages: Vec<&Message> = messages
            .iter()
            .filter(|m| m.source.agent().is_some())
            .collect();
        let recent: Vec<&Message> = messages.iter().rev().take(RECENT_SPAN).collect();
        let recent_has_question = recent.iter().any(|m| m.content.contains('?'));

        eligible
            .iter()
            .map(|&agent| {
                // Distance since this agent last spoke, in agent turns.  An
                // agent that never spoke is treated as having spoken before
                // the log began.
                let since_last = agent_messages
                    .iter()
                    .rposition(|m| m.source.agent() == Some(agent))
                    .map(|idx| agent_messages.len() - idx - 1)
                    .unwrap_or(agent_messages.len());
                let urgency = (20.0 + 15.0 * since_last as f64).clamp(0.0, 100.0);

                let mentions: usize = recent
                    .iter()
                    .map(|m| mentions_in(&m.content, agent))
                    .sum();
                let relevance = (30.0
                    + 20.0 * mentions as f64
                    + rng.gen_range(0.0..30.0))
                .clamp(0.0, 100.0);

                let confidence = (45.0
                    + if recent_has_question { 8.0 } else { 0.0 }
                    + 12.0 * mentions as f64
                    + 15.0 * stable_jitter(agent, topic)
                    + rng.gen_range(0.0..15.0))
                .clamp(0.0, 100.0);

                let whisper_bonus = bonuses
                    .get(&agent)
                    .copied()
                    .unwrap_or(0.0)
                    .clamp(0.0, crate::council::whisper::MAX_PENDING_BONUS);

                let score = URGENCY_WEIGHT * urgency
                    + RELEVANCE_WEIGHT * relevance
                    + CONFIDENCE_WEIGHT * confidence
                    + WHISPER_WEIGHT * whisper_bonus
                    + if self.random_max > 0.0 {
                        rng.gen_range(0.0..self.random_max)
                    } else {
                        0.0
                    };

                ScoredBid {
                    agent,
                    bid: Bid {
                        urgency,
                        relevance,
                        confidence,
                        whisper_bonus,
                        timestamp: Utc::now(),
                    },
                    score,
                }
            })
            .collect()
    }
}

/// Winner by adjusted score; ties resolve to the earliest entry.
pub fn pick_winner(adjusted: &[(AgentId, f64)]) -> Option<AgentId> {
    let mut best: Option<(AgentId, f64)> = None;
    for &(agent, score) in adjusted {
        match best {
            Some((_, top)) if score <= top => {}
            _ => best = Some((agent, score)),
        }
    }
    best.map(|(agent, _)| agent)
}
