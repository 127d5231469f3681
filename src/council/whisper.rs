//! Private inter-agent whispers and their bid bonuses.
//!
//! Whispers never enter the transcript; their only influence on the debate
//! is the pending-bonus accumulator, which the bidding engine drains once
//! per round.  Bonuses accumulate and are clamped to [0, 20] at every
//! mutation, so the invariant holds across any interleaving of sends and
//! consumes.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::council::state::AgentId;

pub const MAX_PENDING_BONUS: f64 = 20.0;

/// Host-facing whisper payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhisperPayload {
    pub content: String,
    #[serde(default)]
    pub bid_bonus: Option<f64>,
}

impl WhisperPayload {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            bid_bonus: None,
        }
    }

    pub fn with_bid_bonus(mut self, bonus: f64) -> Self {
        self.bid_bonus = Some(bonus);
        self
    }
}

/// One recorded whisper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhisperRecord {
    pub from: AgentId,
    pub to: AgentId,
    pub content: String,
    #[serde(default)]
    pub bid_bonus: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

/// Whisper log plus the pending-bonus accumulator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WhisperState {
    #[serde(default)]
    pub log: Vec<WhisperRecord>,
    #[serde(default)]
    pending: HashMap<AgentId, f64>,
}

impl WhisperState {
    pub fn send(&mut self, from: AgentId, to: AgentId, payload: WhisperPayload) {
        if let Some(bonus) = payload.bid_bonus {
            let entry = self.pending.entry(to).or_insert(0.0);
            *entry = (*entry + bonus).clamp(0.0, MAX_PENDING_BONUS);
        }
        self.log.push(WhisperRecord {
            from,
            to,
            content: payload.content,
            bid_bonus: payload.bid_bonus,
            timestamp: Utc::now(),
        });
    }

    pub fn pending_for(&self, agent: AgentId) -> f64 {
        self.pending.get(&agent).copied().unwrap_or(0.0)
    }

    /// Snapshot the accumulator and zero it.  The snapshot feeds exactly
    /// one bidding round.
    pub fn consume_bonuses(&mut self) -> HashMap<AgentId, f64> {
        std::mem::take(&mut self.pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bonuses_accumulate_then_clamp() {
        let mut state = WhisperState::default();
        state.send(
            AgentId::G,
            AgentId::C,
            WhisperPayload::new("back me up").with_bid_bonus(12.0),
        );
        state.send(
            AgentId::F,
            AgentId::C,
            WhisperPayload::new("you should speak").with_bid_bonus(15.0),
        );
        assert_eq!(state.pending_for(AgentId::C), MAX_PENDING_BONUS);
        assert_eq!(state.log.len(), 2);
    }

    #[test]
    fn negative_bonus_cannot_push_below_zero() {
        let mut state = WhisperState::default();
        state.send(
            AgentId::G,
            AgentId::S,
            WhisperPayload::new("stay quiet").with_bid_bonus(-7.0),
        );
        assert_eq!(state.pending_for(AgentId::S), 0.0);
    }

    #[test]
    fn consume_zeroes_the_accumulator() {
        let mut state = WhisperState::default();
        state.send(
            AgentId::G,
            AgentId::H,
            WhisperPayload::new("jump in").with_bid_bonus(5.0),
        );

        let snapshot = state.consume_bonuses();
        assert_eq!(snapshot[&AgentId::H], 5.0);
        assert_eq!(state.pending_for(AgentId::H), 0.0);

        // A bonus deposited after the snapshot is a fresh accumulation.
        state.send(
            AgentId::C,
            AgentId::H,
            WhisperPayload::new("again").with_bid_bonus(3.0),
        );
        assert_eq!(state.pending_for(AgentId::H), 3.0);
    }

    #[test]
    fn whisper_without_bonus_only_logs() {
        let mut state = WhisperState::default();
        state.send(AgentId::F, AgentId::G, WhisperPayload::new("fyi"));
        assert_eq!(state.pending_for(AgentId::G), 0.0);
        assert_eq!(state.log.len(), 1);
        assert!(state.log[0].bid_bonus.is_none());
    }
}
