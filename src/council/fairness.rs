//! Sliding-window fairness adjustments.
//!
//! A FIFO ring of the most recent speakers feeds additive score
//! adjustments that are applied on top of the raw bids: a hard suppressor
//! against back-to-back turns, a penalty once an agent hits the per-window
//! cap, and catch-up bonuses for agents the window has barely heard from.
//! Adjustments stack.

use std::collections::{HashMap, VecDeque};

use crate::council::state::{AgentId, Message};

pub const BACK_TO_BACK_PENALTY: f64 = -100.0;
pub const CAP_PENALTY: f64 = -80.0;
pub const UNHEARD_BONUS: f64 = 60.0;
pub const RARELY_HEARD_BONUS: f64 = 30.0;

/// Window fill level below which the catch-up bonuses stay off.
const BONUS_WARMUP: usize = 5;

#[derive(Debug, Clone)]
pub struct FairnessManager {
    window: VecDeque<AgentId>,
    capacity: usize,
    cap: usize,
}

impl FairnessManager {
    pub fn new(capacity: usize, cap: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            cap: cap.max(1),
        }
    }

    /// Rebuild the window from a restored transcript tail.
    pub fn rebuild(capacity: usize, cap: usize, messages: &[Message]) -> Self {
        let mut manager = Self::new(capacity, cap);
        for speaker in messages.iter().filter_map(|m| m.source.agent()) {
            manager.record(speaker);
        }
        manager
    }

    pub fn record(&mut self, speaker: AgentId) {
        self.window.push_back(speaker);
        while self.window.len() > self.capacity {
            self.window.pop_front();
        }
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    /// Additive adjustment for one eligible agent.
    pub fn adjustment_for(&self, agent: AgentId) -> f64 {
        let mut adjustment = 0.0;
        if self.window.back() == Some(&agent) {
            adjustment += BACK_TO_BACK_PENALTY;
        }

        let count = self.window.iter().filter(|&&s| s == agent).count();
        if count >= self.cap {
            adjustment += CAP_PENALTY;
        }

        if self.window.len() >= BONUS_WARMUP {
            match count {
                0 => adjustment += UNHEARD_BONUS,
                1 => adjustment += RARELY_HEARD_BONUS,
                _ => {}
            }
        }

        adjustment
    }

    pub fn adjustments(&self, eligible: &[AgentId]) -> HashMap<AgentId, f64> {
        eligible
            .iter()
            .map(|&agent| (agent, self.adjustment_for(agent)))
            .collect()
    }
}
