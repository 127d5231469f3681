//! Pairwise tension detection and the dyadic exchange it can trigger.
//!
//! After every appended agent message the detector rescans a recent window
//! of the transcript and scores each unordered agent pair on a 0..100
//! scale.  The score grows with disagreement-marker density, sustained
//! back-and-forth between the two, and implicit contradiction (a negation
//! aimed at overlapping vocabulary); cooperative language late in the
//! window cools it back down.  The strongest pair above the configured
//! threshold becomes the session's active conflict, which opens a bounded
//! two-speaker exchange.
//!
//! Scoring is a pure function of the transcript: re-evaluating an
//! unchanged window returns identical scores.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::council::state::{AgentId, Message};

/// Words that signal pushback when they appear as standalone tokens.
const DISAGREEMENT_TOKENS: &[&str] = &[
    "disagree",
    "disagrees",
    "disagreed",
    "incorrect",
    "wrong",
    "refute",
    "refutes",
    "refuted",
    "unsupported",
    "flawed",
    "mistaken",
    "false",
    "cannot",
    "doubt",
    "dispute",
    "disputes",
    "contradict",
    "contradicts",
    "however",
    "nonsense",
    "implausible",
    "fails",
    "fail",
];

/// Negation tokens used for the implicit-contradiction check.
const NEGATION_TOKENS: &[&str] = &["not", "cannot", "no", "never", "nor"];

/// Cooperative single-token markers.
const COOPERATIVE_TOKENS: &[&str] = &["agree", "agreed", "concur"];

/// Cooperative multi-word phrases, matched on the lowercased text.
const COOPERATIVE_PHRASES: &[&str] = &[
    "fair point",
    "good point",
    "valid point",
    "makes sense",
    "well said",
    "you're right",
];

const MAX_DENSITY: f64 = 2.0;
const MARKER_SPAN: f64 = 40.0;
const ALTERNATION_SPAN: f64 = 25.0;
const CONTRADICTION_STEP: f64 = 7.5;
const CONTRADICTION_CAP: f64 = 20.0;
const COOPERATIVE_DECAY: f64 = 12.0;

/// Tension between one unordered agent pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    /// Normalised so `pair.0 <= pair.1`.
    pub pair: (AgentId, AgentId),
    /// 0..100.
    pub score: f64,
    pub threshold: f64,
    pub evaluated_at: DateTime<Utc>,
}

impl ConflictRecord {
    pub fn is_active(&self) -> bool {
        self.score >= self.threshold
    }

    pub fn involves(&self, agent: AgentId) -> bool {
        self.pair.0 == agent || self.pair.1 == agent
    }
}

/// A bounded run of turns restricted to a conflicting pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DyadicExchange {
    pub pair: (AgentId, AgentId),
    pub remaining_turns: u32,
    /// Baseline policy: outsiders sit the exchange out.
    #[serde(default)]
    pub outsiders_may_bid: bool,
}

impl DyadicExchange {
    pub fn new(pair: (AgentId, AgentId), turns: u32) -> Self {
        Self {
            pair: normalise(pair),
            remaining_turns: turns,
            outsiders_may_bid: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.remaining_turns > 0
    }

    /// Consume one turn; returns the remaining count.
    pub fn decrement(&mut self) -> u32 {
        self.remaining_turns = self.remaining_turns.saturating_sub(1);
        self.remaining_turns
    }

    pub fn participants(&self) -> [AgentId; 2] {
        [self.pair.0, self.pair.1]
    }
}

/// Result of a full pairwise scan.
#[derive(Debug, Clone)]
pub struct ConflictScan {
    pub pairs: Vec<ConflictRecord>,
    pub strongest: Option<ConflictRecord>,
}

fn normalise(pair: (AgentId, AgentId)) -> (AgentId, AgentId) {
    if pair.0 <= pair.1 {
        pair
    } else {
        (pair.1, pair.0)
    }
}

fn tokens(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn disagreement_hits(text: &str) -> usize {
    tokens(text)
        .iter()
        .filter(|t| DISAGREEMENT_TOKENS.contains(&t.as_str()))
        .count()
}

fn has_negation(text: &str) -> bool {
    text.to_lowercase().contains("n't")
        || tokens(text)
            .iter()
            .any(|t| NEGATION_TOKENS.contains(&t.as_str()))
}

fn cooperative_hits(text: &str) -> usize {
    let lowered = text.to_lowercase();
    let phrase_hits = COOPERATIVE_PHRASES
        .iter()
        .filter(|p| lowered.contains(*p))
        .count();
    let token_hits = tokens(text)
        .iter()
        .filter(|t| COOPERATIVE_TOKENS.contains(&t.as_str()))
        .count();
    phrase_hits + token_hits
}

/// Content words used for the lexical-overlap check.
fn content_words(text: &str) -> HashSet<String> {
    tokens(text).into_iter().filter(|t| t.len() > 3).collect()
}

pub struct ConflictDetector {
    window: usize,
    threshold: f64,
}

impl ConflictDetector {
    pub fn new(window: usize, threshold: f64) -> Self {
        Self {
            window: window.max(2),
            threshold,
        }
    }

    /// The agent messages currently inside the evaluation window.
    fn window_of<'a>(&self, messages: &'a [Message]) -> Vec<&'a Message> {
        let agent_messages: Vec<&Message> = messages
            .iter()
            .filter(|m| m.source.agent().is_some())
            .collect();
        let start = agent_messages.len().saturating_sub(self.window);
        agent_messages[start..].to_vec()
    }

    /// Score one unordered pair, or `None` when either agent is silent in
    /// the window.
    pub fn evaluate(&self, messages: &[Message], pair: (AgentId, AgentId)) -> Option<ConflictRecord> {
        let pair = normalise(pair);
        let window = self.window_of(messages);
        if window.is_empty() {
            return None;
        }

        let pair_msgs: Vec<(usize, &Message)> = window
            .iter()
            .enumerate()
            .filter(|(_, m)| {
                m.source.agent() == Some(pair.0) || m.source.agent() == Some(pair.1)
            })
            .map(|(i, m)| (i, *m))
            .collect();

        let spoke_a = pair_msgs
            .iter()
            .any(|(_, m)| m.source.agent() == Some(pair.0));
        let spoke_b = pair_msgs
            .iter()
            .any(|(_, m)| m.source.agent() == Some(pair.1));
        if !spoke_a || !spoke_b {
            return None;
        }

        // Disagreement-marker density across the pair's messages.
        let hits: usize = pair_msgs
            .iter()
            .map(|(_, m)| disagreement_hits(&m.content))
            .sum();
        let density = hits as f64 / pair_msgs.len() as f64;
        let marker_score = (density.min(MAX_DENSITY) / MAX_DENSITY) * MARKER_SPAN;

        // Back-and-forth: how strictly the two alternate, weighted by how
        // much of the window the pair dominates.
        let alternation_score = if pair_msgs.len() >= 2 {
            let changes = pair_msgs
                .windows(2)
                .filter(|w| w[0].1.source != w[1].1.source)
                .count();
            let ratio = changes as f64 / (pair_msgs.len() - 1) as f64;
            let share = pair_msgs.len() as f64 / window.len() as f64;
            ratio * share * ALTERNATION_SPAN
        } else {
            0.0
        };

        // Implicit contradiction: a negation that reuses the previous
        // speaker's vocabulary.
        let mut contradiction_score: f64 = 0.0;
        for adjacent in pair_msgs.windows(2) {
            let (_, prev) = adjacent[0];
            let (_, cur) = adjacent[1];
            if prev.source == cur.source {
                continue;
            }
            if has_negation(&cur.content) {
                let overlap = content_words(&prev.content)
                    .intersection(&content_words(&cur.content))
                    .count();
                if overlap >= 1 {
                    contradiction_score += CONTRADICTION_STEP;
                }
            }
        }
        contradiction_score = contradiction_score.min(CONTRADICTION_CAP);

        // Cooling: cooperative language in the later part of the window.
        let midpoint = window.len() / 2;
        let cooling: usize = pair_msgs
            .iter()
            .filter(|(idx, _)| *idx >= midpoint)
            .map(|(_, m)| cooperative_hits(&m.content))
            .sum();
        let decay = cooling as f64 * COOPERATIVE_DECAY;

        let score =
            (marker_score + alternation_score + contradiction_score - decay).clamp(0.0, 100.0);

        Some(ConflictRecord {
            pair,
            score,
            threshold: self.threshold,
            evaluated_at: Utc::now(),
        })
    }

    /// Score every unordered pair and surface the strongest.
    pub fn evaluate_all(&self, messages: &[Message], agents: &[AgentId]) -> ConflictScan {
        let mut pairs = Vec::new();
        for (i, &a) in agents.iter().enumerate() {
            for &b in &agents[i + 1..] {
                if let Some(record) = self.evaluate(messages, (a, b)) {
                    pairs.push(record);
                }
            }
        }
        let strongest = pairs
            .iter()
            .cloned()
            .max_by(|x, y| x.score.partial_cmp(&y.score).unwrap_or(std::cmp::Ordering::Equal));
        ConflictScan { pairs, strongest }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transcript(entries: &[(AgentId, &str)]) -> Vec<Message> {
        entries
            .iter()
            .map(|(agent, text)| Message::from_agent(*agent, *text))
            .collect()
    }

    fn hot_exchange() -> Vec<Message> {
        transcript(&[
            (AgentId::G, "I disagree with that framing."),
            (AgentId::S, "That seems incorrect and unsupported."),
            (AgentId::G, "However, the evidence suggests otherwise."),
            (AgentId::S, "I still refute that claim."),
        ])
    }

    #[test]
    fn sustained_disagreement_crosses_threshold() {
        let detector = ConflictDetector::new(6, 50.0);
        let record = detector
            .evaluate(&hot_exchange(), (AgentId::G, AgentId::S))
            .unwrap();
        assert!(record.score >= 50.0, "score was {}", record.score);
        assert!(record.is_active());

        let scan = detector.evaluate_all(&hot_exchange(), &AgentId::ALL);
        assert_eq!(
            scan.strongest.unwrap().pair,
            (AgentId::G, AgentId::S)
        );
    }

    #[test]
    fn cooperative_cooldown_decays_score() {
        let detector = ConflictDetector::new(6, 50.0);
        let hot_score = detector
            .evaluate(&hot_exchange(), (AgentId::G, AgentId::S))
            .unwrap()
            .score;

        let mut messages = hot_exchange();
        for (agent, text) in [
            (AgentId::G, "Fair point, actually."),
            (AgentId::S, "Agreed, that holds."),
            (AgentId::G, "Concur with the last remark."),
            (AgentId::S, "Fair point again."),
            (AgentId::G, "Agreed on the substance."),
            (AgentId::S, "Concur entirely."),
        ] {
            messages.push(Message::from_agent(agent, text));
        }

        let cooled = detector
            .evaluate(&messages, (AgentId::G, AgentId::S))
            .unwrap()
            .score;
        assert!(cooled < hot_score, "cooled {} vs hot {}", cooled, hot_score);
        assert!(cooled < 75.0);
    }

    #[test]
    fn negation_with_overlap_outscores_plain_antonym() {
        let detector = ConflictDetector::new(6, 50.0);
        let base = (AgentId::G, "The budget constraint implies feasibility here.");

        let variant_a = transcript(&[
            base,
            (
                AgentId::S,
                "That cannot imply feasibility, it fails in most markets.",
            ),
        ]);
        let variant_b = transcript(&[
            base,
            (
                AgentId::S,
                "That implies infeasibility, it fails in most markets.",
            ),
        ]);

        let score_a = detector
            .evaluate(&variant_a, (AgentId::G, AgentId::S))
            .unwrap()
            .score;
        let score_b = detector
            .evaluate(&variant_b, (AgentId::G, AgentId::S))
            .unwrap()
            .score;
        assert!(score_a > score_b, "a {} vs b {}", score_a, score_b);
    }

    #[test]
    fn evaluation_is_idempotent() {
        let detector = ConflictDetector::new(8, 50.0);
        let messages = hot_exchange();
        let first = detector.evaluate_all(&messages, &AgentId::ALL);
        let second = detector.evaluate_all(&messages, &AgentId::ALL);
        let scores = |scan: &ConflictScan| -> Vec<(AgentId, AgentId, f64)> {
            scan.pairs
                .iter()
                .map(|r| (r.pair.0, r.pair.1, r.score))
                .collect()
        };
        assert_eq!(scores(&first), scores(&second));
    }

    #[test]
    fn silent_pair_yields_none() {
        let detector = ConflictDetector::new(6, 50.0);
        assert!(detector
            .evaluate(&hot_exchange(), (AgentId::C, AgentId::F))
            .is_none());
        assert!(detector
            .evaluate(&hot_exchange(), (AgentId::G, AgentId::C))
            .is_none());
    }

    #[test]
    fn exchange_counts_down_and_ends() {
        let mut exchange = DyadicExchange::new((AgentId::S, AgentId::G), 3);
        assert_eq!(exchange.pair, (AgentId::G, AgentId::S));
        assert!(!exchange.outsiders_may_bid);
        assert!(exchange.is_active());
        assert_eq!(exchange.decrement(), 2);
        assert_eq!(exchange.decrement(), 1);
        assert_eq!(exchange.decrement(), 0);
        assert!(!exchange.is_active());
        assert_eq!(exchange.decrement(), 0);
    }
}
