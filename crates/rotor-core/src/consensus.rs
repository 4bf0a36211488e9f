//! Multi-agent answer reconciliation.
//!
//! Each agent (provider) returns an [`AgentResult`]. The [`ConfidenceScorer`]
//! adjusts the self-reported confidence, then [`ConsensusEngine`] groups the
//! answers by normalized text and picks the group with the most votes, ties
//! broken by mean confidence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// One agent's answer for a single solve request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentResult {
    pub agent_id: String,
    pub answer: String,
    pub confidence: f64,
    #[serde(with = "duration_ms")]
    pub solve_time: Duration,
    pub method: String,
    pub timestamp: DateTime<Utc>,
}

impl AgentResult {
    pub fn new(agent_id: impl Into<String>, answer: impl Into<String>, confidence: f64) -> Self {
        Self {
            agent_id: agent_id.into(),
            answer: answer.into(),
            confidence,
            solve_time: Duration::ZERO,
            method: "provider".to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// What the caller should do with the reconciled answer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConsensusAction {
    /// Agreement is strong enough to submit directly.
    Submit,
    /// A winner exists but agreement or confidence is weak.
    Review,
    /// Nothing usable; fall back to another strategy.
    Fallback,
}

/// Votes and mean scored confidence for one normalized answer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VoteTally {
    pub count: usize,
    pub confidence: f64,
    pub agents: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConsensusDecision {
    pub action: ConsensusAction,
    pub reason: String,
    pub answer: Option<String>,
    pub confidence: f64,
    pub voting_pattern: BTreeMap<String, VoteTally>,
}

/// Adjusts an agent's self-reported confidence.
#[derive(Clone, Debug)]
pub struct ConfidenceScorer {
    /// Answers shorter than this score zero.
    pub min_answer_len: usize,
    /// Answers longer than this are penalised by `length_penalty`.
    pub max_answer_len: usize,
    pub length_penalty: f64,
    /// Results faster than this are suspicious and penalised by `speed_penalty`.
    pub min_plausible_solve_time: Duration,
    pub speed_penalty: f64,
    /// Per-method multipliers; unknown methods use 1.0.
    pub method_weights: HashMap<String, f64>,
}

impl Default for ConfidenceScorer {
    fn default() -> Self {
        Self {
            min_answer_len: 1,
            max_answer_len: 64,
            length_penalty: 0.5,
            min_plausible_solve_time: Duration::ZERO,
            speed_penalty: 0.8,
            method_weights: HashMap::new(),
        }
    }
}

impl ConfidenceScorer {
    pub fn score(&self, result: &AgentResult) -> f64 {
        let normalized = normalize_answer(&result.answer);
        if normalized.chars().count() < self.min_answer_len.max(1) {
            return 0.0;
        }

        let mut score = if result.confidence.is_finite() {
            result.confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        if normalized.chars().count() > self.max_answer_len {
            score *= self.length_penalty;
        }
        if result.solve_time < self.min_plausible_solve_time {
            score *= self.speed_penalty;
        }
        score *= self
            .method_weights
            .get(&result.method)
            .copied()
            .unwrap_or(1.0);
        score.clamp(0.0, 1.0)
    }
}

/// Trim, drop interior whitespace and upper-case, so "abc 123 " == "ABC123".
pub fn normalize_answer(answer: &str) -> String {
    answer
        .chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_uppercase)
        .collect()
}

#[derive(Clone, Debug)]
pub struct ConsensusEngine {
    scorer: ConfidenceScorer,
    /// Minimum mean confidence of the winning group to submit.
    pub min_confidence: f64,
    /// Fraction of all votes the winner needs to submit (strictly greater).
    pub min_agreement: f64,
}

impl Default for ConsensusEngine {
    fn default() -> Self {
        Self {
            scorer: ConfidenceScorer::default(),
            min_confidence: 0.7,
            min_agreement: 0.5,
        }
    }
}

impl ConsensusEngine {
    pub fn new(scorer: ConfidenceScorer, min_confidence: f64, min_agreement: f64) -> Self {
        Self {
            scorer,
            min_confidence,
            min_agreement,
        }
    }

    pub fn scorer(&self) -> &ConfidenceScorer {
        &self.scorer
    }

    pub fn compare_answers(&self, results: &[AgentResult]) -> ConsensusDecision {
        let mut groups: BTreeMap<String, (Vec<String>, Vec<f64>, String, f64)> = BTreeMap::new();
        for result in results {
            let key = normalize_answer(&result.answer);
            if key.is_empty() {
                continue;
            }
            let score = self.scorer.score(result);
            let entry = groups
                .entry(key)
                .or_insert_with(|| (Vec::new(), Vec::new(), result.answer.trim().to_string(), score));
            entry.0.push(result.agent_id.clone());
            entry.1.push(score);
            // Representative text: the best-scored original spelling.
            if score > entry.3 {
                entry.2 = result.answer.trim().to_string();
                entry.3 = score;
            }
        }

        let voting_pattern: BTreeMap<String, VoteTally> = groups
            .iter()
            .map(|(key, (agents, scores, _, _))| {
                let mean = scores.iter().sum::<f64>() / scores.len() as f64;
                (
                    key.clone(),
                    VoteTally {
                        count: agents.len(),
                        confidence: mean,
                        agents: agents.clone(),
                    },
                )
            })
            .collect();

        let winner = voting_pattern.iter().max_by(|(_, a), (_, b)| {
            a.count
                .cmp(&b.count)
                .then_with(|| a.confidence.total_cmp(&b.confidence))
        });

        let Some((key, tally)) = winner else {
            return ConsensusDecision {
                action: ConsensusAction::Fallback,
                reason: "no usable agent answers".to_string(),
                answer: None,
                confidence: 0.0,
                voting_pattern,
            };
        };

        let total_votes: usize = voting_pattern.values().map(|t| t.count).sum();
        let agreement = tally.count as f64 / total_votes as f64;
        let answer = groups.get(key).map(|g| g.2.clone());
        let confidence = tally.confidence;

        let (action, reason) = if tally.count == total_votes && tally.confidence >= self.min_confidence
        {
            (
                ConsensusAction::Submit,
                format!(
                    "unanimous: {} of {} agents agree (mean confidence {:.2})",
                    tally.count, total_votes, tally.confidence
                ),
            )
        } else if agreement > self.min_agreement && tally.confidence >= self.min_confidence {
            (
                ConsensusAction::Submit,
                format!(
                    "majority: {} of {} agents agree (mean confidence {:.2})",
                    tally.count, total_votes, tally.confidence
                ),
            )
        } else if tally.confidence < self.min_confidence {
            (
                ConsensusAction::Review,
                format!(
                    "low confidence: best answer has {} of {} votes at {:.2} (< {:.2})",
                    tally.count, total_votes, tally.confidence, self.min_confidence
                ),
            )
        } else {
            (
                ConsensusAction::Review,
                format!(
                    "no majority: best answer has {} of {} votes across {} distinct answers",
                    tally.count,
                    total_votes,
                    voting_pattern.len()
                ),
            )
        };

        ConsensusDecision {
            action,
            reason,
            answer,
            confidence,
            voting_pattern,
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(agent: &str, answer: &str, confidence: f64) -> AgentResult {
        AgentResult::new(agent, answer, confidence)
    }

    #[test]
    fn test_unanimous_agreement_submits() {
        let engine = ConsensusEngine::default();
        let decision = engine.compare_answers(&[
            result("A", "ABC123", 0.98),
            result("B", "ABC123", 0.94),
            result("C", "ABC123", 0.97),
        ]);

        assert_eq!(decision.action, ConsensusAction::Submit);
        assert_eq!(decision.answer.as_deref(), Some("ABC123"));
        let tally = &decision.voting_pattern["ABC123"];
        assert_eq!(tally.count, 3);
        assert!((tally.confidence - (0.98 + 0.94 + 0.97) / 3.0).abs() < 1e-9);
        assert!(decision.reason.starts_with("unanimous"));
    }

    #[test]
    fn test_normalization_groups_case_and_whitespace() {
        let engine = ConsensusEngine::default();
        let decision = engine.compare_answers(&[
            result("A", "abc 123", 0.9),
            result("B", " ABC123 ", 0.8),
            result("C", "XYZ999", 0.99),
        ]);

        assert_eq!(decision.voting_pattern["ABC123"].count, 2);
        assert_eq!(decision.voting_pattern["XYZ999"].count, 1);
        assert_eq!(decision.action, ConsensusAction::Submit);
        assert!(decision.reason.starts_with("majority"));
        // Best-scored spelling wins as representative text.
        assert_eq!(decision.answer.as_deref(), Some("abc 123"));
    }

    #[test]
    fn test_tie_broken_by_confidence() {
        let engine = ConsensusEngine::default();
        let decision = engine.compare_answers(&[
            result("A", "AAA", 0.6),
            result("B", "BBB", 0.9),
        ]);

        assert_eq!(decision.answer.as_deref(), Some("BBB"));
        assert_eq!(decision.action, ConsensusAction::Review);
        assert!(decision.reason.starts_with("no majority"));
    }

    #[test]
    fn test_low_confidence_needs_review() {
        let engine = ConsensusEngine::default();
        let decision = engine.compare_answers(&[result("A", "Q7", 0.3), result("B", "Q7", 0.4)]);
        assert_eq!(decision.action, ConsensusAction::Review);
        assert_eq!(decision.answer.as_deref(), Some("Q7"));
        assert!(decision.reason.starts_with("low confidence"));
    }

    #[test]
    fn test_empty_results_fall_back() {
        let engine = ConsensusEngine::default();
        let decision = engine.compare_answers(&[]);
        assert_eq!(decision.action, ConsensusAction::Fallback);
        assert!(decision.answer.is_none());
        assert!(decision.voting_pattern.is_empty());
    }

    #[test]
    fn test_blank_answers_are_ignored() {
        let engine = ConsensusEngine::default();
        let decision = engine.compare_answers(&[result("A", "   ", 0.99)]);
        assert_eq!(decision.action, ConsensusAction::Fallback);
    }

    #[test]
    fn test_scorer_clamps_and_weights() {
        let mut scorer = ConfidenceScorer::default();
        scorer.method_weights.insert("ocr".to_string(), 0.5);

        assert_eq!(scorer.score(&result("A", "X1", 1.7)), 1.0);
        assert_eq!(scorer.score(&result("A", "X1", f64::NAN)), 0.0);

        let mut ocr = result("A", "X1", 0.8);
        ocr.method = "ocr".to_string();
        assert!((scorer.score(&ocr) - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_scorer_penalises_implausible_speed_and_length() {
        let scorer = ConfidenceScorer {
            max_answer_len: 4,
            min_plausible_solve_time: Duration::from_millis(200),
            ..Default::default()
        };

        let mut fast = result("A", "AB", 1.0);
        fast.solve_time = Duration::from_millis(10);
        assert!((scorer.score(&fast) - 0.8).abs() < 1e-9);

        let mut long = result("A", "ABCDEFGH", 1.0);
        long.solve_time = Duration::from_secs(1);
        assert!((scorer.score(&long) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_agent_result_serializes_solve_time_as_millis() {
        let mut r = result("A", "X", 0.5);
        r.solve_time = Duration::from_millis(1250);
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["solve_time"], 1250);
    }
}
