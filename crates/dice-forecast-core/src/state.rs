//! Mutable learning context read and written by the rule engine.
//!
//! The state is owned by the caller and persisted as a single JSON document
//! between requests; nothing in this crate keeps hidden globals.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::outcome::{render_pattern, Outcome};

/// Number of trailing outcomes that key the error memory.
pub const ERROR_KEY_LEN: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PatternStats {
    pub occurrences: u32,
    pub correct_occurrences: u32,
    pub most_recent_next: Outcome,
}

impl PatternStats {
    #[must_use]
    pub fn accuracy(&self) -> f64 {
        if self.occurrences == 0 {
            return 0.0;
        }
        f64::from(self.correct_occurrences) / f64::from(self.occurrences)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LearnedPattern {
    pub forecast: Outcome,
    pub confidence: u8,
    pub rationale: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingForecast {
    pub after_round_id: u64,
    pub forecast: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_key: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForecastScore {
    pub forecast: Outcome,
    pub actual: Outcome,
    pub hit: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LearningState {
    #[serde(default)]
    pub pattern_memory: BTreeMap<String, PatternStats>,
    #[serde(default)]
    pub error_memory: BTreeMap<String, u32>,
    #[serde(default)]
    pub consecutive_misses: u32,
    #[serde(default)]
    pub break_attempted_high: bool,
    #[serde(default)]
    pub break_attempted_low: bool,
    #[serde(default)]
    pub learned_patterns: BTreeMap<String, LearnedPattern>,
    #[serde(default)]
    pub pending_forecast: Option<PendingForecast>,
}

/// Rendered trailing [`ERROR_KEY_LEN`] outcomes, when that many exist.
#[must_use]
pub fn error_key(outcomes: &[Outcome]) -> Option<String> {
    outcomes
        .len()
        .checked_sub(ERROR_KEY_LEN)
        .map(|start| render_pattern(&outcomes[start..]))
}

impl LearningState {
    /// Folds a newly appended round into the state.
    ///
    /// `outcomes` is the history after the append. The pending forecast, if
    /// it was issued before `round_id`, is scored and cleared; the
    /// per-pattern memory keyed by the preceding outcome is updated.
    pub fn observe_round(&mut self, outcomes: &[Outcome], round_id: u64) -> Option<ForecastScore> {
        let actual = *outcomes.last()?;

        let score = match self.pending_forecast.take() {
            Some(pending) if pending.after_round_id < round_id => {
                let hit = pending.forecast == actual;
                if hit {
                    self.consecutive_misses = 0;
                } else {
                    self.consecutive_misses = self.consecutive_misses.saturating_add(1);
                    if let Some(key) = pending.error_key {
                        *self.error_memory.entry(key).or_insert(0) += 1;
                    }
                }
                Some(ForecastScore {
                    forecast: pending.forecast,
                    actual,
                    hit,
                })
            }
            Some(pending) => {
                self.pending_forecast = Some(pending);
                None
            }
            None => None,
        };

        if outcomes.len() > 1 {
            let key = render_pattern(&outcomes[outcomes.len() - 2..outcomes.len() - 1]);
            match self.pattern_memory.entry(key) {
                Entry::Vacant(slot) => {
                    slot.insert(PatternStats {
                        occurrences: 1,
                        correct_occurrences: 0,
                        most_recent_next: actual,
                    });
                }
                Entry::Occupied(mut slot) => {
                    let stats = slot.get_mut();
                    stats.occurrences += 1;
                    if stats.most_recent_next == actual {
                        stats.correct_occurrences += 1;
                    }
                    stats.most_recent_next = actual;
                }
            }
        }

        score
    }

    /// Remembers the forecast just published so the next round can score it.
    pub fn record_forecast(&mut self, after_round_id: u64, forecast: Outcome, outcomes: &[Outcome]) {
        self.pending_forecast = Some(PendingForecast {
            after_round_id,
            forecast,
            error_key: error_key(outcomes),
        });
    }

    #[must_use]
    pub fn break_attempted(&self, side: Outcome) -> bool {
        match side {
            Outcome::High => self.break_attempted_high,
            Outcome::Low => self.break_attempted_low,
        }
    }

    pub fn set_break_attempted(&mut self, side: Outcome, value: bool) {
        match side {
            Outcome::High => self.break_attempted_high = value,
            Outcome::Low => self.break_attempted_low = value,
        }
    }

    #[must_use]
    pub fn error_count(&self, key: &str) -> u32 {
        self.error_memory.get(key).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn learned(&self, pattern: &str) -> Option<&LearnedPattern> {
        self.learned_patterns.get(pattern)
    }

    pub fn memoize(&mut self, pattern: String, learned: LearnedPattern) {
        self.learned_patterns.entry(pattern).or_insert(learned);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{must_ok, must_some, seq};

    #[test]
    fn first_observation_records_without_credit() {
        let mut state = LearningState::default();
        assert!(state.observe_round(&seq("HL"), 2).is_none());
        let stats = must_some(state.pattern_memory.get("H"));
        assert_eq!(stats.occurrences, 1);
        assert_eq!(stats.correct_occurrences, 0);
        assert_eq!(stats.most_recent_next, Outcome::Low);
    }

    #[test]
    fn repeated_follower_earns_credit() {
        let mut state = LearningState::default();
        state.observe_round(&seq("HL"), 2);
        state.observe_round(&seq("HLH"), 3);
        state.observe_round(&seq("HLHL"), 4);
        let stats = must_some(state.pattern_memory.get("H"));
        assert_eq!(stats.occurrences, 2);
        assert_eq!(stats.correct_occurrences, 1);
        assert!((stats.accuracy() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn miss_feeds_error_memory_and_hit_resets_misses() {
        let mut state = LearningState::default();
        let history = seq("HHL");
        state.record_forecast(3, Outcome::High, &history);

        let score = must_some(state.observe_round(&seq("HHLL"), 4));
        assert!(!score.hit);
        assert_eq!(state.consecutive_misses, 1);
        assert_eq!(state.error_count("HHL"), 1);
        assert!(state.pending_forecast.is_none());

        state.record_forecast(4, Outcome::Low, &seq("HHLL"));
        let score = must_some(state.observe_round(&seq("HHLLL"), 5));
        assert!(score.hit);
        assert_eq!(state.consecutive_misses, 0);
    }

    #[test]
    fn forecast_issued_for_a_later_round_stays_pending() {
        let mut state = LearningState::default();
        state.record_forecast(9, Outcome::High, &seq("H"));
        assert!(state.observe_round(&seq("HL"), 9).is_none());
        assert!(state.pending_forecast.is_some());
        assert!(must_some(state.pending_forecast.as_ref()).error_key.is_none());
    }

    #[test]
    fn memoize_keeps_first_entry() {
        let mut state = LearningState::default();
        let first = LearnedPattern {
            forecast: Outcome::High,
            confidence: 72,
            rationale: "fallback on total 12".to_string(),
        };
        state.memoize("HHL".to_string(), first.clone());
        state.memoize(
            "HHL".to_string(),
            LearnedPattern {
                forecast: Outcome::Low,
                confidence: 72,
                rationale: "fallback on total 5".to_string(),
            },
        );
        assert_eq!(state.learned("HHL"), Some(&first));
    }

    #[test]
    fn empty_document_decodes_to_default() {
        let state: LearningState = must_ok(serde_json::from_str("{}"));
        assert_eq!(state, LearningState::default());
    }
}
