use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::EnsembleConfig;
use crate::forecast::{forecast, ForecastModels, ForecastReport};
use crate::markov::MarkovModel;
use crate::outcome::{current_streak, Outcome, Round};
use crate::randomness::{assess_md5, Md5Assessment};
use crate::rules::RuleEngine;
use crate::signature::SignatureLibrary;
use crate::state::{ForecastScore, LearningState};
use crate::ForecastError;

pub const RECENT_WINDOW: usize = 20;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IngestReport {
    pub round_id: u64,
    pub accepted: bool,
    pub history_len: usize,
    pub evicted: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_round_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5: Option<Md5Assessment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<ForecastScore>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryStats {
    pub total_samples: usize,
    pub high_count: usize,
    pub low_count: usize,
    pub current_streak: usize,
    pub streak_side: Option<Outcome>,
    pub recent20_high: usize,
    pub recent20_low: usize,
}

/// Mutable part of a [`ForecastEngine`], restored by
/// [`ForecastEngine::rollback`] when persisting a mutation fails.
#[derive(Debug, Clone)]
pub struct EngineCheckpoint {
    history: Vec<Round>,
    markov: MarkovModel,
    learning: LearningState,
}

/// Rolling history plus every model derived from it.
///
/// Mutation happens only through [`ForecastEngine::ingest`] and
/// [`ForecastEngine::forecast`]; callers serialize access to both.
#[derive(Debug)]
pub struct ForecastEngine {
    config: EnsembleConfig,
    history: Vec<Round>,
    markov: MarkovModel,
    signatures: SignatureLibrary,
    rules: RuleEngine,
    learning: LearningState,
}

impl ForecastEngine {
    /// Builds an engine with an empty history. The signature library's
    /// random fillers are drawn from `rng`.
    ///
    /// # Errors
    /// Returns [`ForecastError::Configuration`] when `config` is invalid.
    pub fn new<R: Rng>(
        config: EnsembleConfig,
        learning: LearningState,
        rng: &mut R,
    ) -> Result<Self, ForecastError> {
        config.validate()?;
        Ok(Self {
            config,
            history: Vec::new(),
            markov: MarkovModel::new(),
            signatures: SignatureLibrary::build(rng),
            rules: RuleEngine::standard(),
            learning,
        })
    }

    /// Replaces the history with `rounds` (oldest first), keeps the newest
    /// `retention` of them and rebuilds the Markov tables.
    pub fn restore(&mut self, mut rounds: Vec<Round>) {
        rounds.sort_by_key(|round| round.round_id);
        rounds.dedup_by_key(|round| round.round_id);
        let excess = rounds.len().saturating_sub(self.config.retention);
        rounds.drain(..excess);
        self.history = rounds;
        self.markov.rebuild(&self.outcomes());
    }

    /// Appends a round newer than every stored one.
    ///
    /// Stale or duplicate ids are reported with `accepted = false` and leave
    /// the engine untouched. Eviction does not subtract Markov counts; the
    /// tables only grow until the next [`ForecastEngine::restore`].
    pub fn ingest(&mut self, round: Round) -> IngestReport {
        let latest = self.latest_round_id();
        if latest.is_some_and(|id| round.round_id <= id) {
            return IngestReport {
                round_id: round.round_id,
                accepted: false,
                history_len: self.history.len(),
                evicted: 0,
                latest_round_id: latest,
                md5: None,
                score: None,
            };
        }

        let md5 = assess_md5(round.md5.as_deref());
        let round_id = round.round_id;
        self.history.push(round);
        let evicted = self.history.len().saturating_sub(self.config.retention);
        self.history.drain(..evicted);

        let outcomes = self.outcomes();
        self.markov.update_incremental(&outcomes);
        let score = self.learning.observe_round(&outcomes, round_id);

        IngestReport {
            round_id,
            accepted: true,
            history_len: self.history.len(),
            evicted,
            latest_round_id: Some(round_id),
            md5: Some(md5),
            score,
        }
    }

    /// Forecasts the next round and records it for scoring on the next
    /// ingest.
    ///
    /// # Errors
    /// Returns [`ForecastError::NotReady`] when no round has been ingested.
    pub fn forecast<R: Rng>(&mut self, rng: &mut R) -> Result<ForecastReport, ForecastError> {
        let models = ForecastModels {
            config: &self.config,
            markov: &self.markov,
            signatures: &self.signatures,
            rules: &self.rules,
        };
        let report = forecast(&models, &self.history, &mut self.learning, rng)?;
        let outcomes = self.outcomes();
        self.learning
            .record_forecast(report.round_id, report.forecast, &outcomes);
        Ok(report)
    }

    #[must_use]
    pub fn checkpoint(&self) -> EngineCheckpoint {
        EngineCheckpoint {
            history: self.history.clone(),
            markov: self.markov.clone(),
            learning: self.learning.clone(),
        }
    }

    /// Discards every ingest and forecast since `checkpoint` was taken.
    pub fn rollback(&mut self, checkpoint: EngineCheckpoint) {
        self.history = checkpoint.history;
        self.markov = checkpoint.markov;
        self.learning = checkpoint.learning;
    }

    #[must_use]
    pub fn stats(&self) -> HistoryStats {
        let outcomes = self.outcomes();
        let high_count = outcomes.iter().filter(|o| **o == Outcome::High).count();
        let recent = &outcomes[outcomes.len().saturating_sub(RECENT_WINDOW)..];
        let recent20_high = recent.iter().filter(|o| **o == Outcome::High).count();
        let streak = current_streak(&outcomes);

        HistoryStats {
            total_samples: outcomes.len(),
            high_count,
            low_count: outcomes.len() - high_count,
            current_streak: streak.map_or(0, |streak| streak.len),
            streak_side: streak.map(|streak| streak.side),
            recent20_high,
            recent20_low: recent.len() - recent20_high,
        }
    }

    /// Newest `limit` rounds, oldest first.
    #[must_use]
    pub fn history(&self, limit: usize) -> &[Round] {
        &self.history[self.history.len().saturating_sub(limit)..]
    }

    #[must_use]
    pub fn latest_round_id(&self) -> Option<u64> {
        self.history.last().map(|round| round.round_id)
    }

    #[must_use]
    pub fn outcomes(&self) -> Vec<Outcome> {
        self.history.iter().map(|round| round.outcome).collect()
    }

    #[must_use]
    pub fn config(&self) -> &EnsembleConfig {
        &self.config
    }

    #[must_use]
    pub fn markov(&self) -> &MarkovModel {
        &self.markov
    }

    #[must_use]
    pub fn signatures(&self) -> &SignatureLibrary {
        &self.signatures
    }

    #[must_use]
    pub fn learning(&self) -> &LearningState {
        &self.learning
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::RoundInput;
    use crate::test_support::must_ok;
    use crate::{now_utc, parse_rfc3339_utc};
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    fn fixture_engine(retention: usize) -> ForecastEngine {
        let mut config = EnsembleConfig::v1();
        config.retention = retention;
        config.monte_carlo_sims = 500;
        let mut rng = SmallRng::seed_from_u64(1);
        must_ok(ForecastEngine::new(config, LearningState::default(), &mut rng))
    }

    fn fixture_round(round_id: u64, dice: [i64; 3]) -> Round {
        let input = RoundInput {
            round_id,
            outcome: None,
            dice,
            total: None,
            md5: None,
        };
        must_ok(input.normalize(now_utc()))
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = EnsembleConfig::v1();
        config.retention = 0;
        let mut rng = SmallRng::seed_from_u64(1);
        let err = ForecastEngine::new(config, LearningState::default(), &mut rng);
        assert!(matches!(err, Err(ForecastError::Configuration(_))));
    }

    #[test]
    fn forecast_before_ingest_is_not_ready() {
        let mut engine = fixture_engine(10);
        let mut rng = SmallRng::seed_from_u64(2);
        assert!(matches!(engine.forecast(&mut rng), Err(ForecastError::NotReady)));
    }

    #[test]
    fn stale_and_duplicate_rounds_are_ignored() {
        let mut engine = fixture_engine(10);
        assert!(engine.ingest(fixture_round(5, [6, 6, 6])).accepted);
        let duplicate = engine.ingest(fixture_round(5, [1, 1, 1]));
        assert!(!duplicate.accepted);
        assert_eq!(duplicate.latest_round_id, Some(5));
        assert!(!engine.ingest(fixture_round(4, [1, 1, 1])).accepted);
        assert_eq!(engine.history(10).len(), 1);
    }

    #[test]
    fn retention_evicts_oldest_rounds() {
        let mut engine = fixture_engine(3);
        for round_id in 1..=5 {
            engine.ingest(fixture_round(round_id, [6, 5, 4]));
        }
        let ids: Vec<u64> = engine.history(10).iter().map(|round| round.round_id).collect();
        assert_eq!(ids, vec![3, 4, 5]);
        assert_eq!(engine.history(2).len(), 2);
    }

    #[test]
    fn ingest_scores_previous_forecast() {
        let mut engine = fixture_engine(50);
        let mut rng = SmallRng::seed_from_u64(9);
        engine.ingest(fixture_round(1, [6, 6, 6]));
        engine.ingest(fixture_round(2, [1, 1, 1]));
        let report = must_ok(engine.forecast(&mut rng));

        let actual = report.forecast.opposite();
        let dice = if actual == Outcome::High { [6, 6, 6] } else { [1, 1, 1] };
        let ingest = engine.ingest(fixture_round(3, dice));
        let score = ingest.score.map(|score| score.hit);
        assert_eq!(score, Some(false));
        assert_eq!(engine.learning().consecutive_misses, 1);
    }

    #[test]
    fn stats_summarize_history() {
        let mut engine = fixture_engine(50);
        for (round_id, dice) in [(1, [6, 6, 6]), (2, [1, 1, 1]), (3, [6, 5, 4]), (4, [5, 5, 5])] {
            engine.ingest(fixture_round(round_id, dice));
        }
        let stats = engine.stats();
        assert_eq!(stats.total_samples, 4);
        assert_eq!(stats.high_count, 3);
        assert_eq!(stats.low_count, 1);
        assert_eq!(stats.current_streak, 2);
        assert_eq!(stats.streak_side, Some(Outcome::High));
        assert_eq!(stats.recent20_high, 3);
    }

    #[test]
    fn restore_rebuilds_markov_from_sorted_history() {
        let recorded_at = must_ok(parse_rfc3339_utc("2026-02-07T12:00:00Z"));
        let mut rounds: Vec<Round> = (1..=6)
            .map(|round_id| {
                let mut round = fixture_round(round_id, if round_id % 2 == 0 { [1, 1, 1] } else { [6, 6, 6] });
                round.recorded_at = recorded_at;
                round
            })
            .collect();
        rounds.reverse();

        let mut engine = fixture_engine(4);
        engine.restore(rounds);
        assert_eq!(engine.latest_round_id(), Some(6));
        assert_eq!(engine.history(10).len(), 4);

        let mut replayed = MarkovModel::new();
        replayed.rebuild(&engine.outcomes());
        assert_eq!(engine.markov(), &replayed);
    }

    #[test]
    fn rollback_discards_ingest_and_forecast() {
        let mut engine = fixture_engine(10);
        let mut rng = SmallRng::seed_from_u64(4);
        engine.ingest(fixture_round(1, [6, 6, 6]));
        engine.ingest(fixture_round(2, [1, 1, 1]));
        let checkpoint = engine.checkpoint();
        let markov = engine.markov().clone();
        let learning = engine.learning().clone();

        assert!(engine.ingest(fixture_round(3, [6, 6, 5])).accepted);
        must_ok(engine.forecast(&mut rng));
        assert!(engine.learning().pending_forecast.is_some());

        engine.rollback(checkpoint);
        assert_eq!(engine.latest_round_id(), Some(2));
        assert_eq!(engine.markov(), &markov);
        assert_eq!(engine.learning(), &learning);
        assert!(engine.ingest(fixture_round(3, [1, 2, 3])).accepted);
    }

    #[test]
    fn md5_is_assessed_on_ingest() {
        let mut engine = fixture_engine(10);
        let mut round = fixture_round(1, [6, 6, 6]);
        round.md5 = Some("00000000000000000000000000000000".to_string());
        let report = engine.ingest(round);
        assert_eq!(report.md5.map(|md5| md5.is_random), Some(false));
    }
}
