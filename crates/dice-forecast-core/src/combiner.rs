use serde::{Deserialize, Serialize};

use crate::clamp;
use crate::config::EnsembleConfig;
use crate::matchers::VoteTally;
use crate::outcome::{binary_entropy, Outcome};

/// Two-way softmax in logistic form so large scores cannot overflow.
#[must_use]
pub fn softmax2(score_high: f64, score_low: f64, scale: f64) -> f64 {
    1.0 / (1.0 + ((score_low - score_high) / scale).exp())
}

/// Pattern-vote probability; neutral when nothing voted.
#[must_use]
pub fn pattern_probability(votes: VoteTally, scale: f64) -> f64 {
    if votes.is_empty() {
        0.5
    } else {
        softmax2(votes.high, votes.low, scale)
    }
}

/// `0.5 + min(0.5, log2(1 + n) / 5)`, saturating at 1.0 from `n = 31`.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn adaptive_multiplier(n: u64) -> f64 {
    0.5 + ((1.0 + n as f64).log2() / 5.0).min(0.5)
}

/// `(1 - H(p)) * 100`: 0 at a coin flip, 100 at certainty.
#[must_use]
pub fn entropy_confidence(p: f64) -> f64 {
    (1.0 - binary_entropy(p)) * 100.0
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CombinerInputs {
    pub markov: f64,
    pub markov_coverage: u64,
    pub pattern_votes: VoteTally,
    pub local_trend: f64,
    pub local_n: usize,
    pub global_frequency: f64,
    pub global_n: usize,
    pub rule_engine: f64,
    pub signature: f64,
    pub bayes: f64,
    pub monte_carlo: f64,
    pub ngram: f64,
    /// Mean signed expert confidence in `[-1, 1]`.
    pub expert_lean: f64,
    pub clear_labels: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Combined {
    pub forecast: Outcome,
    pub confidence: f64,
    pub prob_high: f64,
    pub prob_pattern: f64,
}

#[must_use]
pub fn combine(inputs: &CombinerInputs, config: &EnsembleConfig) -> Combined {
    let weights = &config.weights;
    let prob_pattern = pattern_probability(inputs.pattern_votes, config.softmax_scale);

    let terms = [
        (
            inputs.markov,
            weights.markov * adaptive_multiplier(inputs.markov_coverage),
        ),
        (prob_pattern, weights.pattern),
        (
            inputs.local_trend,
            weights.local_trend * adaptive_multiplier(inputs.local_n as u64),
        ),
        (
            inputs.global_frequency,
            weights.global_frequency * adaptive_multiplier(inputs.global_n as u64),
        ),
        (
            inputs.rule_engine,
            weights.rule_engine * config.rule_engine_multiplier,
        ),
        (inputs.signature, weights.signature * config.signature_multiplier),
        (inputs.bayes, weights.bayes),
        (inputs.monte_carlo, weights.monte_carlo),
        (inputs.ngram, weights.ngram * config.ngram_multiplier),
    ];

    let denominator: f64 = terms.iter().map(|(_, weight)| weight).sum();
    let blended = if denominator > 0.0 {
        terms.iter().map(|(p, weight)| p * weight).sum::<f64>() / denominator
    } else {
        0.5
    };
    let prob_high = clamp(blended + inputs.expert_lean * config.expert_nudge, 0.01, 0.99);

    let mut confidence = entropy_confidence(prob_high);
    if inputs.clear_labels > 0 {
        #[allow(clippy::cast_precision_loss)]
        let boost = (1.03 + 0.03 * inputs.clear_labels as f64).min(1.15);
        confidence *= boost;
    } else {
        confidence *= 0.98;
    }
    let confidence = clamp(
        confidence + 5.0,
        config.confidence_floor,
        config.confidence_ceiling,
    );

    Combined {
        forecast: if prob_high >= 0.5 {
            Outcome::High
        } else {
            Outcome::Low
        },
        confidence,
        prob_high,
        prob_pattern,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp)]

    use super::*;
    use proptest::prelude::*;

    fn neutral_inputs() -> CombinerInputs {
        CombinerInputs {
            markov: 0.5,
            markov_coverage: 0,
            pattern_votes: VoteTally::default(),
            local_trend: 0.5,
            local_n: 0,
            global_frequency: 0.5,
            global_n: 0,
            rule_engine: 0.5,
            signature: 0.5,
            bayes: 0.5,
            monte_carlo: 0.5,
            ngram: 0.5,
            expert_lean: 0.0,
            clear_labels: 0,
        }
    }

    #[test]
    fn entropy_confidence_endpoints() {
        assert!(entropy_confidence(0.5).abs() < 1e-12);
        assert_eq!(entropy_confidence(0.0), 100.0);
        assert_eq!(entropy_confidence(1.0), 100.0);
    }

    #[test]
    fn softmax_is_symmetric_and_overflow_safe() {
        assert!((softmax2(3.0, 3.0, 12.0) - 0.5).abs() < 1e-12);
        assert!(softmax2(1.0e6, 0.0, 12.0) > 0.999);
        assert!(softmax2(0.0, 1.0e6, 12.0) < 0.001);
        assert_eq!(pattern_probability(VoteTally::default(), 12.0), 0.5);
    }

    #[test]
    fn adaptive_multiplier_saturates() {
        assert_eq!(adaptive_multiplier(0), 0.5);
        assert_eq!(adaptive_multiplier(31), 1.0);
        assert_eq!(adaptive_multiplier(10_000), 1.0);
    }

    #[test]
    fn neutral_inputs_land_on_floor() {
        let combined = combine(&neutral_inputs(), &EnsembleConfig::v1());
        assert_eq!(combined.forecast, Outcome::High);
        assert_eq!(combined.confidence, 55.0);
        assert!((combined.prob_high - 0.5).abs() < 1e-12);
    }

    #[test]
    fn expert_lean_nudges_probability() {
        let mut inputs = neutral_inputs();
        inputs.expert_lean = -0.6;
        let combined = combine(&inputs, &EnsembleConfig::v1());
        assert!((combined.prob_high - 0.47).abs() < 1e-12);
        assert_eq!(combined.forecast, Outcome::Low);
    }

    #[test]
    fn unanimous_sources_hit_ceiling() {
        let inputs = CombinerInputs {
            markov: 1.0,
            markov_coverage: 100,
            pattern_votes: VoteTally { high: 200.0, low: 0.0 },
            local_trend: 1.0,
            local_n: 100,
            global_frequency: 1.0,
            global_n: 100,
            rule_engine: 1.0,
            signature: 1.0,
            bayes: 1.0,
            monte_carlo: 1.0,
            ngram: 1.0,
            expert_lean: 1.0,
            clear_labels: 5,
        };
        let combined = combine(&inputs, &EnsembleConfig::v1());
        assert_eq!(combined.prob_high, 0.99);
        assert_eq!(combined.confidence, 99.0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_confidence_stays_in_band(
            probs in prop::collection::vec(0.0_f64..=1.0, 9),
            votes in (0.0_f64..500.0, 0.0_f64..500.0),
            coverage in 0_u64..5000,
            lean in -1.0_f64..=1.0,
            clear_labels in 0_usize..12,
        ) {
            let inputs = CombinerInputs {
                markov: probs[0],
                markov_coverage: coverage,
                pattern_votes: VoteTally { high: votes.0, low: votes.1 },
                local_trend: probs[1],
                local_n: 20,
                global_frequency: probs[2],
                global_n: 200,
                rule_engine: probs[3],
                signature: probs[4],
                bayes: probs[5],
                monte_carlo: probs[6],
                ngram: probs[7],
                expert_lean: lean,
                clear_labels,
            };
            let combined = combine(&inputs, &EnsembleConfig::v1());
            prop_assert!((55.0..=99.0).contains(&combined.confidence));
            prop_assert!((0.01..=0.99).contains(&combined.prob_high));
            prop_assert_eq!(combined.forecast == Outcome::High, combined.prob_high >= 0.5);
        }
    }
}
