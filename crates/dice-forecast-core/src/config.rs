use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ForecastError;

/// Base weight per probability source before adaptive multipliers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnsembleWeights {
    pub markov: f64,
    pub pattern: f64,
    pub local_trend: f64,
    pub global_frequency: f64,
    pub rule_engine: f64,
    pub signature: f64,
    pub bayes: f64,
    pub monte_carlo: f64,
    pub ngram: f64,
}

impl EnsembleWeights {
    fn named(&self) -> [(&'static str, f64); 9] {
        [
            ("weights.markov", self.markov),
            ("weights.pattern", self.pattern),
            ("weights.local_trend", self.local_trend),
            ("weights.global_frequency", self.global_frequency),
            ("weights.rule_engine", self.rule_engine),
            ("weights.signature", self.signature),
            ("weights.bayes", self.bayes),
            ("weights.monte_carlo", self.monte_carlo),
            ("weights.ngram", self.ngram),
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnsembleConfig {
    pub config_version: u32,
    pub weights: EnsembleWeights,
    pub rule_engine_multiplier: f64,
    pub signature_multiplier: f64,
    pub ngram_multiplier: f64,
    pub softmax_scale: f64,
    pub expert_nudge: f64,
    pub confidence_floor: f64,
    pub confidence_ceiling: f64,
    pub monte_carlo_sims: u32,
    pub retention: usize,
}

impl EnsembleConfig {
    #[must_use]
    pub fn v1() -> Self {
        Self {
            config_version: 1,
            weights: EnsembleWeights {
                markov: 0.20,
                pattern: 0.20,
                local_trend: 0.15,
                global_frequency: 0.10,
                rule_engine: 0.10,
                signature: 0.15,
                bayes: 0.10,
                monte_carlo: 0.05,
                ngram: 0.10,
            },
            rule_engine_multiplier: 0.7,
            signature_multiplier: 0.8,
            ngram_multiplier: 0.6,
            softmax_scale: 12.0,
            expert_nudge: 0.05,
            confidence_floor: 55.0,
            confidence_ceiling: 99.0,
            monte_carlo_sims: 5000,
            retention: 500,
        }
    }

    /// Validates numeric bounds of the ensemble configuration.
    ///
    /// # Errors
    /// Returns [`ForecastError::Configuration`] when one or more fields are
    /// outside allowed bounds.
    pub fn validate(&self) -> Result<(), ForecastError> {
        if self.config_version == 0 {
            return Err(ForecastError::Configuration(
                "config_version MUST be >= 1".to_string(),
            ));
        }

        for (name, value) in self.weights.named().into_iter().chain([
            ("rule_engine_multiplier", self.rule_engine_multiplier),
            ("signature_multiplier", self.signature_multiplier),
            ("ngram_multiplier", self.ngram_multiplier),
        ]) {
            if !(0.0..=1.0).contains(&value) {
                return Err(ForecastError::Configuration(format!(
                    "{name} MUST be in [0.0, 1.0]"
                )));
            }
        }

        let weight_sum: f64 = self.weights.named().iter().map(|(_, value)| value).sum();
        if weight_sum <= 0.0 {
            return Err(ForecastError::Configuration(
                "at least one base weight MUST be positive".to_string(),
            ));
        }

        if !(self.softmax_scale.is_finite() && self.softmax_scale > 0.0) {
            return Err(ForecastError::Configuration(
                "softmax_scale MUST be a positive finite number".to_string(),
            ));
        }

        if !(0.0..=0.5).contains(&self.expert_nudge) {
            return Err(ForecastError::Configuration(
                "expert_nudge MUST be in [0.0, 0.5]".to_string(),
            ));
        }

        if !(0.0..=100.0).contains(&self.confidence_floor)
            || !(0.0..=100.0).contains(&self.confidence_ceiling)
        {
            return Err(ForecastError::Configuration(
                "confidence band MUST lie within [0, 100]".to_string(),
            ));
        }

        if self.confidence_floor > self.confidence_ceiling {
            return Err(ForecastError::Configuration(
                "confidence_floor cannot exceed confidence_ceiling".to_string(),
            ));
        }

        if self.monte_carlo_sims == 0 {
            return Err(ForecastError::Configuration(
                "monte_carlo_sims MUST be >= 1".to_string(),
            ));
        }

        if self.retention < 2 {
            return Err(ForecastError::Configuration(
                "retention MUST be >= 2".to_string(),
            ));
        }

        Ok(())
    }

    /// Decodes and validates a configuration from JSON.
    ///
    /// # Errors
    /// Returns [`ForecastError::Configuration`] when JSON decoding fails or
    /// decoded values violate configuration constraints.
    pub fn from_json(value: &Value) -> Result<Self, ForecastError> {
        let config: Self = serde_json::from_value(value.clone()).map_err(|err| {
            ForecastError::Configuration(format!("invalid ensemble config JSON payload: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self::v1()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::must_ok;

    #[test]
    fn v1_is_valid() {
        must_ok(EnsembleConfig::v1().validate());
    }

    #[test]
    fn out_of_range_weight_names_the_field() {
        let mut config = EnsembleConfig::v1();
        config.weights.bayes = 1.5;
        let err = config.validate();
        assert_eq!(
            err,
            Err(ForecastError::Configuration(
                "weights.bayes MUST be in [0.0, 1.0]".to_string()
            ))
        );
    }

    #[test]
    fn inverted_band_is_rejected() {
        let mut config = EnsembleConfig::v1();
        config.confidence_floor = 90.0;
        config.confidence_ceiling = 60.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn from_json_round_trips_v1() {
        let value = must_ok(serde_json::to_value(EnsembleConfig::v1()));
        let decoded = must_ok(EnsembleConfig::from_json(&value));
        assert_eq!(decoded, EnsembleConfig::v1());
    }

    #[test]
    fn from_json_reports_decode_failures() {
        let err = EnsembleConfig::from_json(&serde_json::json!({"config_version": 1}));
        assert!(
            matches!(err, Err(ForecastError::Configuration(message)) if message.contains("invalid ensemble config JSON"))
        );
    }
}
