//! One forecast request: run every estimator over the history snapshot,
//! evaluate the rule engine once, and merge.

use rand::Rng;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

use crate::bayes::{bayes_estimate, BayesEstimate};
use crate::combiner::{combine, CombinerInputs};
use crate::config::EnsembleConfig;
use crate::experts::{panel_lean, run_panel, ExpertInputs, ExpertVote};
use crate::markov::{MarkovModel, MarkovPrediction};
use crate::matchers::{
    analyze_patterns, global_frequency, local_trend, ngram_match, GlobalFrequency, LocalTrend,
    NgramResult, VoteTally, LOCAL_TREND_LOOKBACKS,
};
use crate::monte_carlo::{monte_carlo_estimate, MonteCarloEstimate};
use crate::outcome::{render_pattern, Dice, Outcome, Round};
use crate::rules::{RuleContext, RuleDecision, RuleEngine};
use crate::signature::{SignatureEntry, SignatureLibrary};
use crate::state::LearningState;
use crate::{now_utc, ForecastError};

pub const FORECAST_CONTRACT_VERSION: &str = "forecast.v1";
pub const PATTERN_TAIL: usize = 20;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Diagnostics {
    pub labels: Vec<String>,
    pub pattern_votes: VoteTally,
    pub prob_pattern: f64,
    pub markov: MarkovPrediction,
    pub local_trend: LocalTrend,
    pub global_frequency: GlobalFrequency,
    pub rule: Option<RuleDecision>,
    pub signature: Option<SignatureEntry>,
    pub bayes: BayesEstimate,
    pub monte_carlo: MonteCarloEstimate,
    pub ngram: NgramResult,
    pub experts: Vec<ExpertVote>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ForecastReport {
    pub contract_version: String,
    pub forecast_id: Ulid,
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
    pub round_id: u64,
    pub next_round_id: u64,
    pub dice: Dice,
    pub total: u8,
    pub forecast: Outcome,
    /// Percentage with one decimal, e.g. `"72.4%"`.
    pub confidence: String,
    pub confidence_value: f64,
    pub probability: f64,
    pub rationale: String,
    pub kelly_fraction: f64,
    pub capital_advice: String,
    pub pattern: String,
    pub diagnostics: Diagnostics,
}

/// Read-only models shared by every request.
#[derive(Debug, Clone, Copy)]
pub struct ForecastModels<'a> {
    pub config: &'a EnsembleConfig,
    pub markov: &'a MarkovModel,
    pub signatures: &'a SignatureLibrary,
    pub rules: &'a RuleEngine,
}

/// Produces a forecast for the round after the newest one in `history`.
///
/// The only writes are the rule engine's updates to `learning`; Monte
/// Carlo and the random expert draw from `rng`.
///
/// # Errors
/// Returns [`ForecastError::NotReady`] when `history` is empty.
pub fn forecast<R: Rng>(
    models: &ForecastModels<'_>,
    history: &[Round],
    learning: &mut LearningState,
    rng: &mut R,
) -> Result<ForecastReport, ForecastError> {
    let latest = history.last().ok_or(ForecastError::NotReady)?;
    let outcomes: Vec<Outcome> = history.iter().map(|round| round.outcome).collect();
    let dice_history: Vec<Dice> = history.iter().map(|round| round.dice).collect();
    let totals: Vec<u8> = history.iter().map(|round| round.total).collect();
    let pattern = render_pattern(&outcomes);

    let rule_ctx = RuleContext::new(&outcomes, latest.dice, latest.total, models.signatures);
    let rule = models.rules.evaluate(&rule_ctx, learning);

    let analysis = analyze_patterns(&outcomes, models.signatures, rule.as_ref());
    let markov = models.markov.predict(&outcomes);
    let trend = local_trend(&outcomes, &LOCAL_TREND_LOOKBACKS);
    let global = global_frequency(&outcomes);
    let signature = models.signatures.lookup(&pattern).cloned();
    let bayes = bayes_estimate(&outcomes);
    let monte_carlo = monte_carlo_estimate(&dice_history, models.config.monte_carlo_sims, rng);
    let ngram = ngram_match(&outcomes);
    let experts = run_panel(
        &ExpertInputs {
            outcomes: &outcomes,
            dice: &dice_history,
            totals: &totals,
            round_id: latest.round_id,
        },
        rng,
    );

    let combined = combine(
        &CombinerInputs {
            markov: markov.prob_high,
            markov_coverage: markov.coverage,
            pattern_votes: analysis.votes,
            local_trend: trend.prob_high,
            local_n: trend.n,
            global_frequency: global.prob_high,
            global_n: global.n,
            rule_engine: rule.as_ref().map_or(0.5, RuleDecision::prob_high),
            signature: signature.as_ref().map_or(0.5, |entry| {
                entry.forecast.prob_high_at(f64::from(entry.confidence))
            }),
            bayes: bayes.posterior_high,
            monte_carlo: monte_carlo.prob_high,
            ngram: ngram.prob_high(),
            expert_lean: panel_lean(&experts),
            clear_labels: analysis.clear_label_count(),
        },
        models.config,
    );

    let kelly_fraction = kelly_fraction(combined.prob_high);
    let capital_advice = capital_advice(kelly_fraction);
    let diagnostics = Diagnostics {
        labels: analysis.labels,
        pattern_votes: analysis.votes,
        prob_pattern: combined.prob_pattern,
        markov,
        local_trend: trend,
        global_frequency: global,
        rule,
        signature,
        bayes,
        monte_carlo,
        ngram,
        experts,
    };
    let confidence = format_confidence(combined.confidence);
    let rationale = rationale(&diagnostics, combined.forecast, &confidence, &capital_advice);

    Ok(ForecastReport {
        contract_version: FORECAST_CONTRACT_VERSION.to_string(),
        forecast_id: Ulid::new(),
        generated_at: now_utc(),
        round_id: latest.round_id,
        next_round_id: latest.round_id.saturating_add(1),
        dice: latest.dice,
        total: latest.total,
        forecast: combined.forecast,
        confidence,
        confidence_value: combined.confidence,
        probability: combined.prob_high,
        rationale,
        kelly_fraction,
        capital_advice,
        pattern: tail(&pattern, PATTERN_TAIL).to_string(),
        diagnostics,
    })
}

/// Stake fraction `|p - 0.5| * 2`. Observational only.
#[must_use]
pub fn kelly_fraction(prob_high: f64) -> f64 {
    (prob_high - 0.5).abs() * 2.0
}

#[must_use]
pub fn capital_advice(kelly_fraction: f64) -> String {
    format!("Kelly stake: {:.1}% of bankroll", kelly_fraction * 100.0)
}

#[must_use]
pub fn format_confidence(confidence: f64) -> String {
    format!("{confidence:.1}%")
}

fn tail(pattern: &str, len: usize) -> &str {
    &pattern[pattern.len().saturating_sub(len)..]
}

fn rationale(
    diagnostics: &Diagnostics,
    forecast: Outcome,
    confidence: &str,
    capital_advice: &str,
) -> String {
    let ngram_matches = diagnostics
        .ngram
        .matches
        .iter()
        .map(|m| format!("{}:{:.2}", m.pattern, m.p_high))
        .collect::<Vec<_>>()
        .join(", ");
    let experts = diagnostics
        .experts
        .iter()
        .map(|vote| format!("{}({})", vote.forecast, vote.confidence))
        .collect::<Vec<_>>()
        .join(", ");
    let rule = diagnostics
        .rule
        .as_ref()
        .map_or_else(|| "none".to_string(), |decision| {
            format!(
                "{} {} {}% ({})",
                decision.rule.as_str(),
                decision.forecast,
                decision.confidence,
                decision.explanation
            )
        });
    let signature = diagnostics
        .signature
        .as_ref()
        .map_or_else(|| "none".to_string(), |entry| entry.rationale.clone());

    format!(
        "Patterns: {}. Markov: {:.1}% ({}). Bayes: {:.1}%. Monte Carlo: {:.1}%. \
         Signature: {signature}. Rule: {rule}. N-gram: {:.1}% ({ngram_matches}). \
         Experts ({}): {experts}. Final: {forecast} {confidence}. {capital_advice}",
        diagnostics.labels.join("; "),
        diagnostics.markov.prob_high * 100.0,
        diagnostics.markov.trace,
        diagnostics.bayes.posterior_high * 100.0,
        diagnostics.monte_carlo.prob_high * 100.0,
        diagnostics.ngram.confidence,
        diagnostics.experts.len(),
    )
}
