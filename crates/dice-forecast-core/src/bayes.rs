use serde::{Deserialize, Serialize};

use crate::clamp;
use crate::outcome::{high_fraction, render_pattern, Outcome};

pub const FEATURE_LENGTHS: [usize; 3] = [4, 6, 8];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BayesEstimate {
    pub forecast: Outcome,
    pub confidence: f64,
    pub posterior_high: f64,
    pub posterior_low: f64,
    pub trace: String,
}

/// Posterior of the next outcome given the trailing feature, averaged over
/// [`FEATURE_LENGTHS`].
///
/// Each feature length is clamped to `len - 1`. Likelihoods are
/// Laplace-smoothed follower counts of earlier occurrences of the feature;
/// the prior is the historical High fraction.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn bayes_estimate(outcomes: &[Outcome]) -> BayesEstimate {
    if outcomes.len() < 3 {
        return BayesEstimate {
            forecast: Outcome::High,
            confidence: 50.0,
            posterior_high: 0.5,
            posterior_low: 0.5,
            trace: "bayes: insufficient data".to_string(),
        };
    }

    let pattern = render_pattern(outcomes);
    let len = outcomes.len();
    let prior_high = high_fraction(outcomes);
    let prior_low = 1.0 - prior_high;
    let prior_high = if prior_high == 0.0 { 0.5 } else { prior_high };
    let prior_low = if prior_low == 0.0 { 0.5 } else { prior_low };

    let mut sum_high = 0.0;
    let mut sum_low = 0.0;
    for feature_len in FEATURE_LENGTHS {
        let width = feature_len.min(len - 1);
        let feature = &pattern[len - width..];

        let (mut given_high, mut given_low) = (0_u32, 0_u32);
        for start in 0..len - width {
            if &pattern[start..start + width] == feature {
                match outcomes[start + width] {
                    Outcome::High => given_high += 1,
                    Outcome::Low => given_low += 1,
                }
            }
        }

        let observed = f64::from(given_high + given_low) + 2.0;
        let posterior_high = (f64::from(given_high) + 1.0) / observed * prior_high;
        let posterior_low = (f64::from(given_low) + 1.0) / observed * prior_low;
        let evidence = posterior_high + posterior_low;
        let evidence = if evidence == 0.0 { 1.0 } else { evidence };
        sum_high += posterior_high / evidence;
        sum_low += posterior_low / evidence;
    }

    let count = FEATURE_LENGTHS.len() as f64;
    let posterior_high = sum_high / count;
    let posterior_low = sum_low / count;
    let confidence = clamp(
        ((posterior_high - posterior_low).abs().max(0.5) * 100.0).round(),
        50.0,
        99.0,
    );

    BayesEstimate {
        forecast: if posterior_high >= posterior_low {
            Outcome::High
        } else {
            Outcome::Low
        },
        confidence,
        posterior_high,
        posterior_low,
        trace: format!(
            "bayes[{}]: P(H)={:.1}% P(L)={:.1}%",
            FEATURE_LENGTHS.map(|n| n.to_string()).join("/"),
            posterior_high * 100.0,
            posterior_low * 100.0
        ),
    }
}
