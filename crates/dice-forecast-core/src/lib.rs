//! Prediction-ensemble engine for High/Low dice rounds.
//!
//! The crate is pure: it never touches the network or disk. Callers feed it
//! normalized [`Round`]s, own the mutable [`LearningState`], and persist both
//! between requests.

use time::{OffsetDateTime, UtcOffset};

pub mod bayes;
pub mod combiner;
pub mod config;
pub mod engine;
pub mod experts;
pub mod forecast;
pub mod markov;
pub mod matchers;
pub mod monte_carlo;
pub mod outcome;
pub mod randomness;
pub mod rules;
pub mod signature;
pub mod state;

pub use config::{EnsembleConfig, EnsembleWeights};
pub use engine::{EngineCheckpoint, ForecastEngine, HistoryStats, IngestReport};
pub use forecast::{Diagnostics, ForecastReport, FORECAST_CONTRACT_VERSION};
pub use outcome::{Dice, Outcome, Round, RoundInput, Streak, MAX_ROUND_ID};
pub use signature::{SignatureEntry, SignatureLibrary, SignatureOrigin};
pub use state::LearningState;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ForecastError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("not ready: no round history has been ingested")]
    NotReady,
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`ForecastError::Validation`] when parsing fails or the
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, ForecastError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| ForecastError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(ForecastError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`ForecastError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, ForecastError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            ForecastError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

pub(crate) fn clamp(value: f64, min: f64, max: f64) -> f64 {
    value.min(max).max(min)
}
