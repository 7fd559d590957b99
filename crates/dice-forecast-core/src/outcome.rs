use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::ForecastError;

/// Totals at or above this value resolve to [`Outcome::High`].
pub const HIGH_TOTAL_THRESHOLD: u8 = 11;
pub const MIN_TOTAL: u8 = 3;
pub const MAX_TOTAL: u8 = 18;
/// Largest round id the round log can store (SQLite INTEGER).
pub const MAX_ROUND_ID: u64 = i64::MAX.unsigned_abs();

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    High,
    Low,
}

impl Outcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Low => "low",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "high" => Some(Self::High),
            "low" => Some(Self::Low),
            _ => None,
        }
    }

    /// Single-character symbol used in rendered pattern strings.
    #[must_use]
    pub fn symbol(self) -> char {
        match self {
            Self::High => 'H',
            Self::Low => 'L',
        }
    }

    #[must_use]
    pub fn from_symbol(symbol: char) -> Option<Self> {
        match symbol {
            'H' => Some(Self::High),
            'L' => Some(Self::Low),
            _ => None,
        }
    }

    #[must_use]
    pub fn opposite(self) -> Self {
        match self {
            Self::High => Self::Low,
            Self::Low => Self::High,
        }
    }

    #[must_use]
    pub fn from_total(total: u8) -> Self {
        if total >= HIGH_TOTAL_THRESHOLD {
            Self::High
        } else {
            Self::Low
        }
    }

    /// `+1.0` for High, `-1.0` for Low.
    #[must_use]
    pub fn sign(self) -> f64 {
        match self {
            Self::High => 1.0,
            Self::Low => -1.0,
        }
    }

    /// Probability of High implied by a forecast of `self` held at
    /// `confidence` percent.
    #[must_use]
    pub fn prob_high_at(self, confidence: f64) -> f64 {
        let certainty = (confidence / 100.0).clamp(0.0, 1.0);
        match self {
            Self::High => certainty,
            Self::Low => 1.0 - certainty,
        }
    }
}

impl Display for Outcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::High => write!(f, "High"),
            Self::Low => write!(f, "Low"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct Dice(pub [u8; 3]);

impl Dice {
    /// Replaces any face outside `1..=6` with the neutral face `1`.
    #[must_use]
    pub fn sanitized(raw: [i64; 3]) -> Self {
        let mut faces = [1_u8; 3];
        for (slot, value) in faces.iter_mut().zip(raw) {
            if (1..=6).contains(&value) {
                *slot = u8::try_from(value).unwrap_or(1);
            }
        }
        Self(faces)
    }

    #[must_use]
    pub fn faces(self) -> [u8; 3] {
        self.0
    }

    #[must_use]
    pub fn total(self) -> u8 {
        self.0.iter().sum()
    }

    #[must_use]
    pub fn contains(self, face: u8) -> bool {
        self.0.contains(&face)
    }
}

impl Display for Dice {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}-{}", self.0[0], self.0[1], self.0[2])
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Round {
    pub round_id: u64,
    pub outcome: Outcome,
    pub dice: Dice,
    pub total: u8,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5: Option<String>,
}

/// Loosely-shaped round as received at the ingestion boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoundInput {
    pub round_id: u64,
    #[serde(default)]
    pub outcome: Option<Outcome>,
    pub dice: [i64; 3],
    #[serde(default)]
    pub total: Option<i64>,
    #[serde(default)]
    pub md5: Option<String>,
}

impl RoundInput {
    /// Validates and normalizes an input into an immutable [`Round`].
    ///
    /// Out-of-range die faces are replaced by `1`; a missing total is the sum
    /// of the sanitized faces; a missing outcome is derived from the total.
    ///
    /// # Errors
    /// Returns [`ForecastError::Validation`] when `round_id` is outside
    /// `1..=MAX_ROUND_ID` or an explicit total lies outside `3..=18`.
    pub fn normalize(&self, recorded_at: OffsetDateTime) -> Result<Round, ForecastError> {
        if self.round_id == 0 {
            return Err(ForecastError::Validation(
                "round_id MUST be >= 1".to_string(),
            ));
        }
        if self.round_id > MAX_ROUND_ID {
            return Err(ForecastError::Validation(format!(
                "round_id MUST be <= {MAX_ROUND_ID}, got {}",
                self.round_id
            )));
        }

        let dice = Dice::sanitized(self.dice);
        let total = match self.total {
            Some(raw) => u8::try_from(raw)
                .ok()
                .filter(|value| (MIN_TOTAL..=MAX_TOTAL).contains(value))
                .ok_or_else(|| {
                    ForecastError::Validation(format!("total MUST be in [3, 18], got {raw}"))
                })?,
            None => dice.total(),
        };

        let md5 = self
            .md5
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string);

        Ok(Round {
            round_id: self.round_id,
            outcome: self.outcome.unwrap_or_else(|| Outcome::from_total(total)),
            dice,
            total,
            recorded_at,
            md5,
        })
    }
}

/// Trailing run of identical outcomes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct Streak {
    pub side: Outcome,
    pub len: usize,
}

#[must_use]
pub fn current_streak(outcomes: &[Outcome]) -> Option<Streak> {
    let side = *outcomes.last()?;
    let len = outcomes
        .iter()
        .rev()
        .take_while(|outcome| **outcome == side)
        .count();
    Some(Streak { side, len })
}

#[must_use]
pub fn render_pattern(outcomes: &[Outcome]) -> String {
    outcomes.iter().map(|outcome| outcome.symbol()).collect()
}

/// Fraction of High outcomes, `0.5` for an empty sequence.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn high_fraction(outcomes: &[Outcome]) -> f64 {
    if outcomes.is_empty() {
        return 0.5;
    }
    let highs = outcomes.iter().filter(|o| **o == Outcome::High).count();
    highs as f64 / outcomes.len() as f64
}

/// Shannon entropy of a Bernoulli(p) variable in bits.
#[must_use]
pub fn binary_entropy(p: f64) -> f64 {
    if p <= 0.0 || p >= 1.0 {
        return 0.0;
    }
    -(p * p.log2() + (1.0 - p) * (1.0 - p).log2())
}

/// Describes a pattern string by its run lengths, e.g. `HHLHHH` -> `runs 2-1-3`.
#[must_use]
pub fn run_shape(pattern: &str) -> String {
    let mut runs = Vec::new();
    let mut previous = None;
    for symbol in pattern.chars() {
        match (previous, runs.last_mut()) {
            (Some(prev), Some(count)) if prev == symbol => *count += 1,
            _ => runs.push(1_usize),
        }
        previous = Some(symbol);
    }

    let joined = runs
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("-");
    format!("runs {joined}")
}
