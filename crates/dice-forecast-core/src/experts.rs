//! Panel of twenty narrow heuristics. Each expert always votes; when its
//! data is insufficient it repeats the last outcome (High when empty) at
//! confidence 50.

use std::collections::HashMap;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::clamp;
use crate::outcome::{binary_entropy, current_streak, high_fraction, render_pattern, Dice, Outcome};

pub const PANEL_SIZE: usize = 20;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExpertKind {
    StreakBreak,
    ShortAlternation,
    ThreeOneTwo,
    RecentExcess,
    DiceRepeat,
    TotalTrend,
    NearBias,
    MeanReversion,
    VarianceRegime,
    EntropyBias,
    StreakProbability,
    LongAlternation,
    ThreeTwoOne,
    Die1Bias,
    Die2Bias,
    Die3Bias,
    TotalParity,
    RoundParity,
    Contrarian,
    Random,
}

impl ExpertKind {
    pub const ALL: [Self; PANEL_SIZE] = [
        Self::StreakBreak,
        Self::ShortAlternation,
        Self::ThreeOneTwo,
        Self::RecentExcess,
        Self::DiceRepeat,
        Self::TotalTrend,
        Self::NearBias,
        Self::MeanReversion,
        Self::VarianceRegime,
        Self::EntropyBias,
        Self::StreakProbability,
        Self::LongAlternation,
        Self::ThreeTwoOne,
        Self::Die1Bias,
        Self::Die2Bias,
        Self::Die3Bias,
        Self::TotalParity,
        Self::RoundParity,
        Self::Contrarian,
        Self::Random,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StreakBreak => "streak_break",
            Self::ShortAlternation => "short_alternation",
            Self::ThreeOneTwo => "three_one_two",
            Self::RecentExcess => "recent_excess",
            Self::DiceRepeat => "dice_repeat",
            Self::TotalTrend => "total_trend",
            Self::NearBias => "near_bias",
            Self::MeanReversion => "mean_reversion",
            Self::VarianceRegime => "variance_regime",
            Self::EntropyBias => "entropy_bias",
            Self::StreakProbability => "streak_probability",
            Self::LongAlternation => "long_alternation",
            Self::ThreeTwoOne => "three_two_one",
            Self::Die1Bias => "die1_bias",
            Self::Die2Bias => "die2_bias",
            Self::Die3Bias => "die3_bias",
            Self::TotalParity => "total_parity",
            Self::RoundParity => "round_parity",
            Self::Contrarian => "contrarian",
            Self::Random => "random",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExpertVote {
    pub expert: ExpertKind,
    pub forecast: Outcome,
    pub confidence: f64,
    pub reason: String,
}

#[derive(Debug, Clone, Copy)]
pub struct ExpertInputs<'a> {
    pub outcomes: &'a [Outcome],
    pub dice: &'a [Dice],
    pub totals: &'a [u8],
    pub round_id: u64,
}

impl ExpertInputs<'_> {
    fn last_or_high(&self) -> Outcome {
        self.outcomes.last().copied().unwrap_or(Outcome::High)
    }
}

/// Runs every expert in [`ExpertKind::ALL`] order. Only [`ExpertKind::Random`]
/// draws from `rng`.
pub fn run_panel<R: Rng>(inputs: &ExpertInputs<'_>, rng: &mut R) -> Vec<ExpertVote> {
    ExpertKind::ALL
        .iter()
        .map(|kind| {
            let (forecast, confidence, reason) = judge(*kind, inputs, rng);
            ExpertVote {
                expert: *kind,
                forecast,
                confidence,
                reason,
            }
        })
        .collect()
}

/// Mean of `sign * confidence / 100` across the panel, zero when empty.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn panel_lean(votes: &[ExpertVote]) -> f64 {
    if votes.is_empty() {
        return 0.0;
    }
    let sum: f64 = votes
        .iter()
        .map(|vote| vote.forecast.sign() * vote.confidence / 100.0)
        .sum();
    sum / votes.len() as f64
}

type Judgement = (Outcome, f64, String);

fn judge<R: Rng>(kind: ExpertKind, inputs: &ExpertInputs<'_>, rng: &mut R) -> Judgement {
    let last = inputs.last_or_high();
    if inputs.outcomes.is_empty() && needs_outcomes(kind) {
        return (last, 50.0, "no history".to_string());
    }

    match kind {
        ExpertKind::StreakBreak => streak_break(inputs.outcomes, last),
        ExpertKind::ShortAlternation => alternation(inputs.outcomes, last, 6, 76.0),
        ExpertKind::ThreeOneTwo => shape(inputs.outcomes, last, [("HHHL", Outcome::High), ("LLLH", Outcome::Low)], 72.0),
        ExpertKind::RecentExcess => recent_excess(inputs.outcomes, last),
        ExpertKind::DiceRepeat => dice_repeat(inputs.dice),
        ExpertKind::TotalTrend => total_trend(inputs.totals, last),
        ExpertKind::NearBias => near_bias(inputs.outcomes, last),
        ExpertKind::MeanReversion => mean_reversion(inputs.totals),
        ExpertKind::VarianceRegime => variance_regime(inputs.totals),
        ExpertKind::EntropyBias => entropy_bias(inputs.outcomes),
        ExpertKind::StreakProbability => streak_probability(inputs.outcomes, last),
        ExpertKind::LongAlternation => alternation(inputs.outcomes, last, 8, 78.0),
        ExpertKind::ThreeTwoOne => shape(inputs.outcomes, last, [("HHHLL", Outcome::High), ("LLLHH", Outcome::Low)], 75.0),
        ExpertKind::Die1Bias => die_bias(inputs.dice, 0),
        ExpertKind::Die2Bias => die_bias(inputs.dice, 1),
        ExpertKind::Die3Bias => die_bias(inputs.dice, 2),
        ExpertKind::TotalParity => total_parity(inputs.totals),
        ExpertKind::RoundParity => {
            let side = if inputs.round_id % 2 == 0 { Outcome::High } else { Outcome::Low };
            (side, 52.0, format!("round {} parity", inputs.round_id))
        }
        ExpertKind::Contrarian => (last.opposite(), 55.0, "opposite of last".to_string()),
        ExpertKind::Random => {
            let side = if rng.random_bool(0.5) { Outcome::High } else { Outcome::Low };
            (side, 50.0, "coin flip".to_string())
        }
    }
}

fn needs_outcomes(kind: ExpertKind) -> bool {
    matches!(
        kind,
        ExpertKind::StreakBreak
            | ExpertKind::ShortAlternation
            | ExpertKind::ThreeOneTwo
            | ExpertKind::RecentExcess
            | ExpertKind::NearBias
            | ExpertKind::StreakProbability
            | ExpertKind::LongAlternation
            | ExpertKind::ThreeTwoOne
    )
}

fn streak_break(outcomes: &[Outcome], last: Outcome) -> Judgement {
    match current_streak(outcomes) {
        Some(streak) if streak.len >= 4 => (
            streak.side.opposite(),
            78.0,
            format!("{} streak of {}", streak.side, streak.len),
        ),
        _ => (last, 60.0, "no strong streak".to_string()),
    }
}

fn alternation(outcomes: &[Outcome], last: Outcome, window: usize, confidence: f64) -> Judgement {
    if outcomes.len() < window {
        return (last, 50.0, "not enough history".to_string());
    }
    let tail = &outcomes[outcomes.len() - window..];
    if tail.windows(2).all(|pair| pair[0] != pair[1]) {
        (last.opposite(), confidence, format!("alternating over {window}"))
    } else {
        (last, 48.0, "no alternation".to_string())
    }
}

fn shape(outcomes: &[Outcome], last: Outcome, shapes: [(&str, Outcome); 2], confidence: f64) -> Judgement {
    let pattern = render_pattern(outcomes);
    for (suffix, forecast) in shapes {
        if pattern.ends_with(suffix) {
            return (forecast, confidence, format!("ends with {suffix}"));
        }
    }
    (last, 50.0, "shape absent".to_string())
}

fn highs_in_last_ten(outcomes: &[Outcome]) -> usize {
    outcomes
        .iter()
        .rev()
        .take(10)
        .filter(|outcome| **outcome == Outcome::High)
        .count()
}

fn recent_excess(outcomes: &[Outcome], last: Outcome) -> Judgement {
    let highs = highs_in_last_ten(outcomes);
    if highs >= 7 {
        (Outcome::Low, 68.0, format!("{highs}/10 recent High"))
    } else if highs <= 3 {
        (Outcome::High, 68.0, format!("{highs}/10 recent High"))
    } else {
        (last, 50.0, "recent mix balanced".to_string())
    }
}

fn dice_repeat(dice: &[Dice]) -> Judgement {
    if dice.len() < 3 {
        return (Outcome::High, 50.0, "not enough dice".to_string());
    }

    let recent = &dice[dice.len().saturating_sub(50)..];
    let mut counts: HashMap<Dice, (usize, usize)> = HashMap::new();
    for (index, combo) in recent.iter().enumerate() {
        counts.entry(*combo).or_insert((0, index)).0 += 1;
    }
    // most frequent, earliest first-seen on ties
    let top = counts
        .into_iter()
        .max_by(|(_, left), (_, right)| left.0.cmp(&right.0).then(right.1.cmp(&left.1)));

    match top {
        Some((combo, (count, _))) => (
            Outcome::from_total(combo.total()),
            65.0,
            format!("common combo {combo} x{count}"),
        ),
        None => (Outcome::High, 50.0, "no combo".to_string()),
    }
}

fn total_trend(totals: &[u8], last: Outcome) -> Judgement {
    if totals.len() < 6 {
        return (last, 50.0, "not enough totals".to_string());
    }
    let tail = &totals[totals.len() - 5..];
    let up = tail.windows(2).filter(|pair| pair[1] > pair[0]).count();
    let down = tail.windows(2).filter(|pair| pair[1] < pair[0]).count();
    if up >= 3 {
        (Outcome::High, 66.0, "totals trending up".to_string())
    } else if down >= 3 {
        (Outcome::Low, 66.0, "totals trending down".to_string())
    } else {
        (last, 50.0, "totals flat".to_string())
    }
}

#[allow(clippy::cast_precision_loss)]
fn near_bias(outcomes: &[Outcome], last: Outcome) -> Judgement {
    let highs = highs_in_last_ten(outcomes);
    let forecast = if highs >= 6 {
        Outcome::High
    } else if highs <= 4 {
        Outcome::Low
    } else {
        last
    };
    let confidence = clamp(50.0 + (highs as f64 - 5.0).abs() * 5.0, 45.0, 90.0);
    (forecast, confidence, format!("last10 High={highs}"))
}

fn mean_reversion(totals: &[u8]) -> Judgement {
    match totals.last() {
        None => (Outcome::High, 50.0, "no totals".to_string()),
        Some(&total) if total >= 14 => (Outcome::Low, 65.0, format!("high total {total}, expect reversion")),
        Some(&total) if total <= 7 => (Outcome::High, 65.0, format!("low total {total}, expect reversion")),
        Some(&total) => (Outcome::High, 50.0, format!("total {total} near mean")),
    }
}

#[allow(clippy::cast_precision_loss)]
fn variance_regime(totals: &[u8]) -> Judgement {
    if totals.len() < 2 {
        return (Outcome::High, 50.0, "no totals".to_string());
    }
    let tail = &totals[totals.len().saturating_sub(10)..];
    let n = tail.len() as f64;
    let mean = tail.iter().map(|t| f64::from(*t)).sum::<f64>() / n;
    let variance = tail
        .iter()
        .map(|t| (f64::from(*t) - mean).powi(2))
        .sum::<f64>()
        / n;
    if variance > 10.0 {
        (Outcome::High, 60.0, format!("variance {variance:.1} high"))
    } else if variance < 5.0 {
        (Outcome::Low, 60.0, format!("variance {variance:.1} low"))
    } else {
        (Outcome::High, 50.0, format!("variance {variance:.1} normal"))
    }
}

fn entropy_bias(outcomes: &[Outcome]) -> Judgement {
    let entropy = binary_entropy(high_fraction(outcomes));
    if entropy > 0.8 {
        (Outcome::High, 55.0, format!("entropy {entropy:.2} high"))
    } else {
        (Outcome::Low, 55.0, format!("entropy {entropy:.2} low"))
    }
}

fn streak_probability(outcomes: &[Outcome], last: Outcome) -> Judgement {
    match current_streak(outcomes) {
        Some(streak) if streak.len >= 5 => (
            streak.side.opposite(),
            80.0,
            format!("long {} streak, expect a break", streak.side),
        ),
        Some(streak) => (streak.side, 70.0, "continue streak".to_string()),
        None => (last, 50.0, "no history".to_string()),
    }
}

#[allow(clippy::cast_precision_loss)]
fn die_bias(dice: &[Dice], position: usize) -> Judgement {
    if dice.is_empty() {
        return (Outcome::High, 50.0, format!("die{} no data", position + 1));
    }
    let mut counts = [0_usize; 6];
    for face in dice.iter().filter_map(|d| d.faces().get(position).copied()) {
        if (1..=6).contains(&face) {
            counts[usize::from(face - 1)] += 1;
        }
    }

    let mut best_face = 1;
    let mut best_count = 0;
    for (index, count) in counts.iter().enumerate() {
        if *count > best_count {
            best_count = *count;
            best_face = index + 1;
        }
    }

    if best_count as f64 / dice.len() as f64 > 0.25 {
        let forecast = if best_face > 3 { Outcome::High } else { Outcome::Low };
        (forecast, 62.0, format!("die{} biased to {best_face}", position + 1))
    } else {
        (Outcome::High, 50.0, format!("die{} unbiased", position + 1))
    }
}

fn total_parity(totals: &[u8]) -> Judgement {
    match totals.last() {
        None => (Outcome::High, 50.0, "no totals".to_string()),
        Some(total) if total % 2 == 0 => (Outcome::High, 55.0, "even total".to_string()),
        Some(_) => (Outcome::Low, 55.0, "odd total".to_string()),
    }
}
