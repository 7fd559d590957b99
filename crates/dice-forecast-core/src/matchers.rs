//! Window, N-gram and bridge-motif matchers plus the frequency estimators
//! that feed the combiner alongside them.

use serde::{Deserialize, Serialize};

use crate::clamp;
use crate::outcome::{current_streak, high_fraction, render_pattern, Outcome};
use crate::rules::RuleDecision;
use crate::signature::SignatureLibrary;

pub const MAX_WINDOW: usize = 8;
pub const NGRAM_MIN_LEN: usize = 3;
pub const NGRAM_MAX_LEN: usize = 6;
pub const LOCAL_TREND_LOOKBACKS: [usize; 3] = [10, 20, 50];

pub const NO_DATA_LABEL: &str = "no data";
pub const NO_CLEAR_PATTERN_LABEL: &str = "no clear pattern";

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct VoteTally {
    pub high: f64,
    pub low: f64,
}

impl VoteTally {
    pub fn add(&mut self, outcome: Outcome, amount: f64) {
        match outcome {
            Outcome::High => self.high += amount,
            Outcome::Low => self.low += amount,
        }
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.high == 0.0 && self.low == 0.0
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct WindowVotes {
    pub high: u32,
    pub low: u32,
}

impl WindowVotes {
    #[must_use]
    pub fn total(self) -> u32 {
        self.high + self.low
    }
}

/// For every window size `2..=max_window`, finds earlier exact repeats of
/// the trailing window and counts what followed each repeat.
#[must_use]
pub fn sliding_window_votes(outcomes: &[Outcome], max_window: usize) -> WindowVotes {
    let pattern = render_pattern(outcomes);
    let len = outcomes.len();
    let mut votes = WindowVotes::default();

    for window in 2..=max_window {
        if len <= window {
            continue;
        }
        let recent = &pattern[len - window..];
        for start in 0..len - window {
            if &pattern[start..start + window] == recent {
                match outcomes[start + window] {
                    Outcome::High => votes.high += 1,
                    Outcome::Low => votes.low += 1,
                }
            }
        }
    }

    votes
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NgramMatch {
    pub len: usize,
    pub pattern: String,
    pub high: u32,
    pub low: u32,
    pub p_high: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NgramResult {
    pub forecast: Outcome,
    pub confidence: f64,
    pub score_high: f64,
    pub score_low: f64,
    pub matches: Vec<NgramMatch>,
}

impl NgramResult {
    /// Probability of High implied by the forecast and its confidence.
    #[must_use]
    pub fn prob_high(&self) -> f64 {
        self.forecast.prob_high_at(self.confidence)
    }
}

/// Continuation matcher over trailing N-grams of length 3 to 6.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn ngram_match(outcomes: &[Outcome]) -> NgramResult {
    if outcomes.len() < NGRAM_MIN_LEN {
        return NgramResult {
            forecast: Outcome::High,
            confidence: 50.0,
            score_high: 0.0,
            score_low: 0.0,
            matches: Vec::new(),
        };
    }

    let pattern = render_pattern(outcomes);
    let len = outcomes.len();
    let mut scores = VoteTally::default();
    let mut matches = Vec::new();

    for gram in NGRAM_MIN_LEN..=NGRAM_MAX_LEN {
        if len <= gram {
            continue;
        }
        let suffix = &pattern[len - gram..];
        let (mut high, mut low) = (0_u32, 0_u32);
        for start in 0..len - gram {
            if &pattern[start..start + gram] == suffix {
                match outcomes[start + gram] {
                    Outcome::High => high += 1,
                    Outcome::Low => low += 1,
                }
            }
        }

        let total = high + low;
        if total == 0 {
            continue;
        }
        let p_high = f64::from(high) / f64::from(total);
        let local_confidence = clamp(50.0 + 5.0 * f64::from(total), 50.0, 90.0);
        let side = if p_high >= 0.5 { Outcome::High } else { Outcome::Low };
        scores.add(side, f64::from(total) * local_confidence / 100.0);
        matches.push(NgramMatch {
            len: gram,
            pattern: suffix.to_string(),
            high,
            low,
            p_high,
        });
    }

    let sum = scores.high + scores.low;
    let denominator = if sum == 0.0 { 1.0 } else { sum };
    let confidence = clamp(
        50.0 + (scores.high - scores.low).abs() / denominator * 100.0,
        50.0,
        90.0,
    );

    NgramResult {
        forecast: if scores.high >= scores.low {
            Outcome::High
        } else {
            Outcome::Low
        },
        confidence,
        score_high: scores.high,
        score_low: scores.low,
        matches,
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum MotifClass {
    Streak,
    Break,
}

impl MotifClass {
    #[must_use]
    pub fn vote_weight(self) -> f64 {
        match self {
            Self::Streak => 18.0,
            Self::Break => 20.0,
        }
    }

    #[must_use]
    pub fn rule_confidence(self) -> u8 {
        match self {
            Self::Streak => 90,
            Self::Break => 92,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BridgeMotif {
    pub name: &'static str,
    pub class: MotifClass,
    pub suffixes: &'static [&'static str],
}

/// Suffix literals with embedded spaces can never match a rendered history,
/// so "3-3", "3-2-1", "3-1-2" and "1-3-2" carry one literal fewer.
pub const BRIDGE_MOTIFS: [BridgeMotif; 16] = [
    BridgeMotif {
        name: "1-1",
        class: MotifClass::Streak,
        suffixes: &["HLHL", "LHLH", "HLHLH", "LHLHL", "HLHLHL", "LHLHLH"],
    },
    BridgeMotif {
        name: "2-2",
        class: MotifClass::Streak,
        suffixes: &["HHLLHH", "LLHHLL", "HHLLHHLL", "LLHHLLHH"],
    },
    BridgeMotif {
        name: "3-3",
        class: MotifClass::Streak,
        suffixes: &["HHHLLL", "LLLHHH", "HHHLLLH"],
    },
    BridgeMotif {
        name: "1-2-3",
        class: MotifClass::Streak,
        suffixes: &["HLLHHH", "LHHLLL", "HLLHHHLL", "LHHLLLH"],
    },
    BridgeMotif {
        name: "3-2-1",
        class: MotifClass::Streak,
        suffixes: &["HHHLLH", "LLLHHL", "HHHLLHH"],
    },
    BridgeMotif {
        name: "1-2-1",
        class: MotifClass::Streak,
        suffixes: &["HLLH", "LHHL", "HLLHH", "LHHLL"],
    },
    BridgeMotif {
        name: "2-1-1-2",
        class: MotifClass::Streak,
        suffixes: &["HHLHLL", "LLHLHH", "HHLHLLHH", "LLHLHHLL"],
    },
    BridgeMotif {
        name: "1-2",
        class: MotifClass::Streak,
        suffixes: &["HLL", "LHH"],
    },
    BridgeMotif {
        name: "2-1",
        class: MotifClass::Streak,
        suffixes: &["HHL", "LLH"],
    },
    BridgeMotif {
        name: "3-1-2",
        class: MotifClass::Streak,
        suffixes: &["HHHLHH"],
    },
    BridgeMotif {
        name: "4-1",
        class: MotifClass::Streak,
        suffixes: &["HHHHL", "LLLLH"],
    },
    BridgeMotif {
        name: "1-3-2",
        class: MotifClass::Streak,
        suffixes: &["HLLLHH"],
    },
    BridgeMotif {
        name: "2-3",
        class: MotifClass::Streak,
        suffixes: &["HHLLL", "LLHHH"],
    },
    BridgeMotif {
        name: "break-4",
        class: MotifClass::Break,
        suffixes: &["HHHHL", "LLLLH"],
    },
    BridgeMotif {
        name: "break-5",
        class: MotifClass::Break,
        suffixes: &["HHHHHL", "LLLLLH"],
    },
    BridgeMotif {
        name: "break-6",
        class: MotifClass::Break,
        suffixes: &["HHHHHHL", "LLLLLLH"],
    },
];

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BridgeMatch {
    pub name: &'static str,
    pub class: MotifClass,
    pub suffix: &'static str,
    pub forecast: Outcome,
}

impl BridgeMatch {
    #[must_use]
    pub fn label(&self) -> String {
        format!("bridge {}", self.name)
    }
}

/// Every (motif, suffix) pair the rendered history ends with, in table order.
///
/// Both classes forecast the inverse of the last outcome.
#[must_use]
pub fn bridge_matches(outcomes: &[Outcome]) -> Vec<BridgeMatch> {
    let Some(last) = outcomes.last() else {
        return Vec::new();
    };
    let pattern = render_pattern(outcomes);

    let mut matches = Vec::new();
    for motif in &BRIDGE_MOTIFS {
        for &suffix in motif.suffixes {
            if pattern.ends_with(suffix) {
                matches.push(BridgeMatch {
                    name: motif.name,
                    class: motif.class,
                    suffix,
                    forecast: last.opposite(),
                });
            }
        }
    }
    matches
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrendWindow {
    pub lookback: usize,
    pub effective: usize,
    pub prob_high: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocalTrend {
    pub prob_high: f64,
    pub n: usize,
    pub windows: Vec<TrendWindow>,
    pub notes: Vec<String>,
}

#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn local_trend(outcomes: &[Outcome], lookbacks: &[usize]) -> LocalTrend {
    if outcomes.is_empty() {
        return LocalTrend {
            prob_high: 0.5,
            n: 0,
            windows: Vec::new(),
            notes: Vec::new(),
        };
    }

    let mut weighted = 0.0;
    let mut weight_sum = 0.0;
    let mut windows = Vec::with_capacity(lookbacks.len());
    let mut notes = Vec::new();

    for &lookback in lookbacks {
        let effective = lookback.min(outcomes.len());
        if effective == 0 {
            continue;
        }
        let prob_high = high_fraction(&outcomes[outcomes.len() - effective..]);
        let weight = (1.0 + effective as f64).log2();
        weighted += prob_high * weight;
        weight_sum += weight;

        if prob_high > 0.7 {
            notes.push(format!(
                "last {lookback}: High skewed ({:.1}%), Low may follow",
                prob_high * 100.0
            ));
        } else if prob_high < 0.3 {
            notes.push(format!(
                "last {lookback}: Low skewed ({:.1}%), High may follow",
                (1.0 - prob_high) * 100.0
            ));
        }
        windows.push(TrendWindow {
            lookback,
            effective,
            prob_high,
        });
    }

    LocalTrend {
        prob_high: if weight_sum > 0.0 {
            weighted / weight_sum
        } else {
            0.5
        },
        n: outcomes.len(),
        windows,
        notes,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GlobalFrequency {
    pub prob_high: f64,
    pub n: usize,
    pub note: String,
}

#[must_use]
pub fn global_frequency(outcomes: &[Outcome]) -> GlobalFrequency {
    let prob_high = high_fraction(outcomes);
    let note = if outcomes.is_empty() {
        NO_DATA_LABEL
    } else if prob_high > 0.6 {
        "high dominant"
    } else if prob_high < 0.4 {
        "low dominant"
    } else {
        "balanced"
    };
    GlobalFrequency {
        prob_high,
        n: outcomes.len(),
        note: note.to_string(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PatternAnalysis {
    pub labels: Vec<String>,
    pub votes: VoteTally,
    pub window_votes: WindowVotes,
}

impl PatternAnalysis {
    /// Labels other than the "nothing found" placeholders.
    #[must_use]
    pub fn clear_label_count(&self) -> usize {
        self.labels
            .iter()
            .filter(|label| label.as_str() != NO_CLEAR_PATTERN_LABEL && label.as_str() != NO_DATA_LABEL)
            .count()
    }
}

/// Tallies pattern-level votes and the labels that justify them.
///
/// `rule` is the rule engine decision already taken for this request; it is
/// passed in so the engine mutates learning state once per forecast.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn analyze_patterns(
    outcomes: &[Outcome],
    signatures: &SignatureLibrary,
    rule: Option<&RuleDecision>,
) -> PatternAnalysis {
    let mut labels = Vec::new();
    let mut votes = VoteTally::default();

    if outcomes.is_empty() {
        return PatternAnalysis {
            labels: vec![NO_DATA_LABEL.to_string()],
            votes,
            window_votes: WindowVotes::default(),
        };
    }

    if let Some(entry) = signatures.lookup(&render_pattern(outcomes)) {
        labels.push(entry.rationale.clone());
        votes.add(entry.forecast, f64::from(entry.confidence) * 0.6);
    }

    if let Some(streak) = current_streak(outcomes).filter(|streak| streak.len >= 3) {
        let len = streak.len as f64;
        labels.push(format!("streak {} ({})", streak.side, streak.len));
        votes.add(streak.side, (12.0 + (len - 3.0) * 2.5).min(28.0));
        if streak.len >= 4 {
            labels.push(format!("break after {} streak of {}", streak.side, streak.len));
            votes.add(streak.side.opposite(), 15.0 + (len - 4.0) * 5.0);
        }
    }

    for bridge in bridge_matches(outcomes) {
        labels.push(bridge.label());
        votes.add(bridge.forecast, bridge.class.vote_weight());
    }

    let window_votes = sliding_window_votes(outcomes, MAX_WINDOW);
    votes.high += f64::from(window_votes.high) * 2.0;
    votes.low += f64::from(window_votes.low) * 2.0;
    if window_votes.total() > 0 {
        labels.push(format!(
            "sliding window {}/{}",
            window_votes.high, window_votes.low
        ));
    }

    if let Some(decision) = rule {
        labels.push(decision.explanation.clone());
        votes.add(decision.forecast, f64::from(decision.confidence) * 0.35);
    }

    if labels.is_empty() {
        labels.push(NO_CLEAR_PATTERN_LABEL.to_string());
    }

    PatternAnalysis {
        labels,
        votes,
        window_votes,
    }
}
