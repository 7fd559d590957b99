//! Priority-ordered decision list. The first rule whose `matches` holds
//! decides; some rules write back into [`LearningState`].

use serde::{Deserialize, Serialize};

use crate::matchers::{bridge_matches, MotifClass};
use crate::outcome::{binary_entropy, current_streak, high_fraction, render_pattern, Dice, Outcome};
use crate::signature::SignatureLibrary;
use crate::state::{error_key, LearnedPattern, LearningState};

pub const LOW_ENTROPY_THRESHOLD: f64 = 0.5;
pub const LOW_ENTROPY_MIN_HISTORY: usize = 50;
pub const FALLBACK_CONFIDENCE: u8 = 72;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    LowEntropy,
    Signature,
    PatternMemory,
    ErrorMemory,
    ConsecutiveMisses,
    Streak,
    BridgeMotif,
    LearnedPattern,
    Fallback,
}

impl RuleKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LowEntropy => "low_entropy",
            Self::Signature => "signature",
            Self::PatternMemory => "pattern_memory",
            Self::ErrorMemory => "error_memory",
            Self::ConsecutiveMisses => "consecutive_misses",
            Self::Streak => "streak",
            Self::BridgeMotif => "bridge_motif",
            Self::LearnedPattern => "learned_pattern",
            Self::Fallback => "fallback",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuleDecision {
    pub rule: RuleKind,
    pub forecast: Outcome,
    pub confidence: u8,
    pub explanation: String,
}

impl RuleDecision {
    fn new(rule: RuleKind, forecast: Outcome, confidence: u8, explanation: String) -> Self {
        Self {
            rule,
            forecast,
            confidence,
            explanation,
        }
    }

    #[must_use]
    pub fn prob_high(&self) -> f64 {
        self.forecast.prob_high_at(f64::from(self.confidence))
    }
}

/// Read-only inputs of one rule evaluation.
#[derive(Debug, Clone)]
pub struct RuleContext<'a> {
    pub outcomes: &'a [Outcome],
    pub pattern: String,
    pub dice: Dice,
    pub total: u8,
    pub signatures: &'a SignatureLibrary,
}

impl<'a> RuleContext<'a> {
    #[must_use]
    pub fn new(
        outcomes: &'a [Outcome],
        dice: Dice,
        total: u8,
        signatures: &'a SignatureLibrary,
    ) -> Self {
        Self {
            outcomes,
            pattern: render_pattern(outcomes),
            dice,
            total,
            signatures,
        }
    }

    fn last(&self) -> Option<Outcome> {
        self.outcomes.last().copied()
    }
}

pub trait Rule: Send + Sync {
    fn kind(&self) -> RuleKind;

    fn matches(&self, ctx: &RuleContext<'_>, state: &LearningState) -> bool;

    /// Produces the decision for a context that [`Rule::matches`]; `None`
    /// lets evaluation fall through to the next rule.
    fn apply(&self, ctx: &RuleContext<'_>, state: &mut LearningState) -> Option<RuleDecision>;
}

struct LowEntropyRule;

impl Rule for LowEntropyRule {
    fn kind(&self) -> RuleKind {
        RuleKind::LowEntropy
    }

    fn matches(&self, ctx: &RuleContext<'_>, _state: &LearningState) -> bool {
        ctx.outcomes.len() > LOW_ENTROPY_MIN_HISTORY
            && binary_entropy(high_fraction(ctx.outcomes)) < LOW_ENTROPY_THRESHOLD
    }

    fn apply(&self, ctx: &RuleContext<'_>, _state: &mut LearningState) -> Option<RuleDecision> {
        let entropy = binary_entropy(high_fraction(ctx.outcomes));
        Some(RuleDecision::new(
            self.kind(),
            ctx.last()?.opposite(),
            85,
            format!("low entropy ({entropy:.2}), betting against the bias"),
        ))
    }
}

struct SignatureRule;

impl Rule for SignatureRule {
    fn kind(&self) -> RuleKind {
        RuleKind::Signature
    }

    fn matches(&self, ctx: &RuleContext<'_>, _state: &LearningState) -> bool {
        ctx.signatures.lookup(&ctx.pattern).is_some()
    }

    fn apply(&self, ctx: &RuleContext<'_>, _state: &mut LearningState) -> Option<RuleDecision> {
        let entry = ctx.signatures.lookup(&ctx.pattern)?;
        Some(RuleDecision::new(
            self.kind(),
            entry.forecast,
            entry.confidence,
            entry.rationale.clone(),
        ))
    }
}

struct PatternMemoryRule {
    min_occurrences: u32,
    min_accuracy: f64,
}

impl PatternMemoryRule {
    fn best<'s>(&self, ctx: &RuleContext<'_>, state: &'s LearningState) -> Option<(&'s str, f64, Outcome)> {
        state
            .pattern_memory
            .iter()
            .filter(|(key, stats)| {
                ctx.pattern.ends_with(key.as_str())
                    && stats.occurrences >= self.min_occurrences
                    && stats.accuracy() >= self.min_accuracy
            })
            .map(|(key, stats)| (key.as_str(), stats.accuracy(), stats.most_recent_next))
            .max_by(|left, right| {
                left.1
                    .total_cmp(&right.1)
                    .then(left.0.len().cmp(&right.0.len()))
            })
    }
}

impl Rule for PatternMemoryRule {
    fn kind(&self) -> RuleKind {
        RuleKind::PatternMemory
    }

    fn matches(&self, ctx: &RuleContext<'_>, state: &LearningState) -> bool {
        self.best(ctx, state).is_some()
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn apply(&self, ctx: &RuleContext<'_>, state: &mut LearningState) -> Option<RuleDecision> {
        let (key, accuracy, next) = self.best(ctx, state)?;
        let confidence = 90 + (accuracy * 10.0).floor() as u8;
        Some(RuleDecision::new(
            self.kind(),
            next,
            confidence,
            format!("learned pattern '{key}' with accuracy {accuracy:.2}"),
        ))
    }
}

struct ErrorMemoryRule {
    min_misses: u32,
}

impl Rule for ErrorMemoryRule {
    fn kind(&self) -> RuleKind {
        RuleKind::ErrorMemory
    }

    fn matches(&self, ctx: &RuleContext<'_>, state: &LearningState) -> bool {
        error_key(ctx.outcomes).is_some_and(|key| state.error_count(&key) >= self.min_misses)
    }

    fn apply(&self, ctx: &RuleContext<'_>, state: &mut LearningState) -> Option<RuleDecision> {
        let key = error_key(ctx.outcomes)?;
        let forecast = ctx.last()?.opposite();
        Some(RuleDecision::new(
            self.kind(),
            forecast,
            89,
            format!(
                "pattern {key} missed {} times, switching to {forecast}",
                state.error_count(&key)
            ),
        ))
    }
}

struct ConsecutiveMissesRule {
    min_misses: u32,
}

impl Rule for ConsecutiveMissesRule {
    fn kind(&self) -> RuleKind {
        RuleKind::ConsecutiveMisses
    }

    fn matches(&self, _ctx: &RuleContext<'_>, state: &LearningState) -> bool {
        state.consecutive_misses >= self.min_misses
    }

    fn apply(&self, ctx: &RuleContext<'_>, state: &mut LearningState) -> Option<RuleDecision> {
        let forecast = ctx.last()?.opposite();
        Some(RuleDecision::new(
            self.kind(),
            forecast,
            88,
            format!(
                "{} misses in a row, switching to {forecast}",
                state.consecutive_misses
            ),
        ))
    }
}

/// Rides runs of three or more, with a one-shot break attempt on long runs
/// that persists until the watched die face shows up.
struct StreakRule;

impl StreakRule {
    fn watched_face(side: Outcome) -> u8 {
        match side {
            Outcome::High => 3,
            Outcome::Low => 5,
        }
    }
}

impl Rule for StreakRule {
    fn kind(&self) -> RuleKind {
        RuleKind::Streak
    }

    fn matches(&self, ctx: &RuleContext<'_>, _state: &LearningState) -> bool {
        current_streak(ctx.outcomes).is_some_and(|streak| streak.len >= 3)
    }

    fn apply(&self, ctx: &RuleContext<'_>, state: &mut LearningState) -> Option<RuleDecision> {
        let streak = current_streak(ctx.outcomes)?;
        let side = streak.side;
        let face = Self::watched_face(side);
        let watched_showing = ctx.dice.contains(face);

        let (forecast, confidence, explanation) = if streak.len >= 5 && !watched_showing {
            if state.break_attempted(side) {
                (side, 90, format!("holding {side} streak until a {face} shows"))
            } else {
                state.set_break_attempted(side, true);
                (
                    side.opposite(),
                    80,
                    format!("{side} streak of {} without a {face}, trying a break", streak.len),
                )
            }
        } else if watched_showing {
            state.set_break_attempted(side, false);
            (side.opposite(), 95, format!("{side} streak with a {face} showing, breaking"))
        } else {
            (side, 93, format!("{side} streak ({})", streak.len))
        };

        Some(RuleDecision::new(self.kind(), forecast, confidence, explanation))
    }
}

/// Every break literal also ends with a "2-1" suffix, so a break-class
/// match is preferred over the first table hit.
struct BridgeMotifRule;

impl Rule for BridgeMotifRule {
    fn kind(&self) -> RuleKind {
        RuleKind::BridgeMotif
    }

    fn matches(&self, ctx: &RuleContext<'_>, _state: &LearningState) -> bool {
        !bridge_matches(ctx.outcomes).is_empty()
    }

    fn apply(&self, ctx: &RuleContext<'_>, _state: &mut LearningState) -> Option<RuleDecision> {
        let matches = bridge_matches(ctx.outcomes);
        let bridge = matches
            .iter()
            .find(|bridge| bridge.class == MotifClass::Break)
            .or_else(|| matches.first())?;
        Some(RuleDecision::new(
            self.kind(),
            bridge.forecast,
            bridge.class.rule_confidence(),
            bridge.label(),
        ))
    }
}

struct LearnedPatternRule;

impl Rule for LearnedPatternRule {
    fn kind(&self) -> RuleKind {
        RuleKind::LearnedPattern
    }

    fn matches(&self, ctx: &RuleContext<'_>, state: &LearningState) -> bool {
        state.learned(&ctx.pattern).is_some()
    }

    fn apply(&self, ctx: &RuleContext<'_>, state: &mut LearningState) -> Option<RuleDecision> {
        let learned = state.learned(&ctx.pattern)?;
        Some(RuleDecision::new(
            self.kind(),
            learned.forecast,
            learned.confidence,
            learned.rationale.clone(),
        ))
    }
}

struct FallbackRule;

impl Rule for FallbackRule {
    fn kind(&self) -> RuleKind {
        RuleKind::Fallback
    }

    fn matches(&self, _ctx: &RuleContext<'_>, _state: &LearningState) -> bool {
        true
    }

    fn apply(&self, ctx: &RuleContext<'_>, state: &mut LearningState) -> Option<RuleDecision> {
        let forecast = Outcome::from_total(ctx.total);
        let rationale = format!("fallback on total {}", ctx.total);
        state.memoize(
            ctx.pattern.clone(),
            LearnedPattern {
                forecast,
                confidence: FALLBACK_CONFIDENCE,
                rationale: rationale.clone(),
            },
        );
        Some(RuleDecision::new(
            self.kind(),
            forecast,
            FALLBACK_CONFIDENCE,
            rationale,
        ))
    }
}

pub struct RuleEngine {
    rules: Vec<Box<dyn Rule>>,
}

impl RuleEngine {
    #[must_use]
    pub fn standard() -> Self {
        Self {
            rules: vec![
                Box::new(LowEntropyRule),
                Box::new(SignatureRule),
                Box::new(PatternMemoryRule {
                    min_occurrences: 3,
                    min_accuracy: 0.6,
                }),
                Box::new(ErrorMemoryRule { min_misses: 2 }),
                Box::new(ConsecutiveMissesRule { min_misses: 3 }),
                Box::new(StreakRule),
                Box::new(BridgeMotifRule),
                Box::new(LearnedPatternRule),
                Box::new(FallbackRule),
            ],
        }
    }

    #[must_use]
    pub fn kinds(&self) -> Vec<RuleKind> {
        self.rules.iter().map(|rule| rule.kind()).collect()
    }

    /// First decision in priority order; `None` only for an empty history.
    pub fn evaluate(&self, ctx: &RuleContext<'_>, state: &mut LearningState) -> Option<RuleDecision> {
        if ctx.outcomes.is_empty() {
            return None;
        }
        for rule in &self.rules {
            if !rule.matches(ctx, state) {
                continue;
            }
            if let Some(decision) = rule.apply(ctx, state) {
                return Some(decision);
            }
        }
        None
    }
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::standard()
    }
}

impl std::fmt::Debug for RuleEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleEngine")
            .field("rules", &self.kinds())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::PatternStats;
    use crate::test_support::{must_some, seq};
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    fn evaluate(
        outcomes: &[Outcome],
        dice: [u8; 3],
        state: &mut LearningState,
    ) -> RuleDecision {
        let library = SignatureLibrary::default();
        let dice = Dice(dice);
        let ctx = RuleContext::new(outcomes, dice, dice.total(), &library);
        must_some(RuleEngine::standard().evaluate(&ctx, state))
    }

    #[test]
    fn empty_history_has_no_decision() {
        let library = SignatureLibrary::default();
        let ctx = RuleContext::new(&[], Dice([1, 1, 1]), 3, &library);
        let mut state = LearningState::default();
        assert!(RuleEngine::standard().evaluate(&ctx, &mut state).is_none());
    }

    #[test]
    fn rules_are_in_priority_order() {
        let kinds = RuleEngine::standard().kinds();
        assert_eq!(kinds.first(), Some(&RuleKind::LowEntropy));
        assert_eq!(kinds.last(), Some(&RuleKind::Fallback));
        assert_eq!(kinds.len(), 9);
    }

    #[test]
    fn long_high_streak_tries_one_break_then_rides() {
        let history = seq("LHHHHH");
        let mut state = LearningState::default();

        let first = evaluate(&history, [6, 6, 4], &mut state);
        assert_eq!(first.rule, RuleKind::Streak);
        assert_eq!(first.forecast, Outcome::Low);
        assert_eq!(first.confidence, 80);
        assert!(state.break_attempted_high);

        let second = evaluate(&history, [6, 6, 4], &mut state);
        assert_eq!(second.forecast, Outcome::High);
        assert_eq!(second.confidence, 90);
    }

    #[test]
    fn pure_high_run_of_five_breaks_once_with_built_library() {
        let mut rng = SmallRng::seed_from_u64(5);
        let library = SignatureLibrary::build(&mut rng);
        let history = seq("HHHHH");
        let dice = Dice([6, 6, 4]);
        let ctx = RuleContext::new(&history, dice, dice.total(), &library);
        let engine = RuleEngine::standard();
        let mut state = LearningState::default();

        let first = must_some(engine.evaluate(&ctx, &mut state));
        assert_eq!(first.rule, RuleKind::Streak);
        assert_eq!(first.forecast, Outcome::Low);
        assert_eq!(first.confidence, 80);
        assert!(state.break_attempted_high);
        assert!(!state.break_attempted_low);

        let second = must_some(engine.evaluate(&ctx, &mut state));
        assert_eq!(second.rule, RuleKind::Streak);
        assert_eq!(second.forecast, Outcome::High);
        assert_eq!(second.confidence, 90);
        assert!(state.break_attempted_high);
    }

    #[test]
    fn watched_face_breaks_and_clears_flag() {
        let mut state = LearningState::default();
        state.break_attempted_low = true;
        let decision = evaluate(&seq("HLLL"), [5, 1, 2], &mut state);
        assert_eq!(decision.forecast, Outcome::High);
        assert_eq!(decision.confidence, 95);
        assert!(!state.break_attempted_low);
    }

    #[test]
    fn short_streak_without_watched_face_rides() {
        let mut state = LearningState::default();
        let decision = evaluate(&seq("LHHH"), [6, 6, 4], &mut state);
        assert_eq!(decision.forecast, Outcome::High);
        assert_eq!(decision.confidence, 93);
    }

    #[test]
    fn error_memory_outranks_streak() {
        let mut state = LearningState::default();
        state.error_memory.insert("HHH".to_string(), 2);
        let decision = evaluate(&seq("LHHH"), [6, 6, 4], &mut state);
        assert_eq!(decision.rule, RuleKind::ErrorMemory);
        assert_eq!(decision.forecast, Outcome::Low);
        assert_eq!(decision.confidence, 89);
    }

    #[test]
    fn consecutive_misses_flip_last() {
        let mut state = LearningState {
            consecutive_misses: 3,
            ..LearningState::default()
        };
        let decision = evaluate(&seq("HL"), [1, 2, 3], &mut state);
        assert_eq!(decision.rule, RuleKind::ConsecutiveMisses);
        assert_eq!(decision.forecast, Outcome::High);
        assert_eq!(decision.confidence, 88);
    }

    #[test]
    fn accurate_pattern_memory_wins() {
        let mut state = LearningState::default();
        state.pattern_memory.insert(
            "L".to_string(),
            PatternStats {
                occurrences: 5,
                correct_occurrences: 4,
                most_recent_next: Outcome::High,
            },
        );
        let decision = evaluate(&seq("HL"), [1, 2, 3], &mut state);
        assert_eq!(decision.rule, RuleKind::PatternMemory);
        assert_eq!(decision.forecast, Outcome::High);
        assert_eq!(decision.confidence, 98);
    }

    #[test]
    fn bridge_motif_forecasts_inverse() {
        let mut state = LearningState::default();
        let decision = evaluate(&seq("HHL"), [1, 2, 3], &mut state);
        assert_eq!(decision.rule, RuleKind::BridgeMotif);
        assert_eq!(decision.forecast, Outcome::High);
        assert_eq!(decision.confidence, 90);
        assert_eq!(decision.explanation, "bridge 2-1");
    }

    #[test]
    fn break_motif_takes_precedence_over_shorter_bridge() {
        let mut state = LearningState::default();
        let decision = evaluate(&seq("LHHHHL"), [1, 2, 3], &mut state);
        assert_eq!(decision.rule, RuleKind::BridgeMotif);
        assert_eq!(decision.forecast, Outcome::High);
        assert_eq!(decision.confidence, 92);
        assert_eq!(decision.explanation, "bridge break-4");
    }

    #[test]
    fn fallback_is_memoized_and_replayed() {
        let mut state = LearningState::default();
        let history = seq("HL");

        let first = evaluate(&history, [6, 5, 1], &mut state);
        assert_eq!(first.rule, RuleKind::Fallback);
        assert_eq!(first.forecast, Outcome::High);
        assert_eq!(first.confidence, FALLBACK_CONFIDENCE);

        let replay = evaluate(&history, [1, 1, 1], &mut state);
        assert_eq!(replay.rule, RuleKind::LearnedPattern);
        assert_eq!(replay.forecast, Outcome::High);
        assert_eq!(replay.explanation, "fallback on total 12");
    }

    #[test]
    fn low_entropy_history_bets_against_bias() {
        let mut history = seq("H").repeat(55);
        history.push(Outcome::Low);
        let mut state = LearningState::default();
        let decision = evaluate(&history, [6, 6, 6], &mut state);
        assert_eq!(decision.rule, RuleKind::LowEntropy);
        assert_eq!(decision.forecast, Outcome::High);
        assert_eq!(decision.confidence, 85);
    }

    #[test]
    fn low_entropy_needs_more_than_fifty_rounds() {
        let mut state = LearningState::default();
        let at_threshold = seq("H").repeat(LOW_ENTROPY_MIN_HISTORY);
        let decision = evaluate(&at_threshold, [6, 6, 6], &mut state);
        assert_eq!(decision.rule, RuleKind::Streak);
        assert_eq!(decision.confidence, 80);

        let mut state = LearningState::default();
        let above = seq("H").repeat(LOW_ENTROPY_MIN_HISTORY + 1);
        let decision = evaluate(&above, [6, 6, 6], &mut state);
        assert_eq!(decision.rule, RuleKind::LowEntropy);
        assert_eq!(decision.forecast, Outcome::Low);
        assert_eq!(decision.confidence, 85);
    }
}
