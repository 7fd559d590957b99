//! Fixed table of binary motifs keyed by the full rendered history.

use std::collections::BTreeMap;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::outcome::{run_shape, Outcome};

pub const SIGNATURE_LIBRARY_SIZE: usize = 200;
pub const SIGNATURE_LENGTHS: [usize; 5] = [6, 7, 8, 9, 10];
const FILLER_ATTEMPTS: usize = 1000;

const SEED_MOTIFS: [&str; 20] = [
    "H", "L", "HH", "LL", "HL", "LH", "HHL", "LHH", "HLL", "LLH", "HLH", "LHL", "HHHL", "LLLH",
    "HLHH", "LHLL", "HLHL", "LHLH", "HHLL", "LLHH",
];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SignatureOrigin {
    Motif,
    Inverted,
    Filler,
}

impl SignatureOrigin {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Motif => "motif",
            Self::Inverted => "inverted",
            Self::Filler => "filler",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignatureEntry {
    pub pattern: String,
    pub forecast: Outcome,
    pub confidence: u8,
    pub rationale: String,
    pub origin: SignatureOrigin,
}

#[derive(Debug, Clone, Default)]
pub struct SignatureLibrary {
    entries: BTreeMap<String, SignatureEntry>,
}

impl SignatureLibrary {
    /// Expands the seed motifs over every target length, registering each
    /// tiled string and its bitwise inverse, then pads the table with random
    /// fillers drawn from `rng`.
    ///
    /// Expansion stops after [`SIGNATURE_LIBRARY_SIZE`] insertions, counting
    /// overwrites, so the deterministic part usually holds fewer unique keys.
    /// Filler generation gives up after a fixed attempt budget and keeps
    /// whatever count it reached.
    pub fn build<R: Rng>(rng: &mut R) -> Self {
        let mut entries = BTreeMap::new();
        let mut insertions = 0_usize;

        'expansion: for len in SIGNATURE_LENGTHS {
            for motif in SEED_MOTIFS {
                if insertions >= SIGNATURE_LIBRARY_SIZE {
                    break 'expansion;
                }
                let pattern = tile(motif, len);
                let confidence = motif_confidence(&pattern);
                let rationale = format!("signature {pattern} ({})", run_shape(&pattern));
                register(&mut entries, pattern.clone(), confidence, rationale, SignatureOrigin::Motif);
                insertions += 1;

                if insertions >= SIGNATURE_LIBRARY_SIZE {
                    break 'expansion;
                }
                let inverted = invert(&pattern);
                let rationale = format!("signature {inverted} (inverted)");
                register(&mut entries, inverted, confidence, rationale, SignatureOrigin::Inverted);
                insertions += 1;
            }
        }

        let mut attempts = 0_usize;
        while entries.len() < SIGNATURE_LIBRARY_SIZE && attempts < FILLER_ATTEMPTS {
            let len = 7 + attempts % 4;
            let pattern: String = (0..len)
                .map(|_| if rng.random_bool(0.5) { 'H' } else { 'L' })
                .collect();
            if !entries.contains_key(&pattern) {
                let confidence = 65 + u8::try_from(high_count(&pattern) % 10).unwrap_or(0);
                let rationale = format!("signature {pattern} (generated)");
                register(&mut entries, pattern, confidence, rationale, SignatureOrigin::Filler);
            }
            attempts += 1;
        }

        Self { entries }
    }

    /// Exact full-string lookup.
    #[must_use]
    pub fn lookup(&self, pattern: &str) -> Option<&SignatureEntry> {
        self.entries.get(pattern)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &SignatureEntry> {
        self.entries.values()
    }
}

fn register(
    entries: &mut BTreeMap<String, SignatureEntry>,
    pattern: String,
    confidence: u8,
    rationale: String,
    origin: SignatureOrigin,
) {
    let forecast = majority_forecast(&pattern);
    entries.insert(
        pattern.clone(),
        SignatureEntry {
            pattern,
            forecast,
            confidence,
            rationale,
            origin,
        },
    );
}

fn tile(motif: &str, len: usize) -> String {
    motif.chars().cycle().take(len).collect()
}

pub(crate) fn invert(pattern: &str) -> String {
    pattern
        .chars()
        .map(|symbol| match symbol {
            'H' => 'L',
            'L' => 'H',
            other => other,
        })
        .collect()
}

fn high_count(pattern: &str) -> usize {
    pattern.chars().filter(|symbol| *symbol == 'H').count()
}

fn majority_forecast(pattern: &str) -> Outcome {
    if high_count(pattern) >= pattern.len().div_ceil(2) {
        Outcome::High
    } else {
        Outcome::Low
    }
}

fn motif_confidence(pattern: &str) -> u8 {
    let len = pattern.len();
    let raw = 60 + (40 * high_count(pattern)) / len + 2 * len.saturating_sub(6);
    u8::try_from(raw.min(98)).unwrap_or(98)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::must_some;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;
    use std::collections::BTreeSet;

    fn fixture_library(seed: u64) -> SignatureLibrary {
        let mut rng = SmallRng::seed_from_u64(seed);
        SignatureLibrary::build(&mut rng)
    }

    #[test]
    fn library_holds_exactly_two_hundred_unique_keys() {
        let library = fixture_library(7);
        assert_eq!(library.len(), SIGNATURE_LIBRARY_SIZE);
        let keys: BTreeSet<_> = library.entries().map(|entry| entry.pattern.clone()).collect();
        assert_eq!(keys.len(), SIGNATURE_LIBRARY_SIZE);
        for entry in library.entries() {
            assert!((6..=10).contains(&entry.pattern.len()), "{}", entry.pattern);
            assert!(entry.pattern.chars().all(|c| c == 'H' || c == 'L'));
            assert!((60..=98).contains(&entry.confidence));
        }
    }

    #[test]
    fn expanded_entries_have_inverse_with_identical_confidence() {
        let library = fixture_library(11);
        for entry in library
            .entries()
            .filter(|entry| entry.origin != SignatureOrigin::Filler)
        {
            let inverse = must_some(library.lookup(&invert(&entry.pattern)));
            assert_eq!(inverse.confidence, entry.confidence, "{}", entry.pattern);
            assert_ne!(inverse.origin, SignatureOrigin::Filler);
        }
    }

    #[test]
    fn tiled_motif_uses_majority_and_length_bonus() {
        let library = fixture_library(3);
        let entry = must_some(library.lookup("HHLHHL"));
        assert_eq!(entry.forecast, Outcome::High);

        let entry = must_some(library.lookup("HHHLHHHLHH"));
        assert_eq!(entry.forecast, Outcome::High);
    }

    #[test]
    fn later_seed_overwrites_both_members_of_a_pair() {
        // "H" then "L" both tile to the all-High/all-Low pair; the second
        // seed rewrites both entries with its own confidence.
        let library = fixture_library(5);
        let all_high = must_some(library.lookup("HHHHHH"));
        let all_low = must_some(library.lookup("LLLLLL"));
        assert_eq!(all_high.confidence, 60);
        assert_eq!(all_low.confidence, 60);
        assert_eq!(all_high.forecast, Outcome::High);
        assert_eq!(all_low.forecast, Outcome::Low);
    }

    #[test]
    fn lookup_requires_exact_match() {
        let library = fixture_library(9);
        assert!(library.lookup("HHLHH").is_none());
        assert!(library.lookup("").is_none());
    }

    #[test]
    fn motif_confidence_formula() {
        assert_eq!(motif_confidence("HHLHHL"), 86);
        assert_eq!(motif_confidence("HHHHHHHHHH"), 98);
        assert_eq!(motif_confidence("LLLLLLL"), 62);
    }
}
