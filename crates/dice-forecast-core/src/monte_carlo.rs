use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::clamp;
use crate::outcome::{Dice, HIGH_TOTAL_THRESHOLD};

pub const DEFAULT_SIMULATIONS: u32 = 5000;

/// Per-position face counts with add-one smoothing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FaceDistribution {
    counts: [[u32; 6]; 3],
}

impl Default for FaceDistribution {
    fn default() -> Self {
        Self {
            counts: [[1; 6]; 3],
        }
    }
}

impl FaceDistribution {
    #[must_use]
    pub fn from_dice(history: &[Dice]) -> Self {
        let mut distribution = Self::default();
        for dice in history {
            for (position, face) in dice.faces().into_iter().enumerate() {
                if (1..=6).contains(&face) {
                    distribution.counts[position][usize::from(face - 1)] += 1;
                }
            }
        }
        distribution
    }

    #[must_use]
    pub fn counts(&self, position: usize) -> Option<[u32; 6]> {
        self.counts.get(position).copied()
    }

    fn cumulative(&self) -> [[f64; 6]; 3] {
        let mut cdfs = [[0.0; 6]; 3];
        for (cdf, counts) in cdfs.iter_mut().zip(self.counts) {
            let total: u32 = counts.iter().sum();
            let mut running = 0.0;
            for (slot, count) in cdf.iter_mut().zip(counts) {
                running += f64::from(count) / f64::from(total);
                *slot = running;
            }
        }
        cdfs
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonteCarloEstimate {
    pub prob_high: f64,
    pub confidence: f64,
    pub sims: u32,
}

/// Draws `sims` three-dice throws from the smoothed per-position face
/// frequencies and reports the High rate.
#[must_use]
pub fn monte_carlo_estimate<R: Rng>(history: &[Dice], sims: u32, rng: &mut R) -> MonteCarloEstimate {
    let cdfs = FaceDistribution::from_dice(history).cumulative();
    let sims = sims.max(1);

    let mut highs = 0_u32;
    for _ in 0..sims {
        let total: u8 = cdfs.iter().map(|cdf| draw_face(cdf, rng.random::<f64>())).sum();
        if total >= HIGH_TOTAL_THRESHOLD {
            highs += 1;
        }
    }

    let prob_high = f64::from(highs) / f64::from(sims);
    MonteCarloEstimate {
        prob_high,
        confidence: clamp((prob_high - 0.5).abs() * 200.0, 20.0, 98.0).round(),
        sims,
    }
}

/// First face whose cumulative mass reaches `u`; rounding shortfall in the
/// last bucket resolves to face 6.
fn draw_face(cdf: &[f64; 6], u: f64) -> u8 {
    cdf.iter()
        .position(|mass| *mass >= u)
        .and_then(|index| u8::try_from(index + 1).ok())
        .unwrap_or(6)
}
