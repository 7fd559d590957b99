use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::outcome::{render_pattern, Outcome};

pub const MAX_ORDER: usize = 12;
const TRACE_ORDERS: usize = 6;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct FollowerCounts {
    pub high: u64,
    pub low: u64,
}

impl FollowerCounts {
    fn record(&mut self, next: Outcome) {
        match next {
            Outcome::High => self.high += 1,
            Outcome::Low => self.low += 1,
        }
    }

    #[must_use]
    pub fn total(self) -> u64 {
        self.high + self.low
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MarkovPrediction {
    pub prob_high: f64,
    pub coverage: u64,
    pub trace: String,
}

impl MarkovPrediction {
    fn neutral(trace: &str) -> Self {
        Self {
            prob_high: 0.5,
            coverage: 0,
            trace: trace.to_string(),
        }
    }
}

/// Order-1 through order-12 follower tables over rendered outcome prefixes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkovModel {
    tables: Vec<BTreeMap<String, FollowerCounts>>,
}

impl Default for MarkovModel {
    fn default() -> Self {
        Self {
            tables: vec![BTreeMap::new(); MAX_ORDER],
        }
    }
}

impl MarkovModel {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears every table and recounts all prefix/follower pairs in `sequence`.
    pub fn rebuild(&mut self, sequence: &[Outcome]) {
        for table in &mut self.tables {
            table.clear();
        }

        let pattern = render_pattern(sequence);
        for (order, table) in (1..=MAX_ORDER).zip(self.tables.iter_mut()) {
            if sequence.len() <= order {
                continue;
            }
            for start in 0..sequence.len() - order {
                let prefix = &pattern[start..start + order];
                table
                    .entry(prefix.to_string())
                    .or_default()
                    .record(sequence[start + order]);
            }
        }
    }

    /// Counts the newest element of `sequence` as the follower of each
    /// prefix ending just before it. Must be called exactly once per
    /// appended round.
    pub fn update_incremental(&mut self, sequence: &[Outcome]) {
        let len = sequence.len();
        if len < 2 {
            return;
        }

        let window_start = len.saturating_sub(MAX_ORDER + 1);
        let tail = render_pattern(&sequence[window_start..]);
        let tail_len = tail.len();
        let next = sequence[len - 1];

        for (order, table) in (1..=MAX_ORDER).zip(self.tables.iter_mut()) {
            if len <= order {
                continue;
            }
            let prefix = &tail[tail_len - 1 - order..tail_len - 1];
            table.entry(prefix.to_string()).or_default().record(next);
        }
    }

    #[must_use]
    pub fn counts(&self, order: usize, prefix: &str) -> Option<FollowerCounts> {
        self.tables
            .get(order.checked_sub(1)?)
            .and_then(|table| table.get(prefix))
            .copied()
    }

    /// Blends every order whose trailing prefix has been seen, weighting
    /// order `k` by `k * log2(1 + observations)`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn predict(&self, sequence: &[Outcome]) -> MarkovPrediction {
        if sequence.len() < 2 {
            return MarkovPrediction::neutral("markov: insufficient data");
        }

        let window_start = sequence.len().saturating_sub(MAX_ORDER);
        let tail = render_pattern(&sequence[window_start..]);

        let mut weighted = 0.0;
        let mut weight_sum = 0.0;
        let mut coverage = 0_u64;
        let mut details = Vec::new();

        for order in 1..=MAX_ORDER {
            if sequence.len() <= order {
                continue;
            }
            let prefix = &tail[tail.len() - order..];
            let Some(counts) = self.counts(order, prefix) else {
                continue;
            };
            let total = counts.total();
            if total == 0 {
                continue;
            }

            let p_high = counts.high as f64 / total as f64;
            let weight = order as f64 * (1.0 + total as f64).log2();
            weighted += p_high * weight;
            weight_sum += weight;
            coverage += total;
            details.push(format!("k={order}:{}/{total}H", counts.high));
        }

        if weight_sum == 0.0 {
            return MarkovPrediction::neutral("markov: no matching prefix");
        }

        let ellipsis = if details.len() > TRACE_ORDERS { ",..." } else { "" };
        details.truncate(TRACE_ORDERS);
        MarkovPrediction {
            prob_high: weighted / weight_sum,
            coverage,
            trace: format!("markov[{}{ellipsis}]", details.join(",")),
        }
    }
}
