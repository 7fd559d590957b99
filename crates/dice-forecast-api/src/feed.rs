use std::time::Duration;

use dice_forecast_core::{Outcome, RoundInput};
use serde_json::{Map, Value};
use tracing::debug;

pub const DEFAULT_FEED_TIMEOUT_MS: u64 = 9_000;

const ROUND_ID_KEYS: [&str; 4] = ["Phien", "phien", "session", "id"];
const TOTAL_KEYS: [&str; 3] = ["Tong", "tong", "total"];
const RESULT_KEYS: [&str; 3] = ["Ket_qua", "ket_qua", "result"];

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum FeedError {
    #[error("feed http status {0}")]
    Status(u16),
    #[error("feed transport failure: {0}")]
    Transport(String),
    #[error("feed returned invalid JSON: {0}")]
    InvalidJson(String),
    #[error("feed payload incomplete: {0}")]
    Incomplete(String),
}

/// Blocking HTTP client for the remote round feed.
#[derive(Debug, Clone)]
pub struct FeedClient {
    url: String,
    agent: ureq::Agent,
}

impl FeedClient {
    #[must_use]
    pub fn new(url: impl Into<String>, timeout_ms: u64) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_millis(timeout_ms))
            .build();
        Self {
            url: url.into(),
            agent,
        }
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Fetches the latest raw feed payload.
    ///
    /// # Errors
    /// Returns [`FeedError::Status`] for non-2xx responses,
    /// [`FeedError::Transport`] when the request cannot complete, and
    /// [`FeedError::InvalidJson`] when the body is not JSON.
    pub fn fetch(&self) -> Result<Value, FeedError> {
        match self.agent.get(&self.url).call() {
            Ok(response) => {
                debug!(url = %self.url, status = response.status(), "feed responded");
                response
                    .into_json::<Value>()
                    .map_err(|err| FeedError::InvalidJson(err.to_string()))
            }
            Err(ureq::Error::Status(code, _)) => Err(FeedError::Status(code)),
            Err(ureq::Error::Transport(err)) => Err(FeedError::Transport(err.to_string())),
        }
    }

    /// Fetches and normalizes the latest round.
    ///
    /// # Errors
    /// See [`FeedClient::fetch`] and [`normalize_feed_payload`].
    pub fn fetch_round(&self) -> Result<RoundInput, FeedError> {
        normalize_feed_payload(&self.fetch()?)
    }
}

/// Maps one feed payload onto a [`RoundInput`].
///
/// Key spellings vary between feed revisions; the first present alias wins.
/// Missing die faces become `0` and are sanitized downstream.
///
/// # Errors
/// Returns [`FeedError::Incomplete`] when the payload is not an object, has
/// no usable round id, or carries nothing an outcome can be derived from.
pub fn normalize_feed_payload(payload: &Value) -> Result<RoundInput, FeedError> {
    let object = payload
        .as_object()
        .ok_or_else(|| FeedError::Incomplete("expected a JSON object".to_string()))?;

    let round_id = first_integer(object, &ROUND_ID_KEYS)
        .and_then(|value| u64::try_from(value).ok())
        .filter(|value| *value >= 1)
        .ok_or_else(|| FeedError::Incomplete("missing round id".to_string()))?;

    let listed = object.get("dice").and_then(Value::as_array);
    let mut faces = [None; 3];
    for (index, slot) in faces.iter_mut().enumerate() {
        let position = index + 1;
        let aliases = [
            format!("Xuc_xac_{position}"),
            format!("xuc_xac_{position}"),
            format!("x{position}"),
        ];
        *slot = aliases
            .iter()
            .find_map(|key| object.get(key).and_then(integer_value))
            .or_else(|| listed.and_then(|dice| dice.get(index)).and_then(integer_value));
    }

    let total = first_integer(object, &TOTAL_KEYS);
    let outcome = RESULT_KEYS
        .iter()
        .find_map(|key| object.get(*key).and_then(Value::as_str))
        .and_then(parse_feed_outcome);

    if outcome.is_none() && total.is_none() && faces.iter().any(Option::is_none) {
        return Err(FeedError::Incomplete(format!(
            "round {round_id} has no result, total or complete dice"
        )));
    }

    let md5 = object
        .get("md5")
        .and_then(Value::as_str)
        .map(str::to_string);

    Ok(RoundInput {
        round_id,
        outcome,
        dice: faces.map(|face| face.unwrap_or(0)),
        total,
        md5,
    })
}

/// Accepts the feed's native labels as well as English ones.
#[must_use]
pub fn parse_feed_outcome(raw: &str) -> Option<Outcome> {
    match raw.trim().to_lowercase().as_str() {
        "tài" | "tai" | "t" | "high" | "h" => Some(Outcome::High),
        "xỉu" | "xiu" | "x" | "low" | "l" => Some(Outcome::Low),
        _ => None,
    }
}

fn first_integer(object: &Map<String, Value>, keys: &[&str]) -> Option<i64> {
    keys.iter()
        .find_map(|key| object.get(*key).and_then(integer_value))
}

#[allow(clippy::cast_possible_truncation)]
fn integer_value(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64().or_else(|| {
            number
                .as_f64()
                .filter(|float| float.fract() == 0.0 && float.abs() < 1e15)
                .map(|float| float as i64)
        }),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}
