//! Orchestrating layer over the forecast engine and its SQLite store.
//!
//! [`ForecastApi`] owns the single engine instance behind one lock. Every
//! mutation (ingest, forecast) persists the round log and learning state
//! before the lock is released.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use dice_forecast_core::engine::RECENT_WINDOW;
use dice_forecast_core::{
    now_utc, EnsembleConfig, ForecastEngine, ForecastReport, HistoryStats, IngestReport, Outcome,
    Round, RoundInput, SignatureEntry,
};
use dice_forecast_store_sqlite::SqliteRoundStore;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub mod feed;

pub use feed::{normalize_feed_payload, FeedClient, FeedError};

/// Context attached to a request that failed to read or write the round
/// store. Downcast it from the returned [`anyhow::Error`].
#[derive(Debug, Clone, Copy, thiserror::Error, Eq, PartialEq)]
#[error("round store unavailable")]
pub struct StoreUnavailable;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollReport {
    pub feed_url: String,
    pub round_id: u64,
    pub new: bool,
    pub ingest: IngestReport,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CapitalAdvice {
    pub round_id: u64,
    pub next_round_id: u64,
    pub forecast: Outcome,
    pub probability: f64,
    pub kelly_fraction: f64,
    pub advice: String,
}

struct EngineSlot {
    engine: ForecastEngine,
    store: SqliteRoundStore,
    rng: SmallRng,
}

#[derive(Clone)]
pub struct ForecastApi {
    db_path: PathBuf,
    slot: Arc<Mutex<EngineSlot>>,
}

impl std::fmt::Debug for ForecastApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForecastApi")
            .field("db_path", &self.db_path)
            .finish_non_exhaustive()
    }
}

impl ForecastApi {
    /// Opens the store at `db_path`, migrates it and restores the engine
    /// from the persisted rounds and learning state.
    ///
    /// An explicit `config` is validated and stored; otherwise the newest
    /// stored config is used.
    ///
    /// # Errors
    /// Returns an error when the store cannot be opened or migrated, or the
    /// configuration is invalid.
    pub fn open(db_path: &Path, config: Option<EnsembleConfig>) -> Result<Self> {
        Self::open_with_rng(db_path, config, SmallRng::from_os_rng())
    }

    /// Same as [`ForecastApi::open`] with a caller-supplied RNG, so that
    /// signature fillers and Monte Carlo draws are reproducible.
    ///
    /// # Errors
    /// See [`ForecastApi::open`].
    pub fn open_with_rng(
        db_path: &Path,
        config: Option<EnsembleConfig>,
        mut rng: SmallRng,
    ) -> Result<Self> {
        let store = SqliteRoundStore::open(db_path)?;
        store.migrate()?;

        let config = match config {
            Some(config) => {
                store.upsert_config(&config)?;
                config
            }
            None => store.latest_config()?.unwrap_or_else(EnsembleConfig::v1),
        };

        let learning = store.load_learning_state()?;
        let rounds = store.list_rounds(Some(config.retention))?;
        let restored = rounds.len();

        let mut engine = ForecastEngine::new(config, learning, &mut rng)
            .context("failed to build forecast engine")?;
        engine.restore(rounds);

        info!(
            db = %db_path.display(),
            restored,
            latest_round_id = ?engine.latest_round_id(),
            "forecast engine restored"
        );

        Ok(Self {
            db_path: db_path.to_path_buf(),
            slot: Arc::new(Mutex::new(EngineSlot { engine, store, rng })),
        })
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Normalizes and ingests one round.
    ///
    /// Stale or duplicate round ids come back with `accepted = false` and
    /// touch neither the engine nor the store. When persisting fails the
    /// engine is rolled back, so memory never runs ahead of the store.
    ///
    /// # Errors
    /// Returns [`dice_forecast_core::ForecastError::Validation`] (wrapped)
    /// for malformed input, or a persistence error.
    pub fn ingest(&self, input: &RoundInput) -> Result<IngestReport> {
        let round = input.normalize(now_utc())?;
        let mut guard = self.lock()?;
        let slot = &mut *guard;
        let retention = slot.engine.config().retention;

        let checkpoint = slot.engine.checkpoint();
        let report = slot.engine.ingest(round.clone());
        if !report.accepted {
            debug!(round_id = round.round_id, latest = ?report.latest_round_id, "ignored stale round");
            return Ok(report);
        }

        let appended = match slot
            .store
            .record_round(&round, retention, slot.engine.learning())
        {
            Ok(appended) => appended,
            Err(err) => {
                slot.engine.rollback(checkpoint);
                warn!(round_id = round.round_id, error = %format!("{err:#}"), "round not persisted, engine rolled back");
                return Err(err.context(StoreUnavailable));
            }
        };

        if report.md5.as_ref().is_some_and(|md5| !md5.is_random) {
            warn!(round_id = round.round_id, "md5 commitment looks skewed");
        }
        info!(
            round_id = round.round_id,
            outcome = %round.outcome,
            total = round.total,
            evicted = appended.evicted,
            hit = ?report.score.map(|score| score.hit),
            "round ingested"
        );
        Ok(report)
    }

    /// Forecasts the next round and persists the updated learning state.
    /// The learning state is rolled back when it cannot be saved.
    ///
    /// # Errors
    /// Returns [`dice_forecast_core::ForecastError::NotReady`] (wrapped)
    /// when no round has been ingested, or a persistence error.
    pub fn forecast(&self) -> Result<ForecastReport> {
        let mut guard = self.lock()?;
        let slot = &mut *guard;
        let checkpoint = slot.engine.checkpoint();
        let report = slot.engine.forecast(&mut slot.rng)?;
        if let Err(err) = slot.store.save_learning_state(slot.engine.learning()) {
            slot.engine.rollback(checkpoint);
            warn!(error = %format!("{err:#}"), "learning state not persisted, forecast discarded");
            return Err(err.context(StoreUnavailable));
        }

        debug!(
            round_id = report.round_id,
            forecast = %report.forecast,
            confidence = %report.confidence,
            "forecast produced"
        );
        Ok(report)
    }

    /// Kelly stake sizing for the current forecast.
    ///
    /// # Errors
    /// See [`ForecastApi::forecast`].
    pub fn capital_advice(&self) -> Result<CapitalAdvice> {
        let report = self.forecast()?;
        Ok(CapitalAdvice {
            round_id: report.round_id,
            next_round_id: report.next_round_id,
            forecast: report.forecast,
            probability: report.probability,
            kelly_fraction: report.kelly_fraction,
            advice: report.capital_advice,
        })
    }

    /// # Errors
    /// Returns an error when the engine lock is poisoned.
    pub fn stats(&self) -> Result<HistoryStats> {
        Ok(self.lock()?.engine.stats())
    }

    /// Newest `limit` rounds, oldest first.
    ///
    /// # Errors
    /// Returns an error when the engine lock is poisoned.
    pub fn history(&self, limit: usize) -> Result<Vec<Round>> {
        Ok(self.lock()?.engine.history(limit).to_vec())
    }

    /// # Errors
    /// Returns an error when the engine lock is poisoned.
    pub fn recent_history(&self) -> Result<Vec<Round>> {
        self.history(RECENT_WINDOW)
    }

    /// # Errors
    /// Returns an error when the engine lock is poisoned.
    pub fn signatures(&self) -> Result<Vec<SignatureEntry>> {
        Ok(self.lock()?.engine.signatures().entries().cloned().collect())
    }

    /// # Errors
    /// Returns an error when the engine lock is poisoned.
    pub fn config(&self) -> Result<EnsembleConfig> {
        Ok(self.lock()?.engine.config().clone())
    }

    /// Fetches the feed once and ingests the round it reports.
    ///
    /// # Errors
    /// Returns a wrapped [`FeedError`] when the feed is unreachable or the
    /// payload is incomplete, or any error from [`ForecastApi::ingest`].
    pub fn poll_once(&self, client: &FeedClient) -> Result<PollReport> {
        let input = client.fetch_round()?;
        let ingest = self.ingest(&input)?;
        Ok(PollReport {
            feed_url: client.url().to_string(),
            round_id: input.round_id,
            new: ingest.accepted,
            ingest,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, EngineSlot>> {
        self.slot
            .lock()
            .map_err(|_| anyhow!("forecast engine lock poisoned"))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp)]

    use super::*;
    use dice_forecast_core::forecast::kelly_fraction;
    use dice_forecast_core::{ForecastError, LearningState};
    use ulid::Ulid;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn temp_db() -> PathBuf {
        std::env::temp_dir().join(format!("dice-forecast-api-{}.sqlite3", Ulid::new()))
    }

    fn fixture_config() -> EnsembleConfig {
        let mut config = EnsembleConfig::v1();
        config.monte_carlo_sims = 400;
        config.retention = 8;
        config
    }

    fn fixture_api(db: &Path) -> ForecastApi {
        must(ForecastApi::open_with_rng(
            db,
            Some(fixture_config()),
            SmallRng::seed_from_u64(11),
        ))
    }

    fn input(round_id: u64, dice: [i64; 3]) -> RoundInput {
        RoundInput {
            round_id,
            outcome: None,
            dice,
            total: None,
            md5: None,
        }
    }

    fn exec_sql(db: &Path, sql: &str) {
        let conn = match rusqlite::Connection::open(db) {
            Ok(conn) => conn,
            Err(err) => panic!("failed to open side connection: {err}"),
        };
        if let Err(err) = conn.execute_batch(sql) {
            panic!("failed to run {sql}: {err}");
        }
    }

    fn learning(api: &ForecastApi) -> LearningState {
        must(api.lock()).engine.learning().clone()
    }

    fn round_ids(api: &ForecastApi) -> Vec<u64> {
        must(api.history(100))
            .iter()
            .map(|round| round.round_id)
            .collect()
    }

    #[test]
    fn forecast_without_history_is_not_ready() {
        let db = temp_db();
        let api = fixture_api(&db);
        let err = match api.forecast() {
            Ok(_) => panic!("expected not ready"),
            Err(err) => err,
        };
        assert_eq!(
            err.downcast_ref::<ForecastError>(),
            Some(&ForecastError::NotReady)
        );
        let _ = std::fs::remove_file(&db);
    }

    #[test]
    fn invalid_round_is_a_validation_error() {
        let db = temp_db();
        let api = fixture_api(&db);
        let err = match api.ingest(&input(0, [1, 2, 3])) {
            Ok(_) => panic!("expected validation error"),
            Err(err) => err,
        };
        assert!(matches!(
            err.downcast_ref::<ForecastError>(),
            Some(ForecastError::Validation(_))
        ));
        let _ = std::fs::remove_file(&db);
    }

    #[test]
    fn round_id_beyond_storable_range_leaves_engine_serving() {
        let db = temp_db();
        let api = fixture_api(&db);
        must(api.ingest(&input(1, [6, 6, 6])));

        let err = match api.ingest(&input(u64::MAX, [1, 2, 3])) {
            Ok(_) => panic!("expected validation error"),
            Err(err) => err,
        };
        assert!(matches!(
            err.downcast_ref::<ForecastError>(),
            Some(ForecastError::Validation(_))
        ));
        assert_eq!(round_ids(&api), vec![1]);

        let report = must(api.forecast());
        assert_eq!(report.next_round_id, 2);
        assert!(must(api.ingest(&input(2, [1, 2, 3]))).accepted);
        assert_eq!(must(api.stats()).total_samples, 2);
        let _ = std::fs::remove_file(&db);
    }

    #[test]
    fn failed_round_write_rolls_engine_back() {
        let db = temp_db();
        let api = fixture_api(&db);
        must(api.ingest(&input(1, [6, 6, 6])));
        must(api.ingest(&input(2, [1, 2, 3])));
        must(api.forecast());
        let before = learning(&api);

        exec_sql(
            &db,
            "CREATE TRIGGER trg_rounds_locked BEFORE INSERT ON rounds
             BEGIN SELECT RAISE(ABORT, 'rounds is locked'); END;",
        );
        let err = match api.ingest(&input(3, [5, 5, 4])) {
            Ok(_) => panic!("expected store failure"),
            Err(err) => err,
        };
        assert_eq!(err.downcast_ref::<StoreUnavailable>(), Some(&StoreUnavailable));
        assert!(format!("{err:#}").contains("rounds is locked"));
        assert_eq!(round_ids(&api), vec![1, 2]);
        assert_eq!(learning(&api), before);
        let store = must(SqliteRoundStore::open(&db));
        assert_eq!(must(store.round_count()), 2);

        exec_sql(&db, "DROP TRIGGER trg_rounds_locked;");
        let report = must(api.ingest(&input(3, [5, 5, 4])));
        assert!(report.accepted);
        assert!(report.score.is_some());
        assert_eq!(round_ids(&api), vec![1, 2, 3]);
        assert_eq!(must(store.round_count()), 3);
        let _ = std::fs::remove_file(&db);
    }

    #[test]
    fn failed_learning_save_discards_forecast() {
        let db = temp_db();
        let api = fixture_api(&db);
        for round_id in 1..=3 {
            must(api.ingest(&input(round_id, [6, 5, 4])));
        }
        let before = learning(&api);
        assert!(before.pending_forecast.is_none());

        exec_sql(
            &db,
            "CREATE TRIGGER trg_learning_locked BEFORE INSERT ON learning_state
             BEGIN SELECT RAISE(ABORT, 'learning_state is locked'); END;",
        );
        let err = match api.forecast() {
            Ok(_) => panic!("expected store failure"),
            Err(err) => err,
        };
        assert_eq!(err.downcast_ref::<StoreUnavailable>(), Some(&StoreUnavailable));
        assert_eq!(learning(&api), before);

        exec_sql(&db, "DROP TRIGGER trg_learning_locked;");
        let report = must(api.forecast());
        assert_eq!(report.round_id, 3);
        let pending = learning(&api).pending_forecast;
        assert_eq!(pending.map(|pending| pending.after_round_id), Some(3));
        let _ = std::fs::remove_file(&db);
    }

    #[test]
    fn ingest_persists_and_reopen_restores() {
        let db = temp_db();
        {
            let api = fixture_api(&db);
            for (round_id, dice) in [(1, [6, 6, 6]), (2, [1, 2, 3]), (3, [5, 5, 4])] {
                assert!(must(api.ingest(&input(round_id, dice))).accepted);
            }
            assert!(!must(api.ingest(&input(2, [6, 6, 6]))).accepted);
            let report = must(api.forecast());
            assert_eq!(report.round_id, 3);
            assert_eq!(report.next_round_id, 4);
        }

        let reopened = fixture_api(&db);
        let history = must(reopened.history(10));
        let ids: Vec<u64> = history.iter().map(|round| round.round_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(history[1].outcome, Outcome::Low);

        let stats = must(reopened.stats());
        assert_eq!(stats.total_samples, 3);
        assert_eq!(stats.high_count, 2);

        let pending = learning(&reopened).pending_forecast;
        assert_eq!(pending.map(|pending| pending.after_round_id), Some(3));
        let _ = std::fs::remove_file(&db);
    }

    #[test]
    fn retention_bounds_engine_and_store() {
        let db = temp_db();
        let api = fixture_api(&db);
        for round_id in 1..=12 {
            must(api.ingest(&input(round_id, [3, 4, 5])));
        }
        assert_eq!(must(api.history(100)).len(), 8);
        assert_eq!(must(api.recent_history()).len(), 8);
        drop(api);

        let store = must(SqliteRoundStore::open(&db));
        assert_eq!(must(store.round_count()), 8);
        assert_eq!(must(store.latest_round_id()), Some(12));
        let _ = std::fs::remove_file(&db);
    }

    #[test]
    fn capital_advice_tracks_forecast_probability() {
        let db = temp_db();
        let api = fixture_api(&db);
        for round_id in 1..=6 {
            must(api.ingest(&input(round_id, [6, 6, 5])));
        }
        let advice = must(api.capital_advice());
        assert_eq!(advice.round_id, 6);
        assert_eq!(advice.kelly_fraction, kelly_fraction(advice.probability));
        assert!(advice.advice.starts_with("Kelly stake: "));
        let _ = std::fs::remove_file(&db);
    }

    #[test]
    fn signatures_and_config_are_exposed() {
        let db = temp_db();
        let api = fixture_api(&db);
        assert_eq!(must(api.signatures()).len(), 200);
        assert_eq!(must(api.config()).retention, 8);
        assert_eq!(api.db_path(), db.as_path());
        let _ = std::fs::remove_file(&db);
    }

    #[test]
    fn poll_against_unreachable_feed_is_a_feed_error() {
        let db = temp_db();
        let api = fixture_api(&db);
        let client = FeedClient::new("http://127.0.0.1:9/feed", 200);
        let err = match api.poll_once(&client) {
            Ok(_) => panic!("expected feed failure"),
            Err(err) => err,
        };
        assert!(matches!(
            err.downcast_ref::<FeedError>(),
            Some(FeedError::Transport(_))
        ));
        let _ = std::fs::remove_file(&db);
    }
}
