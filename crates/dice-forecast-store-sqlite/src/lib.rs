#![allow(clippy::missing_errors_doc)]

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use dice_forecast_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, Dice, EnsembleConfig, LearningState, Outcome,
    Round,
};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde_json::Value;
use tracing::debug;

const ROUNDS_MIGRATION_VERSION: i64 = 1;
const LEARNING_STATE_KEY: &str = "learning_v1";

const SCHEMA_ROUNDS_V1: &str = r"
CREATE TABLE IF NOT EXISTS ensemble_configs (
  config_version INTEGER PRIMARY KEY,
  config_json TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS rounds (
  round_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  round_id INTEGER NOT NULL UNIQUE CHECK (round_id >= 1),
  outcome TEXT NOT NULL CHECK (outcome IN ('high', 'low')),
  die1 INTEGER NOT NULL CHECK (die1 BETWEEN 1 AND 6),
  die2 INTEGER NOT NULL CHECK (die2 BETWEEN 1 AND 6),
  die3 INTEGER NOT NULL CHECK (die3 BETWEEN 1 AND 6),
  total INTEGER NOT NULL CHECK (total BETWEEN 3 AND 18),
  recorded_at TEXT NOT NULL,
  md5 TEXT
);

CREATE TRIGGER IF NOT EXISTS trg_rounds_no_update
BEFORE UPDATE ON rounds
BEGIN
  SELECT RAISE(FAIL, 'rounds is append-only');
END;

CREATE TABLE IF NOT EXISTS learning_state (
  state_key TEXT PRIMARY KEY,
  state_json TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
";

pub struct SqliteRoundStore {
    conn: Connection,
}

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct AppendReport {
    pub round_seq: i64,
    pub evicted: usize,
}

impl SqliteRoundStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_ROUNDS_V1)
            .context("failed to apply rounds schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![ROUNDS_MIGRATION_VERSION, now],
            )
            .context("failed to register rounds schema migration")?;

        if self.get_configs()?.is_empty() {
            self.upsert_config(&EnsembleConfig::v1())?;
        }

        Ok(())
    }

    pub fn upsert_config(&self, config: &EnsembleConfig) -> Result<()> {
        config
            .validate()
            .map_err(|err| anyhow!("invalid ensemble configuration: {err}"))?;

        let payload = serde_json::to_string(config).context("failed to serialize ensemble config")?;
        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;

        self.conn
            .execute(
                "INSERT INTO ensemble_configs(config_version, config_json, created_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(config_version) DO UPDATE SET
                   config_json = excluded.config_json,
                   created_at = excluded.created_at",
                params![i64::from(config.config_version), payload, now],
            )
            .context("failed to upsert ensemble config")?;

        Ok(())
    }

    pub fn get_configs(&self) -> Result<BTreeMap<u32, EnsembleConfig>> {
        let mut stmt = self.conn.prepare(
            "SELECT config_version, config_json FROM ensemble_configs ORDER BY config_version ASC",
        )?;

        let mut rows = stmt.query([])?;
        let mut map = BTreeMap::new();

        while let Some(row) = rows.next()? {
            let version_i64: i64 = row.get(0)?;
            let version = u32::try_from(version_i64)
                .with_context(|| format!("invalid config_version: {version_i64}"))?;
            let json: String = row.get(1)?;
            let value: Value =
                serde_json::from_str(&json).context("invalid stored ensemble config JSON")?;
            let config = EnsembleConfig::from_json(&value)
                .map_err(|err| anyhow!("failed to parse ensemble config {version}: {err}"))?;
            map.insert(version, config);
        }

        Ok(map)
    }

    /// Highest stored config version, if any.
    pub fn latest_config(&self) -> Result<Option<EnsembleConfig>> {
        Ok(self.get_configs()?.into_values().next_back())
    }

    /// Appends `round` and trims the log to the newest `retention` rows in
    /// one transaction. A round id not newer than the latest stored one is
    /// rejected.
    pub fn append_round(&mut self, round: &Round, retention: usize) -> Result<AppendReport> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start round transaction")?;
        let report = append_round_in(&tx, round, retention)?;
        tx.commit().context("failed to commit round transaction")?;
        Ok(report)
    }

    /// [`SqliteRoundStore::append_round`] plus the learning state written
    /// in the same transaction; either both land or neither does.
    pub fn record_round(
        &mut self,
        round: &Round,
        retention: usize,
        learning: &LearningState,
    ) -> Result<AppendReport> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start round transaction")?;
        let report = append_round_in(&tx, round, retention)?;
        write_learning_state(&tx, learning)?;
        tx.commit().context("failed to commit round transaction")?;
        Ok(report)
    }

    /// Newest `limit` rounds (all when `None`), oldest first.
    pub fn list_rounds(&self, limit: Option<usize>) -> Result<Vec<Round>> {
        let limit = match limit {
            Some(raw) => i64::try_from(raw).with_context(|| format!("limit out of range: {raw}"))?,
            None => -1,
        };

        let mut stmt = self.conn.prepare(
            "SELECT round_id, outcome, die1, die2, die3, total, recorded_at, md5
             FROM (
               SELECT * FROM rounds ORDER BY round_seq DESC LIMIT ?1
             )
             ORDER BY round_seq ASC",
        )?;

        let rows = stmt.query_map(params![limit], parse_round_row)?;
        collect_rows(rows)
    }

    pub fn latest_round_id(&self) -> Result<Option<u64>> {
        let latest: Option<i64> = self
            .conn
            .query_row("SELECT MAX(round_id) FROM rounds", [], |row| row.get(0))
            .context("failed to read latest round_id")?;

        latest
            .map(|value| u64::try_from(value).with_context(|| format!("invalid round_id: {value}")))
            .transpose()
    }

    pub fn round_count(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM rounds", [], |row| row.get(0))
            .context("failed to count rounds")?;
        usize::try_from(count).with_context(|| format!("invalid round count: {count}"))
    }

    /// Persisted learning state, or the empty state when none was saved.
    pub fn load_learning_state(&self) -> Result<LearningState> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT state_json FROM learning_state WHERE state_key = ?1",
                params![LEARNING_STATE_KEY],
                |row| row.get(0),
            )
            .optional()
            .context("failed to read learning state")?;

        match json {
            Some(raw) => serde_json::from_str(&raw).context("invalid stored learning state JSON"),
            None => Ok(LearningState::default()),
        }
    }

    pub fn save_learning_state(&self, state: &LearningState) -> Result<()> {
        write_learning_state(&self.conn, state)
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn append_round_in(tx: &Transaction<'_>, round: &Round, retention: usize) -> Result<AppendReport> {
    if retention == 0 {
        return Err(anyhow!("retention MUST be >= 1"));
    }
    let round_id = i64::try_from(round.round_id)
        .with_context(|| format!("round_id out of range: {}", round.round_id))?;
    let retention_i64 =
        i64::try_from(retention).with_context(|| format!("retention out of range: {retention}"))?;

    let latest: Option<i64> = tx
        .query_row("SELECT MAX(round_id) FROM rounds", [], |row| row.get(0))
        .context("failed to read latest round_id")?;
    if let Some(latest) = latest.filter(|latest| round_id <= *latest) {
        return Err(anyhow!(
            "stale round_id {round_id}: latest stored round_id is {latest}"
        ));
    }

    let [die1, die2, die3] = round.dice.faces();
    tx.execute(
        "INSERT INTO rounds(round_id, outcome, die1, die2, die3, total, recorded_at, md5)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            round_id,
            round.outcome.as_str(),
            die1,
            die2,
            die3,
            round.total,
            format_rfc3339(round.recorded_at).map_err(|err| anyhow!(err.to_string()))?,
            round.md5,
        ],
    )
    .context("failed to append round")?;
    let round_seq = tx.last_insert_rowid();

    let evicted = tx
        .execute(
            "DELETE FROM rounds
             WHERE round_seq NOT IN (
               SELECT round_seq FROM rounds ORDER BY round_seq DESC LIMIT ?1
             )",
            params![retention_i64],
        )
        .context("failed to apply round retention")?;

    debug!(round_id, round_seq, evicted, "appended round");
    Ok(AppendReport { round_seq, evicted })
}

fn write_learning_state(conn: &Connection, state: &LearningState) -> Result<()> {
    let payload = serde_json::to_string(state).context("failed to serialize learning state")?;
    let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;

    conn.execute(
        "INSERT INTO learning_state(state_key, state_json, updated_at)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(state_key) DO UPDATE SET
           state_json = excluded.state_json,
           updated_at = excluded.updated_at",
        params![LEARNING_STATE_KEY, payload, now],
    )
    .context("failed to save learning state")?;

    Ok(())
}

fn parse_round_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Round> {
    let round_id_i64: i64 = row.get(0)?;
    let outcome_raw: String = row.get(1)?;
    let dice = Dice([row.get(2)?, row.get(3)?, row.get(4)?]);
    let total: u8 = row.get(5)?;
    let recorded_at_raw: String = row.get(6)?;
    let md5: Option<String> = row.get(7)?;

    let round_id = u64::try_from(round_id_i64)
        .map_err(|_| conversion_error(0, rusqlite::types::Type::Integer, format!("invalid round_id: {round_id_i64}")))?;

    let outcome = Outcome::parse(&outcome_raw).ok_or_else(|| {
        conversion_error(1, rusqlite::types::Type::Text, format!("invalid outcome: {outcome_raw}"))
    })?;

    let recorded_at = parse_rfc3339_utc(&recorded_at_raw)
        .map_err(|err| conversion_error(6, rusqlite::types::Type::Text, err.to_string()))?;

    Ok(Round {
        round_id,
        outcome,
        dice,
        total,
        recorded_at,
        md5,
    })
}

fn conversion_error(column: usize, kind: rusqlite::types::Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        kind,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}

#[cfg(test)]
fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT 1
             FROM sqlite_master
             WHERE type = 'table' AND name = ?1
             LIMIT 1",
            params![table_name],
            |_| Ok(()),
        )
        .optional()
        .context("failed to query sqlite_master")?
        .is_some();

    Ok(exists)
}
