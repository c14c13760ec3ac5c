use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Arc, Mutex, MutexGuard};

pub mod models;
use models::*;

/// Thread-safe SQLite connection pool (single connection with mutex)
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the SQLite database at the given path
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at {path}"))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Run schema migrations (idempotent)
    fn run_migrations(&self) -> Result<()> {
        self.conn()?.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("database connection mutex poisoned"))
    }

    // ── Quotes ───────────────────────────────────────────────────────────────

    /// Insert quotes in one transaction. Exact re-imports are ignored; returns
    /// the number of new rows.
    pub fn insert_quotes(&self, quotes: &[QuoteRecord]) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO quotes (
                    league, game_id, home_team, away_team, game_start,
                    observed_at, forecaster, home_odds, away_odds,
                    home_prob, away_prob
                 ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
            )?;
            for q in quotes {
                inserted += stmt.execute(params![
                    q.league,
                    q.game_id,
                    q.home_team,
                    q.away_team,
                    q.game_start,
                    q.observed_at,
                    q.forecaster,
                    q.home_odds,
                    q.away_odds,
                    q.home_prob,
                    q.away_prob,
                ])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// Quotes of games starting after `as_of`, observed in `[since, as_of]`.
    pub fn list_upcoming_quotes(
        &self,
        league: &str,
        as_of: DateTime<Utc>,
        since: DateTime<Utc>,
    ) -> Result<Vec<QuoteRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, league, game_id, home_team, away_team, game_start,
                    observed_at, forecaster, home_odds, away_odds,
                    home_prob, away_prob
             FROM quotes
             WHERE league = ?1 AND game_start > ?2
               AND observed_at >= ?3 AND observed_at <= ?2
             ORDER BY game_start, game_id, observed_at",
        )?;
        let quotes = stmt
            .query_map(params![league, as_of, since], map_quote)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(quotes)
    }

    // ── Outcomes ─────────────────────────────────────────────────────────────

    /// Insert or correct the final score of a game
    pub fn upsert_outcome(&self, outcome: &GameOutcome) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO outcomes (game_id, home_score, away_score, recorded_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(game_id) DO UPDATE SET
                home_score=excluded.home_score,
                away_score=excluded.away_score,
                recorded_at=excluded.recorded_at",
            params![outcome.game_id, outcome.home_score, outcome.away_score, Utc::now()],
        )?;
        Ok(())
    }

    /// Every stored quote of a league whose game has a final score, as
    /// home-win probability observations.
    pub fn list_outcome_rows(&self, league: &str) -> Result<Vec<OutcomeRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT q.game_id, q.game_start, q.observed_at, q.forecaster,
                    q.home_prob, o.home_score, o.away_score
             FROM quotes q
             JOIN outcomes o ON o.game_id = q.game_id
             WHERE q.league = ?1
             ORDER BY q.game_start, q.game_id, q.observed_at",
        )?;
        let rows = stmt
            .query_map(params![league], |row| {
                let outcome = GameOutcome {
                    game_id: row.get(0)?,
                    home_score: row.get(5)?,
                    away_score: row.get(6)?,
                };
                Ok(OutcomeRow {
                    home_win: outcome.home_win(),
                    game_start: row.get(1)?,
                    observed_at: row.get(2)?,
                    forecaster: row.get(3)?,
                    probability: row.get(4)?,
                    game_id: outcome.game_id,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ── Weight runs ──────────────────────────────────────────────────────────

    /// Start a run; its draws use `forecasters` as column order.
    pub fn begin_weight_run(&self, league: &str, forecasters: &[String]) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO weight_runs (league, forecasters, status, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                league,
                serde_json::to_string(forecasters)?,
                RunStatus::Running.as_str(),
                Utc::now()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Persist every draw of one anchor atomically.
    pub fn save_anchor(&self, run_id: i64, time_anchor: f64, draws: &[Vec<f64>]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO posterior_draws
                    (run_id, time_anchor, draw_index, forecaster_index, weight)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for (d, draw) in draws.iter().enumerate() {
                for (j, w) in draw.iter().enumerate() {
                    stmt.execute(params![run_id, time_anchor, d as i64, j as i64, w])?;
                }
            }
        }
        tx.commit()
            .with_context(|| format!("failed to save anchor {time_anchor} of run {run_id}"))?;
        Ok(())
    }

    /// Carry an anchor's draws from an earlier run into `to_run`.
    pub fn copy_anchor(&self, from_run: i64, to_run: i64, time_anchor: f64) -> Result<usize> {
        let copied = self.conn()?.execute(
            "INSERT INTO posterior_draws
                (run_id, time_anchor, draw_index, forecaster_index, weight)
             SELECT ?2, time_anchor, draw_index, forecaster_index, weight
             FROM posterior_draws WHERE run_id = ?1 AND time_anchor = ?3",
            params![from_run, to_run, time_anchor],
        )?;
        Ok(copied)
    }

    pub fn finish_weight_run(&self, run_id: i64, status: RunStatus) -> Result<()> {
        self.conn()?.execute(
            "UPDATE weight_runs SET status=?1, finished_at=?2 WHERE id=?3",
            params![status.as_str(), Utc::now(), run_id],
        )?;
        Ok(())
    }

    pub fn count_weight_runs(&self, league: &str, status: RunStatus) -> Result<usize> {
        let count: i64 = self.conn()?.query_row(
            "SELECT COUNT(*) FROM weight_runs WHERE league = ?1 AND status = ?2",
            params![league, status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Most recent complete run of a league, if any
    pub fn latest_complete_run(&self, league: &str) -> Result<Option<WeightRun>> {
        let conn = self.conn()?;
        let run = conn
            .query_row(
                "SELECT id, league, forecasters, status, created_at, finished_at
                 FROM weight_runs WHERE league = ?1 AND status = 'complete'
                 ORDER BY id DESC LIMIT 1",
                params![league],
                map_weight_run,
            )
            .optional()?;
        Ok(run)
    }

    /// Draws of a run grouped by anchor, anchors ascending.
    pub fn load_run_draws(&self, run: &WeightRun) -> Result<Vec<(f64, Vec<Vec<f64>>)>> {
        let width = run.forecasters.len();
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT time_anchor, draw_index, forecaster_index, weight
             FROM posterior_draws WHERE run_id = ?1
             ORDER BY time_anchor, draw_index, forecaster_index",
        )?;
        let cells = stmt
            .query_map(params![run.id], |row| {
                Ok((
                    row.get::<_, f64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, f64>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut anchors: Vec<(f64, Vec<Vec<f64>>)> = Vec::new();
        let mut current: Option<i64> = None;
        for (anchor, draw, col, weight) in cells {
            let col = usize::try_from(col)
                .ok()
                .filter(|&c| c < width)
                .ok_or_else(|| anyhow!("run {} has forecaster index {col} beyond {width}", run.id))?;
            if anchors.last().map(|(t, _)| *t) != Some(anchor) {
                anchors.push((anchor, Vec::new()));
                current = None;
            }
            if let Some((_, draws)) = anchors.last_mut() {
                if current != Some(draw) {
                    draws.push(vec![0.0; width]);
                    current = Some(draw);
                }
                if let Some(row) = draws.last_mut() {
                    row[col] = weight;
                }
            }
        }
        Ok(anchors)
    }
}

// ── SQL helpers ────────────────────────────────────────────────────────────────

fn map_quote(row: &rusqlite::Row) -> rusqlite::Result<QuoteRecord> {
    Ok(QuoteRecord {
        id: row.get(0)?,
        league: row.get(1)?,
        game_id: row.get(2)?,
        home_team: row.get(3)?,
        away_team: row.get(4)?,
        game_start: row.get(5)?,
        observed_at: row.get(6)?,
        forecaster: row.get(7)?,
        home_odds: row.get(8)?,
        away_odds: row.get(9)?,
        home_prob: row.get(10)?,
        away_prob: row.get(11)?,
    })
}

fn map_weight_run(row: &rusqlite::Row) -> rusqlite::Result<WeightRun> {
    let forecasters: String = row.get(2)?;
    let forecasters: Vec<String> = serde_json::from_str(&forecasters)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?;
    let status: String = row.get(3)?;
    let status = RunStatus::parse(&status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            Type::Text,
            format!("unknown run status {status}").into(),
        )
    })?;
    Ok(WeightRun {
        id: row.get(0)?,
        league: row.get(1)?,
        forecasters,
        status,
        created_at: row.get(4)?,
        finished_at: row.get(5)?,
    })
}

/// SQLite schema (idempotent CREATE IF NOT EXISTS)
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS quotes (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    league      TEXT    NOT NULL,
    game_id     TEXT    NOT NULL,
    home_team   TEXT    NOT NULL,
    away_team   TEXT    NOT NULL,
    game_start  TEXT    NOT NULL,
    observed_at TEXT    NOT NULL,
    forecaster  TEXT    NOT NULL,
    home_odds   REAL    NOT NULL,
    away_odds   REAL    NOT NULL,
    home_prob   REAL    NOT NULL,
    away_prob   REAL    NOT NULL,
    UNIQUE (game_id, forecaster, observed_at, home_odds, away_odds, home_prob)
);

CREATE TABLE IF NOT EXISTS outcomes (
    game_id     TEXT    PRIMARY KEY,
    home_score  INTEGER NOT NULL,
    away_score  INTEGER NOT NULL,
    recorded_at TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS weight_runs (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    league      TEXT    NOT NULL,
    forecasters TEXT    NOT NULL,
    status      TEXT    NOT NULL DEFAULT 'running',
    created_at  TEXT    NOT NULL,
    finished_at TEXT
);

CREATE TABLE IF NOT EXISTS posterior_draws (
    run_id           INTEGER NOT NULL,
    time_anchor      REAL    NOT NULL,
    draw_index       INTEGER NOT NULL,
    forecaster_index INTEGER NOT NULL,
    weight           REAL    NOT NULL,
    PRIMARY KEY (run_id, time_anchor, draw_index, forecaster_index),
    FOREIGN KEY (run_id) REFERENCES weight_runs(id)
);

CREATE INDEX IF NOT EXISTS idx_quotes_league_start ON quotes(league, game_start);
CREATE INDEX IF NOT EXISTS idx_quotes_game ON quotes(game_id);
CREATE INDEX IF NOT EXISTS idx_weight_runs_league ON weight_runs(league, status);
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn db() -> Database {
        Database::open(":memory:").unwrap()
    }

    fn quote(game: &str, book: &str, start: DateTime<Utc>, hours_before: i64, p: f64) -> QuoteRecord {
        QuoteRecord {
            id: None,
            league: "NBA".into(),
            game_id: game.into(),
            home_team: "Denver Nuggets".into(),
            away_team: "Phoenix Suns".into(),
            game_start: start,
            observed_at: start - Duration::hours(hours_before),
            forecaster: book.into(),
            home_odds: 1.0 / p,
            away_odds: 1.0 / (1.0 - p),
            home_prob: p,
            away_prob: 1.0 - p,
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 10, 2, 0, 0).unwrap()
    }

    #[test]
    fn reimport_is_idempotent() {
        let db = db();
        let quotes = vec![
            quote("g1", "Pinnacle", t0(), 3, 0.6),
            quote("g1", "BetMGM NJ", t0(), 3, 0.62),
        ];
        assert_eq!(db.insert_quotes(&quotes).unwrap(), 2);
        assert_eq!(db.insert_quotes(&quotes).unwrap(), 0);
        // A different price at the same instant is kept for the ambiguity check.
        assert_eq!(db.insert_quotes(&[quote("g1", "Pinnacle", t0(), 3, 0.58)]).unwrap(), 1);
    }

    #[test]
    fn outcome_rows_join_scores() {
        let db = db();
        db.insert_quotes(&[
            quote("g1", "Pinnacle", t0(), 3, 0.6),
            quote("g2", "Pinnacle", t0() + Duration::days(1), 3, 0.4),
        ])
        .unwrap();
        db.upsert_outcome(&GameOutcome {
            game_id: "g1".into(),
            home_score: 101,
            away_score: 99,
        })
        .unwrap();

        let rows = db.list_outcome_rows("NBA").unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].home_win);
        assert_eq!(rows[0].game_start, t0());
        assert_eq!(rows[0].game_start - rows[0].observed_at, Duration::hours(3));

        db.upsert_outcome(&GameOutcome {
            game_id: "g1".into(),
            home_score: 99,
            away_score: 101,
        })
        .unwrap();
        assert!(!db.list_outcome_rows("NBA").unwrap()[0].home_win);

        db.upsert_outcome(&GameOutcome {
            game_id: "g1".into(),
            home_score: 100,
            away_score: 100,
        })
        .unwrap();
        assert!(!db.list_outcome_rows("NBA").unwrap()[0].home_win);
        assert!(db.list_outcome_rows("NHL").unwrap().is_empty());
    }

    #[test]
    fn upcoming_quotes_respect_window() {
        let db = db();
        db.insert_quotes(&[
            quote("past", "Pinnacle", t0() - Duration::hours(1), 3, 0.5),
            quote("soon", "Pinnacle", t0() + Duration::hours(2), 2, 0.5),
            quote("soon", "FanDuel NC", t0() + Duration::hours(2), 5, 0.5),
        ])
        .unwrap();
        let quotes = db
            .list_upcoming_quotes("NBA", t0(), t0() - Duration::hours(1))
            .unwrap();
        assert_eq!(quotes.len(), 1);
        assert_eq!(quotes[0].game_id, "soon");
        assert_eq!(quotes[0].forecaster, "Pinnacle");
    }

    #[test]
    fn only_complete_runs_are_visible() {
        let db = db();
        let books = vec!["A".to_string(), "B".to_string()];
        assert!(db.latest_complete_run("NBA").unwrap().is_none());

        let first = db.begin_weight_run("NBA", &books).unwrap();
        db.save_anchor(first, -2.0, &[vec![0.25, 0.75], vec![0.5, 0.5]]).unwrap();
        db.save_anchor(first, -6.0, &[vec![0.9, 0.1]]).unwrap();
        db.finish_weight_run(first, RunStatus::Complete).unwrap();

        let second = db.begin_weight_run("NBA", &books).unwrap();
        let run = db.latest_complete_run("NBA").unwrap().unwrap();
        assert_eq!(run.id, first);
        assert_eq!(run.forecasters, books);
        assert_eq!(run.status, RunStatus::Complete);
        assert!(run.finished_at.is_some());

        db.finish_weight_run(second, RunStatus::Failed).unwrap();
        assert_eq!(db.latest_complete_run("NBA").unwrap().unwrap().id, first);

        let anchors = db.load_run_draws(&run).unwrap();
        assert_eq!(anchors.len(), 2);
        assert_eq!(anchors[0].0, -6.0);
        assert_eq!(anchors[0].1, vec![vec![0.9, 0.1]]);
        assert_eq!(anchors[1].1, vec![vec![0.25, 0.75], vec![0.5, 0.5]]);
    }

    #[test]
    fn copy_anchor_carries_draws_forward() {
        let db = db();
        let books = vec!["A".to_string(), "B".to_string()];
        let old = db.begin_weight_run("NBA", &books).unwrap();
        db.save_anchor(old, -10.0, &[vec![0.3, 0.7]]).unwrap();
        db.finish_weight_run(old, RunStatus::Complete).unwrap();

        let new = db.begin_weight_run("NBA", &books).unwrap();
        assert_eq!(db.copy_anchor(old, new, -10.0).unwrap(), 2);
        assert_eq!(db.copy_anchor(old, new, -2.0).unwrap(), 0);
        db.finish_weight_run(new, RunStatus::Complete).unwrap();

        let run = db.latest_complete_run("NBA").unwrap().unwrap();
        assert_eq!(run.id, new);
        assert_eq!(db.load_run_draws(&run).unwrap(), vec![(-10.0, vec![vec![0.3, 0.7]])]);
    }

    #[test]
    fn weight_runs_are_counted_by_status() {
        let db = db();
        let books = vec!["Pinnacle".to_string(), "FanDuel NC".to_string()];
        let done = db.begin_weight_run("NBA", &books).unwrap();
        db.finish_weight_run(done, RunStatus::Complete).unwrap();
        db.begin_weight_run("NBA", &books).unwrap();
        db.begin_weight_run("NHL", &books).unwrap();

        assert_eq!(db.count_weight_runs("NBA", RunStatus::Running).unwrap(), 1);
        assert_eq!(db.count_weight_runs("NBA", RunStatus::Complete).unwrap(), 1);
        assert_eq!(db.count_weight_runs("NBA", RunStatus::Failed).unwrap(), 0);
    }
}
