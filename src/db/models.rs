use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One stored sportsbook moneyline quote for a game, odds already in decimal
/// form and probabilities vig-free.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteRecord {
    pub id: Option<i64>,
    pub league: String,
    /// Canonical game identifier shared with the outcome feed
    pub game_id: String,
    pub home_team: String,
    pub away_team: String,
    pub game_start: DateTime<Utc>,
    /// When the quote was scraped
    pub observed_at: DateTime<Utc>,
    /// Sportsbook name, e.g. "DraftKings NC"
    pub forecaster: String,
    /// Decimal odds on the home side
    pub home_odds: f64,
    /// Decimal odds on the away side
    pub away_odds: f64,
    /// Vig-free implied probability of a home win (0.0–1.0)
    pub home_prob: f64,
    pub away_prob: f64,
}

/// Quote line as delivered by the ingest collaborator (JSON lines).
///
/// Odds are in whatever format the import was told to expect; probabilities
/// are optional and derived from the odds when absent.
#[derive(Debug, Clone, Deserialize)]
pub struct RawQuote {
    pub game_id: String,
    pub home_team: String,
    pub away_team: String,
    pub game_start: DateTime<Utc>,
    pub observed_at: DateTime<Utc>,
    pub forecaster: String,
    pub home_odds: f64,
    pub away_odds: f64,
    #[serde(default)]
    pub home_prob: Option<f64>,
    #[serde(default)]
    pub away_prob: Option<f64>,
}

/// Final score of a completed game (JSON lines import).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameOutcome {
    pub game_id: String,
    pub home_score: i32,
    pub away_score: i32,
}

impl GameOutcome {
    /// Moneyline outcome: the home side hits only on an outright win.
    pub fn home_win(&self) -> bool {
        self.home_score > self.away_score
    }
}

/// Historical quote joined with its game's realized outcome; the input row of
/// the training-set builder.
#[derive(Debug, Clone, PartialEq)]
pub struct OutcomeRow {
    pub game_id: String,
    pub game_start: DateTime<Utc>,
    pub observed_at: DateTime<Utc>,
    pub forecaster: String,
    /// Implied probability of a home win
    pub probability: f64,
    pub home_win: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Complete,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Complete => "complete",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(RunStatus::Running),
            "complete" => Some(RunStatus::Complete),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

/// One estimation run over the lead-time bucket grid of a league.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeightRun {
    pub id: i64,
    pub league: String,
    /// Column order of every posterior draw in this run
    pub forecasters: Vec<String>,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}
