//! Training-set construction for one lead-time bucket.
//!
//! Turns joined (quote, outcome) rows into fixed-width tables: one row per
//! forecast snapshot (a game observed at one scrape time), one column per
//! allowed sportsbook. Noisy upstream joins are handled by dropping rows, never
//! by guessing.

use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::{debug, warn};

use crate::db::models::OutcomeRow;
use crate::error::{BlendError, BlendResult};

/// Scrape timestamps are floored to this grid before grouping into snapshots.
pub const DEFAULT_SNAPSHOT_MINUTES: i64 = 10;

/// A row carries information about relative forecaster quality only when at
/// least this many forecasters quoted it.
pub const MIN_AVAILABLE_PER_ROW: usize = 2;

/// Half-open window `[start, end)` of signed lead time in hours
/// (`observed_at − game_start`, negative before the start).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LeadTimeWindow {
    pub start: f64,
    pub end: f64,
}

impl LeadTimeWindow {
    pub fn new(start: f64, end: f64) -> BlendResult<Self> {
        if !start.is_finite() || !end.is_finite() || start >= end {
            return Err(BlendError::InvalidQuery(format!(
                "lead-time window [{start}, {end}) is empty"
            )));
        }
        Ok(LeadTimeWindow { start, end })
    }

    /// Window for "between `lower` and `upper` hours before the start":
    /// `hours_before(8.0, 12.0)` is `[-12, -8)`.
    pub fn hours_before(lower: f64, upper: f64) -> BlendResult<Self> {
        Self::new(-upper, -lower)
    }

    pub fn contains(&self, lead_time_hours: f64) -> bool {
        lead_time_hours >= self.start && lead_time_hours < self.end
    }

    /// Time anchor the bucket's posterior is attached to.
    pub fn anchor(&self) -> f64 {
        (self.start + self.end) / 2.0
    }
}

/// Aligned numeric tables for one bucket.
///
/// `availability[i][j]` gates `probability[i][j]`; unavailable cells hold a
/// 0.0 placeholder that must never be read ungated.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSet {
    pub forecasters: Vec<String>,
    pub availability: Vec<Vec<bool>>,
    pub probability: Vec<Vec<f64>>,
    /// 1 = home win
    pub outcomes: Vec<bool>,
}

impl TrainingSet {
    pub fn n_rows(&self) -> usize {
        self.outcomes.len()
    }

    pub fn n_forecasters(&self) -> usize {
        self.forecasters.len()
    }

    /// Number of rows each forecaster is available in.
    pub fn available_counts(&self) -> Vec<usize> {
        let mut counts = vec![0usize; self.n_forecasters()];
        for row in &self.availability {
            for (j, &avail) in row.iter().enumerate() {
                if avail {
                    counts[j] += 1;
                }
            }
        }
        counts
    }
}

/// Builds [`TrainingSet`]s from the joined historical rows of a league.
#[derive(Debug, Clone)]
pub struct ObservationPreprocessor {
    max_games: usize,
    snapshot_minutes: i64,
}

impl ObservationPreprocessor {
    pub fn new(max_games: usize) -> Self {
        ObservationPreprocessor {
            max_games,
            snapshot_minutes: DEFAULT_SNAPSHOT_MINUTES,
        }
    }

    pub fn with_snapshot_minutes(mut self, minutes: i64) -> Self {
        self.snapshot_minutes = minutes.max(1);
        self
    }

    pub fn build_training_set(
        &self,
        observations: &[OutcomeRow],
        window: LeadTimeWindow,
        allowed_forecasters: &[String],
    ) -> BlendResult<TrainingSet> {
        if self.max_games == 0 {
            return Err(BlendError::InsufficientData(
                "max_games is zero".to_string(),
            ));
        }

        let recent = recent_games(observations, self.max_games);
        let inconsistent = inconsistent_outcomes(observations);
        if !inconsistent.is_empty() {
            warn!(
                "Dropping {} game(s) with conflicting recorded outcomes",
                inconsistent.len()
            );
        }

        let columns: HashMap<&str, usize> = allowed_forecasters
            .iter()
            .enumerate()
            .map(|(j, name)| (name.as_str(), j))
            .collect();

        // (game start, game id, snapshot) -> (column, probability) cells, plus outcome.
        let grid_secs = self.snapshot_minutes * 60;
        let mut snapshots: BTreeMap<(i64, &str, i64), (bool, Vec<(usize, f64)>)> = BTreeMap::new();
        let mut out_of_range = 0usize;
        for obs in observations {
            if !recent.contains(obs.game_id.as_str()) || inconsistent.contains(obs.game_id.as_str()) {
                continue;
            }
            let Some(&col) = columns.get(obs.forecaster.as_str()) else {
                continue;
            };
            let snapshot = obs.observed_at.timestamp().div_euclid(grid_secs) * grid_secs;
            let start = obs.game_start.timestamp();
            let lead_time = (snapshot - start) as f64 / 3600.0;
            if !window.contains(lead_time) {
                continue;
            }
            if !(0.0..=1.0).contains(&obs.probability) {
                out_of_range += 1;
                continue;
            }
            snapshots
                .entry((start, obs.game_id.as_str(), snapshot))
                .or_insert_with(|| (obs.home_win, Vec::new()))
                .1
                .push((col, obs.probability));
        }
        if out_of_range > 0 {
            warn!("Dropped {} quote(s) with probability outside [0, 1]", out_of_range);
        }

        let m = allowed_forecasters.len();
        let mut availability = Vec::new();
        let mut probability = Vec::new();
        let mut outcomes = Vec::new();
        let mut ambiguous_pairs = 0usize;
        let mut uninformative_rows = 0usize;

        for ((_, game_id, _), (home_win, cells)) in snapshots {
            let mut counts = vec![0usize; m];
            for &(col, _) in &cells {
                counts[col] += 1;
            }
            let mut avail = vec![false; m];
            let mut prob = vec![0.0; m];
            for &(col, p) in &cells {
                if counts[col] == 1 {
                    avail[col] = true;
                    prob[col] = p;
                }
            }
            let dropped = counts.iter().filter(|&&c| c > 1).count();
            if dropped > 0 {
                debug!("Snapshot of {} has {} ambiguous sportsbook quote(s)", game_id, dropped);
                ambiguous_pairs += dropped;
            }

            if avail.iter().filter(|&&a| a).count() < MIN_AVAILABLE_PER_ROW {
                uninformative_rows += 1;
                continue;
            }
            availability.push(avail);
            probability.push(prob);
            outcomes.push(home_win);
        }

        if ambiguous_pairs > 0 {
            warn!(
                "Dropped {} ambiguous (snapshot, sportsbook) pair(s) with duplicate quotes",
                ambiguous_pairs
            );
        }
        if uninformative_rows > 0 {
            debug!(
                "Excluded {} snapshot(s) with fewer than {} sportsbooks",
                uninformative_rows, MIN_AVAILABLE_PER_ROW
            );
        }

        if outcomes.is_empty() {
            return Err(BlendError::InsufficientData(format!(
                "no usable snapshots in lead-time window [{}, {})",
                window.start, window.end
            )));
        }

        Ok(TrainingSet {
            forecasters: allowed_forecasters.to_vec(),
            availability,
            probability,
            outcomes,
        })
    }
}

/// IDs of the games inside the sliding lookback: everything starting on or
/// after the earliest start among the `max_games` latest games.
fn recent_games(observations: &[OutcomeRow], max_games: usize) -> HashSet<&str> {
    let mut starts: HashMap<&str, i64> = HashMap::new();
    for obs in observations {
        let start = obs.game_start.timestamp();
        starts
            .entry(obs.game_id.as_str())
            .and_modify(|s| *s = (*s).min(start))
            .or_insert(start);
    }
    let mut ordered: Vec<i64> = starts.values().copied().collect();
    ordered.sort_unstable_by(|a, b| b.cmp(a));
    let Some(&cutoff) = ordered.get(max_games.min(ordered.len()).saturating_sub(1)) else {
        return HashSet::new();
    };
    starts
        .into_iter()
        .filter(|&(_, start)| start >= cutoff)
        .map(|(id, _)| id)
        .collect()
}

fn inconsistent_outcomes(observations: &[OutcomeRow]) -> HashSet<&str> {
    let mut seen: HashMap<&str, bool> = HashMap::new();
    let mut bad = HashSet::new();
    for obs in observations {
        match seen.get(obs.game_id.as_str()) {
            Some(&home_win) if home_win != obs.home_win => {
                bad.insert(obs.game_id.as_str());
            }
            Some(_) => {}
            None => {
                seen.insert(obs.game_id.as_str(), obs.home_win);
            }
        }
    }
    bad
}
