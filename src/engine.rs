use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::io::BufRead;
use tracing::{debug, error, info, warn};

use crate::config::OddsFormat;
use crate::db::models::{GameOutcome, OutcomeRow, QuoteRecord, RawQuote, RunStatus, WeightRun};
use crate::db::Database;
use crate::error::{BlendError, BlendResult};
use crate::model::combiner::{group_live_events, ForecastCombiner, Slate};
use crate::model::ensemble::{PosteriorEnsemble, TimeInterpolatedEnsemble, WeightTrajectory};
use crate::model::estimator::WeightEstimator;
use crate::model::preprocess::{LeadTimeWindow, ObservationPreprocessor};
use crate::model::sampler::SamplerSettings;
use crate::odds::{american_to_decimal, check_two_sided, implied_probabilities, overround};

/// Everything one `estimate` invocation needs.
#[derive(Debug, Clone)]
pub struct EstimationPlan {
    pub buckets: Vec<LeadTimeWindow>,
    pub max_games: usize,
    pub snapshot_minutes: i64,
    pub sampler: SamplerSettings,
    pub reuse_prior_on_failure: bool,
}

impl EstimationPlan {
    /// Buckets of `step` hours covering `[min_hours, max_hours)` before start,
    /// farthest first. A last bucket narrower than `step` is kept.
    pub fn bucket_grid(min_hours: f64, max_hours: f64, step: f64) -> BlendResult<Vec<LeadTimeWindow>> {
        if !(step > 0.0) || !(max_hours > min_hours) || min_hours < 0.0 {
            return Err(BlendError::InvalidQuery(format!(
                "invalid bucket grid {min_hours}..{max_hours} by {step}"
            )));
        }
        let mut buckets = Vec::new();
        let mut lower = min_hours;
        while lower < max_hours - 1e-9 {
            let upper = (lower + step).min(max_hours);
            buckets.push(LeadTimeWindow::hours_before(lower, upper)?);
            lower = upper;
        }
        buckets.reverse();
        Ok(buckets)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BucketStatus {
    Estimated,
    /// Previous complete run's anchor carried forward
    Reused,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct BucketSummary {
    pub anchor: f64,
    pub rows: usize,
    pub status: BucketStatus,
    pub mean_weights: Option<Vec<f64>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: i64,
    pub league: String,
    pub status: RunStatus,
    pub buckets: Vec<BucketSummary>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub read: usize,
    pub inserted: usize,
    pub rejected: usize,
}

/// Orchestrates import, estimation and scoring for one store.
pub struct BlendEngine {
    db: Database,
    forecasters: Vec<String>,
}

impl BlendEngine {
    pub fn new(db: Database, forecasters: Vec<String>) -> Self {
        BlendEngine { db, forecasters }
    }

    // ── Import ───────────────────────────────────────────────────────────────

    /// Import JSON-lines quotes. Malformed lines and quotes that fail the
    /// two-sided check are logged and skipped.
    pub fn import_quotes<R: BufRead>(
        &self,
        reader: R,
        league: &str,
        format: OddsFormat,
    ) -> Result<ImportSummary> {
        let mut summary = ImportSummary::default();
        let mut records = Vec::new();
        for (n, line) in reader.lines().enumerate() {
            let line = line.context("failed to read quote line")?;
            if line.trim().is_empty() {
                continue;
            }
            summary.read += 1;
            let normalized = serde_json::from_str::<RawQuote>(&line)
                .map_err(anyhow::Error::from)
                .and_then(|raw| normalize_quote(raw, league, format).map_err(anyhow::Error::from));
            match normalized {
                Ok(record) => records.push(record),
                Err(e) => {
                    summary.rejected += 1;
                    warn!("Rejecting quote on line {}: {}", n + 1, e);
                }
            }
        }
        let margin = mean_overround(&records);
        summary.inserted = self.db.insert_quotes(&records)?;
        info!(
            "Imported {} new {} quote(s) ({} read, {} rejected, mean margin {:.2}%)",
            summary.inserted,
            league,
            summary.read,
            summary.rejected,
            margin * 100.0
        );
        Ok(summary)
    }

    /// Import JSON-lines final scores.
    pub fn import_outcomes<R: BufRead>(&self, reader: R) -> Result<ImportSummary> {
        let mut summary = ImportSummary::default();
        for (n, line) in reader.lines().enumerate() {
            let line = line.context("failed to read outcome line")?;
            if line.trim().is_empty() {
                continue;
            }
            summary.read += 1;
            match serde_json::from_str::<GameOutcome>(&line) {
                Ok(outcome) => {
                    self.db.upsert_outcome(&outcome)?;
                    summary.inserted += 1;
                }
                Err(e) => {
                    summary.rejected += 1;
                    warn!("Rejecting outcome on line {}: {}", n + 1, e);
                }
            }
        }
        info!(
            "Recorded {} game outcome(s) ({} rejected)",
            summary.inserted, summary.rejected
        );
        Ok(summary)
    }

    // ── Estimation ───────────────────────────────────────────────────────────

    /// Estimate every bucket of `plan` into a new run of `league`.
    ///
    /// A bucket that fails is skipped, or carried forward from the previous
    /// complete run when the plan allows it. The run only becomes visible to
    /// readers if at least one bucket succeeded.
    pub fn estimate_league(&self, league: &str, plan: &EstimationPlan) -> Result<RunSummary> {
        let observations = self.db.list_outcome_rows(league)?;
        info!(
            "Estimating {} weights for {} sportsbook(s) from {} historical quote(s) over {} bucket(s)",
            league,
            self.forecasters.len(),
            observations.len(),
            plan.buckets.len()
        );

        let previous = if plan.reuse_prior_on_failure {
            match self.db.latest_complete_run(league)? {
                Some(run) if run.forecasters == self.forecasters => Some(run),
                Some(run) => {
                    warn!(
                        "Previous run {} used a different sportsbook list; it cannot be reused",
                        run.id
                    );
                    None
                }
                None => None,
            }
        } else {
            None
        };

        let stale = self.db.count_weight_runs(league, RunStatus::Running)?;
        if stale > 0 {
            warn!("{} earlier {} run(s) never finished and stay ignored", stale, league);
        }

        let run_id = self.db.begin_weight_run(league, &self.forecasters)?;
        let buckets = match self.estimate_buckets(run_id, &observations, plan, previous.as_ref()) {
            Ok(buckets) => buckets,
            Err(e) => {
                error!("Run {} for {} aborted: {:#}", run_id, league, e);
                self.db.finish_weight_run(run_id, RunStatus::Failed)?;
                return Err(e);
            }
        };

        let estimated = buckets
            .iter()
            .filter(|b| b.status == BucketStatus::Estimated)
            .count();
        if estimated == 0 {
            self.db.finish_weight_run(run_id, RunStatus::Failed)?;
            error!("Run {} for {} produced no estimated bucket", run_id, league);
            anyhow::bail!("no lead-time bucket of {} could be estimated", league);
        }
        self.db.finish_weight_run(run_id, RunStatus::Complete)?;
        info!(
            "Run {} complete: {} of {} bucket(s) estimated",
            run_id,
            estimated,
            buckets.len()
        );

        Ok(RunSummary {
            run_id,
            league: league.to_string(),
            status: RunStatus::Complete,
            buckets,
        })
    }

    /// Estimate each bucket of `plan` into `run_id`. Errors here come from
    /// the store, not from a bucket that failed to fit.
    fn estimate_buckets(
        &self,
        run_id: i64,
        observations: &[OutcomeRow],
        plan: &EstimationPlan,
        previous: Option<&WeightRun>,
    ) -> Result<Vec<BucketSummary>> {
        let preprocessor =
            ObservationPreprocessor::new(plan.max_games).with_snapshot_minutes(plan.snapshot_minutes);

        let mut buckets = Vec::with_capacity(plan.buckets.len());
        for (i, window) in plan.buckets.iter().enumerate() {
            let anchor = window.anchor();
            let settings = SamplerSettings {
                seed: plan.sampler.seed.wrapping_add(i as u64),
                ..plan.sampler.clone()
            };

            let attempt = preprocessor
                .build_training_set(observations, *window, &self.forecasters)
                .and_then(|set| {
                    let rows = set.n_rows();
                    debug!("Bucket [{}, {}) has {} training row(s)", window.start, window.end, rows);
                    WeightEstimator::new(settings).estimate(&set).map(|e| (rows, e))
                });

            match attempt {
                Ok((rows, ensemble)) => {
                    self.db.save_anchor(run_id, anchor, ensemble.draws())?;
                    let mean = ensemble.mean_weights();
                    info!(
                        "Bucket t={:+.1}h: {} rows, {} draws, mean weights {}",
                        anchor,
                        rows,
                        ensemble.len(),
                        format_weights(&self.forecasters, &mean)
                    );
                    buckets.push(BucketSummary {
                        anchor,
                        rows,
                        status: BucketStatus::Estimated,
                        mean_weights: Some(mean),
                    });
                }
                Err(e) => {
                    let reused_from = match previous {
                        Some(run) => (self.db.copy_anchor(run.id, run_id, anchor)? > 0).then_some(run.id),
                        None => None,
                    };
                    let status = match reused_from {
                        Some(from) => {
                            warn!(
                                "Bucket t={:+.1}h failed ({}); reusing the anchor of run {}",
                                anchor, e, from
                            );
                            BucketStatus::Reused
                        }
                        None => {
                            warn!("Bucket t={:+.1}h skipped: {}", anchor, e);
                            BucketStatus::Skipped
                        }
                    };
                    buckets.push(BucketSummary {
                        anchor,
                        rows: 0,
                        status,
                        mean_weights: None,
                    });
                }
            }
        }
        Ok(buckets)
    }

    // ── Queries ──────────────────────────────────────────────────────────────

    /// Interpolated ensemble of the latest complete run of `league`.
    pub fn load_ensemble(&self, league: &str) -> Result<TimeInterpolatedEnsemble> {
        let run = self
            .db
            .latest_complete_run(league)?
            .with_context(|| format!("no complete weight run for {league}; run `estimate` first"))?;
        let width = run.forecasters.len();
        let anchored = self
            .db
            .load_run_draws(&run)?
            .into_iter()
            .map(|(t, draws)| Ok((t, PosteriorEnsemble::new(draws, width)?)))
            .collect::<BlendResult<Vec<_>>>()?;
        debug!("Loaded run {} with {} anchor(s)", run.id, anchored.len());
        Ok(TimeInterpolatedEnsemble::new(run.forecasters, anchored)?)
    }

    /// Rank the opportunities of every upcoming `league` game as of `as_of`.
    pub fn score_league(
        &self,
        league: &str,
        as_of: DateTime<Utc>,
        max_quote_age: Duration,
        alpha: f64,
        min_expected_return: Option<f64>,
    ) -> Result<Slate> {
        let ensemble = self.load_ensemble(league)?;
        let quotes = self
            .db
            .list_upcoming_quotes(league, as_of, as_of - max_quote_age)?;
        let events = group_live_events(quotes);
        info!("Scoring {} upcoming {} game(s)", events.len(), league);

        let mut combiner = ForecastCombiner::new(&ensemble, alpha);
        if let Some(threshold) = min_expected_return {
            combiner = combiner.with_min_expected_return(threshold);
        }
        let slate = combiner.rank(&events);
        info!(
            "{} game(s) scored, {} opportunity(ies)",
            slate.events.len(),
            slate.opportunities.len()
        );
        Ok(slate)
    }

    /// Weight trajectories of the latest complete run.
    pub fn weight_report(
        &self,
        league: &str,
        time_grid: &[f64],
        alpha: f64,
    ) -> Result<Vec<WeightTrajectory>> {
        let ensemble = self.load_ensemble(league)?;
        Ok(ensemble.value_of_weights(time_grid, alpha)?)
    }
}

/// Convert a raw line to decimal odds with vig-free probabilities.
fn normalize_quote(raw: RawQuote, league: &str, format: OddsFormat) -> BlendResult<QuoteRecord> {
    let (home_odds, away_odds) = match format {
        OddsFormat::American => (american_to_decimal(raw.home_odds)?, american_to_decimal(raw.away_odds)?),
        OddsFormat::Decimal => (raw.home_odds, raw.away_odds),
    };
    let (home_prob, away_prob) = match (raw.home_prob, raw.away_prob) {
        (Some(h), Some(a)) => (h, a),
        _ => implied_probabilities(home_odds, away_odds)?,
    };
    check_two_sided(home_prob, away_prob)?;
    Ok(QuoteRecord {
        id: None,
        league: league.to_string(),
        game_id: raw.game_id,
        home_team: raw.home_team,
        away_team: raw.away_team,
        game_start: raw.game_start,
        observed_at: raw.observed_at,
        forecaster: raw.forecaster,
        home_odds,
        away_odds,
        home_prob,
        away_prob,
    })
}

/// Average bookmaker margin across accepted quotes; 0 when there are none.
fn mean_overround(records: &[QuoteRecord]) -> f64 {
    if records.is_empty() {
        return 0.0;
    }
    records
        .iter()
        .map(|r| overround(r.home_odds, r.away_odds))
        .sum::<f64>()
        / records.len() as f64
}

fn format_weights(names: &[String], weights: &[f64]) -> String {
    names
        .iter()
        .zip(weights)
        .map(|(n, w)| format!("{n}={w:.3}"))
        .collect::<Vec<_>>()
        .join(", ")
}
