//! Live-event forecast combination and expected-return ranking.
//!
//! Each upcoming game is queried against the league's interpolated ensemble at
//! its current lead time. Every (side, sportsbook) price is then scored by
//!   expected_return = hit_probability × decimal_odds − 1
//! where the home side hits with the combined probability p̄ and the away side
//! with 1 − p̄. The credible bounds on p̄ carry through to both figures.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, warn};

use super::ensemble::{CombinedForecast, TimeInterpolatedEnsemble};
use crate::db::models::QuoteRecord;
use crate::error::{BlendError, BlendResult};
use crate::odds::expected_return;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Home,
    Away,
}

/// Latest normalized quote of one sportsbook for a live game.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveQuote {
    pub forecaster: String,
    pub home_prob: f64,
    pub home_odds: f64,
    pub away_odds: f64,
}

/// An upcoming game with the quotes currently on offer.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveEvent {
    pub game_id: String,
    pub league: String,
    pub home_team: String,
    pub away_team: String,
    pub game_start: DateTime<Utc>,
    /// Time of the freshest quote in `quotes`
    pub observed_at: DateTime<Utc>,
    pub quotes: Vec<LiveQuote>,
}

impl LiveEvent {
    /// Signed hours from game start to the freshest quote.
    pub fn lead_time_hours(&self) -> f64 {
        (self.observed_at - self.game_start).num_seconds() as f64 / 3600.0
    }

    pub fn matchup(&self) -> String {
        format!("{} @ {}", self.away_team, self.home_team)
    }
}

/// One priced side of one game at one sportsbook.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Opportunity {
    pub game_id: String,
    pub league: String,
    pub matchup: String,
    pub game_start: DateTime<Utc>,
    pub lead_time_hours: f64,
    pub side: Side,
    pub team: String,
    pub forecaster: String,
    pub decimal_odds: f64,
    pub hit_probability: f64,
    pub hit_probability_lower: f64,
    pub hit_probability_upper: f64,
    pub expected_return: f64,
    pub expected_return_lower: f64,
    pub expected_return_upper: f64,
}

/// Combined home-win forecast of one game.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventForecast {
    pub game_id: String,
    pub matchup: String,
    pub lead_time_hours: f64,
    pub forecasters: usize,
    pub home_win: CombinedForecast,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Slate {
    pub events: Vec<EventForecast>,
    /// Sorted by expected return, best first
    pub opportunities: Vec<Opportunity>,
}

// ── Live quote selection ─────────────────────────────────────────────────────

/// Group stored quotes into live events.
///
/// Per game and sportsbook only the latest quote counts. A sportsbook that
/// reported different prices at that same instant is ambiguous and dropped for
/// the game.
pub fn group_live_events(records: Vec<QuoteRecord>) -> Vec<LiveEvent> {
    let mut games: BTreeMap<String, Vec<QuoteRecord>> = BTreeMap::new();
    for record in records {
        games.entry(record.game_id.clone()).or_default().push(record);
    }

    games
        .into_values()
        .filter_map(|quotes| {
            let first = quotes.first()?.clone();
            let mut latest: HashMap<&str, Vec<&QuoteRecord>> = HashMap::new();
            for q in &quotes {
                let slot = latest.entry(q.forecaster.as_str()).or_default();
                match slot.first().map(|s| s.observed_at) {
                    Some(t) if q.observed_at < t => {}
                    Some(t) if q.observed_at == t => slot.push(q),
                    _ => *slot = vec![q],
                }
            }

            let mut selected: Vec<&QuoteRecord> = Vec::new();
            for (forecaster, candidates) in latest {
                let head = candidates[0];
                let conflicting = candidates.iter().any(|c| {
                    c.home_prob != head.home_prob
                        || c.home_odds != head.home_odds
                        || c.away_odds != head.away_odds
                });
                if conflicting {
                    warn!(
                        "Dropping {} for game {}: {} conflicting quotes at {}",
                        forecaster,
                        first.game_id,
                        candidates.len(),
                        head.observed_at
                    );
                    continue;
                }
                selected.push(head);
            }
            if selected.is_empty() {
                return None;
            }
            selected.sort_by(|a, b| a.forecaster.cmp(&b.forecaster));
            let observed_at = selected.iter().map(|q| q.observed_at).max()?;

            Some(LiveEvent {
                game_id: first.game_id,
                league: first.league,
                home_team: first.home_team,
                away_team: first.away_team,
                game_start: first.game_start,
                observed_at,
                quotes: selected
                    .into_iter()
                    .map(|q| LiveQuote {
                        forecaster: q.forecaster.clone(),
                        home_prob: q.home_prob,
                        home_odds: q.home_odds,
                        away_odds: q.away_odds,
                    })
                    .collect(),
            })
        })
        .collect()
}

// ── Combiner ─────────────────────────────────────────────────────────────────

pub struct ForecastCombiner<'a> {
    ensemble: &'a TimeInterpolatedEnsemble,
    alpha: f64,
    min_expected_return: Option<f64>,
}

impl<'a> ForecastCombiner<'a> {
    pub fn new(ensemble: &'a TimeInterpolatedEnsemble, alpha: f64) -> Self {
        ForecastCombiner {
            ensemble,
            alpha,
            min_expected_return: None,
        }
    }

    /// Only report opportunities at or above this expected return.
    pub fn with_min_expected_return(mut self, threshold: f64) -> Self {
        self.min_expected_return = Some(threshold);
        self
    }

    /// Combined forecast and per-side opportunities of one event.
    pub fn evaluate_event(
        &self,
        event: &LiveEvent,
    ) -> BlendResult<(EventForecast, Vec<Opportunity>)> {
        let quote_map: HashMap<String, f64> = event
            .quotes
            .iter()
            .map(|q| (q.forecaster.clone(), q.home_prob))
            .collect();
        let t = event.lead_time_hours();
        let home = self.ensemble.combine(&quote_map, t, self.alpha)?;
        let away = CombinedForecast {
            estimate: 1.0 - home.estimate,
            lower: 1.0 - home.upper,
            upper: 1.0 - home.lower,
        };

        let matchup = event.matchup();
        let mut opportunities = Vec::with_capacity(event.quotes.len() * 2);
        for quote in &event.quotes {
            for (side, team, odds, hit) in [
                (Side::Home, &event.home_team, quote.home_odds, home),
                (Side::Away, &event.away_team, quote.away_odds, away),
            ] {
                let er = expected_return(hit.estimate, odds);
                if self.min_expected_return.is_some_and(|min| er < min) {
                    continue;
                }
                opportunities.push(Opportunity {
                    game_id: event.game_id.clone(),
                    league: event.league.clone(),
                    matchup: matchup.clone(),
                    game_start: event.game_start,
                    lead_time_hours: t,
                    side,
                    team: team.clone(),
                    forecaster: quote.forecaster.clone(),
                    decimal_odds: odds,
                    hit_probability: hit.estimate,
                    hit_probability_lower: hit.lower,
                    hit_probability_upper: hit.upper,
                    expected_return: er,
                    expected_return_lower: expected_return(hit.lower, odds),
                    expected_return_upper: expected_return(hit.upper, odds),
                });
            }
        }

        let forecast = EventForecast {
            game_id: event.game_id.clone(),
            matchup,
            lead_time_hours: t,
            forecasters: event
                .quotes
                .iter()
                .filter(|q| self.ensemble.forecasters().contains(&q.forecaster))
                .count(),
            home_win: home,
        };
        Ok((forecast, opportunities))
    }

    /// Evaluate every event and rank all opportunities by expected return.
    ///
    /// Events the ensemble cannot answer for (no recognized sportsbook, or only
    /// zero-weight ones) are skipped.
    pub fn rank(&self, events: &[LiveEvent]) -> Slate {
        let evaluated: Vec<_> = events
            .par_iter()
            .map(|event| (event, self.evaluate_event(event)))
            .collect();

        let mut slate = Slate::default();
        for (event, result) in evaluated {
            match result {
                Ok((forecast, opportunities)) => {
                    debug!(
                        "{} ({:+.1}h): p_home={:.3} [{:.3}, {:.3}] from {} book(s)",
                        forecast.matchup,
                        forecast.lead_time_hours,
                        forecast.home_win.estimate,
                        forecast.home_win.lower,
                        forecast.home_win.upper,
                        forecast.forecasters
                    );
                    slate.events.push(forecast);
                    slate.opportunities.extend(opportunities);
                }
                Err(BlendError::InvalidQuery(msg)) => {
                    warn!("Skipping {} ({}): {}", event.matchup(), event.game_id, msg);
                }
                Err(e) => {
                    warn!("Failed to evaluate {}: {}", event.game_id, e);
                }
            }
        }
        slate
            .opportunities
            .sort_by(|a, b| b.expected_return.total_cmp(&a.expected_return));
        slate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ensemble::PosteriorEnsemble;
    use approx::assert_relative_eq;
    use chrono::{Duration, TimeZone};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, 2, 23, 0, 0).unwrap()
    }

    fn ensemble() -> TimeInterpolatedEnsemble {
        let draws = |w: [f64; 2]| PosteriorEnsemble::new(vec![w.to_vec(); 4], 2).unwrap();
        TimeInterpolatedEnsemble::new(
            vec!["Pinnacle".into(), "FanDuel NC".into()],
            vec![(-6.0, draws([0.4, 0.6])), (-2.0, draws([0.7, 0.3]))],
        )
        .unwrap()
    }

    fn record(game: &str, book: &str, minutes_before: i64, home_prob: f64) -> QuoteRecord {
        QuoteRecord {
            id: None,
            league: "NBA".into(),
            game_id: game.into(),
            home_team: "Boston Celtics".into(),
            away_team: "Miami Heat".into(),
            game_start: start(),
            observed_at: start() - Duration::minutes(minutes_before),
            forecaster: book.into(),
            home_odds: 1.0 / home_prob,
            away_odds: 1.0 / (1.0 - home_prob),
            home_prob,
            away_prob: 1.0 - home_prob,
        }
    }

    fn event(quotes: Vec<LiveQuote>) -> LiveEvent {
        LiveEvent {
            game_id: "g1".into(),
            league: "NBA".into(),
            home_team: "Boston Celtics".into(),
            away_team: "Miami Heat".into(),
            game_start: start(),
            observed_at: start() - Duration::hours(4),
            quotes,
        }
    }

    fn quote(book: &str, home_prob: f64, home_odds: f64, away_odds: f64) -> LiveQuote {
        LiveQuote {
            forecaster: book.into(),
            home_prob,
            home_odds,
            away_odds,
        }
    }

    #[test]
    fn keeps_latest_quote_per_book() {
        let events = group_live_events(vec![
            record("g1", "Pinnacle", 300, 0.50),
            record("g1", "Pinnacle", 120, 0.55),
            record("g1", "FanDuel NC", 200, 0.60),
            record("g2", "Pinnacle", 60, 0.40),
        ]);
        assert_eq!(events.len(), 2);
        let g1 = &events[0];
        assert_eq!(g1.game_id, "g1");
        assert_eq!(g1.quotes.len(), 2);
        let pinnacle = g1.quotes.iter().find(|q| q.forecaster == "Pinnacle").unwrap();
        assert_relative_eq!(pinnacle.home_prob, 0.55);
        assert_relative_eq!(g1.lead_time_hours(), -2.0, epsilon = 1e-12);
        assert_eq!(g1.matchup(), "Miami Heat @ Boston Celtics");
    }

    #[test]
    fn conflicting_latest_quotes_drop_the_book() {
        let events = group_live_events(vec![
            record("g1", "Pinnacle", 60, 0.55),
            record("g1", "Pinnacle", 60, 0.58),
            record("g1", "FanDuel NC", 60, 0.60),
        ]);
        assert_eq!(events[0].quotes.len(), 1);
        assert_eq!(events[0].quotes[0].forecaster, "FanDuel NC");
    }

    #[test]
    fn home_and_away_use_complementary_probabilities() {
        let ensemble = ensemble();
        let combiner = ForecastCombiner::new(&ensemble, 0.05);
        let ev = event(vec![
            quote("Pinnacle", 0.6, 1.60, 2.40),
            quote("FanDuel NC", 0.8, 1.25, 4.50),
        ]);
        let (forecast, opps) = combiner.evaluate_event(&ev).unwrap();
        assert_relative_eq!(forecast.home_win.estimate, 0.69, epsilon = 1e-9);
        assert_eq!(forecast.forecasters, 2);
        assert_eq!(opps.len(), 4);

        let home_fd = opps
            .iter()
            .find(|o| o.side == Side::Home && o.forecaster == "FanDuel NC")
            .unwrap();
        assert_relative_eq!(home_fd.expected_return, 0.69 * 1.25 - 1.0, epsilon = 1e-9);
        assert_relative_eq!(home_fd.expected_return_lower, 0.66 * 1.25 - 1.0, epsilon = 1e-9);

        let away_fd = opps
            .iter()
            .find(|o| o.side == Side::Away && o.forecaster == "FanDuel NC")
            .unwrap();
        assert_eq!(away_fd.team, "Miami Heat");
        assert_relative_eq!(away_fd.hit_probability, 0.31, epsilon = 1e-9);
        assert_relative_eq!(away_fd.hit_probability_lower, 0.28, epsilon = 1e-9);
        assert_relative_eq!(away_fd.hit_probability_upper, 0.34, epsilon = 1e-9);
        assert_relative_eq!(away_fd.expected_return, 0.31 * 4.5 - 1.0, epsilon = 1e-9);
    }

    #[test]
    fn rank_sorts_by_expected_return_and_skips_unknown_books() {
        let ensemble = ensemble();
        let combiner = ForecastCombiner::new(&ensemble, 0.05);
        let good = event(vec![
            quote("Pinnacle", 0.6, 1.60, 2.40),
            quote("FanDuel NC", 0.8, 1.25, 4.50),
        ]);
        let mut unknown = event(vec![quote("Some Offshore Book", 0.5, 2.0, 2.0)]);
        unknown.game_id = "g2".into();

        let slate = combiner.rank(&[good, unknown]);
        assert_eq!(slate.events.len(), 1);
        assert_eq!(slate.opportunities.len(), 4);
        for pair in slate.opportunities.windows(2) {
            assert!(pair[0].expected_return >= pair[1].expected_return);
        }
        assert_eq!(slate.opportunities[0].side, Side::Away);
        assert_eq!(slate.opportunities[0].forecaster, "FanDuel NC");
    }

    #[test]
    fn min_expected_return_filters_opportunities() {
        let ensemble = ensemble();
        let combiner = ForecastCombiner::new(&ensemble, 0.05).with_min_expected_return(0.0);
        let ev = event(vec![
            quote("Pinnacle", 0.6, 1.60, 2.40),
            quote("FanDuel NC", 0.8, 1.25, 4.50),
        ]);
        let (_, opps) = combiner.evaluate_event(&ev).unwrap();
        assert!(opps.iter().all(|o| o.expected_return >= 0.0));
        assert_eq!(opps.len(), 2);
    }
}
