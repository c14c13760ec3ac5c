use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::info;

use crate::engine::EstimationPlan;
use crate::model::sampler::SamplerSettings;

/// Sportsbook consensus: time-aware Bayesian weighting of moneyline quotes
#[derive(Parser, Debug, Clone)]
#[command(name = "sportsbook-consensus", version, about)]
pub struct Config {
    /// SQLite database path
    #[arg(long, env = "DATABASE_PATH", default_value = "consensus.db", global = true)]
    pub database_path: String,

    /// League the command operates on (e.g. NBA, NHL, MLB)
    #[arg(long, env = "LEAGUE", default_value = "NBA", global = true)]
    pub league: String,

    /// Sportsbooks to weight, comma separated; column order of every run
    #[arg(
        long,
        env = "FORECASTERS",
        value_delimiter = ',',
        default_values_t = default_forecasters(),
        global = true
    )]
    pub forecasters: Vec<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Load JSON-lines quote and outcome files into the store
    Import(ImportArgs),
    /// Estimate posterior weights over a grid of lead-time buckets
    Estimate(EstimateArgs),
    /// Combine live quotes and rank betting opportunities
    Combine(CombineArgs),
    /// Report each sportsbook's weight as a function of lead time
    Weights(WeightsArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OddsFormat {
    /// +150 / -200
    American,
    /// 2.50 / 1.50
    Decimal,
}

#[derive(Args, Debug, Clone)]
pub struct ImportArgs {
    /// JSON-lines file of sportsbook quotes
    #[arg(long)]
    pub quotes: Option<String>,

    /// JSON-lines file of final scores
    #[arg(long)]
    pub outcomes: Option<String>,

    /// Odds format of the quote file
    #[arg(long, value_enum, default_value = "american")]
    pub odds_format: OddsFormat,
}

#[derive(Args, Debug, Clone)]
pub struct EstimateArgs {
    /// Closest edge of the bucket grid, in hours before start
    #[arg(long, env = "LEAD_TIME_MIN_HOURS", default_value = "0")]
    pub lead_time_min_hours: f64,

    /// Farthest edge of the bucket grid, in hours before start
    #[arg(long, env = "LEAD_TIME_MAX_HOURS", default_value = "24")]
    pub lead_time_max_hours: f64,

    /// Bucket width in hours
    #[arg(long, env = "LEAD_TIME_STEP_HOURS", default_value = "4")]
    pub lead_time_step_hours: f64,

    /// Number of most recent games used for training
    #[arg(long, env = "MAX_GAMES", default_value = "1000")]
    pub max_games: usize,

    /// Snapshot grid for grouping quotes into training rows (minutes)
    #[arg(long, env = "SNAPSHOT_MINUTES", default_value = "10")]
    pub snapshot_minutes: i64,

    /// Posterior draws per chain
    #[arg(long, env = "DRAWS", default_value = "2500")]
    pub draws: usize,

    /// Warm-up iterations per chain
    #[arg(long, env = "TUNE", default_value = "1000")]
    pub tune: usize,

    #[arg(long, env = "CHAINS", default_value = "2")]
    pub chains: usize,

    /// Sampler seed; drawn at random when omitted
    #[arg(long, env = "SEED")]
    pub seed: Option<u64>,

    /// Target acceptance rate for step-size adaptation
    #[arg(long, default_value = "0.8")]
    pub target_accept: f64,

    #[arg(long, default_value = "32")]
    pub max_leapfrog_steps: usize,

    /// Post-warm-up divergent transitions tolerated per bucket
    #[arg(long, default_value = "0")]
    pub max_divergences: usize,

    /// Largest acceptable split R-hat of any weight
    #[arg(long, default_value = "1.05")]
    pub max_rhat: f64,

    /// Symmetric Dirichlet prior concentration
    #[arg(long, default_value = "1.0")]
    pub prior_concentration: f64,

    /// Carry forward the previous run's anchor when a bucket fails
    #[arg(long, env = "REUSE_PRIOR_ON_FAILURE", default_value = "false")]
    pub reuse_prior_on_failure: bool,
}

#[derive(Args, Debug, Clone)]
pub struct CombineArgs {
    /// Credible interval level is 1 − alpha
    #[arg(long, env = "ALPHA", default_value = "0.05")]
    pub alpha: f64,

    /// Evaluate as of this instant (RFC 3339); defaults to now
    #[arg(long)]
    pub as_of: Option<DateTime<Utc>>,

    /// Ignore quotes older than this (minutes)
    #[arg(long, env = "MAX_QUOTE_AGE_MINS", default_value = "60")]
    pub max_quote_age_mins: i64,

    /// Only report opportunities at or above this expected return
    #[arg(long, allow_negative_numbers = true)]
    pub min_expected_return: Option<f64>,

    /// Write JSON here instead of stdout
    #[arg(long)]
    pub output: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct WeightsArgs {
    /// Closest grid point, in hours before start
    #[arg(long, default_value = "0")]
    pub hours_before_min: f64,

    /// Farthest grid point, in hours before start
    #[arg(long, default_value = "24")]
    pub hours_before_max: f64,

    #[arg(long, default_value = "1")]
    pub step_hours: f64,

    #[arg(long, env = "ALPHA", default_value = "0.05")]
    pub alpha: f64,

    /// Write JSON here instead of stdout
    #[arg(long)]
    pub output: Option<String>,
}

fn default_forecasters() -> Vec<String> {
    [
        "Bet365 NC",
        "BetMGM NJ",
        "Caesars NC",
        "DraftKings NC",
        "ESPNBet NC",
        "FanDuel NC",
        "Pinnacle",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl EstimateArgs {
    pub fn plan(&self) -> anyhow::Result<EstimationPlan> {
        let seed = match self.seed {
            Some(seed) => seed,
            None => {
                let seed = rand::random::<u64>();
                info!("No --seed given; sampling with seed {}", seed);
                seed
            }
        };
        Ok(EstimationPlan {
            buckets: EstimationPlan::bucket_grid(
                self.lead_time_min_hours,
                self.lead_time_max_hours,
                self.lead_time_step_hours,
            )?,
            max_games: self.max_games,
            snapshot_minutes: self.snapshot_minutes,
            sampler: SamplerSettings {
                draws: self.draws,
                tune: self.tune,
                chains: self.chains,
                seed,
                target_accept: self.target_accept,
                max_leapfrog_steps: self.max_leapfrog_steps,
                max_divergences: self.max_divergences,
                max_rhat: self.max_rhat,
                prior_concentration: self.prior_concentration,
            },
            reuse_prior_on_failure: self.reuse_prior_on_failure,
        })
    }
}

impl WeightsArgs {
    /// Signed lead times from farthest to closest, e.g. −24, −23, …, 0.
    pub fn time_grid(&self) -> Vec<f64> {
        let span = self.hours_before_max - self.hours_before_min;
        if !(span >= 0.0) || !(self.step_hours > 0.0) {
            return Vec::new();
        }
        let steps = (span / self.step_hours + 1e-9).floor() as usize;
        (0..=steps)
            .map(|i| {
                let h = self.hours_before_max - i as f64 * self.step_hours;
                // keep the start of the game as +0.0 in the JSON output
                if h == 0.0 {
                    0.0
                } else {
                    -h
                }
            })
            .collect()
    }
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.league.trim().is_empty() {
            anyhow::bail!("league must not be empty");
        }
        if self.forecasters.len() < 2 {
            anyhow::bail!("at least two forecasters are required");
        }
        let mut seen = std::collections::HashSet::new();
        for f in &self.forecasters {
            if !seen.insert(f.as_str()) {
                anyhow::bail!("forecaster {} listed more than once", f);
            }
        }
        match &self.command {
            Command::Import(args) => {
                if args.quotes.is_none() && args.outcomes.is_none() {
                    anyhow::bail!("import needs --quotes and/or --outcomes");
                }
            }
            Command::Estimate(args) => {
                if !(args.lead_time_min_hours >= 0.0
                    && args.lead_time_max_hours > args.lead_time_min_hours)
                {
                    anyhow::bail!("lead time range must satisfy 0 <= min < max");
                }
                if !(args.lead_time_step_hours > 0.0) {
                    anyhow::bail!("lead_time_step_hours must be positive");
                }
                if args.max_games == 0 {
                    anyhow::bail!("max_games must be positive");
                }
                if args.snapshot_minutes <= 0 {
                    anyhow::bail!("snapshot_minutes must be positive");
                }
                if args.draws == 0 || args.chains == 0 {
                    anyhow::bail!("draws and chains must be positive");
                }
                if !(args.target_accept > 0.0 && args.target_accept < 1.0) {
                    anyhow::bail!("target_accept must be between 0.0 and 1.0");
                }
                if args.max_leapfrog_steps == 0 {
                    anyhow::bail!("max_leapfrog_steps must be positive");
                }
                if !(args.max_rhat >= 1.0) {
                    anyhow::bail!("max_rhat must be at least 1.0");
                }
                if !(args.prior_concentration > 0.0) {
                    anyhow::bail!("prior_concentration must be positive");
                }
            }
            Command::Combine(args) => {
                if !(args.alpha > 0.0 && args.alpha < 1.0) {
                    anyhow::bail!("alpha must be between 0.0 and 1.0");
                }
                if args.max_quote_age_mins <= 0 {
                    anyhow::bail!("max_quote_age_mins must be positive");
                }
            }
            Command::Weights(args) => {
                if !(args.alpha > 0.0 && args.alpha < 1.0) {
                    anyhow::bail!("alpha must be between 0.0 and 1.0");
                }
                if !(args.step_hours > 0.0) {
                    anyhow::bail!("step_hours must be positive");
                }
                if !(args.hours_before_min >= 0.0 && args.hours_before_max >= args.hours_before_min) {
                    anyhow::bail!("hours_before range must satisfy 0 <= min <= max");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn defaults_parse_and_validate() {
        let config = Config::try_parse_from(["sportsbook-consensus", "estimate"]).unwrap();
        assert_eq!(config.forecasters.len(), 7);
        assert_eq!(config.league, "NBA");
        config.validate().unwrap();
        let Command::Estimate(args) = &config.command else {
            panic!("expected estimate");
        };
        assert_eq!(args.draws, 2500);
        assert_eq!(args.max_games, 1000);
    }

    #[test]
    fn forecaster_list_is_comma_separated() {
        let config = Config::try_parse_from([
            "sportsbook-consensus",
            "--forecasters",
            "Pinnacle,FanDuel NC",
            "weights",
        ])
        .unwrap();
        assert_eq!(config.forecasters, vec!["Pinnacle", "FanDuel NC"]);
    }

    #[test]
    fn duplicate_forecasters_are_rejected() {
        let config = Config::try_parse_from([
            "sportsbook-consensus",
            "--forecasters",
            "Pinnacle,Pinnacle",
            "weights",
        ])
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn bad_alpha_is_rejected() {
        let config =
            Config::try_parse_from(["sportsbook-consensus", "combine", "--alpha", "1.5"]).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn estimate_plan_uses_given_seed() {
        let config = Config::try_parse_from([
            "sportsbook-consensus",
            "estimate",
            "--seed",
            "7",
            "--lead-time-max-hours",
            "8",
        ])
        .unwrap();
        let Command::Estimate(args) = &config.command else {
            panic!("expected estimate");
        };
        let plan = args.plan().unwrap();
        assert_eq!(plan.sampler.seed, 7);
        assert_eq!(plan.buckets.len(), 2);
    }

    #[test]
    fn weights_grid_runs_far_to_near() {
        let config = Config::try_parse_from([
            "sportsbook-consensus",
            "weights",
            "--hours-before-max",
            "3",
        ])
        .unwrap();
        let Command::Weights(args) = &config.command else {
            panic!("expected weights");
        };
        let grid = args.time_grid();
        assert_eq!(grid, vec![-3.0, -2.0, -1.0, 0.0]);
        assert!(grid[3].is_sign_positive());
    }

    #[test]
    fn fractional_grid_step_does_not_drift() {
        let config = Config::try_parse_from([
            "sportsbook-consensus",
            "weights",
            "--hours-before-max",
            "1",
            "--step-hours",
            "0.1",
        ])
        .unwrap();
        let Command::Weights(args) = &config.command else {
            panic!("expected weights");
        };
        let grid = args.time_grid();
        assert_eq!(grid.len(), 11);
        assert_relative_eq!(grid[3], -0.7, epsilon = 1e-12);
        assert_eq!(grid[10], 0.0);
        assert_eq!(serde_json::to_string(&grid[10]).unwrap(), "0.0");
    }
}
