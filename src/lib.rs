//! Sportsbook consensus
//!
//! Learns how far to trust each sportsbook's moneyline as a function of lead
//! time, then blends live quotes into one home-win probability with a credible
//! interval.
//!
//! ```text
//! quotes + outcomes (SQLite) → ObservationPreprocessor → WeightEstimator (per bucket)
//!        → TimeInterpolatedEnsemble → ForecastCombiner → ranked opportunities
//! ```

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod model;
pub mod odds;
