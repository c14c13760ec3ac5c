//! Time-interpolated posterior ensembles of sportsbook weights.
//!
//! Weights are estimated at a handful of discrete lead-time anchors. A query at
//! an arbitrary lead time blends the two bracketing anchors' *posterior
//! samples* (not their means), so the credible interval widens or narrows
//! smoothly between anchors. Outside the anchored range the nearest anchor is
//! used as-is; trust that far from the training data is not modelled.

use std::collections::HashMap;

use serde::Serialize;

use crate::error::{BlendError, BlendResult};

/// Tolerance on `Σ w = 1` for a stored draw.
pub const SIMPLEX_TOLERANCE: f64 = 1e-6;

// ── Posterior ensemble ───────────────────────────────────────────────────────

/// Draws of the weight vector for a single time anchor.
#[derive(Debug, Clone, PartialEq)]
pub struct PosteriorEnsemble {
    draws: Vec<Vec<f64>>,
    width: usize,
}

impl PosteriorEnsemble {
    /// Validates that every draw has `width` non-negative entries summing to 1.
    pub fn new(draws: Vec<Vec<f64>>, width: usize) -> BlendResult<Self> {
        if draws.is_empty() {
            return Err(BlendError::InsufficientData(
                "posterior ensemble has no draws".to_string(),
            ));
        }
        for (d, draw) in draws.iter().enumerate() {
            if draw.len() != width {
                return Err(BlendError::DataIntegrity(format!(
                    "draw {d} has {} weights, expected {width}",
                    draw.len()
                )));
            }
            if draw.iter().any(|w| !w.is_finite() || *w < 0.0) {
                return Err(BlendError::DataIntegrity(format!(
                    "draw {d} has a negative or non-finite weight"
                )));
            }
            let total: f64 = draw.iter().sum();
            if (total - 1.0).abs() > SIMPLEX_TOLERANCE {
                return Err(BlendError::DataIntegrity(format!(
                    "draw {d} weights sum to {total}"
                )));
            }
        }
        Ok(PosteriorEnsemble { draws, width })
    }

    pub fn draws(&self) -> &[Vec<f64>] {
        &self.draws
    }

    pub fn len(&self) -> usize {
        self.draws.len()
    }

    pub fn is_empty(&self) -> bool {
        self.draws.is_empty()
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Posterior mean weight of each forecaster.
    pub fn mean_weights(&self) -> Vec<f64> {
        let n = self.draws.len() as f64;
        let mut mean = vec![0.0; self.width];
        for draw in &self.draws {
            for (m, w) in mean.iter_mut().zip(draw) {
                *m += w / n;
            }
        }
        mean
    }
}

// ── Query results ────────────────────────────────────────────────────────────

/// Bracketing anchors of a query time and their interpolation weights.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Interpolation {
    pub lower: usize,
    pub upper: usize,
    pub lower_weight: f64,
    pub upper_weight: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CombinedForecast {
    pub estimate: f64,
    pub lower: f64,
    pub upper: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WeightPoint {
    /// Signed lead time in hours
    pub t: f64,
    pub mean: f64,
    pub lower: f64,
    pub upper: f64,
}

/// How much weight one forecaster earns as a function of lead time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeightTrajectory {
    pub forecaster: String,
    pub points: Vec<WeightPoint>,
}

// ── Time-interpolated ensemble ───────────────────────────────────────────────

/// Sorted (anchor, ensemble) pairs sharing one forecaster column order.
///
/// Immutable once built; concurrent queries need no synchronization.
#[derive(Debug, Clone)]
pub struct TimeInterpolatedEnsemble {
    forecasters: Vec<String>,
    columns: HashMap<String, usize>,
    anchors: Vec<f64>,
    ensembles: Vec<PosteriorEnsemble>,
}

impl TimeInterpolatedEnsemble {
    pub fn new(
        forecasters: Vec<String>,
        mut anchored: Vec<(f64, PosteriorEnsemble)>,
    ) -> BlendResult<Self> {
        if anchored.is_empty() {
            return Err(BlendError::InsufficientData(
                "no time anchors to interpolate between".to_string(),
            ));
        }
        let mut columns = HashMap::with_capacity(forecasters.len());
        for (j, name) in forecasters.iter().enumerate() {
            if columns.insert(name.clone(), j).is_some() {
                return Err(BlendError::DataIntegrity(format!(
                    "forecaster {name} listed twice"
                )));
            }
        }
        if anchored.iter().any(|(t, _)| !t.is_finite()) {
            return Err(BlendError::DataIntegrity(
                "time anchor is not finite".to_string(),
            ));
        }
        anchored.sort_by(|a, b| a.0.total_cmp(&b.0));
        for pair in anchored.windows(2) {
            if pair[0].0 >= pair[1].0 {
                return Err(BlendError::DataIntegrity(format!(
                    "duplicate time anchor {}",
                    pair[0].0
                )));
            }
        }
        if let Some((t, e)) = anchored.iter().find(|(_, e)| e.width() != forecasters.len()) {
            return Err(BlendError::DataIntegrity(format!(
                "ensemble at t={t} has width {}, expected {}",
                e.width(),
                forecasters.len()
            )));
        }

        let (anchors, ensembles): (Vec<f64>, Vec<PosteriorEnsemble>) =
            anchored.into_iter().unzip();
        Ok(TimeInterpolatedEnsemble {
            forecasters,
            columns,
            anchors,
            ensembles,
        })
    }

    pub fn forecasters(&self) -> &[String] {
        &self.forecasters
    }

    pub fn anchors(&self) -> &[f64] {
        &self.anchors
    }

    pub fn ensemble(&self, k: usize) -> Option<&PosteriorEnsemble> {
        self.ensembles.get(k)
    }

    /// Bracketing anchors for lead time `t`, clamped into the anchored range.
    pub fn locate(&self, t: f64) -> Interpolation {
        let first = self.anchors[0];
        let last = self.anchors[self.anchors.len() - 1];
        let t = t.clamp(first, last);
        let idx = self.anchors.partition_point(|&a| a < t);
        if self.anchors[idx] == t {
            return Interpolation {
                lower: idx,
                upper: idx,
                lower_weight: 1.0,
                upper_weight: 0.0,
            };
        }
        let (k1, k2) = (idx - 1, idx);
        let upper_weight = (t - self.anchors[k1]) / (self.anchors[k2] - self.anchors[k1]);
        Interpolation {
            lower: k1,
            upper: k2,
            lower_weight: 1.0 - upper_weight,
            upper_weight,
        }
    }

    /// Combined home-win probability and `100·(1 − alpha)%` credible interval
    /// for the quoted forecasters at lead time `t`.
    ///
    /// Quotes from forecasters outside the ensemble are ignored.
    pub fn combine(
        &self,
        quotes: &HashMap<String, f64>,
        t: f64,
        alpha: f64,
    ) -> BlendResult<CombinedForecast> {
        if !(alpha > 0.0 && alpha < 1.0) {
            return Err(BlendError::InvalidQuery(format!(
                "alpha must lie in (0, 1), got {alpha}"
            )));
        }
        if !t.is_finite() {
            return Err(BlendError::InvalidQuery(format!("lead time {t} is not finite")));
        }

        let m = self.forecasters.len();
        let mut available = vec![false; m];
        let mut values = vec![0.0; m];
        for (name, &p) in quotes {
            let Some(&j) = self.columns.get(name) else {
                continue;
            };
            if !(0.0..=1.0).contains(&p) {
                return Err(BlendError::InvalidQuery(format!(
                    "quote {p} from {name} is not a probability"
                )));
            }
            available[j] = true;
            values[j] = p;
        }
        if !available.iter().any(|&a| a) {
            return Err(BlendError::InvalidQuery(
                "no quote from a known forecaster".to_string(),
            ));
        }

        let loc = self.locate(t);
        let mut pooled: Vec<(f64, f64)> = Vec::new();
        for (k, anchor_weight) in [(loc.lower, loc.lower_weight), (loc.upper, loc.upper_weight)] {
            if anchor_weight <= 0.0 {
                continue;
            }
            let ensemble = &self.ensembles[k];
            let mass = anchor_weight / ensemble.len() as f64;
            pooled.extend(
                ensemble
                    .draws()
                    .iter()
                    .filter_map(|w| gated_average(w, &available, &values))
                    .map(|p| (p, mass)),
            );
        }
        if pooled.is_empty() {
            return Err(BlendError::InvalidQuery(format!(
                "no quoted forecaster carries posterior weight at t={t}"
            )));
        }

        Ok(summarize(pooled, alpha))
    }

    /// Posterior mean and credible bounds of every forecaster's weight across
    /// a grid of lead times.
    pub fn value_of_weights(
        &self,
        time_grid: &[f64],
        alpha: f64,
    ) -> BlendResult<Vec<WeightTrajectory>> {
        self.forecasters
            .iter()
            .map(|target| {
                // Quoting 1 for one book and 0 for the rest makes the combined
                // forecast equal that book's weight.
                let quotes: HashMap<String, f64> = self
                    .forecasters
                    .iter()
                    .map(|name| (name.clone(), if name == target { 1.0 } else { 0.0 }))
                    .collect();
                let points = time_grid
                    .iter()
                    .map(|&t| {
                        let c = self.combine(&quotes, t, alpha)?;
                        Ok(WeightPoint {
                            t,
                            mean: c.estimate,
                            lower: c.lower,
                            upper: c.upper,
                        })
                    })
                    .collect::<BlendResult<Vec<_>>>()?;
                Ok(WeightTrajectory {
                    forecaster: target.clone(),
                    points,
                })
            })
            .collect()
    }
}

/// `Σ w·v·f / Σ w·v`, or `None` when no available forecaster has weight.
fn gated_average(weights: &[f64], available: &[bool], values: &[f64]) -> Option<f64> {
    let mut num = 0.0;
    let mut den = 0.0;
    for ((&w, &a), &f) in weights.iter().zip(available).zip(values) {
        if a {
            num += w * f;
            den += w;
        }
    }
    (den > 0.0).then(|| num / den)
}

/// Mass-weighted mean and central interval of pooled (sample, mass) pairs.
fn summarize(mut pooled: Vec<(f64, f64)>, alpha: f64) -> CombinedForecast {
    pooled.sort_by(|a, b| a.0.total_cmp(&b.0));
    let total: f64 = pooled.iter().map(|(_, m)| m).sum();
    let estimate = (pooled.iter().map(|(p, m)| p * m).sum::<f64>() / total).clamp(0.0, 1.0);

    let mut running = 0.0;
    let cdf: Vec<f64> = pooled
        .iter()
        .map(|(_, m)| {
            running += m;
            running / total
        })
        .collect();

    let lower = weighted_quantile(&pooled, &cdf, alpha / 2.0);
    let upper = weighted_quantile(&pooled, &cdf, 1.0 - alpha / 2.0);
    CombinedForecast {
        estimate,
        lower: lower.min(estimate),
        upper: upper.max(estimate),
    }
}

/// Invert the weighted empirical CDF by linear interpolation between
/// consecutive (cdf, sample) points, clamped to the extreme samples.
fn weighted_quantile(sorted: &[(f64, f64)], cdf: &[f64], q: f64) -> f64 {
    let last = sorted.len() - 1;
    if q <= cdf[0] {
        return sorted[0].0;
    }
    if q >= cdf[last] {
        return sorted[last].0;
    }
    let i = cdf.partition_point(|&c| c < q);
    let (c0, c1) = (cdf[i - 1], cdf[i]);
    let (x0, x1) = (sorted[i - 1].0, sorted[i].0);
    if c1 <= c0 {
        return x1;
    }
    x0 + (q - c0) / (c1 - c0) * (x1 - x0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn names() -> Vec<String> {
        vec!["A".to_string(), "B".to_string()]
    }

    fn constant(w: &[f64], n: usize) -> PosteriorEnsemble {
        PosteriorEnsemble::new(vec![w.to_vec(); n], w.len()).unwrap()
    }

    fn two_anchor() -> TimeInterpolatedEnsemble {
        TimeInterpolatedEnsemble::new(
            names(),
            vec![(-2.0, constant(&[0.7, 0.3], 5)), (-6.0, constant(&[0.4, 0.6], 5))],
        )
        .unwrap()
    }

    fn quotes(pairs: &[(&str, f64)]) -> HashMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    /// Draws spread along the A–B edge so intervals have some width.
    fn spread(n: usize, centre: f64) -> PosteriorEnsemble {
        let draws = (0..n)
            .map(|i| {
                let a = (centre + 0.3 * (i as f64 / (n - 1) as f64 - 0.5)).clamp(0.0, 1.0);
                vec![a, 1.0 - a]
            })
            .collect();
        PosteriorEnsemble::new(draws, 2).unwrap()
    }

    #[test]
    fn rejects_draws_off_the_simplex() {
        assert!(PosteriorEnsemble::new(vec![vec![0.5, 0.6]], 2).is_err());
        assert!(PosteriorEnsemble::new(vec![vec![1.2, -0.2]], 2).is_err());
        assert!(PosteriorEnsemble::new(vec![vec![1.0]], 2).is_err());
        assert!(PosteriorEnsemble::new(vec![], 2).is_err());
    }

    #[test]
    fn rejects_duplicate_anchors_and_width_mismatch() {
        let dup = TimeInterpolatedEnsemble::new(
            names(),
            vec![(-2.0, constant(&[0.5, 0.5], 3)), (-2.0, constant(&[0.5, 0.5], 3))],
        );
        assert!(matches!(dup, Err(BlendError::DataIntegrity(_))));
        let wide = TimeInterpolatedEnsemble::new(
            names(),
            vec![(-2.0, constant(&[0.2, 0.3, 0.5], 3))],
        );
        assert!(wide.is_err());
    }

    #[test]
    fn anchors_are_sorted() {
        assert_eq!(two_anchor().anchors(), &[-6.0, -2.0]);
    }

    #[test]
    fn locate_interpolates_and_clamps() {
        let e = two_anchor();
        let mid = e.locate(-4.0);
        assert_eq!((mid.lower, mid.upper), (0, 1));
        assert_relative_eq!(mid.lower_weight, 0.5, epsilon = 1e-12);
        assert_relative_eq!(mid.upper_weight, 0.5, epsilon = 1e-12);

        let quarter = e.locate(-5.0);
        assert_relative_eq!(quarter.upper_weight, 0.25, epsilon = 1e-12);

        let exact = e.locate(-2.0);
        assert_eq!((exact.lower, exact.upper), (1, 1));
        assert_eq!((exact.lower_weight, exact.upper_weight), (1.0, 0.0));

        let before = e.locate(-30.0);
        assert_eq!((before.lower, before.upper, before.lower_weight), (0, 0, 1.0));
        let after = e.locate(5.0);
        assert_eq!((after.lower, after.upper, after.lower_weight), (1, 1, 1.0));
    }

    #[test]
    fn midpoint_scenario() {
        let e = two_anchor();
        let c = e.combine(&quotes(&[("A", 0.6), ("B", 0.8)]), -4.0, 0.05).unwrap();
        assert_relative_eq!(c.estimate, 0.69, epsilon = 1e-9);
        assert_relative_eq!(c.lower, 0.66, epsilon = 1e-9);
        assert_relative_eq!(c.upper, 0.72, epsilon = 1e-9);
    }

    #[test]
    fn query_on_anchor_uses_only_that_anchor() {
        let e = TimeInterpolatedEnsemble::new(
            names(),
            vec![(-6.0, spread(50, 0.3)), (-2.0, spread(40, 0.8)), (2.0, spread(30, 0.5))],
        )
        .unwrap();
        let alone =
            TimeInterpolatedEnsemble::new(names(), vec![(-2.0, spread(40, 0.8))]).unwrap();
        let q = quotes(&[("A", 0.35), ("B", 0.75)]);
        let c = e.combine(&q, -2.0, 0.1).unwrap();
        let d = alone.combine(&q, -2.0, 0.1).unwrap();
        assert_relative_eq!(c.estimate, d.estimate, epsilon = 1e-12);
        assert_relative_eq!(c.lower, d.lower, epsilon = 1e-12);
        assert_relative_eq!(c.upper, d.upper, epsilon = 1e-12);
    }

    #[test]
    fn single_known_forecaster_is_identity() {
        let e = two_anchor();
        let c = e
            .combine(&quotes(&[("B", 0.37), ("Unknown Book", 0.9)]), -3.3, 0.05)
            .unwrap();
        assert_relative_eq!(c.estimate, 0.37, epsilon = 1e-12);
        assert_relative_eq!(c.lower, 0.37, epsilon = 1e-12);
        assert_relative_eq!(c.upper, 0.37, epsilon = 1e-12);
    }

    #[test]
    fn no_known_forecaster_is_invalid() {
        let e = two_anchor();
        let err = e.combine(&quotes(&[("Z", 0.5)]), -4.0, 0.05).unwrap_err();
        assert!(matches!(err, BlendError::InvalidQuery(_)));
        let err = e.combine(&HashMap::new(), -4.0, 0.05).unwrap_err();
        assert!(matches!(err, BlendError::InvalidQuery(_)));
    }

    #[test]
    fn bad_alpha_or_quote_is_invalid() {
        let e = two_anchor();
        let q = quotes(&[("A", 0.5)]);
        assert!(e.combine(&q, -4.0, 0.0).is_err());
        assert!(e.combine(&q, -4.0, 1.0).is_err());
        assert!(e.combine(&q, f64::NAN, 0.05).is_err());
        assert!(e.combine(&quotes(&[("A", 1.5)]), -4.0, 0.05).is_err());
    }

    #[test]
    fn zero_weight_forecaster_alone_is_invalid() {
        let e = TimeInterpolatedEnsemble::new(names(), vec![(-2.0, constant(&[1.0, 0.0], 4))])
            .unwrap();
        let err = e.combine(&quotes(&[("B", 0.4)]), -2.0, 0.05).unwrap_err();
        assert!(matches!(err, BlendError::InvalidQuery(_)));
    }

    #[test]
    fn bounds_contain_estimate_and_stay_in_unit_interval() {
        let e = TimeInterpolatedEnsemble::new(
            names(),
            vec![(-10.0, spread(37, 0.2)), (-6.0, spread(21, 0.6)), (-2.0, spread(53, 0.9))],
        )
        .unwrap();
        for t in [-12.0, -9.0, -7.5, -6.0, -4.2, -2.0, 1.0] {
            for (a, b) in [(0.1, 0.9), (0.55, 0.45), (0.0, 1.0)] {
                for alpha in [0.01, 0.05, 0.2, 0.5, 0.9] {
                    let c = e.combine(&quotes(&[("A", a), ("B", b)]), t, alpha).unwrap();
                    assert!((0.0..=1.0).contains(&c.estimate));
                    assert!(c.lower <= c.estimate && c.estimate <= c.upper, "{c:?}");
                }
            }
        }
    }

    #[test]
    fn larger_alpha_never_widens_interval() {
        let e = TimeInterpolatedEnsemble::new(
            names(),
            vec![(-6.0, spread(41, 0.35)), (-2.0, spread(17, 0.75))],
        )
        .unwrap();
        let q = quotes(&[("A", 0.2), ("B", 0.7)]);
        for t in [-6.0, -5.0, -3.1, -2.0] {
            let wide = e.combine(&q, t, 0.05).unwrap();
            let narrow = e.combine(&q, t, 0.20).unwrap();
            assert!(narrow.upper - narrow.lower <= wide.upper - wide.lower + 1e-12);
        }
    }

    #[test]
    fn unequal_draw_counts_keep_anchor_mass() {
        // 2 draws at one anchor vs 8 at the other: each anchor still holds
        // half the mass at the midpoint.
        let e = TimeInterpolatedEnsemble::new(
            names(),
            vec![(-6.0, constant(&[1.0, 0.0], 2)), (-2.0, constant(&[0.0, 1.0], 8))],
        )
        .unwrap();
        let c = e.combine(&quotes(&[("A", 0.2), ("B", 0.6)]), -4.0, 0.05).unwrap();
        assert_relative_eq!(c.estimate, 0.4, epsilon = 1e-12);
    }

    #[test]
    fn weighted_quantile_interpolates_between_samples() {
        let pooled = vec![(0.1, 0.25), (0.2, 0.25), (0.3, 0.25), (0.4, 0.25)];
        let cdf = vec![0.25, 0.5, 0.75, 1.0];
        assert_relative_eq!(weighted_quantile(&pooled, &cdf, 0.1), 0.1, epsilon = 1e-12);
        assert_relative_eq!(weighted_quantile(&pooled, &cdf, 0.625), 0.25, epsilon = 1e-12);
        assert_relative_eq!(weighted_quantile(&pooled, &cdf, 1.0), 0.4, epsilon = 1e-12);
    }

    #[test]
    fn value_of_weights_tracks_interpolated_means() {
        let e = two_anchor();
        let grid = [-8.0, -6.0, -4.0, -2.0, 0.0];
        let trajectories = e.value_of_weights(&grid, 0.05).unwrap();
        assert_eq!(trajectories.len(), 2);
        let a = &trajectories[0];
        assert_eq!(a.forecaster, "A");
        let means: Vec<f64> = a.points.iter().map(|p| p.mean).collect();
        let expected = [0.4, 0.4, 0.55, 0.7, 0.7];
        for (m, x) in means.iter().zip(expected) {
            assert_relative_eq!(*m, x, epsilon = 1e-12);
        }
        let b = &trajectories[1];
        for (pa, pb) in a.points.iter().zip(&b.points) {
            assert_relative_eq!(pa.mean + pb.mean, 1.0, epsilon = 1e-12);
        }
    }
}
