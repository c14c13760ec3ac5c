//! Bayesian estimation of sportsbook combination weights for one bucket.
//!
//! Model:
//!   w   ~ Dirichlet(a, …, a)
//!   p_i = Σ_j w_j·v_ij·f_ij / Σ_j w_j·v_ij
//!   y_i ~ Bernoulli(p_i)
//!
//! Only the books that quoted snapshot `i` enter `p_i`, and their weights are
//! renormalized over that subset, which is what lets the model learn from
//! snapshots where some books are missing.
//!
//! The simplex is sampled in additive-log-ratio coordinates
//! `z_k = ln(w_k / w_K)`, k < K. The Jacobian of that map is `Π_j w_j`, so the
//! Dirichlet prior becomes `a · Σ_j ln w_j` in `z`-space.

use tracing::{debug, info};

use super::ensemble::PosteriorEnsemble;
use super::preprocess::TrainingSet;
use super::sampler::{self, ChainOutput, LogDensity, SamplerSettings};
use crate::error::{BlendError, BlendResult};

const EPS: f64 = 1e-9;

/// Inverse additive-log-ratio transform: softmax of `[z, 0]`.
pub fn alr_to_simplex(z: &[f64]) -> Vec<f64> {
    let max = z.iter().copied().fold(0.0f64, f64::max);
    let mut w: Vec<f64> = z.iter().map(|x| (x - max).exp()).collect();
    w.push((-max).exp());
    let total: f64 = w.iter().sum();
    for x in &mut w {
        *x /= total;
    }
    w
}

/// Log posterior of the combination model over ALR coordinates.
///
/// Rows are stored sparsely as (column, probability) pairs of the available
/// books only, so unavailable placeholders can never reach the sums.
pub struct CombinationModel {
    rows: Vec<(Vec<(usize, f64)>, bool)>,
    n_weights: usize,
    concentration: f64,
}

impl CombinationModel {
    /// Model over the given columns of `set`, in that order.
    pub fn new(set: &TrainingSet, columns: &[usize], concentration: f64) -> Self {
        let rows = set
            .availability
            .iter()
            .zip(&set.probability)
            .zip(&set.outcomes)
            .map(|((avail, prob), &y)| {
                let cells = columns
                    .iter()
                    .enumerate()
                    .filter(|&(_, &col)| avail[col])
                    .map(|(k, &col)| (k, prob[col]))
                    .collect();
                (cells, y)
            })
            .collect();
        CombinationModel {
            rows,
            n_weights: columns.len(),
            concentration,
        }
    }
}

impl LogDensity for CombinationModel {
    fn dim(&self) -> usize {
        self.n_weights - 1
    }

    fn log_density_and_gradient(&self, position: &[f64], gradient: &mut [f64]) -> f64 {
        let w = alr_to_simplex(position);
        let k = w.len();
        let mut grad_w = vec![0.0; k];
        let mut log_lik = 0.0;

        for (cells, y) in &self.rows {
            let mut num = 0.0;
            let mut den = 0.0;
            for &(j, f) in cells {
                num += w[j] * f;
                den += w[j];
            }
            if den <= 0.0 {
                return f64::NEG_INFINITY;
            }
            let p = num / den;
            let pc = p.clamp(EPS, 1.0 - EPS);
            let dl_dp = if *y {
                log_lik += pc.ln();
                1.0 / pc
            } else {
                log_lik += (1.0 - pc).ln();
                -1.0 / (1.0 - pc)
            };
            for &(j, f) in cells {
                grad_w[j] += dl_dp * (f - p) / den;
            }
        }

        let mut log_prior = 0.0;
        for &x in &w {
            if x <= 0.0 {
                return f64::NEG_INFINITY;
            }
            log_prior += self.concentration * x.ln();
        }

        // Chain rule through the softmax: dw_j/dz_i = w_j (δ_ij − w_i).
        let dot: f64 = w.iter().zip(&grad_w).map(|(a, b)| a * b).sum();
        for (i, g) in gradient.iter_mut().enumerate() {
            *g = w[i] * (grad_w[i] - dot) + self.concentration * (1.0 - k as f64 * w[i]);
        }
        log_lik + log_prior
    }
}

/// Produces a posterior ensemble of weight vectors for one bucket.
#[derive(Debug, Clone)]
pub struct WeightEstimator {
    settings: SamplerSettings,
}

impl WeightEstimator {
    pub fn new(settings: SamplerSettings) -> Self {
        WeightEstimator { settings }
    }

    /// Sample the posterior and pool all chains.
    ///
    /// Books that never quoted in this bucket are not identified by the data;
    /// they are left out of the sampler and carry weight 0 in every draw.
    pub fn estimate(&self, set: &TrainingSet) -> BlendResult<PosteriorEnsemble> {
        let width = set.n_forecasters();
        let active: Vec<usize> = set
            .available_counts()
            .iter()
            .enumerate()
            .filter(|&(_, &count)| count > 0)
            .map(|(j, _)| j)
            .collect();
        if active.len() < 2 {
            return Err(BlendError::InsufficientData(format!(
                "{} sportsbook(s) quoted in this bucket, need at least 2",
                active.len()
            )));
        }
        if active.len() < width {
            info!(
                "{} of {} sportsbooks never quoted in this bucket; fixing their weight at 0",
                width - active.len(),
                width
            );
        }

        let model = CombinationModel::new(set, &active, self.settings.prior_concentration);
        let chains = sampler::sample(&model, &self.settings)?;
        self.pool_chains(&chains, set, &active)
    }

    /// Apply the convergence checks to sampled chains, then pool them into
    /// full-width weight draws.
    fn pool_chains(
        &self,
        chains: &[ChainOutput],
        set: &TrainingSet,
        active: &[usize],
    ) -> BlendResult<PosteriorEnsemble> {
        let width = set.n_forecasters();
        let divergences: usize = chains.iter().map(|c| c.divergences).sum();
        for chain in chains {
            debug!(
                "Chain {}: step size {:.4}, mean acceptance {:.3}, {} divergence(s)",
                chain.chain, chain.step_size, chain.mean_accept, chain.divergences
            );
        }
        if divergences > self.settings.max_divergences {
            return Err(BlendError::Convergence(format!(
                "{divergences} divergent transition(s) after tuning"
            )));
        }

        let weights: Vec<Vec<Vec<f64>>> = chains
            .iter()
            .map(|c| c.draws.iter().map(|z| alr_to_simplex(z)).collect())
            .collect();

        for (k, &col) in active.iter().enumerate() {
            let series: Vec<Vec<f64>> = weights
                .iter()
                .map(|chain| chain.iter().map(|w| w[k]).collect())
                .collect();
            if let Some(rhat) = sampler::split_rhat(&series) {
                if !(rhat <= self.settings.max_rhat) {
                    return Err(BlendError::Convergence(format!(
                        "R-hat {:.3} for {} exceeds {:.3}",
                        rhat, set.forecasters[col], self.settings.max_rhat
                    )));
                }
            }
        }

        let draws: Vec<Vec<f64>> = weights
            .into_iter()
            .flatten()
            .map(|w| {
                let mut full = vec![0.0; width];
                for (k, &col) in active.iter().enumerate() {
                    full[col] = w[k];
                }
                full
            })
            .collect();

        PosteriorEnsemble::new(draws, width)
    }
}
