//! Hamiltonian Monte Carlo over an unconstrained parameter vector.
//!
//! Each chain starts from a jittered point, adapts its leapfrog step size by
//! dual averaging during the warm-up (`tune`) iterations, then records `draws`
//! positions. The leapfrog path length is drawn uniformly per iteration so a
//! fixed step size cannot lock the chain into periodic orbits.
//!
//! Chains are independent and run on the rayon pool; the only shared state is
//! the read-only target density.

use std::f64::consts::PI;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use crate::error::{BlendError, BlendResult};

/// Energy error above which a transition is reported as divergent.
const DIVERGENCE_THRESHOLD: f64 = 1000.0;

// Dual-averaging constants (Hoffman & Gelman, 2014).
const DA_GAMMA: f64 = 0.05;
const DA_T0: f64 = 10.0;
const DA_KAPPA: f64 = 0.75;

/// Target density for the sampler: log density (up to a constant) and its
/// gradient at an unconstrained point.
pub trait LogDensity: Sync {
    fn dim(&self) -> usize;

    /// Writes the gradient into `gradient` and returns the log density.
    /// A non-finite return marks the point as outside the support.
    fn log_density_and_gradient(&self, position: &[f64], gradient: &mut [f64]) -> f64;
}

#[derive(Debug, Clone, PartialEq)]
pub struct SamplerSettings {
    /// Post-warm-up draws kept per chain
    pub draws: usize,
    /// Warm-up iterations discarded per chain
    pub tune: usize,
    pub chains: usize,
    pub seed: u64,
    /// Mean acceptance probability the step-size adaptation aims for
    pub target_accept: f64,
    pub max_leapfrog_steps: usize,
    /// Post-warm-up divergent transitions tolerated before failing
    pub max_divergences: usize,
    /// Largest acceptable split-R̂ for any parameter
    pub max_rhat: f64,
    /// Symmetric Dirichlet concentration of the weight prior
    pub prior_concentration: f64,
}

impl Default for SamplerSettings {
    fn default() -> Self {
        SamplerSettings {
            draws: 2500,
            tune: 1000,
            chains: 2,
            seed: 0,
            target_accept: 0.8,
            max_leapfrog_steps: 32,
            max_divergences: 0,
            max_rhat: 1.05,
            prior_concentration: 1.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChainOutput {
    pub chain: usize,
    /// Post-warm-up positions, one per draw
    pub draws: Vec<Vec<f64>>,
    pub divergences: usize,
    pub step_size: f64,
    pub mean_accept: f64,
}

/// Run every chain in parallel and return them in chain order.
pub fn sample<D: LogDensity>(density: &D, settings: &SamplerSettings) -> BlendResult<Vec<ChainOutput>> {
    if settings.chains == 0 || settings.draws == 0 {
        return Err(BlendError::Convergence(
            "sampler needs at least one chain and one draw".to_string(),
        ));
    }
    (0..settings.chains)
        .into_par_iter()
        .map(|chain| run_chain(density, settings, chain))
        .collect()
}

pub fn run_chain<D: LogDensity>(
    density: &D,
    settings: &SamplerSettings,
    chain: usize,
) -> BlendResult<ChainOutput> {
    let dim = density.dim();
    let mut rng = StdRng::seed_from_u64(
        settings
            .seed
            .wrapping_add((chain as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)),
    );

    let mut position: Vec<f64> = (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect();
    let mut gradient = vec![0.0; dim];
    let mut log_density = density.log_density_and_gradient(&position, &mut gradient);
    if !log_density.is_finite() || gradient.iter().any(|g| !g.is_finite()) {
        return Err(BlendError::Convergence(format!(
            "chain {chain}: initial point has non-finite log density"
        )));
    }

    let mut step_size = initial_step_size(density, &position, log_density, &gradient, &mut rng);
    let mut adaptation = DualAveraging::new(step_size, settings.target_accept);
    let max_steps = settings.max_leapfrog_steps.max(1);

    let mut draws = Vec::with_capacity(settings.draws);
    let mut divergences = 0usize;
    let mut accept_sum = 0.0;

    for iteration in 0..settings.tune + settings.draws {
        let steps = rng.gen_range(1..=max_steps);
        let transition = hmc_transition(
            density,
            &position,
            log_density,
            &gradient,
            step_size,
            steps,
            &mut rng,
        );
        if transition.accepted {
            position = transition.position;
            log_density = transition.log_density;
            gradient = transition.gradient;
        }

        if iteration < settings.tune {
            step_size = adaptation.update(transition.accept_prob);
            if iteration + 1 == settings.tune {
                step_size = adaptation.final_step_size();
            }
        } else {
            if transition.divergent {
                divergences += 1;
            }
            accept_sum += transition.accept_prob;
            draws.push(position.clone());
        }
    }

    Ok(ChainOutput {
        chain,
        draws,
        divergences,
        step_size,
        mean_accept: accept_sum / settings.draws as f64,
    })
}

/// Split-R̂ of one scalar parameter across chains.
///
/// Returns `None` when the chains are too short to split.
pub fn split_rhat(chains: &[Vec<f64>]) -> Option<f64> {
    let half = chains.iter().map(|c| c.len() / 2).min()?;
    if half < 2 {
        return None;
    }
    let mut halves: Vec<&[f64]> = Vec::with_capacity(chains.len() * 2);
    for c in chains {
        halves.push(&c[..half]);
        halves.push(&c[c.len() - half..]);
    }

    let n = half as f64;
    let m = halves.len() as f64;
    let means: Vec<f64> = halves.iter().map(|h| h.iter().sum::<f64>() / n).collect();
    let within: f64 = halves
        .iter()
        .zip(&means)
        .map(|(h, mean)| h.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0))
        .sum::<f64>()
        / m;
    let grand = means.iter().sum::<f64>() / m;
    let between = n * means.iter().map(|x| (x - grand).powi(2)).sum::<f64>() / (m - 1.0);

    if within <= 0.0 {
        return Some(if between <= 0.0 { 1.0 } else { f64::INFINITY });
    }
    let pooled = (n - 1.0) / n * within + between / n;
    Some((pooled / within).sqrt())
}

// ── Internals ────────────────────────────────────────────────────────────────

struct Transition {
    position: Vec<f64>,
    log_density: f64,
    gradient: Vec<f64>,
    accept_prob: f64,
    accepted: bool,
    divergent: bool,
}

fn hmc_transition<D: LogDensity, R: Rng>(
    density: &D,
    position: &[f64],
    log_density: f64,
    gradient: &[f64],
    step_size: f64,
    steps: usize,
    rng: &mut R,
) -> Transition {
    let momentum: Vec<f64> = (0..position.len()).map(|_| standard_normal(rng)).collect();
    let initial_energy = -log_density + kinetic_energy(&momentum);

    let (q, p, g, new_log_density) =
        leapfrog(density, position, momentum, gradient, step_size, steps);
    let energy = if new_log_density.is_finite() {
        -new_log_density + kinetic_energy(&p)
    } else {
        f64::INFINITY
    };

    let energy_error = energy - initial_energy;
    let divergent = energy_error.is_nan() || energy_error > DIVERGENCE_THRESHOLD;
    let accept_prob = if divergent {
        0.0
    } else {
        (-energy_error).exp().min(1.0)
    };
    let accepted = !divergent && rng.gen::<f64>() < accept_prob;

    Transition {
        position: q,
        log_density: new_log_density,
        gradient: g,
        accept_prob,
        accepted,
        divergent,
    }
}

/// `steps` leapfrog updates; stops early once the density leaves its support.
fn leapfrog<D: LogDensity>(
    density: &D,
    position: &[f64],
    mut momentum: Vec<f64>,
    gradient: &[f64],
    step_size: f64,
    steps: usize,
) -> (Vec<f64>, Vec<f64>, Vec<f64>, f64) {
    let mut q = position.to_vec();
    let mut g = gradient.to_vec();
    let mut log_density = f64::NAN;
    for _ in 0..steps {
        for (p, grad) in momentum.iter_mut().zip(&g) {
            *p += 0.5 * step_size * grad;
        }
        for (x, p) in q.iter_mut().zip(&momentum) {
            *x += step_size * p;
        }
        log_density = density.log_density_and_gradient(&q, &mut g);
        if !log_density.is_finite() || g.iter().any(|v| !v.is_finite()) {
            return (q, momentum, g, f64::NEG_INFINITY);
        }
        for (p, grad) in momentum.iter_mut().zip(&g) {
            *p += 0.5 * step_size * grad;
        }
    }
    (q, momentum, g, log_density)
}

/// Double or halve a unit step until a single leapfrog step's acceptance
/// probability crosses 0.5.
fn initial_step_size<D: LogDensity, R: Rng>(
    density: &D,
    position: &[f64],
    log_density: f64,
    gradient: &[f64],
    rng: &mut R,
) -> f64 {
    let momentum: Vec<f64> = (0..position.len()).map(|_| standard_normal(rng)).collect();
    let initial_energy = -log_density + kinetic_energy(&momentum);
    let accept = |eps: f64| -> f64 {
        let (_, p, _, lp) = leapfrog(density, position, momentum.clone(), gradient, eps, 1);
        if !lp.is_finite() {
            return 0.0;
        }
        let error = -lp + kinetic_energy(&p) - initial_energy;
        if error.is_nan() {
            0.0
        } else {
            (-error).exp().min(1.0)
        }
    };

    let mut step_size = 1.0;
    let direction = if accept(step_size) > 0.5 { 1.0 } else { -1.0 };
    for _ in 0..50 {
        let a = accept(step_size);
        if direction > 0.0 && a <= 0.5 || direction < 0.0 && a >= 0.5 {
            break;
        }
        step_size *= 2f64.powf(direction);
    }
    step_size.clamp(1e-6, 10.0)
}

struct DualAveraging {
    mu: f64,
    target: f64,
    iteration: f64,
    h_bar: f64,
    log_step: f64,
    log_step_bar: f64,
}

impl DualAveraging {
    fn new(initial_step: f64, target: f64) -> Self {
        DualAveraging {
            mu: (10.0 * initial_step).ln(),
            target,
            iteration: 0.0,
            h_bar: 0.0,
            log_step: initial_step.ln(),
            log_step_bar: 0.0,
        }
    }

    fn update(&mut self, accept_prob: f64) -> f64 {
        self.iteration += 1.0;
        let t = self.iteration;
        let eta = 1.0 / (t + DA_T0);
        self.h_bar = (1.0 - eta) * self.h_bar + eta * (self.target - accept_prob);
        self.log_step = self.mu - t.sqrt() / DA_GAMMA * self.h_bar;
        let weight = t.powf(-DA_KAPPA);
        self.log_step_bar = weight * self.log_step + (1.0 - weight) * self.log_step_bar;
        self.log_step.exp()
    }

    fn final_step_size(&self) -> f64 {
        self.log_step_bar.exp()
    }
}

fn kinetic_energy(momentum: &[f64]) -> f64 {
    0.5 * momentum.iter().map(|p| p * p).sum::<f64>()
}

/// Box–Muller transform of two uniforms.
fn standard_normal<R: Rng>(rng: &mut R) -> f64 {
    let u1 = 1.0 - rng.gen::<f64>();
    let u2 = rng.gen::<f64>();
    (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
}
