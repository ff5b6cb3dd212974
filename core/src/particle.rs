//! Particle representation, weight bookkeeping and resampling.
//!
//! A [`ParticleSet`] is the Monte Carlo approximation of one node's posterior over its 3D
//! position and clock/antenna delay. It is exclusively owned by the filter of that node; other
//! nodes only ever see the weighted moments computed here.
use crate::error::{LocalizationError, Result};

use nalgebra::Vector3;
use rand::prelude::*;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// One position/delay hypothesis with its importance weight.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ParticleState {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    /// Clock/antenna delay, expressed as a fraction of the measured range.
    pub d: f64,
    pub w: f64,
}
impl Display for ParticleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Particle")
            .field("x", &self.x)
            .field("y", &self.y)
            .field("z", &self.z)
            .field("delay", &self.d)
            .field("weight", &self.w)
            .finish()
    }
}
impl ParticleState {
    pub fn new(position: Vector3<f64>, delay: f64, weight: f64) -> Self {
        ParticleState {
            x: position[0],
            y: position[1],
            z: position[2],
            d: delay,
            w: weight,
        }
    }
    pub fn position(&self) -> Vector3<f64> {
        Vector3::new(self.x, self.y, self.z)
    }
    pub fn set_position(&mut self, position: &Vector3<f64>) {
        self.x = position[0];
        self.y = position[1];
        self.z = position[2];
    }
}

/// Position and delay components of a mean or a per-component variance.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StateVector {
    pub position: Vector3<f64>,
    pub delay: f64,
}
impl Display for StateVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({:.3}, {:.3}, {:.3}; d={:.4})",
            self.position[0], self.position[1], self.position[2], self.delay
        )
    }
}
impl StateVector {
    pub fn new(position: Vector3<f64>, delay: f64) -> Self {
        StateVector { position, delay }
    }
    /// All four components set to the same value.
    pub fn splat(value: f64) -> Self {
        StateVector {
            position: Vector3::repeat(value),
            delay: value,
        }
    }
    pub fn is_finite(&self) -> bool {
        self.position.iter().all(|v| v.is_finite()) && self.delay.is_finite()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "snake_case")]
pub enum ParticleResamplingStrategy {
    #[default]
    Systematic,
    Stratified,
    Multinomial,
    Residual,
}

impl ParticleResamplingStrategy {
    /// Draw `n` ancestor indices from the (not necessarily normalized) weights.
    pub fn resample_indices<R: Rng + ?Sized>(
        &self,
        weights: &[f64],
        n: usize,
        rng: &mut R,
    ) -> Vec<usize> {
        match self {
            ParticleResamplingStrategy::Systematic => systematic_resample(weights, n, rng),
            ParticleResamplingStrategy::Stratified => stratified_resample(weights, n, rng),
            ParticleResamplingStrategy::Multinomial => multinomial_resample(weights, n, rng),
            ParticleResamplingStrategy::Residual => residual_resample(weights, n, rng),
        }
    }
}

fn cumulative_weights(weights: &[f64]) -> Vec<f64> {
    let total: f64 = weights.iter().sum();
    let mut acc = 0.0;
    let mut cumsum: Vec<f64> = weights
        .iter()
        .map(|w| {
            acc += w / total;
            acc
        })
        .collect();
    if let Some(last) = cumsum.last_mut() {
        *last = 1.0;
    }
    cumsum
}

/// Invert the cumulative distribution at sorted positions in [0, 1).
fn invert_sorted(cumsum: &[f64], positions: impl Iterator<Item = f64>) -> Vec<usize> {
    let last = cumsum.len() - 1;
    let mut indices = Vec::new();
    let mut i = 0;
    for u in positions {
        while u > cumsum[i] && i < last {
            i += 1;
        }
        indices.push(i);
    }
    indices
}

/// Low-variance resampling: one uniform offset, `n` evenly spaced pointers.
pub fn systematic_resample<R: Rng + ?Sized>(weights: &[f64], n: usize, rng: &mut R) -> Vec<usize> {
    if weights.is_empty() || n == 0 {
        return Vec::new();
    }
    let cumsum = cumulative_weights(weights);
    let step = 1.0 / n as f64;
    let offset = rng.random::<f64>() * step;
    invert_sorted(&cumsum, (0..n).map(|m| offset + m as f64 * step))
}

/// One independent uniform draw inside each of `n` equal strata.
pub fn stratified_resample<R: Rng + ?Sized>(weights: &[f64], n: usize, rng: &mut R) -> Vec<usize> {
    if weights.is_empty() || n == 0 {
        return Vec::new();
    }
    let cumsum = cumulative_weights(weights);
    let step = 1.0 / n as f64;
    let positions: Vec<f64> = (0..n)
        .map(|m| (m as f64 + rng.random::<f64>()) * step)
        .collect();
    invert_sorted(&cumsum, positions.into_iter())
}

pub fn multinomial_resample<R: Rng + ?Sized>(
    weights: &[f64],
    n: usize,
    rng: &mut R,
) -> Vec<usize> {
    if weights.is_empty() || n == 0 {
        return Vec::new();
    }
    let cumsum = cumulative_weights(weights);
    let last = cumsum.len() - 1;
    (0..n)
        .map(|_| {
            let u = rng.random::<f64>();
            cumsum.partition_point(|&c| c < u).min(last)
        })
        .collect()
}

/// Deterministic `floor(n * w)` copies, remainder drawn systematically from the residuals.
pub fn residual_resample<R: Rng + ?Sized>(weights: &[f64], n: usize, rng: &mut R) -> Vec<usize> {
    if weights.is_empty() || n == 0 {
        return Vec::new();
    }
    let total: f64 = weights.iter().sum();
    let mut indices = Vec::with_capacity(n);
    let mut residual = Vec::with_capacity(weights.len());
    for (i, &w) in weights.iter().enumerate() {
        let scaled = w / total * n as f64;
        let copies = scaled.floor() as usize;
        for _ in 0..copies {
            indices.push(i);
        }
        residual.push(scaled - copies as f64);
    }
    indices.truncate(n);
    let remaining = n - indices.len();
    if remaining > 0 {
        if residual.iter().sum::<f64>() > 0.0 {
            indices.extend(systematic_resample(&residual, remaining, rng));
        } else {
            indices.extend(systematic_resample(weights, remaining, rng));
        }
    }
    indices
}

/// Fixed-length collection of particles owned by one node.
#[derive(Clone, Debug, Default)]
pub struct ParticleSet {
    particles: Vec<ParticleState>,
}

impl ParticleSet {
    pub fn from_particles(particles: Vec<ParticleState>) -> Self {
        ParticleSet { particles }
    }

    /// Broad prior: isotropic Gaussian jitter around `center`, zero delay, uniform weights.
    pub fn gaussian_prior<R: Rng + ?Sized>(
        num_particles: usize,
        center: &Vector3<f64>,
        std: f64,
        rng: &mut R,
    ) -> Self {
        let weight = 1.0 / num_particles as f64;
        let particles = (0..num_particles)
            .map(|_| {
                let jitter = Vector3::from_fn(|_, _| rng.sample::<f64, _>(StandardNormal) * std);
                ParticleState::new(center + jitter, 0.0, weight)
            })
            .collect();
        ParticleSet { particles }
    }

    /// Every particle pinned at `position` with zero delay and uniform weight.
    pub fn degenerate(num_particles: usize, position: &Vector3<f64>) -> Self {
        let weight = 1.0 / num_particles as f64;
        ParticleSet {
            particles: vec![ParticleState::new(*position, 0.0, weight); num_particles],
        }
    }

    pub fn len(&self) -> usize {
        self.particles.len()
    }
    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }
    pub fn iter(&self) -> std::slice::Iter<'_, ParticleState> {
        self.particles.iter()
    }
    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, ParticleState> {
        self.particles.iter_mut()
    }
    pub fn as_slice(&self) -> &[ParticleState] {
        &self.particles
    }

    pub fn get(&self, index: usize) -> Result<ParticleState> {
        self.particles
            .get(index)
            .copied()
            .ok_or(LocalizationError::IndexOutOfRange {
                index,
                len: self.particles.len(),
            })
    }

    pub fn set(&mut self, index: usize, state: ParticleState) -> Result<()> {
        let len = self.particles.len();
        match self.particles.get_mut(index) {
            Some(slot) => {
                *slot = state;
                Ok(())
            }
            None => Err(LocalizationError::IndexOutOfRange { index, len }),
        }
    }

    pub fn weights(&self) -> Vec<f64> {
        self.particles.iter().map(|p| p.w).collect()
    }

    pub fn weight_sum(&self) -> f64 {
        self.particles.iter().map(|p| p.w).sum()
    }

    pub fn set_uniform_weights(&mut self) {
        let uniform = 1.0 / self.particles.len() as f64;
        for particle in &mut self.particles {
            particle.w = uniform;
        }
    }

    /// Normalize weights to sum to one. Returns `false` when the sum was zero or not finite
    /// and the weights were reset to uniform instead.
    pub fn normalize_weights(&mut self) -> bool {
        let sum = self.weight_sum();
        if sum > 0.0 && sum.is_finite() {
            for particle in &mut self.particles {
                particle.w /= sum;
            }
            true
        } else {
            self.set_uniform_weights();
            false
        }
    }

    /// Replace the weights from unnormalized log weights, subtracting the maximum first so
    /// that uniformly tiny likelihoods do not underflow. Same fallback as [`Self::normalize_weights`].
    pub fn assign_log_weights(&mut self, log_weights: &[f64]) -> bool {
        let max_log = log_weights
            .iter()
            .cloned()
            .fold(f64::NEG_INFINITY, f64::max);
        if !max_log.is_finite() {
            self.set_uniform_weights();
            return false;
        }
        for (particle, log_w) in self.particles.iter_mut().zip(log_weights.iter()) {
            let w = (log_w - max_log).exp();
            particle.w = if w.is_finite() { w } else { 0.0 };
        }
        self.normalize_weights()
    }

    pub fn effective_sample_size(&self) -> f64 {
        let sum_of_squares: f64 = self.particles.iter().map(|p| p.w * p.w).sum();
        if sum_of_squares > 0.0 {
            1.0 / sum_of_squares
        } else {
            0.0
        }
    }

    /// Weighted mean of position and delay. Falls back to the unweighted mean when the
    /// weights sum to zero.
    pub fn weighted_mean(&self) -> StateVector {
        let sum = self.weight_sum();
        let uniform = 1.0 / self.particles.len().max(1) as f64;
        let mut position = Vector3::zeros();
        let mut delay = 0.0;
        for particle in &self.particles {
            let w = if sum > 0.0 { particle.w / sum } else { uniform };
            position += particle.position() * w;
            delay += particle.d * w;
        }
        StateVector::new(position, delay)
    }

    /// Weighted per-component variance about `mean`.
    pub fn weighted_variance(&self, mean: &StateVector) -> StateVector {
        let sum = self.weight_sum();
        let uniform = 1.0 / self.particles.len().max(1) as f64;
        let mut position = Vector3::zeros();
        let mut delay = 0.0;
        for particle in &self.particles {
            let w = if sum > 0.0 { particle.w / sum } else { uniform };
            let diff = particle.position() - mean.position;
            position += diff.component_mul(&diff) * w;
            delay += (particle.d - mean.delay).powi(2) * w;
        }
        StateVector::new(position, delay)
    }

    /// Replace the set by `len()` particles drawn according to the weights; weights reset to 1/N.
    pub fn resample<R: Rng + ?Sized>(&mut self, strategy: ParticleResamplingStrategy, rng: &mut R) {
        let n = self.particles.len();
        if n == 0 {
            return;
        }
        let indices = strategy.resample_indices(&self.weights(), n, rng);
        let uniform = 1.0 / n as f64;
        self.particles = indices
            .into_iter()
            .map(|idx| {
                let mut particle = self.particles[idx];
                particle.w = uniform;
                particle
            })
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn skewed_set() -> ParticleSet {
        ParticleSet::from_particles(vec![
            ParticleState::new(Vector3::new(0.0, 0.0, 0.0), 0.0, 0.1),
            ParticleState::new(Vector3::new(1.0, 0.0, 0.0), 0.0, 0.2),
            ParticleState::new(Vector3::new(2.0, 0.0, 0.0), 0.0, 0.3),
            ParticleState::new(Vector3::new(3.0, 0.0, 0.0), 0.0, 0.4),
        ])
    }

    #[test]
    fn get_and_set_are_bounds_checked() {
        let mut set = ParticleSet::degenerate(3, &Vector3::new(1.0, 2.0, 3.0));
        let p = ParticleState {
            x: 1.0,
            y: 2.0,
            z: 3.0,
            d: 4.0,
            w: 0.5,
        };
        set.set(2, p).unwrap();
        assert_eq!(set.get(2).unwrap(), p);
        assert_eq!(
            set.get(3),
            Err(LocalizationError::IndexOutOfRange { index: 3, len: 3 })
        );
        assert!(set.set(7, p).is_err());
    }

    #[test]
    fn normalize_falls_back_to_uniform_on_zero_sum() {
        let mut set = skewed_set();
        for p in set.iter_mut() {
            p.w = 0.0;
        }
        assert!(!set.normalize_weights());
        for p in set.iter() {
            assert_approx_eq!(p.w, 0.25, 1e-12);
        }
    }

    #[test]
    fn log_weights_survive_underflow() {
        let mut set = skewed_set();
        let log_weights = vec![-2000.0, -2001.0, -3000.0, f64::NEG_INFINITY];
        assert!(set.assign_log_weights(&log_weights));
        assert_approx_eq!(set.weight_sum(), 1.0, 1e-12);
        assert!(set.get(0).unwrap().w > set.get(1).unwrap().w);
        assert_eq!(set.get(3).unwrap().w, 0.0);

        assert!(!set.assign_log_weights(&[f64::NEG_INFINITY; 4]));
        assert_approx_eq!(set.get(3).unwrap().w, 0.25, 1e-12);
    }

    #[test]
    fn effective_sample_size_bounds() {
        let mut set = ParticleSet::degenerate(10, &Vector3::zeros());
        assert_approx_eq!(set.effective_sample_size(), 10.0, 1e-9);
        for (i, p) in set.iter_mut().enumerate() {
            p.w = if i == 0 { 1.0 } else { 0.0 };
        }
        assert_approx_eq!(set.effective_sample_size(), 1.0, 1e-9);
    }

    #[test]
    fn weighted_moments() {
        let set = skewed_set();
        let mean = set.weighted_mean();
        assert_approx_eq!(mean.position[0], 2.0, 1e-12);
        let var = set.weighted_variance(&mean);
        // 0.1*4 + 0.2*1 + 0.3*0 + 0.4*1
        assert_approx_eq!(var.position[0], 1.0, 1e-12);
        assert_approx_eq!(var.position[1], 0.0, 1e-12);
    }

    #[test]
    fn resampling_strategies_preserve_population_size() {
        let mut rng = StdRng::seed_from_u64(11);
        let weights = vec![0.05, 0.5, 0.05, 0.4];
        for strategy in [
            ParticleResamplingStrategy::Systematic,
            ParticleResamplingStrategy::Stratified,
            ParticleResamplingStrategy::Multinomial,
            ParticleResamplingStrategy::Residual,
        ] {
            for n in [1, 4, 97] {
                let indices = strategy.resample_indices(&weights, n, &mut rng);
                assert_eq!(indices.len(), n, "{strategy:?} with n={n}");
                assert!(indices.iter().all(|&i| i < weights.len()));
            }
        }
    }

    #[test]
    fn systematic_resample_follows_weights() {
        let mut rng = StdRng::seed_from_u64(3);
        let indices = systematic_resample(&[0.0, 1.0, 0.0], 50, &mut rng);
        assert!(indices.iter().all(|&i| i == 1));

        let indices = systematic_resample(&[0.25, 0.75], 100, &mut rng);
        let ones = indices.iter().filter(|&&i| i == 1).count();
        assert!((74..=76).contains(&ones));
    }

    #[test]
    fn residual_resample_keeps_deterministic_copies() {
        let mut rng = StdRng::seed_from_u64(5);
        let indices = residual_resample(&[0.5, 0.25, 0.25], 4, &mut rng);
        assert_eq!(indices, vec![0, 0, 1, 2]);
    }

    #[test]
    fn resampling_preserves_weighted_mean() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut set = ParticleSet::gaussian_prior(5000, &Vector3::new(1.0, -2.0, 3.0), 2.0, &mut rng);
        for p in set.iter_mut() {
            p.w = (-0.5 * (p.x - 2.0).powi(2)).exp();
        }
        set.normalize_weights();
        let before = set.weighted_mean();
        set.resample(ParticleResamplingStrategy::Systematic, &mut rng);
        let after = set.weighted_mean();
        assert_eq!(set.len(), 5000);
        assert_approx_eq!(set.weight_sum(), 1.0, 1e-9);
        assert!((before.position - after.position).norm() < 0.1);
    }
}
