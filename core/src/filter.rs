//! Per-node particle filter over 3D position and clock/antenna delay.
//!
//! The [`Estimator`] trait is the narrow interface the orchestration layer talks to: get/set a
//! particle, resize, apply one range measurement against a peer snapshot, and read the weighted
//! mean and variance. [`RangeParticleFilter`] is the in-process implementation.
//!
//! ## Update scheme
//!
//! The first measurement after (re)initialization places every particle on a sphere whose
//! radius is the measured range, centered on a per-particle draw from the peer's estimate. This
//! replaces the broad Gaussian prior with a hypothesis set that already agrees with one range.
//!
//! Every later measurement is applied by progressive correction: the likelihood $L$ is split
//! into $K$ tempered factors $L^{1/K}$. Before each factor the particles are diffused with
//! per-axis noise `max(floor, bandwidth * weighted_std)`, then reweighted, then resampled if the
//! effective sample size $1 / \sum w_i^2$ falls below `effective_sample_threshold * N`. The
//! product of the factors is the full likelihood, so measurement information is counted once,
//! while the intermediate diffuse/resample steps let a sparse cloud migrate onto the narrow
//! likelihood ridge instead of collapsing onto a handful of survivors.
use crate::error::{LocalizationError, Result};
use crate::measurements::{NlosModel, RangeLikelihood, predicted_range};
use crate::node::ANCHOR_VARIANCE;
use crate::particle::{ParticleResamplingStrategy, ParticleSet, ParticleState, StateVector};

use log::{debug, warn};
use nalgebra::Vector3;
use rand::prelude::*;
use rand_distr::{Distribution, Exp, StandardNormal};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt::{self, Debug};

/// Capability exposed by a node's numerical engine.
pub trait Estimator: Send {
    /// Allocate `num_particles` particles drawn from the prior and forget any estimate.
    fn initialize(&mut self, num_particles: usize, model_delay: bool) -> Result<()>;
    /// Collapse the set onto a known position (anchor nodes).
    fn pin(&mut self, position: &Vector3<f64>) -> Result<()>;
    fn num_particles(&self) -> usize;
    fn get_particle(&self, index: usize) -> Result<ParticleState>;
    fn set_particle(&mut self, index: usize, state: ParticleState) -> Result<()>;
    /// Discard the current set and reinitialize from the prior with a new size.
    fn resize(&mut self, num_particles: usize) -> Result<()>;
    /// Apply one range measurement taken against a peer described by its mean and variance.
    fn estimate_state(
        &mut self,
        measurement: f64,
        nlos_probability: f64,
        peer_mean: &StateVector,
        peer_variance: &StateVector,
    ) -> Result<()>;
    fn get_estimate_mean(&self) -> Result<StateVector>;
    fn get_estimate_variance(&self) -> Result<StateVector>;
    /// `true` once an estimate is available.
    fn is_initialized(&self) -> bool;
    fn effective_sample_size(&self) -> f64;
}

/// Tuning parameters of [`RangeParticleFilter`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Standard deviation of the Gaussian prior around the seed position.
    pub prior_std: f64,
    /// Line-of-sight range standard deviation assumed by the likelihood.
    pub range_std: f64,
    pub resampling_strategy: ParticleResamplingStrategy,
    /// Resample when ESS < threshold * N.
    pub effective_sample_threshold: f64,
    /// Number of tempered stages per measurement.
    pub correction_stages: usize,
    /// Diffusion as a fraction of the weighted per-axis spread.
    pub diffusion_bandwidth: f64,
    pub min_diffusion_std: f64,
    pub min_delay_diffusion_std: f64,
    /// Carry the delay term through the predicted range.
    pub model_delay: bool,
    /// Rate of the exponential prior on a node's own delay (range-shell bootstrap only).
    pub delay_prior_rate: f64,
    pub nlos_model: NlosModel,
}

impl Default for FilterConfig {
    fn default() -> Self {
        FilterConfig {
            prior_std: 20.0,
            range_std: 0.2,
            resampling_strategy: ParticleResamplingStrategy::Systematic,
            effective_sample_threshold: 0.5,
            correction_stages: 8,
            diffusion_bandwidth: 0.05,
            min_diffusion_std: 0.02,
            min_delay_diffusion_std: 1e-7,
            model_delay: false,
            delay_prior_rate: 10.0,
            nlos_model: NlosModel::default(),
        }
    }
}

impl FilterConfig {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(LocalizationError::InvalidConfig(msg.to_string()));
        if !(self.prior_std.is_finite() && self.prior_std >= 0.0) {
            return invalid("prior_std must be finite and non-negative");
        }
        if !(self.range_std.is_finite() && self.range_std > 0.0) {
            return invalid("range_std must be finite and positive");
        }
        if !self.nlos_model.is_valid() {
            return invalid("nlos_model parameters are not a valid density");
        }
        if !(0.0..=1.0).contains(&self.effective_sample_threshold) {
            return invalid("effective_sample_threshold must lie in [0, 1]");
        }
        if self.correction_stages == 0 {
            return invalid("correction_stages must be at least 1");
        }
        if !(self.diffusion_bandwidth >= 0.0
            && self.min_diffusion_std >= 0.0
            && self.min_delay_diffusion_std >= 0.0)
        {
            return invalid("diffusion parameters must be non-negative");
        }
        if !(self.delay_prior_rate.is_finite() && self.delay_prior_rate > 0.0) {
            return invalid("delay_prior_rate must be finite and positive");
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
struct Moments {
    mean: StateVector,
    variance: StateVector,
}

/// Particle filter localizing one node from range measurements to peers.
#[derive(Clone)]
pub struct RangeParticleFilter {
    config: FilterConfig,
    particles: ParticleSet,
    prior_center: Vector3<f64>,
    model_delay: bool,
    pinned: Option<Vector3<f64>>,
    estimate: Option<Moments>,
    rng: StdRng,
    measurements_applied: usize,
    degenerate_events: usize,
}

impl Debug for RangeParticleFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let min_weight = self.particles.iter().map(|p| p.w).fold(f64::INFINITY, f64::min);
        let max_weight = self.particles.iter().map(|p| p.w).fold(0.0, f64::max);
        let mut s = f.debug_struct("RangeParticleFilter");
        s.field("num_particles", &self.particles.len())
            .field("effective_particles", &self.particles.effective_sample_size())
            .field(
                "weight_range",
                &format_args!("[{:.4e}, {:.4e}]", min_weight, max_weight),
            )
            .field("pinned", &self.pinned.is_some())
            .field("measurements_applied", &self.measurements_applied);
        if let Some(estimate) = &self.estimate {
            s.field("mean", &format_args!("{}", estimate.mean))
                .field("variance", &format_args!("{}", estimate.variance));
        }
        s.finish()
    }
}

impl RangeParticleFilter {
    /// Create an empty filter. Call [`Estimator::initialize`] (or [`Estimator::pin`]) before use.
    pub fn new(config: FilterConfig, prior_center: Vector3<f64>, seed: u64) -> Result<Self> {
        config.validate()?;
        Ok(RangeParticleFilter {
            model_delay: config.model_delay,
            config,
            particles: ParticleSet::default(),
            prior_center,
            pinned: None,
            estimate: None,
            rng: StdRng::seed_from_u64(seed),
            measurements_applied: 0,
            degenerate_events: 0,
        })
    }

    /// Create a filter with `num_particles` drawn from the prior.
    pub fn with_particles(
        num_particles: usize,
        config: FilterConfig,
        prior_center: Vector3<f64>,
        seed: u64,
    ) -> Result<Self> {
        let model_delay = config.model_delay;
        let mut filter = Self::new(config, prior_center, seed)?;
        filter.initialize(num_particles, model_delay)?;
        Ok(filter)
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }
    pub fn particles(&self) -> &ParticleSet {
        &self.particles
    }
    pub fn is_pinned(&self) -> bool {
        self.pinned.is_some()
    }
    pub fn measurements_applied(&self) -> usize {
        self.measurements_applied
    }
    /// Number of times an update collapsed all weights and fell back to uniform.
    pub fn degenerate_events(&self) -> usize {
        self.degenerate_events
    }
    /// Center of the Gaussian prior used by the next (re)initialization.
    pub fn set_prior_center(&mut self, center: Vector3<f64>) {
        self.prior_center = center;
    }

    fn draw_prior(&mut self, num_particles: usize) {
        self.particles = ParticleSet::gaussian_prior(
            num_particles,
            &self.prior_center,
            self.config.prior_std,
            &mut self.rng,
        );
        self.estimate = None;
        self.measurements_applied = 0;
    }

    fn refresh_estimate(&mut self) {
        let mean = self.particles.weighted_mean();
        let variance = self.particles.weighted_variance(&mean);
        self.estimate = Some(Moments { mean, variance });
    }

    /// Place every particle on the measured-range sphere around a draw from the peer.
    fn bootstrap_from_range(
        &mut self,
        measurement: f64,
        peer_mean: &StateVector,
        peer_variance: &StateVector,
    ) -> Result<()> {
        let model_delay = self.model_delay;
        let delay_prior = Exp::new(self.config.delay_prior_rate)
            .map_err(|e| LocalizationError::InvalidConfig(e.to_string()))?;
        let rng = &mut self.rng;
        for particle in self.particles.iter_mut() {
            let peer = sample_peer(rng, peer_mean, peer_variance, model_delay);
            let (delay, radius) = if model_delay {
                let own_delay = loop {
                    let d: f64 = delay_prior.sample(rng);
                    if d < 1.0 {
                        break d;
                    }
                };
                let adjusted = measurement - peer.delay * measurement - own_delay * measurement;
                (own_delay, if adjusted < 0.0 { measurement } else { adjusted })
            } else {
                (0.0, measurement)
            };
            let radius = radius.max(0.0);
            let position = peer.position + random_unit_vector(rng) * radius;
            particle.set_position(&position);
            particle.d = delay;
        }
        self.particles.set_uniform_weights();
        debug!(
            "bootstrapped {} particles on a {:.3} shell around {}",
            self.particles.len(),
            measurement,
            peer_mean
        );
        Ok(())
    }

    /// Jitter every particle by `max(floor, bandwidth * weighted_std)` per component.
    fn diffuse(&mut self) {
        let mean = self.particles.weighted_mean();
        let variance = self.particles.weighted_variance(&mean);
        let bandwidth = self.config.diffusion_bandwidth;
        let position_std = variance
            .position
            .map(|v| (bandwidth * v.sqrt()).max(self.config.min_diffusion_std));
        let delay_std = (bandwidth * variance.delay.sqrt()).max(self.config.min_delay_diffusion_std);
        let model_delay = self.model_delay;
        let rng = &mut self.rng;
        for particle in self.particles.iter_mut() {
            particle.x += rng.sample::<f64, _>(StandardNormal) * position_std[0];
            particle.y += rng.sample::<f64, _>(StandardNormal) * position_std[1];
            particle.z += rng.sample::<f64, _>(StandardNormal) * position_std[2];
            if model_delay {
                particle.d =
                    (particle.d + rng.sample::<f64, _>(StandardNormal) * delay_std).max(0.0);
            }
        }
    }

    fn progressive_correction(
        &mut self,
        measurement: f64,
        nlos_probability: f64,
        peer_mean: &StateVector,
        peer_variance: &StateVector,
    ) {
        let stages = self.config.correction_stages;
        let tempering = 1.0 / stages as f64;
        let likelihood = RangeLikelihood::new(self.config.range_std, self.config.nlos_model);
        let model_delay = self.model_delay;
        let n = self.particles.len();
        for stage in 0..stages {
            self.diffuse();
            let rng = &mut self.rng;
            let log_weights: Vec<f64> = self
                .particles
                .iter()
                .map(|particle| {
                    let peer = sample_peer(rng, peer_mean, peer_variance, model_delay);
                    let expected = predicted_range(
                        &particle.position(),
                        particle.d,
                        &peer.position,
                        peer.delay,
                        measurement,
                        model_delay,
                    );
                    particle.w.ln()
                        + tempering * likelihood.log_likelihood(measurement - expected, nlos_probability)
                })
                .collect();
            if !self.particles.assign_log_weights(&log_weights) {
                self.degenerate_events += 1;
                warn!(
                    "all particle weights collapsed at stage {}/{} (range {:.3}); reset to uniform",
                    stage + 1,
                    stages,
                    measurement
                );
            }
            let threshold = self.config.effective_sample_threshold * n as f64;
            if self.particles.effective_sample_size() < threshold {
                self.particles
                    .resample(self.config.resampling_strategy, &mut self.rng);
            }
        }
    }
}

impl Estimator for RangeParticleFilter {
    fn initialize(&mut self, num_particles: usize, model_delay: bool) -> Result<()> {
        if num_particles == 0 {
            return Err(LocalizationError::InvalidConfig(
                "particle count must be positive".to_string(),
            ));
        }
        self.model_delay = model_delay;
        self.pinned = None;
        self.draw_prior(num_particles);
        Ok(())
    }

    fn pin(&mut self, position: &Vector3<f64>) -> Result<()> {
        let n = self.particles.len();
        if n == 0 {
            return Err(LocalizationError::InvalidConfig(
                "cannot pin an uninitialized filter".to_string(),
            ));
        }
        self.particles = ParticleSet::degenerate(n, position);
        self.pinned = Some(*position);
        self.estimate = Some(Moments {
            mean: StateVector::new(*position, 0.0),
            variance: StateVector::splat(ANCHOR_VARIANCE),
        });
        Ok(())
    }

    fn num_particles(&self) -> usize {
        self.particles.len()
    }

    fn get_particle(&self, index: usize) -> Result<ParticleState> {
        self.particles.get(index)
    }

    fn set_particle(&mut self, index: usize, state: ParticleState) -> Result<()> {
        self.particles.set(index, state)
    }

    fn resize(&mut self, num_particles: usize) -> Result<()> {
        if num_particles == 0 {
            return Err(LocalizationError::InvalidConfig(
                "particle count must be positive".to_string(),
            ));
        }
        match self.pinned {
            Some(position) => {
                self.particles = ParticleSet::degenerate(num_particles, &position);
            }
            None => self.draw_prior(num_particles),
        }
        Ok(())
    }

    fn estimate_state(
        &mut self,
        measurement: f64,
        nlos_probability: f64,
        peer_mean: &StateVector,
        peer_variance: &StateVector,
    ) -> Result<()> {
        if self.particles.is_empty() {
            return Err(LocalizationError::InvalidConfig(
                "filter has no particles; initialize it first".to_string(),
            ));
        }
        // Noisy ranges between nearby nodes can be negative; only non-finite values are rejected.
        if !measurement.is_finite() {
            return Err(LocalizationError::InvalidMeasurement(format!(
                "range must be finite, got {measurement}"
            )));
        }
        if !(0.0..=1.0).contains(&nlos_probability) {
            return Err(LocalizationError::InvalidMeasurement(format!(
                "NLOS probability must lie in [0, 1], got {nlos_probability}"
            )));
        }
        if !peer_mean.is_finite()
            || !peer_variance.is_finite()
            || peer_variance.position.iter().any(|&v| v < 0.0)
            || peer_variance.delay < 0.0
        {
            return Err(LocalizationError::InvalidMeasurement(
                "peer mean and variance must be finite with non-negative variance".to_string(),
            ));
        }
        if self.pinned.is_some() {
            debug!("ignoring range {measurement:.3} on a pinned filter");
            return Ok(());
        }

        if self.estimate.is_none() {
            self.bootstrap_from_range(measurement, peer_mean, peer_variance)?;
        } else {
            self.progressive_correction(measurement, nlos_probability, peer_mean, peer_variance);
        }
        self.refresh_estimate();
        self.measurements_applied += 1;
        Ok(())
    }

    fn get_estimate_mean(&self) -> Result<StateVector> {
        self.estimate
            .map(|e| e.mean)
            .ok_or(LocalizationError::NotInitialized)
    }

    fn get_estimate_variance(&self) -> Result<StateVector> {
        self.estimate
            .map(|e| e.variance)
            .ok_or(LocalizationError::NotInitialized)
    }

    fn is_initialized(&self) -> bool {
        self.estimate.is_some()
    }

    fn effective_sample_size(&self) -> f64 {
        self.particles.effective_sample_size()
    }
}

/// One draw of a peer's position (and delay, when modelled) from its mean and variance.
fn sample_peer<R: Rng + ?Sized>(
    rng: &mut R,
    mean: &StateVector,
    variance: &StateVector,
    model_delay: bool,
) -> StateVector {
    let position = Vector3::from_fn(|i, _| {
        mean.position[i] + rng.sample::<f64, _>(StandardNormal) * variance.position[i].sqrt()
    });
    let delay = if model_delay {
        mean.delay + rng.sample::<f64, _>(StandardNormal) * variance.delay.sqrt()
    } else {
        0.0
    };
    StateVector::new(position, delay)
}

fn random_unit_vector<R: Rng + ?Sized>(rng: &mut R) -> Vector3<f64> {
    let z: f64 = rng.random_range(-1.0..1.0);
    let azimuth: f64 = rng.random_range(0.0..2.0 * PI);
    let r = (1.0 - z * z).sqrt();
    Vector3::new(r * azimuth.cos(), r * azimuth.sin(), z)
}
