//! Range measurement generation and the line-of-sight / non-line-of-sight likelihood.
//!
//! This module holds the two scalar models the filter is built on:
//! - [`RangeSensor`] produces a synthetic noisy range between two ground-truth endpoints.
//! - [`RangeLikelihood`] scores a range residual under a two-component mixture, a Gaussian for
//!   line-of-sight ranges and a heavy-tailed [`NlosModel`] for obstructed, biased ranges.

use crate::particle::StateVector;

use nalgebra::Vector3;
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt::{self, Display};

const LN_SQRT_2PI: f64 = 0.918_938_533_204_672_8;

/// Synthetic two-way ranging sensor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RangeSensor {
    /// Standard deviation of the zero-mean Gaussian range noise.
    pub noise_std: f64,
    /// Add `(delay_a + delay_b) * distance` to the generated range. Off by default.
    pub model_delay_asymmetry: bool,
}
impl Default for RangeSensor {
    fn default() -> Self {
        RangeSensor {
            noise_std: 0.1,
            model_delay_asymmetry: false,
        }
    }
}
impl Display for RangeSensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RangeSensor(noise_std: {}, delay_asymmetry: {})",
            self.noise_std, self.model_delay_asymmetry
        )
    }
}
impl RangeSensor {
    /// Measure the range between two ground-truth states.
    pub fn measure<R: Rng + ?Sized>(&self, a: &StateVector, b: &StateVector, rng: &mut R) -> f64 {
        let true_distance = (a.position - b.position).norm();
        let delay_error = if self.model_delay_asymmetry {
            (a.delay + b.delay) * true_distance
        } else {
            0.0
        };
        let noise = rng.sample::<f64, _>(StandardNormal) * self.noise_std;
        true_distance + delay_error + noise
    }
}

/// Heavy-tailed residual density used for non-line-of-sight ranges.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NlosModel {
    /// Zero-centered Cauchy density with the given scale.
    Cauchy { scale: f64 },
    /// Flat density over a residual (positive bias) interval.
    Uniform { min_bias: f64, max_bias: f64 },
}
impl Default for NlosModel {
    fn default() -> Self {
        NlosModel::Cauchy { scale: 1.0 }
    }
}
impl NlosModel {
    pub fn log_density(&self, residual: f64) -> f64 {
        match *self {
            NlosModel::Cauchy { scale } => {
                let r = residual / scale;
                -(PI * scale).ln() - r.mul_add(r, 1.0).ln()
            }
            NlosModel::Uniform { min_bias, max_bias } => {
                if residual >= min_bias && residual <= max_bias {
                    -(max_bias - min_bias).ln()
                } else {
                    f64::NEG_INFINITY
                }
            }
        }
    }
    pub fn is_valid(&self) -> bool {
        match *self {
            NlosModel::Cauchy { scale } => scale > 0.0 && scale.is_finite(),
            NlosModel::Uniform { min_bias, max_bias } => {
                min_bias.is_finite() && max_bias.is_finite() && max_bias > min_bias
            }
        }
    }
}

/// Log of the zero-mean Gaussian density with standard deviation `std` at `residual`.
pub fn gaussian_log_density(residual: f64, std: f64) -> f64 {
    let r = residual / std;
    -0.5 * r * r - std.ln() - LN_SQRT_2PI
}

fn log_sum_exp(a: f64, b: f64) -> f64 {
    let max = a.max(b);
    if max == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    max + ((a - max).exp() + (b - max).exp()).ln()
}

/// `(1 - p) * N(r; 0, range_std) + p * nlos(r)`, evaluated in log space.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RangeLikelihood {
    pub range_std: f64,
    pub nlos_model: NlosModel,
}
impl RangeLikelihood {
    pub fn new(range_std: f64, nlos_model: NlosModel) -> Self {
        RangeLikelihood {
            range_std,
            nlos_model,
        }
    }
    pub fn log_likelihood(&self, residual: f64, nlos_probability: f64) -> f64 {
        if !residual.is_finite() {
            return f64::NEG_INFINITY;
        }
        let los = if nlos_probability < 1.0 {
            (1.0 - nlos_probability).ln() + gaussian_log_density(residual, self.range_std)
        } else {
            f64::NEG_INFINITY
        };
        let nlos = if nlos_probability > 0.0 {
            nlos_probability.ln() + self.nlos_model.log_density(residual)
        } else {
            f64::NEG_INFINITY
        };
        log_sum_exp(los, nlos)
    }
    pub fn likelihood(&self, residual: f64, nlos_probability: f64) -> f64 {
        self.log_likelihood(residual, nlos_probability).exp()
    }
}

/// Range expected between a particle and a peer sample.
///
/// With `model_delay` the delays are fractions of the measured range, so each side adds
/// `delay * measurement` to the geometric distance.
pub fn predicted_range(
    position: &Vector3<f64>,
    delay: f64,
    peer_position: &Vector3<f64>,
    peer_delay: f64,
    measurement: f64,
    model_delay: bool,
) -> f64 {
    let distance = (position - peer_position).norm();
    if model_delay {
        distance + (delay + peer_delay) * measurement
    } else {
        distance
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn sensor_is_unbiased_with_configured_noise() {
        let sensor = RangeSensor::default();
        let a = StateVector::new(Vector3::new(0.0, 0.0, 0.0), 0.3);
        let b = StateVector::new(Vector3::new(3.0, 4.0, 12.0), 0.2);
        let mut rng = StdRng::seed_from_u64(1);
        let samples: Vec<f64> = (0..20_000).map(|_| sensor.measure(&a, &b, &mut rng)).collect();
        let mean = samples.iter().sum::<f64>() / samples.len() as f64;
        let var = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / samples.len() as f64;
        // Delays are ignored unless asymmetry is switched on.
        assert_approx_eq!(mean, 13.0, 0.005);
        assert_approx_eq!(var.sqrt(), 0.1, 0.005);
    }

    #[test]
    fn sensor_adds_delay_asymmetry_when_enabled() {
        let sensor = RangeSensor {
            noise_std: 0.0,
            model_delay_asymmetry: true,
        };
        let a = StateVector::new(Vector3::zeros(), 0.1);
        let b = StateVector::new(Vector3::new(10.0, 0.0, 0.0), 0.05);
        let mut rng = StdRng::seed_from_u64(2);
        assert_approx_eq!(sensor.measure(&a, &b, &mut rng), 11.5, 1e-12);
    }

    #[test]
    fn pure_line_of_sight_matches_gaussian() {
        let lik = RangeLikelihood::new(0.2, NlosModel::default());
        for r in [-0.5, 0.0, 0.13, 1.0] {
            assert_approx_eq!(lik.log_likelihood(r, 0.0), gaussian_log_density(r, 0.2), 1e-12);
        }
        let peak = 1.0 / (0.2 * (2.0 * PI).sqrt());
        assert_approx_eq!(lik.likelihood(0.0, 0.0), peak, 1e-12);
    }

    #[test]
    fn heavy_tail_keeps_outliers_alive() {
        let lik = RangeLikelihood::new(0.1, NlosModel::Cauchy { scale: 1.0 });
        assert_eq!(lik.likelihood(50.0, 0.0), 0.0);
        let with_nlos = lik.log_likelihood(50.0, 0.2);
        assert!(with_nlos.is_finite());
        assert!(with_nlos < lik.log_likelihood(0.0, 0.2));
    }

    #[test]
    fn uniform_nlos_density_is_flat_inside_support() {
        let model = NlosModel::Uniform {
            min_bias: 0.0,
            max_bias: 20.0,
        };
        assert_approx_eq!(model.log_density(3.0).exp(), 0.05, 1e-12);
        assert_eq!(model.log_density(-1.0), f64::NEG_INFINITY);
        assert!(model.is_valid());
        assert!(!NlosModel::Cauchy { scale: 0.0 }.is_valid());
    }

    #[test]
    fn mixture_integrates_to_one() {
        let lik = RangeLikelihood::new(0.3, NlosModel::Uniform {
            min_bias: -5.0,
            max_bias: 5.0,
        });
        let step = 1e-3;
        let total: f64 = (-6000..6000)
            .map(|i| lik.likelihood(i as f64 * step, 0.3) * step)
            .sum();
        assert_approx_eq!(total, 1.0, 1e-3);
    }

    #[test]
    fn predicted_range_delay_terms() {
        let p = Vector3::new(1.0, 0.0, 0.0);
        let q = Vector3::new(4.0, 4.0, 0.0);
        assert_approx_eq!(predicted_range(&p, 0.1, &q, 0.2, 10.0, false), 5.0, 1e-12);
        assert_approx_eq!(predicted_range(&p, 0.1, &q, 0.2, 10.0, true), 8.0, 1e-12);
    }
}
