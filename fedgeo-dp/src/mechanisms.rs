use std::f64::consts::{E, PI, TAU};

use fedgeo_core::Point;
use rand::{distributions::Open01, Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rand_distr::{Distribution, Exp};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{lambert::lambert_w_minus1, random_seed, seed_from_label, DpError};

/// Parameters of the escape-mass search used by the bounded planar mechanism.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct BoundedSearch {
    #[serde(default = "default_step")]
    pub step: f64,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
}

fn default_step() -> f64 {
    1e-4
}

fn default_max_iterations() -> u32 {
    10_000
}

impl Default for BoundedSearch {
    fn default() -> Self {
        Self {
            step: default_step(),
            max_iterations: default_max_iterations(),
        }
    }
}

/// Outcome of the escape-mass search: the truncation radius and the
/// probability mass `Δ` redistributed inside it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundedRadius {
    pub radius: f64,
    pub escape_mass: f64,
    pub iterations: u32,
}

fn check_epsilon(epsilon: f64) -> Result<(), DpError> {
    if epsilon.is_finite() && epsilon > 0.0 {
        Ok(())
    } else {
        Err(DpError::InvalidEpsilon(epsilon))
    }
}

fn check_sensitivity(sensitivity: f64) -> Result<(), DpError> {
    if sensitivity.is_finite() && sensitivity > 0.0 {
        Ok(())
    } else {
        Err(DpError::InvalidSensitivity(sensitivity))
    }
}

/// Radius whose planar-Laplace CDF equals `p`:
/// `r = -(W₋₁((p-1)/e) + 1) / epsilon`.
pub fn sample_radius(epsilon: f64, p: f64) -> Result<f64, DpError> {
    check_epsilon(epsilon)?;
    if !(p > 0.0 && p < 1.0) {
        return Err(DpError::InvalidProbability(p));
    }
    let w = lambert_w_minus1((p - 1.0) / E).ok_or(DpError::InvalidProbability(p))?;
    Ok((-(w + 1.0) / epsilon).max(0.0))
}

/// Steps the escape mass `Δ` upward until `Δ ≥ delta·π·R(1-Δ)²`.
pub fn bounded_radius(
    epsilon: f64,
    delta: f64,
    search: BoundedSearch,
) -> Result<BoundedRadius, DpError> {
    check_epsilon(epsilon)?;
    if !(delta.is_finite() && delta > 0.0) {
        return Err(DpError::InvalidDelta(delta));
    }
    if !(search.step > 0.0 && search.step < 1.0) {
        return Err(DpError::InvalidSearchStep(search.step));
    }
    for iteration in 1..=search.max_iterations {
        let escape_mass = search.step * f64::from(iteration);
        if escape_mass >= 1.0 {
            break;
        }
        let radius = sample_radius(epsilon, 1.0 - escape_mass)?;
        if escape_mass >= delta * PI * radius * radius {
            debug!(epsilon, delta, escape_mass, radius, iteration, "bounded radius found");
            return Ok(BoundedRadius {
                radius,
                escape_mass,
                iterations: iteration,
            });
        }
    }
    Err(DpError::ConvergenceFailure {
        epsilon,
        delta,
        iterations: search.max_iterations,
    })
}

/// Per-component noise source. Each silo and each coordinator query owns
/// its own sampler; nothing here is shared across threads.
pub struct NoiseSampler {
    rng: ChaCha20Rng,
}

impl NoiseSampler {
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            rng: ChaCha20Rng::from_seed(seed),
        }
    }

    pub fn from_entropy() -> Self {
        Self::from_seed(random_seed())
    }

    /// Deterministic sampler keyed by an arbitrary label.
    pub fn derive(label: impl AsRef<[u8]>) -> Self {
        Self::from_seed(seed_from_label(label))
    }

    pub fn rng_mut(&mut self) -> &mut ChaCha20Rng {
        &mut self.rng
    }

    /// Laplace(0, sensitivity/epsilon) as the difference of two exponential
    /// draws with rate `epsilon/sensitivity`.
    pub fn laplace(&mut self, sensitivity: f64, epsilon: f64) -> Result<f64, DpError> {
        check_sensitivity(sensitivity)?;
        check_epsilon(epsilon)?;
        let scale = sensitivity / epsilon;
        let exp = Exp::new(1.0 / scale).map_err(|_| DpError::InvalidScale(scale))?;
        Ok(exp.sample(&mut self.rng) - exp.sample(&mut self.rng))
    }

    pub fn integer_laplace(&mut self, sensitivity: f64, epsilon: f64) -> Result<i64, DpError> {
        let noise = self.laplace(sensitivity, epsilon)?.floor();
        // saturating float-to-int cast keeps absurd scales representable
        Ok(noise as i64)
    }

    pub fn planar_laplace(&mut self, center: Point, epsilon: f64) -> Result<Point, DpError> {
        check_epsilon(epsilon)?;
        let theta = self.rng.gen_range(0.0..TAU);
        let p: f64 = self.rng.sample(Open01);
        let r = sample_radius(epsilon, p)?;
        Ok(center.offset(r * theta.cos(), r * theta.sin()))
    }

    /// Planar Laplace truncated at `bound.radius`; the escaped mass is
    /// spread uniformly over the disc of that radius.
    pub fn bounded_planar_laplace(
        &mut self,
        center: Point,
        epsilon: f64,
        bound: &BoundedRadius,
    ) -> Result<Point, DpError> {
        check_epsilon(epsilon)?;
        let theta = self.rng.gen_range(0.0..TAU);
        let p: f64 = self.rng.sample(Open01);
        let r = if p > 1.0 - bound.escape_mass {
            let area: f64 = self.rng.gen_range(0.0..=bound.radius * bound.radius);
            area.sqrt()
        } else {
            sample_radius(epsilon, p)?.min(bound.radius)
        };
        Ok(center.offset(r * theta.cos(), r * theta.sin()))
    }

    pub fn bounded_planar_laplace_with_search(
        &mut self,
        center: Point,
        epsilon: f64,
        delta: f64,
        search: BoundedSearch,
    ) -> Result<Point, DpError> {
        let bound = bounded_radius(epsilon, delta, search)?;
        self.bounded_planar_laplace(center, epsilon, &bound)
    }

    /// Independent per-axis Laplace noise, each axis spending half of
    /// `epsilon`.
    pub fn twice_laplace(
        &mut self,
        center: Point,
        sensitivity_x: f64,
        sensitivity_y: f64,
        epsilon: f64,
    ) -> Result<Point, DpError> {
        check_epsilon(epsilon)?;
        let dx = self.laplace(sensitivity_x, epsilon / 2.0)?;
        let dy = self.laplace(sensitivity_y, epsilon / 2.0)?;
        Ok(center.offset(dx, dy))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fedgeo_core::distance;

    fn sampler() -> NoiseSampler {
        NoiseSampler::from_seed([7u8; 32])
    }

    #[test]
    fn laplace_rejects_bad_parameters() {
        let mut sampler = sampler();
        assert!(matches!(
            sampler.laplace(1.0, 0.0),
            Err(DpError::InvalidEpsilon(_))
        ));
        assert!(matches!(
            sampler.laplace(1.0, -2.0),
            Err(DpError::InvalidEpsilon(_))
        ));
        assert!(matches!(
            sampler.laplace(0.0, 1.0),
            Err(DpError::InvalidSensitivity(_))
        ));
    }

    #[test]
    fn integer_laplace_is_floor_of_continuous_draw() {
        let mut a = sampler();
        let mut b = sampler();
        for _ in 0..1_000 {
            let continuous = a.laplace(1.0, 0.5).unwrap();
            let discrete = b.integer_laplace(1.0, 0.5).unwrap();
            assert_eq!(discrete, continuous.floor() as i64);
        }
    }

    #[test]
    fn sample_radius_inverts_planar_cdf() {
        for epsilon in [0.01, 0.5, 2.0] {
            for p in [1e-6, 0.1, 0.5, 0.9, 0.999_999] {
                let r = sample_radius(epsilon, p).unwrap();
                let cdf = 1.0 - (1.0 + epsilon * r) * (-epsilon * r).exp();
                assert!((cdf - p).abs() < 1e-9, "eps={epsilon} p={p} cdf={cdf}");
            }
        }
    }

    #[test]
    fn sample_radius_domain() {
        assert!(matches!(
            sample_radius(1.0, 0.0),
            Err(DpError::InvalidProbability(_))
        ));
        assert!(matches!(
            sample_radius(1.0, 1.0),
            Err(DpError::InvalidProbability(_))
        ));
        assert!(matches!(
            sample_radius(0.0, 0.5),
            Err(DpError::InvalidEpsilon(_))
        ));
    }

    #[test]
    fn bounded_search_converges_for_moderate_delta() {
        let bound = bounded_radius(1.0, 0.01, BoundedSearch::default()).unwrap();
        assert!(bound.escape_mass > 0.0 && bound.escape_mass < 1.0);
        assert!(bound.escape_mass >= 0.01 * PI * bound.radius * bound.radius);
    }

    #[test]
    fn bounded_search_reports_convergence_failure() {
        let search = BoundedSearch {
            step: 1e-6,
            max_iterations: 10,
        };
        let err = bounded_radius(0.01, 0.5, search).unwrap_err();
        assert!(matches!(err, DpError::ConvergenceFailure { iterations: 10, .. }));
    }

    #[test]
    fn bounded_perturbation_never_exceeds_radius() {
        let mut sampler = sampler();
        let bound = bounded_radius(1.0, 0.01, BoundedSearch::default()).unwrap();
        let origin = Point::new(3.0, -4.0);
        for _ in 0..5_000 {
            let moved = sampler.bounded_planar_laplace(origin, 1.0, &bound).unwrap();
            assert!(distance(origin, moved) <= bound.radius * (1.0 + 1e-12));
        }
    }

    #[test]
    fn same_seed_same_stream() {
        let mut a = NoiseSampler::derive("silo-3");
        let mut b = NoiseSampler::derive("silo-3");
        let p = Point::new(1.0, 1.0);
        assert_eq!(
            a.planar_laplace(p, 0.2).unwrap(),
            b.planar_laplace(p, 0.2).unwrap()
        );
    }
}
