//! Differential-privacy noise for fedgeo: scalar Laplace noise used to
//! perturb grid occupancy counts, and planar (geo-indistinguishable)
//! mechanisms used to move a query center before it leaves the coordinator.
//!
//! # Quickstart
//! ```
//! use fedgeo_core::Point;
//! use fedgeo_dp::{bounded_radius, BoundedSearch, NoiseSampler};
//!
//! let mut sampler = NoiseSampler::from_seed([1u8; 32]);
//! let noise = sampler.integer_laplace(1.0, 0.5).unwrap();
//! let moved = sampler.planar_laplace(Point::new(0.0, 0.0), 0.1).unwrap();
//! let bound = bounded_radius(1.0, 0.01, BoundedSearch::default()).unwrap();
//! assert!(bound.radius > 0.0);
//! # let _ = (noise, moved);
//! ```

mod lambert;
mod mechanisms;

pub use lambert::lambert_w_minus1;
pub use mechanisms::{bounded_radius, sample_radius, BoundedRadius, BoundedSearch, NoiseSampler};

use blake3::Hasher;
use rand::{rngs::StdRng, RngCore, SeedableRng};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DpError {
    #[error("epsilon must be a finite value > 0 (got {0})")]
    InvalidEpsilon(f64),
    #[error("delta must be a finite value > 0 (got {0})")]
    InvalidDelta(f64),
    #[error("sensitivity must be a finite value > 0 (got {0})")]
    InvalidSensitivity(f64),
    #[error("probability must lie strictly within (0,1) (got {0})")]
    InvalidProbability(f64),
    #[error("laplace scale {0} cannot parameterise an exponential draw")]
    InvalidScale(f64),
    #[error("escape-mass search step must lie within (0,1) (got {0})")]
    InvalidSearchStep(f64),
    #[error(
        "bounded planar search for epsilon={epsilon}, delta={delta} did not converge within {iterations} iterations"
    )]
    ConvergenceFailure {
        epsilon: f64,
        delta: f64,
        iterations: u32,
    },
}

/// 32 fresh bytes from the operating system generator.
pub fn random_seed() -> [u8; 32] {
    let mut seed = [0u8; 32];
    StdRng::from_entropy().fill_bytes(&mut seed);
    seed
}

/// Stable seed derived from `label` with BLAKE3.
pub fn seed_from_label(label: impl AsRef<[u8]>) -> [u8; 32] {
    let mut hasher = Hasher::new();
    hasher.update(label.as_ref());
    *hasher.finalize().as_bytes()
}
